//! Sense data and command status
//!
//! Every command outcome other than GOOD is reported as a
//! [`SenseInfo`] (sense key, additional sense code and qualifier).
//! The unit keeps the last condition in its [`SenseBuffer`] until the
//! initiator fetches it with REQUEST SENSE.

use anyhow::Error;
use endian_trait::Endian;

use proxmox_io::WriteExt;

// SAM STAT
pub const SAM_STAT_GOOD: u8 = 0x00;
pub const SAM_STAT_CHECK_CONDITION: u8 = 0x02;
pub const SAM_STAT_BUSY: u8 = 0x08;
pub const SAM_STAT_RESERVATION_CONFLICT: u8 = 0x18;

//  SENSE KEYS
pub const SENSE_KEY_NO_SENSE: u8 = 0x00;
pub const SENSE_KEY_RECOVERED_ERROR: u8 = 0x01;
pub const SENSE_KEY_NOT_READY: u8 = 0x02;
pub const SENSE_KEY_MEDIUM_ERROR: u8 = 0x03;
pub const SENSE_KEY_HARDWARE_ERROR: u8 = 0x04;
pub const SENSE_KEY_ILLEGAL_REQUEST: u8 = 0x05;
pub const SENSE_KEY_UNIT_ATTENTION: u8 = 0x06;
pub const SENSE_KEY_DATA_PROTECT: u8 = 0x07;
pub const SENSE_KEY_BLANK_CHECK: u8 = 0x08;
pub const SENSE_KEY_COPY_ABORTED: u8 = 0x0a;
pub const SENSE_KEY_ABORTED_COMMAND: u8 = 0x0b;
pub const SENSE_KEY_VOLUME_OVERFLOW: u8 = 0x0d;
pub const SENSE_KEY_MISCOMPARE: u8 = 0x0e;

/// Sense Key Descriptions
pub const SENSE_KEY_DESCRIPTIONS: [&str; 16] = [
    "No Sense",
    "Recovered Error",
    "Not Ready",
    "Medium Error",
    "Hardware Error",
    "Illegal Request",
    "Unit Attention",
    "Data Protect",
    "Blank Check",
    "Vendor specific",
    "Copy Aborted",
    "Aborted Command",
    "Equal",
    "Volume Overflow",
    "Miscompare",
    "Completed",
];

// stream command bits (byte 2 of fixed format sense)
pub const SENSE_FILEMARK: u8 = 0x80;
pub const SENSE_EOM: u8 = 0x40;
pub const SENSE_ILI: u8 = 0x20;

const ASC_ASCQ_DESCRIPTIONS: &[(u8, u8, &str)] = &[
    (0x00, 0x00, "No additional sense information"),
    (0x00, 0x01, "Filemark detected"),
    (0x00, 0x02, "End-of-partition/medium detected"),
    (0x00, 0x04, "Beginning-of-partition/medium detected"),
    (0x00, 0x05, "End-of-data detected"),
    (0x00, 0x07, "Programmable early warning detected"),
    (0x04, 0x01, "Logical unit is in process of becoming ready"),
    (0x04, 0x03, "Logical unit not ready, manual intervention required"),
    (0x08, 0x00, "Logical unit communication failure"),
    (0x0c, 0x00, "Write error"),
    (0x11, 0x00, "Unrecovered read error"),
    (0x1a, 0x00, "Parameter list length error"),
    (0x20, 0x00, "Invalid command operation code"),
    (0x21, 0x01, "Invalid element address"),
    (0x24, 0x00, "Invalid field in cdb"),
    (0x25, 0x00, "Logical unit not supported"),
    (0x26, 0x00, "Invalid field in parameter list"),
    (0x27, 0x00, "Write protected"),
    (0x28, 0x00, "Not ready to ready change, medium may have changed"),
    (0x28, 0x01, "Import or export element accessed"),
    (0x29, 0x00, "Power on, reset, or bus device reset occurred"),
    (0x2a, 0x01, "Mode parameters changed"),
    (0x30, 0x00, "Incompatible medium installed"),
    (0x30, 0x03, "Cleaning cartridge installed"),
    (0x30, 0x07, "Cleaning failure"),
    (0x30, 0x0c, "WORM medium - overwrite attempted"),
    (0x31, 0x00, "Medium format corrupted"),
    (0x39, 0x00, "Saving parameters not supported"),
    (0x3a, 0x00, "Medium not present"),
    (0x3a, 0x02, "Medium not present - tray open"),
    (0x3b, 0x00, "Sequential positioning error"),
    (0x3b, 0x0d, "Medium destination element full"),
    (0x3b, 0x0e, "Medium source element empty"),
    (0x44, 0x00, "Internal target failure"),
    (0x53, 0x00, "Media load or eject failed"),
    (0x53, 0x02, "Medium removal prevented"),
    (0x55, 0x06, "Auxiliary memory out of space"),
    (0x74, 0x01, "Unable to decrypt data"),
    (0x74, 0x02, "Unencrypted data encountered while decrypting"),
    (0x74, 0x03, "Incorrect data encryption key"),
];

/// Get the string associated with ASC/ASCQ values
pub fn get_asc_ascq_string(asc: u8, ascq: u8) -> String {
    ASC_ASCQ_DESCRIPTIONS
        .iter()
        .find(|(a, q, _)| *a == asc && *q == ascq)
        .map(|(_, _, text)| String::from(*text))
        .unwrap_or_else(|| format!("ASC={:02x}x, ASCQ={:02x}x", asc, ascq))
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenseInfo {
    pub sense_key: u8,
    pub asc: u8,
    pub ascq: u8,
    /// FILEMARK, EOM and ILI bits
    pub stream: u8,
    /// Information field (residue or block count)
    pub information: Option<u32>,
    /// Sense key specific bytes (SKSV already set)
    pub key_specific: Option<[u8; 3]>,
}

impl std::fmt::Display for SenseInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sense_text = SENSE_KEY_DESCRIPTIONS
            .get(self.sense_key as usize)
            .map(|s| String::from(*s))
            .unwrap_or_else(|| format!("Invalid sense {:02X}", self.sense_key));

        if self.asc == 0 && self.ascq == 0 {
            write!(f, "{}", sense_text)
        } else {
            let additional_sense_text = get_asc_ascq_string(self.asc, self.ascq);
            write!(f, "{}, {}", sense_text, additional_sense_text)
        }
    }
}

impl SenseInfo {
    pub const fn new(sense_key: u8, asc: u8, ascq: u8) -> Self {
        Self {
            sense_key,
            asc,
            ascq,
            stream: 0,
            information: None,
            key_specific: None,
        }
    }

    const fn with_stream(sense_key: u8, asc: u8, ascq: u8, stream: u8) -> Self {
        Self {
            sense_key,
            asc,
            ascq,
            stream,
            information: None,
            key_specific: None,
        }
    }

    pub const NO_SENSE: Self = Self::new(SENSE_KEY_NO_SENSE, 0x00, 0x00);
    pub const FILEMARK_DETECTED: Self =
        Self::with_stream(SENSE_KEY_NO_SENSE, 0x00, 0x01, SENSE_FILEMARK);
    pub const END_OF_PARTITION: Self = Self::with_stream(SENSE_KEY_NO_SENSE, 0x00, 0x02, SENSE_EOM);
    pub const BEGINNING_OF_PARTITION: Self =
        Self::with_stream(SENSE_KEY_NO_SENSE, 0x00, 0x04, SENSE_EOM);
    pub const PROGRAMMABLE_EARLY_WARNING: Self = Self::new(SENSE_KEY_NO_SENSE, 0x00, 0x07);
    pub const END_OF_DATA: Self = Self::new(SENSE_KEY_BLANK_CHECK, 0x00, 0x05);
    pub const INCORRECT_LENGTH: Self = Self::with_stream(SENSE_KEY_NO_SENSE, 0x00, 0x00, SENSE_ILI);

    pub const BECOMING_READY: Self = Self::new(SENSE_KEY_NOT_READY, 0x04, 0x01);
    pub const MANUAL_INTERVENTION_REQUIRED: Self = Self::new(SENSE_KEY_NOT_READY, 0x04, 0x03);
    pub const MEDIUM_NOT_PRESENT: Self = Self::new(SENSE_KEY_NOT_READY, 0x3a, 0x00);
    pub const MEDIUM_NOT_PRESENT_TRAY_OPEN: Self = Self::new(SENSE_KEY_NOT_READY, 0x3a, 0x02);
    pub const CLEANING_CARTRIDGE_INSTALLED: Self = Self::new(SENSE_KEY_NOT_READY, 0x30, 0x03);

    pub const WRITE_ERROR: Self = Self::new(SENSE_KEY_MEDIUM_ERROR, 0x0c, 0x00);
    pub const UNRECOVERED_READ_ERROR: Self = Self::new(SENSE_KEY_MEDIUM_ERROR, 0x11, 0x00);
    pub const INCOMPATIBLE_MEDIUM: Self = Self::new(SENSE_KEY_MEDIUM_ERROR, 0x30, 0x00);
    pub const CLEANING_FAILURE: Self = Self::new(SENSE_KEY_MEDIUM_ERROR, 0x30, 0x07);
    pub const MEDIUM_FORMAT_CORRUPTED: Self = Self::new(SENSE_KEY_MEDIUM_ERROR, 0x31, 0x00);
    pub const SEQUENTIAL_POSITIONING_ERROR: Self = Self::new(SENSE_KEY_MEDIUM_ERROR, 0x3b, 0x00);

    pub const COMMUNICATION_FAILURE: Self = Self::new(SENSE_KEY_HARDWARE_ERROR, 0x08, 0x00);
    pub const INTERNAL_TARGET_FAILURE: Self = Self::new(SENSE_KEY_HARDWARE_ERROR, 0x44, 0x00);
    pub const MEDIA_LOAD_EJECT_FAILED: Self = Self::new(SENSE_KEY_HARDWARE_ERROR, 0x53, 0x00);

    pub const PARAMETER_LIST_LENGTH_ERROR: Self = Self::new(SENSE_KEY_ILLEGAL_REQUEST, 0x1a, 0x00);
    pub const INVALID_OPCODE: Self = Self::new(SENSE_KEY_ILLEGAL_REQUEST, 0x20, 0x00);
    pub const INVALID_ELEMENT_ADDRESS: Self = Self::new(SENSE_KEY_ILLEGAL_REQUEST, 0x21, 0x01);
    pub const INVALID_FIELD_IN_CDB: Self = Self::new(SENSE_KEY_ILLEGAL_REQUEST, 0x24, 0x00);
    pub const LOGICAL_UNIT_NOT_SUPPORTED: Self = Self::new(SENSE_KEY_ILLEGAL_REQUEST, 0x25, 0x00);
    pub const INVALID_FIELD_IN_PARAMETER_LIST: Self =
        Self::new(SENSE_KEY_ILLEGAL_REQUEST, 0x26, 0x00);
    pub const SAVING_PARAMETERS_UNSUPPORTED: Self =
        Self::new(SENSE_KEY_ILLEGAL_REQUEST, 0x39, 0x00);
    pub const MEDIUM_DESTINATION_FULL: Self = Self::new(SENSE_KEY_ILLEGAL_REQUEST, 0x3b, 0x0d);
    pub const MEDIUM_SOURCE_EMPTY: Self = Self::new(SENSE_KEY_ILLEGAL_REQUEST, 0x3b, 0x0e);
    pub const MEDIUM_REMOVAL_PREVENTED: Self = Self::new(SENSE_KEY_ILLEGAL_REQUEST, 0x53, 0x02);

    pub const NOT_READY_TO_READY_CHANGE: Self = Self::new(SENSE_KEY_UNIT_ATTENTION, 0x28, 0x00);
    pub const IMPORT_EXPORT_ELEMENT_ACCESSED: Self =
        Self::new(SENSE_KEY_UNIT_ATTENTION, 0x28, 0x01);
    pub const POWER_ON_RESET: Self = Self::new(SENSE_KEY_UNIT_ATTENTION, 0x29, 0x00);
    pub const MODE_PARAMETERS_CHANGED: Self = Self::new(SENSE_KEY_UNIT_ATTENTION, 0x2a, 0x01);

    pub const WRITE_PROTECTED: Self = Self::new(SENSE_KEY_DATA_PROTECT, 0x27, 0x00);
    pub const WORM_OVERWRITE_ATTEMPTED: Self = Self::new(SENSE_KEY_DATA_PROTECT, 0x30, 0x0c);
    pub const AUXILIARY_MEMORY_OUT_OF_SPACE: Self = Self::new(SENSE_KEY_DATA_PROTECT, 0x55, 0x06);
    pub const UNABLE_TO_DECRYPT: Self = Self::new(SENSE_KEY_DATA_PROTECT, 0x74, 0x01);
    pub const UNENCRYPTED_DATA: Self = Self::new(SENSE_KEY_DATA_PROTECT, 0x74, 0x02);
    pub const INCORRECT_KEY: Self = Self::new(SENSE_KEY_DATA_PROTECT, 0x74, 0x03);

    pub const VOLUME_OVERFLOW: Self = Self::with_stream(SENSE_KEY_VOLUME_OVERFLOW, 0x00, 0x02, SENSE_EOM);

    /// Set the information field (residue, or number of blocks not processed)
    pub fn information(mut self, value: u32) -> Self {
        self.information = Some(value);
        self
    }

    pub fn filemark(mut self) -> Self {
        self.stream |= SENSE_FILEMARK;
        self
    }

    pub fn eom(mut self) -> Self {
        self.stream |= SENSE_EOM;
        self
    }

    pub fn ili(mut self) -> Self {
        self.stream |= SENSE_ILI;
        self
    }

    /// Point at the offending CDB byte (and optionally bit)
    pub fn cdb_field(self, byte: u16, bit: Option<u8>) -> Self {
        self.field_pointer(true, byte, bit)
    }

    /// Point at the offending parameter list byte (and optionally bit)
    pub fn parameter_field(self, byte: u16, bit: Option<u8>) -> Self {
        self.field_pointer(false, byte, bit)
    }

    fn field_pointer(mut self, in_cdb: bool, byte: u16, bit: Option<u8>) -> Self {
        let mut flags = 0x80; // SKSV
        if in_cdb {
            flags |= 0x40;
        }
        if let Some(bit) = bit {
            flags |= 0x08 | (bit & 0x07);
        }
        let [hi, lo] = byte.to_be_bytes();
        self.key_specific = Some([flags, hi, lo]);
        self
    }

    /// Fixed format sense data (response code 0x70, 18 bytes)
    pub fn to_fixed(&self) -> Result<Vec<u8>, Error> {
        let mut response_code = 0x70;
        let information = match self.information {
            Some(value) => {
                response_code |= 0x80; // VALID
                value.to_be_bytes()
            }
            None => [0u8; 4],
        };

        let sense = RequestSenseFixed {
            response_code,
            obsolete: 0,
            flags2: self.stream | (self.sense_key & 0x0f),
            information,
            additional_sense_len: 10,
            command_specific_information: [0u8; 4],
            additional_sense_code: self.asc,
            additional_sense_code_qualifier: self.ascq,
            field_replaceable_unit_code: 0,
            sense_key_specific: self.key_specific.unwrap_or([0u8; 3]),
        };

        let mut data = Vec::with_capacity(18);
        unsafe { data.write_be_value(sense)? };
        Ok(data)
    }

    /// Descriptor format sense data (response code 0x72)
    pub fn to_descriptor(&self) -> Result<Vec<u8>, Error> {
        let mut descriptors = Vec::new();

        if let Some(value) = self.information {
            descriptors.extend([0x00, 0x0a, 0x80, 0x00]);
            descriptors.extend((value as u64).to_be_bytes());
        }
        if let Some(sks) = self.key_specific {
            descriptors.extend([0x02, 0x06, 0x00, 0x00]);
            descriptors.extend(sks);
            descriptors.push(0);
        }
        if self.stream != 0 {
            descriptors.extend([0x04, 0x02, 0x00, self.stream]);
        }

        let head = RequestSenseDescriptor {
            response_code: 0x72,
            sense_key: self.sense_key & 0x0f,
            additional_sense_code: self.asc,
            additional_sense_code_qualifier: self.ascq,
            reserved: [0u8; 3],
            additional_sense_len: descriptors.len() as u8,
        };

        let mut data = Vec::with_capacity(8 + descriptors.len());
        unsafe { data.write_be_value(head)? };
        data.extend(descriptors);
        Ok(data)
    }

    pub fn encode(&self, descriptor_format: bool) -> Result<Vec<u8>, Error> {
        if descriptor_format {
            self.to_descriptor()
        } else {
            self.to_fixed()
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ScsiError {
    #[error("{0}")]
    Error(#[from] Error),
    #[error("{0}")]
    Sense(#[from] SenseInfo),
    #[error("reservation conflict")]
    ReservationConflict,
}

impl From<std::io::Error> for ScsiError {
    fn from(error: std::io::Error) -> Self {
        Self::Error(error.into())
    }
}

#[repr(C, packed)]
#[derive(Endian, Debug)]
pub struct RequestSenseFixed {
    pub response_code: u8,
    obsolete: u8,
    pub flags2: u8,
    pub information: [u8; 4],
    pub additional_sense_len: u8,
    pub command_specific_information: [u8; 4],
    pub additional_sense_code: u8,
    pub additional_sense_code_qualifier: u8,
    pub field_replaceable_unit_code: u8,
    pub sense_key_specific: [u8; 3],
}

#[repr(C, packed)]
#[derive(Endian, Debug)]
struct RequestSenseDescriptor {
    response_code: u8,
    sense_key: u8,
    additional_sense_code: u8,
    additional_sense_code_qualifier: u8,
    reserved: [u8; 3],
    additional_sense_len: u8,
}

/// Per unit sense state
///
/// Holds the condition of the last failed command until it is
/// consumed by REQUEST SENSE.
pub struct SenseBuffer {
    pending: Option<SenseInfo>,
    descriptor_format: bool,
}

impl SenseBuffer {
    pub fn new(descriptor_format: bool) -> Self {
        Self {
            pending: None,
            descriptor_format,
        }
    }

    pub fn descriptor_format(&self) -> bool {
        self.descriptor_format
    }

    /// Record the condition and return CHECK CONDITION
    pub fn make_sense(&mut self, sense: SenseInfo) -> u8 {
        self.pending = Some(sense);
        SAM_STAT_CHECK_CONDITION
    }

    pub fn pending(&self) -> Option<&SenseInfo> {
        self.pending.as_ref()
    }

    /// Encoded pending sense in the configured format (autosense)
    pub fn encode_pending(&self) -> Result<Vec<u8>, Error> {
        match self.pending {
            Some(ref sense) => sense.encode(self.descriptor_format),
            None => Ok(Vec::new()),
        }
    }

    /// Consume the pending sense, leaving NO SENSE behind
    pub fn request_sense(&mut self, descriptor_format: bool) -> Result<Vec<u8>, Error> {
        let sense = self.pending.take().unwrap_or(SenseInfo::NO_SENSE);
        sense.encode(descriptor_format || self.descriptor_format)
    }

    pub fn clear(&mut self) {
        self.pending = None;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fixed_format() -> Result<(), Error> {
        let sense = SenseInfo::INVALID_FIELD_IN_CDB.cdb_field(2, Some(7));
        let data = sense.to_fixed()?;
        assert_eq!(data.len(), 18);
        assert_eq!(data[0], 0x70);
        assert_eq!(data[2], SENSE_KEY_ILLEGAL_REQUEST);
        assert_eq!(data[7], 10);
        assert_eq!((data[12], data[13]), (0x24, 0x00));
        assert_eq!(&data[15..18], &[0xcf, 0x00, 0x02]);
        Ok(())
    }

    #[test]
    fn fixed_format_information() -> Result<(), Error> {
        let sense = SenseInfo::FILEMARK_DETECTED.information(0x1234);
        let data = sense.to_fixed()?;
        assert_eq!(data[0], 0xf0);
        assert_eq!(data[2], SENSE_FILEMARK);
        assert_eq!(&data[3..7], &[0, 0, 0x12, 0x34]);
        Ok(())
    }

    #[test]
    fn descriptor_format() -> Result<(), Error> {
        let sense = SenseInfo::INCORRECT_LENGTH.information(16);
        let data = sense.to_descriptor()?;
        assert_eq!(data[0], 0x72);
        assert_eq!(data[1], SENSE_KEY_NO_SENSE);
        assert_eq!(data[7] as usize, data.len() - 8);
        // information descriptor
        assert_eq!(&data[8..12], &[0x00, 0x0a, 0x80, 0x00]);
        assert_eq!(&data[12..20], &16u64.to_be_bytes());
        // stream commands descriptor
        assert_eq!(&data[20..24], &[0x04, 0x02, 0x00, SENSE_ILI]);
        Ok(())
    }

    #[test]
    fn request_sense_consumes() -> Result<(), Error> {
        let mut buffer = SenseBuffer::new(false);
        assert_eq!(
            buffer.make_sense(SenseInfo::MEDIUM_NOT_PRESENT),
            SAM_STAT_CHECK_CONDITION
        );
        let data = buffer.request_sense(false)?;
        assert_eq!(data[2], SENSE_KEY_NOT_READY);
        assert_eq!(data[12], 0x3a);

        let data = buffer.request_sense(false)?;
        assert_eq!(data[2], SENSE_KEY_NO_SENSE);
        assert_eq!(data[12], 0);
        Ok(())
    }

    #[test]
    fn display() {
        let text = SenseInfo::WRITE_PROTECTED.to_string();
        assert_eq!(text, "Data Protect, Write protected");
    }
}
