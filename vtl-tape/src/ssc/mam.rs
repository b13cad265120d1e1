//! Medium auxiliary memory (MAM)
//!
//! The cartridge memory is stored as payload of the beginning-of-tape
//! block. READ ATTRIBUTE reports it using the attribute ids from the
//! LTO SCSI reference (IBM and HP use the same set).

use anyhow::{bail, Error};
use endian_trait::Endian;

use proxmox_io::{ReadExt, WriteExt};

use super::TapeAlertFlags;

pub const MAM_MAGIC: u32 = u32::from_le_bytes(*b"VMAM");
pub const MAM_VERSION: u32 = 1;

/// Cartridge write protect tab set
pub const MAM_FLAG_WRITE_PROTECT: u8 = 0x01;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MediumKind {
    Data,
    Cleaning,
    Worm,
}

impl MediumKind {
    fn to_raw(self) -> u8 {
        match self {
            MediumKind::Data => 0,
            MediumKind::Cleaning => 1,
            MediumKind::Worm => 2,
        }
    }

    fn from_raw(value: u8) -> Result<Self, Error> {
        Ok(match value {
            0 => MediumKind::Data,
            1 => MediumKind::Cleaning,
            2 => MediumKind::Worm,
            _ => bail!("unknown medium kind {}", value),
        })
    }

    /// MAM attribute 0408h encoding
    fn medium_type(self) -> u8 {
        match self {
            MediumKind::Data => 0x00,
            MediumKind::Cleaning => 0x01,
            MediumKind::Worm => 0x80,
        }
    }
}

#[repr(C, packed)]
#[derive(Endian, Debug, Copy, Clone)]
struct RawMam {
    magic: u32,
    version: u32,
    medium_kind: u8,
    density_code: u8,
    flags: u8,
    reserved: u8,
    max_capacity: u64,
    load_count: u64,
    bytes_written: u64,
    bytes_read: u64,
    last_bytes_written: u64,
    last_bytes_read: u64,
    tape_alert: u64,
    medium_length: u32,
    medium_width: u32,
    initialization_count: u16,
    manufacture_date: [u8; 8],
    medium_name: [u8; 16],
    barcode: [u8; 32],
    medium_serial: [u8; 32],
    medium_guid: [u8; 16],
}

/// Size of the MAM image inside the BOT block
pub const MAM_SIZE: usize = std::mem::size_of::<RawMam>();

/// Decoded cartridge memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediumAuxMemory {
    pub medium_kind: MediumKind,
    pub density_code: u8,
    pub write_protect: bool,
    /// Native capacity in bytes
    pub max_capacity: u64,
    pub load_count: u64,
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub last_bytes_written: u64,
    pub last_bytes_read: u64,
    pub tape_alert: TapeAlertFlags,
    /// Medium length in meters
    pub medium_length: u32,
    /// Medium width in 0.1 mm
    pub medium_width: u32,
    pub initialization_count: u16,
    /// YYYYMMDD
    pub manufacture_date: String,
    /// Name used for the media compatibility lookup (e.g. "LTO6 WORM")
    pub medium_name: String,
    pub barcode: String,
    pub medium_serial: String,
    pub medium_guid: [u8; 16],
}

fn ascii_field<const N: usize>(text: &str) -> [u8; N] {
    let mut field = [b' '; N];
    for (dst, src) in field.iter_mut().zip(text.bytes()) {
        *dst = src;
    }
    field
}

fn field_to_string(data: &[u8]) -> String {
    crate::scsi_ascii_to_string(data)
}

impl MediumAuxMemory {
    pub fn new(
        barcode: &str,
        medium_name: &str,
        medium_kind: MediumKind,
        density_code: u8,
        max_capacity: u64,
    ) -> Result<Self, Error> {
        let manufacture_date = proxmox_time::strftime_utc("%Y%m%d", proxmox_time::epoch_i64())?;
        let uuid = proxmox_uuid::Uuid::generate();

        Ok(Self {
            medium_kind,
            density_code,
            write_protect: false,
            max_capacity,
            load_count: 0,
            bytes_written: 0,
            bytes_read: 0,
            last_bytes_written: 0,
            last_bytes_read: 0,
            tape_alert: TapeAlertFlags::empty(),
            medium_length: 960,
            medium_width: 127,
            initialization_count: 0,
            manufacture_date,
            medium_name: medium_name.to_string(),
            barcode: barcode.to_string(),
            medium_serial: format!("{}_{}", barcode, &uuid.to_string()[..8]),
            medium_guid: *uuid.as_bytes(),
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let raw = RawMam {
            magic: MAM_MAGIC,
            version: MAM_VERSION,
            medium_kind: self.medium_kind.to_raw(),
            density_code: self.density_code,
            flags: if self.write_protect {
                MAM_FLAG_WRITE_PROTECT
            } else {
                0
            },
            reserved: 0,
            max_capacity: self.max_capacity,
            load_count: self.load_count,
            bytes_written: self.bytes_written,
            bytes_read: self.bytes_read,
            last_bytes_written: self.last_bytes_written,
            last_bytes_read: self.last_bytes_read,
            tape_alert: self.tape_alert.bits(),
            medium_length: self.medium_length,
            medium_width: self.medium_width,
            initialization_count: self.initialization_count,
            manufacture_date: ascii_field(&self.manufacture_date),
            medium_name: ascii_field(&self.medium_name),
            barcode: ascii_field(&self.barcode),
            medium_serial: ascii_field(&self.medium_serial),
            medium_guid: self.medium_guid,
        };

        let mut data = Vec::with_capacity(MAM_SIZE);
        unsafe { data.write_le_value(raw)? };
        Ok(data)
    }

    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        if data.len() < MAM_SIZE {
            bail!("medium auxiliary memory too short ({} bytes)", data.len());
        }
        let mut reader = data;
        let raw: RawMam = unsafe { reader.read_le_value()? };

        if raw.magic != MAM_MAGIC {
            bail!("medium auxiliary memory has wrong magic");
        }
        if raw.version != MAM_VERSION {
            let version = raw.version;
            bail!("unsupported medium auxiliary memory version {}", version);
        }

        Ok(Self {
            medium_kind: MediumKind::from_raw(raw.medium_kind)?,
            density_code: raw.density_code,
            write_protect: (raw.flags & MAM_FLAG_WRITE_PROTECT) != 0,
            max_capacity: raw.max_capacity,
            load_count: raw.load_count,
            bytes_written: raw.bytes_written,
            bytes_read: raw.bytes_read,
            last_bytes_written: raw.last_bytes_written,
            last_bytes_read: raw.last_bytes_read,
            tape_alert: TapeAlertFlags::from_bits_truncate(raw.tape_alert),
            medium_length: raw.medium_length,
            medium_width: raw.medium_width,
            initialization_count: raw.initialization_count,
            manufacture_date: field_to_string(&raw.manufacture_date),
            medium_name: field_to_string(&raw.medium_name),
            barcode: field_to_string(&raw.barcode),
            medium_serial: field_to_string(&raw.medium_serial),
            medium_guid: raw.medium_guid,
        })
    }
}

#[derive(Endian)]
#[repr(C, packed)]
struct MamAttributeHeader {
    id: u16,
    flags: u8,
    len: u16,
}

#[allow(clippy::upper_case_acronyms)]
#[derive(Copy, Clone)]
enum MamFormat {
    BINARY,
    ASCII,
    DEC,
}

impl MamFormat {
    fn flag(self) -> u8 {
        match self {
            MamFormat::BINARY | MamFormat::DEC => 0x00,
            MamFormat::ASCII => 0x01,
        }
    }
}

struct MamType {
    pub id: u16,
    pub len: u16,
    pub format: MamFormat,
}

impl MamType {
    const fn new(id: u16, len: u16, format: MamFormat) -> Self {
        MamType { id, len, format }
    }
    const fn bin(id: u16, len: u16) -> Self {
        Self::new(id, len, MamFormat::BINARY)
    }
    const fn ascii(id: u16, len: u16) -> Self {
        Self::new(id, len, MamFormat::ASCII)
    }
    const fn dec(id: u16, len: u16) -> Self {
        Self::new(id, len, MamFormat::DEC)
    }
}

// attributes we report, in id order; all are read-only
static MAM_ATTRIBUTES: &[MamType] = &[
    MamType::dec(0x00_00, 8),  // Remaining Capacity In Partition
    MamType::dec(0x00_01, 8),  // Maximum Capacity In Partition
    MamType::dec(0x00_02, 8),  // Tapealert Flags
    MamType::dec(0x00_03, 8),  // Load Count
    MamType::dec(0x00_04, 8),  // MAM Space Remaining
    MamType::ascii(0x00_05, 8), // Assigning Organization
    MamType::bin(0x00_06, 1),  // Formatted Density Code
    MamType::dec(0x00_07, 2),  // Initialization Count
    MamType::dec(0x02_20, 8),  // Total MBytes Written in Medium Life
    MamType::dec(0x02_21, 8),  // Total MBytes Read In Medium Life
    MamType::dec(0x02_22, 8),  // Total MBytes Written in Current Load
    MamType::dec(0x02_23, 8),  // Total MBytes Read in Current/Last Load
    MamType::ascii(0x04_00, 8), // Medium Manufacturer
    MamType::ascii(0x04_01, 32), // Medium Serial Number
    MamType::dec(0x04_02, 4),  // Medium Length
    MamType::dec(0x04_03, 4),  // Medium Width
    MamType::ascii(0x04_04, 8), // Assigning Organization
    MamType::bin(0x04_05, 1),  // Medium Density Code
    MamType::ascii(0x04_06, 8), // Medium Manufacture Date
    MamType::dec(0x04_07, 8),  // MAM Capacity
    MamType::bin(0x04_08, 1),  // Medium Type
    MamType::ascii(0x08_06, 32), // Barcode
    MamType::bin(0x08_20, 36), // Medium Globally Unique Identifier
];

const MIB: u64 = 1024 * 1024;

/// Values that are not stored in the cartridge memory
pub struct MamContext {
    /// Remaining native capacity in bytes
    pub remaining_capacity: u64,
    pub vendor: String,
}

fn attribute_value(id: u16, mam: &MediumAuxMemory, context: &MamContext) -> Vec<u8> {
    match id {
        0x00_00 => (context.remaining_capacity / MIB).to_be_bytes().to_vec(),
        0x00_01 => (mam.max_capacity / MIB).to_be_bytes().to_vec(),
        0x00_02 => mam.tape_alert.bits().to_be_bytes().to_vec(),
        0x00_03 => mam.load_count.to_be_bytes().to_vec(),
        0x00_04 => 0u64.to_be_bytes().to_vec(),
        0x00_05 | 0x04_04 => ascii_field::<8>("LTO-CVE").to_vec(),
        0x00_06 | 0x04_05 => vec![mam.density_code],
        0x00_07 => mam.initialization_count.to_be_bytes().to_vec(),
        0x02_20 => (mam.bytes_written / MIB).to_be_bytes().to_vec(),
        0x02_21 => (mam.bytes_read / MIB).to_be_bytes().to_vec(),
        0x02_22 => (mam.last_bytes_written / MIB).to_be_bytes().to_vec(),
        0x02_23 => (mam.last_bytes_read / MIB).to_be_bytes().to_vec(),
        0x04_00 => ascii_field::<8>(&context.vendor).to_vec(),
        0x04_01 => ascii_field::<32>(&mam.medium_serial).to_vec(),
        0x04_02 => mam.medium_length.to_be_bytes().to_vec(),
        0x04_03 => mam.medium_width.to_be_bytes().to_vec(),
        0x04_06 => ascii_field::<8>(&mam.manufacture_date).to_vec(),
        0x04_07 => (MAM_SIZE as u64).to_be_bytes().to_vec(),
        0x04_08 => vec![mam.medium_kind.medium_type()],
        0x08_06 => ascii_field::<32>(&mam.barcode).to_vec(),
        0x08_20 => {
            // 4 byte binary header, then the uuid padded to 32 bytes
            let mut value = vec![0u8; 36];
            value[3] = 0x20;
            value[4..20].copy_from_slice(&mam.medium_guid);
            value
        }
        _ => Vec::new(),
    }
}

/// READ ATTRIBUTE service actions
pub const READ_ATTRIBUTE_VALUES: u8 = 0x00;
pub const READ_ATTRIBUTE_LIST: u8 = 0x01;

/// Build the READ ATTRIBUTE response (without allocation length truncation)
pub fn read_attribute_response(
    service_action: u8,
    first_attribute: u16,
    mam: &MediumAuxMemory,
    context: &MamContext,
) -> Result<Vec<u8>, Error> {
    let mut body = Vec::new();

    match service_action {
        READ_ATTRIBUTE_VALUES => {
            for info in MAM_ATTRIBUTES.iter().filter(|info| info.id >= first_attribute) {
                let value = attribute_value(info.id, mam, context);
                let head = MamAttributeHeader {
                    id: info.id,
                    flags: 0x80 | info.format.flag(), // read only
                    len: info.len,
                };
                unsafe { body.write_be_value(head)? };
                body.extend(&value[..info.len as usize]);
            }
        }
        READ_ATTRIBUTE_LIST => {
            for info in MAM_ATTRIBUTES.iter().filter(|info| info.id >= first_attribute) {
                unsafe { body.write_be_value(info.id)? };
            }
        }
        _ => bail!("unsupported READ ATTRIBUTE service action {:02x}", service_action),
    }

    let mut data = Vec::with_capacity(body.len() + 4);
    unsafe { data.write_be_value(body.len() as u32)? };
    data.extend(body);
    Ok(data)
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use super::*;

    fn sample() -> Result<MediumAuxMemory, Error> {
        let mut mam = MediumAuxMemory::new(
            "E01001L8",
            "LTO8",
            MediumKind::Data,
            0x5e,
            12_000 * 1_000_000_000,
        )?;
        mam.bytes_written = 3 * MIB;
        mam.load_count = 7;
        Ok(mam)
    }

    #[test]
    fn encode_decode() -> Result<(), Error> {
        let mam = sample()?;
        let data = mam.encode()?;
        assert_eq!(data.len(), MAM_SIZE);
        assert_eq!(MediumAuxMemory::decode(&data)?, mam);

        let mut broken = data.clone();
        broken[0] ^= 0xff;
        assert!(MediumAuxMemory::decode(&broken).is_err());
        Ok(())
    }

    #[test]
    fn attribute_values() -> Result<(), Error> {
        let mam = sample()?;
        let context = MamContext {
            remaining_capacity: 5 * MIB,
            vendor: "IBM".to_string(),
        };
        let data = read_attribute_response(READ_ATTRIBUTE_VALUES, 0, &mam, &context)?;

        let mut reader = &data[..];
        let len: u32 = unsafe { reader.read_be_value()? };
        assert_eq!(len as usize, reader.len());

        let mut found = HashMap::new();
        while !reader.is_empty() {
            let head: MamAttributeHeader = unsafe { reader.read_be_value()? };
            let value = reader.read_exact_allocated(head.len as usize)?;
            let id = head.id;
            let info = MAM_ATTRIBUTES.iter().find(|info| info.id == id).unwrap();
            assert_eq!(info.len, head.len);
            found.insert(id, value);
        }
        assert_eq!(found.len(), MAM_ATTRIBUTES.len());
        assert_eq!(found[&0x0000], 5u64.to_be_bytes().to_vec());
        assert_eq!(found[&0x0003], 7u64.to_be_bytes().to_vec());
        assert_eq!(found[&0x0220], 3u64.to_be_bytes().to_vec());
        assert_eq!(&found[&0x0806][..8], b"E01001L8");
        assert_eq!(found[&0x0405], vec![0x5e]);
        Ok(())
    }

    #[test]
    fn attribute_list() -> Result<(), Error> {
        let mam = sample()?;
        let context = MamContext {
            remaining_capacity: 0,
            vendor: "HP".to_string(),
        };
        let data = read_attribute_response(READ_ATTRIBUTE_LIST, 0x0400, &mam, &context)?;
        assert_eq!(&data[4..6], &[0x04, 0x00]);
        Ok(())
    }
}
