use anyhow::{bail, format_err, Error};

use proxmox_io::WriteExt;

/// Bit of TapeAlert parameter `code` (flags are numbered from 1)
const fn alert(code: u32) -> u64 {
    1 << (code - 1)
}

bitflags::bitflags! {
    /// TapeAlert flags of a drive or library (LOG SENSE page 2Eh)
    pub struct TapeAlertFlags: u64 {
        const READ_WARNING = alert(0x01);
        const WRITE_WARNING = alert(0x02);
        const HARD_ERROR = alert(0x03);
        const MEDIA = alert(0x04);
        const READ_FAILURE = alert(0x05);
        const WRITE_FAILURE = alert(0x06);
        const MEDIA_LIFE = alert(0x07);
        const NOT_DATA_GRADE = alert(0x08);
        const WRITE_PROTECT = alert(0x09);
        const NO_REMOVAL = alert(0x0a);
        const CLEANING_MEDIA = alert(0x0b);
        const UNSUPPORTED_FORMAT = alert(0x0c);
        const RECOVERABLE_MECHANICAL_CARTRIDGE_FAILURE = alert(0x0d);
        const UNRECOVERABLE_SNAPPED_TAPE = alert(0x0e);
        const MEMORY_CHIP_IN_CARTRIDGE_FAILURE = alert(0x0f);
        const FORCED_EJECT = alert(0x10);
        const READ_ONLY_FORMAT = alert(0x11);
        const TAPE_DIRECTORY_CORRUPTED = alert(0x12);
        const NEARING_MEDIA_LIFE = alert(0x13);
        const CLEAN_NOW = alert(0x14);
        const CLEAN_PERIODIC = alert(0x15);
        const EXPIRED_CLEANING_MEDIA = alert(0x16);
        const INVALID_CLEANING_TAPE = alert(0x17);
        const RETENSION_REQUEST = alert(0x18);
        const HOST_CHANNEL_FAILURE = alert(0x19);
        const COOLING_FAN_FAILURE = alert(0x1a);
        const POWER_SUPPLY_FAILURE = alert(0x1b);
        const POWER_CONSUMPTION = alert(0x1c);
        const DRIVE_MANTAINANCE = alert(0x1d);
        const HARDWARE_A = alert(0x1e);
        const HARDWARE_B = alert(0x1f);
        const INTERFACE = alert(0x20);
        const EJECT_MEDIA = alert(0x21);
        const DOWNLOAD_FAULT = alert(0x22);
        const DRIVE_HUMIDITY = alert(0x23);
        const DRIVE_TEMPERATURE = alert(0x24);
        const DRIVE_VOLTAGE = alert(0x25);
        const PREDICTIVE_FAILURE = alert(0x26);
        const DIAGNOSTICS_REQUIRED = alert(0x27);
        const LOADER_STRAY_TAPE = alert(0x29);
        const LOADER_HARDWARE = alert(0x2a);
        const LOADER_MAGAZINE = alert(0x2d);
        const DIMINISHED_NATIVE_CAPACITY = alert(0x31);
        const LOST_STATISTICS = alert(0x32);
        const TAPE_DIRECTORY_INVALID_AT_UNLOAD = alert(0x33);
        const TAPE_SYSTEM_AREA_WRITE_FAILURE = alert(0x34);
        const TAPE_SYSTEM_AREA_READ_FAILURE = alert(0x35);
        const NO_START_OF_DATA = alert(0x36);
        const LOADING_FAILURE = alert(0x37);
        const UNRECOVERABLE_UNLOAD_FAILURE = alert(0x38);
        const AUTOMATION_INTERFACE_FAILURE = alert(0x39);
        const FIRMWARE_FAILURE = alert(0x3a);
        const WORM_INTEGRITY_CHECK_FAILED = alert(0x3b);
        const WORM_OVERWRITE_ATTEMPTED = alert(0x3c);
        const ENCRYPTION_POLICY_VIOLATION = alert(0x3d);
    }
}

impl TapeAlertFlags {
    /// Parse the hex notation used on the message channel (e.g. "TapeAlert 0000000000000400")
    pub fn from_hex(text: &str) -> Result<Self, Error> {
        let text = text.trim();
        let text = text.strip_prefix("0x").unwrap_or(text);
        let mut raw = [0u8; 8];
        if text.len() > 16 {
            bail!("tape alert value '{}' too long", text);
        }
        let padded = format!("{:0>16}", text);
        hex::decode_to_slice(&padded, &mut raw)
            .map_err(|err| format_err!("unable to parse tape alert value '{}' - {}", text, err))?;
        Ok(Self::from_bits_truncate(u64::from_be_bytes(raw)))
    }
}

/// LP 2Eh TapeAlert page: one single byte parameter per flag
///
/// The initiator clears the flags by reading this page.
pub fn tape_alert_log_page(flags: TapeAlertFlags) -> Result<Vec<u8>, Error> {
    let mut data = Vec::with_capacity(4 + 64 * 5);
    data.extend([0x2e, 0x00]);
    unsafe { data.write_be_value((64 * 5) as u16)? };
    for flag in 1..=64u16 {
        let set = (flags.bits() & (1 << (flag - 1))) != 0;
        unsafe { data.write_be_value(flag)? };
        data.extend([0x03, 0x01, set as u8]);
    }
    Ok(data)
}

/// LP 12h TapeAlert Response page: all flags in one parameter
///
/// Flag 1 is the most significant bit, so the bit order is reversed.
pub fn tape_alert_response_page(flags: TapeAlertFlags) -> Result<Vec<u8>, Error> {
    let mut data = Vec::with_capacity(16);
    data.extend([0x12, 0x00]);
    unsafe {
        data.write_be_value(0x0cu16)?;
        data.write_be_value(0u16)?; // parameter code
    }
    data.extend([0x03, 0x08]);
    unsafe { data.write_be_value(flags.bits().reverse_bits())? };
    Ok(data)
}

impl TapeAlertFlags {
    /// Alerts that end the current operation on the medium
    const CRITICAL: u64 = Self::MEDIA.bits()
        | Self::READ_FAILURE.bits()
        | Self::WRITE_FAILURE.bits()
        | Self::WRITE_PROTECT.bits()
        | Self::UNRECOVERABLE_SNAPPED_TAPE.bits()
        | Self::FORCED_EJECT.bits()
        | Self::EXPIRED_CLEANING_MEDIA.bits()
        | Self::INVALID_CLEANING_TAPE.bits()
        | Self::HARDWARE_A.bits()
        | Self::HARDWARE_B.bits()
        | Self::EJECT_MEDIA.bits()
        | Self::PREDICTIVE_FAILURE.bits()
        | Self::LOADER_STRAY_TAPE.bits()
        | Self::LOADER_MAGAZINE.bits()
        | Self::TAPE_SYSTEM_AREA_WRITE_FAILURE.bits()
        | Self::TAPE_SYSTEM_AREA_READ_FAILURE.bits()
        | Self::NO_START_OF_DATA.bits()
        | Self::LOADING_FAILURE.bits()
        | Self::UNRECOVERABLE_UNLOAD_FAILURE.bits()
        | Self::AUTOMATION_INTERFACE_FAILURE.bits();

    pub fn is_critical(&self) -> bool {
        self.bits() & Self::CRITICAL != 0
    }

    /// The medium reached (or nearly reached) its end of life
    pub fn media_worn_out(&self) -> bool {
        self.intersects(Self::MEDIA_LIFE | Self::NEARING_MEDIA_LIFE)
    }

    pub fn wants_cleaning(&self) -> bool {
        self.intersects(Self::CLEAN_NOW | Self::CLEAN_PERIODIC)
    }
}

#[cfg(test)]
mod test {
    use std::io::Read;

    use proxmox_io::ReadExt;

    use super::*;

    /// Flags from a TapeAlert Response page, as an initiator sees them
    fn parse_response_page(page: &[u8]) -> Result<TapeAlertFlags, Error> {
        let (header, mut param) = page.split_at(4);
        if header[0] & 0x3f != 0x12 || header[2..] != [0x00, 0x0c] {
            bail!("not a tape alert response page: {:02x?}", header);
        }
        let code: u16 = unsafe { param.read_be_value()? };
        let mut control = [0u8; 2];
        param.read_exact(&mut control)?;
        if code != 0 || control[1] != 8 {
            bail!("unexpected parameter {:04x} (length {})", code, control[1]);
        }
        let value: u64 = unsafe { param.read_be_value()? };
        Ok(TapeAlertFlags::from_bits_truncate(value.reverse_bits()))
    }

    #[test]
    fn response_page() -> Result<(), Error> {
        let flags = TapeAlertFlags::CLEAN_NOW | TapeAlertFlags::WORM_OVERWRITE_ATTEMPTED;
        let page = tape_alert_response_page(flags)?;
        assert_eq!(page.len(), 16);
        assert_eq!(parse_response_page(&page)?, flags);
        assert!(flags.wants_cleaning());
        assert!(!flags.is_critical());
        assert!(!flags.media_worn_out());
        assert!((flags | TapeAlertFlags::LOADING_FAILURE).is_critical());
        Ok(())
    }

    #[test]
    fn log_page() -> Result<(), Error> {
        let page = tape_alert_log_page(TapeAlertFlags::WRITE_PROTECT)?;
        assert_eq!(page.len(), 4 + 64 * 5);
        // parameter 0x0009 is the 9th entry
        let param = &page[4 + 8 * 5..4 + 9 * 5];
        assert_eq!(param, &[0x00, 0x09, 0x03, 0x01, 0x01]);
        assert_eq!(page[4 + 4], 0);
        Ok(())
    }

    #[test]
    fn parse_hex() -> Result<(), Error> {
        assert_eq!(
            TapeAlertFlags::from_hex("400")?,
            TapeAlertFlags::CLEANING_MEDIA
        );
        assert_eq!(
            TapeAlertFlags::from_hex("0x0000000000080000")?,
            TapeAlertFlags::CLEAN_NOW
        );
        assert!(TapeAlertFlags::from_hex("xyz").is_err());
        Ok(())
    }
}
