//! Tape drive log pages, rebuilt from the live counters on every LOG SENSE

use anyhow::Error;
use endian_trait::Endian;

use proxmox_io::WriteExt;

use vtl_api_types::DeviceActivity;

use super::mam::{MediumAuxMemory, MediumKind};
use super::tape_alert_flags::{tape_alert_log_page, tape_alert_response_page, TapeAlertFlags};

pub const LP_SUPPORTED_PAGES: u8 = 0x00;
pub const LP_WRITE_ERRORS: u8 = 0x02;
pub const LP_READ_ERRORS: u8 = 0x03;
pub const LP_SEQUENTIAL_ACCESS: u8 = 0x0c;
pub const LP_TEMPERATURE: u8 = 0x0d;
pub const LP_DEVICE_STATUS: u8 = 0x11;
pub const LP_TAPE_ALERT_RESPONSE: u8 = 0x12;
pub const LP_DEVICE_STATISTICS: u8 = 0x14;
pub const LP_VOLUME_STATISTICS: u8 = 0x17;
pub const LP_DATA_COMPRESSION: u8 = 0x1b;
pub const LP_TAPE_ALERT: u8 = 0x2e;
pub const LP_TAPE_CAPACITY: u8 = 0x31;

/// Log pages of a sequential access device, in report order
pub const TAPE_LOG_PAGES: &[u8] = &[
    LP_SUPPORTED_PAGES,
    LP_WRITE_ERRORS,
    LP_READ_ERRORS,
    LP_SEQUENTIAL_ACCESS,
    LP_TEMPERATURE,
    LP_DEVICE_STATUS,
    LP_TAPE_ALERT_RESPONSE,
    LP_DEVICE_STATISTICS,
    LP_VOLUME_STATISTICS,
    LP_DATA_COMPRESSION,
    LP_TAPE_ALERT,
    LP_TAPE_CAPACITY,
];

// parameter control byte for counters and binary lists
const LP_CONTROL_COUNTER: u8 = 0x00;
const LP_CONTROL_BINARY: u8 = 0x03;

const MB: u64 = 1_000_000;
const MIB: u64 = 1024 * 1024;

/// Counters since the drive was started (or last reset by LOG SELECT)
#[derive(Debug, Default, Clone)]
pub struct DriveCounters {
    pub bytes_from_initiator: u64,
    pub bytes_to_media: u64,
    pub bytes_from_media: u64,
    pub bytes_to_initiator: u64,
    pub blocks_written: u64,
    pub blocks_read: u64,
    pub write_errors: u64,
    pub read_errors: u64,
    pub volume_loads: u64,
    pub cleaning_operations: u64,
}

/// Everything the log pages report
pub struct LogSnapshot<'a> {
    pub counters: &'a DriveCounters,
    pub mam: Option<&'a MediumAuxMemory>,
    pub remaining_capacity: u64,
    pub tape_alert: TapeAlertFlags,
    pub activity: DeviceActivity,
    pub compression: bool,
    pub write_protect: bool,
    pub cleaning_requested: bool,
}

#[repr(C, packed)]
#[derive(Endian)]
pub struct LpParameterHeader {
    pub parameter_code: u16,
    pub control: u8,
    pub parameter_len: u8,
}

/// Collects log parameters and adds the page header
pub struct LogPageWriter {
    page_code: u8,
    body: Vec<u8>,
}

impl LogPageWriter {
    pub fn new(page_code: u8) -> Self {
        Self {
            page_code,
            body: Vec::new(),
        }
    }

    pub fn parameter(&mut self, code: u16, control: u8, value: &[u8]) -> Result<(), Error> {
        let head = LpParameterHeader {
            parameter_code: code,
            control,
            parameter_len: value.len() as u8,
        };
        unsafe { self.body.write_be_value(head)? };
        self.body.extend(value);
        Ok(())
    }

    /// Counter parameter, big endian with `len` bytes
    pub fn counter(&mut self, code: u16, value: u64, len: usize) -> Result<(), Error> {
        let bytes = value.to_be_bytes();
        self.parameter(code, LP_CONTROL_COUNTER, &bytes[8 - len..])
    }

    pub fn finish(self) -> Result<Vec<u8>, Error> {
        let mut data = Vec::with_capacity(self.body.len() + 4);
        data.extend([self.page_code, 0]);
        unsafe { data.write_be_value(self.body.len() as u16)? };
        data.extend(self.body);
        Ok(data)
    }
}

fn error_counter_page(page_code: u8, bytes_processed: u64, errors: u64) -> Result<Vec<u8>, Error> {
    let mut page = LogPageWriter::new(page_code);
    page.counter(0x0000, 0, 4)?; // corrected without delay
    page.counter(0x0001, 0, 4)?; // corrected with delay
    page.counter(0x0002, 0, 4)?; // total rewrites or rereads
    page.counter(0x0003, 0, 4)?; // total errors corrected
    page.counter(0x0004, 0, 4)?; // correction algorithm processed
    page.counter(0x0005, bytes_processed, 8)?;
    page.counter(0x0006, errors, 4)?; // total uncorrected
    page.finish()
}

/// Build one log page, `None` if the page is not known
pub fn encode_log_page(page_code: u8, snap: &LogSnapshot) -> Result<Option<Vec<u8>>, Error> {
    let counters = snap.counters;

    let data = match page_code {
        LP_WRITE_ERRORS => {
            error_counter_page(page_code, counters.bytes_to_media, counters.write_errors)?
        }
        LP_READ_ERRORS => {
            error_counter_page(page_code, counters.bytes_from_media, counters.read_errors)?
        }
        LP_SEQUENTIAL_ACCESS => {
            let mut page = LogPageWriter::new(page_code);
            page.counter(0x0000, counters.bytes_from_initiator, 8)?;
            page.counter(0x0001, counters.bytes_to_media, 8)?;
            page.counter(0x0002, counters.bytes_from_media, 8)?;
            page.counter(0x0003, counters.bytes_to_initiator, 8)?;
            page.finish()?
        }
        LP_TEMPERATURE => {
            let mut page = LogPageWriter::new(page_code);
            page.parameter(0x0000, LP_CONTROL_BINARY, &[0, 35])?;
            page.parameter(0x0001, LP_CONTROL_BINARY, &[0, 65])?; // reference
            page.finish()?
        }
        LP_DEVICE_STATUS => {
            let mut flags = 0x01; // DINIT
            if snap.cleaning_requested {
                flags |= 0x04;
            }
            if snap.write_protect {
                flags |= 0x08;
            }
            if snap.compression {
                flags |= 0x10;
            }
            if snap.mam.is_some() {
                flags |= 0x20; // MACC
            }
            let present = if snap.mam.is_some() { 0x80 } else { 0x00 };
            let mut page = LogPageWriter::new(page_code);
            page.parameter(
                0x0000,
                LP_CONTROL_BINARY,
                &[flags, present, snap.activity.into(), 0],
            )?;
            page.finish()?
        }
        LP_TAPE_ALERT_RESPONSE => tape_alert_response_page(snap.tape_alert)?,
        LP_DEVICE_STATISTICS => {
            let mut page = LogPageWriter::new(page_code);
            page.counter(0x0000, counters.volume_loads, 4)?;
            page.counter(0x0001, counters.cleaning_operations, 4)?;
            page.counter(0x0002, 0, 4)?; // power on hours
            page.finish()?
        }
        LP_VOLUME_STATISTICS => volume_statistics_page(snap)?,
        LP_DATA_COMPRESSION => {
            let mut page = LogPageWriter::new(page_code);
            let ratio = |logical: u64, physical: u64| {
                if physical == 0 {
                    100
                } else {
                    logical * 100 / physical
                }
            };
            page.counter(0x0000, ratio(counters.bytes_to_initiator, counters.bytes_from_media), 2)?;
            page.counter(0x0001, ratio(counters.bytes_from_initiator, counters.bytes_to_media), 2)?;
            page.counter(0x0002, counters.bytes_to_initiator / MB, 4)?;
            page.counter(0x0004, counters.bytes_from_media / MB, 4)?;
            page.counter(0x0006, counters.bytes_from_initiator / MB, 4)?;
            page.counter(0x0008, counters.bytes_to_media / MB, 4)?;
            page.finish()?
        }
        LP_TAPE_ALERT => tape_alert_log_page(snap.tape_alert)?,
        LP_TAPE_CAPACITY => {
            let max = snap.mam.map(|mam| mam.max_capacity).unwrap_or(0);
            let mut page = LogPageWriter::new(page_code);
            page.counter(0x0001, snap.remaining_capacity / MIB, 4)?;
            page.counter(0x0003, max / MIB, 4)?;
            page.finish()?
        }
        _ => return Ok(None),
    };

    Ok(Some(data))
}

fn volume_statistics_page(snap: &LogSnapshot) -> Result<Vec<u8>, Error> {
    let mut page = LogPageWriter::new(LP_VOLUME_STATISTICS);

    let mam = match snap.mam {
        Some(mam) => mam,
        None => {
            // page not valid without medium
            page.counter(0x0000, 0, 1)?;
            return page.finish();
        }
    };

    let used = mam.max_capacity.saturating_sub(snap.remaining_capacity);

    page.counter(0x0000, 1, 1)?; // page valid
    page.counter(0x0001, mam.load_count, 4)?;
    page.counter(0x0002, snap.counters.blocks_written, 8)?;
    page.counter(0x0007, snap.counters.blocks_read, 8)?;
    page.counter(0x000E, mam.last_bytes_written / MB, 4)?;
    page.counter(0x000F, mam.last_bytes_read / MB, 4)?;
    page.counter(0x0010, mam.bytes_written / MB, 8)?;
    page.counter(0x0011, mam.bytes_read / MB, 8)?;
    page.counter(0x0016, mam.max_capacity / MB, 4)?;
    page.counter(0x0017, used / MB, 4)?;
    page.parameter(0x0040, LP_CONTROL_BINARY, mam.medium_serial.as_bytes())?;
    page.counter(0x0080, snap.write_protect as u64, 1)?;
    page.counter(0x0081, (mam.medium_kind == MediumKind::Worm) as u64, 1)?;
    page.finish()
}

#[cfg(test)]
mod test {
    use std::io::Read;

    use anyhow::bail;
    use proxmox_io::ReadExt;

    use super::*;

    fn read_be_counter(reader: &mut &[u8], len: u8) -> Result<u64, Error> {
        let len = len as usize;
        if len == 0 || len > 8 {
            bail!("invalid counter size '{}'", len);
        }
        let mut buffer = [0u8; 8];
        reader.read_exact(&mut buffer[..len])?;
        Ok(buffer
            .iter()
            .take(len)
            .fold(0, |value, curr| (value << 8) | *curr as u64))
    }

    fn parameters(data: &[u8]) -> Result<Vec<(u16, Vec<u8>)>, Error> {
        let mut reader = &data[2..];
        let page_len: u16 = unsafe { reader.read_be_value()? };
        if page_len as usize + 4 != data.len() {
            bail!("invalid page length");
        }
        let mut list = Vec::new();
        while !reader.is_empty() {
            let head: LpParameterHeader = unsafe { reader.read_be_value()? };
            let value = reader.read_exact_allocated(head.parameter_len as usize)?;
            list.push((head.parameter_code, value));
        }
        Ok(list)
    }

    fn snapshot<'a>(counters: &'a DriveCounters, mam: Option<&'a MediumAuxMemory>) -> LogSnapshot<'a> {
        LogSnapshot {
            counters,
            mam,
            remaining_capacity: 1_000 * MB,
            tape_alert: TapeAlertFlags::empty(),
            activity: DeviceActivity::Reading,
            compression: true,
            write_protect: false,
            cleaning_requested: false,
        }
    }

    #[test]
    fn volume_statistics() -> Result<(), Error> {
        let mut mam = MediumAuxMemory::new("ABC001L6", "LTO6", MediumKind::Worm, 0x5a, 2_500 * MB)?;
        mam.load_count = 7;
        mam.bytes_written = 300 * MB;
        let counters = DriveCounters::default();

        let data = encode_log_page(LP_VOLUME_STATISTICS, &snapshot(&counters, Some(&mam)))?
            .expect("volume statistics page");
        assert_eq!(data[0], 0x17);

        let mut page_valid = false;
        for (code, value) in parameters(&data)? {
            let mut reader = &value[..];
            match code {
                0x0000 => page_valid = read_be_counter(&mut reader, value.len() as u8)? == 1,
                0x0001 => assert_eq!(read_be_counter(&mut reader, value.len() as u8)?, 7),
                0x0010 => assert_eq!(read_be_counter(&mut reader, value.len() as u8)?, 300),
                0x0017 => assert_eq!(read_be_counter(&mut reader, value.len() as u8)?, 1500),
                0x0081 => assert_eq!(value, [1]),
                _ => {}
            }
        }
        assert!(page_valid);

        let data = encode_log_page(LP_VOLUME_STATISTICS, &snapshot(&counters, None))?
            .expect("volume statistics page");
        assert_eq!(parameters(&data)?, vec![(0x0000, vec![0])]);
        Ok(())
    }

    #[test]
    fn device_status() -> Result<(), Error> {
        let counters = DriveCounters::default();
        let data = encode_log_page(LP_DEVICE_STATUS, &snapshot(&counters, None))?
            .expect("device status page");
        let list = parameters(&data)?;
        let vhf = &list[0].1;
        assert_eq!(vhf.len(), 4);
        assert_eq!(vhf[0] & 0x01, 1);
        assert_eq!(DeviceActivity::try_from(vhf[2])?, DeviceActivity::Reading);
        Ok(())
    }

    #[test]
    fn unknown_page() -> Result<(), Error> {
        let counters = DriveCounters::default();
        assert!(encode_log_page(0x3a, &snapshot(&counters, None))?.is_none());
        Ok(())
    }
}
