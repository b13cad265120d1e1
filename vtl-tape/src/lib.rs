//! SCSI target emulation for virtual tape drives and libraries
//!
//! A [LogicalUnit](unit::LogicalUnit) takes raw CDBs and answers them
//! the way a real SSC tape drive or SMC medium changer would.

pub mod sense;

pub mod pages;

pub mod reservation;

pub mod personality;

pub mod dispatch;

pub mod unit;

pub mod spc;

pub mod ssc;

pub mod smc;

pub mod message;

/// Converts SCSI ASCII text into String, trim zero and spaces
pub fn scsi_ascii_to_string(data: &[u8]) -> String {
    String::from_utf8_lossy(data)
        .trim_matches(char::from(0))
        .trim()
        .to_string()
}

/// Space padded SCSI ASCII field of exactly `len` bytes
pub fn scsi_ascii(text: &str, len: usize) -> Vec<u8> {
    let mut field = vec![b' '; len];
    for (dst, src) in field.iter_mut().zip(text.bytes()) {
        *dst = src;
    }
    field
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ascii_fields() {
        assert_eq!(scsi_ascii("IBM", 8), b"IBM     ".to_vec());
        assert_eq!(scsi_ascii("TOOLONGVENDOR", 8), b"TOOLONGV".to_vec());
        assert_eq!(scsi_ascii_to_string(b"HP  \0\0"), "HP");
    }
}
