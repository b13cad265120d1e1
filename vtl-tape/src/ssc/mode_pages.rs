//! Mode pages of a sequential access device
//!
//! Pages are stored including their page header, so MODE SENSE can
//! concatenate them unchanged.

use anyhow::Error;
use endian_trait::Endian;

use proxmox_io::{ReadExt, WriteExt};

use crate::pages::{PageKind, PageRegistry};
use crate::sense::SenseInfo;

pub const MP_RW_ERROR_RECOVERY: u8 = 0x01;
pub const MP_DISCONNECT_RECONNECT: u8 = 0x02;
pub const MP_CONTROL: u8 = 0x0a;
pub const MP_DATA_COMPRESSION: u8 = 0x0f;
pub const MP_DEVICE_CONFIGURATION: u8 = 0x10;
pub const MP_MEDIUM_PARTITION: u8 = 0x11;
pub const MP_INFORMATIONAL_EXCEPTIONS: u8 = 0x1c;
pub const MP_MEDIUM_CONFIGURATION: u8 = 0x1d;
pub const MP_VENDOR_ENCRYPTION: u8 = 0x24;

const SPF: u8 = 0x40;

/// zlib, registered as vendor specific algorithm
const COMPRESSION_ALGORITHM: u32 = 0x0000_00ff;

#[repr(C, packed)]
#[derive(Endian, Debug, Copy, Clone)]
pub struct DataCompressionModePage {
    page_code: u8,   // 0x0f
    page_length: u8, // 0x0e
    flags2: u8,
    flags3: u8,
    compression_algorithm: u32,
    decompression_algorithm: u32,
    reserved: [u8; 4],
}

impl DataCompressionModePage {
    fn new() -> Self {
        Self {
            page_code: MP_DATA_COMPRESSION,
            page_length: 0x0e,
            flags2: 0b0100_0000, // DCC
            flags3: 0b1000_0000, // DDE
            compression_algorithm: COMPRESSION_ALGORITHM,
            decompression_algorithm: COMPRESSION_ALGORITHM,
            reserved: [0u8; 4],
        }
    }

    pub fn set_compression(&mut self, enable: bool) {
        if enable {
            self.flags2 |= 128;
        } else {
            self.flags2 &= 127;
        }
    }

    pub fn compression_enabled(&self) -> bool {
        (self.flags2 & 0b1000_0000) != 0
    }
}

#[repr(C, packed)]
#[derive(Endian)]
struct MediumConfigurationModePage {
    page_code: u8,   // 0x1d
    page_length: u8, // 0x1e
    flags2: u8,
    reserved: [u8; 29],
}

impl MediumConfigurationModePage {
    fn new() -> Self {
        let mut reserved = [0u8; 29];
        reserved[1] = 0x01; // WORM mode label restrictions
        reserved[2] = 0x02; // WORM mode filemark restrictions
        Self {
            page_code: MP_MEDIUM_CONFIGURATION,
            page_length: 0x1e,
            flags2: 0,
            reserved,
        }
    }

    fn set_worm(&mut self, worm: bool) {
        if worm {
            self.flags2 |= 1;
        } else {
            self.flags2 &= !1;
        }
    }
}

/// Mode page options of one drive model
#[derive(Debug, Clone, Copy)]
pub struct TapeModeOptions {
    pub compression: bool,
    /// Drive understands WORM media (page 1Dh)
    pub worm: bool,
    /// Drive carries the vendor encryption page 24h
    pub vendor_encryption: bool,
    /// Programmable early warning size in MB
    pub prog_early_warning_mb: u16,
}

fn add_page(
    pages: &mut PageRegistry,
    page_code: u8,
    sub_page_code: u8,
    data: &[u8],
    changeable: &[u8],
) -> Result<(), Error> {
    let page = pages.add(PageKind::Mode, page_code, sub_page_code, data)?;
    page.set_changeable(changeable)?;
    Ok(())
}

fn sub_page(page_code: u8, sub_page_code: u8, len: u16) -> Vec<u8> {
    let mut data = vec![0u8; len as usize + 4];
    data[0] = page_code | SPF;
    data[1] = sub_page_code;
    data[2..4].copy_from_slice(&len.to_be_bytes());
    data
}

/// Register the mode pages of a tape drive
pub fn init_tape_mode_pages(pages: &mut PageRegistry, options: &TapeModeOptions) -> Result<(), Error> {
    let mut data = vec![0u8; 12];
    data[0] = MP_RW_ERROR_RECOVERY;
    data[1] = 0x0a;
    let mut mask = vec![0u8; 12];
    mask[2] = 0xff; // EER, PER, DTE, DCR
    add_page(pages, MP_RW_ERROR_RECOVERY, 0, &data, &mask)?;

    let mut data = vec![0u8; 16];
    data[0] = MP_DISCONNECT_RECONNECT;
    data[1] = 0x0e;
    add_page(pages, MP_DISCONNECT_RECONNECT, 0, &data, &[0u8; 16])?;

    let mut data = vec![0u8; 12];
    data[0] = MP_CONTROL;
    data[1] = 0x0a;
    data[3] = 0x10; // queue algorithm modifier
    data[8..10].copy_from_slice(&0xffffu16.to_be_bytes()); // busy timeout period
    add_page(pages, MP_CONTROL, 0, &data, &[0u8; 12])?;

    let data = sub_page(MP_CONTROL, 0x01, 0x1c);
    add_page(pages, MP_CONTROL, 0x01, &data, &vec![0u8; data.len()])?;

    let mut compression = DataCompressionModePage::new();
    compression.set_compression(options.compression);
    let mut data = Vec::new();
    unsafe { data.write_be_value(compression)? };
    let mut mask = vec![0u8; data.len()];
    mask[2] = 0x80; // DCE
    mask[3] = 0x80; // DDE
    add_page(pages, MP_DATA_COMPRESSION, 0, &data, &mask)?;

    let mut data = vec![0u8; 16];
    data[0] = MP_DEVICE_CONFIGURATION;
    data[1] = 0x0e;
    data[8] = 0x40; // BIS: block identifiers supported
    data[10] = 0x18; // EOD defined, EEG
    data[14] = options.compression as u8;
    let mut mask = vec![0u8; 16];
    mask[14] = 0xff;
    add_page(pages, MP_DEVICE_CONFIGURATION, 0, &data, &mask)?;

    let mut data = sub_page(MP_DEVICE_CONFIGURATION, 0x01, 0x1c);
    data[6..8].copy_from_slice(&options.prog_early_warning_mb.to_be_bytes());
    let mut mask = vec![0u8; data.len()];
    mask[6] = 0xff;
    mask[7] = 0xff;
    add_page(pages, MP_DEVICE_CONFIGURATION, 0x01, &data, &mask)?;

    let mut data = vec![0u8; 10];
    data[0] = MP_MEDIUM_PARTITION;
    data[1] = 0x08;
    data[4] = 0x10; // PSUM: megabytes
    data[5] = 0x03; // format and partition recognition
    data[6] = 0x09;
    add_page(pages, MP_MEDIUM_PARTITION, 0, &data, &[0u8; 10])?;

    let mut data = vec![0u8; 12];
    data[0] = MP_INFORMATIONAL_EXCEPTIONS;
    data[1] = 0x0a;
    data[2] = 0x08; // DEXCPT
    data[3] = 0x03; // MRIE: conditionally generate recovered error
    let mut mask = vec![0u8; 12];
    mask[2] = 0x08;
    mask[3] = 0x0f;
    add_page(pages, MP_INFORMATIONAL_EXCEPTIONS, 0, &data, &mask)?;

    if options.worm {
        let mut data = Vec::new();
        unsafe { data.write_be_value(MediumConfigurationModePage::new())? };
        add_page(pages, MP_MEDIUM_CONFIGURATION, 0, &data, &vec![0u8; data.len()])?;
    }

    if options.vendor_encryption {
        let data = [MP_VENDOR_ENCRYPTION, 0x06, 0, 0, 0, 0, 0, 0];
        add_page(pages, MP_VENDOR_ENCRYPTION, 0, &data, &[0u8; 8])?;
    }

    Ok(())
}

fn compression_page(pages: &PageRegistry) -> Option<DataCompressionModePage> {
    let page = pages.lookup(PageKind::Mode, MP_DATA_COMPRESSION, 0)?;
    let mut reader = page.data();
    unsafe { reader.read_be_value().ok() }
}

pub fn compression_enabled(pages: &PageRegistry) -> bool {
    compression_page(pages)
        .map(|page| page.compression_enabled())
        .unwrap_or(false)
}

/// Flip DCE in page 0Fh and the compression byte of page 10h
pub fn set_compression_bits(pages: &mut PageRegistry, enable: bool) -> Result<(), SenseInfo> {
    let mut compression = compression_page(pages).ok_or(SenseInfo::INVALID_FIELD_IN_CDB)?;
    compression.set_compression(enable);

    let mut data = Vec::new();
    unsafe { data.write_be_value(compression) }.map_err(|_| SenseInfo::INTERNAL_TARGET_FAILURE)?;
    if let Some(page) = pages.lookup_mut(PageKind::Mode, MP_DATA_COMPRESSION, 0) {
        page.data_mut().copy_from_slice(&data);
    }

    if let Some(page) = pages.lookup_mut(PageKind::Mode, MP_DEVICE_CONFIGURATION, 0) {
        page.data_mut()[14] = enable as u8;
    }
    Ok(())
}

/// Set or clear WORMM in the medium configuration page
pub fn set_worm_bits(pages: &mut PageRegistry, worm: bool) -> Result<(), SenseInfo> {
    let page = pages
        .lookup_mut(PageKind::Mode, MP_MEDIUM_CONFIGURATION, 0)
        .ok_or(SenseInfo::INVALID_FIELD_IN_CDB)?;
    let mut reader = page.data();
    let mut config: MediumConfigurationModePage =
        unsafe { reader.read_be_value() }.map_err(|_| SenseInfo::INTERNAL_TARGET_FAILURE)?;
    config.set_worm(worm);

    let mut data = Vec::new();
    unsafe { data.write_be_value(config) }.map_err(|_| SenseInfo::INTERNAL_TARGET_FAILURE)?;
    page.data_mut().copy_from_slice(&data);
    Ok(())
}

/// Mirror the encryption state into the vendor page (byte 7, bit 3)
pub fn set_vendor_encryption_bit(pages: &mut PageRegistry, enable: bool) {
    if let Some(page) = pages.lookup_mut(PageKind::Mode, MP_VENDOR_ENCRYPTION, 0) {
        if enable {
            page.data_mut()[7] |= 0x08;
        } else {
            page.data_mut()[7] &= !0x08;
        }
    }
}

/// Programmable early warning size from page 10h/01h, in bytes
pub fn prog_early_warning_size(pages: &PageRegistry) -> Option<u64> {
    let page = pages.lookup(PageKind::Mode, MP_DEVICE_CONFIGURATION, 0x01)?;
    let data = page.data();
    let mb = u16::from_be_bytes([data[6], data[7]]) as u64;
    Some(mb * 1_000_000)
}
