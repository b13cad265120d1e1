use anyhow::Error;
use endian_trait::Endian;

use proxmox_io::WriteExt;

/// One density a drive family can read or write
#[derive(Debug, Copy, Clone)]
pub struct DensityInfo {
    pub density_code: u8,
    pub name: &'static str,
    pub description: &'static str,
    pub bits_per_mm: u32,
    /// Media width in 0.1 mm
    pub media_width: u16,
    pub tracks: u16,
    /// Native capacity in MB (10^6 bytes)
    pub capacity: u32,
    /// Drive can write this density (otherwise read only)
    pub writable: bool,
}

#[repr(C, packed)]
#[derive(Endian)]
struct DensityDescriptorBlock {
    primary_density_code: u8,
    secondary_density_code: u8,
    flags2: u8,
    reserved: [u8; 2],
    bits_per_mm: [u8; 3],
    media_width: u16,
    tracks: u16,
    capacity: u32,
    organization: [u8; 8],
    density_name: [u8; 8],
    description: [u8; 20],
}

fn ascii<const N: usize>(text: &str) -> [u8; N] {
    let mut field = [b' '; N];
    for (dst, src) in field.iter_mut().zip(text.bytes()) {
        *dst = src;
    }
    field
}

/// REPORT DENSITY SUPPORT parameter data
///
/// With `current` set, only the density of the loaded medium is listed.
pub fn report_density_support(
    densities: &[DensityInfo],
    current: Option<u8>,
) -> Result<Vec<u8>, Error> {
    let mut body = Vec::new();

    for info in densities {
        if let Some(code) = current {
            if code != info.density_code {
                continue;
            }
        }
        let mut flags2 = 0x20; // DEFLT
        if info.writable {
            flags2 |= 0x80; // WRTOK
        }
        let bpmm = info.bits_per_mm.to_be_bytes();
        let block = DensityDescriptorBlock {
            primary_density_code: info.density_code,
            secondary_density_code: info.density_code,
            flags2,
            reserved: [0u8; 2],
            bits_per_mm: [bpmm[1], bpmm[2], bpmm[3]],
            media_width: info.media_width,
            tracks: info.tracks,
            capacity: info.capacity,
            organization: ascii("LTO-CVE"),
            density_name: ascii(info.name),
            description: ascii(info.description),
        };
        unsafe { body.write_be_value(block)? };
    }

    let mut data = Vec::with_capacity(body.len() + 4);
    data.extend(((body.len() + 2) as u16).to_be_bytes());
    data.extend([0u8; 2]);
    data.extend(body);
    Ok(data)
}
