use anyhow::{bail, Error};

use vtl_api_types::{DeviceType, TapeDensity};

use crate::pages::PageRegistry;
use crate::sense::SenseInfo;
use crate::ssc::encryption::{AlgorithmCapability, ALGORITHM_AES_GCM_256};
use crate::ssc::mode_pages::{set_worm_bits, TapeModeOptions};
use crate::ssc::report_density::DensityInfo;
use crate::unit::UnitIdentity;

use super::{MediaCompat, MediumAccess, Personality};

// T10000 media carry 1/2 inch tape
const MEDIA_WIDTH: u16 = 127;

const DENSITIES: [DensityInfo; 4] = [
    DensityInfo {
        density_code: 0x4a,
        name: "T10000A",
        description: "T10000 A 500GB",
        bits_per_mm: 11800,
        media_width: MEDIA_WIDTH,
        tracks: 768,
        capacity: 500_000,
        writable: true,
    },
    DensityInfo {
        density_code: 0x4b,
        name: "T10000B",
        description: "T10000 B 1TB",
        bits_per_mm: 14700,
        media_width: MEDIA_WIDTH,
        tracks: 1152,
        capacity: 1_000_000,
        writable: true,
    },
    DensityInfo {
        density_code: 0x4c,
        name: "T10000C",
        description: "T10000 C 5TB",
        bits_per_mm: 17400,
        media_width: MEDIA_WIDTH,
        tracks: 3584,
        capacity: 5_000_000,
        writable: true,
    },
    DensityInfo {
        density_code: 0x4d,
        name: "T10000D",
        description: "T10000 D 8.5TB",
        bits_per_mm: 19600,
        media_width: MEDIA_WIDTH,
        tracks: 4608,
        capacity: 8_500_000,
        writable: true,
    },
];

const MEDIA: [(&str, &str, TapeDensity); 4] = [
    ("T10KA", "T10KA WORM", TapeDensity::T10KA),
    ("T10KB", "T10KB WORM", TapeDensity::T10KB),
    ("T10KC", "T10KC WORM", TapeDensity::T10KC),
    ("T10KD", "T10KD WORM", TapeDensity::T10KD),
];

/// StorageTek T10000 A to D
///
/// A and B share the T1 cartridge, C and D the T2 cartridge. Each model
/// writes its own density and reads the older one on the same cartridge.
pub struct T10000 {
    model: char,
    media: Vec<MediaCompat>,
    densities: Vec<DensityInfo>,
}

impl T10000 {
    pub fn new(model: char) -> Result<Self, Error> {
        let index = match model {
            'A' => 0,
            'B' => 1,
            'C' => 2,
            'D' => 3,
            _ => bail!("unknown T10000 model '{}'", model),
        };

        let mut media = Vec::new();
        let mut densities = Vec::new();

        for (medium_index, (data, worm, density)) in MEDIA.iter().enumerate() {
            let same_cartridge = medium_index / 2 == index / 2;
            let (access, worm_access) = if medium_index == index {
                (MediumAccess::Encrypt, MediumAccess::Worm)
            } else if same_cartridge && medium_index < index {
                (MediumAccess::ReadOnly, MediumAccess::ReadOnly)
            } else if medium_index > index {
                (MediumAccess::Fail, MediumAccess::Fail)
            } else {
                (MediumAccess::Invalid, MediumAccess::Invalid)
            };

            media.push(MediaCompat {
                medium: *data,
                density: u8::from(*density),
                access,
            });
            media.push(MediaCompat {
                medium: *worm,
                density: u8::from(*density),
                access: worm_access,
            });

            if access.loadable() {
                let mut info = DENSITIES[medium_index];
                info.writable = access.writable();
                densities.push(info);
            }
        }

        media.push(MediaCompat {
            medium: "T10K CLN",
            density: 0,
            access: MediumAccess::ReadWrite,
        });

        Ok(Self {
            model,
            media,
            densities,
        })
    }

    pub fn from_inquiry(vendor: &str, product: &str) -> Option<Self> {
        if !vendor.eq_ignore_ascii_case("STK") {
            return None;
        }
        let model = product.strip_prefix("T10000")?.chars().next()?;
        Self::new(model).ok()
    }
}

impl Personality for T10000 {
    fn name(&self) -> String {
        format!("StorageTek T10000{}", self.model)
    }

    fn device_type(&self) -> DeviceType {
        DeviceType::SequentialAccess
    }

    fn init_pages(&self, identity: &UnitIdentity, pages: &mut PageRegistry) -> Result<(), Error> {
        let options = TapeModeOptions {
            compression: true,
            worm: true,
            vendor_encryption: false,
            prog_early_warning_mb: 0,
        };
        crate::ssc::init_drive_pages(identity, pages, &options)
    }

    fn media_compatibility(&self) -> &[MediaCompat] {
        &self.media
    }

    fn densities(&self) -> &[DensityInfo] {
        &self.densities
    }

    fn set_worm(&self, pages: &mut PageRegistry) -> Result<(), SenseInfo> {
        set_worm_bits(pages, true)
    }

    fn clear_worm(&self, pages: &mut PageRegistry) -> Result<(), SenseInfo> {
        set_worm_bits(pages, false)
    }

    fn update_encryption_mode(
        &self,
        _pages: &mut PageRegistry,
        _encrypt: bool,
    ) -> Result<(), SenseInfo> {
        Ok(())
    }

    fn encryption_capabilities(&self) -> Result<Vec<AlgorithmCapability>, SenseInfo> {
        Ok(vec![AlgorithmCapability {
            algorithm_index: 1,
            algorithm_code: ALGORITHM_AES_GCM_256,
            key_size: 32,
            max_ukad: 32,
            max_akad: 0,
        }])
    }

    fn kad_validation(&self, ukad_len: usize, akad_len: usize) -> Result<(), SenseInfo> {
        if ukad_len > 32 || akad_len > 0 {
            return Err(SenseInfo::INVALID_FIELD_IN_PARAMETER_LIST);
        }
        Ok(())
    }

    fn max_block_size(&self) -> u32 {
        0x20_0000
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::personality::medium_access;

    #[test]
    fn t10000c_media() -> Result<(), Error> {
        let drive = T10000::new('C')?;
        let media = drive.media_compatibility();
        assert_eq!(medium_access(media, "T10KC"), MediumAccess::Encrypt);
        assert_eq!(medium_access(media, "T10KC WORM"), MediumAccess::Worm);
        assert_eq!(medium_access(media, "T10KB"), MediumAccess::Invalid);
        assert_eq!(medium_access(media, "T10KD"), MediumAccess::Fail);
        assert_eq!(medium_access(media, "T10K CLN"), MediumAccess::ReadWrite);

        let drive = T10000::new('D')?;
        assert_eq!(
            medium_access(drive.media_compatibility(), "T10KC"),
            MediumAccess::ReadOnly
        );
        assert_eq!(drive.densities().len(), 2);
        assert!(T10000::new('E').is_err());
        Ok(())
    }
}
