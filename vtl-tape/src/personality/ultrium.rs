use anyhow::Error;

use vtl_api_types::{DeviceType, TapeDensity};

use crate::dispatch::DispatchTable;
use crate::pages::PageRegistry;
use crate::sense::SenseInfo;
use crate::ssc::encryption::{AlgorithmCapability, ALGORITHM_AES_GCM_256};
use crate::ssc::mode_pages::{set_vendor_encryption_bit, set_worm_bits, TapeModeOptions};
use crate::ssc::report_density::DensityInfo;
use crate::unit::UnitIdentity;

use super::{MediaCompat, MediumAccess, Personality};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UltriumVendor {
    Ibm,
    Hp,
}

struct Generation {
    number: u8,
    density: TapeDensity,
    data: &'static str,
    worm: Option<&'static str>,
    cleaning: &'static str,
    info: DensityInfo,
}

const fn density(
    density_code: u8,
    name: &'static str,
    description: &'static str,
    bits_per_mm: u32,
    tracks: u16,
    capacity: u32,
) -> DensityInfo {
    DensityInfo {
        density_code,
        name,
        description,
        bits_per_mm,
        media_width: 127,
        tracks,
        capacity,
        writable: true,
    }
}

const GENERATIONS: [Generation; 9] = [
    Generation {
        number: 1,
        density: TapeDensity::LTO1,
        data: "LTO1",
        worm: None,
        cleaning: "LTO1 CLN",
        info: density(0x40, "U-18", "Ultrium 1/8T", 4880, 384, 100_000),
    },
    Generation {
        number: 2,
        density: TapeDensity::LTO2,
        data: "LTO2",
        worm: None,
        cleaning: "LTO2 CLN",
        info: density(0x42, "U-28", "Ultrium 2/8T", 7398, 512, 200_000),
    },
    Generation {
        number: 3,
        density: TapeDensity::LTO3,
        data: "LTO3",
        worm: Some("LTO3 WORM"),
        cleaning: "LTO3 CLN",
        info: density(0x44, "U-316", "Ultrium 3/16T", 9638, 704, 400_000),
    },
    Generation {
        number: 4,
        density: TapeDensity::LTO4,
        data: "LTO4",
        worm: Some("LTO4 WORM"),
        cleaning: "LTO4 CLN",
        info: density(0x46, "U-416", "Ultrium 4/16T", 13250, 896, 800_000),
    },
    Generation {
        number: 5,
        density: TapeDensity::LTO5,
        data: "LTO5",
        worm: Some("LTO5 WORM"),
        cleaning: "LTO5 CLN",
        info: density(0x58, "U-516", "Ultrium 5/16T", 15142, 1280, 1_500_000),
    },
    Generation {
        number: 6,
        density: TapeDensity::LTO6,
        data: "LTO6",
        worm: Some("LTO6 WORM"),
        cleaning: "LTO6 CLN",
        info: density(0x5a, "U-616", "Ultrium 6/16T", 15142, 2176, 2_500_000),
    },
    Generation {
        number: 7,
        density: TapeDensity::LTO7,
        data: "LTO7",
        worm: Some("LTO7 WORM"),
        cleaning: "LTO7 CLN",
        info: density(0x5c, "U-732", "Ultrium 7/32T", 19107, 3584, 6_000_000),
    },
    Generation {
        number: 8,
        density: TapeDensity::LTO8,
        data: "LTO8",
        worm: Some("LTO8 WORM"),
        cleaning: "LTO8 CLN",
        info: density(0x5e, "U-832", "Ultrium 8/32T", 20669, 6656, 12_000_000),
    },
    Generation {
        number: 9,
        density: TapeDensity::LTO9,
        data: "LTO9",
        worm: Some("LTO9 WORM"),
        cleaning: "LTO9 CLN",
        info: density(0x60, "U-932", "Ultrium 9/32T", 23031, 8960, 18_000_000),
    },
];

/// LTO7 drives write LTO8 cartridges at this density
const LTO7_M8: DensityInfo = density(0x5d, "U-7M8", "Ultrium 7/M8", 20669, 5376, 9_000_000);

/// Generations a drive of generation `drive` writes
fn writes(drive: u8, medium: u8) -> bool {
    medium == drive || (drive <= 7 && medium + 1 == drive)
}

/// Generations a drive of generation `drive` only reads
fn reads(drive: u8, medium: u8) -> bool {
    if drive >= 8 {
        medium + 1 == drive
    } else {
        medium + 2 == drive
    }
}

/// IBM and HP Ultrium (LTO) drives
///
/// WORM media are supported from LTO3, encryption from LTO4.
pub struct Ultrium {
    vendor: UltriumVendor,
    generation: u8,
    media: Vec<MediaCompat>,
    densities: Vec<DensityInfo>,
}

impl Ultrium {
    pub fn new(vendor: UltriumVendor, generation: u8) -> Result<Self, Error> {
        if !(1..=9).contains(&generation) {
            anyhow::bail!("unsupported LTO generation {}", generation);
        }

        let mut media = Vec::new();
        let mut densities = Vec::new();

        for entry in GENERATIONS.iter() {
            let code = u8::from(entry.density);
            let (access, worm_access) = if writes(generation, entry.number) {
                let access = if generation >= 4 && entry.number >= 4 {
                    MediumAccess::Encrypt
                } else {
                    MediumAccess::ReadWrite
                };
                (access, MediumAccess::Worm)
            } else if reads(generation, entry.number) {
                (MediumAccess::ReadOnly, MediumAccess::ReadOnly)
            } else if entry.number > generation {
                (MediumAccess::Fail, MediumAccess::Fail)
            } else {
                (MediumAccess::Invalid, MediumAccess::Invalid)
            };

            media.push(MediaCompat {
                medium: entry.data,
                density: code,
                access,
            });
            if let Some(worm) = entry.worm {
                let access = if generation >= 3 { worm_access } else { MediumAccess::Invalid };
                media.push(MediaCompat {
                    medium: worm,
                    density: code,
                    access,
                });
            }
            media.push(MediaCompat {
                medium: entry.cleaning,
                density: code,
                access: MediumAccess::ReadWrite,
            });

            if access.loadable() {
                let mut info = entry.info;
                info.writable = access.writable();
                densities.push(info);
            }
        }

        if generation == 7 {
            media.push(MediaCompat {
                medium: "LTO8 M8",
                density: LTO7_M8.density_code,
                access: MediumAccess::Encrypt,
            });
            densities.push(LTO7_M8);
        }

        Ok(Self {
            vendor,
            generation,
            media,
            densities,
        })
    }

    /// Recognize IBM `ULT3580-TDx` and HP `Ultrium x-SCSI` products
    pub fn from_inquiry(vendor: &str, product: &str) -> Option<Self> {
        let (vendor, generation) = if vendor.eq_ignore_ascii_case("IBM") {
            let generation = product
                .strip_prefix("ULT3580-TD")
                .or_else(|| product.strip_prefix("ULTRIUM-TD"))?;
            (UltriumVendor::Ibm, generation)
        } else if vendor.eq_ignore_ascii_case("HP") {
            let generation = product.strip_prefix("Ultrium ")?.strip_suffix("-SCSI")?;
            (UltriumVendor::Hp, generation)
        } else {
            return None;
        };

        let generation: u8 = generation.trim().parse().ok()?;
        Self::new(vendor, generation).ok()
    }

    pub fn generation(&self) -> u8 {
        self.generation
    }

    fn mode_options(&self) -> TapeModeOptions {
        TapeModeOptions {
            compression: true,
            worm: self.generation >= 3,
            vendor_encryption: self.vendor == UltriumVendor::Ibm && self.generation >= 4,
            prog_early_warning_mb: 0,
        }
    }
}

impl Personality for Ultrium {
    fn name(&self) -> String {
        match self.vendor {
            UltriumVendor::Ibm => format!("IBM Ultrium {}", self.generation),
            UltriumVendor::Hp => format!("HP Ultrium {}", self.generation),
        }
    }

    fn device_type(&self) -> DeviceType {
        DeviceType::SequentialAccess
    }

    fn init_pages(&self, identity: &UnitIdentity, pages: &mut PageRegistry) -> Result<(), Error> {
        crate::ssc::init_drive_pages(identity, pages, &self.mode_options())
    }

    fn customize_dispatch(&self, table: &mut DispatchTable) {
        if self.generation < 4 {
            table.unsupported(crate::ssc::SECURITY_PROTOCOL_IN);
            table.unsupported(crate::ssc::SECURITY_PROTOCOL_OUT);
        }
    }

    fn media_compatibility(&self) -> &[MediaCompat] {
        &self.media
    }

    fn densities(&self) -> &[DensityInfo] {
        &self.densities
    }

    fn set_worm(&self, pages: &mut PageRegistry) -> Result<(), SenseInfo> {
        if self.generation < 3 {
            return Err(SenseInfo::INVALID_FIELD_IN_CDB);
        }
        set_worm_bits(pages, true)
    }

    fn clear_worm(&self, pages: &mut PageRegistry) -> Result<(), SenseInfo> {
        if self.generation < 3 {
            return Ok(());
        }
        set_worm_bits(pages, false)
    }

    fn update_encryption_mode(
        &self,
        pages: &mut PageRegistry,
        encrypt: bool,
    ) -> Result<(), SenseInfo> {
        if self.generation < 4 {
            return Err(SenseInfo::INVALID_FIELD_IN_CDB);
        }
        set_vendor_encryption_bit(pages, encrypt);
        Ok(())
    }

    fn encryption_capabilities(&self) -> Result<Vec<AlgorithmCapability>, SenseInfo> {
        if self.generation < 4 {
            return Err(SenseInfo::INVALID_FIELD_IN_CDB);
        }
        Ok(vec![AlgorithmCapability {
            algorithm_index: 1,
            algorithm_code: ALGORITHM_AES_GCM_256,
            key_size: 32,
            max_ukad: 32,
            max_akad: 12,
        }])
    }

    fn kad_validation(&self, ukad_len: usize, akad_len: usize) -> Result<(), SenseInfo> {
        if self.generation < 4 {
            return Err(SenseInfo::INVALID_FIELD_IN_CDB);
        }
        if ukad_len > 32 || akad_len > 12 {
            return Err(SenseInfo::INVALID_FIELD_IN_PARAMETER_LIST);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::personality::medium_access;

    #[test]
    fn lto6_media() -> Result<(), Error> {
        let drive = Ultrium::new(UltriumVendor::Ibm, 6)?;
        let media = drive.media_compatibility();
        assert_eq!(medium_access(media, "LTO6"), MediumAccess::Encrypt);
        assert_eq!(medium_access(media, "LTO5"), MediumAccess::Encrypt);
        assert_eq!(medium_access(media, "LTO4"), MediumAccess::ReadOnly);
        assert_eq!(medium_access(media, "LTO3"), MediumAccess::Invalid);
        assert_eq!(medium_access(media, "LTO7"), MediumAccess::Fail);
        assert_eq!(medium_access(media, "LTO6 WORM"), MediumAccess::Worm);
        assert_eq!(medium_access(media, "LTO4 WORM"), MediumAccess::ReadOnly);
        assert_eq!(medium_access(media, "LTO7 CLN"), MediumAccess::ReadWrite);

        let codes: Vec<(u8, bool)> = drive
            .densities()
            .iter()
            .map(|info| (info.density_code, info.writable))
            .collect();
        assert_eq!(codes, vec![(0x46, false), (0x58, true), (0x5a, true)]);
        Ok(())
    }

    #[test]
    fn lto7_reads_m8() -> Result<(), Error> {
        let drive = Ultrium::new(UltriumVendor::Hp, 7)?;
        assert_eq!(
            medium_access(drive.media_compatibility(), "LTO8 M8"),
            MediumAccess::Encrypt
        );
        assert!(drive.densities().iter().any(|info| info.density_code == 0x5d));

        let drive = Ultrium::new(UltriumVendor::Hp, 8)?;
        assert_eq!(
            medium_access(drive.media_compatibility(), "LTO6"),
            MediumAccess::Invalid
        );
        assert_eq!(
            medium_access(drive.media_compatibility(), "LTO7"),
            MediumAccess::ReadOnly
        );
        Ok(())
    }

    #[test]
    fn old_generations() -> Result<(), Error> {
        let drive = Ultrium::new(UltriumVendor::Ibm, 2)?;
        let mut pages = PageRegistry::new();
        assert!(drive.set_worm(&mut pages).is_err());
        assert!(drive.encryption_capabilities().is_err());
        assert!(Ultrium::new(UltriumVendor::Ibm, 10).is_err());
        assert!(Ultrium::from_inquiry("IBM", "ULT3580-TDX").is_none());
        Ok(())
    }
}
