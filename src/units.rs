//! Logical units built from the device configuration

use anyhow::Error;

use proxmox_section_config::SectionConfigData;

use vtl_api_types::{DeviceType, VirtualDriveConfig, VtlOptions};
use vtl_tape::personality::lookup_personality;
use vtl_tape::smc::{DriveControl, Library, LibraryDrive};
use vtl_tape::ssc::media_store::{DirectoryRepository, MediaRepository};
use vtl_tape::ssc::TapeDrive;
use vtl_tape::unit::{Device, LogicalUnit, UnitIdentity};

/// Media images of drives without a `home` setting
pub const DEFAULT_MEDIA_HOME: &str = "/var/lib/proxmox-vtl/media";

fn descriptor_sense(options: &VtlOptions) -> bool {
    options.descriptor_sense.unwrap_or(false)
}

/// Media images stored as files below the drive's home directory
pub fn media_repository(config: &VirtualDriveConfig) -> Box<dyn MediaRepository> {
    let home = config.home.as_deref().unwrap_or(DEFAULT_MEDIA_HOME);
    Box::new(DirectoryRepository::new(home))
}

/// Create the tape drive unit with id `id`
pub fn drive_unit(
    config: &SectionConfigData,
    id: u64,
    repository: Box<dyn MediaRepository>,
) -> Result<LogicalUnit, Error> {
    let drive_config = vtl_config::lookup_drive(config, id)?;
    let options = vtl_config::options(config)?;

    let mut drive = TapeDrive::new(repository);
    drive.configure(&drive_config, Some(&options));

    let identity = UnitIdentity::from_drive_config(&drive_config)?;
    let personality = lookup_personality(
        DeviceType::SequentialAccess,
        &identity.vendor,
        &identity.product,
    );
    LogicalUnit::new(identity, personality, Device::Tape(drive), descriptor_sense(&options))
}

/// Drives listed in the library configuration, in element order
fn library_drives(config: &SectionConfigData, list: Option<&str>) -> Result<Vec<LibraryDrive>, Error> {
    let mut drives = Vec::new();
    for id in vtl_config::parse_drive_list(list)? {
        let drive = vtl_config::lookup_drive(config, id)?;
        drives.push(LibraryDrive {
            id: drive.id,
            vendor: drive.vendor,
            product: drive.product,
            serial: drive.serial,
        });
    }
    Ok(drives)
}

/// Create the library unit with id `id`
pub fn library_unit(
    config: &SectionConfigData,
    id: u64,
    control: Box<dyn DriveControl>,
) -> Result<LogicalUnit, Error> {
    let library_config = vtl_config::lookup_library(config, id)?;
    let options = vtl_config::options(config)?;

    let drives = library_drives(config, library_config.drives.as_deref())?;
    let library = Library::from_config(&library_config, drives, control)?;

    let identity = UnitIdentity::from_library_config(&library_config)?;
    let personality = lookup_personality(
        DeviceType::MediumChanger,
        &identity.vendor,
        &identity.product,
    );
    LogicalUnit::new(identity, personality, Device::Changer(library), descriptor_sense(&options))
}

/// Re-apply the configuration to a running unit
///
/// Identity, personality and drive settings follow the new
/// configuration. Loaded media and the slot map are kept.
pub fn reconfigure(unit: &mut LogicalUnit, config: &SectionConfigData) -> Result<(), Error> {
    let options = vtl_config::options(config)?;
    let id = unit.identity.id;

    // drive settings in effect before, restored when the rebuild fails
    let mut previous_settings = None;

    let identity = match unit.device_type() {
        DeviceType::SequentialAccess => {
            let drive_config = vtl_config::lookup_drive(config, id)?;
            let identity = UnitIdentity::from_drive_config(&drive_config)?;
            // the page rebuild reads the new power-on compression state
            previous_settings = Some(unit.tape_drive()?.configure(&drive_config, Some(&options)));
            identity
        }
        DeviceType::MediumChanger => {
            let library_config = vtl_config::lookup_library(config, id)?;
            if library_config.storage_slots as usize
                != unit.library()?.element_count(vtl_tape::smc::ElementType::Storage)
            {
                log::warn!("unit {}: slot count changes need a restart", id);
            }
            UnitIdentity::from_library_config(&library_config)?
        }
    };

    let personality = lookup_personality(unit.device_type(), &identity.vendor, &identity.product);
    let result = unit.reconfigure(identity, personality, descriptor_sense(&options));
    if result.is_err() {
        if let Some(settings) = previous_settings {
            unit.tape_drive()?.apply_settings(settings);
        }
    }
    result
}

#[cfg(test)]
mod test {
    use super::*;

    use vtl_tape::ssc::format_medium;
    use vtl_tape::ssc::mam::MediumKind;
    use vtl_tape::ssc::media_store::{MemoryRepository, MemoryStore};

    const CONFIG: &str = "\
library: stk
	id 10
	vendor STK
	product L700
	serial XYZZY_A
	drives 11
	storage-slots 8

drive: tape0
	id 11
	vendor IBM
	product ULT3580-TD6
	serial XYZZY_A1
	library 10
";

    struct NoDrives;

    impl DriveControl for NoDrives {
        fn load(&mut self, drive: u64, _barcode: &str) -> Result<(), Error> {
            anyhow::bail!("no drive {}", drive)
        }

        fn unload(&mut self, drive: u64) -> Result<(), Error> {
            anyhow::bail!("no drive {}", drive)
        }
    }

    #[test]
    fn build_units() -> Result<(), Error> {
        let (config, _) = vtl_config::parse_config("device.cfg", CONFIG)?;

        let mut drive = drive_unit(&config, 11, Box::new(MemoryRepository::new()))?;
        assert_eq!(drive.personality().name(), "IBM Ultrium 6");
        assert!(drive.tape_drive()?.medium().is_none());

        let mut library = library_unit(&config, 10, Box::new(NoDrives))?;
        assert_eq!(library.personality().name(), "StorageTek L-series");
        let library = library.library()?;
        assert_eq!(library.drives().len(), 1);
        assert_eq!(library.drives()[0].serial, "XYZZY_A1");

        assert!(drive_unit(&config, 12, Box::new(MemoryRepository::new())).is_err());
        assert!(library_unit(&config, 11, Box::new(NoDrives)).is_err());
        Ok(())
    }

    #[test]
    fn reconfigure_drive() -> Result<(), Error> {
        let (config, _) = vtl_config::parse_config("device.cfg", CONFIG)?;
        let mut unit = drive_unit(&config, 11, Box::new(MemoryRepository::new()))?;

        let changed = CONFIG.replace("ULT3580-TD6", "ULT3580-TD8");
        let (config, _) = vtl_config::parse_config("device.cfg", &changed)?;
        reconfigure(&mut unit, &config)?;
        assert_eq!(unit.identity.product, "ULT3580-TD8");
        assert_eq!(unit.personality().name(), "IBM Ultrium 8");

        // a missing section keeps the running configuration
        let (config, _) = vtl_config::parse_config("device.cfg", "")?;
        assert!(reconfigure(&mut unit, &config).is_err());
        assert_eq!(unit.identity.product, "ULT3580-TD8");
        Ok(())
    }

    #[test]
    fn failed_reload_keeps_drive_settings() -> Result<(), Error> {
        let (config, _) = vtl_config::parse_config("device.cfg", CONFIG)?;

        let repository = MemoryRepository::new();
        let store = MemoryStore::new();
        format_medium(Box::new(store.clone()), "E01002L6", "LTO6", MediumKind::Worm, 0x5a, 1 << 30)?;
        repository.insert("E01002L6", store);

        let mut unit = drive_unit(&config, 11, Box::new(repository))?;
        unit.load_medium("E01002L6")?;
        let settings = unit.tape_drive()?.settings();

        // a generic drive has no WORM support for the loaded cartridge
        let changed = CONFIG
            .replace("vendor IBM", "vendor ACME")
            .replace("ULT3580-TD6", "VT-1\n\tcompression false\n\tcompression-level 3");
        let (config, _) = vtl_config::parse_config("device.cfg", &changed)?;
        assert_eq!(
            vtl_config::lookup_drive(&config, 11)?.compression_level,
            Some(3)
        );

        assert!(reconfigure(&mut unit, &config).is_err());
        assert_eq!(unit.tape_drive()?.settings(), settings);
        assert_eq!(unit.identity.vendor, "IBM");
        assert_eq!(unit.personality().name(), "IBM Ultrium 6");
        Ok(())
    }
}
