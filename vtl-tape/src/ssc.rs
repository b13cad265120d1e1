//! Sequential access device (SSC) emulation

use std::time::{Duration, Instant};

use anyhow::{format_err, Error};

use vtl_api_types::{DeviceActivity, DeviceType, VirtualDriveConfig, VtlOptions};

use crate::dispatch::DispatchTable;
use crate::pages::{PageKind, PageRegistry};
use crate::personality::{medium_access, MediumAccess, Personality};
use crate::sense::{ScsiError, SenseInfo};
use crate::spc::{self, ModeBlockDescriptor};
use crate::unit::{Device, LogicalUnit, UnitIdentity};

pub mod encryption;
pub mod log_pages;
pub mod mam;
pub mod media_store;
pub mod mode_pages;
pub mod report_density;
pub mod tape_alert_flags;
pub mod tape_image;

mod commands;

use encryption::EncryptionState;
use log_pages::{encode_log_page, DriveCounters, LogSnapshot, TAPE_LOG_PAGES};
use mam::{MediumAuxMemory, MediumKind};
use media_store::{MediaRepository, MediaStore};
use mode_pages::{compression_enabled, init_tape_mode_pages, TapeModeOptions};
use tape_alert_flags::TapeAlertFlags;
use tape_image::TapeImage;

pub const SECURITY_PROTOCOL_IN: u8 = 0xa2;
pub const SECURITY_PROTOCOL_OUT: u8 = 0xb5;

/// zlib level used when none is configured
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

/// Vital product data pages of a tape drive
pub fn init_drive_pages(
    identity: &UnitIdentity,
    pages: &mut PageRegistry,
    options: &TapeModeOptions,
) -> Result<(), Error> {
    init_tape_mode_pages(pages, options)?;

    let counters = DriveCounters::default();
    let snapshot = LogSnapshot {
        counters: &counters,
        mam: None,
        remaining_capacity: 0,
        tape_alert: TapeAlertFlags::empty(),
        activity: DeviceActivity::NoActivity,
        compression: options.compression,
        write_protect: false,
        cleaning_requested: false,
    };
    for code in TAPE_LOG_PAGES {
        if let Some(data) = encode_log_page(*code, &snapshot)? {
            pages.add(PageKind::Log, *code, 0, &data)?;
        }
    }

    let device_type = DeviceType::SequentialAccess;
    spc::init_vpd_pages(identity, pages, device_type)?;

    // sequential access device capabilities
    spc::add_vpd_page(pages, device_type, 0xb0, &[options.worm as u8, 0])?;

    // manufacturer assigned serial number
    spc::add_vpd_page(pages, device_type, 0xb1, &crate::scsi_ascii(&identity.serial, 12))?;

    // TapeAlert supported flags
    let mut body = vec![0u8; 4];
    body.extend(TapeAlertFlags::all().bits().to_be_bytes());
    spc::add_vpd_page(pages, device_type, 0xb2, &body)?;

    // firmware build information
    let mut body = crate::scsi_ascii(&identity.revision, 4);
    body.extend(crate::scsi_ascii("20210101", 8));
    spc::add_vpd_page(pages, device_type, 0xc0, &body)?;

    // manufacturer and reported serial numbers
    let mut body = crate::scsi_ascii(&identity.serial, 12);
    body.extend(crate::scsi_ascii(&identity.serial, 12));
    spc::add_vpd_page(pages, device_type, 0xc1, &body)?;

    Ok(())
}

pub fn register_commands(table: &mut DispatchTable) {
    commands::register(table);
}

/// Create an empty tape image
pub fn format_medium(
    store: Box<dyn MediaStore>,
    barcode: &str,
    medium_name: &str,
    medium_kind: MediumKind,
    density_code: u8,
    capacity: u64,
) -> Result<(), Error> {
    let mam = MediumAuxMemory::new(barcode, medium_name, medium_kind, density_code, capacity)?;
    let image = TapeImage::format(store, mam)?;
    image.close()?;
    Ok(())
}

/// Cartridge in the drive
pub struct LoadedMedium {
    pub barcode: String,
    pub access: MediumAccess,
    pub image: TapeImage,
}

impl LoadedMedium {
    pub fn is_write_protected(&self) -> bool {
        !self.access.writable() || self.image.is_write_protected()
    }
}

/// Drive settings from the device configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DriveSettings {
    pub compression_level: u32,
    /// Compression state after power on, `None` keeps the page default
    pub power_on_compression: Option<bool>,
    pub cleaning_time: Option<Duration>,
    pub library: Option<u64>,
}

impl DriveSettings {
    pub fn from_config(config: &VirtualDriveConfig, options: Option<&VtlOptions>) -> Self {
        Self {
            compression_level: config
                .compression_level
                .map(|level| level.clamp(1, 9) as u32)
                .unwrap_or(DEFAULT_COMPRESSION_LEVEL),
            power_on_compression: config.compression,
            cleaning_time: options
                .and_then(|options| options.cleaning_time)
                .map(Duration::from_secs),
            library: config.library,
        }
    }
}

/// Tape drive state next to the generic unit state
pub struct TapeDrive {
    repository: Box<dyn MediaRepository>,
    medium: Option<LoadedMedium>,
    /// Fixed block length, 0 in variable block mode
    pub block_size: u32,
    compression_level: u32,
    power_on_compression: Option<bool>,
    pub encryption: EncryptionState,
    pub tape_alert: TapeAlertFlags,
    cleaning_until: Option<Instant>,
    cleaning_time: Option<Duration>,
    pub prevent_removal: bool,
    pub counters: DriveCounters,
    pub activity: DeviceActivity,
    /// Library the drive is installed in
    pub library: Option<u64>,
}

impl TapeDrive {
    pub fn new(repository: Box<dyn MediaRepository>) -> Self {
        Self {
            repository,
            medium: None,
            block_size: 0,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            power_on_compression: None,
            encryption: EncryptionState::default(),
            tape_alert: TapeAlertFlags::empty(),
            cleaning_until: None,
            cleaning_time: None,
            prevent_removal: false,
            counters: DriveCounters::default(),
            activity: DeviceActivity::NoActivity,
            library: None,
        }
    }

    /// Take over the configurable drive settings
    ///
    /// Returns the settings in effect before.
    pub fn configure(
        &mut self,
        config: &VirtualDriveConfig,
        options: Option<&VtlOptions>,
    ) -> DriveSettings {
        let previous = self.settings();
        self.apply_settings(DriveSettings::from_config(config, options));
        previous
    }

    pub fn settings(&self) -> DriveSettings {
        DriveSettings {
            compression_level: self.compression_level,
            power_on_compression: self.power_on_compression,
            cleaning_time: self.cleaning_time,
            library: self.library,
        }
    }

    pub fn apply_settings(&mut self, settings: DriveSettings) {
        self.compression_level = settings.compression_level;
        self.power_on_compression = settings.power_on_compression;
        self.cleaning_time = settings.cleaning_time;
        self.library = settings.library;
    }

    /// Apply drive state to freshly initialized pages
    pub fn init_pages(
        &mut self,
        personality: &dyn Personality,
        pages: &mut PageRegistry,
    ) -> Result<(), Error> {
        if let Some(enable) = self.power_on_compression {
            let result = if enable {
                personality.set_compression(pages)
            } else {
                personality.clear_compression(pages)
            };
            result.map_err(|sense| format_err!("unable to set compression - {}", sense))?;
        }

        if let Some(ref medium) = self.medium {
            if medium.image.mam().medium_kind == MediumKind::Worm {
                personality
                    .set_worm(pages)
                    .map_err(|sense| format_err!("unable to set WORM mode - {}", sense))?;
            }
        }

        if self.encryption.encrypt {
            hook_supported(personality.update_encryption_mode(pages, true))
                .map_err(|sense| format_err!("unable to restore encryption mode - {}", sense))?;
        }

        Ok(())
    }

    pub fn medium(&self) -> Option<&LoadedMedium> {
        self.medium.as_ref()
    }

    pub fn medium_mut(&mut self) -> Option<&mut LoadedMedium> {
        self.medium.as_mut()
    }

    pub fn compression_level(&self) -> u32 {
        self.compression_level
    }

    /// Finish a cleaning cycle once its deadline has passed
    pub fn poll_cleaning(&mut self) {
        if let Some(deadline) = self.cleaning_until {
            if Instant::now() >= deadline {
                log::info!("cleaning cycle finished");
                self.cleaning_until = None;
                self.tape_alert
                    .remove(TapeAlertFlags::CLEAN_NOW | TapeAlertFlags::CLEAN_PERIODIC);
                self.activity = DeviceActivity::NoActivity;
            }
        }
    }

    pub fn is_cleaning(&self) -> bool {
        self.cleaning_until.is_some()
    }

    /// Loaded data cartridge, ready for media access
    pub fn ready(&mut self) -> Result<&mut LoadedMedium, ScsiError> {
        self.poll_cleaning();
        match self.medium.as_mut() {
            None => Err(SenseInfo::MEDIUM_NOT_PRESENT.into()),
            Some(medium) if medium.image.mam().medium_kind == MediumKind::Cleaning => {
                Err(SenseInfo::CLEANING_CARTRIDGE_INSTALLED.into())
            }
            Some(medium) => Ok(medium),
        }
    }

    /// Device specific parameter of the mode parameter header
    pub fn mode_device_specific(&self) -> u8 {
        let mut value = 0x10; // buffered mode 1
        if matches!(self.medium, Some(ref medium) if medium.is_write_protected()) {
            value |= 0x80;
        }
        value
    }

    pub fn block_descriptor(&self) -> ModeBlockDescriptor {
        let density_code = self
            .medium
            .as_ref()
            .map(|medium| medium.image.mam().density_code)
            .unwrap_or(0);
        let mut descriptor = ModeBlockDescriptor::new(density_code);
        descriptor.set_block_length(self.block_size);
        descriptor
    }

    /// MODE SELECT block descriptor: switch fixed/variable block mode
    pub fn apply_block_descriptor(
        &mut self,
        descriptor: &ModeBlockDescriptor,
        max_block_size: u32,
    ) -> Result<(), SenseInfo> {
        let length = descriptor.block_length();
        if length > max_block_size {
            return Err(SenseInfo::INVALID_FIELD_IN_PARAMETER_LIST);
        }
        if length != self.block_size {
            log::info!("block size set to {}", length);
        }
        self.block_size = length;
        Ok(())
    }

    /// Rebuild a log page from the live counters
    pub fn refresh_log_page(&self, page_code: u8, pages: &mut PageRegistry) -> Result<(), Error> {
        let (mam, remaining_capacity, write_protect) = match self.medium {
            Some(ref medium) => (
                Some(medium.image.mam()),
                medium.image.remaining_capacity()?,
                medium.is_write_protected(),
            ),
            None => (None, 0, false),
        };

        let snapshot = LogSnapshot {
            counters: &self.counters,
            mam,
            remaining_capacity,
            tape_alert: self.tape_alert,
            activity: self.activity,
            compression: compression_enabled(pages),
            write_protect,
            cleaning_requested: self.tape_alert.wants_cleaning(),
        };

        if let Some(data) = encode_log_page(page_code, &snapshot)? {
            if let Some(page) = pages.lookup_mut(PageKind::Log, page_code, 0) {
                page.set_data(&data);
            }
        }
        Ok(())
    }

    /// LOG SELECT with PCR
    pub fn reset_counters(&mut self) {
        self.counters = DriveCounters::default();
    }
}

fn drive_parts(unit: &mut LogicalUnit) -> Result<(&mut TapeDrive, &mut PageRegistry), ScsiError> {
    match unit.device {
        Device::Tape(ref mut drive) => Ok((drive, &mut unit.pages)),
        Device::Changer(_) => {
            Err(format_err!("unit {} is not a tape drive", unit.identity.id).into())
        }
    }
}

/// Personality hooks fail with INVALID FIELD IN CDB when the device
/// model lacks the vendor page, everything else is a real error
fn hook_supported(result: Result<(), SenseInfo>) -> Result<(), SenseInfo> {
    match result {
        Err(sense) if sense == SenseInfo::INVALID_FIELD_IN_CDB => Ok(()),
        result => result,
    }
}

impl LogicalUnit {
    /// Put a cartridge into the drive
    ///
    /// The medium is checked against the compatibility table of the
    /// personality. Incompatible media are refused with INCOMPATIBLE
    /// MEDIUM and raise a TapeAlert flag.
    pub fn load_medium(&mut self, barcode: &str) -> Result<(), ScsiError> {
        let personality = self.personality();
        let (drive, pages) = drive_parts(self)?;

        if let Some(ref medium) = drive.medium {
            return Err(format_err!(
                "drive already holds medium '{}', cannot load '{}'",
                medium.barcode,
                barcode
            )
            .into());
        }

        drive.activity = DeviceActivity::Loading;
        let store = drive.repository.open(barcode).map_err(|err| {
            log::error!("unable to open media '{}' - {}", barcode, err);
            drive.activity = DeviceActivity::NoActivity;
            ScsiError::from(SenseInfo::MEDIA_LOAD_EJECT_FAILED)
        })?;
        let mut image = TapeImage::open(store).map_err(|err| {
            log::error!("unable to load media '{}' - {}", barcode, err);
            drive.activity = DeviceActivity::NoActivity;
            drive.tape_alert |= TapeAlertFlags::LOADING_FAILURE;
            ScsiError::from(SenseInfo::MEDIUM_FORMAT_CORRUPTED)
        })?;

        let medium_name = image.mam().medium_name.clone();
        let access = medium_access(personality.media_compatibility(), &medium_name);
        match access {
            MediumAccess::Invalid => {
                log::warn!("media '{}' ({}) has an unsupported format", barcode, medium_name);
                drive.activity = DeviceActivity::NoActivity;
                drive.tape_alert |= TapeAlertFlags::UNSUPPORTED_FORMAT;
                return Err(SenseInfo::INCOMPATIBLE_MEDIUM.into());
            }
            MediumAccess::Fail => {
                log::warn!("media '{}' ({}) fails to load", barcode, medium_name);
                drive.activity = DeviceActivity::NoActivity;
                drive.tape_alert |= TapeAlertFlags::LOADING_FAILURE;
                return Err(SenseInfo::INCOMPATIBLE_MEDIUM.into());
            }
            _ => {}
        }

        let mam = image.mam_mut();
        mam.load_count += 1;
        mam.last_bytes_read = 0;
        mam.last_bytes_written = 0;
        let medium_kind = mam.medium_kind;
        if let Err(err) = image.flush_mam() {
            log::warn!("unable to update cartridge memory of '{}' - {}", barcode, err);
        }

        drive.counters.volume_loads += 1;
        drive.activity = DeviceActivity::NoActivity;

        match medium_kind {
            MediumKind::Cleaning => {
                let duration = drive
                    .cleaning_time
                    .unwrap_or_else(|| personality.cleaning_duration());
                drive.cleaning_until = Some(Instant::now() + duration);
                drive.counters.cleaning_operations += 1;
                drive.activity = DeviceActivity::Cleaning;
                log::info!("cleaning cartridge '{}' loaded, cleaning for {:?}", barcode, duration);
            }
            MediumKind::Worm => {
                if let Err(sense) = personality.set_worm(pages) {
                    log::warn!("drive does not support WORM mode - {}", sense);
                }
            }
            MediumKind::Data => {
                if let Err(sense) = hook_supported(personality.clear_worm(pages)) {
                    log::error!("unable to leave WORM mode for '{}' - {}", barcode, sense);
                    drive.tape_alert |= TapeAlertFlags::LOADING_FAILURE;
                    return Err(sense.into());
                }
            }
        }

        log::info!("loaded media '{}' ({}, {:?})", barcode, medium_name, access);

        drive.medium = Some(LoadedMedium {
            barcode: barcode.to_string(),
            access,
            image,
        });

        self.add_unit_attention(SenseInfo::NOT_READY_TO_READY_CHANGE);
        Ok(())
    }

    /// Eject the cartridge, storing its cartridge memory
    ///
    /// Returns the barcode of the ejected medium (if there was one).
    pub fn unload_medium(&mut self) -> Result<Option<String>, ScsiError> {
        let personality = self.personality();
        let (drive, pages) = drive_parts(self)?;

        let medium = match drive.medium.take() {
            Some(medium) => medium,
            None => return Ok(None),
        };

        drive.activity = DeviceActivity::Unloading;
        drive.cleaning_until = None;
        let worm_cleared = if medium.image.mam().medium_kind == MediumKind::Worm {
            hook_supported(personality.clear_worm(pages))
        } else {
            Ok(())
        };

        let barcode = medium.barcode;
        let result = medium.image.close();
        drive.activity = DeviceActivity::NoActivity;
        if let Err(err) = result {
            log::error!("unable to store cartridge memory of '{}' - {}", barcode, err);
            drive.tape_alert |= TapeAlertFlags::UNRECOVERABLE_UNLOAD_FAILURE;
            return Err(SenseInfo::MEDIA_LOAD_EJECT_FAILED.into());
        }
        worm_cleared?;

        log::info!("unloaded media '{}'", barcode);
        Ok(Some(barcode))
    }
}
