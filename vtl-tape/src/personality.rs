//! Device personalities (vendor and model specific behavior)
//!
//! Each logical unit is bound to exactly one [Personality]. Command
//! handlers call through the trait instead of checking vendor and
//! product strings. Optional capabilities have default
//! implementations, which either do the generic thing or report
//! ILLEGAL REQUEST.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Error;

use vtl_api_types::DeviceType;

use crate::dispatch::DispatchTable;
use crate::pages::PageRegistry;
use crate::sense::SenseInfo;
use crate::smc::ElementAddresses;
use crate::ssc::encryption::AlgorithmCapability;
use crate::ssc::mode_pages::set_compression_bits;
use crate::ssc::report_density::DensityInfo;
use crate::unit::UnitIdentity;

mod library;
pub use library::*;

mod t10000;
pub use t10000::*;

mod ultrium;
pub use ultrium::*;

/// T10 version descriptors
pub const VERSION_SAM3: u16 = 0x0060;
pub const VERSION_SPC3: u16 = 0x0300;
pub const VERSION_SSC3: u16 = 0x0400;
pub const VERSION_SMC3: u16 = 0x0480;

/// What a drive does with a medium when it is loaded
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MediumAccess {
    ReadWrite,
    ReadOnly,
    /// Write once, appending at end of data only
    Worm,
    /// Read-write and able to hold encrypted data
    Encrypt,
    /// Drive rejects the format
    Invalid,
    /// Cartridge does not even load
    Fail,
}

impl MediumAccess {
    pub fn loadable(self) -> bool {
        !matches!(self, MediumAccess::Invalid | MediumAccess::Fail)
    }

    pub fn writable(self) -> bool {
        matches!(
            self,
            MediumAccess::ReadWrite | MediumAccess::Worm | MediumAccess::Encrypt
        )
    }
}

/// One entry of the media compatibility table
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MediaCompat {
    /// Medium name as stored in the cartridge memory (e.g. "LTO6 WORM")
    pub medium: &'static str,
    pub density: u8,
    pub access: MediumAccess,
}

/// Look up a medium by name
///
/// An empty table accepts every medium read-write.
pub fn medium_access(table: &[MediaCompat], medium: &str) -> MediumAccess {
    if table.is_empty() {
        return MediumAccess::ReadWrite;
    }
    table
        .iter()
        .find(|compat| compat.medium.eq_ignore_ascii_case(medium))
        .map(|compat| compat.access)
        .unwrap_or(MediumAccess::Invalid)
}

/// Vendor and model specific capabilities of a logical unit
pub trait Personality: Send + Sync {
    /// Human readable family name, used in log messages
    fn name(&self) -> String;

    fn device_type(&self) -> DeviceType;

    /// Register all mode, log and VPD pages
    fn init_pages(&self, identity: &UnitIdentity, pages: &mut PageRegistry) -> Result<(), Error>;

    /// Overlay model specific entries onto the device class table
    fn customize_dispatch(&self, _table: &mut DispatchTable) {}

    /// INQUIRY bytes 36..56
    fn inquiry_vendor_specific(&self) -> Option<Vec<u8>> {
        None
    }

    fn version_descriptors(&self) -> Vec<u16> {
        match self.device_type() {
            DeviceType::SequentialAccess => vec![VERSION_SAM3, VERSION_SPC3, VERSION_SSC3],
            DeviceType::MediumChanger => vec![VERSION_SAM3, VERSION_SPC3, VERSION_SMC3],
        }
    }

    fn media_compatibility(&self) -> &[MediaCompat] {
        &[]
    }

    /// Densities for REPORT DENSITY SUPPORT
    fn densities(&self) -> &[DensityInfo] {
        &[]
    }

    fn set_compression(&self, pages: &mut PageRegistry) -> Result<(), SenseInfo> {
        set_compression_bits(pages, true)
    }

    fn clear_compression(&self, pages: &mut PageRegistry) -> Result<(), SenseInfo> {
        set_compression_bits(pages, false)
    }

    /// Switch the medium configuration page into WORM mode
    fn set_worm(&self, _pages: &mut PageRegistry) -> Result<(), SenseInfo> {
        Err(SenseInfo::INVALID_FIELD_IN_CDB)
    }

    fn clear_worm(&self, _pages: &mut PageRegistry) -> Result<(), SenseInfo> {
        Ok(())
    }

    /// Reflect a new encryption mode in vendor pages
    fn update_encryption_mode(
        &self,
        _pages: &mut PageRegistry,
        _encrypt: bool,
    ) -> Result<(), SenseInfo> {
        Err(SenseInfo::INVALID_FIELD_IN_CDB)
    }

    fn encryption_capabilities(&self) -> Result<Vec<AlgorithmCapability>, SenseInfo> {
        Err(SenseInfo::INVALID_FIELD_IN_CDB)
    }

    /// Check key associated data lengths of a Set Data Encryption page
    fn kad_validation(&self, _ukad_len: usize, _akad_len: usize) -> Result<(), SenseInfo> {
        Err(SenseInfo::INVALID_FIELD_IN_PARAMETER_LIST)
    }

    /// How long a cleaning cartridge keeps the drive busy
    fn cleaning_duration(&self) -> Duration {
        Duration::from_secs(30)
    }

    fn max_block_size(&self) -> u32 {
        0x80_0000
    }

    /// Early warning zone in bytes, for a medium with `capacity` bytes
    fn early_warning_size(&self, capacity: u64) -> u64 {
        capacity / 100
    }

    /// Element address ranges (medium changers only)
    fn element_addresses(&self) -> ElementAddresses {
        ElementAddresses::default()
    }
}

/// Generic sequential access device without WORM or encryption
pub struct GenericTape;

impl Personality for GenericTape {
    fn name(&self) -> String {
        String::from("generic SSC")
    }

    fn device_type(&self) -> DeviceType {
        DeviceType::SequentialAccess
    }

    fn init_pages(&self, identity: &UnitIdentity, pages: &mut PageRegistry) -> Result<(), Error> {
        let options = crate::ssc::mode_pages::TapeModeOptions {
            compression: true,
            worm: false,
            vendor_encryption: false,
            prog_early_warning_mb: 0,
        };
        crate::ssc::init_drive_pages(identity, pages, &options)
    }

    fn customize_dispatch(&self, table: &mut DispatchTable) {
        table.unsupported(crate::ssc::SECURITY_PROTOCOL_IN);
        table.unsupported(crate::ssc::SECURITY_PROTOCOL_OUT);
    }
}

/// Select the personality for a vendor/product pair
pub fn lookup_personality(
    device_type: DeviceType,
    vendor: &str,
    product: &str,
) -> Arc<dyn Personality> {
    let vendor = vendor.trim();
    let product = product.trim();

    let personality: Arc<dyn Personality> = match device_type {
        DeviceType::SequentialAccess => {
            if let Some(ultrium) = Ultrium::from_inquiry(vendor, product) {
                Arc::new(ultrium)
            } else if let Some(t10000) = T10000::from_inquiry(vendor, product) {
                Arc::new(t10000)
            } else {
                Arc::new(GenericTape)
            }
        }
        DeviceType::MediumChanger => {
            if vendor.eq_ignore_ascii_case("STK") && product.starts_with(['L', 'S']) {
                Arc::new(StkLibrary)
            } else if vendor.eq_ignore_ascii_case("IBM") && product.starts_with("03584") {
                Arc::new(Ts3500Library)
            } else {
                Arc::new(GenericLibrary)
            }
        }
    };

    log::debug!(
        "using personality '{}' for '{}' '{}'",
        personality.name(),
        vendor,
        product
    );

    personality
}
