use anyhow::Error;

use vtl_api_types::DeviceType;

use crate::pages::PageRegistry;
use crate::smc::ElementAddresses;
use crate::unit::UnitIdentity;

use super::Personality;

/// SCSI-3 medium changer with default element addresses
pub struct GenericLibrary;

impl Personality for GenericLibrary {
    fn name(&self) -> String {
        String::from("generic SMC")
    }

    fn device_type(&self) -> DeviceType {
        DeviceType::MediumChanger
    }

    fn init_pages(&self, identity: &UnitIdentity, pages: &mut PageRegistry) -> Result<(), Error> {
        crate::smc::init_library_pages(identity, pages)
    }
}

/// StorageTek L-series (L20 up to L700, SL500)
pub struct StkLibrary;

impl Personality for StkLibrary {
    fn name(&self) -> String {
        String::from("StorageTek L-series")
    }

    fn device_type(&self) -> DeviceType {
        DeviceType::MediumChanger
    }

    fn init_pages(&self, identity: &UnitIdentity, pages: &mut PageRegistry) -> Result<(), Error> {
        crate::smc::init_library_pages(identity, pages)
    }

    fn inquiry_vendor_specific(&self) -> Option<Vec<u8>> {
        let mut data = vec![0u8; 20];
        data[0] = 0x01; // barcode reader installed
        data[1] = 0x02; // SCSI-3 element addressing
        data[4..12].copy_from_slice(&crate::scsi_ascii("L-SERIES", 8));
        Some(data)
    }
}

/// IBM TS3500 (03584) style library
///
/// Uses the IBM element address layout: drives from 0101h, the I/O
/// station from 0300h and storage slots from 0401h.
pub struct Ts3500Library;

impl Personality for Ts3500Library {
    fn name(&self) -> String {
        String::from("IBM TS3500")
    }

    fn device_type(&self) -> DeviceType {
        DeviceType::MediumChanger
    }

    fn init_pages(&self, identity: &UnitIdentity, pages: &mut PageRegistry) -> Result<(), Error> {
        crate::smc::init_library_pages(identity, pages)
    }

    fn element_addresses(&self) -> ElementAddresses {
        ElementAddresses {
            transport: 0x0001,
            import_export: 0x0300,
            data_transfer: 0x0101,
            storage: 0x0401,
        }
    }
}
