//! Medium changer (SMC) emulation
//!
//! The library only keeps the slot map. Drives are units of their own,
//! cartridges are moved in and out of them through a [DriveControl].

use std::path::PathBuf;

use anyhow::{bail, format_err, Error};
use endian_trait::Endian;
use serde::{Deserialize, Serialize};

use proxmox_io::WriteExt;
use proxmox_sys::fs::{file_get_json, replace_file, CreateOptions};

use vtl_api_types::{DeviceType, VirtualLibraryConfig};

use crate::dispatch::DispatchTable;
use crate::pages::{PageKind, PageRegistry};
use crate::personality::Personality;
use crate::sense::SenseInfo;
use crate::spc;
use crate::ssc::log_pages::LP_TAPE_ALERT;
use crate::ssc::tape_alert_flags::{tape_alert_log_page, TapeAlertFlags};
use crate::unit::UnitIdentity;

mod commands;
pub mod element_status;

pub const MP_ELEMENT_ADDRESS_ASSIGNMENT: u8 = 0x1d;
pub const MP_TRANSPORT_GEOMETRY: u8 = 0x1e;
pub const MP_DEVICE_CAPABILITIES: u8 = 0x1f;

/// Import/export slots of a library without `map-slots` setting
pub const DEFAULT_MAP_SLOTS: u64 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    /// Robot/Gripper
    Transport,
    Storage,
    /// Mail slot
    ImportExport,
    /// Tape drive
    DataTransfer,
}

const ELEMENT_TYPES: [ElementType; 4] = [
    ElementType::Transport,
    ElementType::Storage,
    ElementType::ImportExport,
    ElementType::DataTransfer,
];

impl ElementType {
    /// Element type code as used in READ ELEMENT STATUS
    pub fn code(self) -> u8 {
        match self {
            ElementType::Transport => 1,
            ElementType::Storage => 2,
            ElementType::ImportExport => 3,
            ElementType::DataTransfer => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        ELEMENT_TYPES.iter().copied().find(|t| t.code() == code)
    }
}

/// First element address of each element type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementAddresses {
    pub transport: u16,
    pub import_export: u16,
    pub data_transfer: u16,
    pub storage: u16,
}

impl Default for ElementAddresses {
    fn default() -> Self {
        Self {
            transport: 0x0001,
            import_export: 0x0010,
            data_transfer: 0x01f4,
            storage: 0x03e8,
        }
    }
}

impl ElementAddresses {
    pub fn first(&self, element_type: ElementType) -> u16 {
        match element_type {
            ElementType::Transport => self.transport,
            ElementType::Storage => self.storage,
            ElementType::ImportExport => self.import_export,
            ElementType::DataTransfer => self.data_transfer,
        }
    }
}

/// Element by type and position within the type (0 based)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementId {
    pub element_type: ElementType,
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Cartridge {
    pub barcode: String,
    /// Element address the transport took the cartridge from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<u16>,
}

impl Cartridge {
    pub fn new(barcode: &str) -> Self {
        Self {
            barcode: barcode.to_string(),
            source: None,
        }
    }
}

/// Tape drive served by the library
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryDrive {
    /// Message bus address of the drive unit
    pub id: u64,
    pub vendor: String,
    pub product: String,
    pub serial: String,
}

/// Load and unload requests sent to the drive units
pub trait DriveControl: Send {
    /// Put cartridge `barcode` into drive `drive`
    fn load(&mut self, drive: u64, barcode: &str) -> Result<(), Error>;

    /// Take the cartridge out of drive `drive`
    fn unload(&mut self, drive: u64) -> Result<(), Error>;
}

#[derive(Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct LibraryContents {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    transport: Option<Cartridge>,
    #[serde(default)]
    storage: Vec<Option<Cartridge>>,
    #[serde(default)]
    import_export: Vec<Option<Cartridge>>,
    #[serde(default)]
    drives: Vec<Option<Cartridge>>,
}

fn restore_elements(elements: &mut [Option<Cartridge>], saved: Vec<Option<Cartridge>>, what: &str) {
    for (index, cartridge) in saved.into_iter().enumerate() {
        match elements.get_mut(index) {
            Some(element) => *element = cartridge,
            None => {
                if let Some(cartridge) = cartridge {
                    log::warn!(
                        "dropping cartridge '{}' from {} element {} (not configured)",
                        cartridge.barcode,
                        what,
                        index
                    );
                }
            }
        }
    }
}

#[repr(C, packed)]
#[derive(Endian)]
struct AddressAssignmentPage {
    page_code: u8,
    additional_page_len: u8,
    first_transport_element_address: u16,
    transport_element_count: u16,
    first_storage_element_address: u16,
    storage_element_count: u16,
    first_import_export_element_address: u16,
    import_export_element_count: u16,
    first_transfer_element_address: u16,
    transfer_element_count: u16,
    reserved18: u8,
    reserved19: u8,
}

/// Transport geometry (1Eh) and device capabilities (1Fh), log and VPD pages
pub fn init_library_pages(identity: &UnitIdentity, pages: &mut PageRegistry) -> Result<(), Error> {
    let data = [MP_TRANSPORT_GEOMETRY, 0x02, 0x00, 0x00];
    let page = pages.add(PageKind::Mode, MP_TRANSPORT_GEOMETRY, 0, &data)?;
    page.set_changeable(&[0u8; 4])?;

    let mut data = vec![0u8; 20];
    data[0] = MP_DEVICE_CAPABILITIES;
    data[1] = 0x12;
    data[2] = 0x0f; // StorDT, StorI/E, StorST, StorMT
    // MT, ST, I/E and DT may move to ST, I/E and DT
    data[4..8].copy_from_slice(&[0x0e; 4]);
    let page = pages.add(PageKind::Mode, MP_DEVICE_CAPABILITIES, 0, &data)?;
    page.set_changeable(&[0u8; 20])?;

    let data = tape_alert_log_page(TapeAlertFlags::empty())?;
    pages.add(PageKind::Log, LP_TAPE_ALERT, 0, &data)?;

    spc::init_vpd_pages(identity, pages, DeviceType::MediumChanger)
}

pub fn register_commands(table: &mut DispatchTable) {
    commands::register(table);
}

/// Library state next to the generic unit state
pub struct Library {
    addresses: ElementAddresses,
    transport: Option<Cartridge>,
    storage: Vec<Option<Cartridge>>,
    import_export: Vec<Option<Cartridge>>,
    drives: Vec<LibraryDrive>,
    loaded: Vec<Option<Cartridge>>,
    /// Door of the import/export station
    pub map_open: bool,
    pub prevent_removal: bool,
    pub tape_alert: TapeAlertFlags,
    contents_path: Option<PathBuf>,
    control: Box<dyn DriveControl>,
}

impl Library {
    pub fn new(
        storage_slots: usize,
        map_slots: usize,
        drives: Vec<LibraryDrive>,
        control: Box<dyn DriveControl>,
    ) -> Self {
        Self {
            addresses: ElementAddresses::default(),
            transport: None,
            storage: vec![None; storage_slots],
            import_export: vec![None; map_slots],
            loaded: vec![None; drives.len()],
            drives,
            map_open: false,
            prevent_removal: false,
            tape_alert: TapeAlertFlags::empty(),
            contents_path: None,
            control,
        }
    }

    /// Create the library and restore its saved contents
    pub fn from_config(
        config: &VirtualLibraryConfig,
        drives: Vec<LibraryDrive>,
        control: Box<dyn DriveControl>,
    ) -> Result<Self, Error> {
        let map_slots = config.map_slots.unwrap_or(DEFAULT_MAP_SLOTS);
        let mut library = Self::new(config.storage_slots as usize, map_slots as usize, drives, control);
        if let Some(ref path) = config.contents {
            library.contents_path = Some(PathBuf::from(path));
            library.load_contents()?;
        }
        Ok(library)
    }

    pub fn set_drive_control(&mut self, control: Box<dyn DriveControl>) {
        self.control = control;
    }

    fn load_contents(&mut self) -> Result<(), Error> {
        let path = match self.contents_path {
            Some(ref path) => path.clone(),
            None => return Ok(()),
        };

        let default = serde_json::to_value(LibraryContents::default())?;
        let data = file_get_json(&path, Some(default))?;
        let contents: LibraryContents = serde_json::from_value(data)
            .map_err(|err| format_err!("unable to parse library contents {:?} - {}", path, err))?;

        self.transport = contents.transport;
        restore_elements(&mut self.storage, contents.storage, "storage");
        restore_elements(&mut self.import_export, contents.import_export, "import/export");
        restore_elements(&mut self.loaded, contents.drives, "data transfer");

        Ok(())
    }

    /// Write the slot map to the contents file (if configured)
    pub fn save_contents(&self) -> Result<(), Error> {
        let path = match self.contents_path {
            Some(ref path) => path,
            None => return Ok(()),
        };

        let contents = LibraryContents {
            transport: self.transport.clone(),
            storage: self.storage.clone(),
            import_export: self.import_export.clone(),
            drives: self.loaded.clone(),
        };
        let raw = serde_json::to_string_pretty(&serde_json::to_value(&contents)?)?;

        replace_file(path, raw.as_bytes(), CreateOptions::new(), false)?;
        Ok(())
    }

    /// Bind the element address layout of the personality
    ///
    /// Adds the element address assignment page (1Dh).
    pub fn init_pages(
        &mut self,
        personality: &dyn Personality,
        pages: &mut PageRegistry,
    ) -> Result<(), Error> {
        let addresses = personality.element_addresses();
        self.check_address_layout(&addresses)?;
        self.addresses = addresses;

        let page = AddressAssignmentPage {
            page_code: MP_ELEMENT_ADDRESS_ASSIGNMENT,
            additional_page_len: 0x12,
            first_transport_element_address: addresses.transport,
            transport_element_count: 1,
            first_storage_element_address: addresses.storage,
            storage_element_count: self.storage.len() as u16,
            first_import_export_element_address: addresses.import_export,
            import_export_element_count: self.import_export.len() as u16,
            first_transfer_element_address: addresses.data_transfer,
            transfer_element_count: self.drives.len() as u16,
            reserved18: 0,
            reserved19: 0,
        };
        let mut data = Vec::new();
        unsafe { data.write_be_value(page)? };
        let mask = vec![0u8; data.len()];
        let page = pages.add(PageKind::Mode, MP_ELEMENT_ADDRESS_ASSIGNMENT, 0, &data)?;
        page.set_changeable(&mask)?;

        Ok(())
    }

    fn check_address_layout(&self, addresses: &ElementAddresses) -> Result<(), Error> {
        let mut ranges: Vec<(u32, u32, ElementType)> = ELEMENT_TYPES
            .iter()
            .map(|t| {
                let first = addresses.first(*t) as u32;
                (first, first + self.element_count(*t) as u32, *t)
            })
            .filter(|(first, end, _)| first != end)
            .collect();
        ranges.sort_by_key(|(first, _, _)| *first);

        for pair in ranges.windows(2) {
            if pair[0].1 > pair[1].0 {
                bail!(
                    "element addresses of {:?} and {:?} overlap",
                    pair[0].2,
                    pair[1].2
                );
            }
        }
        if let Some((0, _, element_type)) = ranges.first() {
            bail!("element address 0 is reserved ({:?})", element_type);
        }
        if let Some((_, end, element_type)) = ranges.last() {
            if *end > 0x10000 {
                bail!("element addresses of {:?} out of range", element_type);
            }
        }
        Ok(())
    }

    /// Rebuild a log page from the live state
    pub fn refresh_log_page(&self, page_code: u8, pages: &mut PageRegistry) -> Result<(), Error> {
        if page_code == LP_TAPE_ALERT {
            let data = tape_alert_log_page(self.tape_alert)?;
            if let Some(page) = pages.lookup_mut(PageKind::Log, page_code, 0) {
                page.set_data(&data);
            }
        }
        Ok(())
    }

    pub fn addresses(&self) -> ElementAddresses {
        self.addresses
    }

    pub fn drives(&self) -> &[LibraryDrive] {
        &self.drives
    }

    pub fn element_count(&self, element_type: ElementType) -> usize {
        match element_type {
            ElementType::Transport => 1,
            ElementType::Storage => self.storage.len(),
            ElementType::ImportExport => self.import_export.len(),
            ElementType::DataTransfer => self.drives.len(),
        }
    }

    pub fn address_of(&self, id: ElementId) -> u16 {
        self.addresses.first(id.element_type) + id.index as u16
    }

    /// Map an element address to the element
    pub fn locate(&self, address: u16) -> Option<ElementId> {
        ELEMENT_TYPES.iter().find_map(|element_type| {
            let first = self.addresses.first(*element_type);
            if address < first {
                return None;
            }
            let index = (address - first) as usize;
            if index < self.element_count(*element_type) {
                Some(ElementId {
                    element_type: *element_type,
                    index,
                })
            } else {
                None
            }
        })
    }

    /// All elements in ascending address order
    pub fn elements(&self) -> Vec<ElementId> {
        let mut list = Vec::new();
        for element_type in ELEMENT_TYPES {
            for index in 0..self.element_count(element_type) {
                list.push(ElementId {
                    element_type,
                    index,
                });
            }
        }
        list.sort_by_key(|id| self.address_of(*id));
        list
    }

    fn slot(&self, id: ElementId) -> &Option<Cartridge> {
        match id.element_type {
            ElementType::Transport => &self.transport,
            ElementType::Storage => &self.storage[id.index],
            ElementType::ImportExport => &self.import_export[id.index],
            ElementType::DataTransfer => &self.loaded[id.index],
        }
    }

    fn slot_mut(&mut self, id: ElementId) -> &mut Option<Cartridge> {
        match id.element_type {
            ElementType::Transport => &mut self.transport,
            ElementType::Storage => &mut self.storage[id.index],
            ElementType::ImportExport => &mut self.import_export[id.index],
            ElementType::DataTransfer => &mut self.loaded[id.index],
        }
    }

    pub fn cartridge(&self, id: ElementId) -> Option<&Cartridge> {
        self.slot(id).as_ref()
    }

    /// Element holding the cartridge `barcode`
    pub fn find_barcode(&self, barcode: &str) -> Option<ElementId> {
        self.elements().into_iter().find(|id| {
            self.cartridge(*id)
                .map(|cartridge| cartridge.barcode == barcode)
                .unwrap_or(false)
        })
    }

    /// Put a cartridge into a storage slot (initial inventory)
    pub fn insert(&mut self, slot: usize, barcode: &str) -> Result<(), Error> {
        if self.find_barcode(barcode).is_some() {
            bail!("cartridge '{}' is already in the library", barcode);
        }
        let element = self
            .storage
            .get_mut(slot)
            .ok_or_else(|| format_err!("no such storage slot {}", slot))?;
        if let Some(cartridge) = element.as_ref() {
            bail!("storage slot {} already holds '{}'", slot, cartridge.barcode);
        }
        *element = Some(Cartridge::new(barcode));
        Ok(())
    }

    /// Move a cartridge between two elements
    ///
    /// Loads into and unloads from drives go through the drive control.
    /// The slot map is saved after every successful move.
    pub fn move_medium(&mut self, from: ElementId, to: ElementId) -> Result<(), SenseInfo> {
        let barcode = match self.cartridge(from) {
            Some(cartridge) => cartridge.barcode.clone(),
            None => return Err(SenseInfo::MEDIUM_SOURCE_EMPTY),
        };
        if from == to {
            return Ok(());
        }
        if self.slot(to).is_some() {
            return Err(SenseInfo::MEDIUM_DESTINATION_FULL);
        }
        if self.map_open
            && (from.element_type == ElementType::ImportExport
                || to.element_type == ElementType::ImportExport)
        {
            return Err(SenseInfo::MEDIUM_NOT_PRESENT_TRAY_OPEN);
        }

        if from.element_type == ElementType::DataTransfer {
            let drive = self.drives[from.index].id;
            if let Err(err) = self.control.unload(drive) {
                log::error!("unable to unload '{}' from drive {} - {}", barcode, drive, err);
                self.tape_alert |= TapeAlertFlags::LOADER_HARDWARE;
                return Err(SenseInfo::MEDIA_LOAD_EJECT_FAILED);
            }
        }

        if to.element_type == ElementType::DataTransfer {
            let drive = self.drives[to.index].id;
            if let Err(err) = self.control.load(drive, &barcode) {
                log::error!("unable to load '{}' into drive {} - {}", barcode, drive, err);
                self.tape_alert |= TapeAlertFlags::LOADER_HARDWARE;
                // the slot map still has the cartridge in its source drive
                if from.element_type == ElementType::DataTransfer {
                    let source = self.drives[from.index].id;
                    if let Err(err) = self.control.load(source, &barcode) {
                        log::error!("unable to reload '{}' into drive {} - {}", barcode, source, err);
                    }
                }
                return Err(SenseInfo::MEDIA_LOAD_EJECT_FAILED);
            }
        }

        let source_address = self.address_of(from);
        let destination_address = self.address_of(to);
        if let Some(mut cartridge) = self.slot_mut(from).take() {
            match from.element_type {
                ElementType::Storage | ElementType::ImportExport => {
                    cartridge.source = Some(source_address)
                }
                ElementType::Transport | ElementType::DataTransfer => {}
            }
            *self.slot_mut(to) = Some(cartridge);
        }

        log::info!(
            "moved '{}' from element {:04x}h to {:04x}h",
            barcode,
            source_address,
            destination_address
        );

        if let Err(err) = self.save_contents() {
            log::warn!("unable to save library contents - {}", err);
        }
        Ok(())
    }

    pub fn open_map(&mut self) -> Result<(), SenseInfo> {
        if self.prevent_removal {
            return Err(SenseInfo::MEDIUM_REMOVAL_PREVENTED);
        }
        self.map_open = true;
        Ok(())
    }

    pub fn close_map(&mut self) {
        self.map_open = false;
    }

    /// Operator puts a cartridge into the first free import/export slot
    pub fn load_map(&mut self, barcode: &str) -> Result<(), Error> {
        if !self.map_open {
            bail!("import/export station is closed");
        }
        if let Some(id) = self.find_barcode(barcode) {
            bail!(
                "cartridge '{}' is already in the library (element {:04x}h)",
                barcode,
                self.address_of(id)
            );
        }
        let slot = self
            .import_export
            .iter_mut()
            .find(|slot| slot.is_none())
            .ok_or_else(|| format_err!("import/export station is full"))?;
        *slot = Some(Cartridge::new(barcode));
        self.save_contents()
    }

    /// Operator takes all cartridges out of the import/export station
    pub fn empty_map(&mut self) -> Result<Vec<String>, Error> {
        if !self.map_open {
            bail!("import/export station is closed");
        }
        let removed = self
            .import_export
            .iter_mut()
            .filter_map(Option::take)
            .map(|cartridge| cartridge.barcode)
            .collect();
        self.save_contents()?;
        Ok(removed)
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::personality::{GenericLibrary, Ts3500Library};
    use crate::unit::{Device, LogicalUnit};

    /// Records the drive requests, fails loads of barcodes starting with "BAD"
    #[derive(Clone, Default)]
    pub(crate) struct RecordingControl {
        pub requests: Arc<Mutex<Vec<String>>>,
    }

    impl DriveControl for RecordingControl {
        fn load(&mut self, drive: u64, barcode: &str) -> Result<(), Error> {
            if barcode.starts_with("BAD") {
                bail!("simulated load failure");
            }
            self.requests
                .lock()
                .unwrap()
                .push(format!("{} lload {}", drive, barcode));
            Ok(())
        }

        fn unload(&mut self, drive: u64) -> Result<(), Error> {
            self.requests.lock().unwrap().push(format!("{} unload", drive));
            Ok(())
        }
    }

    pub(crate) fn library_identity() -> UnitIdentity {
        UnitIdentity {
            id: 10,
            name: String::from("library0"),
            vendor: String::from("STK"),
            product: String::from("L700"),
            revision: String::from("0104"),
            serial: String::from("XYZZY_A"),
            naa: None,
            lun: 0,
        }
    }

    pub(crate) fn test_drives() -> Vec<LibraryDrive> {
        (0..2)
            .map(|n| LibraryDrive {
                id: 11 + n,
                vendor: String::from("IBM"),
                product: String::from("ULT3580-TD6"),
                serial: format!("XYZZY_A{}", n + 1),
            })
            .collect()
    }

    pub(crate) fn test_library(control: &RecordingControl) -> Library {
        let mut library = Library::new(8, 2, test_drives(), Box::new(control.clone()));
        library.insert(0, "E01001L6").unwrap();
        library.insert(1, "E01002L6").unwrap();
        library.insert(7, "BAD003L6").unwrap();
        library
    }

    fn storage(index: usize) -> ElementId {
        ElementId {
            element_type: ElementType::Storage,
            index,
        }
    }

    fn drive(index: usize) -> ElementId {
        ElementId {
            element_type: ElementType::DataTransfer,
            index,
        }
    }

    fn map(index: usize) -> ElementId {
        ElementId {
            element_type: ElementType::ImportExport,
            index,
        }
    }

    #[test]
    fn element_addresses() -> Result<(), Error> {
        let control = RecordingControl::default();
        let library = test_library(&control);

        assert_eq!(library.locate(0x0001).map(|id| id.element_type), Some(ElementType::Transport));
        assert_eq!(library.locate(0x0011), Some(map(1)));
        assert_eq!(library.locate(0x0012), None);
        assert_eq!(library.locate(0x01f5), Some(drive(1)));
        assert_eq!(library.locate(0x03ef), Some(storage(7)));
        assert_eq!(library.locate(0x03f0), None);

        let elements = library.elements();
        assert_eq!(elements.len(), 1 + 8 + 2 + 2);
        assert_eq!(elements[0].element_type, ElementType::Transport);
        assert_eq!(elements[1], map(0));

        Ok(())
    }

    #[test]
    fn personality_layout() -> Result<(), Error> {
        let control = RecordingControl::default();
        let library = test_library(&control);
        let unit = LogicalUnit::new(
            library_identity(),
            Arc::new(Ts3500Library),
            Device::Changer(library),
            false,
        )?;

        let page = unit
            .pages
            .lookup(PageKind::Mode, MP_ELEMENT_ADDRESS_ASSIGNMENT, 0)
            .unwrap();
        let data = page.data();
        assert_eq!(data.len(), 20);
        assert_eq!(&data[2..6], &[0x00, 0x01, 0x00, 0x01]);
        assert_eq!(&data[6..10], &[0x04, 0x01, 0x00, 0x08]);
        assert_eq!(&data[10..14], &[0x03, 0x00, 0x00, 0x02]);
        assert_eq!(&data[14..18], &[0x01, 0x01, 0x00, 0x02]);

        let mut overlapping = Library::new(8, 600, test_drives(), Box::new(control));
        assert!(overlapping.init_pages(&GenericLibrary, &mut PageRegistry::new()).is_err());

        Ok(())
    }

    #[test]
    fn move_through_drives() -> Result<(), Error> {
        let control = RecordingControl::default();
        let mut library = test_library(&control);

        library.move_medium(storage(0), drive(1))?;
        assert_eq!(library.cartridge(drive(1)).unwrap().source, Some(0x03e8));
        assert!(library.cartridge(storage(0)).is_none());

        assert_eq!(
            library.move_medium(storage(1), drive(1)),
            Err(SenseInfo::MEDIUM_DESTINATION_FULL)
        );
        assert_eq!(
            library.move_medium(storage(0), drive(0)),
            Err(SenseInfo::MEDIUM_SOURCE_EMPTY)
        );

        library.move_medium(drive(1), storage(3))?;
        assert_eq!(library.find_barcode("E01001L6"), Some(storage(3)));

        assert_eq!(
            library.move_medium(storage(7), drive(0)),
            Err(SenseInfo::MEDIA_LOAD_EJECT_FAILED)
        );
        assert_eq!(library.find_barcode("BAD003L6"), Some(storage(7)));
        assert!(library.tape_alert.contains(TapeAlertFlags::LOADER_HARDWARE));

        assert_eq!(
            *control.requests.lock().unwrap(),
            vec!["12 lload E01001L6".to_string(), "12 unload".to_string()]
        );

        Ok(())
    }

    #[test]
    fn import_export_station() -> Result<(), Error> {
        let control = RecordingControl::default();
        let mut library = test_library(&control);

        assert!(library.load_map("NEW001L6").is_err());
        library.open_map()?;
        library.load_map("NEW001L6")?;
        assert!(library.load_map("E01001L6").is_err());
        assert_eq!(
            library.move_medium(map(0), storage(2)),
            Err(SenseInfo::MEDIUM_NOT_PRESENT_TRAY_OPEN)
        );

        library.close_map();
        library.move_medium(map(0), storage(2))?;
        library.move_medium(storage(0), map(1))?;

        library.prevent_removal = true;
        assert_eq!(library.open_map(), Err(SenseInfo::MEDIUM_REMOVAL_PREVENTED));
        library.prevent_removal = false;

        library.open_map()?;
        assert_eq!(library.empty_map()?, vec![String::from("E01001L6")]);
        assert!(library.find_barcode("E01001L6").is_none());

        Ok(())
    }

    #[test]
    fn contents_are_persisted() -> Result<(), Error> {
        let path = std::env::temp_dir().join(format!("vtl-library-{}.json", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let config = VirtualLibraryConfig {
            name: String::from("library0"),
            id: 10,
            vendor: String::from("STK"),
            product: String::from("L700"),
            revision: None,
            serial: String::from("XYZZY_A"),
            naa: None,
            drives: Some(String::from("11,12")),
            storage_slots: 4,
            map_slots: None,
            contents: Some(path.to_string_lossy().to_string()),
        };

        let control = RecordingControl::default();
        let mut library = Library::from_config(&config, test_drives(), Box::new(control.clone()))?;
        assert_eq!(library.element_count(ElementType::ImportExport), 4);
        library.insert(2, "E01001L6")?;
        library.move_medium(storage(2), drive(0))?;

        let restored = Library::from_config(&config, test_drives(), Box::new(control))?;
        let cartridge = restored.cartridge(drive(0)).unwrap();
        assert_eq!(cartridge.barcode, "E01001L6");
        assert_eq!(cartridge.source, Some(0x03ea));

        let _ = std::fs::remove_file(&path);
        Ok(())
    }
}
