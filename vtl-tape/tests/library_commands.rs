use std::sync::{Arc, Mutex};

use anyhow::{bail, Error};

use vtl_tape::personality::StkLibrary;
use vtl_tape::sense::{
    SAM_STAT_CHECK_CONDITION, SAM_STAT_GOOD, SENSE_KEY_HARDWARE_ERROR, SENSE_KEY_ILLEGAL_REQUEST,
};
use vtl_tape::smc::{DriveControl, Library, LibraryDrive};
use vtl_tape::unit::{CommandResponse, Device, LogicalUnit, UnitIdentity};

#[derive(Clone, Default)]
struct Requests(Arc<Mutex<Vec<String>>>);

impl DriveControl for Requests {
    fn load(&mut self, drive: u64, barcode: &str) -> Result<(), Error> {
        if barcode.starts_with("BAD") {
            bail!("drive {} refuses {}", drive, barcode);
        }
        self.0.lock().unwrap().push(format!("{} lload {}", drive, barcode));
        Ok(())
    }

    fn unload(&mut self, drive: u64) -> Result<(), Error> {
        self.0.lock().unwrap().push(format!("{} unload", drive));
        Ok(())
    }
}

fn library_unit(requests: &Requests) -> Result<LogicalUnit, Error> {
    let drives = (0..2)
        .map(|n| LibraryDrive {
            id: 11 + n,
            vendor: String::from("IBM"),
            product: String::from("ULT3580-TD6"),
            serial: format!("XYZZY_A{}", n + 1),
        })
        .collect();
    let mut library = Library::new(8, 2, drives, Box::new(requests.clone()));
    library.insert(0, "E01001L6")?;
    library.insert(1, "E01002L6")?;
    library.insert(7, "BAD003L6")?;

    let identity = UnitIdentity {
        id: 10,
        name: String::from("library0"),
        vendor: String::from("STK"),
        product: String::from("L700"),
        revision: String::from("0104"),
        serial: String::from("XYZZY_A"),
        naa: None,
        lun: 0,
    };
    let mut unit = LogicalUnit::new(identity, Arc::new(StkLibrary), Device::Changer(library), false)?;
    unit.clear_unit_attention();
    Ok(unit)
}

fn run(unit: &mut LogicalUnit, cdb: &[u8]) -> Result<CommandResponse, Error> {
    let mut empty: &[u8] = &[];
    unit.execute(cdb, &mut empty)
}

fn sense_code(response: &CommandResponse) -> (u8, u8, u8) {
    (
        response.sense[2] & 0x0f,
        response.sense[12],
        response.sense[13],
    )
}

fn move_medium(unit: &mut LogicalUnit, from: u16, to: u16) -> Result<CommandResponse, Error> {
    let from = from.to_be_bytes();
    let to = to.to_be_bytes();
    run(unit, &[0xa5, 0, 0, 0, from[0], from[1], to[0], to[1], 0, 0, 0, 0])
}

#[test]
fn element_status_with_volume_tags() -> Result<(), Error> {
    let requests = Requests::default();
    let mut unit = library_unit(&requests)?;

    // storage elements, VOLTAG, 4 elements from 03E8h
    let response = run(&mut unit, &[0xb8, 0x12, 0x03, 0xe8, 0, 4, 0, 0, 0x10, 0x00, 0, 0])?;
    assert_eq!(response.status, SAM_STAT_GOOD);

    let data = &response.data;
    assert_eq!(&data[0..4], &[0x03, 0xe8, 0x00, 0x04]);
    // element status page: storage, PVOLTAG, 48 byte descriptors
    assert_eq!(data[8], 0x02);
    assert_eq!(data[9] & 0x80, 0x80);
    assert_eq!(&data[10..12], &[0x00, 48]);
    assert_eq!(data.len(), 16 + 4 * 48);

    assert_eq!(&data[16..18], &[0x03, 0xe8]);
    assert_eq!(data[18] & 0x01, 0x01);
    assert_eq!(&data[28..36], b"E01001L6");
    // third slot is empty
    assert_eq!(data[16 + 2 * 48 + 2] & 0x01, 0x00);

    // a short allocation length truncates, the header still counts everything
    let response = run(&mut unit, &[0xb8, 0x12, 0x03, 0xe8, 0, 4, 0, 0, 0x00, 0x20, 0, 0])?;
    assert_eq!(response.data.len(), 0x20);
    assert_eq!(&response.data[5..8], &[0x00, 0x00, (8 + 4 * 48) as u8]);

    Ok(())
}

#[test]
fn move_medium_between_elements() -> Result<(), Error> {
    let requests = Requests::default();
    let mut unit = library_unit(&requests)?;

    let response = move_medium(&mut unit, 0x03e8, 0x01f4)?;
    assert_eq!(response.status, SAM_STAT_GOOD);
    assert_eq!(requests.0.lock().unwrap().as_slice(), ["11 lload E01001L6"]);

    // source now empty
    let response = move_medium(&mut unit, 0x03e8, 0x01f5)?;
    assert_eq!(response.status, SAM_STAT_CHECK_CONDITION);
    assert_eq!(sense_code(&response), (SENSE_KEY_ILLEGAL_REQUEST, 0x3b, 0x0e));

    // destination full
    let response = move_medium(&mut unit, 0x03e9, 0x01f4)?;
    assert_eq!(sense_code(&response), (SENSE_KEY_ILLEGAL_REQUEST, 0x3b, 0x0d));

    let response = move_medium(&mut unit, 0x03e9, 0x0999)?;
    assert_eq!(sense_code(&response), (SENSE_KEY_ILLEGAL_REQUEST, 0x21, 0x01));

    // the drive refuses the cartridge, it stays in its slot
    let response = move_medium(&mut unit, 0x03ef, 0x01f5)?;
    assert_eq!(sense_code(&response), (SENSE_KEY_HARDWARE_ERROR, 0x53, 0x00));

    // back home, the drive is asked to unload first
    let response = move_medium(&mut unit, 0x01f4, 0x03e8)?;
    assert_eq!(response.status, SAM_STAT_GOOD);
    assert_eq!(requests.0.lock().unwrap().last().map(String::as_str), Some("11 unload"));

    let library = unit.library()?;
    let slot = library.find_barcode("E01001L6").unwrap();
    assert_eq!(library.address_of(slot), 0x03e8);
    let slot = library.find_barcode("BAD003L6").unwrap();
    assert_eq!(library.address_of(slot), 0x03ef);

    Ok(())
}

#[test]
fn import_export_door() -> Result<(), Error> {
    let requests = Requests::default();
    let mut unit = library_unit(&requests)?;

    let response = run(&mut unit, &[0x1e, 0, 0, 0, 0x01, 0])?;
    assert_eq!(response.status, SAM_STAT_GOOD);

    let response = run(&mut unit, &[0x1b, 0, 0x00, 0x10, 0x00, 0])?;
    assert_eq!(sense_code(&response), (SENSE_KEY_ILLEGAL_REQUEST, 0x53, 0x02));

    run(&mut unit, &[0x1e, 0, 0, 0, 0x00, 0])?;
    let response = run(&mut unit, &[0x1b, 0, 0x00, 0x10, 0x00, 0])?;
    assert_eq!(response.status, SAM_STAT_GOOD);
    assert!(unit.library()?.map_open);

    // storage elements have no door
    let response = run(&mut unit, &[0x1b, 0, 0x03, 0xe8, 0x01, 0])?;
    assert_eq!(sense_code(&response), (SENSE_KEY_ILLEGAL_REQUEST, 0x21, 0x01));

    let response = run(&mut unit, &[0x1b, 0, 0x00, 0x10, 0x01, 0])?;
    assert_eq!(response.status, SAM_STAT_GOOD);
    assert!(!unit.library()?.map_open);

    Ok(())
}

#[test]
fn address_assignment_page() -> Result<(), Error> {
    let requests = Requests::default();
    let mut unit = library_unit(&requests)?;

    let response = run(&mut unit, &[0x1a, 0x08, 0x1d, 0, 255, 0])?;
    assert_eq!(response.status, SAM_STAT_GOOD);
    assert_eq!(response.data[3], 0);

    let page = &response.data[4..];
    assert_eq!(page[0] & 0x3f, 0x1d);
    assert_eq!(&page[2..6], &[0x00, 0x01, 0x00, 0x01]);
    assert_eq!(&page[6..10], &[0x03, 0xe8, 0x00, 0x08]);
    assert_eq!(&page[10..14], &[0x00, 0x10, 0x00, 0x02]);
    assert_eq!(&page[14..18], &[0x01, 0xf4, 0x00, 0x02]);

    Ok(())
}
