use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Error};

use proxmox_vtl::message_bus::{BusDriveControl, MessageBus};
use proxmox_vtl::server::UnitServer;
use proxmox_vtl::transport::{loopback, Initiator};
use proxmox_vtl::units;

use vtl_tape::message::REPLY_ERROR;
use vtl_tape::sense::SAM_STAT_GOOD;
use vtl_tape::ssc::format_medium;
use vtl_tape::ssc::mam::MediumKind;
use vtl_tape::ssc::media_store::{MemoryRepository, MemoryStore};
use vtl_tape::unit::CommandResponse;

const CONFIG: &str = "\
options: global
	descriptor-sense false

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

const TIMEOUT: Duration = Duration::from_secs(10);

fn sense_code(response: &CommandResponse) -> (u8, u8, u8) {
    (
        response.sense[2] & 0x0f,
        response.sense[12],
        response.sense[13],
    )
}

/// TEST UNIT READY until the unit attentions are consumed
fn wait_ready(initiator: &mut Initiator) -> Result<Vec<(u8, u8, u8)>, Error> {
    let mut attentions = Vec::new();
    for _ in 0..4 {
        let response = initiator.execute(&[0u8; 6], &[])?;
        if response.status == SAM_STAT_GOOD {
            return Ok(attentions);
        }
        attentions.push(sense_code(&response));
    }
    bail!("unit not ready: {:?}", attentions);
}

#[test]
fn move_into_drive_and_reload() -> Result<(), Error> {
    let (config, _) = vtl_config::parse_config("device.cfg", CONFIG)?;
    let bus = MessageBus::new();
    let shutdown = Arc::new(AtomicBool::new(false));

    let repository = MemoryRepository::new();
    let store = MemoryStore::new();
    format_medium(Box::new(store.clone()), "E01001L6", "LTO6", MediumKind::Data, 0x5a, 1 << 30)?;
    repository.insert("E01001L6", store);

    let drive = units::drive_unit(&config, 11, Box::new(repository))?;
    let (transport, mut drive_initiator) = loopback(TIMEOUT);
    let changed = CONFIG.replace("ULT3580-TD6", "ULT3580-TD7");
    let drive_server = UnitServer::new(drive, transport, bus.register(11)?)
        .with_poll_interval(Duration::from_millis(10))
        .with_config_source(Box::new(move || {
            Ok(vtl_config::parse_config("device.cfg", &changed)?.0)
        }));
    let reload = drive_server.reload_flag();
    let drive_thread = drive_server.spawn(Arc::clone(&shutdown))?;

    let control = BusDriveControl::new(bus.clone(), 10, TIMEOUT);
    let mut library = units::library_unit(&config, 10, Box::new(control))?;
    library.library()?.insert(0, "E01001L6")?;
    let (transport, mut library_initiator) = loopback(TIMEOUT);
    let library_server = UnitServer::new(library, transport, bus.register(10)?)
        .with_poll_interval(Duration::from_millis(10));
    let library_thread = library_server.spawn(Arc::clone(&shutdown))?;

    assert_eq!(wait_ready(&mut library_initiator)?, vec![(0x06, 0x29, 0x00)]);

    // empty drive
    let response = drive_initiator.execute(&[0u8; 6], &[])?;
    assert_eq!(sense_code(&response), (0x06, 0x29, 0x00));
    let response = drive_initiator.execute(&[0u8; 6], &[])?;
    assert_eq!(sense_code(&response), (0x02, 0x3a, 0x00));

    // first slot into the drive, the library asks the drive unit to load
    let response = library_initiator.execute(&[0xa5, 0, 0, 0, 0x03, 0xe8, 0x01, 0xf4, 0, 0, 0, 0], &[])?;
    assert_eq!(response.status, SAM_STAT_GOOD);
    assert_eq!(wait_ready(&mut drive_initiator)?, vec![(0x06, 0x28, 0x00)]);

    // write a block, read it back
    let block = vec![0x42u8; 512];
    let response = drive_initiator.execute(&[0x0a, 0, 0, 0x02, 0x00, 0], &block)?;
    assert_eq!(response.status, SAM_STAT_GOOD);
    drive_initiator.execute(&[0x01, 0, 0, 0, 0, 0], &[])?;
    let response = drive_initiator.execute(&[0x08, 0, 0, 0x02, 0x00, 0], &[])?;
    assert_eq!(response.data, block);

    // operator messages
    assert_eq!(bus.send_message(0, 10, "open map", TIMEOUT)?, "map open");
    let reply = bus.send_message(0, 10, "lload X", TIMEOUT)?;
    assert!(reply.starts_with(REPLY_ERROR));

    // reload switches the drive to the new product, the medium stays
    reload.store(true, Ordering::SeqCst);
    while reload.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(5));
    }
    let response = drive_initiator.execute(&[0x12, 0, 0, 0, 96, 0], &[])?;
    assert_eq!(&response.data[16..27], b"ULT3580-TD7");
    assert_eq!(wait_ready(&mut drive_initiator)?, vec![(0x06, 0x2a, 0x01)]);

    // back to its slot
    let response = library_initiator.execute(&[0xa5, 0, 0, 0, 0x01, 0xf4, 0x03, 0xe8, 0, 0, 0, 0], &[])?;
    assert_eq!(response.status, SAM_STAT_GOOD);
    let response = drive_initiator.execute(&[0u8; 6], &[])?;
    assert_eq!(sense_code(&response), (0x02, 0x3a, 0x00));

    shutdown.store(true, Ordering::SeqCst);
    drive_thread.join().unwrap()?;
    library_thread.join().unwrap()?;

    Ok(())
}
