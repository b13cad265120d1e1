use std::sync::Arc;

use anyhow::Error;

use vtl_tape::personality::{Ultrium, UltriumVendor};
use vtl_tape::sense::{
    SAM_STAT_CHECK_CONDITION, SAM_STAT_GOOD, SAM_STAT_RESERVATION_CONFLICT, SENSE_FILEMARK,
    SENSE_ILI, SENSE_KEY_BLANK_CHECK, SENSE_KEY_ILLEGAL_REQUEST, SENSE_KEY_NOT_READY,
    SENSE_KEY_NO_SENSE, SENSE_KEY_UNIT_ATTENTION,
};
use vtl_tape::ssc::mam::MediumKind;
use vtl_tape::ssc::media_store::{MemoryRepository, MemoryStore};
use vtl_tape::ssc::{format_medium, TapeDrive};
use vtl_tape::unit::{CommandResponse, Device, LogicalUnit, UnitIdentity};

const BLOCK_SIZE: usize = 1024;

fn drive_unit() -> Result<LogicalUnit, Error> {
    let repository = MemoryRepository::new();
    let store = MemoryStore::new();
    format_medium(Box::new(store.clone()), "E01001L6", "LTO6", MediumKind::Data, 0x5a, 1 << 30)?;
    repository.insert("E01001L6", store);

    let identity = UnitIdentity {
        id: 11,
        name: String::from("drive0"),
        vendor: String::from("IBM"),
        product: String::from("ULT3580-TD6"),
        revision: String::from("0001"),
        serial: String::from("XYZZY_A1"),
        naa: None,
        lun: 0,
    };
    let personality = Arc::new(Ultrium::new(UltriumVendor::Ibm, 6)?);
    let drive = TapeDrive::new(Box::new(repository));
    LogicalUnit::new(identity, personality, Device::Tape(drive), false)
}

fn run(unit: &mut LogicalUnit, cdb: &[u8]) -> Result<CommandResponse, Error> {
    let mut empty: &[u8] = &[];
    unit.execute(cdb, &mut empty)
}

fn run_with_data(unit: &mut LogicalUnit, cdb: &[u8], data: &[u8]) -> Result<CommandResponse, Error> {
    let mut payload = data;
    unit.execute(cdb, &mut payload)
}

fn sense_code(response: &CommandResponse) -> (u8, u8, u8) {
    (
        response.sense[2] & 0x0f,
        response.sense[12],
        response.sense[13],
    )
}

fn information(response: &CommandResponse) -> u32 {
    u32::from_be_bytes([
        response.sense[3],
        response.sense[4],
        response.sense[5],
        response.sense[6],
    ])
}

fn rw_cdb(opcode: u8, flags: u8, length: usize) -> [u8; 6] {
    let length = (length as u32).to_be_bytes();
    [opcode, flags, length[1], length[2], length[3], 0]
}

fn block(pattern: u8) -> Vec<u8> {
    vec![pattern; BLOCK_SIZE]
}

fn block_number(unit: &mut LogicalUnit) -> Result<u32, Error> {
    let response = run(unit, &[0x34, 0, 0, 0, 0, 0, 0, 0, 0, 0])?;
    assert_eq!(response.status, SAM_STAT_GOOD);
    Ok(u32::from_be_bytes([
        response.data[4],
        response.data[5],
        response.data[6],
        response.data[7],
    ]))
}

/// Load the test cartridge and consume the unit attentions
fn ready_unit() -> Result<LogicalUnit, Error> {
    let mut unit = drive_unit()?;
    unit.load_medium("E01001L6")?;
    unit.clear_unit_attention();
    Ok(unit)
}

#[test]
fn test_unit_ready_sequence() -> Result<(), Error> {
    let mut unit = drive_unit()?;
    let tur = [0u8; 6];

    let response = run(&mut unit, &tur)?;
    assert_eq!(response.status, SAM_STAT_CHECK_CONDITION);
    assert_eq!(sense_code(&response), (SENSE_KEY_UNIT_ATTENTION, 0x29, 0x00));

    let response = run(&mut unit, &tur)?;
    assert_eq!(sense_code(&response), (SENSE_KEY_NOT_READY, 0x3a, 0x00));

    unit.load_medium("E01001L6")?;
    let response = run(&mut unit, &tur)?;
    assert_eq!(sense_code(&response), (SENSE_KEY_UNIT_ATTENTION, 0x28, 0x00));

    let response = run(&mut unit, &tur)?;
    assert_eq!(response.status, SAM_STAT_GOOD);

    // INQUIRY is answered even with a pending unit attention
    unit.add_unit_attention(vtl_tape::sense::SenseInfo::MODE_PARAMETERS_CHANGED);
    let response = run(&mut unit, &[0x12, 0, 0, 0, 96, 0])?;
    assert_eq!(response.status, SAM_STAT_GOOD);
    assert_eq!(response.data[0] & 0x1f, 0x01);
    assert_eq!(&response.data[8..16], b"IBM     ");

    Ok(())
}

#[test]
fn write_rewind_read() -> Result<(), Error> {
    let mut unit = ready_unit()?;

    for pattern in [1u8, 2] {
        let response = run_with_data(&mut unit, &rw_cdb(0x0a, 0, BLOCK_SIZE), &block(pattern))?;
        assert_eq!(response.status, SAM_STAT_GOOD);
    }
    // one filemark
    let response = run(&mut unit, &[0x10, 0, 0, 0, 1, 0])?;
    assert_eq!(response.status, SAM_STAT_GOOD);
    let response = run_with_data(&mut unit, &rw_cdb(0x0a, 0, BLOCK_SIZE), &block(3))?;
    assert_eq!(response.status, SAM_STAT_GOOD);

    // filemarks count as logical objects
    assert_eq!(block_number(&mut unit)?, 4);

    let response = run(&mut unit, &[0x01, 0, 0, 0, 0, 0])?;
    assert_eq!(response.status, SAM_STAT_GOOD);
    assert_eq!(block_number(&mut unit)?, 0);

    let response = run(&mut unit, &rw_cdb(0x08, 0, BLOCK_SIZE))?;
    assert_eq!(response.status, SAM_STAT_GOOD);
    assert_eq!(response.data, block(1));

    let response = run(&mut unit, &rw_cdb(0x08, 0, BLOCK_SIZE))?;
    assert_eq!(response.data, block(2));

    // the filemark stops the read, the position is behind it
    let response = run(&mut unit, &rw_cdb(0x08, 0, BLOCK_SIZE))?;
    assert_eq!(response.status, SAM_STAT_CHECK_CONDITION);
    assert_eq!(response.sense[2] & SENSE_FILEMARK, SENSE_FILEMARK);
    assert_eq!(sense_code(&response), (SENSE_KEY_NO_SENSE, 0x00, 0x01));
    assert_eq!(information(&response), BLOCK_SIZE as u32);
    assert_eq!(block_number(&mut unit)?, 3);

    let response = run(&mut unit, &rw_cdb(0x08, 0, BLOCK_SIZE))?;
    assert_eq!(response.data, block(3));

    let response = run(&mut unit, &rw_cdb(0x08, 0, BLOCK_SIZE))?;
    assert_eq!(sense_code(&response), (SENSE_KEY_BLANK_CHECK, 0x00, 0x05));

    Ok(())
}

#[test]
fn incorrect_length() -> Result<(), Error> {
    let mut unit = ready_unit()?;

    run_with_data(&mut unit, &rw_cdb(0x0a, 0, BLOCK_SIZE), &block(7))?;
    run_with_data(&mut unit, &rw_cdb(0x0a, 0, BLOCK_SIZE), &block(8))?;
    run(&mut unit, &[0x01, 0, 0, 0, 0, 0])?;

    // short read without SILI reports the negative residue
    let response = run(&mut unit, &rw_cdb(0x08, 0, 512))?;
    assert_eq!(response.status, SAM_STAT_CHECK_CONDITION);
    assert_eq!(response.sense[2] & SENSE_ILI, SENSE_ILI);
    assert_eq!(information(&response), (-512i32) as u32);
    assert_eq!(response.data, vec![7u8; 512]);

    // SILI suppresses the condition
    let response = run(&mut unit, &rw_cdb(0x08, 0x02, 512))?;
    assert_eq!(response.status, SAM_STAT_GOOD);
    assert_eq!(response.data, vec![8u8; 512]);

    // fixed mode without a block size is rejected
    let response = run(&mut unit, &rw_cdb(0x08, 0x01, 1))?;
    assert_eq!(sense_code(&response), (SENSE_KEY_ILLEGAL_REQUEST, 0x24, 0x00));

    // SILI and FIXED together are invalid
    let response = run(&mut unit, &rw_cdb(0x08, 0x03, 1))?;
    assert_eq!(sense_code(&response), (SENSE_KEY_ILLEGAL_REQUEST, 0x24, 0x00));

    Ok(())
}

#[test]
fn unknown_opcode() -> Result<(), Error> {
    let mut unit = ready_unit()?;
    let response = run(&mut unit, &[0xc5, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0])?;
    assert_eq!(response.status, SAM_STAT_CHECK_CONDITION);
    assert_eq!(sense_code(&response), (SENSE_KEY_ILLEGAL_REQUEST, 0x20, 0x00));
    Ok(())
}

fn reserve_out(
    unit: &mut LogicalUnit,
    action: u8,
    reservation_type: u8,
    key: u64,
    sa_key: u64,
) -> Result<CommandResponse, Error> {
    let mut param = Vec::with_capacity(24);
    param.extend(key.to_be_bytes());
    param.extend(sa_key.to_be_bytes());
    param.extend([0u8; 8]);
    let cdb = [0x5f, action, reservation_type, 0, 0, 0, 0, 0, 24, 0];
    run_with_data(unit, &cdb, &param)
}

#[test]
fn persistent_reservation() -> Result<(), Error> {
    let mut unit = ready_unit()?;

    // register, reserve write exclusive
    assert_eq!(reserve_out(&mut unit, 0x00, 0, 0, 0x1234)?.status, SAM_STAT_GOOD);
    assert_eq!(reserve_out(&mut unit, 0x01, 0x01, 0x1234, 0)?.status, SAM_STAT_GOOD);

    // wrong key
    let response = reserve_out(&mut unit, 0x02, 0x01, 0x9999, 0)?;
    assert_eq!(response.status, SAM_STAT_RESERVATION_CONFLICT);
    assert!(response.sense.is_empty());

    let response = run(&mut unit, &[0x5e, 0x01, 0, 0, 0, 0, 0, 0, 64, 0])?;
    assert_eq!(response.status, SAM_STAT_GOOD);
    assert_eq!(u32::from_be_bytes([response.data[0], response.data[1], response.data[2], response.data[3]]), 1);
    assert_eq!(&response.data[8..16], &0x1234u64.to_be_bytes());
    assert_eq!(response.data[21], 0x01);

    // clear drops key and reservation
    assert_eq!(reserve_out(&mut unit, 0x03, 0, 0x1234, 0)?.status, SAM_STAT_GOOD);
    let response = run(&mut unit, &[0x5e, 0x00, 0, 0, 0, 0, 0, 0, 64, 0])?;
    assert_eq!(&response.data[4..8], &[0, 0, 0, 0]);
    assert_eq!(response.data[3], 2);

    // short parameter list
    let cdb = [0x5f, 0x00, 0, 0, 0, 0, 0, 0, 16, 0];
    let response = run_with_data(&mut unit, &cdb, &[0u8; 16])?;
    assert_eq!(sense_code(&response), (SENSE_KEY_ILLEGAL_REQUEST, 0x1a, 0x00));

    Ok(())
}

#[test]
fn block_size_by_mode_select() -> Result<(), Error> {
    let mut unit = ready_unit()?;

    // header plus block descriptor with a block length of 512
    let mut param = vec![0u8, 0, 0x10, 8];
    param.extend([0x00, 0, 0, 0, 0, 0x00, 0x02, 0x00]);
    let response = run_with_data(&mut unit, &[0x15, 0x10, 0, 0, param.len() as u8, 0], &param)?;
    assert_eq!(response.status, SAM_STAT_GOOD);

    // two fixed blocks
    let response = run_with_data(&mut unit, &rw_cdb(0x0a, 0x01, 2), &[5u8; 1024])?;
    assert_eq!(response.status, SAM_STAT_GOOD);
    assert_eq!(block_number(&mut unit)?, 2);

    let response = run(&mut unit, &[0x1a, 0, 0x3f, 0, 255, 0])?;
    assert_eq!(response.status, SAM_STAT_GOOD);
    assert_eq!(response.data[3], 8);
    assert_eq!(&response.data[9..12], &[0x00, 0x02, 0x00]);

    // SP is not supported
    let response = run_with_data(&mut unit, &[0x15, 0x11, 0, 0, param.len() as u8, 0], &param)?;
    assert_eq!(sense_code(&response), (SENSE_KEY_ILLEGAL_REQUEST, 0x24, 0x00));

    Ok(())
}

#[test]
fn oversized_fixed_transfer() -> Result<(), Error> {
    let mut unit = ready_unit()?;

    // largest block length the drive accepts: 8 MiB
    let mut param = vec![0u8, 0, 0x10, 8];
    param.extend([0x00, 0, 0, 0, 0, 0x80, 0x00, 0x00]);
    let response = run_with_data(&mut unit, &[0x15, 0x10, 0, 0, param.len() as u8, 0], &param)?;
    assert_eq!(response.status, SAM_STAT_GOOD);

    let response = run(&mut unit, &rw_cdb(0x08, 0x01, 0xff_ffff))?;
    assert_eq!(response.status, SAM_STAT_CHECK_CONDITION);
    assert_eq!(sense_code(&response), (SENSE_KEY_ILLEGAL_REQUEST, 0x24, 0x00));

    let response = run_with_data(&mut unit, &rw_cdb(0x0a, 0x01, 0xff_ffff), &block(1))?;
    assert_eq!(sense_code(&response), (SENSE_KEY_ILLEGAL_REQUEST, 0x24, 0x00));
    assert_eq!(block_number(&mut unit)?, 0);

    // a single fixed block still fits
    let response = run_with_data(&mut unit, &rw_cdb(0x0a, 0x01, 1), &vec![7u8; 0x80_0000])?;
    assert_eq!(response.status, SAM_STAT_GOOD);
    assert_eq!(block_number(&mut unit)?, 1);

    Ok(())
}

#[test]
fn request_sense_after_check_condition() -> Result<(), Error> {
    let mut unit = drive_unit()?;
    unit.clear_unit_attention();

    let response = run(&mut unit, &rw_cdb(0x08, 0, BLOCK_SIZE))?;
    assert_eq!(sense_code(&response), (SENSE_KEY_NOT_READY, 0x3a, 0x00));

    // the autosense data is also kept for REQUEST SENSE
    let response = run(&mut unit, &[0x03, 0, 0, 0, 18, 0])?;
    assert_eq!(response.status, SAM_STAT_GOOD);
    assert_eq!(response.data[2] & 0x0f, SENSE_KEY_NOT_READY);
    assert_eq!(response.data[12], 0x3a);

    Ok(())
}
