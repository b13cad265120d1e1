//! SMC command handlers

use crate::dispatch::{Command, DispatchTable};
use crate::sense::{ScsiError, SenseInfo};
use crate::spc;
use crate::unit::{LogicalUnit, ScsiCommand};

use super::element_status::{read_element_status as element_status, ElementStatusRequest};
use super::{ElementId, ElementType, Library};

pub(super) fn register(table: &mut DispatchTable) {
    table.set(0x00, Command::media("TEST UNIT READY", test_unit_ready));
    table.set(0x07, Command::media("INITIALIZE ELEMENT STATUS", initialize_element_status));
    table.set(
        0x1b,
        Command::media("OPEN/CLOSE IMPORT/EXPORT ELEMENT", open_close_import_export),
    );
    table.set(0x1e, Command::new("PREVENT ALLOW MEDIUM REMOVAL", prevent_allow));
    table.set(0x2b, Command::media("POSITION TO ELEMENT", position_to_element));
    table.set(0xa5, Command::media("MOVE MEDIUM", move_medium));
    table.set(0xb8, Command::media("READ ELEMENT STATUS", read_element_status));
    table.set(
        0xe7,
        Command::media("INITIALIZE ELEMENT STATUS WITH RANGE", initialize_element_status_range),
    );
}

fn cdb_u16(cdb: &[u8], byte: usize) -> u16 {
    u16::from_be_bytes([cdb[byte], cdb[byte + 1]])
}

/// Element address field of the CDB
fn element_at(library: &Library, cdb: &[u8], byte: usize) -> Result<ElementId, SenseInfo> {
    library
        .locate(cdb_u16(cdb, byte))
        .ok_or_else(|| SenseInfo::INVALID_ELEMENT_ADDRESS.cdb_field(byte as u16, None))
}

/// Medium transport address field, zero selects the default transport
fn check_transport(library: &Library, cdb: &[u8], byte: usize) -> Result<(), SenseInfo> {
    if cdb_u16(cdb, byte) == 0 {
        return Ok(());
    }
    match element_at(library, cdb, byte)? {
        ElementId {
            element_type: ElementType::Transport,
            ..
        } => Ok(()),
        _ => Err(SenseInfo::INVALID_ELEMENT_ADDRESS.cdb_field(byte as u16, None)),
    }
}

fn test_unit_ready(_unit: &mut LogicalUnit, _cmd: &mut ScsiCommand) -> Result<Vec<u8>, ScsiError> {
    Ok(Vec::new())
}

fn initialize_element_status(
    unit: &mut LogicalUnit,
    _cmd: &mut ScsiCommand,
) -> Result<Vec<u8>, ScsiError> {
    let count = unit.library()?.elements().len();
    log::info!("unit {}: inventory of {} elements", unit.identity.id, count);
    Ok(Vec::new())
}

fn initialize_element_status_range(
    unit: &mut LogicalUnit,
    cmd: &mut ScsiCommand,
) -> Result<Vec<u8>, ScsiError> {
    if cmd.cdb.len() < 10 {
        return Err(SenseInfo::INVALID_FIELD_IN_CDB.cdb_field(0, None).into());
    }
    if cmd.cdb[1] & 0x01 == 0 {
        return initialize_element_status(unit, cmd);
    }

    let library = unit.library()?;
    let first = element_at(library, cmd.cdb, 2)?;
    let count = cdb_u16(cmd.cdb, 6);
    let start = library.address_of(first);
    log::info!(
        "unit {}: inventory of {} elements from {:04x}h",
        unit.identity.id,
        count,
        start
    );
    Ok(Vec::new())
}

fn open_close_import_export(
    unit: &mut LogicalUnit,
    cmd: &mut ScsiCommand,
) -> Result<Vec<u8>, ScsiError> {
    let action = cmd.cdb[4] & 0x1f;
    let library = unit.library()?;

    match element_at(library, cmd.cdb, 2)? {
        ElementId {
            element_type: ElementType::ImportExport,
            ..
        } => {}
        _ => return Err(SenseInfo::INVALID_ELEMENT_ADDRESS.cdb_field(2, None).into()),
    }

    match action {
        0x00 => library.open_map()?,
        0x01 => library.close_map(),
        _ => return Err(SenseInfo::INVALID_FIELD_IN_CDB.cdb_field(4, Some(4)).into()),
    }
    log::info!(
        "unit {}: import/export station {}",
        unit.identity.id,
        if action == 0 { "opened" } else { "closed" }
    );
    Ok(Vec::new())
}

fn prevent_allow(unit: &mut LogicalUnit, cmd: &mut ScsiCommand) -> Result<Vec<u8>, ScsiError> {
    let prevent = cmd.cdb[4] & 0x03 != 0;
    unit.library()?.prevent_removal = prevent;
    Ok(Vec::new())
}

fn position_to_element(
    unit: &mut LogicalUnit,
    cmd: &mut ScsiCommand,
) -> Result<Vec<u8>, ScsiError> {
    if cmd.cdb[8] & 0x01 != 0 {
        return Err(SenseInfo::INVALID_FIELD_IN_CDB.cdb_field(8, Some(0)).into());
    }
    let library = unit.library()?;
    check_transport(library, cmd.cdb, 2)?;
    let destination = element_at(library, cmd.cdb, 4)?;
    log::debug!("transport positioned at {:04x}h", library.address_of(destination));
    Ok(Vec::new())
}

fn move_medium(unit: &mut LogicalUnit, cmd: &mut ScsiCommand) -> Result<Vec<u8>, ScsiError> {
    if cmd.cdb[10] & 0x01 != 0 {
        // no support for flipping cartridges
        return Err(SenseInfo::INVALID_FIELD_IN_CDB.cdb_field(10, Some(0)).into());
    }
    let library = unit.library()?;
    check_transport(library, cmd.cdb, 2)?;
    let from = element_at(library, cmd.cdb, 4)?;
    let to = element_at(library, cmd.cdb, 6)?;
    library.move_medium(from, to)?;
    Ok(Vec::new())
}

fn read_element_status(
    unit: &mut LogicalUnit,
    cmd: &mut ScsiCommand,
) -> Result<Vec<u8>, ScsiError> {
    let element_type = match cmd.cdb[1] & 0x0f {
        0 => None,
        code => Some(
            ElementType::from_code(code)
                .ok_or_else(|| SenseInfo::INVALID_FIELD_IN_CDB.cdb_field(1, Some(3)))?,
        ),
    };
    let request = ElementStatusRequest {
        element_type,
        start: cdb_u16(cmd.cdb, 2),
        count: cdb_u16(cmd.cdb, 4),
        volume_tag: cmd.cdb[1] & 0x10 != 0,
        dvcid: cmd.cdb[6] & 0x01 != 0,
    };
    let allocation_length =
        u32::from_be_bytes([0, cmd.cdb[7], cmd.cdb[8], cmd.cdb[9]]) as usize;

    let library = unit.library()?;
    let data = element_status(library, &request)?;
    Ok(spc::truncate(data, allocation_length))
}
