//! SSC command handlers

use endian_trait::Endian;

use proxmox_io::WriteExt;

use vtl_api_types::DeviceActivity;

use crate::dispatch::{Command, DispatchTable, ServiceActionField};
use crate::personality::MediumAccess;
use crate::sense::{ScsiError, SenseInfo, SENSE_KEY_NO_SENSE};
use crate::spc;
use crate::unit::{LogicalUnit, ScsiCommand};

use super::encryption::{
    capabilities_page, decode_set_data_encryption, next_block_status_page,
    security_protocol_list, status_page, supported_key_formats_page, supported_pages_page,
    SECURITY_PROTOCOL_INFO, SECURITY_PROTOCOL_TAPE, SPIN_CAPABILITIES, SPIN_NEXT_BLOCK_STATUS,
    SPIN_STATUS, SPIN_SUPPORTED_KEY_FORMATS, SPIN_SUPPORTED_PAGES, SPOUT_SET_DATA_ENCRYPTION,
};
use super::mam::{read_attribute_response, MamContext, READ_ATTRIBUTE_LIST, READ_ATTRIBUTE_VALUES};
use super::mode_pages::{compression_enabled, prog_early_warning_size};
use super::report_density::report_density_support;
use super::tape_alert_flags::TapeAlertFlags;
use super::tape_image::WriteOptions;
use super::{drive_parts, TapeDrive, SECURITY_PROTOCOL_IN, SECURITY_PROTOCOL_OUT};

/// Largest data transfer of a single READ or WRITE command
pub const MAX_TRANSFER_LENGTH: usize = 64 * 1024 * 1024;

/// Transfer length in bytes, or INVALID FIELD IN CDB if it exceeds
/// [MAX_TRANSFER_LENGTH]
fn transfer_length(fixed: bool, length: usize, block_size: u32) -> Result<usize, ScsiError> {
    let bytes = if fixed {
        length.checked_mul(block_size as usize)
    } else {
        Some(length)
    };
    match bytes {
        Some(bytes) if bytes <= MAX_TRANSFER_LENGTH => Ok(bytes),
        _ => Err(SenseInfo::INVALID_FIELD_IN_CDB.cdb_field(2, None).into()),
    }
}

pub(super) fn register(table: &mut DispatchTable) {
    table.set(0x00, Command::media("TEST UNIT READY", test_unit_ready));
    table.set(0x01, Command::media("REWIND", rewind));
    table.set(0x04, Command::media("FORMAT MEDIUM", format_medium));
    table.set(0x05, Command::new("READ BLOCK LIMITS", read_block_limits));
    table.set(0x08, Command::media("READ(6)", read6));
    table.set(0x0a, Command::media("WRITE(6)", write6));
    table.set(0x10, Command::media("WRITE FILEMARKS(6)", write_filemarks6));
    table.set(0x11, Command::media("SPACE(6)", space6));
    table.set(0x19, Command::media("ERASE(6)", erase));
    table.set(0x1b, Command::media("LOAD UNLOAD", load_unload));
    table.set(0x1e, Command::new("PREVENT ALLOW MEDIUM REMOVAL", prevent_allow));
    table.set(0x2b, Command::media("LOCATE(10)", locate10));
    table.set(0x44, Command::new("REPORT DENSITY SUPPORT", report_density));
    table.set(0x80, Command::media("WRITE FILEMARKS(16)", write_filemarks16));
    table.set(0x8c, Command::media("READ ATTRIBUTE", read_attribute));
    table.set(0x91, Command::media("SPACE(16)", space16));
    table.set(0x92, Command::media("LOCATE(16)", locate16));

    for (action, name) in [(0x00, "READ POSITION SHORT"), (0x01, "READ POSITION SHORT VENDOR")] {
        table.set_service_action(
            0x34,
            ServiceActionField::Byte1,
            action,
            Command::media(name, read_position_short),
        );
    }
    table.set_service_action(
        0x34,
        ServiceActionField::Byte1,
        0x06,
        Command::media("READ POSITION LONG", read_position_long),
    );

    table.set_service_action(
        SECURITY_PROTOCOL_IN,
        ServiceActionField::Protocol,
        SECURITY_PROTOCOL_INFO,
        Command::new("SECURITY PROTOCOL IN", security_protocol_in),
    );
    table.set_service_action(
        SECURITY_PROTOCOL_IN,
        ServiceActionField::Protocol,
        SECURITY_PROTOCOL_TAPE,
        Command::new("SECURITY PROTOCOL IN", security_protocol_in),
    );
    table.set_service_action(
        SECURITY_PROTOCOL_OUT,
        ServiceActionField::Protocol,
        SECURITY_PROTOCOL_TAPE,
        Command::new("SECURITY PROTOCOL OUT", security_protocol_out),
    );
}

fn be_u24(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]])
}

/// Two's complement 24 bit count
fn be_i24(bytes: &[u8]) -> i64 {
    ((be_u24(bytes) << 8) as i32 >> 8) as i64
}

/// Conditions which only report where the transfer stopped
fn is_position_condition(sense: &SenseInfo) -> bool {
    sense.stream != 0 || sense.sense_key == SENSE_KEY_NO_SENSE || *sense == SenseInfo::END_OF_DATA
}

impl TapeDrive {
    /// Read `length` bytes (variable mode) or `length` blocks (fixed mode)
    ///
    /// Returns the data together with the condition that ended the
    /// transfer early. The information field holds the residue, in
    /// bytes for variable and in blocks for fixed mode.
    fn read_blocks(
        &mut self,
        fixed: bool,
        length: usize,
        sili: bool,
    ) -> Result<(Vec<u8>, Option<SenseInfo>), ScsiError> {
        self.ready()?;

        let (count, block_len) = if fixed {
            (length, self.block_size as usize)
        } else {
            (1, length)
        };

        let TapeDrive {
            medium,
            encryption,
            counters,
            tape_alert,
            activity,
            ..
        } = self;
        let medium = medium.as_mut().ok_or(SenseInfo::MEDIUM_NOT_PRESENT)?;

        let mut data = Vec::with_capacity(block_len);
        let mut condition = None;

        for done in 0..count {
            match medium.image.read_block(block_len, sili, encryption) {
                Ok(block) => {
                    counters.blocks_read += 1;
                    counters.bytes_from_media += block.block_size as u64;

                    if block.ili {
                        let residue = if fixed {
                            (count - done) as u32
                        } else {
                            data.extend(block.data);
                            // negative for overlength blocks
                            (length as i64 - block.block_size as i64) as u32
                        };
                        condition = Some(SenseInfo::INCORRECT_LENGTH.information(residue));
                        break;
                    }
                    data.extend(block.data);
                }
                Err(ScsiError::Sense(sense)) => {
                    if !is_position_condition(&sense) {
                        if sense == SenseInfo::UNRECOVERED_READ_ERROR
                            || sense == SenseInfo::MEDIUM_FORMAT_CORRUPTED
                        {
                            counters.read_errors += 1;
                            *tape_alert |= TapeAlertFlags::READ_FAILURE;
                        }
                        if done == 0 {
                            return Err(sense.into());
                        }
                    }
                    let residue = if fixed { count - done } else { length };
                    condition = Some(sense.information(residue as u32));
                    break;
                }
                Err(err) => return Err(err),
            }
        }

        counters.bytes_to_initiator += data.len() as u64;
        *activity = if encryption.key.is_some() {
            DeviceActivity::ReadingEncrypted
        } else {
            DeviceActivity::Reading
        };

        Ok((data, condition))
    }

    /// Write `data` as one variable block or as fixed blocks of
    /// `block_size` bytes
    fn write_blocks(
        &mut self,
        fixed: bool,
        data: &[u8],
        compression: Option<u32>,
        early_warning: &dyn Fn(u64) -> u64,
        prog_early_warning: u64,
    ) -> Result<Option<SenseInfo>, ScsiError> {
        self.ready()?;

        let block_len = if fixed {
            self.block_size as usize
        } else {
            data.len()
        };

        let TapeDrive {
            medium,
            encryption,
            counters,
            tape_alert,
            activity,
            ..
        } = self;
        let medium = medium.as_mut().ok_or(SenseInfo::MEDIUM_NOT_PRESENT)?;

        if !medium.access.writable() {
            *tape_alert |= TapeAlertFlags::WRITE_PROTECT;
            return Err(SenseInfo::WRITE_PROTECTED.into());
        }

        let key = encryption.write_key();
        if key.is_some() && medium.access != MediumAccess::Encrypt {
            log::warn!("medium '{}' cannot hold encrypted data", medium.barcode);
            *tape_alert |= TapeAlertFlags::ENCRYPTION_POLICY_VIOLATION;
            return Err(SenseInfo::INCOMPATIBLE_MEDIUM.into());
        }

        let options = WriteOptions {
            compression,
            encryption: key,
            early_warning: early_warning(medium.image.mam().max_capacity),
            prog_early_warning,
        };

        *activity = if key.is_some() {
            DeviceActivity::WritingEncrypted
        } else {
            DeviceActivity::Writing
        };

        let count = data.len() / block_len;
        let mut condition = None;

        for (done, block) in data.chunks_exact(block_len).enumerate() {
            match medium.image.write_block(block, &options) {
                Ok(status) => {
                    counters.blocks_written += 1;
                    counters.bytes_from_initiator += block.len() as u64;
                    counters.bytes_to_media += block.len() as u64;
                    if status.early_warning {
                        condition = Some(SenseInfo::END_OF_PARTITION);
                    } else if status.prog_early_warning {
                        condition = Some(SenseInfo::PROGRAMMABLE_EARLY_WARNING);
                    }
                }
                Err(ScsiError::Sense(sense)) => {
                    note_write_failure(tape_alert, &mut counters.write_errors, &sense);
                    let residue = if fixed { count - done } else { block_len };
                    return Err(sense.information(residue as u32).into());
                }
                Err(err) => return Err(err),
            }
        }

        Ok(condition)
    }

    fn write_filemarks(&mut self, count: u32) -> Result<(), ScsiError> {
        if count > 0 && !self.ready()?.access.writable() {
            self.tape_alert |= TapeAlertFlags::WRITE_PROTECT;
            return Err(SenseInfo::WRITE_PROTECTED.into());
        }
        let result = self.ready()?.image.write_filemarks(count);
        if let Err(ScsiError::Sense(ref sense)) = result {
            note_write_failure(&mut self.tape_alert, &mut self.counters.write_errors, sense);
        }
        result
    }

    fn erase_medium(&mut self) -> Result<(), ScsiError> {
        if !self.ready()?.access.writable() {
            self.tape_alert |= TapeAlertFlags::WRITE_PROTECT;
            return Err(SenseInfo::WRITE_PROTECTED.into());
        }
        self.activity = DeviceActivity::Erasing;
        let result = self.ready()?.image.erase();
        if let Err(ScsiError::Sense(ref sense)) = result {
            note_write_failure(&mut self.tape_alert, &mut self.counters.write_errors, sense);
        }
        result
    }
}

fn note_write_failure(tape_alert: &mut TapeAlertFlags, write_errors: &mut u64, sense: &SenseInfo) {
    if *sense == SenseInfo::WORM_OVERWRITE_ATTEMPTED {
        *tape_alert |= TapeAlertFlags::WORM_OVERWRITE_ATTEMPTED;
    } else if *sense == SenseInfo::WRITE_PROTECTED {
        *tape_alert |= TapeAlertFlags::WRITE_PROTECT;
    } else if *sense == SenseInfo::WRITE_ERROR {
        *tape_alert |= TapeAlertFlags::WRITE_FAILURE;
        *write_errors += 1;
    }
}

fn test_unit_ready(unit: &mut LogicalUnit, _cmd: &mut ScsiCommand) -> Result<Vec<u8>, ScsiError> {
    let drive = unit.tape_drive()?;
    drive.poll_cleaning();
    if drive.is_cleaning() {
        return Err(SenseInfo::CLEANING_CARTRIDGE_INSTALLED.into());
    }
    if drive.medium().is_none() {
        return Err(SenseInfo::MEDIUM_NOT_PRESENT.into());
    }
    Ok(Vec::new())
}

fn rewind(unit: &mut LogicalUnit, _cmd: &mut ScsiCommand) -> Result<Vec<u8>, ScsiError> {
    let drive = unit.tape_drive()?;
    drive.ready()?.image.rewind()?;
    drive.activity = DeviceActivity::Rewinding;
    Ok(Vec::new())
}

fn format_medium(unit: &mut LogicalUnit, cmd: &mut ScsiCommand) -> Result<Vec<u8>, ScsiError> {
    // 0: default, 1: partition, 2: default then partition
    if cmd.cdb[2] & 0x0f > 2 {
        return Err(SenseInfo::INVALID_FIELD_IN_CDB.cdb_field(2, Some(3)).into());
    }
    let drive = unit.tape_drive()?;
    if !drive.ready()?.image.at_bot() {
        return Err(SenseInfo::SEQUENTIAL_POSITIONING_ERROR.into());
    }
    drive.erase_medium()?;
    drive.activity = DeviceActivity::Formatting;
    Ok(Vec::new())
}

fn read_block_limits(unit: &mut LogicalUnit, _cmd: &mut ScsiCommand) -> Result<Vec<u8>, ScsiError> {
    let max_block_size = unit.personality().max_block_size();
    let mut data = vec![0u8; 6];
    data[1..4].copy_from_slice(&max_block_size.to_be_bytes()[1..]);
    data[4..6].copy_from_slice(&1u16.to_be_bytes());
    Ok(data)
}

fn read6(unit: &mut LogicalUnit, cmd: &mut ScsiCommand) -> Result<Vec<u8>, ScsiError> {
    let fixed = cmd.cdb[1] & 0x01 != 0;
    let sili = cmd.cdb[1] & 0x02 != 0;
    let length = be_u24(&cmd.cdb[2..5]) as usize;

    if fixed && sili {
        return Err(SenseInfo::INVALID_FIELD_IN_CDB.cdb_field(1, Some(1)).into());
    }

    let drive = unit.tape_drive()?;
    if fixed && drive.block_size == 0 {
        return Err(SenseInfo::INVALID_FIELD_IN_CDB.cdb_field(1, Some(0)).into());
    }
    if length == 0 {
        return Ok(Vec::new());
    }
    transfer_length(fixed, length, drive.block_size)?;

    let (data, condition) = drive.read_blocks(fixed, length, sili)?;
    if let Some(sense) = condition {
        cmd.check_condition(sense);
    }
    Ok(data)
}

fn write6(unit: &mut LogicalUnit, cmd: &mut ScsiCommand) -> Result<Vec<u8>, ScsiError> {
    let fixed = cmd.cdb[1] & 0x01 != 0;
    let length = be_u24(&cmd.cdb[2..5]) as usize;

    let personality = unit.personality();
    let (drive, pages) = drive_parts(unit)?;

    if fixed && drive.block_size == 0 {
        return Err(SenseInfo::INVALID_FIELD_IN_CDB.cdb_field(1, Some(0)).into());
    }
    if length == 0 {
        return Ok(Vec::new());
    }

    if !fixed && length > personality.max_block_size() as usize {
        return Err(SenseInfo::INVALID_FIELD_IN_CDB.cdb_field(2, None).into());
    }
    let transfer_len = transfer_length(fixed, length, drive.block_size)?;

    let compression = if compression_enabled(pages) {
        Some(drive.compression_level())
    } else {
        None
    };
    let prog_early_warning = prog_early_warning_size(pages).unwrap_or(0);

    let data = cmd.payload(transfer_len)?;
    if data.len() != transfer_len {
        return Err(SenseInfo::INVALID_FIELD_IN_CDB.cdb_field(2, None).into());
    }

    let condition = drive.write_blocks(
        fixed,
        &data,
        compression,
        &|capacity| personality.early_warning_size(capacity),
        prog_early_warning,
    )?;
    if let Some(sense) = condition {
        cmd.check_condition(sense);
    }
    Ok(Vec::new())
}

fn write_filemarks6(unit: &mut LogicalUnit, cmd: &mut ScsiCommand) -> Result<Vec<u8>, ScsiError> {
    if cmd.cdb[1] & 0x02 != 0 {
        // setmarks are obsolete
        return Err(SenseInfo::INVALID_FIELD_IN_CDB.cdb_field(1, Some(1)).into());
    }
    let count = be_u24(&cmd.cdb[2..5]);
    unit.tape_drive()?.write_filemarks(count)?;
    Ok(Vec::new())
}

fn write_filemarks16(unit: &mut LogicalUnit, cmd: &mut ScsiCommand) -> Result<Vec<u8>, ScsiError> {
    if cmd.cdb[1] & 0x02 != 0 {
        return Err(SenseInfo::INVALID_FIELD_IN_CDB.cdb_field(1, Some(1)).into());
    }
    if cmd.cdb[3] != 0 {
        // single partition only
        return Err(SenseInfo::INVALID_FIELD_IN_CDB.cdb_field(3, None).into());
    }
    let count = be_u24(&cmd.cdb[12..15]);
    unit.tape_drive()?.write_filemarks(count)?;
    Ok(Vec::new())
}

fn space(unit: &mut LogicalUnit, code: u8, count: i64) -> Result<Vec<u8>, ScsiError> {
    let drive = unit.tape_drive()?;
    let medium = drive.ready()?;
    match code {
        0 => medium.image.space_blocks(count)?,
        1 => medium.image.space_filemarks(count)?,
        3 => medium.image.space_eod()?,
        _ => return Err(SenseInfo::INVALID_FIELD_IN_CDB.cdb_field(1, Some(3)).into()),
    }
    drive.activity = DeviceActivity::Locating;
    Ok(Vec::new())
}

fn space6(unit: &mut LogicalUnit, cmd: &mut ScsiCommand) -> Result<Vec<u8>, ScsiError> {
    let code = cmd.cdb[1] & 0x0f;
    let count = be_i24(&cmd.cdb[2..5]);
    space(unit, code, count)
}

fn space16(unit: &mut LogicalUnit, cmd: &mut ScsiCommand) -> Result<Vec<u8>, ScsiError> {
    let code = cmd.cdb[1] & 0x0f;
    let mut count = [0u8; 8];
    count.copy_from_slice(&cmd.cdb[4..12]);
    space(unit, code, i64::from_be_bytes(count))
}

fn locate(unit: &mut LogicalUnit, dest_type: u8, address: u64) -> Result<Vec<u8>, ScsiError> {
    let drive = unit.tape_drive()?;
    let medium = drive.ready()?;
    match dest_type {
        0 => medium.image.locate_block(address)?,
        1 => medium.image.locate_filemark(address)?,
        3 => medium.image.space_eod()?,
        _ => return Err(SenseInfo::INVALID_FIELD_IN_CDB.cdb_field(1, Some(5)).into()),
    }
    drive.activity = DeviceActivity::Locating;
    Ok(Vec::new())
}

fn locate10(unit: &mut LogicalUnit, cmd: &mut ScsiCommand) -> Result<Vec<u8>, ScsiError> {
    // CP: change partition
    if cmd.cdb[1] & 0x02 != 0 && cmd.cdb[8] != 0 {
        return Err(SenseInfo::INVALID_FIELD_IN_CDB.cdb_field(8, None).into());
    }
    let address = u32::from_be_bytes([cmd.cdb[3], cmd.cdb[4], cmd.cdb[5], cmd.cdb[6]]);
    locate(unit, 0, address as u64)
}

fn locate16(unit: &mut LogicalUnit, cmd: &mut ScsiCommand) -> Result<Vec<u8>, ScsiError> {
    if cmd.cdb[1] & 0x02 != 0 && cmd.cdb[3] != 0 {
        return Err(SenseInfo::INVALID_FIELD_IN_CDB.cdb_field(3, None).into());
    }
    let dest_type = (cmd.cdb[1] >> 3) & 0x07;
    let mut address = [0u8; 8];
    address.copy_from_slice(&cmd.cdb[4..12]);
    locate(unit, dest_type, u64::from_be_bytes(address))
}

#[repr(C, packed)]
#[derive(Endian, Debug, Copy, Clone)]
struct ReadPositionShortPage {
    flags: u8,
    partition_number: u8,
    reserved: [u8; 2],
    first_block: u32,
    last_block: u32,
    reserved2: u8,
    blocks_in_buffer: [u8; 3],
    bytes_in_buffer: u32,
}

#[repr(C, packed)]
#[derive(Endian, Debug, Copy, Clone)]
struct ReadPositionLongPage {
    flags: u8,
    reserved: [u8; 3],
    partition_number: u32,
    logical_object_number: u64,
    logical_file_id: u64,
    obsolete: [u8; 8],
}

const POSITION_BOP: u8 = 0x80;
const POSITION_EOP: u8 = 0x40;

fn position_flags(unit: &mut LogicalUnit) -> Result<(u8, u64, u64), ScsiError> {
    let personality = unit.personality();
    let medium = unit.tape_drive()?.ready()?;
    let position = medium.image.position();
    let early_warning = personality.early_warning_size(medium.image.mam().max_capacity);

    let mut flags = 0;
    if medium.image.at_bot() {
        flags |= POSITION_BOP;
    }
    if medium.image.in_early_warning(early_warning) {
        flags |= POSITION_EOP;
    }
    Ok((flags, position.block_number, position.filemarks))
}

fn read_position_short(unit: &mut LogicalUnit, _cmd: &mut ScsiCommand) -> Result<Vec<u8>, ScsiError> {
    let (flags, block_number, _) = position_flags(unit)?;
    let block_number = u32::try_from(block_number)
        .map_err(|_| ScsiError::from(SenseInfo::INVALID_FIELD_IN_CDB.cdb_field(1, Some(4))))?;

    let page = ReadPositionShortPage {
        flags,
        partition_number: 0,
        reserved: [0; 2],
        first_block: block_number,
        last_block: block_number,
        reserved2: 0,
        blocks_in_buffer: [0; 3],
        bytes_in_buffer: 0,
    };
    let mut data = Vec::with_capacity(20);
    unsafe { data.write_be_value(page)? };
    Ok(data)
}

fn read_position_long(unit: &mut LogicalUnit, _cmd: &mut ScsiCommand) -> Result<Vec<u8>, ScsiError> {
    let (flags, block_number, filemarks) = position_flags(unit)?;

    let page = ReadPositionLongPage {
        flags,
        reserved: [0; 3],
        partition_number: 0,
        logical_object_number: block_number,
        logical_file_id: filemarks,
        obsolete: [0; 8],
    };
    let mut data = Vec::with_capacity(32);
    unsafe { data.write_be_value(page)? };
    Ok(data)
}

fn erase(unit: &mut LogicalUnit, cmd: &mut ScsiCommand) -> Result<Vec<u8>, ScsiError> {
    let long = cmd.cdb[1] & 0x01 != 0;
    let drive = unit.tape_drive()?;
    drive.erase_medium()?;
    if long {
        log::info!("long erase finished");
    }
    Ok(Vec::new())
}

fn load_unload(unit: &mut LogicalUnit, cmd: &mut ScsiCommand) -> Result<Vec<u8>, ScsiError> {
    let load = cmd.cdb[4] & 0x01 != 0;
    let hold = cmd.cdb[4] & 0x08 != 0;

    let drive = unit.tape_drive()?;
    if load {
        let medium = drive.medium_mut().ok_or(SenseInfo::MEDIUM_NOT_PRESENT)?;
        medium.image.rewind()?;
        return Ok(Vec::new());
    }

    if drive.prevent_removal {
        return Err(SenseInfo::MEDIUM_REMOVAL_PREVENTED.into());
    }
    let medium = drive.medium_mut().ok_or(SenseInfo::MEDIUM_NOT_PRESENT)?;
    if hold {
        medium.image.rewind()?;
        return Ok(Vec::new());
    }

    unit.unload_medium()?;
    Ok(Vec::new())
}

fn prevent_allow(unit: &mut LogicalUnit, cmd: &mut ScsiCommand) -> Result<Vec<u8>, ScsiError> {
    let prevent = cmd.cdb[4] & 0x03 != 0;
    unit.tape_drive()?.prevent_removal = prevent;
    Ok(Vec::new())
}

fn report_density(unit: &mut LogicalUnit, cmd: &mut ScsiCommand) -> Result<Vec<u8>, ScsiError> {
    let media = cmd.cdb[1] & 0x01 != 0;
    let allocation_length = u16::from_be_bytes([cmd.cdb[7], cmd.cdb[8]]) as usize;

    let personality = unit.personality();
    let current = if media {
        let medium = unit.tape_drive()?.medium().ok_or(SenseInfo::MEDIUM_NOT_PRESENT)?;
        Some(medium.image.mam().density_code)
    } else {
        None
    };

    let data = report_density_support(personality.densities(), current)?;
    Ok(spc::truncate(data, allocation_length))
}

fn read_attribute(unit: &mut LogicalUnit, cmd: &mut ScsiCommand) -> Result<Vec<u8>, ScsiError> {
    let service_action = cmd.cdb[1] & 0x1f;
    if service_action != READ_ATTRIBUTE_VALUES && service_action != READ_ATTRIBUTE_LIST {
        return Err(SenseInfo::INVALID_FIELD_IN_CDB.cdb_field(1, Some(4)).into());
    }
    let first_attribute = u16::from_be_bytes([cmd.cdb[8], cmd.cdb[9]]);
    let allocation_length =
        u32::from_be_bytes([cmd.cdb[10], cmd.cdb[11], cmd.cdb[12], cmd.cdb[13]]) as usize;

    let vendor = unit.identity.vendor.clone();
    let medium = unit
        .tape_drive()?
        .medium()
        .ok_or(SenseInfo::MEDIUM_NOT_PRESENT)?;

    let context = MamContext {
        remaining_capacity: medium.image.remaining_capacity()?,
        vendor,
    };
    let data = read_attribute_response(service_action, first_attribute, medium.image.mam(), &context)?;
    Ok(spc::truncate(data, allocation_length))
}

fn security_protocol_in(unit: &mut LogicalUnit, cmd: &mut ScsiCommand) -> Result<Vec<u8>, ScsiError> {
    let protocol = cmd.cdb[1];
    let page_code = u16::from_be_bytes([cmd.cdb[2], cmd.cdb[3]]);
    let allocation_length =
        u32::from_be_bytes([cmd.cdb[6], cmd.cdb[7], cmd.cdb[8], cmd.cdb[9]]) as usize;

    let invalid_page = || ScsiError::from(SenseInfo::INVALID_FIELD_IN_CDB.cdb_field(2, None));

    let personality = unit.personality();
    let drive = unit.tape_drive()?;

    let data = match (protocol, page_code) {
        (SECURITY_PROTOCOL_INFO, 0x0000) => security_protocol_list(),
        (SECURITY_PROTOCOL_INFO, _) => return Err(invalid_page()),
        (_, SPIN_SUPPORTED_PAGES) => supported_pages_page()?,
        (_, SPIN_SUPPORTED_KEY_FORMATS) => supported_key_formats_page()?,
        (_, SPIN_CAPABILITIES) => {
            let algorithms = personality.encryption_capabilities()?;
            let medium_capable = drive
                .medium()
                .map(|medium| medium.access == MediumAccess::Encrypt)
                .unwrap_or(true);
            capabilities_page(&algorithms, medium_capable)?
        }
        (_, SPIN_STATUS) => status_page(&drive.encryption)?,
        (_, SPIN_NEXT_BLOCK_STATUS) => {
            drive.ready()?;
            let medium = drive.medium().ok_or(SenseInfo::MEDIUM_NOT_PRESENT)?;
            let position = medium.image.position();
            let status = medium.image.next_block_status(&drive.encryption);
            next_block_status_page(position.block_number, status, drive.encryption.algorithm_index)?
        }
        _ => return Err(invalid_page()),
    };

    Ok(spc::truncate(data, allocation_length))
}

fn security_protocol_out(unit: &mut LogicalUnit, cmd: &mut ScsiCommand) -> Result<Vec<u8>, ScsiError> {
    let page_code = u16::from_be_bytes([cmd.cdb[2], cmd.cdb[3]]);
    let transfer_length =
        u32::from_be_bytes([cmd.cdb[6], cmd.cdb[7], cmd.cdb[8], cmd.cdb[9]]) as usize;

    if page_code != SPOUT_SET_DATA_ENCRYPTION {
        return Err(SenseInfo::INVALID_FIELD_IN_CDB.cdb_field(2, None).into());
    }

    let data = cmd.payload(transfer_length)?;
    let request = decode_set_data_encryption(&data)?;

    let personality = unit.personality();
    personality.kad_validation(request.key.ukad.len(), request.key.akad.len())?;

    if request.encrypt || !request.key.key.is_empty() {
        let algorithms = personality.encryption_capabilities()?;
        let algorithm = algorithms
            .iter()
            .find(|algorithm| algorithm.algorithm_index == request.algorithm_index)
            .ok_or(SenseInfo::INVALID_FIELD_IN_PARAMETER_LIST.parameter_field(8, None))?;
        if request.key.key.len() != algorithm.key_size as usize {
            return Err(SenseInfo::INVALID_FIELD_IN_PARAMETER_LIST
                .parameter_field(18, None)
                .into());
        }
    }

    let encrypt = request.encrypt;
    let (drive, pages) = drive_parts(unit)?;
    // drive state only changes after the vendor page accepted the mode
    personality.update_encryption_mode(pages, encrypt)?;
    drive.encryption.apply(request);
    log::info!(
        "data encryption {} (decrypt mode {:?})",
        if encrypt { "enabled" } else { "disabled" },
        drive.encryption.decrypt
    );

    Ok(Vec::new())
}
