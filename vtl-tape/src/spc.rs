//! Primary commands shared by tape drives and libraries (SPC)
//!
//! INQUIRY and the VPD pages, sense reporting, mode and log page
//! access, persistent reservations and REPORT SUPPORTED OPERATION CODES.

use anyhow::Error;
use endian_trait::Endian;

use proxmox_io::{ReadExt, WriteExt};

use vtl_api_types::DeviceType;

use crate::dispatch::{cdb_length, Command, DispatchTable, ServiceActionField};
use crate::pages::{Page, PageControl, PageKind, PageRegistry};
use crate::reservation::{ReservationState, ReserveOutAction, ReserveOutParameters};
use crate::sense::{ScsiError, SenseInfo};
use crate::ssc::log_pages::LP_TAPE_ALERT;
use crate::ssc::mode_pages::{MP_DATA_COMPRESSION, MP_DEVICE_CONFIGURATION};
use crate::ssc::tape_alert_flags::TapeAlertFlags;
use crate::unit::{Device, LogicalUnit, ScsiCommand, UnitIdentity};

const INQUIRY_LEN: usize = 96;

#[repr(C, packed)]
#[derive(Endian, Debug, Copy, Clone)]
struct InquiryPage {
    peripheral_type: u8,
    rmb: u8,
    version: u8,
    flags3: u8,
    additional_length: u8,
    flags5: u8,
    flags6: u8,
    flags7: u8,
    vendor: [u8; 8],
    product: [u8; 16],
    revision: [u8; 4],
}

#[repr(C, packed)]
#[derive(Endian, Debug, Copy, Clone)]
pub struct ModeParameterHeader6 {
    pub mode_data_len: u8,
    pub medium_type: u8,
    pub flags3: u8,
    pub block_descriptor_len: u8,
}

#[repr(C, packed)]
#[derive(Endian, Debug, Copy, Clone)]
pub struct ModeParameterHeader10 {
    pub mode_data_len: u16,
    pub medium_type: u8,
    pub flags3: u8,
    reserved4: [u8; 2],
    pub block_descriptor_len: u16,
}

#[repr(C, packed)]
#[derive(Endian, Debug, Copy, Clone)]
pub struct ModeBlockDescriptor {
    pub density_code: u8,
    pub number_of_blocks: [u8; 3],
    reserved: u8,
    pub block_length: [u8; 3],
}

impl ModeBlockDescriptor {
    pub fn new(density_code: u8) -> Self {
        Self {
            density_code,
            number_of_blocks: [0u8; 3],
            reserved: 0,
            block_length: [0u8; 3],
        }
    }

    pub fn block_length(&self) -> u32 {
        ((self.block_length[0] as u32) << 16)
            + ((self.block_length[1] as u32) << 8)
            + (self.block_length[2] as u32)
    }

    /// Set the 24 bit block length (higher bits are ignored)
    pub fn set_block_length(&mut self, length: u32) {
        let [_, hi, mid, lo] = length.to_be_bytes();
        self.block_length = [hi, mid, lo];
    }
}

const BLOCK_DESCRIPTOR_LEN: usize = std::mem::size_of::<ModeBlockDescriptor>();

/// Cut a response down to the allocation length
pub fn truncate(mut data: Vec<u8>, allocation_length: usize) -> Vec<u8> {
    data.truncate(allocation_length);
    data
}

/// Add a VPD page, prefixing `body` with the page header
pub fn add_vpd_page(
    pages: &mut PageRegistry,
    device_type: DeviceType,
    page_code: u8,
    body: &[u8],
) -> Result<(), Error> {
    let mut data = Vec::with_capacity(body.len() + 4);
    data.push(device_type.peripheral_type());
    data.push(page_code);
    data.extend((body.len() as u16).to_be_bytes());
    data.extend_from_slice(body);
    pages.add(PageKind::Vpd, page_code, 0, &data)?;
    Ok(())
}

/// Unit serial number (80h) and device identification (83h) pages
pub fn init_vpd_pages(
    identity: &UnitIdentity,
    pages: &mut PageRegistry,
    device_type: DeviceType,
) -> Result<(), Error> {
    add_vpd_page(pages, device_type, 0x80, identity.serial.as_bytes())?;

    let mut body = Vec::new();

    // T10 vendor identification, ASCII
    let mut designator = crate::scsi_ascii(&identity.vendor, 8);
    designator.extend(crate::scsi_ascii(&identity.product, 16));
    designator.extend(identity.serial.as_bytes());
    body.extend([0x02, 0x01, 0x00, designator.len() as u8]);
    body.extend(designator);

    // NAA, binary
    if let Some(naa) = identity.naa {
        body.extend([0x01, 0x03, 0x00, naa.len() as u8]);
        body.extend(naa);
    }

    add_vpd_page(pages, device_type, 0x83, &body)
}

/// Rebuild the supported VPD pages list (00h) from the registry
pub fn update_supported_vpd(pages: &mut PageRegistry) -> Result<(), Error> {
    let peripheral_type = match pages.iter(PageKind::Vpd).next() {
        Some(page) => page.data()[0],
        None => return Ok(()),
    };

    let mut codes: Vec<u8> = pages.iter(PageKind::Vpd).map(|page| page.page_code()).collect();
    codes.push(0x00);
    codes.sort_unstable();
    codes.dedup();

    let mut data = vec![peripheral_type, 0x00];
    data.extend((codes.len() as u16).to_be_bytes());
    data.extend(codes);
    pages.add(PageKind::Vpd, 0x00, 0, &data)?;
    Ok(())
}

pub fn register_commands(table: &mut DispatchTable) {
    table.set(0x03, Command::no_unit_attention("REQUEST SENSE", request_sense));
    table.set(0x12, Command::no_unit_attention("INQUIRY", inquiry));
    table.set(0xa0, Command::no_unit_attention("REPORT LUNS", report_luns));

    table.set(0x15, Command::new("MODE SELECT(6)", mode_select6));
    table.set(0x55, Command::new("MODE SELECT(10)", mode_select10));
    table.set(0x1a, Command::new("MODE SENSE(6)", mode_sense6));
    table.set(0x5a, Command::new("MODE SENSE(10)", mode_sense10));
    table.set(0x4c, Command::new("LOG SELECT", log_select));
    table.set(0x4d, Command::new("LOG SENSE", log_sense));

    table.set(0x16, Command::new("RESERVE(6)", reserve_release));
    table.set(0x17, Command::new("RELEASE(6)", reserve_release));

    table.set(0x1c, Command::new("RECEIVE DIAGNOSTIC RESULTS", receive_diagnostic));
    table.set(0x1d, Command::new("SEND DIAGNOSTIC", send_diagnostic));

    for (action, name) in [
        (0x00, "PERSISTENT RESERVE IN - READ KEYS"),
        (0x01, "PERSISTENT RESERVE IN - READ RESERVATION"),
        (0x02, "PERSISTENT RESERVE IN - REPORT CAPABILITIES"),
    ] {
        table.set_service_action(
            0x5e,
            ServiceActionField::Byte1,
            action,
            Command::new(name, persistent_reserve_in),
        );
    }
    for action in 0x00..=0x07 {
        table.set_service_action(
            0x5f,
            ServiceActionField::Byte1,
            action,
            Command::new("PERSISTENT RESERVE OUT", persistent_reserve_out),
        );
    }

    table.set_service_action(
        0xa3,
        ServiceActionField::Byte1,
        0x0c,
        Command::new("REPORT SUPPORTED OPERATION CODES", report_supported_opcodes),
    );
}

fn inquiry(unit: &mut LogicalUnit, cmd: &mut ScsiCommand) -> Result<Vec<u8>, ScsiError> {
    let evpd = cmd.cdb[1] & 0x01 != 0;
    let page_code = cmd.cdb[2];
    let allocation_length = u16::from_be_bytes([cmd.cdb[3], cmd.cdb[4]]) as usize;

    if cmd.cdb[1] & 0x02 != 0 {
        // CMDDT is obsolete
        return Err(SenseInfo::INVALID_FIELD_IN_CDB.cdb_field(1, Some(1)).into());
    }

    if evpd {
        let page = unit
            .pages
            .lookup(PageKind::Vpd, page_code, 0)
            .ok_or_else(|| SenseInfo::INVALID_FIELD_IN_CDB.cdb_field(2, None))?;
        return Ok(truncate(page.data().to_vec(), allocation_length));
    }

    if page_code != 0 {
        return Err(SenseInfo::INVALID_FIELD_IN_CDB.cdb_field(2, None).into());
    }

    let device_type = unit.device_type();
    let personality = unit.personality();
    let identity = &unit.identity;

    let mut vendor = [0u8; 8];
    vendor.copy_from_slice(&crate::scsi_ascii(&identity.vendor, 8));
    let mut product = [0u8; 16];
    product.copy_from_slice(&crate::scsi_ascii(&identity.product, 16));
    let mut revision = [0u8; 4];
    revision.copy_from_slice(&crate::scsi_ascii(&identity.revision, 4));

    let page = InquiryPage {
        peripheral_type: device_type.peripheral_type(),
        rmb: match device_type {
            DeviceType::SequentialAccess => 0x80,
            DeviceType::MediumChanger => 0x00,
        },
        version: 0x05, // SPC-3
        flags3: 0x02,  // response data format
        additional_length: (INQUIRY_LEN - 5) as u8,
        flags5: 0,
        flags6: 0,
        flags7: 0x02, // CMDQUE
        vendor,
        product,
        revision,
    };

    let mut data = Vec::with_capacity(INQUIRY_LEN);
    unsafe { data.write_be_value(page)? };
    data.resize(INQUIRY_LEN, 0);

    if let Some(vendor_specific) = personality.inquiry_vendor_specific() {
        let len = vendor_specific.len().min(20);
        data[36..36 + len].copy_from_slice(&vendor_specific[..len]);
    }

    for (i, descriptor) in personality.version_descriptors().iter().take(8).enumerate() {
        let offset = 58 + i * 2;
        data[offset..offset + 2].copy_from_slice(&descriptor.to_be_bytes());
    }

    Ok(truncate(data, allocation_length))
}

fn request_sense(unit: &mut LogicalUnit, cmd: &mut ScsiCommand) -> Result<Vec<u8>, ScsiError> {
    let descriptor_format = cmd.cdb[1] & 0x01 != 0;
    let allocation_length = cmd.cdb[4] as usize;
    let data = unit.sense.request_sense(descriptor_format)?;
    Ok(truncate(data, allocation_length))
}

fn report_luns(unit: &mut LogicalUnit, cmd: &mut ScsiCommand) -> Result<Vec<u8>, ScsiError> {
    let allocation_length =
        u32::from_be_bytes([cmd.cdb[6], cmd.cdb[7], cmd.cdb[8], cmd.cdb[9]]) as usize;
    if allocation_length < 16 {
        return Err(SenseInfo::INVALID_FIELD_IN_CDB.cdb_field(6, None).into());
    }

    let mut data = Vec::with_capacity(16);
    data.extend(8u32.to_be_bytes());
    data.extend([0u8; 4]);
    // single level LUN structure, peripheral device addressing
    let lun = unit.identity.lun;
    data.extend([((lun >> 8) & 0x3f) as u8, (lun & 0xff) as u8, 0, 0, 0, 0, 0, 0]);

    Ok(truncate(data, allocation_length))
}

/// Does `page` belong to a MODE SENSE page/sub page selection
fn mode_page_selected(page: &Page, page_code: u8, sub_page_code: u8) -> bool {
    let code_matches = page_code == 0x3f || page.page_code() == page_code;
    let sub_matches = match sub_page_code {
        0xff => true,
        sub => page.sub_page_code() == sub,
    };
    code_matches && sub_matches
}

fn mode_sense(unit: &mut LogicalUnit, cmd: &ScsiCommand, ten: bool) -> Result<Vec<u8>, ScsiError> {
    let cdb = cmd.cdb;
    let dbd = cdb[1] & 0x08 != 0;
    let control = PageControl::from_mode_sense(cdb[2]);
    let page_code = cdb[2] & 0x3f;
    let sub_page_code = cdb[3];
    let allocation_length = if ten {
        u16::from_be_bytes([cdb[7], cdb[8]]) as usize
    } else {
        cdb[4] as usize
    };

    if control == PageControl::Saved {
        return Err(SenseInfo::SAVING_PARAMETERS_UNSUPPORTED.cdb_field(2, Some(7)).into());
    }

    let mut body = Vec::new();
    let mut found = false;
    for page in unit.pages.iter(PageKind::Mode) {
        if mode_page_selected(page, page_code, sub_page_code) {
            body.extend(unit.pages.serialize(page, control)?);
            found = true;
        }
    }
    if !found {
        return Err(SenseInfo::INVALID_FIELD_IN_CDB.cdb_field(2, Some(5)).into());
    }

    let (device_specific, block_descriptor) = match unit.device {
        Device::Tape(ref drive) => (drive.mode_device_specific(), Some(drive.block_descriptor())),
        Device::Changer(_) => (0, None),
    };
    let block_descriptor = if dbd { None } else { block_descriptor };
    let descriptor_len = if block_descriptor.is_some() {
        BLOCK_DESCRIPTOR_LEN
    } else {
        0
    };

    let mut data = Vec::new();
    if ten {
        let len = 8 + descriptor_len + body.len();
        let header = ModeParameterHeader10 {
            mode_data_len: (len - 2).min(u16::MAX as usize) as u16,
            medium_type: 0,
            flags3: device_specific,
            reserved4: [0u8; 2],
            block_descriptor_len: descriptor_len as u16,
        };
        unsafe { data.write_be_value(header)? };
    } else {
        let len = 4 + descriptor_len + body.len();
        let header = ModeParameterHeader6 {
            mode_data_len: (len - 1).min(u8::MAX as usize) as u8,
            medium_type: 0,
            flags3: device_specific,
            block_descriptor_len: descriptor_len as u8,
        };
        unsafe { data.write_be_value(header)? };
    }
    if let Some(descriptor) = block_descriptor {
        unsafe { data.write_be_value(descriptor)? };
    }
    data.extend(body);

    Ok(truncate(data, allocation_length))
}

fn mode_sense6(unit: &mut LogicalUnit, cmd: &mut ScsiCommand) -> Result<Vec<u8>, ScsiError> {
    mode_sense(unit, cmd, false)
}

fn mode_sense10(unit: &mut LogicalUnit, cmd: &mut ScsiCommand) -> Result<Vec<u8>, ScsiError> {
    mode_sense(unit, cmd, true)
}

/// Merge one MODE SELECT page into the registry
///
/// Returns a compression change request, if the page asked for one.
fn select_mode_page(
    pages: &mut PageRegistry,
    new: &[u8],
    offset: usize,
) -> Result<Option<bool>, SenseInfo> {
    let invalid = |pos: usize| SenseInfo::INVALID_FIELD_IN_PARAMETER_LIST.parameter_field(pos as u16, None);

    let spf = new[0] & 0x40 != 0;
    let page_code = new[0] & 0x3f;
    let (sub_page_code, header_len) = if spf { (new[1], 4) } else { (0, 2) };

    let page = pages
        .lookup_mut(PageKind::Mode, page_code, sub_page_code)
        .ok_or_else(|| invalid(offset))?;
    if page.len() != new.len() {
        return Err(invalid(offset + 1));
    }

    let current = page.data().to_vec();
    let mask = match page.changeable() {
        Some(mask) => mask.to_vec(),
        None => vec![0u8; current.len()],
    };

    let mut merged = current.clone();
    for i in header_len..new.len() {
        if (current[i] ^ new[i]) & !mask[i] != 0 {
            return Err(invalid(offset + i));
        }
        merged[i] = (current[i] & !mask[i]) | (new[i] & mask[i]);
    }

    let compression = match (page_code, sub_page_code) {
        (MP_DATA_COMPRESSION, 0) if (current[2] ^ merged[2]) & 0x80 != 0 => {
            Some(merged[2] & 0x80 != 0)
        }
        (MP_DEVICE_CONFIGURATION, 0) if current[14] != merged[14] => Some(merged[14] != 0),
        _ => None,
    };

    page.set_data(&merged);
    Ok(compression)
}

fn mode_select(unit: &mut LogicalUnit, cmd: &mut ScsiCommand, ten: bool) -> Result<Vec<u8>, ScsiError> {
    let pf = cmd.cdb[1] & 0x10 != 0;
    let sp = cmd.cdb[1] & 0x01 != 0;
    let parameter_length = if ten {
        u16::from_be_bytes([cmd.cdb[7], cmd.cdb[8]]) as usize
    } else {
        cmd.cdb[4] as usize
    };

    if sp {
        return Err(SenseInfo::INVALID_FIELD_IN_CDB.cdb_field(1, Some(0)).into());
    }
    if parameter_length == 0 {
        return Ok(Vec::new());
    }
    if !pf {
        return Err(SenseInfo::INVALID_FIELD_IN_CDB.cdb_field(1, Some(4)).into());
    }

    let data = cmd.payload(parameter_length)?;
    let header_len = if ten { 8 } else { 4 };
    if data.len() < header_len {
        return Err(SenseInfo::PARAMETER_LIST_LENGTH_ERROR.into());
    }

    let descriptor_len = if ten {
        u16::from_be_bytes([data[6], data[7]]) as usize
    } else {
        data[3] as usize
    };

    let personality = unit.personality();
    let mut offset = header_len;

    if descriptor_len > 0 {
        if descriptor_len != BLOCK_DESCRIPTOR_LEN || data.len() < offset + descriptor_len {
            let pos = if ten { 6 } else { 3 };
            return Err(SenseInfo::INVALID_FIELD_IN_PARAMETER_LIST
                .parameter_field(pos, None)
                .into());
        }
        let mut reader = &data[offset..offset + descriptor_len];
        let descriptor: ModeBlockDescriptor = unsafe { reader.read_be_value()? };
        if let Device::Tape(ref mut drive) = unit.device {
            drive
                .apply_block_descriptor(&descriptor, personality.max_block_size())
                .map_err(|sense| sense.parameter_field((offset + 5) as u16, None))?;
        }
        offset += descriptor_len;
    }

    while offset < data.len() {
        let spf = data[offset] & 0x40 != 0;
        let page_len = if spf {
            if offset + 4 > data.len() {
                return Err(SenseInfo::PARAMETER_LIST_LENGTH_ERROR.into());
            }
            4 + u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize
        } else {
            if offset + 2 > data.len() {
                return Err(SenseInfo::PARAMETER_LIST_LENGTH_ERROR.into());
            }
            2 + data[offset + 1] as usize
        };
        if offset + page_len > data.len() {
            return Err(SenseInfo::PARAMETER_LIST_LENGTH_ERROR.into());
        }

        let compression = select_mode_page(&mut unit.pages, &data[offset..offset + page_len], offset)?;
        match compression {
            Some(true) => personality.set_compression(&mut unit.pages)?,
            Some(false) => personality.clear_compression(&mut unit.pages)?,
            None => {}
        }

        offset += page_len;
    }

    Ok(Vec::new())
}

fn mode_select6(unit: &mut LogicalUnit, cmd: &mut ScsiCommand) -> Result<Vec<u8>, ScsiError> {
    mode_select(unit, cmd, false)
}

fn mode_select10(unit: &mut LogicalUnit, cmd: &mut ScsiCommand) -> Result<Vec<u8>, ScsiError> {
    mode_select(unit, cmd, true)
}

fn log_sense(unit: &mut LogicalUnit, cmd: &mut ScsiCommand) -> Result<Vec<u8>, ScsiError> {
    if cmd.cdb[1] & 0x01 != 0 {
        // SP: saving parameters
        return Err(SenseInfo::INVALID_FIELD_IN_CDB.cdb_field(1, Some(0)).into());
    }
    let control = match cmd.cdb[2] >> 6 {
        0 | 1 => PageControl::Current,
        _ => PageControl::Default,
    };
    let page_code = cmd.cdb[2] & 0x3f;
    let sub_page_code = cmd.cdb[3];
    let allocation_length = u16::from_be_bytes([cmd.cdb[7], cmd.cdb[8]]) as usize;

    if page_code == 0x00 {
        let mut codes: Vec<u8> = unit
            .pages
            .iter(PageKind::Log)
            .filter(|page| page.sub_page_code() == 0)
            .map(|page| page.page_code())
            .collect();
        codes.insert(0, 0x00);
        let mut data = vec![0x00, 0x00];
        data.extend((codes.len() as u16).to_be_bytes());
        data.extend(codes);
        return Ok(truncate(data, allocation_length));
    }

    match unit.device {
        Device::Tape(ref drive) => drive.refresh_log_page(page_code, &mut unit.pages)?,
        Device::Changer(ref library) => library.refresh_log_page(page_code, &mut unit.pages)?,
    }

    let page = unit
        .pages
        .lookup(PageKind::Log, page_code, sub_page_code)
        .ok_or_else(|| SenseInfo::INVALID_FIELD_IN_CDB.cdb_field(2, Some(5)))?;
    let data = unit.pages.serialize(page, control)?;

    if page_code == LP_TAPE_ALERT && control == PageControl::Current {
        // reading the TapeAlert page clears the flags
        match unit.device {
            Device::Tape(ref mut drive) => drive.tape_alert = TapeAlertFlags::empty(),
            Device::Changer(ref mut library) => library.tape_alert = TapeAlertFlags::empty(),
        }
    }

    Ok(truncate(data, allocation_length))
}

fn log_select(unit: &mut LogicalUnit, cmd: &mut ScsiCommand) -> Result<Vec<u8>, ScsiError> {
    let pcr = cmd.cdb[1] & 0x02 != 0;
    if cmd.cdb[1] & 0x01 != 0 {
        return Err(SenseInfo::INVALID_FIELD_IN_CDB.cdb_field(1, Some(0)).into());
    }
    let parameter_length = u16::from_be_bytes([cmd.cdb[7], cmd.cdb[8]]) as usize;

    if pcr {
        if parameter_length != 0 {
            return Err(SenseInfo::INVALID_FIELD_IN_CDB.cdb_field(7, None).into());
        }
        match unit.device {
            Device::Tape(ref mut drive) => {
                drive.reset_counters();
                drive.tape_alert = TapeAlertFlags::empty();
            }
            Device::Changer(ref mut library) => library.tape_alert = TapeAlertFlags::empty(),
        }
        log::info!("unit {}: log parameters reset", unit.identity.id);
        return Ok(Vec::new());
    }

    // log parameters are not settable, accept and drop them
    let data = cmd.payload(parameter_length)?;
    log::debug!("unit {}: ignoring {} bytes of log parameters", unit.identity.id, data.len());
    Ok(Vec::new())
}

fn reserve_release(_unit: &mut LogicalUnit, _cmd: &mut ScsiCommand) -> Result<Vec<u8>, ScsiError> {
    Ok(Vec::new())
}

fn persistent_reserve_in(unit: &mut LogicalUnit, cmd: &mut ScsiCommand) -> Result<Vec<u8>, ScsiError> {
    let allocation_length = u16::from_be_bytes([cmd.cdb[7], cmd.cdb[8]]) as usize;
    let data = match cmd.cdb[1] & 0x1f {
        0x00 => unit.reservation.read_keys()?,
        0x01 => unit.reservation.read_reservation()?,
        _ => ReservationState::report_capabilities(),
    };
    Ok(truncate(data, allocation_length))
}

fn persistent_reserve_out(unit: &mut LogicalUnit, cmd: &mut ScsiCommand) -> Result<Vec<u8>, ScsiError> {
    let action = ReserveOutAction::try_from(cmd.cdb[1])?;
    let reservation_type = cmd.cdb[2] & 0x0f;
    let parameter_length =
        u32::from_be_bytes([cmd.cdb[5], cmd.cdb[6], cmd.cdb[7], cmd.cdb[8]]) as usize;

    let data = cmd.payload(parameter_length)?;
    let param = ReserveOutParameters::decode(&data)?;

    unit.reservation.reserve_out(action, reservation_type, &param)?;
    Ok(Vec::new())
}

fn report_supported_opcodes(unit: &mut LogicalUnit, cmd: &mut ScsiCommand) -> Result<Vec<u8>, ScsiError> {
    let options = cmd.cdb[2] & 0x07;
    let requested_opcode = cmd.cdb[3];
    let requested_action = u16::from_be_bytes([cmd.cdb[4], cmd.cdb[5]]);
    let allocation_length =
        u32::from_be_bytes([cmd.cdb[6], cmd.cdb[7], cmd.cdb[8], cmd.cdb[9]]) as usize;

    let supported = unit.dispatch().supported();

    let data = match options {
        0 => {
            let mut descriptors = Vec::with_capacity(supported.len() * 8);
            for (opcode, action, _) in supported.iter() {
                let cdb_len = cdb_length(*opcode).unwrap_or(6) as u16;
                descriptors.push(*opcode);
                descriptors.push(0);
                descriptors.extend((action.unwrap_or(0) as u16).to_be_bytes());
                descriptors.push(0);
                descriptors.push(if action.is_some() { 0x01 } else { 0x00 }); // SERVACTV
                descriptors.extend(cdb_len.to_be_bytes());
            }
            let mut data = Vec::with_capacity(descriptors.len() + 4);
            data.extend((descriptors.len() as u32).to_be_bytes());
            data.extend(descriptors);
            data
        }
        1 | 2 => {
            let has_actions = supported
                .iter()
                .any(|(opcode, action, _)| *opcode == requested_opcode && action.is_some());
            if (options == 1 && has_actions) || (options == 2 && !has_actions) {
                return Err(SenseInfo::INVALID_FIELD_IN_CDB.cdb_field(2, Some(2)).into());
            }

            let found = supported.iter().any(|(opcode, action, _)| {
                *opcode == requested_opcode
                    && (options == 1 || action.map(u16::from) == Some(requested_action))
            });

            if found {
                let cdb_len = cdb_length(requested_opcode).unwrap_or(6);
                // usage map: every bit of the CDB may be set, except the control byte
                let mut usage = vec![0xffu8; cdb_len];
                usage[0] = requested_opcode;
                usage[cdb_len - 1] = 0x00;

                let mut data = vec![0x00, 0x03]; // supported according to standard
                data.extend((cdb_len as u16).to_be_bytes());
                data.extend(usage);
                data
            } else {
                vec![0x00, 0x01, 0x00, 0x00] // not supported
            }
        }
        _ => return Err(SenseInfo::INVALID_FIELD_IN_CDB.cdb_field(2, Some(2)).into()),
    };

    Ok(truncate(data, allocation_length))
}

fn send_diagnostic(unit: &mut LogicalUnit, cmd: &mut ScsiCommand) -> Result<Vec<u8>, ScsiError> {
    let self_test = cmd.cdb[1] & 0x04 != 0;
    let parameter_length = u16::from_be_bytes([cmd.cdb[3], cmd.cdb[4]]) as usize;
    if !self_test {
        let data = cmd.payload(parameter_length)?;
        log::debug!("unit {}: diagnostic page of {} bytes", unit.identity.id, data.len());
    }
    Ok(Vec::new())
}

fn receive_diagnostic(_unit: &mut LogicalUnit, cmd: &mut ScsiCommand) -> Result<Vec<u8>, ScsiError> {
    let pcv = cmd.cdb[1] & 0x01 != 0;
    let page_code = cmd.cdb[2];
    let allocation_length = u16::from_be_bytes([cmd.cdb[3], cmd.cdb[4]]) as usize;

    if pcv && page_code != 0x00 {
        return Err(SenseInfo::INVALID_FIELD_IN_CDB.cdb_field(2, None).into());
    }
    // supported diagnostic pages: only this list
    let data = vec![0x00, 0x00, 0x00, 0x01, 0x00];
    Ok(truncate(data, allocation_length))
}

#[cfg(test)]
mod test {
    use super::*;

    fn identity() -> UnitIdentity {
        UnitIdentity {
            id: 1,
            name: String::from("drive0"),
            vendor: String::from("IBM"),
            product: String::from("ULT3580-TD8"),
            revision: String::from("0100"),
            serial: String::from("1234567890"),
            naa: Some([0x50, 0x01, 0x04, 0xf0, 0x00, 0x12, 0x34, 0x56]),
            lun: 0,
        }
    }

    #[test]
    fn device_identification_page() -> Result<(), Error> {
        let mut pages = PageRegistry::new();
        init_vpd_pages(&identity(), &mut pages, DeviceType::SequentialAccess)?;
        update_supported_vpd(&mut pages)?;

        let page = pages.lookup(PageKind::Vpd, 0x83, 0).unwrap();
        let data = page.data();
        assert_eq!(&data[0..2], &[0x01, 0x83]);
        assert_eq!(u16::from_be_bytes([data[2], data[3]]) as usize, data.len() - 4);
        // T10 vendor id designator
        assert_eq!(&data[4..8], &[0x02, 0x01, 0x00, 34]);
        assert_eq!(&data[8..16], b"IBM     ");
        assert_eq!(&data[16..27], b"ULT3580-TD8");
        // NAA designator
        let naa = &data[8 + 34..];
        assert_eq!(&naa[0..4], &[0x01, 0x03, 0x00, 0x08]);
        assert_eq!(naa[4], 0x50);

        let supported = pages.lookup(PageKind::Vpd, 0x00, 0).unwrap().data();
        assert_eq!(supported, &[0x01, 0x00, 0x00, 0x03, 0x00, 0x80, 0x83]);
        Ok(())
    }

    #[test]
    fn block_descriptor_length() {
        let mut descriptor = ModeBlockDescriptor::new(0x5a);
        descriptor.set_block_length(0x01_0000);
        assert_eq!(descriptor.block_length(), 0x01_0000);
        assert_eq!(descriptor.block_length, [0x01, 0x00, 0x00]);
    }

    #[test]
    fn mode_page_selection() -> Result<(), Error> {
        let mut pages = PageRegistry::new();
        pages.add(PageKind::Mode, 0x0f, 0, &[0x0f, 0x02, 0x80, 0x80])?;
        pages.add(PageKind::Mode, 0x10, 0, &[0x10, 0x02, 0, 0])?;
        pages.add(PageKind::Mode, 0x10, 1, &[0x50, 0x01, 0x00, 0x00])?;

        let count = |code, sub| {
            pages
                .iter(PageKind::Mode)
                .filter(|page| mode_page_selected(page, code, sub))
                .count()
        };
        assert_eq!(count(0x3f, 0x00), 2);
        assert_eq!(count(0x3f, 0xff), 3);
        assert_eq!(count(0x10, 0xff), 2);
        assert_eq!(count(0x10, 0x01), 1);
        assert_eq!(count(0x11, 0x00), 0);
        Ok(())
    }

    #[test]
    fn mode_select_respects_mask() -> Result<(), Error> {
        let mut pages = PageRegistry::new();
        let page = pages.add(PageKind::Mode, 0x0f, 0, &[0x0f, 0x02, 0xc0, 0x80])?;
        page.set_changeable(&[0, 0, 0x80, 0x80])?;

        // DCE off
        assert_eq!(select_mode_page(&mut pages, &[0x0f, 0x02, 0x40, 0x80], 4), Ok(Some(false)));
        assert_eq!(pages.lookup(PageKind::Mode, 0x0f, 0).unwrap().data()[2], 0x40);

        // DCC is not changeable
        assert_eq!(
            select_mode_page(&mut pages, &[0x0f, 0x02, 0x00, 0x80], 4),
            Err(SenseInfo::INVALID_FIELD_IN_PARAMETER_LIST.parameter_field(6, None))
        );

        // unknown page
        assert!(select_mode_page(&mut pages, &[0x11, 0x02, 0, 0], 4).is_err());
        Ok(())
    }
}
