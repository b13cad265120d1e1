//! Logical unit and command execution
//!
//! A [LogicalUnit] owns everything one emulated device needs: identity,
//! personality, pages, sense buffer, reservation state and the device
//! class specific state (tape drive or library). Commands run to
//! completion one at a time.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::{bail, format_err, Error};

use vtl_api_types::{DeviceType, VirtualDriveConfig, VirtualLibraryConfig};

use crate::dispatch::{cdb_length, CommandFlags, DispatchTable};
use crate::pages::{PageAllocationError, PageRegistry};
use crate::personality::Personality;
use crate::reservation::ReservationState;
use crate::sense::{
    ScsiError, SenseBuffer, SenseInfo, SAM_STAT_GOOD, SAM_STAT_RESERVATION_CONFLICT,
};
use crate::smc::Library;
use crate::ssc::TapeDrive;

/// Product revision reported when none is configured
pub const DEFAULT_REVISION: &str = "0001";

/// Identity strings reported by INQUIRY and the VPD pages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitIdentity {
    /// Message bus address
    pub id: u64,
    pub name: String,
    pub vendor: String,
    pub product: String,
    pub revision: String,
    pub serial: String,
    /// NAA IEEE registered identifier
    pub naa: Option<[u8; 8]>,
    pub lun: u64,
}

/// Parse a NAA identifier (16 hex digits, colons allowed)
pub fn parse_naa(text: &str) -> Result<[u8; 8], Error> {
    let digits: String = text.chars().filter(|c| *c != ':').collect();
    let mut naa = [0u8; 8];
    hex::decode_to_slice(&digits, &mut naa)
        .map_err(|err| format_err!("invalid NAA identifier '{}' - {}", text, err))?;
    Ok(naa)
}

impl UnitIdentity {
    pub fn from_drive_config(config: &VirtualDriveConfig) -> Result<Self, Error> {
        Ok(Self {
            id: config.id,
            name: config.name.clone(),
            vendor: config.vendor.clone(),
            product: config.product.clone(),
            revision: config
                .revision
                .clone()
                .unwrap_or_else(|| DEFAULT_REVISION.to_string()),
            serial: config.serial.clone(),
            naa: config.naa.as_deref().map(parse_naa).transpose()?,
            lun: config.lun.unwrap_or(0),
        })
    }

    pub fn from_library_config(config: &VirtualLibraryConfig) -> Result<Self, Error> {
        Ok(Self {
            id: config.id,
            name: config.name.clone(),
            vendor: config.vendor.clone(),
            product: config.product.clone(),
            revision: config
                .revision
                .clone()
                .unwrap_or_else(|| DEFAULT_REVISION.to_string()),
            serial: config.serial.clone(),
            naa: config.naa.as_deref().map(parse_naa).transpose()?,
            lun: 0,
        })
    }
}

/// Initiator supplied data of the command being executed
pub trait DataOut {
    /// Pull up to `max_len` bytes
    fn read_payload(&mut self, max_len: usize) -> Result<Vec<u8>, Error>;
}

impl DataOut for &[u8] {
    fn read_payload(&mut self, max_len: usize) -> Result<Vec<u8>, Error> {
        let len = max_len.min(self.len());
        let (head, tail) = self.split_at(len);
        let data = head.to_vec();
        *self = tail;
        Ok(data)
    }
}

/// One command in flight
pub struct ScsiCommand<'a> {
    pub cdb: &'a [u8],
    data_out: &'a mut dyn DataOut,
    deferred: Option<SenseInfo>,
}

impl<'a> ScsiCommand<'a> {
    pub fn new(cdb: &'a [u8], data_out: &'a mut dyn DataOut) -> Self {
        Self {
            cdb,
            data_out,
            deferred: None,
        }
    }

    /// Fetch the data-out buffer (parameter list or write data)
    pub fn payload(&mut self, len: usize) -> Result<Vec<u8>, ScsiError> {
        if len == 0 {
            return Ok(Vec::new());
        }
        Ok(self.data_out.read_payload(len)?)
    }

    /// Complete with CHECK CONDITION but still return the data
    ///
    /// Used for conditions like filemark or incorrect length, where
    /// the data transfer itself succeeded.
    pub fn check_condition(&mut self, sense: SenseInfo) {
        self.deferred = Some(sense);
    }

    pub fn deferred(&self) -> Option<&SenseInfo> {
        self.deferred.as_ref()
    }
}

/// Status, sense and data-in of a completed command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
    pub status: u8,
    pub sense: Vec<u8>,
    pub data: Vec<u8>,
}

/// Device class specific state
pub enum Device {
    Tape(TapeDrive),
    Changer(Library),
}

impl Device {
    pub fn device_type(&self) -> DeviceType {
        match self {
            Device::Tape(_) => DeviceType::SequentialAccess,
            Device::Changer(_) => DeviceType::MediumChanger,
        }
    }
}

pub struct LogicalUnit {
    pub identity: UnitIdentity,
    pub online: bool,
    personality: Arc<dyn Personality>,
    dispatch: DispatchTable,
    pub pages: PageRegistry,
    pub sense: SenseBuffer,
    pub reservation: ReservationState,
    unit_attention: VecDeque<SenseInfo>,
    pub device: Device,
}

impl LogicalUnit {
    pub fn new(
        identity: UnitIdentity,
        personality: Arc<dyn Personality>,
        device: Device,
        descriptor_sense: bool,
    ) -> Result<Self, Error> {
        let mut unit = Self {
            identity,
            online: true,
            personality: Arc::clone(&personality),
            dispatch: DispatchTable::new(),
            pages: PageRegistry::new(),
            sense: SenseBuffer::new(descriptor_sense),
            reservation: ReservationState::new(),
            unit_attention: VecDeque::new(),
            device,
        };
        unit.register(personality)?;
        unit.add_unit_attention(SenseInfo::POWER_ON_RESET);
        Ok(unit)
    }

    /// Bind a personality and rebuild pages and dispatch table
    pub fn register(&mut self, personality: Arc<dyn Personality>) -> Result<(), Error> {
        let device_type = self.device.device_type();
        if personality.device_type() != device_type {
            bail!(
                "personality '{}' does not fit a {:?} unit",
                personality.name(),
                device_type
            );
        }

        // build into a fresh registry, the old pages stay valid on failure
        let mut pages = PageRegistry::new();
        personality.init_pages(&self.identity, &mut pages)?;
        match &mut self.device {
            Device::Tape(drive) => drive.init_pages(personality.as_ref(), &mut pages)?,
            Device::Changer(library) => library.init_pages(personality.as_ref(), &mut pages)?,
        }
        crate::spc::update_supported_vpd(&mut pages)?;
        pages.snapshot_defaults();

        let mut dispatch = DispatchTable::for_device(device_type);
        personality.customize_dispatch(&mut dispatch);

        log::info!(
            "unit {} ({}): {} {} as {}",
            self.identity.id,
            self.identity.name,
            self.identity.vendor,
            self.identity.product,
            personality.name(),
        );

        self.pages = pages;
        self.dispatch = dispatch;
        self.personality = personality;
        Ok(())
    }

    /// Apply a new configuration between commands
    ///
    /// Pages and dispatch table are rebuilt from scratch, the device
    /// state (loaded medium, slot map) is kept.
    pub fn reconfigure(
        &mut self,
        identity: UnitIdentity,
        personality: Arc<dyn Personality>,
        descriptor_sense: bool,
    ) -> Result<(), Error> {
        let previous = std::mem::replace(&mut self.identity, identity);
        if let Err(err) = self.register(personality) {
            self.identity = previous;
            return Err(err);
        }
        self.sense = SenseBuffer::new(descriptor_sense);
        self.add_unit_attention(SenseInfo::MODE_PARAMETERS_CHANGED);
        Ok(())
    }

    pub fn personality(&self) -> Arc<dyn Personality> {
        Arc::clone(&self.personality)
    }

    pub fn device_type(&self) -> DeviceType {
        self.device.device_type()
    }

    pub fn dispatch(&self) -> &DispatchTable {
        &self.dispatch
    }

    /// Queue a unit attention condition (duplicates are dropped)
    pub fn add_unit_attention(&mut self, sense: SenseInfo) {
        if !self.unit_attention.contains(&sense) {
            self.unit_attention.push_back(sense);
        }
    }

    pub fn clear_unit_attention(&mut self) {
        self.unit_attention.clear();
    }

    pub fn tape_drive(&mut self) -> Result<&mut TapeDrive, ScsiError> {
        match &mut self.device {
            Device::Tape(drive) => Ok(drive),
            Device::Changer(_) => {
                Err(format_err!("unit {} is not a tape drive", self.identity.id).into())
            }
        }
    }

    pub fn library(&mut self) -> Result<&mut Library, ScsiError> {
        match &mut self.device {
            Device::Changer(library) => Ok(library),
            Device::Tape(_) => {
                Err(format_err!("unit {} is not a library", self.identity.id).into())
            }
        }
    }

    fn run(&mut self, cmd: &mut ScsiCommand) -> Result<Vec<u8>, ScsiError> {
        let opcode = match cmd.cdb.first() {
            Some(opcode) => *opcode,
            None => return Err(SenseInfo::INVALID_OPCODE.into()),
        };
        let min_len = cdb_length(opcode).unwrap_or(6);
        if cmd.cdb.len() < min_len {
            return Err(SenseInfo::INVALID_FIELD_IN_CDB.cdb_field(0, None).into());
        }

        let resolved = self.dispatch.resolve(cmd.cdb)?;
        let flags = resolved.command.flags;

        if !flags.contains(CommandFlags::SKIP_UNIT_ATTENTION) {
            if let Some(sense) = self.unit_attention.pop_front() {
                return Err(sense.into());
            }
        }

        if !self.online && flags.contains(CommandFlags::MEDIA_ACCESS) {
            return Err(SenseInfo::MANUAL_INTERVENTION_REQUIRED.into());
        }

        if !flags.contains(CommandFlags::SKIP_UNIT_ATTENTION) {
            self.sense.clear();
        }

        log::debug!(
            "unit {}: {} ({:02x}h)",
            self.identity.id,
            resolved.command.name,
            opcode
        );

        (resolved.command.handler)(self, cmd)
    }

    fn check_condition(&mut self, sense: SenseInfo) -> Result<(u8, Vec<u8>), Error> {
        log::info!("unit {}: {}", self.identity.id, sense);
        let status = self.sense.make_sense(sense);
        Ok((status, self.sense.encode_pending()?))
    }

    /// Execute one CDB
    ///
    /// Protocol errors are reported in the response. Only failures that
    /// leave the unit unusable (page allocation) are returned as `Err`.
    pub fn execute(
        &mut self,
        cdb: &[u8],
        data_out: &mut dyn DataOut,
    ) -> Result<CommandResponse, Error> {
        let mut cmd = ScsiCommand::new(cdb, data_out);
        let result = self.run(&mut cmd);

        let (status, sense, data) = match result {
            Ok(data) => match cmd.deferred {
                Some(sense) => {
                    let (status, sense) = self.check_condition(sense)?;
                    (status, sense, data)
                }
                None => (SAM_STAT_GOOD, Vec::new(), data),
            },
            Err(ScsiError::Sense(sense)) => {
                let (status, sense) = self.check_condition(sense)?;
                (status, sense, Vec::new())
            }
            Err(ScsiError::ReservationConflict) => {
                (SAM_STAT_RESERVATION_CONFLICT, Vec::new(), Vec::new())
            }
            Err(ScsiError::Error(err)) => {
                if err.downcast_ref::<PageAllocationError>().is_some() {
                    log::error!("unit {}: fatal - {}", self.identity.id, err);
                    return Err(err);
                }
                log::error!(
                    "unit {}: command {:02x?} failed - {}",
                    self.identity.id,
                    cdb.first(),
                    err
                );
                let (status, sense) = self.check_condition(SenseInfo::INTERNAL_TARGET_FAILURE)?;
                (status, sense, Vec::new())
            }
        };

        log::debug!(
            "unit {}: status {:02x}h, {} bytes",
            self.identity.id,
            status,
            data.len()
        );

        Ok(CommandResponse { status, sense, data })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn naa_parsing() -> Result<(), Error> {
        assert_eq!(
            parse_naa("50:01:04:f0:00:12:34:56")?,
            [0x50, 0x01, 0x04, 0xf0, 0x00, 0x12, 0x34, 0x56]
        );
        assert_eq!(parse_naa("500104f000123456")?[7], 0x56);
        assert!(parse_naa("5001").is_err());
        Ok(())
    }

    #[test]
    fn data_out_slices() -> Result<(), Error> {
        let data = [1u8, 2, 3, 4, 5];
        let mut reader: &[u8] = &data;
        assert_eq!(reader.read_payload(2)?, vec![1, 2]);
        assert_eq!(reader.read_payload(10)?, vec![3, 4, 5]);
        assert!(reader.read_payload(1)?.is_empty());
        Ok(())
    }
}
