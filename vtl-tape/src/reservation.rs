//! Persistent reservations (PERSISTENT RESERVE IN/OUT)
//!
//! A unit is driven by one backup application, so there is a single
//! registered key per unit instead of a per initiator key table.

use anyhow::Error;
use endian_trait::Endian;

use proxmox_io::{ReadExt, WriteExt};

use crate::sense::{ScsiError, SenseInfo};

pub const PR_TYPE_WRITE_EXCLUSIVE: u8 = 0x01;
pub const PR_TYPE_EXCLUSIVE_ACCESS: u8 = 0x03;

/// PERSISTENT RESERVE OUT parameter list length
pub const PR_OUT_PARAMETER_LEN: usize = 24;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReserveOutAction {
    Register,
    Reserve,
    Release,
    Clear,
    Preempt,
    PreemptAndAbort,
    RegisterAndIgnoreExistingKey,
    RegisterAndMove,
}

impl TryFrom<u8> for ReserveOutAction {
    type Error = SenseInfo;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value & 0x1f {
            0x00 => ReserveOutAction::Register,
            0x01 => ReserveOutAction::Reserve,
            0x02 => ReserveOutAction::Release,
            0x03 => ReserveOutAction::Clear,
            0x04 => ReserveOutAction::Preempt,
            0x05 => ReserveOutAction::PreemptAndAbort,
            0x06 => ReserveOutAction::RegisterAndIgnoreExistingKey,
            0x07 => ReserveOutAction::RegisterAndMove,
            _ => return Err(SenseInfo::INVALID_FIELD_IN_CDB.cdb_field(1, Some(4))),
        })
    }
}

#[repr(C, packed)]
#[derive(Endian, Debug, Copy, Clone)]
pub struct ReserveOutParameters {
    pub reservation_key: u64,
    pub service_action_key: u64,
    obsolete1: [u8; 4],
    pub flags: u8,
    reserved: u8,
    obsolete2: [u8; 2],
}

impl ReserveOutParameters {
    pub fn new(reservation_key: u64, service_action_key: u64) -> Self {
        Self {
            reservation_key,
            service_action_key,
            obsolete1: [0u8; 4],
            flags: 0,
            reserved: 0,
            obsolete2: [0u8; 2],
        }
    }

    /// Decode the 24 byte parameter list
    pub fn decode(data: &[u8]) -> Result<Self, SenseInfo> {
        if data.len() != PR_OUT_PARAMETER_LEN {
            return Err(SenseInfo::PARAMETER_LIST_LENGTH_ERROR);
        }
        let mut reader = data;
        unsafe { reader.read_be_value() }.map_err(|_| SenseInfo::PARAMETER_LIST_LENGTH_ERROR)
    }
}

fn is_exclusive(reservation_type: u8) -> bool {
    matches!(
        reservation_type,
        PR_TYPE_WRITE_EXCLUSIVE | PR_TYPE_EXCLUSIVE_ACCESS
    )
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReservationState {
    key: u64,
    reservation_type: u8,
    generation: u32,
}

impl ReservationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn reservation_type(&self) -> u8 {
        self.reservation_type
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn is_reserved(&self) -> bool {
        self.reservation_type != 0
    }

    fn bump(&mut self) {
        self.generation = self.generation.wrapping_add(1);
    }

    fn set_key(&mut self, key: u64) {
        self.key = key;
        if key == 0 {
            self.reservation_type = 0;
        }
    }

    /// Apply one PERSISTENT RESERVE OUT service action
    ///
    /// Failed preconditions leave the state untouched.
    pub fn reserve_out(
        &mut self,
        action: ReserveOutAction,
        reservation_type: u8,
        param: &ReserveOutParameters,
    ) -> Result<(), ScsiError> {
        let reservation_key = param.reservation_key;
        let service_action_key = param.service_action_key;

        match action {
            ReserveOutAction::Register => {
                if self.key == 0 {
                    self.set_key(service_action_key);
                    if service_action_key != 0 {
                        self.bump();
                    }
                } else if self.key == reservation_key {
                    self.set_key(service_action_key);
                    self.bump();
                } else {
                    return Err(ScsiError::ReservationConflict);
                }
            }
            ReserveOutAction::Reserve => {
                if self.key == 0
                    || self.key != reservation_key
                    || !is_exclusive(reservation_type)
                {
                    return Err(ScsiError::ReservationConflict);
                }
                self.reservation_type = reservation_type;
            }
            ReserveOutAction::Release => {
                if self.key == 0
                    || self.key != reservation_key
                    || !is_exclusive(reservation_type)
                {
                    return Err(ScsiError::ReservationConflict);
                }
                self.reservation_type = 0;
            }
            ReserveOutAction::Clear => {
                if self.key == 0 || self.key != reservation_key {
                    return Err(ScsiError::ReservationConflict);
                }
                self.set_key(0);
                self.bump();
            }
            ReserveOutAction::Preempt | ReserveOutAction::PreemptAndAbort => {
                if self.key != service_action_key {
                    return Err(ScsiError::ReservationConflict);
                }
                if self.is_reserved() {
                    self.key = reservation_key;
                    self.reservation_type = reservation_type;
                } else {
                    self.set_key(0);
                }
                self.bump();
            }
            ReserveOutAction::RegisterAndIgnoreExistingKey => {
                self.set_key(service_action_key);
                self.bump();
            }
            ReserveOutAction::RegisterAndMove => {
                return Err(SenseInfo::INVALID_FIELD_IN_CDB.cdb_field(1, Some(4)).into());
            }
        }

        log::debug!(
            "persistent reservation {:?}: key {:016x} type {} generation {}",
            action,
            self.key,
            self.reservation_type,
            self.generation
        );

        Ok(())
    }

    /// READ KEYS response
    pub fn read_keys(&self) -> Result<Vec<u8>, Error> {
        let mut data = Vec::with_capacity(16);
        unsafe {
            data.write_be_value(self.generation)?;
            if self.key != 0 {
                data.write_be_value(8u32)?;
                data.write_be_value(self.key)?;
            } else {
                data.write_be_value(0u32)?;
            }
        }
        Ok(data)
    }

    /// READ RESERVATION response
    pub fn read_reservation(&self) -> Result<Vec<u8>, Error> {
        let mut data = Vec::with_capacity(24);
        unsafe {
            data.write_be_value(self.generation)?;
            if self.is_reserved() {
                data.write_be_value(16u32)?;
                data.write_be_value(self.key)?;
                data.write_be_value(0u32)?; // obsolete
                data.write_be_value(0u8)?;
                data.write_be_value(self.reservation_type & 0x0f)?; // scope: LU
                data.write_be_value(0u16)?; // obsolete
            } else {
                data.write_be_value(0u32)?;
            }
        }
        Ok(data)
    }

    /// REPORT CAPABILITIES response
    pub fn report_capabilities() -> Vec<u8> {
        // TMV, type mask: EX_AC and WR_EX
        vec![0x00, 0x08, 0x00, 0x80, 0x0a, 0x00, 0x00, 0x00]
    }
}
