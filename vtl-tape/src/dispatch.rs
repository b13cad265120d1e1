//! Op-code dispatch table
//!
//! Every one of the 256 op-codes is bound to a [Slot]. Unused op-codes
//! hold [Slot::Unsupported], so a lookup can never miss. Some op-codes
//! dispatch a second time on a service action field of the CDB.

use vtl_api_types::DeviceType;

use crate::sense::{ScsiError, SenseInfo};
use crate::unit::{LogicalUnit, ScsiCommand};

pub type CommandHandler = fn(&mut LogicalUnit, &mut ScsiCommand) -> Result<Vec<u8>, ScsiError>;

bitflags::bitflags! {
    pub struct CommandFlags: u8 {
        /// Needs the unit online (answers NOT READY otherwise)
        const MEDIA_ACCESS = 0x01;
        /// Executed even while a unit attention is pending
        const SKIP_UNIT_ATTENTION = 0x02;
    }
}

#[derive(Clone, Copy)]
pub struct Command {
    pub name: &'static str,
    pub handler: CommandHandler,
    pub flags: CommandFlags,
}

impl Command {
    pub const fn new(name: &'static str, handler: CommandHandler) -> Self {
        Self {
            name,
            handler,
            flags: CommandFlags::empty(),
        }
    }

    pub const fn media(name: &'static str, handler: CommandHandler) -> Self {
        Self {
            name,
            handler,
            flags: CommandFlags::MEDIA_ACCESS,
        }
    }

    pub const fn no_unit_attention(name: &'static str, handler: CommandHandler) -> Self {
        Self {
            name,
            handler,
            flags: CommandFlags::SKIP_UNIT_ATTENTION,
        }
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name)
            .field("flags", &self.flags)
            .finish()
    }
}

/// Where the service action lives in the CDB
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceActionField {
    /// Byte 1, bits 0-4
    Byte1,
    /// Byte 1, the whole byte (security protocol)
    Protocol,
}

impl ServiceActionField {
    fn extract(self, cdb: &[u8]) -> u8 {
        match self {
            ServiceActionField::Byte1 => cdb[1] & 0x1f,
            ServiceActionField::Protocol => cdb[1],
        }
    }
}

#[derive(Debug, Clone)]
pub enum Slot {
    Unsupported,
    Command(Command),
    ServiceAction {
        field: ServiceActionField,
        actions: Vec<(u8, Command)>,
    },
}

/// Resolved table entry
#[derive(Debug, Clone, Copy)]
pub struct Resolved {
    pub command: Command,
    pub service_action: Option<u8>,
}

/// CDB length implied by the group code of an op-code
pub fn cdb_length(opcode: u8) -> Option<usize> {
    match opcode >> 5 {
        0 => Some(6),
        1 | 2 => Some(10),
        4 => Some(16),
        5 => Some(12),
        _ => None,
    }
}

/// Complete op-code to handler mapping of one logical unit
#[derive(Clone)]
pub struct DispatchTable {
    slots: Box<[Slot; 256]>,
}

impl Default for DispatchTable {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchTable {
    /// Table with every op-code unsupported
    pub fn new() -> Self {
        Self {
            slots: Box::new(std::array::from_fn(|_| Slot::Unsupported)),
        }
    }

    /// Default table of a device class
    pub fn for_device(device_type: DeviceType) -> Self {
        let mut table = Self::new();
        crate::spc::register_commands(&mut table);
        match device_type {
            DeviceType::SequentialAccess => crate::ssc::register_commands(&mut table),
            DeviceType::MediumChanger => crate::smc::register_commands(&mut table),
        }
        table
    }

    pub fn set(&mut self, opcode: u8, command: Command) {
        self.slots[opcode as usize] = Slot::Command(command);
    }

    /// Add (or replace) one service action of `opcode`
    pub fn set_service_action(
        &mut self,
        opcode: u8,
        field: ServiceActionField,
        action: u8,
        command: Command,
    ) {
        let slot = &mut self.slots[opcode as usize];
        match slot {
            Slot::ServiceAction { actions, .. } => {
                match actions.iter_mut().find(|(code, _)| *code == action) {
                    Some(entry) => entry.1 = command,
                    None => actions.push((action, command)),
                }
            }
            _ => {
                *slot = Slot::ServiceAction {
                    field,
                    actions: vec![(action, command)],
                }
            }
        }
    }

    pub fn unsupported(&mut self, opcode: u8) {
        self.slots[opcode as usize] = Slot::Unsupported;
    }

    pub fn slot(&self, opcode: u8) -> &Slot {
        &self.slots[opcode as usize]
    }

    /// Find the handler for a CDB
    ///
    /// The CDB must already have been checked for its minimum length.
    pub fn resolve(&self, cdb: &[u8]) -> Result<Resolved, SenseInfo> {
        match &self.slots[cdb[0] as usize] {
            Slot::Unsupported => Err(SenseInfo::INVALID_OPCODE.cdb_field(0, None)),
            Slot::Command(command) => Ok(Resolved {
                command: *command,
                service_action: None,
            }),
            Slot::ServiceAction { field, actions } => {
                let action = field.extract(cdb);
                actions
                    .iter()
                    .find(|(code, _)| *code == action)
                    .map(|(code, command)| Resolved {
                        command: *command,
                        service_action: Some(*code),
                    })
                    .ok_or_else(|| {
                        let bit = match field {
                            ServiceActionField::Byte1 => Some(4),
                            ServiceActionField::Protocol => None,
                        };
                        SenseInfo::INVALID_FIELD_IN_CDB.cdb_field(1, bit)
                    })
            }
        }
    }

    /// All supported (op-code, service action) pairs in op-code order
    pub fn supported(&self) -> Vec<(u8, Option<u8>, Command)> {
        let mut list = Vec::new();
        for (opcode, slot) in self.slots.iter().enumerate() {
            let opcode = opcode as u8;
            match slot {
                Slot::Unsupported => {}
                Slot::Command(command) => list.push((opcode, None, *command)),
                Slot::ServiceAction { actions, .. } => {
                    let mut actions = actions.clone();
                    actions.sort_by_key(|(code, _)| *code);
                    for (code, command) in actions {
                        list.push((opcode, Some(code), command));
                    }
                }
            }
        }
        list
    }
}
