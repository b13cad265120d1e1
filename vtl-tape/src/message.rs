//! Control messages between units
//!
//! Libraries and drives run as separate units. The library asks drives
//! to load or unload cartridges, the operator opens and fills the
//! import/export station, and both sides accept online/offline,
//! verbosity and TapeAlert requests. Messages are plain text lines.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, format_err, Error};

use crate::sense::SenseInfo;
use crate::ssc::tape_alert_flags::TapeAlertFlags;
use crate::unit::{Device, LogicalUnit};

/// Reply prefix for failed requests
pub const REPLY_ERROR: &str = "ERROR:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitMessage {
    /// `lload BARCODE`, library loads a cartridge into the drive
    Load(String),
    Unload,
    Online,
    Offline,
    /// Step through the log levels
    Verbose,
    /// `TapeAlert HEX`, raise TapeAlert flags
    TapeAlert(TapeAlertFlags),
    OpenMap,
    CloseMap,
    /// `load map BARCODE`, operator puts a cartridge into the station
    LoadMap(String),
    EmptyMap,
}

fn barcode_argument(words: &[&str], what: &str) -> Result<String, Error> {
    match words {
        [barcode] => Ok(barcode.to_string()),
        [] => bail!("{} needs a barcode", what),
        _ => bail!("{} takes a single barcode", what),
    }
}

impl FromStr for UnitMessage {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self, Error> {
        let words: Vec<&str> = text.split_whitespace().collect();
        let keyword = words
            .first()
            .map(|word| word.to_ascii_lowercase())
            .ok_or_else(|| format_err!("empty message"))?;

        let message = match (keyword.as_str(), &words[1..]) {
            ("lload", args) => UnitMessage::Load(barcode_argument(args, "lload")?),
            ("unload", []) => UnitMessage::Unload,
            ("online", []) => UnitMessage::Online,
            ("offline", []) => UnitMessage::Offline,
            ("verbose", []) => UnitMessage::Verbose,
            ("tapealert", [hex]) => UnitMessage::TapeAlert(TapeAlertFlags::from_hex(hex)?),
            ("open", [map]) if map.eq_ignore_ascii_case("map") => UnitMessage::OpenMap,
            ("close", [map]) if map.eq_ignore_ascii_case("map") => UnitMessage::CloseMap,
            ("empty", [map]) if map.eq_ignore_ascii_case("map") => UnitMessage::EmptyMap,
            ("load", [map, args @ ..]) if map.eq_ignore_ascii_case("map") => {
                UnitMessage::LoadMap(barcode_argument(args, "load map")?)
            }
            _ => bail!("unknown message '{}'", text.trim()),
        };
        Ok(message)
    }
}

impl fmt::Display for UnitMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            UnitMessage::Load(barcode) => write!(f, "lload {}", barcode),
            UnitMessage::Unload => write!(f, "unload"),
            UnitMessage::Online => write!(f, "online"),
            UnitMessage::Offline => write!(f, "offline"),
            UnitMessage::Verbose => write!(f, "verbose"),
            UnitMessage::TapeAlert(flags) => write!(f, "TapeAlert {:016x}", flags.bits()),
            UnitMessage::OpenMap => write!(f, "open map"),
            UnitMessage::CloseMap => write!(f, "close map"),
            UnitMessage::LoadMap(barcode) => write!(f, "load map {}", barcode),
            UnitMessage::EmptyMap => write!(f, "empty map"),
        }
    }
}

/// Next log level: info, debug, trace, then back to info
pub fn cycle_verbosity() -> log::LevelFilter {
    let level = match log::max_level() {
        log::LevelFilter::Info => log::LevelFilter::Debug,
        log::LevelFilter::Debug => log::LevelFilter::Trace,
        _ => log::LevelFilter::Info,
    };
    log::set_max_level(level);
    level
}

impl LogicalUnit {
    /// Handle one control message, returns the reply text
    pub fn process_message(&mut self, message: &UnitMessage) -> Result<String, Error> {
        log::debug!("unit {}: message '{}'", self.identity.id, message);

        match message {
            UnitMessage::Online => {
                self.online = true;
                return Ok(String::from("online"));
            }
            UnitMessage::Offline => {
                self.online = false;
                return Ok(String::from("offline"));
            }
            UnitMessage::Verbose => {
                let level = cycle_verbosity();
                return Ok(format!("log level {}", level));
            }
            _ => {}
        }

        match self.device {
            Device::Tape(_) => self.process_drive_message(message),
            Device::Changer(_) => self.process_library_message(message),
        }
    }

    fn process_drive_message(&mut self, message: &UnitMessage) -> Result<String, Error> {
        match message {
            UnitMessage::Load(barcode) => {
                self.load_medium(barcode)?;
                Ok(format!("loaded {}", barcode))
            }
            UnitMessage::Unload => {
                if self.tape_drive()?.prevent_removal {
                    bail!("medium removal prevented");
                }
                match self.unload_medium()? {
                    Some(barcode) => Ok(format!("unloaded {}", barcode)),
                    None => Ok(String::from("empty")),
                }
            }
            UnitMessage::TapeAlert(flags) => {
                let drive = self.tape_drive()?;
                drive.tape_alert |= *flags;
                Ok(format!("TapeAlert {:016x}", drive.tape_alert.bits()))
            }
            _ => bail!("'{}' is not a drive message", message),
        }
    }

    fn process_library_message(&mut self, message: &UnitMessage) -> Result<String, Error> {
        match message {
            UnitMessage::OpenMap => {
                self.library()?.open_map()?;
                Ok(String::from("map open"))
            }
            UnitMessage::CloseMap => {
                self.library()?.close_map();
                self.add_unit_attention(SenseInfo::IMPORT_EXPORT_ELEMENT_ACCESSED);
                Ok(String::from("map closed"))
            }
            UnitMessage::LoadMap(barcode) => {
                self.library()?.load_map(barcode)?;
                Ok(format!("loaded {} into map", barcode))
            }
            UnitMessage::EmptyMap => {
                let removed = self.library()?.empty_map()?;
                Ok(format!("removed {}", removed.join(" ")))
            }
            UnitMessage::TapeAlert(flags) => {
                let library = self.library()?;
                library.tape_alert |= *flags;
                Ok(format!("TapeAlert {:016x}", library.tape_alert.bits()))
            }
            _ => bail!("'{}' is not a library message", message),
        }
    }
}
