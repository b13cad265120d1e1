use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};

use proxmox_schema::api;

#[api()]
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
/// Emulated SCSI peripheral device type
pub enum DeviceType {
    /// Sequential-access device (tape drive)
    SequentialAccess,
    /// Medium changer (tape library)
    MediumChanger,
}

impl DeviceType {
    /// Peripheral device type as reported by INQUIRY
    pub fn peripheral_type(self) -> u8 {
        match self {
            DeviceType::SequentialAccess => 0x01,
            DeviceType::MediumChanger => 0x08,
        }
    }
}

impl TryFrom<u8> for DeviceType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value & 0x1f {
            0x01 => DeviceType::SequentialAccess,
            0x08 => DeviceType::MediumChanger,
            _ => bail!("unsupported peripheral device type 0x{:02x}", value),
        })
    }
}

#[api()]
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
/// Device activity as reported by the DT Device Status log page
pub enum DeviceActivity {
    /// No activity
    NoActivity,
    /// Cleaning
    Cleaning,
    /// Loading
    Loading,
    /// Unloading
    Unloading,
    /// Other unspecified activity
    Other,
    /// Reading
    Reading,
    /// Writing
    Writing,
    /// Locating
    Locating,
    /// Rewinding
    Rewinding,
    /// Erasing
    Erasing,
    /// Formatting
    Formatting,
    /// Calibrating
    Calibrating,
    /// Other (DT)
    OtherDT,
    /// Updating microcode
    MicrocodeUpdate,
    /// Reading encrypted data
    ReadingEncrypted,
    /// Writing encrypted data
    WritingEncrypted,
}

impl From<DeviceActivity> for u8 {
    fn from(activity: DeviceActivity) -> u8 {
        match activity {
            DeviceActivity::NoActivity => 0x00,
            DeviceActivity::Cleaning => 0x01,
            DeviceActivity::Loading => 0x02,
            DeviceActivity::Unloading => 0x03,
            DeviceActivity::Other => 0x04,
            DeviceActivity::Reading => 0x05,
            DeviceActivity::Writing => 0x06,
            DeviceActivity::Locating => 0x07,
            DeviceActivity::Rewinding => 0x08,
            DeviceActivity::Erasing => 0x09,
            DeviceActivity::Formatting => 0x0A,
            DeviceActivity::Calibrating => 0x0B,
            DeviceActivity::OtherDT => 0x0C,
            DeviceActivity::MicrocodeUpdate => 0x0D,
            DeviceActivity::ReadingEncrypted => 0x0E,
            DeviceActivity::WritingEncrypted => 0x0F,
        }
    }
}

impl TryFrom<u8> for DeviceActivity {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x00 => DeviceActivity::NoActivity,
            0x01 => DeviceActivity::Cleaning,
            0x02 => DeviceActivity::Loading,
            0x03 => DeviceActivity::Unloading,
            0x04 => DeviceActivity::Other,
            0x05 => DeviceActivity::Reading,
            0x06 => DeviceActivity::Writing,
            0x07 => DeviceActivity::Locating,
            0x08 => DeviceActivity::Rewinding,
            0x09 => DeviceActivity::Erasing,
            0x0A => DeviceActivity::Formatting,
            0x0B => DeviceActivity::Calibrating,
            0x0C => DeviceActivity::OtherDT,
            0x0D => DeviceActivity::MicrocodeUpdate,
            0x0E => DeviceActivity::ReadingEncrypted,
            0x0F => DeviceActivity::WritingEncrypted,
            _ => bail!("invalid DT device activity value: {:x}", value),
        })
    }
}
