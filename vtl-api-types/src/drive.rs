//! Types for emulated tape drives
use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};

use proxmox_schema::{api, IntegerSchema, Schema, StringSchema};

use crate::{
    NAA_SCHEMA, PRODUCT_ID_SCHEMA, PRODUCT_REVISION_SCHEMA, UNIT_ID_SCHEMA, UNIT_NAME_SCHEMA,
    UNIT_SERIAL_SCHEMA, VENDOR_ID_SCHEMA,
};

pub const MEDIA_HOME_SCHEMA: Schema =
    StringSchema::new("Directory holding the virtual tape images.").schema();

pub const COMPRESSION_LEVEL_SCHEMA: Schema = IntegerSchema::new("zlib compression level.")
    .minimum(1)
    .maximum(9)
    .default(6)
    .schema();

#[api(
    properties: {
        name: {
            schema: UNIT_NAME_SCHEMA,
        },
        id: {
            schema: UNIT_ID_SCHEMA,
        },
        vendor: {
            schema: VENDOR_ID_SCHEMA,
        },
        product: {
            schema: PRODUCT_ID_SCHEMA,
        },
        revision: {
            schema: PRODUCT_REVISION_SCHEMA,
            optional: true,
        },
        serial: {
            schema: UNIT_SERIAL_SCHEMA,
        },
        naa: {
            schema: NAA_SCHEMA,
            optional: true,
        },
        library: {
            schema: UNIT_ID_SCHEMA,
            optional: true,
        },
        home: {
            schema: MEDIA_HOME_SCHEMA,
            optional: true,
        },
        compression: {
            optional: true,
            default: true,
        },
        "compression-level": {
            schema: COMPRESSION_LEVEL_SCHEMA,
            optional: true,
        },
        lun: {
            optional: true,
            minimum: 0,
            maximum: 255,
            default: 0,
        },
    }
)]
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "kebab-case")]
/// Emulated tape drive
pub struct VirtualDriveConfig {
    pub name: String,
    pub id: u64,
    pub vendor: String,
    pub product: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    pub serial: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub naa: Option<String>,
    /// Library this drive is installed in
    #[serde(skip_serializing_if = "Option::is_none")]
    pub library: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub home: Option<String>,
    /// Enable data compression at power on
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression_level: Option<u64>,
    /// Logical unit number
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lun: Option<u64>,
}

#[api()]
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialOrd, PartialEq, Eq)]
pub enum TapeDensity {
    /// Unknown (no media loaded)
    Unknown,
    /// LTO1
    LTO1,
    /// LTO2
    LTO2,
    /// LTO3
    LTO3,
    /// LTO4
    LTO4,
    /// LTO5
    LTO5,
    /// LTO6
    LTO6,
    /// LTO7
    LTO7,
    /// LTO7M8
    LTO7M8,
    /// LTO8
    LTO8,
    /// LTO9
    LTO9,
    /// StorageTek T10000A
    T10KA,
    /// StorageTek T10000B
    T10KB,
    /// StorageTek T10000C
    T10KC,
    /// StorageTek T10000D
    T10KD,
}

impl TryFrom<u8> for TapeDensity {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let density = match value {
            0x00 => TapeDensity::Unknown,
            0x40 => TapeDensity::LTO1,
            0x42 => TapeDensity::LTO2,
            0x44 => TapeDensity::LTO3,
            0x46 => TapeDensity::LTO4,
            0x58 => TapeDensity::LTO5,
            0x5a => TapeDensity::LTO6,
            0x5c => TapeDensity::LTO7,
            0x5d => TapeDensity::LTO7M8,
            0x5e => TapeDensity::LTO8,
            0x60 => TapeDensity::LTO9,
            0x4a => TapeDensity::T10KA,
            0x4b => TapeDensity::T10KB,
            0x4c => TapeDensity::T10KC,
            0x4d => TapeDensity::T10KD,
            _ => bail!("unknown tape density code 0x{:02x}", value),
        };
        Ok(density)
    }
}

impl From<TapeDensity> for u8 {
    fn from(density: TapeDensity) -> u8 {
        match density {
            TapeDensity::Unknown => 0x00,
            TapeDensity::LTO1 => 0x40,
            TapeDensity::LTO2 => 0x42,
            TapeDensity::LTO3 => 0x44,
            TapeDensity::LTO4 => 0x46,
            TapeDensity::LTO5 => 0x58,
            TapeDensity::LTO6 => 0x5a,
            TapeDensity::LTO7 => 0x5c,
            TapeDensity::LTO7M8 => 0x5d,
            TapeDensity::LTO8 => 0x5e,
            TapeDensity::LTO9 => 0x60,
            TapeDensity::T10KA => 0x4a,
            TapeDensity::T10KB => 0x4b,
            TapeDensity::T10KC => 0x4c,
            TapeDensity::T10KD => 0x4d,
        }
    }
}
