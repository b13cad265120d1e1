//! Types for emulated tape libraries

use serde::{Deserialize, Serialize};

use proxmox_schema::{api, ApiStringFormat, ArraySchema, IntegerSchema, Schema, StringSchema};

use crate::{
    NAA_SCHEMA, PRODUCT_ID_SCHEMA, PRODUCT_REVISION_SCHEMA, UNIT_ID_SCHEMA, UNIT_NAME_SCHEMA,
    UNIT_SERIAL_SCHEMA, VENDOR_ID_SCHEMA,
};

pub const DRIVE_ID_ARRAY_SCHEMA: Schema =
    ArraySchema::new("Drive unit list.", &UNIT_ID_SCHEMA).schema();

pub const DRIVE_ID_LIST_SCHEMA: Schema = StringSchema::new(
    "\
A list of drive unit identifiers, comma separated. The order defines
the data transfer element addresses.
",
)
.format(&ApiStringFormat::PropertyString(&DRIVE_ID_ARRAY_SCHEMA))
.schema();

pub const STORAGE_SLOTS_SCHEMA: Schema = IntegerSchema::new("Number of storage slots.")
    .minimum(1)
    .maximum(4096)
    .schema();

pub const MAP_SLOTS_SCHEMA: Schema = IntegerSchema::new("Number of import/export slots.")
    .minimum(0)
    .maximum(64)
    .default(4)
    .schema();

pub const CONTENTS_PATH_SCHEMA: Schema =
    StringSchema::new("File used to persist the library contents.").schema();

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
        drives: {
            schema: DRIVE_ID_LIST_SCHEMA,
            optional: true,
        },
        "storage-slots": {
            schema: STORAGE_SLOTS_SCHEMA,
        },
        "map-slots": {
            schema: MAP_SLOTS_SCHEMA,
            optional: true,
        },
        contents: {
            schema: CONTENTS_PATH_SCHEMA,
            optional: true,
        },
    }
)]
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "kebab-case")]
/// Emulated tape library (medium changer)
pub struct VirtualLibraryConfig {
    pub name: String,
    pub id: u64,
    pub vendor: String,
    pub product: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    pub serial: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub naa: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drives: Option<String>,
    pub storage_slots: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub map_slots: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contents: Option<String>,
}
