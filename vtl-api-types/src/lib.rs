//! Basic API types used by the virtual tape library units.

use proxmox_schema::{const_regex, ApiStringFormat, IntegerSchema, Schema, StringSchema};

mod device;
pub use device::*;

mod drive;
pub use drive::*;

mod library;
pub use library::*;

mod options;
pub use options::*;

#[rustfmt::skip]
#[macro_export]
macro_rules! PROXMOX_SAFE_ID_REGEX_STR { () => { r"(?:[A-Za-z0-9_][A-Za-z0-9._\-]*)" }; }

const_regex! {
    /// Regex for safe identifiers.
    pub PROXMOX_SAFE_ID_REGEX = concat!(r"^", PROXMOX_SAFE_ID_REGEX_STR!(), r"$");

    /// SCSI ASCII field (printable characters only)
    pub SCSI_ASCII_REGEX = r"^[\x20-\x7e]*$";

    /// 64bit NAA identifier, optionally separated by colons
    pub NAA_REGEX = r"^(?:[0-9a-fA-F]{2}:?){7}[0-9a-fA-F]{2}$";
}

pub const PROXMOX_SAFE_ID_FORMAT: ApiStringFormat =
    ApiStringFormat::Pattern(&PROXMOX_SAFE_ID_REGEX);

pub const SCSI_ASCII_FORMAT: ApiStringFormat = ApiStringFormat::Pattern(&SCSI_ASCII_REGEX);

pub const NAA_FORMAT: ApiStringFormat = ApiStringFormat::Pattern(&NAA_REGEX);

pub const UNIT_NAME_SCHEMA: Schema = StringSchema::new("Unit name.")
    .format(&PROXMOX_SAFE_ID_FORMAT)
    .min_length(2)
    .max_length(32)
    .schema();

pub const UNIT_ID_SCHEMA: Schema =
    IntegerSchema::new("Unit identifier, used as message queue address.")
        .minimum(1)
        .maximum(0xffff_ffff)
        .schema();

pub const VENDOR_ID_SCHEMA: Schema = StringSchema::new("T10 vendor identification.")
    .format(&SCSI_ASCII_FORMAT)
    .min_length(1)
    .max_length(8)
    .schema();

pub const PRODUCT_ID_SCHEMA: Schema = StringSchema::new("Product identification.")
    .format(&SCSI_ASCII_FORMAT)
    .min_length(1)
    .max_length(16)
    .schema();

pub const PRODUCT_REVISION_SCHEMA: Schema = StringSchema::new("Product revision level.")
    .format(&SCSI_ASCII_FORMAT)
    .min_length(1)
    .max_length(4)
    .schema();

pub const UNIT_SERIAL_SCHEMA: Schema = StringSchema::new("Unit serial number.")
    .format(&SCSI_ASCII_FORMAT)
    .min_length(1)
    .max_length(10)
    .schema();

pub const NAA_SCHEMA: Schema = StringSchema::new("NAA identifier (16 hex digits).")
    .format(&NAA_FORMAT)
    .schema();

pub const MEDIA_LABEL_SCHEMA: Schema = StringSchema::new("Media Label/Barcode.")
    .format(&PROXMOX_SAFE_ID_FORMAT)
    .min_length(2)
    .max_length(32)
    .schema();
