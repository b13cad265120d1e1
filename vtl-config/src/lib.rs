//! Virtual tape library configuration
//!
//! This configuration module is based on [`SectionConfig`], and
//! provides a type safe interface to the [`VirtualDriveConfig`],
//! [`VirtualLibraryConfig`] and [`VtlOptions`] sections of the
//! device configuration file.
//!
//! [SectionConfig]: proxmox_section_config::SectionConfig

use anyhow::{bail, format_err, Error};
use lazy_static::lazy_static;

use proxmox_schema::*;
use proxmox_section_config::{SectionConfig, SectionConfigData, SectionConfigPlugin};
use proxmox_sys::fs::{replace_file, CreateOptions};

use vtl_api_types::{VirtualDriveConfig, VirtualLibraryConfig, VtlOptions, UNIT_NAME_SCHEMA};

lazy_static! {
    /// Static [`SectionConfig`] to access parser/writer functions.
    pub static ref CONFIG: SectionConfig = init();
}

fn init() -> SectionConfig {
    let mut config = SectionConfig::new(&UNIT_NAME_SCHEMA);

    let obj_schema = match VirtualDriveConfig::API_SCHEMA {
        Schema::Object(ref obj_schema) => obj_schema,
        _ => unreachable!(),
    };
    let plugin =
        SectionConfigPlugin::new("drive".to_string(), Some("name".to_string()), obj_schema);
    config.register_plugin(plugin);

    let obj_schema = match VirtualLibraryConfig::API_SCHEMA {
        Schema::Object(ref obj_schema) => obj_schema,
        _ => unreachable!(),
    };
    let plugin =
        SectionConfigPlugin::new("library".to_string(), Some("name".to_string()), obj_schema);
    config.register_plugin(plugin);

    let obj_schema = match VtlOptions::API_SCHEMA {
        Schema::Object(ref obj_schema) => obj_schema,
        _ => unreachable!(),
    };
    let plugin =
        SectionConfigPlugin::new("options".to_string(), Some("name".to_string()), obj_schema);
    config.register_plugin(plugin);

    config
}

/// Configuration file name
pub const DEVICE_CFG_FILENAME: &str = "/etc/proxmox-vtl/device.cfg";

/// Read and parse the configuration file
pub fn config() -> Result<(SectionConfigData, [u8; 32]), Error> {
    let content =
        proxmox_sys::fs::file_read_optional_string(DEVICE_CFG_FILENAME)?.unwrap_or_default();
    parse_config(DEVICE_CFG_FILENAME, &content)
}

/// Parse configuration text, returning the data and its sha256 digest
pub fn parse_config(filename: &str, content: &str) -> Result<(SectionConfigData, [u8; 32]), Error> {
    let digest = openssl::sha::sha256(content.as_bytes());
    let data = CONFIG.parse(filename, content)?;
    check_unit_ids(&data)?;
    Ok((data, digest))
}

/// Save the configuration file
pub fn save_config(config: &SectionConfigData) -> Result<(), Error> {
    let raw = CONFIG.write(DEVICE_CFG_FILENAME, config)?;
    replace_file(DEVICE_CFG_FILENAME, raw.as_bytes(), CreateOptions::new(), true)
}

// unit ids are message queue addresses and must be unique
fn check_unit_ids(config: &SectionConfigData) -> Result<(), Error> {
    let mut ids = Vec::new();
    for drive in drives(config)? {
        ids.push((drive.id, drive.name));
    }
    for library in libraries(config)? {
        ids.push((library.id, library.name));
    }
    ids.sort();
    for pair in ids.windows(2) {
        if pair[0].0 == pair[1].0 {
            bail!(
                "units '{}' and '{}' share the same id {}",
                pair[0].1,
                pair[1].1,
                pair[0].0
            );
        }
    }
    Ok(())
}

/// List all configured drives
pub fn drives(config: &SectionConfigData) -> Result<Vec<VirtualDriveConfig>, Error> {
    config.convert_to_typed_array("drive")
}

/// List all configured libraries
pub fn libraries(config: &SectionConfigData) -> Result<Vec<VirtualLibraryConfig>, Error> {
    config.convert_to_typed_array("library")
}

/// Global options, defaults if the section is missing
pub fn options(config: &SectionConfigData) -> Result<VtlOptions, Error> {
    match config.sections.get("global") {
        Some((section_type, _)) if section_type == "options" => config.lookup("options", "global"),
        Some(_) => bail!("Entry 'global' exists, but is not an options section"),
        None => Ok(VtlOptions {
            name: "global".to_string(),
            ..Default::default()
        }),
    }
}

/// Lookup a drive by unit id
pub fn lookup_drive(config: &SectionConfigData, id: u64) -> Result<VirtualDriveConfig, Error> {
    drives(config)?
        .into_iter()
        .find(|drive| drive.id == id)
        .ok_or_else(|| format_err!("no drive with id {}", id))
}

/// Lookup a library by unit id
pub fn lookup_library(
    config: &SectionConfigData,
    id: u64,
) -> Result<VirtualLibraryConfig, Error> {
    libraries(config)?
        .into_iter()
        .find(|library| library.id == id)
        .ok_or_else(|| format_err!("no library with id {}", id))
}

/// Parse the comma separated drive id list of a library
pub fn parse_drive_list(list: Option<&str>) -> Result<Vec<u64>, Error> {
    let mut drives = Vec::new();
    let list = match list {
        Some(list) => list,
        None => return Ok(drives),
    };
    for id in list.split(',').map(str::trim).filter(|id| !id.is_empty()) {
        let id: u64 = id
            .parse()
            .map_err(|err| format_err!("unable to parse drive id '{}' - {}", id, err))?;
        if drives.contains(&id) {
            bail!("duplicate drive id {} in library", id);
        }
        drives.push(id);
    }
    Ok(drives)
}
