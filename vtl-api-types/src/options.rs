use serde::{Deserialize, Serialize};

use proxmox_schema::api;

#[api(
    properties: {
        "descriptor-sense": {
            optional: true,
            default: false,
        },
        "cleaning-time": {
            optional: true,
            minimum: 1,
            default: 30,
        },
    }
)]
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "kebab-case")]
/// Global emulation options
pub struct VtlOptions {
    /// Section name (always 'global')
    pub name: String,
    /// Report sense data in descriptor format
    #[serde(skip_serializing_if = "Option::is_none")]
    pub descriptor_sense: Option<bool>,
    /// Seconds a cleaning cartridge stays busy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleaning_time: Option<u64>,
}
