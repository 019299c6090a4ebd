use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default boot-ID source on Linux.
pub const DEFAULT_BOOT_ID_PATH: &str = "/proc/sys/kernel/random/boot_id";

/// Identity and placement attributes a machine publishes under TTL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineState {
    pub boot_id: String,
    #[serde(default)]
    pub public_ip: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl MachineState {
    pub fn new(boot_id: &str) -> Self {
        Self {
            boot_id: boot_id.to_string(),
            public_ip: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_public_ip(mut self, ip: &str) -> Self {
        self.public_ip = Some(ip.to_string());
        self
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Resolve this machine's identity. An explicit path must be readable and
/// non-empty; without one, the platform boot-ID file is used when present
/// and a generated UUID otherwise.
pub fn load_machine_id(path: Option<&Path>) -> Result<String> {
    match path {
        Some(path) => {
            let contents = std::fs::read_to_string(path).map_err(|e| {
                Error::InvalidConfig(format!("unreadable boot-ID file {}: {e}", path.display()))
            })?;
            let id = contents.trim();
            if id.is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "empty boot-ID file {}",
                    path.display()
                )));
            }
            Ok(id.to_string())
        }
        None => match std::fs::read_to_string(DEFAULT_BOOT_ID_PATH) {
            Ok(contents) if !contents.trim().is_empty() => Ok(contents.trim().to_string()),
            _ => Ok(uuid::Uuid::new_v4().to_string()),
        },
    }
}
