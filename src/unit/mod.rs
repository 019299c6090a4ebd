//! Systemd-style workload unit files, content-addressed by SHA-1.

pub mod file;
pub mod state;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};

pub use state::UnitState;

/// Parsed unit file contents: section -> option -> ordered values.
pub type UnitContents = BTreeMap<String, BTreeMap<String, Vec<String>>>;

/// Section holding scheduling requirements.
const REQUIREMENTS_SECTION: &str = "X-Fleet";

/// Requirement option names, after the `X-` prefix is stripped.
pub const REQ_MACHINE_BOOT_ID: &str = "ConditionMachineBootID";
pub const REQ_MACHINE_OF: &str = "ConditionMachineOf";
pub const REQ_CONFLICTS: &str = "Conflicts";

/// SHA-1 content address of a unit's raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UnitHash([u8; 20]);

impl fmt::Display for UnitHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for UnitHash {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 20] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(UnitHash(arr))
    }
}

impl Serialize for UnitHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for UnitHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A workload unit: an immutable textual configuration plus its parsed
/// form. Units carry no inherent name; jobs reference them by hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unit {
    contents: UnitContents,
    raw: String,
}

/// Wire form: both the parsed contents and the raw text travel together.
/// The hash is always recomputed from `raw`, never trusted from the wire.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UnitModel {
    contents: UnitContents,
    raw: String,
}

impl Serialize for Unit {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        UnitModel {
            contents: self.contents.clone(),
            raw: self.raw.clone(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Unit {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let model = UnitModel::deserialize(deserializer)?;
        Ok(Unit::new(&model.raw))
    }
}

impl Unit {
    /// Parse a raw unit file.
    pub fn new(raw: &str) -> Self {
        Self {
            contents: file::parse_unit_file(raw),
            raw: raw.to_string(),
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn contents(&self) -> &UnitContents {
        &self.contents
    }

    /// SHA-1 of the raw contents.
    pub fn hash(&self) -> UnitHash {
        let mut hasher = Sha1::new();
        hasher.update(self.raw.as_bytes());
        UnitHash(hasher.finalize().into())
    }

    /// All `X-`-prefixed options of the `[X-Fleet]` section, with the
    /// prefix stripped.
    pub fn requirements(&self) -> BTreeMap<String, Vec<String>> {
        let mut requirements = BTreeMap::new();
        if let Some(options) = self.contents.get(REQUIREMENTS_SECTION) {
            for (key, values) in options {
                if let Some(stripped) = key.strip_prefix("X-") {
                    requirements.insert(stripped.to_string(), values.clone());
                }
            }
        }
        requirements
    }

    /// Glob patterns of peer job names this unit refuses to share a
    /// machine with.
    pub fn conflicts(&self) -> Vec<String> {
        self.requirements()
            .remove(REQ_CONFLICTS)
            .unwrap_or_default()
    }

    /// The boot ID this unit is pinned to, if any.
    pub fn machine_boot_id(&self) -> Option<String> {
        self.requirements()
            .remove(REQ_MACHINE_BOOT_ID)
            .and_then(|mut v| if v.is_empty() { None } else { Some(v.remove(0)) })
    }

    /// Names of jobs this unit must be collocated with.
    pub fn machine_of(&self) -> Vec<String> {
        self.requirements()
            .remove(REQ_MACHINE_OF)
            .unwrap_or_default()
    }

    /// First `Description` option of the `[Unit]` section, empty if unset.
    pub fn description(&self) -> &str {
        self.contents
            .get("Unit")
            .and_then(|o| o.get("Description"))
            .and_then(|v| v.first())
            .map(String::as_str)
            .unwrap_or("")
    }
}
