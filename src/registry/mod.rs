//! Strongly-typed projection of the cluster's authoritative state onto
//! the KV store. Every other component is a pure function of what the
//! registry reads and writes.

mod job;
mod lease;
mod lock;
mod machine;
mod offer;
mod signature;
mod unit;
mod unit_state;

use std::sync::Arc;

use semver::Version;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::kv::{KvError, KvStore};
use crate::unit::UnitHash;

pub use lease::Lease;
pub use lock::TimedResourceMutex;

pub const DEFAULT_KEY_PREFIX: &str = "/flotilla";

/// Cluster protocol version published under `<prefix>/version`.
pub const PROTOCOL_VERSION: &str = "0.3.0";

#[derive(Clone)]
pub struct Registry {
    kv: Arc<dyn KvStore>,
    prefix: String,
}

impl Registry {
    pub fn new(kv: Arc<dyn KvStore>, prefix: &str) -> Self {
        let trimmed = prefix.trim_end_matches('/');
        let prefix = if trimmed.starts_with('/') {
            trimmed.to_string()
        } else {
            format!("/{trimmed}")
        };
        Self { kv, prefix }
    }

    pub fn kv(&self) -> Arc<dyn KvStore> {
        self.kv.clone()
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    // Key layout. Everything the cluster knows lives under the prefix.

    pub(crate) fn job_dir(&self) -> String {
        format!("{}/job", self.prefix)
    }

    pub(crate) fn job_object_path(&self, name: &str) -> String {
        format!("{}/job/{name}/object", self.prefix)
    }

    pub(crate) fn job_target_path(&self, name: &str) -> String {
        format!("{}/job/{name}/target", self.prefix)
    }

    pub(crate) fn job_target_state_path(&self, name: &str) -> String {
        format!("{}/job/{name}/target-state", self.prefix)
    }

    pub(crate) fn job_unit_state_path(&self, name: &str) -> String {
        format!("{}/job/{name}/unit-state", self.prefix)
    }

    pub(crate) fn job_heartbeat_path(&self, name: &str) -> String {
        format!("{}/job/{name}/heartbeat", self.prefix)
    }

    pub(crate) fn unit_dir(&self) -> String {
        format!("{}/unit", self.prefix)
    }

    pub(crate) fn unit_path(&self, hash: &UnitHash) -> String {
        format!("{}/unit/{hash}", self.prefix)
    }

    pub(crate) fn payload_path(&self, name: &str) -> String {
        format!("{}/payload/{name}", self.prefix)
    }

    pub(crate) fn offer_dir(&self) -> String {
        format!("{}/offer", self.prefix)
    }

    pub(crate) fn offer_path(&self, name: &str) -> String {
        format!("{}/offer/{name}", self.prefix)
    }

    pub(crate) fn offer_object_path(&self, name: &str) -> String {
        format!("{}/offer/{name}/object", self.prefix)
    }

    pub(crate) fn offer_bids_dir(&self, name: &str) -> String {
        format!("{}/offer/{name}/bids", self.prefix)
    }

    pub(crate) fn offer_bid_path(&self, name: &str, machine: &str) -> String {
        format!("{}/offer/{name}/bids/{machine}", self.prefix)
    }

    pub(crate) fn machines_dir(&self) -> String {
        format!("{}/machines", self.prefix)
    }

    pub(crate) fn machine_object_path(&self, machine: &str) -> String {
        format!("{}/machines/{machine}/object", self.prefix)
    }

    pub(crate) fn signature_path(&self, tag: &str) -> String {
        format!("{}/signatures{tag}", self.prefix)
    }

    pub(crate) fn lease_path(&self, name: &str) -> String {
        format!("{}/lease/{name}", self.prefix)
    }

    pub(crate) fn lock_path(&self, kind: &str, id: &str) -> String {
        format!("{}/lock/{kind}/{id}", self.prefix)
    }

    pub(crate) fn version_path(&self) -> String {
        format!("{}/version", self.prefix)
    }

    // Serialization helpers. Records are canonical JSON; a record that
    // fails to parse is surfaced as `BadRecord` with its key, and list
    // operations skip such entities rather than aborting.

    pub(crate) fn marshal<T: Serialize>(value: &T) -> Result<String> {
        Ok(serde_json::to_string(value)?)
    }

    pub(crate) fn unmarshal<T: DeserializeOwned>(key: &str, raw: &str) -> Result<T> {
        serde_json::from_str(raw).map_err(|source| Error::BadRecord {
            key: key.to_string(),
            source,
        })
    }

    /// The cluster protocol version record, None when unpublished or
    /// unparseable. Advisory only.
    pub async fn latest_version(&self) -> Result<Option<Version>> {
        match self.kv.get(&self.version_path(), false, true).await {
            Ok(node) => match Version::parse(&node.value) {
                Ok(v) => Ok(Some(v)),
                Err(e) => {
                    tracing::warn!(value = %node.value, error = %e, "Unparseable version record");
                    Ok(None)
                }
            },
            Err(KvError::KeyNotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn set_latest_version(&self, version: &Version) -> Result<()> {
        self.kv
            .set(&self.version_path(), &version.to_string(), None)
            .await?;
        Ok(())
    }
}
