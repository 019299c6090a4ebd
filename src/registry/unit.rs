use std::collections::BTreeMap;

use serde::Deserialize;

use crate::error::Result;
use crate::kv::KvError;
use crate::unit::{Unit, UnitHash};

use super::Registry;

/// Pre-upgrade payload record: name plus an embedded unit whose contents
/// map is single-valued. Read-only; the writer side is gone.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyJobPayload {
    name: String,
    unit: LegacyUnitModel,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyUnitModel {
    #[serde(default)]
    contents: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(default)]
    raw: String,
}

impl Registry {
    /// Store a unit under its content address. A `NodeExist` answer means
    /// an identical unit is already stored and is swallowed.
    pub(crate) async fn store_or_get_unit(&self, unit: &Unit) -> Result<()> {
        let raw = Self::marshal(unit)?;
        match self
            .kv
            .create(&self.unit_path(&unit.hash()), &raw, None)
            .await
        {
            Ok(_) | Err(KvError::NodeExist(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Fetch a unit by hash. A stored record whose recomputed hash does
    /// not match its key is treated as malformed and skipped.
    pub async fn unit_by_hash(&self, hash: &UnitHash) -> Result<Option<Unit>> {
        let key = self.unit_path(hash);
        let node = match self.kv.get(&key, false, true).await {
            Ok(node) => node,
            Err(KvError::KeyNotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let unit: Unit = Self::unmarshal(&key, &node.value)?;
        if unit.hash() != *hash {
            tracing::warn!(%key, stored = %unit.hash(), "Unit record does not match its content address");
            return Ok(None);
        }
        Ok(Some(unit))
    }

    /// Recover a unit from the legacy payload key. When the payload
    /// carries raw text it is reparsed; otherwise the unit is rebuilt
    /// from the lossy contents map and its hash recomputed.
    pub(crate) async fn unit_from_legacy_payload(&self, name: &str) -> Result<Option<Unit>> {
        let key = self.payload_path(name);
        let node = match self.kv.get(&key, false, true).await {
            Ok(node) => node,
            Err(KvError::KeyNotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let payload: LegacyJobPayload = Self::unmarshal(&key, &node.value)?;
        if payload.name != name {
            tracing::warn!(
                %key,
                recorded = %payload.name,
                "Payload name does not match its key"
            );
            return Ok(None);
        }

        let unit = if payload.unit.raw.is_empty() {
            Unit::from_legacy_contents(&payload.unit.contents)
        } else {
            Unit::new(&payload.unit.raw)
        };
        Ok(Some(unit))
    }

    /// All stored content addresses.
    pub async fn unit_hashes(&self) -> Result<Vec<UnitHash>> {
        let dir = match self.kv.get(&self.unit_dir(), false, true).await {
            Ok(dir) => dir,
            Err(KvError::KeyNotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut hashes = Vec::new();
        for node in &dir.nodes {
            match node.base_name().parse() {
                Ok(hash) => hashes.push(hash),
                Err(e) => {
                    tracing::warn!(key = %node.key, error = %e, "Skipping malformed unit key");
                }
            }
        }
        Ok(hashes)
    }

    /// Delete a stored unit. Only the engine's GC sweep calls this, for
    /// hashes no live job references.
    pub async fn destroy_unit(&self, hash: &UnitHash) -> Result<()> {
        match self.kv.delete(&self.unit_path(hash), false).await {
            Ok(_) | Err(KvError::KeyNotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
