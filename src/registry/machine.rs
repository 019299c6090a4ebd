use std::time::Duration;

use crate::error::{Error, Result};
use crate::kv::KvError;
use crate::machine::MachineState;

use super::Registry;

impl Registry {
    /// Publish the machine record under TTL. Returns the modify index so
    /// callers can chain waits on the record.
    pub async fn set_machine_state(&self, ms: &MachineState, ttl: Duration) -> Result<u64> {
        let raw = Self::marshal(ms)?;
        let node = self
            .kv
            .set(&self.machine_object_path(&ms.boot_id), &raw, Some(ttl))
            .await?;
        Ok(node.modified_index)
    }

    pub async fn machine_state(&self, machine: &str) -> Result<Option<MachineState>> {
        let key = self.machine_object_path(machine);
        match self.kv.get(&key, false, true).await {
            Ok(node) => Ok(Some(Self::unmarshal(&key, &node.value)?)),
            Err(KvError::KeyNotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// All live machine records. Malformed entries are skipped.
    pub async fn machines(&self) -> Result<Vec<MachineState>> {
        let dir = match self.kv.get(&self.machines_dir(), false, true).await {
            Ok(dir) => dir,
            Err(KvError::KeyNotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut machines = Vec::new();
        for node in &dir.nodes {
            match self.machine_state(node.base_name()).await {
                Ok(Some(ms)) => machines.push(ms),
                Ok(None) => {}
                Err(Error::BadRecord { key, source }) => {
                    tracing::warn!(%key, error = %source, "Skipping malformed machine record");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(machines)
    }

    pub async fn remove_machine_state(&self, machine: &str) -> Result<()> {
        match self
            .kv
            .delete(&format!("{}/machines/{machine}", self.prefix), true)
            .await
        {
            Ok(_) | Err(KvError::KeyNotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
