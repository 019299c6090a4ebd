use crate::error::{Error, Result};
use crate::kv::KvError;
use crate::unit::UnitState;

use super::Registry;

impl Registry {
    /// Publish the owning agent's report for a job.
    pub async fn save_unit_state(&self, name: &str, state: &UnitState) -> Result<()> {
        let raw = Self::marshal(state)?;
        self.kv
            .set(&self.job_unit_state_path(name), &raw, None)
            .await?;
        Ok(())
    }

    pub async fn remove_unit_state(&self, name: &str) -> Result<()> {
        match self.kv.delete(&self.job_unit_state_path(name), false).await {
            Ok(_) | Err(KvError::KeyNotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn unit_state(&self, name: &str) -> Result<Option<UnitState>> {
        let key = self.job_unit_state_path(name);
        match self.kv.get(&key, false, true).await {
            Ok(node) => Ok(Some(Self::unmarshal(&key, &node.value)?)),
            Err(KvError::KeyNotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Every published unit state in the cluster, malformed records
    /// skipped.
    pub async fn unit_states(&self) -> Result<Vec<UnitState>> {
        let dir = match self.kv.get(&self.job_dir(), true, true).await {
            Ok(dir) => dir,
            Err(KvError::KeyNotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut states = Vec::new();
        let mut stack = vec![&dir];
        while let Some(node) = stack.pop() {
            for child in &node.nodes {
                if child.dir {
                    stack.push(child);
                } else if child.base_name() == "unit-state" {
                    match Self::unmarshal::<UnitState>(&child.key, &child.value) {
                        Ok(state) => states.push(state),
                        Err(Error::BadRecord { key, source }) => {
                            tracing::warn!(%key, error = %source, "Skipping malformed unit state");
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        Ok(states)
    }
}
