use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::kv::{KvError, KvStore};

use super::Registry;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeaseRecord {
    holder: String,
    index: u64,
}

/// A TTL'd exclusive claim on a named role. Renewal and release are
/// bound to the KV modify-index so a lease that expired and was
/// re-acquired elsewhere cannot be touched by its former holder.
pub struct Lease {
    kv: Arc<dyn KvStore>,
    key: String,
    record: LeaseRecord,
    modified_index: u64,
}

impl Lease {
    pub fn holder(&self) -> &str {
        &self.record.holder
    }

    /// Extend the claim. Failing here means the lease expired or was
    /// taken over; the holder must drop the role.
    pub async fn renew(&mut self, ttl: Duration) -> Result<()> {
        let next = LeaseRecord {
            holder: self.record.holder.clone(),
            index: self.record.index + 1,
        };
        let raw = Registry::marshal(&next)?;
        match self
            .kv
            .compare_and_swap(&self.key, &raw, None, Some(self.modified_index), Some(ttl))
            .await
        {
            Ok(node) => {
                self.record = next;
                self.modified_index = node.modified_index;
                Ok(())
            }
            Err(KvError::TestFailed(_)) | Err(KvError::KeyNotFound(_)) => {
                Err(Error::LeaseLost(self.key.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Give the claim up early. Losing the compare is benign: the lease
    /// already expired.
    pub async fn release(self) -> Result<()> {
        match self
            .kv
            .compare_and_delete(&self.key, None, Some(self.modified_index))
            .await
        {
            Ok(_) | Err(KvError::TestFailed(_)) | Err(KvError::KeyNotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Registry {
    /// Try to claim a role. Returns None when another holder's lease is
    /// live.
    pub async fn lease_role(
        &self,
        role: &str,
        machine: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>> {
        let key = self.lease_path(role);
        let record = LeaseRecord {
            holder: machine.to_string(),
            index: 0,
        };
        let raw = Self::marshal(&record)?;
        match self.kv.create(&key, &raw, Some(ttl)).await {
            Ok(node) => Ok(Some(Lease {
                kv: self.kv.clone(),
                key,
                record,
                modified_index: node.modified_index,
            })),
            Err(KvError::NodeExist(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
