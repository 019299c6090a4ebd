use crate::error::Result;
use crate::kv::KvError;
use crate::sign::{self, SignatureSet};

use super::Registry;

impl Registry {
    /// Store a tagged signature set. Surfaces the conflict when a set
    /// already exists for the tag.
    pub async fn create_signature_set(&self, set: &SignatureSet) -> Result<()> {
        let raw = Self::marshal(set)?;
        self.kv
            .create(&self.signature_path(&set.tag), &raw, None)
            .await?;
        Ok(())
    }

    pub async fn destroy_signature_set(&self, tag: &str) -> Result<()> {
        match self.kv.delete(&self.signature_path(tag), false).await {
            Ok(_) | Err(KvError::KeyNotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn signature_set(&self, tag: &str) -> Result<Option<SignatureSet>> {
        let key = self.signature_path(tag);
        match self.kv.get(&key, false, true).await {
            Ok(node) => Ok(Some(Self::unmarshal(&key, &node.value)?)),
            Err(KvError::KeyNotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Signatures for a job's unit, falling back to the legacy payload
    /// tag for pre-upgrade jobs.
    pub async fn job_signature_set(&self, name: &str) -> Result<Option<SignatureSet>> {
        if let Some(set) = self.signature_set(&sign::tag_for_job(name)).await? {
            return Ok(Some(set));
        }
        self.signature_set(&sign::tag_for_payload(name)).await
    }
}
