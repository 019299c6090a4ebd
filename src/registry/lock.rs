use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::kv::{KvError, KvStore};

use super::Registry;

/// Default lifetime of a resource lock; long enough for any single
/// registry operation, short enough that a crashed holder does not
/// wedge the resource.
pub(crate) const LOCK_TTL: Duration = Duration::from_secs(30);

/// A TTL'd named mutex over one resource, acquired fail-if-exists.
/// Dropping without `release` lets the TTL reap it.
pub struct TimedResourceMutex {
    kv: Arc<dyn KvStore>,
    key: String,
    context: String,
    modified_index: u64,
}

impl TimedResourceMutex {
    pub async fn renew(&mut self, ttl: Duration) -> Result<()> {
        let context = self.context.clone();
        match self
            .kv
            .compare_and_swap(&self.key, &context, None, Some(self.modified_index), Some(ttl))
            .await
        {
            Ok(node) => {
                self.modified_index = node.modified_index;
                Ok(())
            }
            Err(KvError::TestFailed(_)) | Err(KvError::KeyNotFound(_)) => {
                Err(Error::LeaseLost(self.key.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

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
    /// Acquire the lock for `<kind>/<id>`, or None when contended.
    /// `context` names the holder for debugging.
    pub async fn lock_resource(
        &self,
        kind: &str,
        id: &str,
        context: &str,
    ) -> Result<Option<TimedResourceMutex>> {
        let key = self.lock_path(kind, id);
        match self.kv.create(&key, context, Some(LOCK_TTL)).await {
            Ok(node) => Ok(Some(TimedResourceMutex {
                kv: self.kv.clone(),
                key,
                context: context.to_string(),
                modified_index: node.modified_index,
            })),
            Err(KvError::NodeExist(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
