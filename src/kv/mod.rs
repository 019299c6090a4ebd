//! Capability set over the consistent KV store backing the cluster.
//!
//! The registry is the only component that touches these operations; a
//! production client (etcd or compatible) implements [`KvStore`] out of
//! tree, while [`MemoryKvStore`] backs tests and standalone mode.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryKvStore;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KvError {
    /// Fail-if-exists create hit an existing key.
    #[error("Key already exists: {0}")]
    NodeExist(String),

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// A compare-and-swap or compare-and-delete condition did not hold.
    #[error("Compare failed for key {0}")]
    TestFailed(String),

    /// The requested watch index fell out of the retained change history.
    /// Watchers must resynchronize with a full read.
    #[error("Watch index {index} cleared, oldest retained is {oldest}")]
    IndexCleared { index: u64, oldest: u64 },

    #[error("KV store unavailable: {0}")]
    Unavailable(String),
}

pub type KvResult<T> = std::result::Result<T, KvError>;

/// A node in the KV hierarchy. Directory nodes carry children in `nodes`
/// and have no value of their own.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KvNode {
    pub key: String,
    pub value: String,
    pub dir: bool,
    pub created_index: u64,
    pub modified_index: u64,
    pub nodes: Vec<KvNode>,
}

impl KvNode {
    /// The final path segment of the node's key.
    pub fn base_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

/// The action that produced a change record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvAction {
    Set,
    Create,
    Delete,
    CompareAndSwap,
    CompareAndDelete,
    Expire,
}

/// A single entry of the linearizable change feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvChange {
    pub action: KvAction,
    pub node: KvNode,
    pub prev_node: Option<KvNode>,
}

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a key. With `recursive`, directory reads include the full
    /// subtree rather than only direct children. `quorum` requests a
    /// linearizable read where the backend distinguishes one.
    async fn get(&self, key: &str, recursive: bool, quorum: bool) -> KvResult<KvNode>;

    /// Unconditional write, with an optional TTL after which the key expires.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<KvNode>;

    /// Fail-if-exists write. Returns `NodeExist` if the key is present.
    async fn create(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<KvNode>;

    /// Delete a key, or a whole subtree with `recursive`.
    async fn delete(&self, key: &str, recursive: bool) -> KvResult<KvNode>;

    /// Write conditioned on the current value and/or modify-index.
    /// Returns `TestFailed` when the condition does not hold.
    async fn compare_and_swap(
        &self,
        key: &str,
        value: &str,
        prev_value: Option<&str>,
        prev_index: Option<u64>,
        ttl: Option<Duration>,
    ) -> KvResult<KvNode>;

    /// Delete conditioned on the current value and/or modify-index.
    async fn compare_and_delete(
        &self,
        key: &str,
        prev_value: Option<&str>,
        prev_index: Option<u64>,
    ) -> KvResult<KvNode>;

    /// Block until a change with index greater than `after_index` lands
    /// under `prefix`, and return it. Fails with `IndexCleared` when the
    /// requested index is no longer retained.
    async fn watch(&self, prefix: &str, after_index: u64) -> KvResult<KvChange>;
}
