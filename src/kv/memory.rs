//! In-memory [`KvStore`] used by the test suite and standalone mode.
//!
//! Single-process only; no cross-process coordination and no persistence.
//! TTLs are expired lazily on every operation, emitting `Expire` changes,
//! and a bounded change history backs `watch(after_index)`.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};

use super::{KvAction, KvChange, KvError, KvNode, KvResult, KvStore};

const DEFAULT_HISTORY_LIMIT: usize = 1024;

/// Poll interval for blocked watchers, so lazy TTL expiry is still
/// observed while no other operation is running.
const WATCH_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    created_index: u64,
    modified_index: u64,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: BTreeMap<String, Entry>,
    index: u64,
    changes: VecDeque<KvChange>,
    /// Highest change index dropped from the history window.
    pruned_through: u64,
}

pub struct MemoryKvStore {
    inner: Mutex<Inner>,
    notify: Notify,
    history_limit: usize,
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_history_limit(history_limit: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            history_limit,
        }
    }

    /// The current cluster index.
    pub async fn current_index(&self) -> u64 {
        self.inner.lock().await.index
    }

    fn normalize(key: &str) -> String {
        let trimmed = key.trim_end_matches('/');
        if trimmed.starts_with('/') {
            trimmed.to_string()
        } else {
            format!("/{trimmed}")
        }
    }

    fn leaf_node(key: &str, entry: &Entry) -> KvNode {
        KvNode {
            key: key.to_string(),
            value: entry.value.clone(),
            dir: false,
            created_index: entry.created_index,
            modified_index: entry.modified_index,
            nodes: Vec::new(),
        }
    }

    fn record(inner: &mut Inner, change: KvChange, limit: usize) {
        inner.changes.push_back(change);
        while inner.changes.len() > limit {
            if let Some(dropped) = inner.changes.pop_front() {
                inner.pruned_through = dropped.node.modified_index;
            }
        }
    }

    fn purge_expired(inner: &mut Inner, limit: usize) {
        let now = Utc::now();
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at.map(|at| at <= now).unwrap_or(false))
            .map(|(k, _)| k.clone())
            .collect();

        for key in expired {
            if let Some(old) = inner.entries.remove(&key) {
                inner.index += 1;
                let node = KvNode {
                    key: key.clone(),
                    value: String::new(),
                    dir: false,
                    created_index: old.created_index,
                    modified_index: inner.index,
                    nodes: Vec::new(),
                };
                let prev = Self::leaf_node(&key, &old);
                Self::record(
                    inner,
                    KvChange {
                        action: KvAction::Expire,
                        node,
                        prev_node: Some(prev),
                    },
                    limit,
                );
            }
        }
    }

    /// Build a directory node for `key` out of the stored flat keyspace.
    /// Returns None when neither the key nor any descendant exists.
    fn build_node(inner: &Inner, key: &str, recursive: bool) -> Option<KvNode> {
        if let Some(entry) = inner.entries.get(key) {
            return Some(Self::leaf_node(key, entry));
        }

        let child_prefix = format!("{key}/");
        let mut children: BTreeMap<String, bool> = BTreeMap::new();
        for stored in inner.entries.keys() {
            if let Some(rest) = stored.strip_prefix(&child_prefix) {
                match rest.split_once('/') {
                    Some((segment, _)) => children.insert(segment.to_string(), true),
                    None => children.insert(rest.to_string(), false),
                };
            }
        }

        if children.is_empty() {
            return None;
        }

        let mut nodes = Vec::new();
        for (segment, is_dir) in children {
            let child_key = format!("{key}/{segment}");
            if is_dir {
                if recursive {
                    if let Some(node) = Self::build_node(inner, &child_key, true) {
                        nodes.push(node);
                    }
                } else {
                    nodes.push(KvNode {
                        key: child_key,
                        dir: true,
                        ..KvNode::default()
                    });
                }
            } else if let Some(entry) = inner.entries.get(&child_key) {
                nodes.push(Self::leaf_node(&child_key, entry));
            }
        }

        Some(KvNode {
            key: key.to_string(),
            value: String::new(),
            dir: true,
            created_index: 0,
            modified_index: inner.index,
            nodes,
        })
    }

    fn expires(ttl: Option<Duration>) -> KvResult<Option<DateTime<Utc>>> {
        match ttl {
            None => Ok(None),
            Some(ttl) => {
                let delta = chrono::Duration::from_std(ttl)
                    .map_err(|e| KvError::Unavailable(format!("TTL out of range: {e}")))?;
                Ok(Some(Utc::now() + delta))
            }
        }
    }

    fn matches(change: &KvChange, prefix: &str) -> bool {
        let key = &change.node.key;
        key == prefix || key.starts_with(&format!("{prefix}/"))
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str, recursive: bool, _quorum: bool) -> KvResult<KvNode> {
        let key = Self::normalize(key);
        let mut inner = self.inner.lock().await;
        Self::purge_expired(&mut inner, self.history_limit);
        Self::build_node(&inner, &key, recursive).ok_or(KvError::KeyNotFound(key))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<KvNode> {
        let key = Self::normalize(key);
        let expires_at = Self::expires(ttl)?;
        let mut inner = self.inner.lock().await;
        Self::purge_expired(&mut inner, self.history_limit);

        let prev = inner.entries.get(&key).cloned();
        inner.index += 1;
        let entry = Entry {
            value: value.to_string(),
            created_index: prev
                .as_ref()
                .map(|p| p.created_index)
                .unwrap_or(inner.index),
            modified_index: inner.index,
            expires_at,
        };
        let node = Self::leaf_node(&key, &entry);
        inner.entries.insert(key.clone(), entry);
        Self::record(
            &mut inner,
            KvChange {
                action: KvAction::Set,
                node: node.clone(),
                prev_node: prev.map(|p| Self::leaf_node(&key, &p)),
            },
            self.history_limit,
        );
        drop(inner);
        self.notify.notify_waiters();
        Ok(node)
    }

    async fn create(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<KvNode> {
        let key = Self::normalize(key);
        let expires_at = Self::expires(ttl)?;
        let mut inner = self.inner.lock().await;
        Self::purge_expired(&mut inner, self.history_limit);

        if inner.entries.contains_key(&key) {
            return Err(KvError::NodeExist(key));
        }

        inner.index += 1;
        let entry = Entry {
            value: value.to_string(),
            created_index: inner.index,
            modified_index: inner.index,
            expires_at,
        };
        let node = Self::leaf_node(&key, &entry);
        inner.entries.insert(key.clone(), entry);
        Self::record(
            &mut inner,
            KvChange {
                action: KvAction::Create,
                node: node.clone(),
                prev_node: None,
            },
            self.history_limit,
        );
        drop(inner);
        self.notify.notify_waiters();
        Ok(node)
    }

    async fn delete(&self, key: &str, recursive: bool) -> KvResult<KvNode> {
        let key = Self::normalize(key);
        let mut inner = self.inner.lock().await;
        Self::purge_expired(&mut inner, self.history_limit);

        if let Some(old) = inner.entries.remove(&key) {
            inner.index += 1;
            let node = KvNode {
                key: key.clone(),
                value: String::new(),
                dir: false,
                created_index: old.created_index,
                modified_index: inner.index,
                nodes: Vec::new(),
            };
            let prev = Self::leaf_node(&key, &old);
            Self::record(
                &mut inner,
                KvChange {
                    action: KvAction::Delete,
                    node: node.clone(),
                    prev_node: Some(prev),
                },
                self.history_limit,
            );
            drop(inner);
            self.notify.notify_waiters();
            return Ok(node);
        }

        let child_prefix = format!("{key}/");
        let descendants: Vec<String> = inner
            .entries
            .keys()
            .filter(|k| k.starts_with(&child_prefix))
            .cloned()
            .collect();

        if descendants.is_empty() || !recursive {
            return Err(KvError::KeyNotFound(key));
        }

        for k in descendants {
            inner.entries.remove(&k);
        }
        inner.index += 1;
        let node = KvNode {
            key: key.clone(),
            dir: true,
            modified_index: inner.index,
            ..KvNode::default()
        };
        Self::record(
            &mut inner,
            KvChange {
                action: KvAction::Delete,
                node: node.clone(),
                prev_node: None,
            },
            self.history_limit,
        );
        drop(inner);
        self.notify.notify_waiters();
        Ok(node)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        value: &str,
        prev_value: Option<&str>,
        prev_index: Option<u64>,
        ttl: Option<Duration>,
    ) -> KvResult<KvNode> {
        let key = Self::normalize(key);
        let expires_at = Self::expires(ttl)?;
        let mut inner = self.inner.lock().await;
        Self::purge_expired(&mut inner, self.history_limit);

        let current = inner
            .entries
            .get(&key)
            .cloned()
            .ok_or_else(|| KvError::KeyNotFound(key.clone()))?;
        if prev_value.map(|v| v != current.value).unwrap_or(false)
            || prev_index.map(|i| i != current.modified_index).unwrap_or(false)
        {
            return Err(KvError::TestFailed(key));
        }

        inner.index += 1;
        let entry = Entry {
            value: value.to_string(),
            created_index: current.created_index,
            modified_index: inner.index,
            expires_at,
        };
        let node = Self::leaf_node(&key, &entry);
        inner.entries.insert(key.clone(), entry);
        Self::record(
            &mut inner,
            KvChange {
                action: KvAction::CompareAndSwap,
                node: node.clone(),
                prev_node: Some(Self::leaf_node(&key, &current)),
            },
            self.history_limit,
        );
        drop(inner);
        self.notify.notify_waiters();
        Ok(node)
    }

    async fn compare_and_delete(
        &self,
        key: &str,
        prev_value: Option<&str>,
        prev_index: Option<u64>,
    ) -> KvResult<KvNode> {
        let key = Self::normalize(key);
        let mut inner = self.inner.lock().await;
        Self::purge_expired(&mut inner, self.history_limit);

        let current = inner
            .entries
            .get(&key)
            .cloned()
            .ok_or_else(|| KvError::KeyNotFound(key.clone()))?;
        if prev_value.map(|v| v != current.value).unwrap_or(false)
            || prev_index.map(|i| i != current.modified_index).unwrap_or(false)
        {
            return Err(KvError::TestFailed(key));
        }

        inner.entries.remove(&key);
        inner.index += 1;
        let node = KvNode {
            key: key.clone(),
            value: String::new(),
            dir: false,
            created_index: current.created_index,
            modified_index: inner.index,
            nodes: Vec::new(),
        };
        Self::record(
            &mut inner,
            KvChange {
                action: KvAction::CompareAndDelete,
                node: node.clone(),
                prev_node: Some(Self::leaf_node(&key, &current)),
            },
            self.history_limit,
        );
        drop(inner);
        self.notify.notify_waiters();
        Ok(node)
    }

    async fn watch(&self, prefix: &str, after_index: u64) -> KvResult<KvChange> {
        let prefix = Self::normalize(prefix);
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().await;
                Self::purge_expired(&mut inner, self.history_limit);

                if after_index < inner.pruned_through {
                    return Err(KvError::IndexCleared {
                        index: after_index,
                        oldest: inner.pruned_through + 1,
                    });
                }

                if let Some(change) = inner
                    .changes
                    .iter()
                    .find(|c| c.node.modified_index > after_index && Self::matches(c, &prefix))
                {
                    return Ok(change.clone());
                }
            }

            // Wake on the next write, or poll so TTL expiry is noticed.
            let _ = tokio::time::timeout(WATCH_POLL, notified).await;
        }
    }
}
