//! Key/value storage and change notification.
//!
//! Persistence and synchronization are separate capabilities: a
//! [`KeyValueStore`] reads and writes strings, a [`ChangeObserver`] reports
//! writes made by *other* contexts. A backend may provide both (see
//! [`MemoryStore`]) or leave observation to a companion watcher.

use crate::error::PersistenceResult;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

/// Identifies the context (process, handle) that made a change.
pub type ContextId = u64;

/// Origin used for changes whose writer is unknown.
pub const EXTERNAL_CONTEXT: ContextId = 0;

static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_context_id() -> ContextId {
    NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed)
}

/// String key/value storage.
#[cfg_attr(test, mockall::automock)]
pub trait KeyValueStore: Send + Sync {
    /// `Ok(None)` when the key is absent.
    fn get(&self, key: &str) -> PersistenceResult<Option<String>>;

    fn set(&self, key: &str, value: &str) -> PersistenceResult<()>;

    /// Removing an absent key succeeds.
    fn remove(&self, key: &str) -> PersistenceResult<()>;
}

/// A write observed on shared storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChange {
    pub key: String,
    /// `None` when the key was removed.
    pub new_value: Option<String>,
    pub origin: ContextId,
}

/// Source of storage-change notifications.
pub trait ChangeObserver: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<StorageChange>;

    /// Changes carrying this origin were made through the observing context
    /// itself and can be ignored.
    fn context_id(&self) -> ContextId;
}

const CHANGE_CHANNEL_CAPACITY: usize = 64;

struct MemoryInner {
    data: RwLock<HashMap<String, String>>,
    changes: broadcast::Sender<StorageChange>,
}

/// In-process store shared between contexts.
///
/// Every handle from [`MemoryStore::open_context`] sees the same data and is
/// notified of every write, tagged with the writer's context id.
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
    context: ContextId,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(MemoryInner {
                data: RwLock::new(HashMap::new()),
                changes,
            }),
            context: next_context_id(),
        }
    }

    /// Another handle onto the same data, acting as a separate context.
    pub fn open_context(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            context: next_context_id(),
        }
    }

    fn notify(&self, key: &str, new_value: Option<String>) {
        let change = StorageChange {
            key: key.to_string(),
            new_value,
            origin: self.context,
        };
        // No receivers is fine.
        let receivers = self.inner.changes.send(change).unwrap_or(0);
        trace!(key = %key, receivers, "Storage change broadcast");
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> PersistenceResult<Option<String>> {
        Ok(self.inner.data.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> PersistenceResult<()> {
        self.inner
            .data
            .write()
            .insert(key.to_string(), value.to_string());
        self.notify(key, Some(value.to_string()));
        Ok(())
    }

    fn remove(&self, key: &str) -> PersistenceResult<()> {
        let removed = self.inner.data.write().remove(key);
        if removed.is_some() {
            self.notify(key, None);
        }
        Ok(())
    }
}

impl ChangeObserver for MemoryStore {
    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.inner.changes.subscribe()
    }

    fn context_id(&self) -> ContextId {
        self.context
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        assert_eq!(store.get("k").unwrap(), None);

        store.set("k", "v").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v"));

        store.remove("k").unwrap();
        store.remove("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn test_contexts_share_data_and_tag_changes() {
        let tab_a = MemoryStore::new();
        let tab_b = tab_a.open_context();
        assert_ne!(tab_a.context_id(), tab_b.context_id());

        let mut rx = tab_b.subscribe();
        tab_a.set("k", "1").unwrap();

        assert_eq!(tab_b.get("k").unwrap().as_deref(), Some("1"));
        let change = rx.try_recv().unwrap();
        assert_eq!(change.key, "k");
        assert_eq!(change.new_value.as_deref(), Some("1"));
        assert_eq!(change.origin, tab_a.context_id());
    }

    #[test]
    fn test_removing_absent_key_is_silent() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe();
        store.remove("missing").unwrap();
        assert!(rx.try_recv().is_err());
    }
}
