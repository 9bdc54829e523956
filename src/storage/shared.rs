//! Cross-tab shared store.
//!
//! Models the origin-wide string store every tab can see (the leader record
//! and the storage-event relay both live here). Writes raise a
//! [`StorageEvent`] that every subscriber receives; like the browser's
//! storage event, consumers ignore events whose `origin` is themselves.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;

use crate::storage::StorageError;

const EVENT_CAPACITY: usize = 256;

/// Mutation notification raised by a [`SharedStore`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
    /// `None` when the key was removed
    pub new_value: Option<String>,
    /// Tab that performed the write
    pub origin: String,
}

/// String store shared by every tab of an origin
pub trait SharedStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, origin: &str, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, origin: &str, key: &str) -> Result<(), StorageError>;
    fn subscribe(&self) -> broadcast::Receiver<StorageEvent>;
}

/// In-process [`SharedStore`]; tabs in the same process share one instance
#[derive(Debug)]
pub struct MemorySharedStore {
    values: RwLock<HashMap<String, String>>,
    events: broadcast::Sender<StorageEvent>,
    available: AtomicBool,
}

impl Default for MemorySharedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySharedStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            values: RwLock::new(HashMap::new()),
            events,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the store becoming unreachable (quota, privacy mode, ...)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Unavailable)
        }
    }

    fn notify(&self, origin: &str, key: &str, new_value: Option<String>) {
        // No receivers is fine: nobody else is listening yet
        let _ = self.events.send(StorageEvent {
            key: key.to_string(),
            new_value,
            origin: origin.to_string(),
        });
    }
}

impl SharedStore for MemorySharedStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.check_available()?;
        Ok(self.values.read().get(key).cloned())
    }

    fn set(&self, origin: &str, key: &str, value: &str) -> Result<(), StorageError> {
        self.check_available()?;
        self.values
            .write()
            .insert(key.to_string(), value.to_string());
        self.notify(origin, key, Some(value.to_string()));
        Ok(())
    }

    fn remove(&self, origin: &str, key: &str) -> Result<(), StorageError> {
        self.check_available()?;
        if self.values.write().remove(key).is_some() {
            self.notify(origin, key, None);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_remove() {
        let store = MemorySharedStore::new();
        store.set("tab-a", "k", "v").unwrap();
        assert_eq!(store.get("k").unwrap(), Some("v".to_string()));
        store.remove("tab-a", "k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn test_events_carry_origin() {
        let store = MemorySharedStore::new();
        let mut rx = store.subscribe();

        store.set("tab-a", "k", "v").unwrap();
        store.remove("tab-b", "k").unwrap();

        let first = rx.try_recv().unwrap();
        assert_eq!(first.origin, "tab-a");
        assert_eq!(first.new_value.as_deref(), Some("v"));

        let second = rx.try_recv().unwrap();
        assert_eq!(second.origin, "tab-b");
        assert_eq!(second.new_value, None);
    }

    #[test]
    fn test_remove_missing_key_raises_no_event() {
        let store = MemorySharedStore::new();
        let mut rx = store.subscribe();
        store.remove("tab-a", "missing").unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_unavailable_store_errors() {
        let store = MemorySharedStore::new();
        store.set_available(false);
        assert!(matches!(store.get("k"), Err(StorageError::Unavailable)));
        assert!(store.set("tab", "k", "v").is_err());
    }
}
