//! Persistence boundary.
//!
//! The core stores rules, prefixes, history and mode as JSON values in an
//! opaque, namespaced key-value store. Two backends are provided: an
//! in-memory map and a SQLite database (`~/.scanfill/scanfill.db` by
//! default). The cross-tab [`SharedStore`] lives alongside them because
//! leader election and the storage-event relay need a store every tab sees.

pub mod migrations;
pub mod schema;
pub mod shared;
pub mod sqlite;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

pub use shared::{MemorySharedStore, SharedStore, StorageEvent};
pub use sqlite::SqliteStore;

/// Well-known persistence keys
pub mod keys {
    pub const RULES: &str = "rules";
    pub const PREFIXES: &str = "prefixes";
    pub const HISTORY: &str = "history";
    pub const FIELDS: &str = "fields";
    pub const MACROS: &str = "macros";
    pub const MODE: &str = "mode";
}

/// Storage error types.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to create storage directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to (de)serialise stored value: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Storage unavailable")]
    Unavailable,
}

/// Opaque namespaced key-value store of JSON values
pub trait Persistence: Send + Sync {
    fn save_value(&self, key: &str, value: &Value) -> Result<(), StorageError>;
    fn load_value(&self, key: &str) -> Result<Option<Value>, StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// Typed helpers over [`Persistence`]
pub trait PersistenceExt: Persistence {
    fn save<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let value = serde_json::to_value(value)?;
        self.save_value(key, &value)
    }

    /// Load `key`, falling back to `default` when it is absent or unreadable
    fn load<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        match self.load_value(key) {
            Ok(Some(value)) => match serde_json::from_value(value) {
                Ok(parsed) => parsed,
                Err(e) => {
                    tracing::warn!("Stored value for '{}' is unreadable, using default: {}", key, e);
                    default
                }
            },
            Ok(None) => default,
            Err(e) => {
                tracing::error!("Failed to load '{}', using default: {}", key, e);
                default
            }
        }
    }
}

impl<P: Persistence + ?Sized> PersistenceExt for P {}

/// In-memory [`Persistence`] backend
#[derive(Debug, Default)]
pub struct MemoryStore {
    namespace: String,
    values: RwLock<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            values: RwLock::new(HashMap::new()),
        }
    }

    fn scoped(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }

    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }
}

impl Persistence for MemoryStore {
    fn save_value(&self, key: &str, value: &Value) -> Result<(), StorageError> {
        self.values.write().insert(self.scoped(key), value.clone());
        Ok(())
    }

    fn load_value(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.values.read().get(&self.scoped(key)).cloned())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.values.write().remove(&self.scoped(key));
        Ok(())
    }
}
