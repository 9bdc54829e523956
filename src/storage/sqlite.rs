//! SQLite-backed [`Persistence`] implementation.

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::storage::migrations::run_migrations;
use crate::storage::{Persistence, StorageError};

/// Key-value store persisted in a SQLite database
pub struct SqliteStore {
    namespace: String,
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

/// Returns the default database path (~/.scanfill/scanfill.db).
pub fn default_database_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| {
            tracing::error!("Could not determine home directory, using /tmp");
            PathBuf::from("/tmp")
        })
        .join(".scanfill")
        .join("scanfill.db")
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `path` and runs migrations.
    pub fn open(path: &Path, namespace: impl Into<String>) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
                tracing::info!("Created storage directory at {:?}", parent);
            }
        }

        let conn = Connection::open(path)?;
        tracing::info!("Store opened at {:?}", path);
        Self::with_connection(conn, namespace)
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory(namespace: impl Into<String>) -> Result<Self, StorageError> {
        Self::with_connection(Connection::open_in_memory()?, namespace)
    }

    fn with_connection(
        mut conn: Connection,
        namespace: impl Into<String>,
    ) -> Result<Self, StorageError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        run_migrations(&mut conn)?;
        Ok(Self {
            namespace: namespace.into(),
            conn: Mutex::new(conn),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Keys stored under this namespace, sorted.
    pub fn keys(&self) -> Result<Vec<String>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT key FROM kv_store WHERE namespace = ?1 ORDER BY key")?;
        let keys = stmt
            .query_map(params![self.namespace], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }
}

impl Persistence for SqliteStore {
    fn save_value(&self, key: &str, value: &Value) -> Result<(), StorageError> {
        let json = serde_json::to_string(value)?;
        self.conn.lock().execute(
            r#"
            INSERT INTO kv_store (namespace, key, value, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(namespace, key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
            params![self.namespace, key, json, Utc::now().to_rfc3339()],
        )?;
        tracing::debug!("Saved '{}:{}'", self.namespace, key);
        Ok(())
    }

    fn load_value(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let raw: Option<String> = self
            .conn
            .lock()
            .query_row(
                "SELECT value FROM kv_store WHERE namespace = ?1 AND key = ?2",
                params![self.namespace, key],
                |row| row.get(0),
            )
            .optional()?;

        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.conn.lock().execute(
            "DELETE FROM kv_store WHERE namespace = ?1 AND key = ?2",
            params![self.namespace, key],
        )?;
        Ok(())
    }
}
