//! SQL definitions for the key-value store.

/// SQL statement to create the migrations tracking table.
pub const CREATE_MIGRATIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS migrations (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// SQL statement to create the namespaced key-value table.
pub const CREATE_KV_STORE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    namespace TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (namespace, key)
);
"#;

/// v2: track when each value was last written.
pub const ALTER_ADD_UPDATED_AT: &str = "ALTER TABLE kv_store ADD COLUMN updated_at TEXT;";

pub const CREATE_KV_STORE_UPDATED_AT_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_kv_store_updated_at ON kv_store(updated_at);
"#;
