//! Versioned schema migrations for the SQLite store.
//!
//! Migrations are tracked in the `migrations` table and each one runs
//! exactly once, in order, inside its own transaction.

use rusqlite::Connection;

use crate::storage::schema::{
    ALTER_ADD_UPDATED_AT, CREATE_KV_STORE_TABLE, CREATE_KV_STORE_UPDATED_AT_INDEX,
    CREATE_MIGRATIONS_TABLE,
};
use crate::storage::StorageError;

struct Migration {
    version: i32,
    name: &'static str,
    statements: &'static [&'static str],
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_kv_store_table",
        statements: &[CREATE_KV_STORE_TABLE],
    },
    Migration {
        version: 2,
        name: "add_kv_store_updated_at",
        statements: &[ALTER_ADD_UPDATED_AT, CREATE_KV_STORE_UPDATED_AT_INDEX],
    },
];

/// Latest schema version known to this build.
pub fn latest_version() -> i32 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

fn get_current_version(conn: &Connection) -> Result<i32, StorageError> {
    let version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM migrations",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

fn record_migration(conn: &Connection, version: i32, name: &str) -> Result<(), StorageError> {
    conn.execute(
        "INSERT INTO migrations (version, name) VALUES (?1, ?2)",
        (version, name),
    )?;
    Ok(())
}

/// Runs all pending migrations.
pub fn run_migrations(conn: &mut Connection) -> Result<(), StorageError> {
    conn.execute_batch(CREATE_MIGRATIONS_TABLE)?;

    let current_version = get_current_version(conn)?;
    let pending: Vec<&Migration> = MIGRATIONS
        .iter()
        .filter(|m| m.version > current_version)
        .collect();

    if pending.is_empty() {
        tracing::debug!("Store schema is up to date (v{})", current_version);
        return Ok(());
    }

    tracing::info!(
        "{} pending store migration(s) from v{}",
        pending.len(),
        current_version
    );

    for migration in pending {
        let tx = conn.transaction()?;

        for statement in migration.statements {
            tx.execute_batch(statement).map_err(|e| {
                StorageError::Migration(format!("Migration {} failed: {}", migration.name, e))
            })?;
        }

        record_migration(&tx, migration.version, migration.name)?;
        tx.commit()?;

        tracing::info!(
            "Applied store migration {} (v{})",
            migration.name,
            migration.version
        );
    }

    Ok(())
}
