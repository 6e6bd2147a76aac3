//! Migration runner
//!
//! Applies embedded migrations idempotently, each in its own transaction

use crate::db::from_rusqlite;
use crate::migrations::embedded::get_migrations;
use cirrus_core::error::{db_error, Result};
use cirrus_core::hash::sha1_hex;
use rusqlite::Connection;

/// Apply all pending migrations to the database
pub fn apply_migrations(conn: &mut Connection) -> Result<()> {
    create_schema_version_table(conn)?;

    for migration in get_migrations() {
        apply_migration(conn, migration.id, migration.sql)?;
    }

    Ok(())
}

/// Create the schema_version table if it doesn't exist
fn create_schema_version_table(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY,
            migration_id TEXT NOT NULL UNIQUE,
            applied_at REAL NOT NULL,
            checksum TEXT
        )",
        [],
    )
    .map_err(|e| from_rusqlite("create_schema_version", e))?;

    Ok(())
}

/// Apply a single migration if not already applied
fn apply_migration(conn: &mut Connection, migration_id: &str, sql: &str) -> Result<()> {
    let already_applied: bool = conn
        .query_row(
            "SELECT 1 FROM schema_version WHERE migration_id = ?",
            [migration_id],
            |_| Ok(true),
        )
        .unwrap_or(false);

    if already_applied {
        return Ok(());
    }

    let checksum = sha1_hex(sql.as_bytes());

    let tx = conn
        .transaction()
        .map_err(|e| from_rusqlite("apply_migration", e))?;

    tx.execute_batch(sql)
        .map_err(|e| db_error("apply_migration", format!("{}: {}", migration_id, e)))?;

    tx.execute(
        "INSERT INTO schema_version (migration_id, applied_at, checksum)
         VALUES (?, julianday('now'), ?)",
        rusqlite::params![migration_id, checksum],
    )
    .map_err(|e| from_rusqlite("apply_migration", e))?;

    tx.commit().map_err(|e| from_rusqlite("apply_migration", e))?;

    Ok(())
}
