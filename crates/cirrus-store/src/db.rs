//! Database connection management
//!
//! Provides utilities for opening and configuring SQLite connections

use cirrus_core::error::{db_error, BackupError, Result};
use rusqlite::Connection;
use std::path::Path;

/// Map a rusqlite error into the catalog error class, tagged with the
/// failing operation.
pub fn from_rusqlite(op: &str, err: rusqlite::Error) -> BackupError {
    db_error(op, err.to_string())
}

/// Open the catalog database at the given path
pub fn open<P: AsRef<Path>>(path: P) -> Result<Connection> {
    let conn = Connection::open(path).map_err(|e| from_rusqlite("open", e))?;
    configure(&conn)?;
    Ok(conn)
}

/// Configure a connection with the settings the catalog expects
pub fn configure(conn: &Connection) -> Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])
        .map_err(|e| from_rusqlite("configure", e))?;
    Ok(())
}
