//! Error handling for the cirrus workspace
//!
//! One error type covers the whole engine. Per-file scan problems are
//! logged and skipped by the scanner rather than surfaced here; anything
//! that reaches a `BackupError` aborts the snapshot session.

use thiserror::Error;

/// Result type alias using BackupError
pub type Result<T> = std::result::Result<T, BackupError>;

/// Error taxonomy for a snapshot session
#[derive(Debug, Error)]
pub enum BackupError {
    /// Filesystem, network, or process-spawn failure
    #[error("I/O error in {op}: {source}")]
    Io {
        op: String,
        #[source]
        source: std::io::Error,
    },

    /// Catalog statement failure
    #[error("catalog error in {op}: {message}")]
    Db { op: String, message: String },

    /// Malformed on-disk data read back
    #[error("malformed {what}: {message}")]
    Format { what: String, message: String },

    /// Internal assertion failure (e.g. missing snapshot id)
    #[error("invariant violated: {0}")]
    Invariant(String),
}

/// Create an I/O error with operation context
pub fn io_error(op: impl Into<String>, source: std::io::Error) -> BackupError {
    BackupError::Io {
        op: op.into(),
        source,
    }
}

/// Create a catalog error with operation context
pub fn db_error(op: impl Into<String>, message: impl Into<String>) -> BackupError {
    BackupError::Db {
        op: op.into(),
        message: message.into(),
    }
}

/// Create a format error for malformed stored data
pub fn format_error(what: impl Into<String>, message: impl Into<String>) -> BackupError {
    BackupError::Format {
        what: what.into(),
        message: message.into(),
    }
}

/// Create an invariant-violation error
pub fn invariant(message: impl Into<String>) -> BackupError {
    BackupError::Invariant(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_display_includes_op() {
        let err = io_error(
            "open_segment",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        let text = err.to_string();
        assert!(text.contains("open_segment"));
        assert!(text.contains("gone"));
    }

    #[test]
    fn test_db_error_display() {
        let err = db_error("find_object", "no such table: block_index");
        assert!(err.to_string().contains("find_object"));
    }
}
