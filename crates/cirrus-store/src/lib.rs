//! Cirrus store - Persistence layer for the backup engine
//!
//! Provides:
//! - The local snapshot catalog (`LocalDb`) over SQLite with embedded
//!   migrations
//! - The TAR segment store (`SegmentStore`) that packs objects into
//!   staged segment archives
//! - The asynchronous upload pipeline (`RemoteStore`/`RemoteFile`) with
//!   bounded-queue backpressure

pub mod db;
pub mod localdb;
pub mod migrations;
pub mod remote;
pub mod segment;

// Re-export key types
pub use localdb::LocalDb;
pub use remote::{RemoteFile, RemoteStore};
pub use segment::SegmentStore;
