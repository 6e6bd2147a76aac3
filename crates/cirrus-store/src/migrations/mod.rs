//! Migration framework
//!
//! Provides:
//! - A migration runner with checksum bookkeeping
//! - Idempotent application
//! - Embedded SQL migrations

mod embedded;
mod runner;

pub use runner::apply_migrations;
