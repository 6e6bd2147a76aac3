//! SHA-1 digest helpers
//!
//! SHA-1 is the documented digest of the segment format: the per-segment
//! `checksums` entry names the algorithm literally, so replacing it is a
//! format version bump, not a configuration knob.

use crate::error::{io_error, Result};
use sha1::{Digest, Sha1};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Incremental SHA-1 over a stream of updates.
pub struct Checksum {
    inner: Sha1,
}

impl Checksum {
    pub fn new() -> Self {
        Checksum { inner: Sha1::new() }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Consume the checksum and return the lowercase hex digest.
    pub fn hex_digest(self) -> String {
        hex::encode(self.inner.finalize())
    }
}

impl Default for Checksum {
    fn default() -> Self {
        Checksum::new()
    }
}

/// One-shot lowercase hex SHA-1 of a byte string.
pub fn sha1_hex(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}

/// Lowercase hex SHA-1 of a file's contents.
pub fn sha1_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| io_error("checksum_file", e))?;
    let mut hasher = Sha1::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(|e| io_error("checksum_file", e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
