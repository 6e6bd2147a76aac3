//! Metadata stream writer
//!
//! Every inode visited by the scanner is recorded as one entry in a UTF-8
//! text stream: `name:` and `type:` lines first, then the remaining
//! key/value lines in insertion order, then a blank separator line.
//! Free-form values are URI-encoded by the caller.
//!
//! At the end of the scan the whole stream becomes a single object in the
//! distinguished `"root"` group, indexed and marked used like any data
//! block.

use cirrus_core::error::Result;
use cirrus_core::format::uri_encode;
use cirrus_core::hash::sha1_hex;
use cirrus_core::reference::ObjectReference;
use cirrus_store::{LocalDb, SegmentStore};

/// Accumulates the metadata stream for one snapshot.
pub struct MetadataWriter {
    buf: String,
}

impl MetadataWriter {
    pub fn new() -> Self {
        MetadataWriter { buf: String::new() }
    }

    /// Record one inode. `name` is the raw path (URI-encoded here);
    /// `fields` are emitted in the given order after `name` and `type`.
    pub fn add(&mut self, name: &[u8], inode_type: char, fields: &[(&str, String)]) {
        self.buf.push_str("name: ");
        self.buf.push_str(&uri_encode(name));
        self.buf.push('\n');
        self.buf.push_str("type: ");
        self.buf.push(inode_type);
        self.buf.push('\n');
        for (key, value) in fields {
            self.buf.push_str(key);
            self.buf.push_str(": ");
            self.buf.push_str(value);
            self.buf.push('\n');
        }
        self.buf.push('\n');
    }

    /// The stream accumulated so far.
    pub fn contents(&self) -> &str {
        &self.buf
    }

    /// Write the stream as the snapshot's root object and return its
    /// reference.
    pub fn close(self, db: &LocalDb, store: &mut SegmentStore) -> Result<ObjectReference> {
        let data = self.buf.into_bytes();
        let root = store.write_object(db, &data, "root")?;
        db.store_object(&root, &sha1_hex(&data), data.len() as u64, None)?;
        db.use_object(&root)?;
        Ok(root)
    }
}

impl Default for MetadataWriter {
    fn default() -> Self {
        MetadataWriter::new()
    }
}
