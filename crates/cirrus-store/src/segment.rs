//! TAR segment store
//!
//! Backup data is stored in a collection of objects, grouped together into
//! segments for storage purposes. A segment is a plain POSIX TAR archive
//! in the staging directory: one regular-file entry per object named
//! `<segment>/<tag>`, followed by a trailing `<segment>/checksums` entry
//! listing `<tag> sha1=<hex>` lines. Any TAR reader can unpack a
//! segment.
//!
//! Objects with different `group` parameters are kept in separate
//! segments.

use crate::localdb::LocalDb;
use crate::remote::RemoteStore;
use cirrus_core::error::{io_error, Result};
use cirrus_core::hash::{sha1_file, sha1_hex};
use cirrus_core::reference::{generate_segment_name, ObjectReference};
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

const TAR_BLOCK_SIZE: u64 = 512;

/// Default target size of a segment before it is sealed.
pub const DEFAULT_TARGET_SIZE: u64 = 4 * 1024 * 1024;

/// A single open segment archive. Objects may only be written out all at
/// once, since the tar header must be written first.
struct SegmentWriter {
    name: String,
    builder: tar::Builder<File>,
    checksums: String,
    size_estimate: u64,
}

impl SegmentWriter {
    fn create(path: &Path, name: &str) -> Result<Self> {
        let file = File::create(path).map_err(|e| io_error("create_segment", e))?;
        Ok(SegmentWriter {
            name: name.to_string(),
            builder: tar::Builder::new(file),
            checksums: String::new(),
            size_estimate: 0,
        })
    }

    /// Append one object under `<segment>/<tag>` and record its digest in
    /// the pending checksums text.
    fn append_object(&mut self, sequence: &str, data: &[u8]) -> Result<()> {
        let entry_path = format!("{}/{}", self.name, sequence);
        self.append_entry(&entry_path, data)?;
        self.checksums
            .push_str(&format!("{} sha1={}\n", sequence, sha1_hex(data)));
        Ok(())
    }

    fn append_entry(&mut self, entry_path: &str, data: &[u8]) -> Result<()> {
        let mut header = tar::Header::new_ustar();
        header.set_size(data.len() as u64);
        header.set_mode(0o600);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        );

        self.builder
            .append_data(&mut header, entry_path, data)
            .map_err(|e| io_error("append_object", e))?;

        let payload_blocks = (data.len() as u64).div_ceil(TAR_BLOCK_SIZE);
        self.size_estimate += TAR_BLOCK_SIZE + payload_blocks * TAR_BLOCK_SIZE;
        Ok(())
    }

    /// Bytes this archive occupies so far (headers plus padded payloads).
    fn size_estimate(&self) -> u64 {
        self.size_estimate
    }

    /// Write the trailing checksums entry and finish the archive. The
    /// segment file is immutable afterwards.
    fn seal(mut self) -> Result<()> {
        let checksums = std::mem::take(&mut self.checksums);
        let entry_path = format!("{}/checksums", self.name);
        self.append_entry(&entry_path, checksums.as_bytes())?;

        self.builder
            .into_inner()
            .map_err(|e| io_error("seal_segment", e))?;
        Ok(())
    }
}

struct OpenSegment {
    name: String,
    basename: String,
    path: PathBuf,
    writer: SegmentWriter,
    count: u32,
}

/// Packs objects into TAR segments in a staging directory, sealing each
/// segment once it reaches the target size and handing the sealed file to
/// the catalog (and, when attached, the upload pipeline).
pub struct SegmentStore {
    staging_dir: PathBuf,
    target_size: u64,
    remote: Option<Arc<RemoteStore>>,
    segments: HashMap<String, OpenSegment>,
}

impl SegmentStore {
    /// New segments will be staged in the given directory.
    pub fn new(staging_dir: impl Into<PathBuf>) -> Self {
        SegmentStore {
            staging_dir: staging_dir.into(),
            target_size: DEFAULT_TARGET_SIZE,
            remote: None,
            segments: HashMap::new(),
        }
    }

    /// Override the size at which segments are sealed.
    pub fn with_target_size(mut self, target_size: u64) -> Self {
        self.target_size = target_size;
        self
    }

    /// Enqueue every sealed segment for upload through `remote`.
    pub fn with_remote(mut self, remote: Arc<RemoteStore>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Write an object into the segment currently open for `group` and
    /// return its reference. Groups never share a segment.
    pub fn write_object(
        &mut self,
        db: &LocalDb,
        data: &[u8],
        group: &str,
    ) -> Result<ObjectReference> {
        // Seal a full segment before appending, not after: by now the
        // caller has indexed every object already inside it, so the
        // catalog's size roll-up for the sealed segment is complete.
        if let Some(segment) = self.segments.get(group) {
            if segment.writer.size_estimate() >= self.target_size {
                self.close_segment(db, group)?;
            }
        }

        if !self.segments.contains_key(group) {
            let name = generate_segment_name();
            let basename = format!("{}.tar", name);
            let path = self.staging_dir.join(&basename);
            let writer = SegmentWriter::create(&path, &name)?;
            self.segments.insert(
                group.to_string(),
                OpenSegment {
                    name,
                    basename,
                    path,
                    writer,
                    count: 0,
                },
            );
        }

        let segment = self.segments.get_mut(group).unwrap();
        let sequence = format!("{:08x}", segment.count);
        segment.writer.append_object(&sequence, data)?;
        segment.count += 1;

        Ok(ObjectReference::normal(segment.name.clone(), sequence))
    }

    /// Ensure all open segments have been sealed and recorded.
    pub fn sync(&mut self, db: &LocalDb) -> Result<()> {
        let groups: Vec<String> = self.segments.keys().cloned().collect();
        for group in groups {
            self.close_segment(db, &group)?;
        }
        Ok(())
    }

    fn close_segment(&mut self, db: &LocalDb, group: &str) -> Result<()> {
        let segment = match self.segments.remove(group) {
            Some(segment) => segment,
            None => return Ok(()),
        };

        segment.writer.seal()?;

        let checksum = sha1_file(&segment.path)?;
        db.set_segment_checksum(&segment.name, &segment.basename, &checksum)?;

        tracing::debug!(
            segment = %segment.name,
            group,
            objects = segment.count,
            "sealed segment"
        );

        if let Some(remote) = &self.remote {
            let file = remote.alloc_file(&segment.basename, "segments")?;
            remote.enqueue(file);
        }

        Ok(())
    }
}
