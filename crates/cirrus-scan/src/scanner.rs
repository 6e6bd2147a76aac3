//! Filesystem scanner and dumper
//!
//! Walks a directory tree, emits one metadata entry per inode, and streams
//! regular files into the segment store in fixed-size blocks. Blocks whose
//! checksum matches a live entry in the local catalog are reused by
//! reference instead of being written again.
//!
//! Per-file problems (vanished paths, permission errors, replaced files)
//! are logged and the entry skipped; one file's failure does not fail the
//! snapshot. Catalog and store errors abort the session.

use crate::metadata::MetadataWriter;
use cirrus_core::error::Result;
use cirrus_core::format::{format_int, uri_encode};
use cirrus_core::hash::{sha1_hex, Checksum};
use cirrus_core::reference::ObjectReference;
use cirrus_store::{LocalDb, SegmentStore};
use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// Fixed block size for splitting regular files.
pub const BLOCK_SIZE: usize = 1024 * 1024;

/// Files with at least this many blocks store their reference list in an
/// indirect object instead of inline.
const INLINE_REF_LIMIT: usize = 8;

/// Scanner context: the catalog, the segment store, and the metadata
/// stream under construction.
pub struct Dumper<'a> {
    db: &'a LocalDb,
    store: &'a mut SegmentStore,
    metadata: MetadataWriter,
    block_buf: Vec<u8>,
}

impl<'a> Dumper<'a> {
    pub fn new(db: &'a LocalDb, store: &'a mut SegmentStore) -> Self {
        Dumper {
            db,
            store,
            metadata: MetadataWriter::new(),
            block_buf: vec![0u8; BLOCK_SIZE],
        }
    }

    /// Walk the tree rooted at `base` and record every inode. Paths in
    /// the metadata stream are relative to `base`, starting with `.` for
    /// the root itself.
    pub fn scan_tree(&mut self, base: &Path) -> Result<()> {
        self.scan_path(base, Path::new("."))
    }

    /// The metadata stream accumulated so far.
    pub fn metadata_contents(&self) -> &str {
        self.metadata.contents()
    }

    /// Finish the scan: write the metadata stream as the root object.
    pub fn close(self) -> Result<ObjectReference> {
        self.metadata.close(self.db, self.store)
    }

    fn scan_path(&mut self, base: &Path, rel: &Path) -> Result<()> {
        let full = base.join(rel);

        let lstat = match fs::symlink_metadata(&full) {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!(path = %full.display(), error = %e, "lstat failed, skipping");
                return Ok(());
            }
        };

        let mut meta = lstat;
        let mut file = None;

        if inode_type_char(meta.mode()) == Some('-') {
            // The path may have been replaced between lstat and open, so
            // open defensively and re-check the inode type through the
            // descriptor before reading any data.
            let opened = match open_noatime(&full) {
                Ok(f) => f,
                Err(e) => {
                    tracing::warn!(path = %full.display(), error = %e, "unable to open file, skipping");
                    return Ok(());
                }
            };
            clear_nonblock(&opened);

            let fstat = match opened.metadata() {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(path = %full.display(), error = %e, "fstat failed, skipping");
                    return Ok(());
                }
            };
            if inode_type_char(fstat.mode()) != Some('-') {
                tracing::warn!(path = %full.display(), "file is no longer a regular file, skipping");
                return Ok(());
            }

            meta = fstat;
            file = Some(opened);
        }

        self.dump_inode(&full, rel, &meta, file)?;

        if inode_type_char(meta.mode()) == Some('d') {
            self.scan_directory(base, rel, &full)?;
        }

        Ok(())
    }

    fn scan_directory(&mut self, base: &Path, rel: &Path, full: &Path) -> Result<()> {
        let entries = match fs::read_dir(full) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(path = %full.display(), error = %e, "unable to read directory");
                return Ok(());
            }
        };

        let mut names = Vec::new();
        for entry in entries {
            match entry {
                Ok(entry) => names.push(entry.file_name()),
                Err(e) => {
                    tracing::warn!(path = %full.display(), error = %e, "unable to read directory entry");
                }
            }
        }
        names.sort();

        for name in names {
            let child = if rel == Path::new(".") {
                PathBuf::from(&name)
            } else {
                rel.join(&name)
            };
            self.scan_path(base, &child)?;
        }

        Ok(())
    }

    /// Emit the metadata entry for one inode, streaming file contents
    /// into the store for regular files.
    fn dump_inode(
        &mut self,
        full: &Path,
        rel: &Path,
        meta: &fs::Metadata,
        file: Option<File>,
    ) -> Result<()> {
        let type_char = match inode_type_char(meta.mode()) {
            Some(c) => c,
            None => {
                tracing::warn!(path = %full.display(), mode = meta.mode(), "unknown inode type, skipping");
                return Ok(());
            }
        };

        let mut fields: Vec<(&str, String)> = vec![
            ("mode", format_int((meta.mode() & 0o7777) as i64, 8)),
            ("atime", meta.atime().to_string()),
            ("ctime", meta.ctime().to_string()),
            ("mtime", meta.mtime().to_string()),
            ("user", meta.uid().to_string()),
            ("group", meta.gid().to_string()),
        ];

        match type_char {
            '-' => {
                let mut file = match file {
                    Some(f) => f,
                    None => return Ok(()),
                };
                let (size, checksum, data) = self.dump_file(&mut file, full)?;
                if size != meta.size() {
                    tracing::warn!(path = %full.display(), "size changed while reading");
                }
                fields.push(("size", size.to_string()));
                fields.push(("checksum", checksum));
                fields.push(("data", data));
            }
            'l' => match read_link_bounded(full, meta.size()) {
                Ok((target, truncated)) => {
                    if truncated {
                        tracing::warn!(path = %full.display(), "symlink target truncated");
                    }
                    fields.push(("contents", uri_encode(&target)));
                }
                Err(e) => {
                    tracing::warn!(path = %full.display(), error = %e, "unable to read symlink");
                }
            },
            _ => {}
        }

        self.metadata
            .add(rel.as_os_str().as_bytes(), type_char, &fields);
        Ok(())
    }

    /// Stream one regular file into the store. Returns the byte count,
    /// the whole-file SHA-1, and the `data` field value.
    fn dump_file(&mut self, file: &mut File, full: &Path) -> Result<(u64, String, String)> {
        let mut file_hash = Checksum::new();
        let mut refs = Vec::new();
        let mut size = 0u64;

        loop {
            let n = match file_read(file, &mut self.block_buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(path = %full.display(), error = %e,
                        "read error, backup contents may be incomplete");
                    break;
                }
            };

            let block = &self.block_buf[..n];
            file_hash.update(block);
            size += n as u64;

            // Runs of zeros are encoded as the special zero reference;
            // they occupy no segment space and no index row.
            let reference = if block.iter().all(|&b| b == 0) {
                ObjectReference::zero_with_size(n as u64)
            } else {
                store_block(self.db, self.store, block)?
            };

            self.db.use_object(&reference)?;
            refs.push(reference);
        }

        let data = if refs.len() < INLINE_REF_LIMIT {
            refs.iter()
                .map(|r| r.to_string())
                .collect::<Vec<_>>()
                .join(" ")
        } else {
            // Too many blocks to list inline: store the newline-separated
            // reference list as an object of its own.
            let mut listing = String::new();
            for reference in &refs {
                listing.push_str(&reference.to_string());
                listing.push('\n');
            }
            let bytes = listing.as_bytes();
            let indirect = self.store.write_object(self.db, bytes, "indirect")?;
            self.db
                .store_object(&indirect, &sha1_hex(bytes), bytes.len() as u64, None)?;
            self.db.use_object(&indirect)?;
            format!("@{}", indirect)
        };

        Ok((size, file_hash.hex_digest(), data))
    }
}

/// Deduplicate one block against the catalog, writing it out only when no
/// live copy exists.
fn store_block(db: &LocalDb, store: &mut SegmentStore, block: &[u8]) -> Result<ObjectReference> {
    let checksum = sha1_hex(block);
    let size = block.len() as u64;

    if let Some(existing) = db.find_object(&checksum, size)? {
        return Ok(existing);
    }

    // The content may have been stored before and since expired (its
    // segment was cleaned). Rewrite such blocks into a group of their own
    // so old data clusters together, and keep the original age so
    // expiration policies still see it as old data.
    let (group, age) = match db.is_old_object(&checksum, size)? {
        Some((age, group)) if group != 0 => (format!("compacted-{}", group), Some(age)),
        Some((age, _)) => ("data".to_string(), Some(age)),
        None => ("data".to_string(), None),
    };

    let reference = store.write_object(db, block, &group)?;
    db.store_object(&reference, &checksum, size, age)?;
    Ok(reference)
}

/// Read from `file` until `buf` is full or end-of-file, retrying on
/// EINTR. A short count means EOF was reached.
fn file_read(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match file.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

/// Single-character inode type: `-dlbcps`, or `None` for anything else.
fn inode_type_char(mode: u32) -> Option<char> {
    match mode & libc::S_IFMT {
        libc::S_IFREG => Some('-'),
        libc::S_IFDIR => Some('d'),
        libc::S_IFLNK => Some('l'),
        libc::S_IFBLK => Some('b'),
        libc::S_IFCHR => Some('c'),
        libc::S_IFIFO => Some('p'),
        libc::S_IFSOCK => Some('s'),
        _ => None,
    }
}

/// Open a file for reading with `O_NOATIME|O_NOFOLLOW|O_NONBLOCK`.
/// `O_NOFOLLOW` and `O_NONBLOCK` guard against the path having been
/// replaced by a symlink or fifo since the lstat; `O_NOATIME` avoids
/// inode writebacks but may fail with EPERM, so the open is retried
/// without it.
fn open_noatime(path: &Path) -> io::Result<File> {
    let guarded = libc::O_NOFOLLOW | libc::O_NONBLOCK;
    OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NOATIME | guarded)
        .open(path)
        .or_else(|_| OpenOptions::new().read(true).custom_flags(guarded).open(path))
}

/// Drop the `O_NONBLOCK` flag; it was only wanted for the open itself.
fn clear_nonblock(file: &File) {
    let fd = file.as_raw_fd();
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags >= 0 {
            libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK);
        }
    }
}

/// Read a symlink target with a buffer sized from `st_size`, so a target
/// that grew since the lstat is detected. Returns the bytes read and
/// whether they were truncated.
fn read_link_bounded(path: &Path, st_size: u64) -> io::Result<(Vec<u8>, bool)> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;

    let mut buf = vec![0u8; st_size as usize + 2];
    let len = unsafe {
        libc::readlink(
            c_path.as_ptr(),
            buf.as_mut_ptr() as *mut libc::c_char,
            buf.len(),
        )
    };
    if len < 0 {
        return Err(io::Error::last_os_error());
    }

    let len = len as usize;
    let truncated = len as u64 > st_size;
    buf.truncate(len);
    Ok((buf, truncated))
}
