//! Backup command
//!
//! Usage:
//!   cirrus backup --dest <DIR> <SOURCE>
//!   cirrus backup --upload-script <CMD> --localdb <DIR> <SOURCE>
//!
//! Drives one snapshot session: opens the local catalog, scans the source
//! tree into staged TAR segments, and finishes with a checksums file and a
//! backup descriptor naming the root object and every segment the
//! snapshot depends on.

use cirrus_core::hash::sha1_file;
use cirrus_core::reference::generate_segment_name;
use cirrus_scan::Dumper;
use cirrus_store::segment::DEFAULT_TARGET_SIZE;
use cirrus_store::{LocalDb, RemoteStore, SegmentStore};
use clap::Args;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Args)]
pub struct BackupArgs {
    /// Directory tree to back up
    pub source: PathBuf,

    /// Directory where backup files are written (mutually exclusive with
    /// --upload-script)
    #[arg(long, conflicts_with = "upload_script")]
    pub dest: Option<PathBuf>,

    /// Program invoked for each finished backup file, as
    /// "<script> <local> <type> <remote>"
    #[arg(long)]
    pub upload_script: Option<String>,

    /// Directory holding the local catalog database (defaults to --dest)
    #[arg(long)]
    pub localdb: Option<PathBuf>,

    /// Optional name for this snapshot series
    #[arg(long)]
    pub scheme: Option<String>,

    /// Staging directory for upload mode (defaults to $TMPDIR or /tmp)
    #[arg(long)]
    pub tmpdir: Option<PathBuf>,

    /// Target segment size in bytes
    #[arg(long, default_value_t = DEFAULT_TARGET_SIZE)]
    pub segment_size: u64,
}

/// Execute the backup command
pub fn execute(args: BackupArgs) -> Result<(), Box<dyn std::error::Error>> {
    if args.dest.is_none() && args.upload_script.is_none() {
        return Err("must specify either --dest or --upload-script".into());
    }

    let localdb_dir = match args.localdb.clone().or_else(|| args.dest.clone()) {
        Some(dir) => dir,
        None => return Err("must specify --localdb when uploading".into()),
    };

    // With an upload script, segments are staged in a private temporary
    // directory; otherwise they are written straight to the destination.
    let (staging_dir, staging_is_temporary) = match &args.dest {
        Some(dest) => {
            std::fs::create_dir_all(dest)?;
            (dest.clone(), false)
        }
        None => {
            let tmp = args
                .tmpdir
                .clone()
                .or_else(|| std::env::var_os("TMPDIR").map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from("/tmp"));
            let staging = tmp.join(format!("cirrus-{}", generate_segment_name()));
            std::fs::create_dir(&staging)?;
            (staging, true)
        }
    };

    let start_time = chrono::Local::now();
    let snapshot_name = start_time.format("%Y%m%dT%H%M%S").to_string();

    let remote = Arc::new(RemoteStore::new(&staging_dir)?);
    if let Some(script) = &args.upload_script {
        remote.set_script(script.clone());
    }

    std::fs::create_dir_all(&localdb_dir)?;
    let db = LocalDb::open(
        localdb_dir.join("localdb.sqlite"),
        &snapshot_name,
        args.scheme.as_deref(),
    )?;

    let mut store = SegmentStore::new(&staging_dir)
        .with_target_size(args.segment_size)
        .with_remote(Arc::clone(&remote));

    let mut dumper = Dumper::new(&db, &mut store);
    dumper.scan_tree(&args.source)?;
    let root = dumper.close()?;

    store.sync(&db)?;

    let file_prefix = match &args.scheme {
        Some(scheme) => format!("snapshot-{}-{}", scheme, snapshot_name),
        None => format!("snapshot-{}", snapshot_name),
    };

    // Checksums file: one line per segment, verifiable with sha1sum -c.
    let segments = db.used_segments()?;
    let mut checksum_file = remote.alloc_file(&format!("{}.sha1sums", file_prefix), "checksums")?;
    for segment in &segments {
        if let Some((path, checksum)) = db.get_segment_checksum(segment)? {
            writeln!(checksum_file.file(), "{} *{}", checksum, path)?;
        }
    }
    let checksums_digest = sha1_file(checksum_file.local_path())?;
    remote.enqueue(checksum_file);

    db.close();

    // Everything the descriptor mentions must be flushed to remote
    // storage before the descriptor itself is written.
    remote.sync();

    let mut descriptor = remote.alloc_file(&format!("{}.cirrus", file_prefix), "snapshots")?;
    let out = descriptor.file();
    writeln!(out, "Format: Cirrus Snapshot v0.1")?;
    writeln!(out, "Producer: cirrus {}", env!("CARGO_PKG_VERSION"))?;
    writeln!(out, "Date: {}", start_time.format("%Y-%m-%d %H:%M:%S %z"))?;
    if let Some(scheme) = &args.scheme {
        writeln!(out, "Scheme: {}", scheme)?;
    }
    writeln!(out, "Root: {}", root)?;
    writeln!(out, "Checksums: {}", checksums_digest)?;
    writeln!(out, "Segments:")?;
    for segment in &segments {
        writeln!(out, "    {}", segment)?;
    }
    remote.enqueue(descriptor);

    remote.sync();
    drop(store);
    drop(remote);

    if staging_is_temporary {
        if let Err(e) = std::fs::remove_dir(&staging_dir) {
            tracing::warn!(path = %staging_dir.display(), error = %e,
                "unable to delete staging directory");
        }
    }

    println!("snapshot {} complete, root {}", snapshot_name, root);
    Ok(())
}
