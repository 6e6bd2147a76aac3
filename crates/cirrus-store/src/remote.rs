//! Asynchronous upload pipeline
//!
//! Completed staging files (segments, checksums, descriptors) may be
//! shipped to a remote fileserver. Transfers run on a single background
//! worker owned by the `RemoteStore`; the driver thread enqueues files and
//! the queue bound provides backpressure when uploads fall behind.
//!
//! Like encryption, transport is delegated to an external script, invoked
//! as `/bin/sh -c "<script> <local> <type> <remote>"`. Exit 0 is success;
//! any other exit is a warning - the snapshot is still locally complete.

use cirrus_core::error::{io_error, Result};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

/// Default bound on queued-but-not-yet-transferred files.
pub const MAX_QUEUE_SIZE: usize = 4;

/// A staging file destined for remote storage. Exists from allocation
/// until the upload worker finishes with it; on success the local copy is
/// unlinked.
pub struct RemoteFile {
    remote_path: String,
    kind: String,
    local_path: PathBuf,
    file: File,
}

impl RemoteFile {
    /// Path of the staging copy.
    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    /// Writable handle on the staging copy. The caller finishes all
    /// writes before the file is enqueued.
    pub fn file(&mut self) -> &mut File {
        &mut self.file
    }
}

struct State {
    transfer_queue: VecDeque<RemoteFile>,
    busy: bool,
    terminate: bool,
    /// Files allocated but not yet enqueued. Must be zero when the store
    /// is dropped: every allocated file has to be handed over.
    files_outstanding: usize,
    script: Option<String>,
}

struct Shared {
    state: Mutex<State>,
    cond: Condvar,
    queue_limit: usize,
}

/// Staging directory plus one background upload worker.
pub struct RemoteStore {
    shared: Arc<Shared>,
    staging_dir: PathBuf,
    worker: Option<JoinHandle<()>>,
}

impl RemoteStore {
    /// Create a store over `staging_dir` with the default queue bound and
    /// spawn the transfer worker.
    pub fn new(staging_dir: impl Into<PathBuf>) -> Result<Self> {
        Self::with_queue_limit(staging_dir, MAX_QUEUE_SIZE)
    }

    /// Create a store with an explicit queue bound.
    pub fn with_queue_limit(staging_dir: impl Into<PathBuf>, queue_limit: usize) -> Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                transfer_queue: VecDeque::new(),
                busy: true,
                terminate: false,
                files_outstanding: 0,
                script: None,
            }),
            cond: Condvar::new(),
            queue_limit,
        });

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("remote-transfer".to_string())
            .spawn(move || transfer_worker(worker_shared))
            .map_err(|e| io_error("spawn_transfer_worker", e))?;

        Ok(RemoteStore {
            shared,
            staging_dir: staging_dir.into(),
            worker: Some(worker),
        })
    }

    /// Configure the upload script. With no script set, finished files
    /// stay in the staging directory.
    pub fn set_script(&self, script: impl Into<String>) {
        let mut state = self.shared.state.lock().unwrap();
        state.script = Some(script.into());
    }

    /// Prepare to write out a new file in the staging directory. The
    /// returned handle must eventually be passed to [`enqueue`].
    ///
    /// [`enqueue`]: RemoteStore::enqueue
    pub fn alloc_file(&self, name: &str, kind: &str) -> Result<RemoteFile> {
        let local_path = self.staging_dir.join(name);
        // No truncation: a sealed segment already at this path keeps its
        // contents.
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(&local_path)
            .map_err(|e| io_error("alloc_remote_file", e))?;

        let mut state = self.shared.state.lock().unwrap();
        state.files_outstanding += 1;

        Ok(RemoteFile {
            remote_path: name.to_string(),
            kind: kind.to_string(),
            local_path,
            file,
        })
    }

    /// Hand a finished file to the upload worker. Blocks while the queue
    /// is at capacity; transfers happen asynchronously in FIFO order.
    pub fn enqueue(&self, file: RemoteFile) {
        let mut state = self.shared.state.lock().unwrap();

        while state.transfer_queue.len() >= self.shared.queue_limit {
            state = self.shared.cond.wait(state).unwrap();
        }

        state.transfer_queue.push_back(file);
        state.files_outstanding -= 1;
        state.busy = true;

        self.shared.cond.notify_all();
    }

    /// Wait for all queued and in-flight transfers to finish.
    pub fn sync(&self) {
        let mut state = self.shared.state.lock().unwrap();
        while state.busy {
            state = self.shared.cond.wait(state).unwrap();
        }
    }
}

impl Drop for RemoteStore {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.terminate = true;
            self.shared.cond.notify_all();
        }

        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!("unable to join transfer worker");
            }
        }

        let outstanding = self.shared.state.lock().unwrap().files_outstanding;
        assert_eq!(
            outstanding, 0,
            "RemoteFile allocated but never enqueued"
        );
    }
}

/// Background worker: pop files in FIFO order and run the upload script
/// for each. `busy` goes false only while the queue is empty and nothing
/// is in flight, which is exactly the state `sync` waits for.
fn transfer_worker(shared: Arc<Shared>) {
    loop {
        let (file, script) = {
            let mut state = shared.state.lock().unwrap();

            while state.transfer_queue.is_empty() && !state.terminate {
                state.busy = false;
                shared.cond.notify_all();
                state = shared.cond.wait(state).unwrap();
            }

            if state.terminate && state.transfer_queue.is_empty() {
                state.busy = false;
                shared.cond.notify_all();
                break;
            }

            state.busy = true;
            let file = state.transfer_queue.pop_front().unwrap();
            // Wake an enqueue blocked on a full queue.
            shared.cond.notify_all();
            (file, state.script.clone())
        };

        if let Some(script) = script {
            transfer_file(&script, &file);

            if let Err(e) = std::fs::remove_file(&file.local_path) {
                tracing::warn!(
                    path = %file.local_path.display(),
                    error = %e,
                    "unable to delete staging file"
                );
            }
        }

        drop(file);
    }
}

fn transfer_file(script: &str, file: &RemoteFile) {
    let command = format!(
        "{} {} {} {}",
        script,
        file.local_path.display(),
        file.kind,
        file.remote_path
    );

    match Command::new("/bin/sh").arg("-c").arg(&command).status() {
        Ok(status) if status.success() => {
            tracing::debug!(path = %file.remote_path, "uploaded");
        }
        Ok(status) => {
            tracing::warn!(
                path = %file.remote_path,
                %status,
                "upload script reported an error"
            );
        }
        Err(e) => {
            tracing::warn!(
                path = %file.remote_path,
                error = %e,
                "unable to run upload script"
            );
        }
    }
}
