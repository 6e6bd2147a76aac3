// Integration tests for the asynchronous upload pipeline: bounded-queue
// backpressure, sync semantics, and the upload script contract.

use cirrus_store::RemoteStore;
use std::io::Write;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Write a transport script that sleeps `delay` then copies
/// `<local>` to `<dest>/<remote>`.
fn slow_transport(dest: &std::path::Path, delay: &str) -> String {
    let script = dest.join("transport.sh");
    std::fs::write(
        &script,
        format!(
            "#!/bin/sh\nsleep {}\ncp \"$1\" \"{}/$3\"\n",
            delay,
            dest.display()
        ),
    )
    .unwrap();
    format!("sh {}", script.display())
}

#[test]
fn test_backpressure_bounds_the_queue() {
    let staging = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();

    // Queue limit 2, 100 ms per upload: the producer cannot finish
    // enqueuing 10 files until at least 8 transfers have completed.
    let store = RemoteStore::with_queue_limit(staging.path(), 2).unwrap();
    store.set_script(slow_transport(dest.path(), "0.1"));

    let start = Instant::now();
    for i in 0..10 {
        let name = format!("seg-{:02}.tar", i);
        let mut file = store.alloc_file(&name, "segments").unwrap();
        file.file().write_all(format!("payload {}", i).as_bytes()).unwrap();
        store.enqueue(file);
    }
    let enqueue_elapsed = start.elapsed();
    store.sync();
    let total_elapsed = start.elapsed();

    assert!(
        enqueue_elapsed >= Duration::from_millis(700),
        "producer was not throttled: {:?}",
        enqueue_elapsed
    );
    assert!(
        total_elapsed >= Duration::from_millis(900),
        "sync returned before uploads finished: {:?}",
        total_elapsed
    );

    // Items delivered equals items enqueued, and the staging copies are
    // gone.
    for i in 0..10 {
        let name = format!("seg-{:02}.tar", i);
        assert_eq!(
            std::fs::read(dest.path().join(&name)).unwrap(),
            format!("payload {}", i).as_bytes()
        );
        assert!(!staging.path().join(&name).exists());
    }
}

#[test]
fn test_sync_waits_for_in_flight_transfer() {
    let staging = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();

    let store = RemoteStore::new(staging.path()).unwrap();
    store.set_script(slow_transport(dest.path(), "0.2"));

    let mut file = store.alloc_file("one.tar", "segments").unwrap();
    file.file().write_all(b"bytes").unwrap();
    store.enqueue(file);

    store.sync();
    // After sync the transfer is complete, not merely dequeued.
    assert!(dest.path().join("one.tar").exists());
    assert!(!staging.path().join("one.tar").exists());
}

#[test]
fn test_uploads_preserve_enqueue_order() {
    let staging = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();

    // Transport appends each remote name to a log.
    let script = dest.path().join("transport.sh");
    let log = dest.path().join("order.log");
    std::fs::write(
        &script,
        format!("#!/bin/sh\necho \"$3\" >> \"{}\"\n", log.display()),
    )
    .unwrap();

    let store = RemoteStore::new(staging.path()).unwrap();
    store.set_script(format!("sh {}", script.display()));

    for name in ["a.tar", "b.tar", "c.tar", "d.tar"] {
        let file = store.alloc_file(name, "segments").unwrap();
        store.enqueue(file);
    }
    store.sync();

    let logged = std::fs::read_to_string(&log).unwrap();
    assert_eq!(logged, "a.tar\nb.tar\nc.tar\nd.tar\n");
}

#[test]
fn test_drop_waits_for_queued_work() {
    let staging = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();

    {
        let store = RemoteStore::new(staging.path()).unwrap();
        store.set_script(slow_transport(dest.path(), "0.1"));
        let file = store.alloc_file("tail.tar", "segments").unwrap();
        store.enqueue(file);
        // Dropped without sync: destruction drains outstanding work.
    }

    assert!(dest.path().join("tail.tar").exists());
}
