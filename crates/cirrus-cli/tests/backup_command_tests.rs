// Integration tests driving the built binary end to end.

use std::path::Path;
use std::process::Command;
use tempfile::TempDir;

fn cirrus() -> Command {
    Command::new(env!("CARGO_BIN_EXE_cirrus"))
}

fn list_with_extension(dir: &Path, extension: &str) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|entry| {
            let name = entry.unwrap().file_name().to_string_lossy().into_owned();
            name.ends_with(extension).then_some(name)
        })
        .collect();
    names.sort();
    names
}

#[test]
fn test_backup_to_destination_directory() {
    let tree = TempDir::new().unwrap();
    std::fs::write(tree.path().join("hello.txt"), b"hello cirrus").unwrap();
    std::fs::create_dir(tree.path().join("sub")).unwrap();
    std::fs::write(tree.path().join("sub/nested"), vec![7u8; 2048]).unwrap();

    let dest = TempDir::new().unwrap();
    let status = cirrus()
        .arg("backup")
        .arg("--dest")
        .arg(dest.path())
        .arg(tree.path())
        .status()
        .unwrap();
    assert!(status.success());

    // The destination holds the catalog, sealed segments, a checksums
    // file, and the backup descriptor.
    assert!(dest.path().join("localdb.sqlite").exists());
    assert!(!list_with_extension(dest.path(), ".tar").is_empty());
    assert_eq!(list_with_extension(dest.path(), ".sha1sums").len(), 1);

    let descriptors = list_with_extension(dest.path(), ".cirrus");
    assert_eq!(descriptors.len(), 1);
    let descriptor = std::fs::read_to_string(dest.path().join(&descriptors[0])).unwrap();
    assert!(descriptor.starts_with("Format: Cirrus Snapshot v0.1\n"));
    assert!(descriptor.contains("\nRoot: "));
    assert!(descriptor.contains("\nSegments:\n"));
}

#[test]
fn test_backup_with_upload_script() {
    let tree = TempDir::new().unwrap();
    std::fs::write(tree.path().join("file"), b"uploaded bytes").unwrap();

    let state = TempDir::new().unwrap();
    let uploads = state.path().join("uploads");
    std::fs::create_dir(&uploads).unwrap();

    let script = state.path().join("transport.sh");
    std::fs::write(
        &script,
        format!("#!/bin/sh\ncp \"$1\" \"{}/$3\"\n", uploads.display()),
    )
    .unwrap();

    let status = cirrus()
        .arg("backup")
        .arg("--upload-script")
        .arg(format!("sh {}", script.display()))
        .arg("--localdb")
        .arg(state.path())
        .arg("--tmpdir")
        .arg(state.path())
        .arg("--scheme")
        .arg("nightly")
        .arg(tree.path())
        .status()
        .unwrap();
    assert!(status.success());

    // Everything was shipped through the script: segments, the checksums
    // file, and the descriptor, with the scheme in the snapshot names.
    assert!(!list_with_extension(&uploads, ".tar").is_empty());
    let sums = list_with_extension(&uploads, ".sha1sums");
    assert_eq!(sums.len(), 1);
    assert!(sums[0].starts_with("snapshot-nightly-"));
    assert_eq!(list_with_extension(&uploads, ".cirrus").len(), 1);

    // The catalog stays local.
    assert!(state.path().join("localdb.sqlite").exists());
}

#[test]
fn test_backup_requires_destination() {
    let tree = TempDir::new().unwrap();
    let output = cirrus().arg("backup").arg(tree.path()).output().unwrap();
    assert!(!output.status.success());
}
