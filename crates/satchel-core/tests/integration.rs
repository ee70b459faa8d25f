use std::path::Path;
use std::sync::Arc;

use satchel_core::archive::ArchiveReader;
use satchel_core::backup::{chunked, direct};
use satchel_core::config::{
    BackupConfig, ChunkingConfig, EncryptionConfig, FileSetConfig, FilterConfig, RetryConfig,
};
use satchel_core::crypto::EnvelopeCipher;
use satchel_core::storage::LocalBackend;
use satchel_core::verify::verify_archive;

fn write_tree(root: &Path) {
    let files: &[(&str, &[u8])] = &[
        ("app/config.json", b"{\"debug\":false}"),
        ("app/logs/today.log", b"line one\nline two\n"),
        ("media/logo.png", &[0x89, 0x50, 0x4E, 0x47, 0, 1, 2, 3]),
        ("empty.marker", b""),
    ];
    for (rel, content) in files {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
    }
}

fn config(root: &Path) -> BackupConfig {
    BackupConfig {
        app_name: "satchel-it".into(),
        environment: "integration".into(),
        storage_target: "local".into(),
        databases: Vec::new(),
        files: vec![FileSetConfig {
            label: "site".into(),
            root: root.to_string_lossy().into_owned(),
        }],
        filters: FilterConfig::default(),
        chunking: ChunkingConfig {
            chunk_size: 32, // several chunks even for this tiny tree
            ..ChunkingConfig::default()
        },
        encryption: EncryptionConfig::default(),
        compression_level: 6,
        retry: RetryConfig::default(),
    }
}

#[test]
fn direct_backup_end_to_end() {
    let tree = tempfile::tempdir().unwrap();
    write_tree(tree.path());
    let out = tempfile::tempdir().unwrap();
    let target = out.path().join("site.sbak");

    let outcome = direct::run(&config(tree.path()), &target);
    assert!(outcome.succeeded(), "{:?}", outcome.error);
    assert_eq!(outcome.manifest_entry_count, 4);
    assert_eq!(outcome.archive_path.as_deref(), Some(target.as_path()));

    let reader = ArchiveReader::open(&target, None).unwrap();
    let manifest = reader.manifest().unwrap();
    assert_eq!(manifest.app_name, "satchel-it");
    assert_eq!(
        reader.read("files/app/logs/today.log").unwrap().unwrap(),
        b"line one\nline two\n"
    );
    assert!(verify_archive(&reader).unwrap().is_ok());
}

#[test]
fn chunked_backup_end_to_end_with_local_backend_and_encryption() {
    let tree = tempfile::tempdir().unwrap();
    write_tree(tree.path());
    let store = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let target = out.path().join("site.sbak");

    let mut config = config(tree.path());
    config.encryption.enabled = true;
    config.encryption.master_key = Some("integration master key".into());

    let backend = Arc::new(LocalBackend::new(store.path()).unwrap());
    let outcome = chunked::run(&config, backend, &target);
    assert!(outcome.succeeded(), "{:?}", outcome.error);

    // Chunks were staged under the backend root and cleaned up afterwards.
    let leftover: Vec<_> = walk_files(store.path());
    assert!(leftover.is_empty(), "leftover chunks: {leftover:?}");

    let cipher = EnvelopeCipher::new("integration master key").unwrap();
    let reader = ArchiveReader::open(&target, Some(cipher)).unwrap();
    assert!(verify_archive(&reader).unwrap().is_ok());
    assert_eq!(
        reader.read("files/app/config.json").unwrap().unwrap(),
        b"{\"debug\":false}"
    );

    // Without the key the entries are visible but unreadable.
    let blind = ArchiveReader::open(&target, None).unwrap();
    assert!(blind.contains("files/app/config.json"));
    assert!(blind.read("files/app/config.json").is_err());
}

fn walk_files(root: &Path) -> Vec<std::path::PathBuf> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                stack.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files
}
