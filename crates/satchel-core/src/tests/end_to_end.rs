use std::path::Path;
use std::sync::Arc;

use crossbeam_channel::unbounded;

use crate::backup::chunked;
use crate::chunk::{ChunkSink, SourceKind};
use crate::config::BackupConfig;
use crate::error::{Result, SatchelError};
use crate::storage::StorageBackend;
use crate::testutil::{minimal_config, write_sample_tree, MemoryBackend};

const MIB: usize = 1024 * 1024;

/// Three files of 4, 6 and 1 MiB streamed at a 5 MiB chunk size produce
/// exactly two chunks: the 6 MiB record joins the first buffer (still
/// under threshold when it arrives), the 1 MiB record forces the flush.
#[test]
fn five_mib_chunk_size_yields_two_chunks() {
    let (tx, rx) = unbounded();
    let mut sink = ChunkSink::new(&tx, "files_media".into(), SourceKind::DirectoryFiles, 5 * MIB);
    sink.append_file_record("a.bin", &vec![0xAA; 4 * MIB]).unwrap();
    sink.append_file_record("b.bin", &vec![0xBB; 6 * MIB]).unwrap();
    sink.append_file_record("c.bin", &vec![0xCC; MIB]).unwrap();
    let count = sink.finish().unwrap();
    assert_eq!(count, 2);

    let chunks: Vec<_> = rx.try_iter().collect();
    assert_eq!(chunks.len(), 2);
    assert!(chunks[0].payload.len() > 10 * MIB);
    assert!(chunks[1].payload.len() > MIB);
}

/// Storage that rejects every write. Drives the whole-run failure path.
struct RefusingBackend;

impl StorageBackend for RefusingBackend {
    fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }
    fn put(&self, key: &str, _data: &[u8]) -> Result<()> {
        Err(SatchelError::Other(format!("write refused: {key}")))
    }
    fn delete(&self, _key: &str) -> Result<()> {
        Ok(())
    }
    fn list(&self, _prefix: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
    fn exists(&self, _key: &str) -> Result<bool> {
        Ok(false)
    }
    fn size(&self, _key: &str) -> Result<Option<u64>> {
        Ok(None)
    }
}

fn config_for(root: &Path) -> BackupConfig {
    let mut config = minimal_config();
    config.files[0].root = root.to_string_lossy().into_owned();
    config.chunking.chunk_size = 16;
    config
}

#[test]
fn chunked_run_fails_when_every_upload_fails() {
    let tree = tempfile::tempdir().unwrap();
    write_sample_tree(tree.path());
    let config = config_for(tree.path());

    let out = tempfile::tempdir().unwrap();
    let target = out.path().join("backup.sbak");
    let outcome = chunked::run(&config, Arc::new(RefusingBackend), &target);

    assert!(!outcome.succeeded());
    assert!(!target.exists());
    let error = outcome.error.unwrap();
    assert!(error.contains("chunk upload batch failed"), "{error}");
}

#[test]
fn partial_chunk_loss_fails_collation_not_verification() {
    // Delete one mid-group chunk between upload and collation: the
    // collator must reject the gap instead of producing a short archive.
    let tree = tempfile::tempdir().unwrap();
    write_sample_tree(tree.path());
    let config = config_for(tree.path());

    let backend = MemoryBackend::new();
    let (tx, rx) = unbounded();
    let mut sink = ChunkSink::new(&tx, "files_data".into(), SourceKind::DirectoryFiles, 16);
    for (relative, content) in [("one.txt", "first file"), ("two.txt", "second file")] {
        sink.append_file_record(relative, content.as_bytes()).unwrap();
    }
    let count = sink.finish().unwrap();
    assert_eq!(count, 2);
    let mut names = Vec::new();
    for chunk in rx.try_iter() {
        backend.put(&chunk.storage_key(), &chunk.payload).unwrap();
        names.push(chunk.name);
    }
    backend.delete("chunks/files_data.00000").unwrap();

    let out = tempfile::tempdir().unwrap();
    let target = out.path().join("backup.sbak");
    let err = crate::chunk::Collator::new(&backend)
        .collate(&names, &target, 6, None)
        .unwrap_err();
    assert!(err.to_string().contains("missing from storage"), "{err}");
    assert!(!target.exists());
}
