use std::path::Path;
use std::sync::Arc;

use crossbeam_channel::{bounded, Sender};
use tracing::{debug, error, info};

use crate::archive::ArchiveReader;
use crate::backup::{cipher_for, walk_file_set, RunOutcome};
use crate::checkpoint::MemoryCheckpoints;
use crate::chunk::collator::{delete_chunks, Collator, FramingMode};
use crate::chunk::scheduler::{check_batch, UploadScheduler};
use crate::chunk::{
    chunk_name, database_base_name, directory_base_name, Chunk, ChunkSink, SourceKind,
    MANIFEST_BASE_NAME,
};
use crate::config::BackupConfig;
use crate::dump::spawn_dump;
use crate::error::{Result, SatchelError};
use crate::filter::FilterChain;
use crate::manifest::ManifestBuilder;
use crate::storage::{RetryPolicy, RetryingBackend, StorageBackend};
use crate::verify::verify_archive;

/// Chunked streaming path for hosts with no usable local disk for
/// intermediate artifacts: sources are framed into bounded chunks,
/// uploaded with bounded concurrency, then collated back into one archive
/// at `target`.
///
/// The producer and the upload scheduler run concurrently, coupled by a
/// bounded channel of capacity `max_concurrent`; a full channel blocks the
/// producer, keeping peak memory near `max_concurrent * chunk_size`.
/// Unlike the direct path, a failed dump is fatal to the whole run here.
pub fn run(config: &BackupConfig, backend: Arc<dyn StorageBackend>, target: &Path) -> RunOutcome {
    run_with_mode(config, backend, target, FramingMode::default())
}

pub fn run_with_mode(
    config: &BackupConfig,
    backend: Arc<dyn StorageBackend>,
    target: &Path,
    mode: FramingMode,
) -> RunOutcome {
    let mut checkpoints = MemoryCheckpoints::new();
    match try_run(config, backend, target, mode, &mut checkpoints) {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(error = %e, "chunked backup run failed");
            RunOutcome::failure(None, e.to_string())
        }
    }
}

fn try_run(
    config: &BackupConfig,
    backend: Arc<dyn StorageBackend>,
    target: &Path,
    mode: FramingMode,
    checkpoints: &mut MemoryCheckpoints,
) -> Result<RunOutcome> {
    config.validate()?;
    // Fail on a missing master key before any chunk is produced.
    cipher_for(config)?;

    let policy = RetryPolicy::from(&config.retry);
    let scheduler = UploadScheduler::new(Arc::clone(&backend), policy, &config.chunking);
    let (tx, rx) = bounded::<Chunk>(config.chunking.max_concurrent);

    let (results, produced) = std::thread::scope(|scope| {
        let producer = scope.spawn({
            let checkpoints = &mut *checkpoints;
            move || produce_chunks(config, tx, checkpoints)
        });
        let results = scheduler.run(rx);
        let produced = producer
            .join()
            .map_err(|_| SatchelError::Other("chunk producer thread panicked".into()))
            .and_then(|r| r);
        (results, produced)
    });

    let uploaded: Vec<String> = results
        .iter()
        .filter(|r| r.succeeded())
        .map(|r| r.name.clone())
        .collect();

    let (chunk_names, entry_count) = match produced {
        Ok(v) => v,
        Err(e) => {
            delete_chunks(backend.as_ref(), &uploaded);
            return Err(e);
        }
    };
    if let Err(e) = check_batch(&results) {
        delete_chunks(backend.as_ref(), &uploaded);
        return Err(e);
    }
    checkpoints.record("chunks.total", chunk_names.len() as u64);

    let retrying = RetryingBackend::new(Arc::clone(&backend), policy);
    let collation = Collator::new(&retrying).with_mode(mode).collate(
        &chunk_names,
        target,
        config.compression_level,
        cipher_for(config)?,
    );
    let summary = match collation {
        Ok(summary) => summary,
        Err(e) => {
            delete_chunks(backend.as_ref(), &uploaded);
            return Err(e);
        }
    };

    let reader = ArchiveReader::open(target, cipher_for(config)?)?;
    let verification = verify_archive(&reader)?;
    if !verification.is_ok() {
        return Ok(RunOutcome::failure(
            Some(target.to_path_buf()),
            verification.summary(),
        ));
    }

    for (name, bytes) in checkpoints.iter() {
        debug!(checkpoint = name, bytes, "run checkpoint");
    }
    info!(
        target = %target.display(),
        chunks = chunk_names.len(),
        entries = entry_count,
        bytes = summary.archive_size,
        "chunked backup complete"
    );
    Ok(RunOutcome::success(
        target.to_path_buf(),
        summary.archive_size,
        entry_count,
    ))
}

/// Stream every configured source into framed chunks, pushing each
/// completed chunk into the bounded channel. Returns the full chunk name
/// list (the collator's input) and the manifest entry count.
fn produce_chunks(
    config: &BackupConfig,
    tx: Sender<Chunk>,
    checkpoints: &mut MemoryCheckpoints,
) -> Result<(Vec<String>, usize)> {
    let chunk_size = config.chunking.chunk_size;
    let mut builder = ManifestBuilder::new(config);
    let mut names = Vec::new();

    for conn in config.databases.iter().filter(|d| d.enabled) {
        let base = database_base_name(&conn.name);
        let mut stream = spawn_dump(conn)?;
        let mut sink = ChunkSink::new(&tx, base.clone(), SourceKind::Database, chunk_size);
        let (total, digest) = sink.stream_database(&mut stream)?;
        stream.finish()?;
        let count = sink.finish()?;
        checkpoints.record_peak("dump.stream_bytes", total);
        names.extend((0..count).map(|i| chunk_name(&base, i)));
        builder.add_hashed_entry(format!("database/{}.sql", conn.name), total, digest);
    }

    let chain = FilterChain::from_config(&config.filters);
    for set in &config.files {
        let base = directory_base_name(&set.label);
        let mut sink = ChunkSink::new(&tx, base.clone(), SourceKind::DirectoryFiles, chunk_size);
        for (relative, absolute) in walk_file_set(Path::new(&set.root), &chain)? {
            let content = std::fs::read(&absolute)?;
            checkpoints.record_peak("producer.file_bytes", content.len() as u64);
            sink.append_file_record(&relative, &content)?;
            builder.add_entry(format!("files/{relative}"), &content);
        }
        let count = sink.finish()?;
        names.extend((0..count).map(|i| chunk_name(&base, i)));
    }

    let manifest = builder.build(true)?;
    let entry_count = manifest.entries.len();
    let json = manifest.to_json()?;
    checkpoints.record("manifest.bytes", json.len() as u64);
    let mut sink = ChunkSink::new(
        &tx,
        MANIFEST_BASE_NAME.to_string(),
        SourceKind::Manifest,
        chunk_size,
    );
    sink.push_blob(json)?;
    let count = sink.finish()?;
    names.extend((0..count).map(|i| chunk_name(MANIFEST_BASE_NAME, i)));

    info!(chunks = names.len(), entries = entry_count, "chunk producer finished");
    Ok((names, entry_count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{write_sample_tree, MemoryBackend};

    fn config_for(root: &Path) -> BackupConfig {
        let mut config = crate::testutil::minimal_config();
        config.files[0].root = root.to_string_lossy().into_owned();
        config.chunking.chunk_size = 16; // force several chunks from tiny files
        config
    }

    fn sample_run(config: &BackupConfig) -> (Arc<MemoryBackend>, RunOutcome, std::path::PathBuf, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("backup.sbak");
        let backend = Arc::new(MemoryBackend::new());
        let outcome = run(config, backend.clone(), &target);
        (backend, outcome, target, dir)
    }

    #[test]
    fn chunked_run_produces_verified_archive() {
        let tree = tempfile::tempdir().unwrap();
        write_sample_tree(tree.path());
        let config = config_for(tree.path());
        let (backend, outcome, target, _dir) = sample_run(&config);

        assert!(outcome.succeeded(), "{:?}", outcome.error);
        assert_eq!(outcome.manifest_entry_count, 3);

        let reader = ArchiveReader::open(&target, None).unwrap();
        assert_eq!(
            reader.read("files/notes.txt").unwrap().unwrap(),
            b"some notes"
        );
        assert_eq!(
            reader.read("files/sub/deeper/empty.txt").unwrap().unwrap(),
            b""
        );
        let manifest = reader.manifest().unwrap();
        assert!(manifest.chunked);

        // All chunks removed after successful collation.
        assert!(backend.list("chunks/").unwrap().is_empty());
    }

    #[test]
    fn encrypted_chunked_run_round_trips() {
        let tree = tempfile::tempdir().unwrap();
        write_sample_tree(tree.path());
        let mut config = config_for(tree.path());
        config.encryption.enabled = true;
        config.encryption.master_key = Some("master".into());
        let (_backend, outcome, target, _dir) = sample_run(&config);
        assert!(outcome.succeeded(), "{:?}", outcome.error);

        let cipher = crate::crypto::EnvelopeCipher::new("master").unwrap();
        let reader = ArchiveReader::open(&target, Some(cipher)).unwrap();
        assert_eq!(
            reader.read("files/sub/report.csv").unwrap().unwrap(),
            b"a,b,c\n1,2,3\n"
        );
    }

    #[test]
    fn missing_master_key_fails_before_uploading() {
        let tree = tempfile::tempdir().unwrap();
        write_sample_tree(tree.path());
        let mut config = config_for(tree.path());
        config.encryption.enabled = true;
        let (backend, outcome, target, _dir) = sample_run(&config);

        assert!(!outcome.succeeded());
        assert!(!target.exists());
        assert_eq!(backend.key_count(), 0);
    }
}
