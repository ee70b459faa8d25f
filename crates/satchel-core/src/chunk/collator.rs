use std::collections::BTreeMap;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::archive::ArchiveWriter;
use crate::chunk::producer::decode_file_records;
use crate::chunk::{parse_chunk_name, CHUNK_KEY_PREFIX, MANIFEST_BASE_NAME};
use crate::crypto::EnvelopeCipher;
use crate::error::{Result, SatchelError};
use crate::manifest::MANIFEST_NAME;
use crate::storage::StorageBackend;

/// How the reverse framing scan treats a malformed or truncated trailing
/// record: stop silently, or fail the collation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FramingMode {
    Strict,
    #[default]
    Lenient,
}

#[derive(Debug)]
pub struct CollationSummary {
    pub archive_size: u64,
    pub entry_count: usize,
}

/// Reassembles uploaded chunks into one final archive.
///
/// The result is logically identical to what the direct writer produces
/// for the same sources: same entry names, same per-entry compression and
/// encryption treatment.
pub struct Collator<'a> {
    backend: &'a dyn StorageBackend,
    mode: FramingMode,
}

impl<'a> Collator<'a> {
    pub fn new(backend: &'a dyn StorageBackend) -> Self {
        Self {
            backend,
            mode: FramingMode::default(),
        }
    }

    pub fn with_mode(mut self, mode: FramingMode) -> Self {
        self.mode = mode;
        self
    }

    /// Rebuild the archive at `target` from the named chunks, then delete
    /// the chunks from storage (best effort).
    pub fn collate(
        &self,
        chunk_names: &[String],
        target: &Path,
        compression_level: u32,
        cipher: Option<EnvelopeCipher>,
    ) -> Result<CollationSummary> {
        let groups = group_and_order(chunk_names)?;
        let mut writer = ArchiveWriter::create(target, compression_level, cipher)?;

        // BTreeMap ordering puts db_* first, then file_*/files_*, and the
        // manifest group last, matching the direct writer's entry order.
        for (base_name, names) in &groups {
            let payload = self.fetch_group(names)?;
            debug!(group = %base_name, chunks = names.len(), bytes = payload.len(), "collating group");

            if let Some(connection) = base_name.strip_prefix("db_") {
                writer.add_entry(&format!("database/{connection}.sql"), &payload)?;
            } else if base_name.starts_with("files_") || base_name.starts_with("file_") {
                for (path, content) in decode_file_records(&payload, self.mode)? {
                    writer.add_entry(&format!("files/{path}"), &content)?;
                }
            } else if base_name == MANIFEST_BASE_NAME {
                writer.add_entry(MANIFEST_NAME, &payload)?;
            } else {
                return Err(SatchelError::InvalidFormat(format!(
                    "unrecognized chunk group: '{base_name}'"
                )));
            }
        }

        let entry_count = writer.entry_count();
        let archive_size = writer.finalize()?;
        info!(
            target = %target.display(),
            entries = entry_count,
            bytes = archive_size,
            "archive collated"
        );

        delete_chunks(self.backend, chunk_names);
        Ok(CollationSummary {
            archive_size,
            entry_count,
        })
    }

    /// Download one group's payloads and concatenate them in index order.
    fn fetch_group(&self, names: &[String]) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        for name in names {
            let key = format!("{CHUNK_KEY_PREFIX}{name}");
            let bytes = self.backend.get(&key)?.ok_or_else(|| {
                SatchelError::Other(format!("chunk '{name}' missing from storage"))
            })?;
            payload.extend_from_slice(&bytes);
        }
        Ok(payload)
    }
}

/// Group chunk names by base name, sort by index, and reject gaps and
/// duplicates: each group's indices must be exactly `0..n`.
fn group_and_order(chunk_names: &[String]) -> Result<BTreeMap<String, Vec<String>>> {
    let mut groups: BTreeMap<String, Vec<(u32, String)>> = BTreeMap::new();
    for name in chunk_names {
        let (base, index) = parse_chunk_name(name)?;
        groups
            .entry(base.to_string())
            .or_default()
            .push((index, name.clone()));
    }

    let mut ordered = BTreeMap::new();
    for (base, mut members) in groups {
        members.sort_by_key(|(index, _)| *index);
        for (position, (index, _)) in members.iter().enumerate() {
            let expected = position as u32;
            if *index != expected {
                return Err(SatchelError::ChunkGap {
                    base_name: base,
                    expected,
                    found: *index,
                });
            }
        }
        ordered.insert(base, members.into_iter().map(|(_, name)| name).collect());
    }
    Ok(ordered)
}

/// Best-effort chunk deletion; failures are logged, never raised. Also
/// called by the orchestrator when a run fails after uploads started.
pub fn delete_chunks(backend: &dyn StorageBackend, chunk_names: &[String]) {
    for name in chunk_names {
        let key = format!("{CHUNK_KEY_PREFIX}{name}");
        if let Err(e) = backend.delete(&key) {
            warn!(chunk = %name, error = %e, "failed to delete chunk");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveReader;
    use crate::chunk::chunk_name;
    use crate::chunk::producer::encode_file_record;
    use crate::testutil::MemoryBackend;

    fn put_chunk(backend: &MemoryBackend, base: &str, index: u32, payload: &[u8]) -> String {
        let name = chunk_name(base, index);
        backend
            .put(&format!("{CHUNK_KEY_PREFIX}{name}"), payload)
            .unwrap();
        name
    }

    fn collate_to_bytes(
        backend: &MemoryBackend,
        names: &[String],
        mode: FramingMode,
    ) -> Result<(Vec<u8>, CollationSummary)> {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.sbak");
        let summary = Collator::new(backend)
            .with_mode(mode)
            .collate(names, &target, 6, None)?;
        Ok((std::fs::read(&target).unwrap(), summary))
    }

    #[test]
    fn reassembles_database_files_and_manifest() {
        let backend = MemoryBackend::new();
        let mut names = Vec::new();

        // Database split mid-stream across two chunks.
        names.push(put_chunk(&backend, "db_app", 0, b"-- dump part one\n"));
        names.push(put_chunk(&backend, "db_app", 1, b"-- dump part two\n"));

        let mut framed = encode_file_record("a.txt", b"alpha").unwrap();
        framed.extend(encode_file_record("sub/b.txt", b"beta").unwrap());
        names.push(put_chunk(&backend, "files_data", 0, &framed));

        names.push(put_chunk(&backend, MANIFEST_BASE_NAME, 0, b"{\"schema_version\":1}"));

        let (bytes, summary) =
            collate_to_bytes(&backend, &names, FramingMode::Strict).unwrap();
        assert_eq!(summary.entry_count, 4);

        let reader = ArchiveReader::from_bytes(bytes, None).unwrap();
        assert_eq!(
            reader.read("database/app.sql").unwrap().unwrap(),
            b"-- dump part one\n-- dump part two\n"
        );
        assert_eq!(reader.read("files/a.txt").unwrap().unwrap(), b"alpha");
        assert_eq!(reader.read("files/sub/b.txt").unwrap().unwrap(), b"beta");
        assert_eq!(
            reader.read(MANIFEST_NAME).unwrap().unwrap(),
            b"{\"schema_version\":1}"
        );
    }

    #[test]
    fn index_gap_is_fatal() {
        let backend = MemoryBackend::new();
        let names = vec![
            put_chunk(&backend, "db_app", 0, b"a"),
            put_chunk(&backend, "db_app", 2, b"c"),
        ];
        let err = collate_to_bytes(&backend, &names, FramingMode::Lenient).unwrap_err();
        assert!(matches!(
            err,
            SatchelError::ChunkGap {
                expected: 1,
                found: 2,
                ..
            }
        ));
    }

    #[test]
    fn duplicate_index_is_fatal() {
        let backend = MemoryBackend::new();
        put_chunk(&backend, "db_app", 0, b"a");
        let names = vec!["db_app.00000".to_string(), "db_app.00000".to_string()];
        assert!(matches!(
            collate_to_bytes(&backend, &names, FramingMode::Lenient).unwrap_err(),
            SatchelError::ChunkGap { .. }
        ));
    }

    #[test]
    fn unknown_group_prefix_is_rejected() {
        let backend = MemoryBackend::new();
        let names = vec![put_chunk(&backend, "mystery", 0, b"?")];
        assert!(collate_to_bytes(&backend, &names, FramingMode::Lenient).is_err());
    }

    #[test]
    fn missing_chunk_object_is_fatal() {
        let backend = MemoryBackend::new();
        let names = vec!["db_app.00000".to_string()];
        assert!(collate_to_bytes(&backend, &names, FramingMode::Lenient).is_err());
    }

    #[test]
    fn truncated_trailing_record_modes() {
        let backend = MemoryBackend::new();
        let mut framed = encode_file_record("kept.txt", b"kept").unwrap();
        let second = encode_file_record("lost.txt", b"lost").unwrap();
        framed.extend_from_slice(&second[..second.len() - 2]);
        let names = vec![put_chunk(&backend, "files_data", 0, &framed)];

        assert!(collate_to_bytes(&backend, &names, FramingMode::Strict).is_err());

        let backend = MemoryBackend::new();
        let names = vec![put_chunk(&backend, "files_data", 0, &framed)];
        let (bytes, summary) =
            collate_to_bytes(&backend, &names, FramingMode::Lenient).unwrap();
        assert_eq!(summary.entry_count, 1);
        let reader = ArchiveReader::from_bytes(bytes, None).unwrap();
        assert!(reader.contains("files/kept.txt"));
        assert!(!reader.contains("files/lost.txt"));
    }

    #[test]
    fn chunks_are_deleted_after_successful_collation() {
        let backend = MemoryBackend::new();
        let names = vec![
            put_chunk(&backend, "db_app", 0, b"dump"),
            put_chunk(&backend, MANIFEST_BASE_NAME, 0, b"{}"),
        ];
        collate_to_bytes(&backend, &names, FramingMode::Lenient).unwrap();
        for name in &names {
            assert!(!backend.exists(&format!("{CHUNK_KEY_PREFIX}{name}")).unwrap());
        }
    }
}
