use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::config::{
    BackupConfig, ChunkingConfig, EncryptionConfig, FileSetConfig, FilterConfig, RetryConfig,
};
use crate::error::{Result, SatchelError};
use crate::storage::StorageBackend;

/// In-memory storage backend for testing. Thread-safe via Mutex.
pub struct MemoryBackend {
    data: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
        }
    }

    pub fn key_count(&self) -> usize {
        self.data.lock().unwrap().len()
    }
}

impl StorageBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let map = self.data.lock().unwrap();
        Ok(map.get(key).cloned())
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let mut map = self.data.lock().unwrap();
        map.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut map = self.data.lock().unwrap();
        map.remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let map = self.data.lock().unwrap();
        let mut keys: Vec<String> = map
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn exists(&self, key: &str) -> Result<bool> {
        let map = self.data.lock().unwrap();
        Ok(map.contains_key(key))
    }

    fn size(&self, key: &str) -> Result<Option<u64>> {
        let map = self.data.lock().unwrap();
        Ok(map.get(key).map(|v| v.len() as u64))
    }
}

/// Backend whose first `n` calls fail with a transient storage error, then
/// behaves like a plain `MemoryBackend`. Exercises the retry wrapper.
pub struct FlakyBackend {
    inner: MemoryBackend,
    remaining_failures: AtomicUsize,
}

impl FlakyBackend {
    pub fn failing_first(n: usize) -> Self {
        Self {
            inner: MemoryBackend::new(),
            remaining_failures: AtomicUsize::new(n),
        }
    }

    fn trip(&self, op: &str) -> Result<()> {
        let tripped = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .is_ok();
        if tripped {
            return Err(SatchelError::Storage {
                op: op.into(),
                message: "injected transient failure".into(),
            });
        }
        Ok(())
    }
}

impl StorageBackend for FlakyBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.trip("get")?;
        self.inner.get(key)
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        self.trip("put")?;
        self.inner.put(key, data)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.trip("delete")?;
        self.inner.delete(key)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.trip("list")?;
        self.inner.list(prefix)
    }

    fn exists(&self, key: &str) -> Result<bool> {
        self.trip("exists")?;
        self.inner.exists(key)
    }

    fn size(&self, key: &str) -> Result<Option<u64>> {
        self.trip("size")?;
        self.inner.size(key)
    }
}

/// Smallest configuration that passes validation: one file set, no
/// databases, no encryption.
pub fn minimal_config() -> BackupConfig {
    BackupConfig {
        app_name: "test-app".into(),
        environment: "test".into(),
        storage_target: "local".into(),
        databases: Vec::new(),
        files: vec![FileSetConfig {
            label: "data".into(),
            root: "/tmp/data".into(),
        }],
        filters: FilterConfig::default(),
        chunking: ChunkingConfig::default(),
        encryption: EncryptionConfig::default(),
        compression_level: 6,
        retry: RetryConfig::default(),
    }
}

/// Write a small fixed file tree under `root` and return the relative
/// paths that were created.
pub fn write_sample_tree(root: &Path) -> Vec<&'static str> {
    let files: Vec<(&str, &[u8])> = vec![
        ("notes.txt", b"some notes".as_slice()),
        ("sub/report.csv", b"a,b,c\n1,2,3\n"),
        ("sub/deeper/empty.txt", b""),
    ];
    for (rel, content) in &files {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, content).unwrap();
    }
    files.into_iter().map(|(rel, _)| rel).collect()
}
