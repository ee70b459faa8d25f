use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::BackupConfig;
use crate::error::{Result, SatchelError};

/// Current manifest schema version. Consumers must check this before
/// trusting the document structure.
pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

/// Archive-relative name under which the manifest is stored.
pub const MANIFEST_NAME: &str = "manifest.json";

/// One logical entry of the archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: String,
    pub size: u64,
    /// SHA-256 hex digest of the entry content; empty string means
    /// "unchecked".
    #[serde(default)]
    pub sha256: String,
}

/// The manifest document embedded in every archive as `manifest.json`.
/// Built once per backup run; never mutated after serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub schema_version: u32,
    pub generated_at: DateTime<Utc>,
    pub app_name: String,
    pub environment: String,
    pub chunked: bool,
    pub compression_level: u32,
    pub encrypted: bool,
    pub storage_target: String,
    pub databases: Vec<String>,
    pub file_roots: Vec<String>,
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let manifest: Manifest = serde_json::from_slice(bytes)?;
        if manifest.schema_version != MANIFEST_SCHEMA_VERSION {
            return Err(SatchelError::InvalidFormat(format!(
                "unsupported manifest schema version: {}",
                manifest.schema_version
            )));
        }
        Ok(manifest)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn find_entry(&self, path: &str) -> Option<&ManifestEntry> {
        self.entries.iter().find(|e| e.path == path)
    }
}

/// Accumulates `(path, size, hash)` triples while an archive is being built.
///
/// Path uniqueness per run is caller discipline: each writer adds a given
/// path at most once, the builder does not enforce it.
pub struct ManifestBuilder<'a> {
    config: &'a BackupConfig,
    entries: Vec<ManifestEntry>,
    deferred: Vec<(String, PathBuf)>,
}

impl<'a> ManifestBuilder<'a> {
    pub fn new(config: &'a BackupConfig) -> Self {
        Self {
            config,
            entries: Vec::new(),
            deferred: Vec::new(),
        }
    }

    /// Hash and record an entry from in-memory content.
    pub fn add_entry(&mut self, path: impl Into<String>, content: &[u8]) {
        self.entries.push(ManifestEntry {
            path: path.into(),
            size: content.len() as u64,
            sha256: sha256_hex(content),
        });
    }

    /// Record an entry whose source may still be written to; size and hash
    /// are computed from the file at `build` time.
    pub fn add_deferred_entry(&mut self, path: impl Into<String>, source: impl Into<PathBuf>) {
        self.deferred.push((path.into(), source.into()));
    }

    /// Record an entry with a precomputed size and hash (used by the chunked
    /// producer, which hashes incrementally as it streams).
    pub fn add_hashed_entry(&mut self, path: impl Into<String>, size: u64, sha256: String) {
        self.entries.push(ManifestEntry {
            path: path.into(),
            size,
            sha256,
        });
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len() + self.deferred.len()
    }

    /// Resolve deferred entries and produce the full manifest document.
    pub fn build(&mut self, chunked: bool) -> Result<Manifest> {
        for (path, source) in self.deferred.drain(..) {
            let content = std::fs::read(&source)?;
            self.entries.push(ManifestEntry {
                path,
                size: content.len() as u64,
                sha256: sha256_hex(&content),
            });
        }
        Ok(Manifest {
            schema_version: MANIFEST_SCHEMA_VERSION,
            generated_at: Utc::now(),
            app_name: self.config.app_name.clone(),
            environment: self.config.environment.clone(),
            chunked,
            compression_level: self.config.compression_level,
            encrypted: self.config.encryption.enabled,
            storage_target: self.config.storage_target.clone(),
            databases: self
                .config
                .databases
                .iter()
                .filter(|d| d.enabled)
                .map(|d| d.name.clone())
                .collect(),
            file_roots: self.config.files.iter().map(|f| f.root.clone()).collect(),
            entries: std::mem::take(&mut self.entries),
        })
    }

    /// Clear all accumulated state for reuse across runs in one process.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.deferred.clear();
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
