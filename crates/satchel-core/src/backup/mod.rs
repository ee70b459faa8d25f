pub mod chunked;
pub mod direct;

use std::path::{Path, PathBuf};

use tracing::warn;
use walkdir::WalkDir;

use crate::crypto::EnvelopeCipher;
use crate::error::Result;
use crate::filter::{FileFilter, FilterChain};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Succeeded,
    Failed,
}

/// Structured outcome of one backup run, handed to the out-of-process
/// logging and notification collaborators.
#[derive(Debug)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub archive_path: Option<PathBuf>,
    pub size_bytes: u64,
    pub manifest_entry_count: usize,
    pub error: Option<String>,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    pub(crate) fn success(archive_path: PathBuf, size_bytes: u64, entries: usize) -> Self {
        Self {
            status: RunStatus::Succeeded,
            archive_path: Some(archive_path),
            size_bytes,
            manifest_entry_count: entries,
            error: None,
        }
    }

    pub(crate) fn failure(archive_path: Option<PathBuf>, error: String) -> Self {
        Self {
            status: RunStatus::Failed,
            archive_path,
            size_bytes: 0,
            manifest_entry_count: 0,
            error: Some(error),
        }
    }
}

/// Build the envelope cipher when encryption is on. Raised before any
/// bytes are touched; a missing master key never surfaces mid-run.
pub(crate) fn cipher_for(config: &crate::config::BackupConfig) -> Result<Option<EnvelopeCipher>> {
    if !config.encryption.enabled {
        return Ok(None);
    }
    let key = config
        .encryption
        .master_key
        .as_deref()
        .ok_or_else(|| crate::error::SatchelError::Config("key not configured".into()))?;
    Ok(Some(EnvelopeCipher::new(key)?))
}

/// Walk one file root, applying the filter chain, and return
/// `(relative-path, absolute-path)` pairs in a deterministic order.
/// Relative paths use `/` separators regardless of platform.
pub(crate) fn walk_file_set(root: &Path, chain: &FilterChain) -> Result<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| std::io::Error::other(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if !chain.should_include(path) {
            continue;
        }
        let relative = match path.strip_prefix(root) {
            Ok(rel) => rel,
            Err(_) => continue,
        };
        let Some(relative) = relative.to_str() else {
            warn!(path = %path.display(), "skipping file with non-UTF-8 name");
            continue;
        };
        files.push((relative.replace('\\', "/"), path.to_path_buf()));
    }
    Ok(files)
}
