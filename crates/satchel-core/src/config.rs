use serde::{Deserialize, Serialize};

use crate::error::{Result, SatchelError};

/// Immutable configuration for one backup run.
///
/// Constructed once (typically deserialized by the CLI collaborator) and
/// passed by reference to every component constructor. No component reads
/// configuration from anywhere else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Application name recorded in the manifest.
    pub app_name: String,
    /// Environment label recorded in the manifest (e.g. "production").
    #[serde(default)]
    pub environment: String,
    /// Label of the storage target chunks and archives are written to.
    #[serde(default)]
    pub storage_target: String,
    #[serde(default)]
    pub databases: Vec<DatabaseConfig>,
    #[serde(default)]
    pub files: Vec<FileSetConfig>,
    #[serde(default)]
    pub filters: FilterConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub encryption: EncryptionConfig,
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl BackupConfig {
    /// Validate the configuration before any I/O side effects.
    ///
    /// Rejects runs with no enabled backup targets, encryption without a
    /// master key, and out-of-range compression levels.
    pub fn validate(&self) -> Result<()> {
        let any_db = self.databases.iter().any(|d| d.enabled);
        if !any_db && self.files.is_empty() {
            return Err(SatchelError::Config(
                "no backup targets enabled: no databases and no file sets".into(),
            ));
        }
        if self.encryption.enabled && self.encryption.master_key.is_none() {
            return Err(SatchelError::Config(
                "encryption enabled but no master key configured".into(),
            ));
        }
        if !(1..=9).contains(&self.compression_level) {
            return Err(SatchelError::Config(format!(
                "compression level must be 1-9, got {}",
                self.compression_level
            )));
        }
        self.chunking.validate()?;
        Ok(())
    }
}

/// One database connection to dump.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Connection name; becomes `database/<name>.sql` in the archive.
    pub name: String,
    pub driver: DbDriver,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Database name, or path to the database file for SQLite.
    pub database: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Supported database drivers. Closed set: each variant maps to exactly one
/// dump tool invocation, matched exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbDriver {
    MySql,
    Postgres,
    Sqlite,
}

impl DbDriver {
    pub fn as_str(self) -> &'static str {
        match self {
            DbDriver::MySql => "mysql",
            DbDriver::Postgres => "postgres",
            DbDriver::Sqlite => "sqlite",
        }
    }
}

/// One filesystem tree to back up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSetConfig {
    /// Label used for chunk base names (`files_<label>`).
    pub label: String,
    /// Root directory to walk recursively.
    pub root: String,
}

/// Filter chain configuration. All configured filters are ANDed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Allowed extensions (lowercase, no dot). Empty = all extensions.
    #[serde(default)]
    pub extensions: Vec<String>,
    /// Path substrings to exclude.
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    /// Skip files larger than this many bytes. None = no limit.
    #[serde(default)]
    pub max_file_size: Option<u64>,
}

/// Hard cap on `chunk_size` to bound per-chunk buffer memory.
pub const CHUNK_SIZE_HARD_CAP: usize = 64 * 1024 * 1024; // 64 MiB

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Soft lower bound on chunk payload size (flush threshold).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Maximum concurrent chunk uploads; also the producer channel capacity.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Per-chunk upload timeout in seconds.
    #[serde(default = "default_upload_timeout_secs")]
    pub upload_timeout_secs: u64,
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(SatchelError::Config("chunk_size must be non-zero".into()));
        }
        if self.chunk_size > CHUNK_SIZE_HARD_CAP {
            return Err(SatchelError::Config(format!(
                "chunk_size {} exceeds hard cap of {CHUNK_SIZE_HARD_CAP} bytes",
                self.chunk_size
            )));
        }
        if self.max_concurrent == 0 {
            return Err(SatchelError::Config(
                "max_concurrent must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_concurrent: default_max_concurrent(),
            upload_timeout_secs: default_upload_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EncryptionConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Long-lived master key (KEK source). Required when `enabled`.
    #[serde(default)]
    pub master_key: Option<String>,
}

/// Retry settings for storage backend calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first try (0 = no retries).
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    /// Initial delay between retries in milliseconds.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Maximum delay between retries in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_compression_level() -> u32 {
    6
}

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_true() -> bool {
    true
}

fn default_chunk_size() -> usize {
    10 * 1024 * 1024 // 10 MiB
}

fn default_max_concurrent() -> usize {
    3
}

fn default_upload_timeout_secs() -> u64 {
    60
}

fn default_max_retries() -> usize {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    5000
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> BackupConfig {
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

    #[test]
    fn valid_config_passes() {
        base_config().validate().unwrap();
    }

    #[test]
    fn rejects_no_targets() {
        let mut cfg = base_config();
        cfg.files.clear();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("no backup targets"));
    }

    #[test]
    fn disabled_databases_do_not_count_as_targets() {
        let mut cfg = base_config();
        cfg.files.clear();
        cfg.databases.push(DatabaseConfig {
            name: "app".into(),
            driver: DbDriver::MySql,
            host: default_host(),
            port: None,
            username: "root".into(),
            password: String::new(),
            database: "app".into(),
            enabled: false,
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_encryption_without_master_key() {
        let mut cfg = base_config();
        cfg.encryption.enabled = true;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("master key"));
    }

    #[test]
    fn rejects_out_of_range_compression_level() {
        let mut cfg = base_config();
        cfg.compression_level = 0;
        assert!(cfg.validate().is_err());
        cfg.compression_level = 10;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_chunk_size() {
        let mut cfg = base_config();
        cfg.chunking.chunk_size = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn retry_defaults_match_documented_policy() {
        let retry = RetryConfig::default();
        assert_eq!(retry.max_retries, 3);
        assert_eq!(retry.initial_backoff_ms, 500);
        assert_eq!(retry.max_backoff_ms, 5000);
    }
}
