pub mod collator;
pub mod producer;
pub mod scheduler;

pub use collator::{Collator, FramingMode};
pub use producer::{decode_file_records, encode_file_record, ChunkSink};
pub use scheduler::{UploadResult, UploadScheduler, UploadState};

use crate::error::{Result, SatchelError};

/// Storage key prefix under which a run's chunks live.
pub const CHUNK_KEY_PREFIX: &str = "chunks/";

/// What a chunk group was produced from. Determines the framing scheme the
/// collator applies in reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Database,
    DirectoryFiles,
    SingleFile,
    Manifest,
}

/// One bounded-size unit of the streaming backup path.
///
/// Ephemeral: produced once, uploaded once, consumed once by the collator,
/// then deleted from storage.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Globally unique within the run: `<base_name>.<index:05>`.
    pub name: String,
    /// Groups chunks belonging to one logical source.
    pub base_name: String,
    pub kind: SourceKind,
    /// Zero-based, strictly increasing per base name, no gaps.
    pub index: u32,
    pub payload: Vec<u8>,
}

impl Chunk {
    pub fn storage_key(&self) -> String {
        format!("{CHUNK_KEY_PREFIX}{}", self.name)
    }
}

pub fn chunk_name(base_name: &str, index: u32) -> String {
    format!("{base_name}.{index:05}")
}

/// Base name for a database connection's chunk group.
pub fn database_base_name(connection: &str) -> String {
    format!("db_{connection}")
}

/// Base name for a directory tree's chunk group.
pub fn directory_base_name(label: &str) -> String {
    format!("files_{label}")
}

/// Base name for a single file's chunk group.
pub fn single_file_base_name(label: &str) -> String {
    format!("file_{label}")
}

/// Base name of the manifest chunk group (always exactly one chunk).
pub const MANIFEST_BASE_NAME: &str = "manifest";

/// Split a chunk name back into `(base_name, index)`.
pub fn parse_chunk_name(name: &str) -> Result<(&str, u32)> {
    let (base, index) = name
        .rsplit_once('.')
        .ok_or_else(|| SatchelError::InvalidFormat(format!("malformed chunk name: '{name}'")))?;
    let index = index
        .parse::<u32>()
        .map_err(|_| SatchelError::InvalidFormat(format!("malformed chunk name: '{name}'")))?;
    if base.is_empty() {
        return Err(SatchelError::InvalidFormat(format!(
            "malformed chunk name: '{name}'"
        )));
    }
    Ok((base, index))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_names_are_zero_padded() {
        assert_eq!(chunk_name("db_app", 0), "db_app.00000");
        assert_eq!(chunk_name("files_assets", 137), "files_assets.00137");
    }

    #[test]
    fn chunk_names_round_trip() {
        let name = chunk_name(&database_base_name("app"), 42);
        assert_eq!(parse_chunk_name(&name).unwrap(), ("db_app", 42));
    }

    #[test]
    fn base_name_with_dots_still_parses() {
        // rsplit keeps dots inside the base name intact
        let name = chunk_name("files_www.example", 3);
        assert_eq!(parse_chunk_name(&name).unwrap(), ("files_www.example", 3));
    }

    #[test]
    fn malformed_names_rejected() {
        assert!(parse_chunk_name("no-separator").is_err());
        assert!(parse_chunk_name("base.notanumber").is_err());
        assert!(parse_chunk_name(".00001").is_err());
    }

    #[test]
    fn storage_key_is_prefixed() {
        let chunk = Chunk {
            name: "manifest.00000".into(),
            base_name: MANIFEST_BASE_NAME.into(),
            kind: SourceKind::Manifest,
            index: 0,
            payload: Vec::new(),
        };
        assert_eq!(chunk.storage_key(), "chunks/manifest.00000");
    }
}
