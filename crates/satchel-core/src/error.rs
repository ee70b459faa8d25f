use thiserror::Error;

pub type Result<T> = std::result::Result<T, SatchelError>;

#[derive(Debug, Error)]
pub enum SatchelError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("dump of '{connection}' failed: {message}")]
    Dump { connection: String, message: String },

    #[error("storage error during {op}: {message}")]
    Storage { op: String, message: String },

    #[error("chunk upload batch failed: {failed} of {total} chunks did not upload")]
    ChunkUpload { failed: usize, total: usize },

    #[error("chunk group '{base_name}' has index gap: expected {expected}, found {found}")]
    ChunkGap {
        base_name: String,
        expected: u32,
        found: u32,
    },

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("decryption failed: wrong key or corrupt data")]
    DecryptionFailed,

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl SatchelError {
    /// Whether the error is transient and worth retrying at the storage layer.
    pub fn is_transient(&self) -> bool {
        match self {
            SatchelError::Storage { .. } => true,
            SatchelError::Io(e) => is_retryable_io(e),
            _ => false,
        }
    }
}

/// Whether an I/O error is transient and worth retrying.
pub fn is_retryable_io(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::Interrupted
    )
}
