pub mod local_backend;
pub mod retry;

pub use local_backend::LocalBackend;
pub use retry::{with_retry, RetryPolicy, RetryingBackend};

use std::path::Component;

use crate::error::{Result, SatchelError};

/// Object-storage abstraction used by both backup paths.
///
/// Implementations must be safe for concurrent use: the upload scheduler
/// calls `put` from several threads at once.
pub trait StorageBackend: Send + Sync {
    /// Read the full object, or `None` if the key does not exist.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write the full object, overwriting any existing value.
    fn put(&self, key: &str, data: &[u8]) -> Result<()>;

    /// Delete the object. Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> Result<()>;

    /// List all keys under the given prefix.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    fn exists(&self, key: &str) -> Result<bool>;

    /// Size of the stored object in bytes, or `None` if the key is missing.
    fn size(&self, key: &str) -> Result<Option<u64>>;
}

impl<T: StorageBackend + ?Sized> StorageBackend for std::sync::Arc<T> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        (**self).get(key)
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        (**self).put(key, data)
    }

    fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        (**self).list(prefix)
    }

    fn exists(&self, key: &str) -> Result<bool> {
        (**self).exists(key)
    }

    fn size(&self, key: &str) -> Result<Option<u64>> {
        (**self).size(key)
    }
}

/// Reject storage keys that could escape the backend root.
pub(crate) fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(SatchelError::InvalidFormat(
            "unsafe storage key: empty".into(),
        ));
    }
    if key.starts_with('/') || key.contains('\\') {
        return Err(SatchelError::InvalidFormat(format!(
            "unsafe storage key: '{key}'"
        )));
    }
    for component in std::path::Path::new(key).components() {
        if component == Component::ParentDir {
            return Err(SatchelError::InvalidFormat(format!(
                "unsafe storage key: parent traversal in '{key}'"
            )));
        }
    }
    Ok(())
}
