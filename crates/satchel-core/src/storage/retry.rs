use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::Result;
use crate::storage::StorageBackend;

/// Bounded-retry policy with doubling backoff.
///
/// Delays after failed attempts are `initial, 2*initial, 4*initial, ...`
/// capped at `max` — with the defaults (500 ms initial, 5000 ms cap) the
/// sequence is 500, 1000, 2000, 4000, 5000, 5000, ...
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_millis(5000),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            initial_backoff: Duration::from_millis(cfg.initial_backoff_ms),
            max_backoff: Duration::from_millis(cfg.max_backoff_ms),
        }
    }
}

/// Retry a storage operation on transient errors with doubling backoff.
///
/// Non-transient errors propagate immediately; the last transient error is
/// returned once retries are exhausted.
pub fn with_retry<T>(
    policy: &RetryPolicy,
    op_name: &str,
    f: impl FnMut() -> Result<T>,
) -> Result<T> {
    with_retry_sleeper(policy, op_name, std::thread::sleep, f)
}

/// Same as [`with_retry`] with an injectable sleep function, so tests can
/// assert the exact backoff sequence without waiting.
pub fn with_retry_sleeper<T>(
    policy: &RetryPolicy,
    op_name: &str,
    mut sleep: impl FnMut(Duration),
    mut f: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut delay = policy.initial_backoff;
    let mut attempt = 0;

    loop {
        match f() {
            Ok(val) => return Ok(val),
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                tracing::warn!(
                    op = op_name,
                    attempt = attempt + 1,
                    max = policy.max_retries,
                    "transient storage error, retrying: {e}"
                );
                sleep(delay);
                delay = (delay * 2).min(policy.max_backoff);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Decorator applying [`with_retry`] to every call against the wrapped
/// backend, so a transient blip mid-run does not fail on the first error.
pub struct RetryingBackend<B> {
    inner: B,
    policy: RetryPolicy,
}

impl<B: StorageBackend> RetryingBackend<B> {
    pub fn new(inner: B, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn into_inner(self) -> B {
        self.inner
    }
}

impl<B: StorageBackend> StorageBackend for RetryingBackend<B> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        with_retry(&self.policy, "get", || self.inner.get(key))
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        with_retry(&self.policy, "put", || self.inner.put(key, data))
    }

    fn delete(&self, key: &str) -> Result<()> {
        with_retry(&self.policy, "delete", || self.inner.delete(key))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        with_retry(&self.policy, "list", || self.inner.list(prefix))
    }

    fn exists(&self, key: &str) -> Result<bool> {
        with_retry(&self.policy, "exists", || self.inner.exists(key))
    }

    fn size(&self, key: &str) -> Result<Option<u64>> {
        with_retry(&self.policy, "size", || self.inner.size(key))
    }
}
