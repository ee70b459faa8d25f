use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver};
use tracing::{debug, info, warn};

use crate::chunk::Chunk;
use crate::config::ChunkingConfig;
use crate::error::{Result, SatchelError};
use crate::storage::{with_retry, RetryPolicy, StorageBackend};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Succeeded,
    Failed,
    TimedOut,
}

/// Per-chunk outcome collected by the scheduler.
#[derive(Debug, Clone)]
pub struct UploadResult {
    pub name: String,
    pub state: UploadState,
    pub attempts: usize,
    pub error: Option<String>,
    pub duration: Duration,
}

impl UploadResult {
    pub fn succeeded(&self) -> bool {
        self.state == UploadState::Succeeded
    }
}

/// Uploads chunks with bounded concurrency.
///
/// Consumes chunks from the producer channel, keeping up to
/// `max_concurrent` uploads in flight. Each upload goes through the storage
/// retry wrapper; the scheduler itself never retries. A chunk that exceeds
/// the per-chunk timeout is marked `TimedOut` and its slot freed; a result
/// arriving after that is discarded.
pub struct UploadScheduler {
    backend: Arc<dyn StorageBackend>,
    policy: RetryPolicy,
    max_concurrent: usize,
    timeout: Duration,
}

impl UploadScheduler {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        policy: RetryPolicy,
        chunking: &ChunkingConfig,
    ) -> Self {
        Self {
            backend,
            policy,
            max_concurrent: chunking.max_concurrent,
            timeout: Duration::from_secs(chunking.upload_timeout_secs),
        }
    }

    /// Run until the producer channel closes and all in-flight uploads
    /// settle. Individual failures never abort the batch; judge the batch
    /// afterwards with [`check_batch`].
    pub fn run(&self, chunks: Receiver<Chunk>) -> Vec<UploadResult> {
        let (done_tx, done_rx) = unbounded::<(u64, UploadResult)>();
        let mut active: HashMap<u64, (String, Instant)> = HashMap::new();
        let mut results: Vec<UploadResult> = Vec::new();
        let mut next_ticket: u64 = 0;
        let mut open = true;

        while open || !active.is_empty() {
            if open && active.len() < self.max_concurrent {
                crossbeam_channel::select! {
                    recv(chunks) -> msg => match msg {
                        Ok(chunk) => {
                            let ticket = next_ticket;
                            next_ticket += 1;
                            active.insert(
                                ticket,
                                (chunk.name.clone(), Instant::now() + self.timeout),
                            );
                            let backend = Arc::clone(&self.backend);
                            let policy = self.policy;
                            let done_tx = done_tx.clone();
                            std::thread::spawn(move || {
                                let result = upload_one(backend.as_ref(), &policy, chunk);
                                let _ = done_tx.send((ticket, result));
                            });
                        }
                        Err(_) => open = false,
                    },
                    recv(done_rx) -> msg => {
                        if let Ok((ticket, result)) = msg {
                            settle(&mut active, &mut results, ticket, result);
                        }
                    },
                    default(Duration::from_millis(50)) => {}
                }
            } else {
                let deadline = match active.values().map(|(_, d)| *d).min() {
                    Some(d) => d,
                    None => break,
                };
                if let Ok((ticket, result)) = done_rx.recv_deadline(deadline) {
                    settle(&mut active, &mut results, ticket, result);
                }
            }

            let now = Instant::now();
            let expired: Vec<u64> = active
                .iter()
                .filter(|(_, (_, deadline))| *deadline <= now)
                .map(|(ticket, _)| *ticket)
                .collect();
            for ticket in expired {
                if let Some((name, _)) = active.remove(&ticket) {
                    warn!(chunk = %name, timeout_secs = self.timeout.as_secs(), "chunk upload timed out");
                    results.push(UploadResult {
                        name,
                        state: UploadState::TimedOut,
                        attempts: 0,
                        error: Some(format!(
                            "upload timed out after {}s",
                            self.timeout.as_secs()
                        )),
                        duration: self.timeout,
                    });
                }
            }
        }

        results.sort_by(|a, b| a.name.cmp(&b.name));
        info!(
            total = results.len(),
            failed = results.iter().filter(|r| !r.succeeded()).count(),
            "chunk upload batch settled"
        );
        results
    }
}

fn settle(
    active: &mut HashMap<u64, (String, Instant)>,
    results: &mut Vec<UploadResult>,
    ticket: u64,
    result: UploadResult,
) {
    if active.remove(&ticket).is_some() {
        results.push(result);
    } else {
        // Already reported as timed out.
        debug!(chunk = %result.name, "discarding late upload result");
    }
}

fn upload_one(backend: &dyn StorageBackend, policy: &RetryPolicy, chunk: Chunk) -> UploadResult {
    let started = Instant::now();
    let key = chunk.storage_key();
    let mut attempts = 0;
    let outcome = with_retry(policy, "put chunk", || {
        attempts += 1;
        backend.put(&key, &chunk.payload)
    });
    match outcome {
        Ok(()) => {
            debug!(chunk = %chunk.name, attempts, "chunk uploaded");
            UploadResult {
                name: chunk.name,
                state: UploadState::Succeeded,
                attempts,
                error: None,
                duration: started.elapsed(),
            }
        }
        Err(e) => {
            warn!(chunk = %chunk.name, attempts, error = %e, "chunk upload failed");
            UploadResult {
                name: chunk.name,
                state: UploadState::Failed,
                attempts,
                error: Some(e.to_string()),
                duration: started.elapsed(),
            }
        }
    }
}

/// Batch failure policy: individual failures are tolerated, but a batch
/// with more than 50% of its chunks failed is reported as failed.
pub fn check_batch(results: &[UploadResult]) -> Result<()> {
    let total = results.len();
    let failed = results.iter().filter(|r| !r.succeeded()).count();
    if failed * 2 > total {
        return Err(SatchelError::ChunkUpload { failed, total });
    }
    if failed > 0 {
        warn!(failed, total, "chunk batch settled with tolerated failures");
    }
    Ok(())
}
