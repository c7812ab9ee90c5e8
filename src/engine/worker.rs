//! Download worker pool
//!
//! Each worker claims one download at a time from the store, transfers it through the content
//! source into a `.part` file, and records the outcome. Workers share nothing but the store,
//! the session manager and a pool-wide backoff that rate limits pause.

use crate::engine::monitor::SiteCompletionMonitor;
use crate::engine::session::SessionManager;
use crate::engine::stats::{StatEvent, StatisticsAggregator};
use crate::source::{ContentSource, SessionHandle, SourceError};
use crate::state::DownloadStatus;
use crate::storage::{DownloadRecord, Outcome, Storage};
use crate::MirrorError;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pool-wide pause shared by all workers
#[derive(Default)]
pub struct PoolBackoff {
    until: Mutex<Option<Instant>>,
}

impl PoolBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pauses the pool for at least `delay`; never shortens an existing pause
    pub fn pause(&self, delay: Duration) {
        let deadline = Instant::now() + delay;
        let mut until = self.until.lock();
        match *until {
            Some(current) if current >= deadline => {}
            _ => *until = Some(deadline),
        }
    }

    pub fn is_paused(&self) -> bool {
        matches!(*self.until.lock(), Some(deadline) if deadline > Instant::now())
    }

    /// Sleeps until the pause ends; returns false if shutdown was requested meanwhile
    pub async fn wait(&self, shutdown: &CancellationToken) -> bool {
        loop {
            let deadline = *self.until.lock();
            match deadline {
                Some(deadline) if deadline > Instant::now() => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {}
                        _ = shutdown.cancelled() => return false,
                    }
                }
                _ => return !shutdown.is_cancelled(),
            }
        }
    }
}

/// `<destination>.part`
pub fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    destination.with_file_name(name)
}

/// Everything a worker needs, shared by the whole pool
pub struct WorkerContext {
    pub storage: Arc<dyn Storage>,
    pub source: Arc<dyn ContentSource>,
    pub sessions: Arc<SessionManager>,
    pub monitor: Arc<SiteCompletionMonitor>,
    pub stats: Arc<StatisticsAggregator>,
    pub backoff: PoolBackoff,
    /// Set once discovery has enumerated every site it is going to
    pub discovery_done: AtomicBool,
    pub shutdown: CancellationToken,
    pub api_retry_delay: Duration,
    pub idle_wait: Duration,
}

/// Runs `workers` workers until the work is drained or shutdown is requested
///
/// The first fatal worker error cancels the shutdown token and is returned once every worker
/// has stopped.
pub async fn run_pool(ctx: Arc<WorkerContext>, workers: usize) -> Result<u64, MirrorError> {
    let handles: Vec<_> = (0..workers.max(1))
        .map(|id| {
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move {
                let result = run_worker(&ctx, id).await;
                if let Err(e) = &result {
                    error!("Worker {} stopped: {}", id, e);
                    ctx.shutdown.cancel();
                }
                result
            })
        })
        .collect();

    let mut processed = 0;
    let mut first_error = None;
    for handle in handles {
        match handle.await {
            Ok(Ok(count)) => processed += count,
            Ok(Err(e)) => {
                first_error.get_or_insert(e);
            }
            Err(e) => {
                ctx.shutdown.cancel();
                first_error.get_or_insert(MirrorError::Join(e));
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(processed),
    }
}

async fn run_worker(ctx: &WorkerContext, id: usize) -> Result<u64, MirrorError> {
    debug!("Worker {} started", id);
    let mut processed = 0;

    loop {
        if !ctx.backoff.wait(&ctx.shutdown).await {
            break;
        }
        let session = ctx.sessions.get_session().await?;

        let record = match ctx.storage.claim_next_downloadable(None)? {
            Some(record) => record,
            None => {
                if ctx.discovery_done.load(Ordering::Acquire)
                    && ctx.storage.pending_work()?.is_drained()
                {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(ctx.idle_wait) => continue,
                    _ = ctx.shutdown.cancelled() => break,
                }
            }
        };

        process(ctx, record, session).await?;
        processed += 1;
    }

    debug!("Worker {} finished after {} files", id, processed);
    Ok(processed)
}

async fn process(
    ctx: &WorkerContext,
    record: DownloadRecord,
    mut session: Arc<SessionHandle>,
) -> Result<(), MirrorError> {
    let destination = PathBuf::from(&record.destination_path);

    if let Some(size) = existing_size_matches(&destination, record.size_bytes).await {
        debug!("Already present, skipping: {}", record.destination_path);
        ctx.storage
            .record_outcome(record.id, &Outcome::Completed { bytes_written: size })?;
        ctx.stats.record(StatEvent::SkippedExisting { bytes: size })?;
        return finish(ctx, &record).await;
    }

    let mut auth_retried = false;
    let result = loop {
        let attempt = match transfer(ctx, &session, &record, &destination).await {
            Some(attempt) => attempt,
            // Left `downloading`; the next start recovers it
            None => return Ok(()),
        };

        match attempt {
            Err(SourceError::AuthExpired(message)) if !auth_retried => {
                ctx.stats.record(StatEvent::ApiError)?;
                warn!(
                    "Session expired while downloading {}: {}",
                    record.file_name, message
                );
                match ctx.sessions.refresh_if_stale(session.generation).await {
                    Ok(handle) => {
                        session = handle;
                        auth_retried = true;
                    }
                    Err(e) => {
                        ctx.storage.release_claim(record.id)?;
                        return Err(e);
                    }
                }
            }
            other => break other,
        }
    };

    match result {
        Ok(bytes) => {
            ctx.storage
                .record_outcome(record.id, &Outcome::Completed { bytes_written: bytes })?;
            ctx.stats.record(StatEvent::Downloaded { bytes })?;
            debug!(
                "Downloaded {}/{}/{} ({} bytes)",
                record.site_name, record.library_name, record.file_name, bytes
            );
        }
        Err(error) => record_failure(ctx, &record, error)?,
    }

    finish(ctx, &record).await
}

/// Transfers into the `.part` file and renames it into place; `None` if shutdown interrupted it
async fn transfer(
    ctx: &WorkerContext,
    session: &SessionHandle,
    record: &DownloadRecord,
    destination: &Path,
) -> Option<Result<u64, SourceError>> {
    let partial = partial_path(destination);

    let result = tokio::select! {
        result = ctx.source.download(session, &record.remote_id, &partial) => result,
        _ = ctx.shutdown.cancelled() => {
            debug!("Transfer of {} aborted by shutdown", record.file_name);
            return None;
        }
    };

    let result = result.and_then(|written| match record.size_bytes {
        Some(expected) if expected != written => Err(SourceError::Interrupted(format!(
            "received {} of {} bytes",
            written, expected
        ))),
        _ => Ok(written),
    });

    let result = match result {
        Ok(written) => tokio::fs::rename(&partial, destination)
            .await
            .map(|_| written)
            .map_err(|e| SourceError::Interrupted(format!("failed to move file into place: {}", e))),
        Err(e) => Err(e),
    };

    if result.is_err() {
        let _ = tokio::fs::remove_file(&partial).await;
    }
    Some(result)
}

fn record_failure(
    ctx: &WorkerContext,
    record: &DownloadRecord,
    error: SourceError,
) -> Result<(), MirrorError> {
    if error.is_api_error() {
        ctx.stats.record(StatEvent::ApiError)?;
    }
    if error.pauses_pool() {
        let delay = match &error {
            SourceError::RateLimited {
                retry_after: Some(retry_after),
                ..
            } => ctx.api_retry_delay.max(*retry_after),
            _ => ctx.api_retry_delay,
        };
        warn!("Pausing all workers for {:?}: {}", delay, error);
        ctx.backoff.pause(delay);
    }

    let updated = ctx.storage.record_outcome(
        record.id,
        &Outcome::Failed {
            error: error.to_string(),
            permanent: error.is_permanent(),
        },
    )?;

    if updated.status == DownloadStatus::Failed && updated.retry_count >= ctx.storage.max_retry() {
        ctx.stats.record(StatEvent::FailedTerminal)?;
        error!(
            target: "failed_files",
            "{}/{}/{} failed after {} attempts: {}",
            record.site_name, record.library_name, record.file_name, updated.retry_count, error
        );
    } else {
        ctx.stats.record(StatEvent::AttemptFailed)?;
        warn!(
            "Download of {} failed (attempt {}/{}): {}",
            record.file_name,
            updated.retry_count,
            ctx.storage.max_retry(),
            error
        );
    }
    Ok(())
}

async fn finish(ctx: &WorkerContext, record: &DownloadRecord) -> Result<(), MirrorError> {
    ctx.monitor.evaluate(&record.site_name)?;
    if ctx.sessions.record_file_processed() {
        info!("Per-session file budget reached, refreshing credentials");
        ctx.sessions.refresh().await?;
    }
    Ok(())
}

async fn existing_size_matches(destination: &Path, expected: Option<u64>) -> Option<u64> {
    let expected = expected?;
    let metadata = tokio::fs::metadata(destination).await.ok()?;
    (metadata.is_file() && metadata.len() == expected).then_some(expected)
}
