//! Engine coordinator - one mirror run from start to shutdown
//!
//! A run:
//! - checks the output directory and recovers whatever the previous run left behind
//! - opens a session record and authenticates
//! - runs discovery and the worker pool side by side
//! - keeps the credential, progress and backup timers going meanwhile
//! - closes the session with its final status and takes a last backup

use crate::config::{Config, SiteEntry};
use crate::engine::discovery::{Discovery, DiscoverySummary};
use crate::engine::monitor::SiteCompletionMonitor;
use crate::engine::session::SessionManager;
use crate::engine::stats::StatisticsAggregator;
use crate::engine::worker::{partial_path, run_pool, PoolBackoff, WorkerContext};
use crate::source::{ContentSource, Credentials};
use crate::storage::{
    metrics, SessionProgress, SessionStatus, SiteRecord, Statistics, Storage,
};
use crate::MirrorError;
use parking_lot::Mutex;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Number of database backups kept in the backup directory
pub const BACKUPS_KEPT: usize = 5;

const IDLE_WAIT: Duration = Duration::from_millis(200);

/// Result of a finished run
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub session_id: i64,
    pub status: SessionStatus,
    pub progress: SessionProgress,
    pub discovery: DiscoverySummary,
    pub statistics: Statistics,
}

/// Main engine structure
pub struct Engine {
    config: Arc<Config>,
    storage: Arc<dyn Storage>,
    source: Arc<dyn ContentSource>,
    credentials: Credentials,
    config_hash: String,
    shutdown: CancellationToken,
    active_stats: Mutex<Option<Arc<StatisticsAggregator>>>,
}

impl Engine {
    pub fn new(
        config: Config,
        storage: Arc<dyn Storage>,
        source: Arc<dyn ContentSource>,
        credentials: Credentials,
        config_hash: impl Into<String>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            storage,
            source,
            credentials,
            config_hash: config_hash.into(),
            shutdown: CancellationToken::new(),
            active_stats: Mutex::new(None),
        }
    }

    /// Cancelling this token stops the run gracefully
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Returns every site, or only `name`, as currently stored
    pub fn get_site_status(&self, name: Option<&str>) -> Result<Vec<SiteRecord>, MirrorError> {
        Ok(self.storage.get_site_status(name)?)
    }

    /// Removes the download records of `name` so that the next run rediscovers it
    pub fn reset_site(&self, name: &str) -> Result<u64, MirrorError> {
        Ok(self.storage.reset_site(name)?)
    }

    /// Current statistics, including counts not yet flushed by a running mirror
    pub fn get_statistics(&self) -> Result<Statistics, MirrorError> {
        let active = self.active_stats.lock().clone();
        match active {
            Some(stats) => Ok(stats.snapshot()?),
            None => Ok(self.storage.snapshot_statistics()?),
        }
    }

    /// Mirrors every site in `sites`
    ///
    /// Returns the summary for runs that completed or were interrupted; a fatal error (storage,
    /// exhausted credential refresh) is returned after the session has been closed as failed.
    pub async fn run(&self, sites: &[SiteEntry]) -> Result<RunSummary, MirrorError> {
        let engine = &self.config.engine;
        let output_dir = self.config.output_dir();

        check_output_writable(&output_dir)?;
        self.recover_previous_run()?;

        for site in sites {
            self.storage.register_site(&site.name, &site.url)?;
        }

        let session_id = self.storage.create_session(&self.config_hash)?;
        tracing::info!(
            "Session {} started: {} sites, {} workers",
            session_id,
            sites.len(),
            engine.num_threads
        );

        let stats = Arc::new(StatisticsAggregator::new(
            Arc::clone(&self.storage),
            engine.batch_size as u64,
        ));
        *self.active_stats.lock() = Some(Arc::clone(&stats));
        let monitor = Arc::new(SiteCompletionMonitor::new(
            Arc::clone(&self.storage),
            Arc::clone(&stats),
        ));
        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&self.source),
            self.credentials.clone(),
            engine.max_files_per_session,
            engine.max_retry,
            engine.api_retry_delay(),
        ));

        if let Err(e) = sessions.refresh().await {
            tracing::error!("Initial authentication failed: {}", e);
            *self.active_stats.lock() = None;
            self.storage
                .close_session(session_id, SessionStatus::Failed, &SessionProgress::default())?;
            return Err(e);
        }

        let timers_stop = CancellationToken::new();
        let timers = self.spawn_timers(session_id, &sessions, &stats, &timers_stop);

        let ctx = Arc::new(WorkerContext {
            storage: Arc::clone(&self.storage),
            source: Arc::clone(&self.source),
            sessions: Arc::clone(&sessions),
            monitor: Arc::clone(&monitor),
            stats: Arc::clone(&stats),
            backoff: PoolBackoff::new(),
            discovery_done: AtomicBool::new(false),
            shutdown: self.shutdown.clone(),
            api_retry_delay: engine.api_retry_delay(),
            idle_wait: IDLE_WAIT,
        });

        let discovery = Discovery {
            storage: Arc::clone(&self.storage),
            source: Arc::clone(&self.source),
            sessions: Arc::clone(&sessions),
            monitor: Arc::clone(&monitor),
            stats: Arc::clone(&stats),
            output_dir,
            batch_size: engine.batch_size as usize,
            max_attempts: engine.max_retry,
            retry_delay: engine.api_retry_delay(),
            shutdown: self.shutdown.clone(),
        };
        let discovery_task = {
            let ctx = Arc::clone(&ctx);
            let sites = sites.to_vec();
            tokio::spawn(async move {
                let result = discovery.run(&sites).await;
                ctx.discovery_done.store(true, Ordering::Release);
                if let Err(e) = &result {
                    tracing::error!("Discovery failed: {}", e);
                    ctx.shutdown.cancel();
                }
                result
            })
        };

        let pool_result = run_pool(Arc::clone(&ctx), engine.num_threads as usize).await;
        let discovery_result = match discovery_task.await {
            Ok(result) => result,
            Err(e) => Err(MirrorError::Join(e)),
        };

        timers_stop.cancel();
        for timer in timers {
            let _ = timer.await;
        }

        let (status, failure, discovery_summary) = match (discovery_result, pool_result) {
            (Err(e), _) | (Ok(_), Err(e)) => {
                (SessionStatus::Failed, Some(e), DiscoverySummary::default())
            }
            (Ok(summary), Ok(_)) if self.shutdown.is_cancelled() => {
                (SessionStatus::Interrupted, None, summary)
            }
            (Ok(summary), Ok(_)) => (SessionStatus::Completed, None, summary),
        };

        *self.active_stats.lock() = None;
        stats.flush()?;
        let progress = stats.session_progress();
        self.storage.close_session(session_id, status, &progress)?;
        if let Err(e) = self.storage.backup(&self.config.backup_dir(), BACKUPS_KEPT) {
            tracing::warn!("Final database backup failed: {}", e);
        }

        tracing::info!(
            "Session {} {}: {} files processed, {} downloaded, {} failed, {:.2} MB",
            session_id,
            status,
            progress.files_processed,
            progress.files_downloaded,
            progress.files_failed,
            progress.mb_downloaded
        );

        if let Some(e) = failure {
            return Err(e);
        }

        Ok(RunSummary {
            session_id,
            status,
            progress,
            discovery: discovery_summary,
            statistics: stats.snapshot()?,
        })
    }

    /// Closes sessions a crash left running and discards untrusted partial files
    fn recover_previous_run(&self) -> Result<(), MirrorError> {
        let stale = self.storage.close_stale_sessions()?;
        if !stale.is_empty() {
            tracing::warn!("Marked {} unfinished sessions as interrupted", stale.len());
        }

        let recovered = self.storage.recover_interrupted()?;
        for record in &recovered {
            let destination = Path::new(&record.destination_path);
            remove_if_present(destination)?;
            remove_if_present(&partial_path(destination))?;
        }
        if !recovered.is_empty() {
            tracing::warn!(
                "Recovered {} downloads interrupted by the previous run",
                recovered.len()
            );
        }
        Ok(())
    }

    fn spawn_timers(
        &self,
        session_id: i64,
        sessions: &Arc<SessionManager>,
        stats: &Arc<StatisticsAggregator>,
        stop: &CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let engine = &self.config.engine;
        let mut timers = Vec::new();

        let refresh_sessions = Arc::clone(sessions);
        timers.push(spawn_timer(
            "token refresh",
            engine.token_refresh_interval(),
            stop.clone(),
            move || {
                let sessions = Arc::clone(&refresh_sessions);
                async move {
                    tracing::info!("Refreshing credentials on schedule");
                    if let Err(e) = sessions.refresh().await {
                        tracing::error!("Scheduled credential refresh failed: {}", e);
                    }
                }
            },
        ));

        let storage = Arc::clone(&self.storage);
        let progress_stats = Arc::clone(stats);
        timers.push(spawn_timer(
            "progress",
            engine.progress_save_interval(),
            stop.clone(),
            move || {
                let storage = Arc::clone(&storage);
                let stats = Arc::clone(&progress_stats);
                async move {
                    if let Err(e) = save_progress(storage.as_ref(), &stats, session_id) {
                        tracing::error!("Failed to save progress: {}", e);
                    }
                }
            },
        ));

        let storage = Arc::clone(&self.storage);
        let backup_dir = self.config.backup_dir();
        timers.push(spawn_timer(
            "backup",
            engine.db_backup_interval(),
            stop.clone(),
            move || {
                let storage = Arc::clone(&storage);
                let backup_dir = backup_dir.clone();
                async move {
                    match storage.backup(&backup_dir, BACKUPS_KEPT) {
                        Ok(path) => tracing::debug!("Database backed up to {}", path.display()),
                        Err(e) => tracing::warn!("Database backup failed: {}", e),
                    }
                }
            },
        ));

        timers
    }
}

fn save_progress(
    storage: &dyn Storage,
    stats: &StatisticsAggregator,
    session_id: i64,
) -> Result<(), MirrorError> {
    stats.flush()?;
    let progress = stats.session_progress();
    storage.update_session_progress(session_id, &progress)?;

    let totals = stats.snapshot()?;
    let pending = storage.pending_work()?;
    tracing::info!(
        "Progress: {}/{} files done, {} failed, {} queued, {} in flight, {:.2} MB this session",
        totals.get(metrics::SUCCESSFUL_DOWNLOADS),
        totals.get(metrics::TOTAL_FILES),
        totals.get(metrics::FAILED_DOWNLOADS),
        pending.claimable,
        pending.in_flight,
        progress.mb_downloaded
    );
    Ok(())
}

/// Calls `tick` every `period`, skipping the immediate first tick
fn spawn_timer<F, Fut>(
    name: &'static str,
    period: Duration,
    stop: CancellationToken,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => tick().await,
                _ = stop.cancelled() => break,
            }
        }
        tracing::debug!("{} timer stopped", name);
    })
}

/// Creates the output directory and proves a file can be written in it
fn check_output_writable(output_dir: &Path) -> Result<(), MirrorError> {
    let not_writable = |source: std::io::Error| MirrorError::OutputNotWritable {
        path: output_dir.display().to_string(),
        source,
    };
    std::fs::create_dir_all(output_dir).map_err(not_writable)?;
    let probe = output_dir.join(".site_mirror_write_test");
    std::fs::write(&probe, b"ok").map_err(not_writable)?;
    std::fs::remove_file(&probe).map_err(not_writable)?;
    Ok(())
}

fn remove_if_present(path: &Path) -> Result<(), MirrorError> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            tracing::debug!("Removed untrusted file {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_check_creates_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let output = dir.path().join("mirror");
        check_output_writable(&output).unwrap();
        assert!(output.is_dir());
        assert_eq!(std::fs::read_dir(&output).unwrap().count(), 0);
    }

    #[test]
    fn test_output_check_rejects_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let output = dir.path().join("not-a-dir");
        std::fs::write(&output, b"x").unwrap();
        assert!(matches!(
            check_output_writable(&output),
            Err(MirrorError::OutputNotWritable { .. })
        ));
    }

    #[tokio::test]
    async fn test_timer_skips_first_tick_and_stops() {
        let count = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let stop = CancellationToken::new();
        let counter = Arc::clone(&count);
        let handle = spawn_timer("test", Duration::from_millis(10), stop.clone(), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        assert_eq!(count.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(55)).await;
        stop.cancel();
        handle.await.unwrap();
        assert!(count.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn test_remove_if_present() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("a.part");
        remove_if_present(&path).unwrap();
        std::fs::write(&path, b"x").unwrap();
        remove_if_present(&path).unwrap();
        assert!(!path.exists());
    }
}
