//! Storage traits and error types
//!
//! This module defines the trait interface for the progress store and its error type.
//! Every status transition goes through one of these operations; nothing else writes site or
//! download fields.

use crate::state::DownloadStatus;
use crate::storage::{
    DownloadRecord, NewDownload, Outcome, PendingWork, RecentActivity, SessionProgress,
    SessionRecord, SessionStatus, SiteAggregate, SiteRecord, Statistics,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Site not found: {0}")]
    SiteNotFound(String),

    #[error("Download not found: {0}")]
    DownloadNotFound(i64),

    #[error("Session not found: {0}")]
    SessionNotFound(i64),

    #[error("Invalid transition for download {id}: {from} -> {to}")]
    InvalidTransition {
        id: i64,
        from: DownloadStatus,
        to: DownloadStatus,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Trait for progress store implementations
///
/// Implementations must be safe to share between workers: each method applies its change
/// atomically or not at all.
pub trait Storage: Send + Sync {
    /// The retry budget this store enforces
    fn max_retry(&self) -> u32;

    // ===== Session Management =====

    /// Creates a new running session and returns its ID
    fn create_session(&self, config_hash: &str) -> StorageResult<i64>;

    fn get_session(&self, session_id: i64) -> StorageResult<SessionRecord>;

    fn get_latest_session(&self) -> StorageResult<Option<SessionRecord>>;

    fn update_session_progress(
        &self,
        session_id: i64,
        progress: &SessionProgress,
    ) -> StorageResult<()>;

    /// Closes a session with a final status and progress snapshot
    fn close_session(
        &self,
        session_id: i64,
        status: SessionStatus,
        progress: &SessionProgress,
    ) -> StorageResult<()>;

    /// Marks every session still `running` as interrupted
    ///
    /// Called at startup, before a new session is created. Returns the IDs that were closed.
    fn close_stale_sessions(&self) -> StorageResult<Vec<i64>>;

    // ===== Site Management =====

    /// Creates a site as `pending` if unknown, otherwise refreshes its source URL
    ///
    /// A known site that is not terminal must be listed again before it can complete.
    fn register_site(&self, name: &str, source_url: &str) -> StorageResult<SiteRecord>;

    fn get_site(&self, name: &str) -> StorageResult<Option<SiteRecord>>;

    /// Returns one site, or every site ordered by name when `name` is `None`
    fn get_site_status(&self, name: Option<&str>) -> StorageResult<Vec<SiteRecord>>;

    /// Moves a pending site to `processing` and clears any earlier enumeration error
    fn mark_site_processing(&self, name: &str) -> StorageResult<()>;

    /// Records that every file listed for the site in this pass has been persisted
    ///
    /// Until this is set the site cannot leave `processing`, whatever its download rows say.
    fn mark_site_discovered(&self, name: &str) -> StorageResult<()>;

    /// Moves a site with no download records to `empty`
    ///
    /// Returns false if the site already has records and was left alone.
    fn mark_site_empty(&self, name: &str) -> StorageResult<bool>;

    /// Records an enumeration failure; the site stays `processing`
    fn mark_site_stalled(&self, name: &str, error: &str) -> StorageResult<()>;

    /// Deletes all download records of a site and returns it to `pending`
    ///
    /// Returns the number of download records removed.
    fn reset_site(&self, name: &str) -> StorageResult<u64>;

    /// Derives site counters from its download rows and applies the terminal-state rule
    fn recompute_site_aggregate(&self, name: &str) -> StorageResult<SiteAggregate>;

    // ===== Download Management =====

    /// Inserts a discovered file, or returns the existing record unchanged
    fn upsert_discovered(&self, file: &NewDownload) -> StorageResult<DownloadRecord>;

    /// Upserts many files in one transaction; returns how many were new
    fn upsert_discovered_batch(&self, files: &[NewDownload]) -> StorageResult<u64>;

    fn get_download(&self, id: i64) -> StorageResult<DownloadRecord>;

    fn get_downloads_for_site(&self, site: &str) -> StorageResult<Vec<DownloadRecord>>;

    /// Atomically claims one claimable record and marks it `downloading`
    fn claim_next_downloadable(&self, site_filter: Option<&str>)
        -> StorageResult<Option<DownloadRecord>>;

    /// Applies the outcome of a transfer to a `downloading` record
    fn record_outcome(&self, id: i64, outcome: &Outcome) -> StorageResult<DownloadRecord>;

    /// Returns a claimed record to the pool without consuming retry budget
    fn release_claim(&self, id: i64) -> StorageResult<()>;

    /// Makes every `downloading` record claimable again and returns them
    fn recover_interrupted(&self) -> StorageResult<Vec<DownloadRecord>>;

    fn pending_work(&self) -> StorageResult<PendingWork>;

    // ===== Statistics =====

    fn snapshot_statistics(&self) -> StorageResult<Statistics>;

    /// Adds every value of `delta` to the durable counters
    fn merge_statistics(&self, delta: &Statistics) -> StorageResult<()>;

    /// Recalculates the counters derivable from download and site rows
    fn rebuild_statistics(&self) -> StorageResult<Statistics>;

    fn count_by_status(&self) -> StorageResult<HashMap<DownloadStatus, u64>>;

    /// Gets failures that exhausted their retry budget
    fn get_failed_downloads(&self, limit: u32) -> StorageResult<Vec<DownloadRecord>>;

    /// Counts completions since `completed_since` and lists failures since `failed_since`
    fn recent_activity(
        &self,
        completed_since: DateTime<Utc>,
        failed_since: DateTime<Utc>,
        failure_limit: u32,
    ) -> StorageResult<RecentActivity>;

    // ===== Backup =====

    /// Writes a point-in-time copy of the database into `backup_dir`
    ///
    /// Older backups beyond the newest `keep` are removed. Returns the new backup path.
    fn backup(&self, backup_dir: &Path, keep: usize) -> StorageResult<PathBuf>;
}
