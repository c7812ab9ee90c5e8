//! Storage module for persisting mirror progress
//!
//! This module handles all database operations for the engine, including:
//! - SQLite database initialization and schema management
//! - Site and download state persistence with atomic claim/record transitions
//! - Session tracking and crash recovery
//! - Durable statistics counters
//! - Point-in-time backups

mod schema;
mod sqlite;
mod traits;

pub use sqlite::SqliteStorage;
pub use traits::{Storage, StorageError, StorageResult};

use crate::state::{DownloadStatus, SiteStatus};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Names of the durable statistics counters
pub mod metrics {
    pub const TOTAL_FILES: &str = "total_files";
    pub const SUCCESSFUL_DOWNLOADS: &str = "successful_downloads";
    pub const FAILED_DOWNLOADS: &str = "failed_downloads";
    pub const SKIPPED_EXISTING: &str = "skipped_existing";
    pub const API_ERRORS: &str = "api_errors";
    pub const MB_DOWNLOADED: &str = "mb_downloaded";
    pub const SITES_COMPLETED: &str = "sites_completed";

    pub const ALL: [&str; 7] = [
        TOTAL_FILES,
        SUCCESSFUL_DOWNLOADS,
        FAILED_DOWNLOADS,
        SKIPPED_EXISTING,
        API_ERRORS,
        MB_DOWNLOADED,
        SITES_COMPLETED,
    ];
}

/// Opens (or creates) the progress database at `path`
pub fn open_storage(path: &Path, max_retry: u32) -> StorageResult<SqliteStorage> {
    SqliteStorage::new(path, max_retry)
}

/// Converts a byte count to megabytes
pub fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

/// Represents a site in the database
#[derive(Debug, Clone)]
pub struct SiteRecord {
    pub name: String,
    pub source_url: String,
    pub status: SiteStatus,
    pub total_files: u64,
    pub completed_files: u64,
    pub failed_files: u64,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub last_error: Option<String>,
    pub last_updated: String,
    /// Every listed file of the current discovery pass has been recorded
    pub discovery_complete: bool,
}

/// Represents a file task in the database
#[derive(Debug, Clone)]
pub struct DownloadRecord {
    pub id: i64,
    pub site_name: String,
    pub library_name: String,
    /// Path of the file relative to its library root
    pub file_name: String,
    pub remote_id: String,
    pub destination_path: String,
    pub size_bytes: Option<u64>,
    pub size_mb: f64,
    pub status: DownloadStatus,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub discovered_at: String,
    pub last_attempt_at: Option<String>,
    pub completed_at: Option<String>,
}

/// A file reported by discovery, not yet persisted
#[derive(Debug, Clone)]
pub struct NewDownload {
    pub site_name: String,
    pub library_name: String,
    pub file_name: String,
    pub remote_id: String,
    pub destination_path: String,
    pub size_bytes: Option<u64>,
}

/// Result of one transfer attempt, as written back by a worker
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed { bytes_written: u64 },
    Failed { error: String, permanent: bool },
}

/// Site counters derived from its download rows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SiteAggregate {
    pub status: SiteStatus,
    pub total_files: u64,
    pub completed_files: u64,
    pub failed_files: u64,
    /// True only for the call that moved the site into a terminal status
    pub became_terminal: bool,
}

/// Claimable versus in-flight work, used to decide when the pool can stop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingWork {
    pub claimable: u64,
    pub in_flight: u64,
}

impl PendingWork {
    pub fn is_drained(&self) -> bool {
        self.claimable == 0 && self.in_flight == 0
    }
}

/// Download movement inside a recent time window
#[derive(Debug, Clone, Default)]
pub struct RecentActivity {
    /// Completed at or after the completion cutoff
    pub completed: u64,
    /// Currently claimed by a worker
    pub in_flight: u64,
    /// Attempts that failed at or after the failure cutoff, newest first
    pub failures: Vec<DownloadRecord>,
}

/// Represents an engine session
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: i64,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub status: SessionStatus,
    pub config_hash: String,
    pub progress: SessionProgress,
}

/// Per-session counters persisted alongside the session row
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SessionProgress {
    pub files_processed: u64,
    pub files_downloaded: u64,
    pub files_failed: u64,
    pub mb_downloaded: f64,
}

/// Status of an engine session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Running,
    Completed,
    Interrupted,
    Failed,
}

impl SessionStatus {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
            Self::Failed => "failed",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "interrupted" => Some(Self::Interrupted),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}

/// Metric name to running value
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Statistics {
    values: BTreeMap<String, f64>,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value of a metric, zero if it was never recorded
    pub fn get(&self, name: &str) -> f64 {
        self.values.get(name).copied().unwrap_or(0.0)
    }

    pub fn add(&mut self, name: &str, amount: f64) {
        *self.values.entry(name.to_string()).or_insert(0.0) += amount;
    }

    pub fn set(&mut self, name: &str, value: f64) {
        self.values.insert(name.to_string(), value);
    }

    /// Adds every metric of `other` into this one
    pub fn merge(&mut self, other: &Statistics) {
        for (name, value) in other.iter() {
            self.add(name, value);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn is_empty(&self) -> bool {
        self.values.values().all(|v| *v == 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_status_roundtrip() {
        for status in &[
            SessionStatus::Running,
            SessionStatus::Completed,
            SessionStatus::Interrupted,
            SessionStatus::Failed,
        ] {
            let parsed = SessionStatus::from_db_string(status.to_db_string());
            assert_eq!(Some(*status), parsed);
        }
        assert_eq!(SessionStatus::from_db_string("invalid"), None);
    }

    #[test]
    fn test_statistics_merge() {
        let mut total = Statistics::new();
        total.add(metrics::SUCCESSFUL_DOWNLOADS, 2.0);

        let mut delta = Statistics::new();
        delta.add(metrics::SUCCESSFUL_DOWNLOADS, 3.0);
        delta.add(metrics::MB_DOWNLOADED, 1.5);

        total.merge(&delta);
        assert_eq!(total.get(metrics::SUCCESSFUL_DOWNLOADS), 5.0);
        assert_eq!(total.get(metrics::MB_DOWNLOADED), 1.5);
        assert_eq!(total.get(metrics::API_ERRORS), 0.0);
    }

    #[test]
    fn test_statistics_zero_values_are_empty() {
        let mut stats = Statistics::new();
        assert!(stats.is_empty());
        stats.set(metrics::API_ERRORS, 0.0);
        assert!(stats.is_empty());
        stats.add(metrics::API_ERRORS, 1.0);
        assert!(!stats.is_empty());
    }

    #[test]
    fn test_bytes_to_mb() {
        assert_eq!(bytes_to_mb(1024 * 1024), 1.0);
        assert_eq!(bytes_to_mb(0), 0.0);
    }
}
