//! SQLite storage implementation
//!
//! This module provides a SQLite-based implementation of the Storage trait. A single connection
//! lives behind a mutex and every state transition runs in an IMMEDIATE transaction, so concurrent
//! workers never observe or produce a half-applied change.

use crate::state::{DownloadStatus, SiteStatus};
use crate::storage::schema::initialize_schema;
use crate::storage::traits::{Storage, StorageError, StorageResult};
use crate::storage::{
    bytes_to_mb, metrics, DownloadRecord, NewDownload, Outcome, PendingWork, RecentActivity,
    SessionProgress, SessionRecord, SessionStatus, SiteAggregate, SiteRecord, Statistics,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, DatabaseName, OptionalExtension, Row, TransactionBehavior};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const DOWNLOAD_COLUMNS: &str = "id, site_name, library_name, file_name, remote_id, destination_path,
     size_bytes, size_mb, status, retry_count, error_message, discovered_at, last_attempt_at,
     completed_at";

const SITE_COLUMNS: &str = "name, source_url, status, total_files, completed_files, failed_files,
     started_at, completed_at, last_error, last_updated, discovery_complete";

const SESSION_COLUMNS: &str = "id, started_at, ended_at, status, config_hash, files_processed,
     files_downloaded, files_failed, mb_downloaded";

const BACKUP_PREFIX: &str = "progress_backup_";

/// SQLite storage backend
pub struct SqliteStorage {
    conn: Mutex<Connection>,
    max_retry: u32,
}

impl SqliteStorage {
    /// Creates a new SqliteStorage instance
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file
    /// * `max_retry` - Attempts after which a failed download becomes terminal
    pub fn new(path: &Path, max_retry: u32) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA temp_store = MEMORY;
            PRAGMA busy_timeout = 5000;
        ",
        )?;

        initialize_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            max_retry,
        })
    }

    /// Creates an in-memory database (for testing)
    #[cfg(test)]
    pub fn new_in_memory(max_retry: u32) -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            max_retry,
        })
    }
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn row_to_download(row: &Row<'_>) -> rusqlite::Result<DownloadRecord> {
    let status: String = row.get(8)?;
    Ok(DownloadRecord {
        id: row.get(0)?,
        site_name: row.get(1)?,
        library_name: row.get(2)?,
        file_name: row.get(3)?,
        remote_id: row.get(4)?,
        destination_path: row.get(5)?,
        size_bytes: row.get::<_, Option<i64>>(6)?.map(|b| b.max(0) as u64),
        size_mb: row.get(7)?,
        status: DownloadStatus::from_db_string(&status).unwrap_or(DownloadStatus::Failed),
        retry_count: row.get(9)?,
        error_message: row.get(10)?,
        discovered_at: row.get(11)?,
        last_attempt_at: row.get(12)?,
        completed_at: row.get(13)?,
    })
}

fn row_to_site(row: &Row<'_>) -> rusqlite::Result<SiteRecord> {
    let status: String = row.get(2)?;
    Ok(SiteRecord {
        name: row.get(0)?,
        source_url: row.get(1)?,
        status: SiteStatus::from_db_string(&status).unwrap_or(SiteStatus::Pending),
        total_files: row.get::<_, i64>(3)? as u64,
        completed_files: row.get::<_, i64>(4)? as u64,
        failed_files: row.get::<_, i64>(5)? as u64,
        started_at: row.get(6)?,
        completed_at: row.get(7)?,
        last_error: row.get(8)?,
        last_updated: row.get(9)?,
        discovery_complete: row.get(10)?,
    })
}

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
    let status: String = row.get(3)?;
    Ok(SessionRecord {
        id: row.get(0)?,
        started_at: row.get(1)?,
        ended_at: row.get(2)?,
        status: SessionStatus::from_db_string(&status).unwrap_or(SessionStatus::Interrupted),
        config_hash: row.get(4)?,
        progress: SessionProgress {
            files_processed: row.get::<_, i64>(5)? as u64,
            files_downloaded: row.get::<_, i64>(6)? as u64,
            files_failed: row.get::<_, i64>(7)? as u64,
            mb_downloaded: row.get(8)?,
        },
    })
}

fn fetch_download(conn: &Connection, id: i64) -> StorageResult<DownloadRecord> {
    conn.query_row(
        &format!("SELECT {} FROM downloads WHERE id = ?1", DOWNLOAD_COLUMNS),
        params![id],
        row_to_download,
    )
    .optional()?
    .ok_or(StorageError::DownloadNotFound(id))
}

fn fetch_site(conn: &Connection, name: &str) -> StorageResult<Option<SiteRecord>> {
    let site = conn
        .query_row(
            &format!("SELECT {} FROM sites WHERE name = ?1", SITE_COLUMNS),
            params![name],
            row_to_site,
        )
        .optional()?;
    Ok(site)
}

fn require_site(conn: &Connection, name: &str) -> StorageResult<SiteRecord> {
    fetch_site(conn, name)?.ok_or_else(|| StorageError::SiteNotFound(name.to_string()))
}

/// Status a claimed record returns to when its attempt is abandoned
fn released_status(retry_count: u32) -> DownloadStatus {
    if retry_count == 0 {
        DownloadStatus::Discovered
    } else {
        DownloadStatus::Failed
    }
}

fn insert_discovered(conn: &Connection, file: &NewDownload) -> rusqlite::Result<usize> {
    let size_mb = file.size_bytes.map(bytes_to_mb).unwrap_or(0.0);
    conn.execute(
        "INSERT OR IGNORE INTO downloads
         (site_name, library_name, file_name, remote_id, destination_path, size_bytes, size_mb,
          status, retry_count, discovered_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9)",
        params![
            file.site_name,
            file.library_name,
            file.file_name,
            file.remote_id,
            file.destination_path,
            file.size_bytes.map(|b| b as i64),
            size_mb,
            DownloadStatus::Discovered.to_db_string(),
            now(),
        ],
    )
}

impl Storage for SqliteStorage {
    fn max_retry(&self) -> u32 {
        self.max_retry
    }

    // ===== Session Management =====

    fn create_session(&self, config_hash: &str) -> StorageResult<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sessions (started_at, status, config_hash) VALUES (?1, ?2, ?3)",
            params![now(), SessionStatus::Running.to_db_string(), config_hash],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn get_session(&self, session_id: i64) -> StorageResult<SessionRecord> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLUMNS),
            params![session_id],
            row_to_session,
        )
        .optional()?
        .ok_or(StorageError::SessionNotFound(session_id))
    }

    fn get_latest_session(&self) -> StorageResult<Option<SessionRecord>> {
        let conn = self.conn.lock();
        let session = conn
            .query_row(
                &format!(
                    "SELECT {} FROM sessions ORDER BY id DESC LIMIT 1",
                    SESSION_COLUMNS
                ),
                [],
                row_to_session,
            )
            .optional()?;
        Ok(session)
    }

    fn update_session_progress(
        &self,
        session_id: i64,
        progress: &SessionProgress,
    ) -> StorageResult<()> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE sessions SET files_processed = ?1, files_downloaded = ?2, files_failed = ?3,
             mb_downloaded = ?4 WHERE id = ?5",
            params![
                progress.files_processed as i64,
                progress.files_downloaded as i64,
                progress.files_failed as i64,
                progress.mb_downloaded,
                session_id
            ],
        )?;
        if updated == 0 {
            return Err(StorageError::SessionNotFound(session_id));
        }
        Ok(())
    }

    fn close_session(
        &self,
        session_id: i64,
        status: SessionStatus,
        progress: &SessionProgress,
    ) -> StorageResult<()> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE sessions SET status = ?1, ended_at = ?2, files_processed = ?3,
             files_downloaded = ?4, files_failed = ?5, mb_downloaded = ?6 WHERE id = ?7",
            params![
                status.to_db_string(),
                now(),
                progress.files_processed as i64,
                progress.files_downloaded as i64,
                progress.files_failed as i64,
                progress.mb_downloaded,
                session_id
            ],
        )?;
        if updated == 0 {
            return Err(StorageError::SessionNotFound(session_id));
        }
        Ok(())
    }

    fn close_stale_sessions(&self) -> StorageResult<Vec<i64>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let ids = {
            let mut stmt = tx.prepare("SELECT id FROM sessions WHERE status = ?1 ORDER BY id")?;
            let ids = stmt
                .query_map(params![SessionStatus::Running.to_db_string()], |row| {
                    row.get::<_, i64>(0)
                })?
                .collect::<Result<Vec<_>, _>>()?;
            ids
        };

        tx.execute(
            "UPDATE sessions SET status = ?1, ended_at = ?2 WHERE status = ?3",
            params![
                SessionStatus::Interrupted.to_db_string(),
                now(),
                SessionStatus::Running.to_db_string()
            ],
        )?;
        tx.commit()?;

        Ok(ids)
    }

    // ===== Site Management =====

    fn register_site(&self, name: &str, source_url: &str) -> StorageResult<SiteRecord> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sites (name, source_url, status, last_updated) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(name) DO UPDATE SET source_url = excluded.source_url,
                 discovery_complete = CASE WHEN status IN (?5, ?6, ?7)
                                           THEN discovery_complete ELSE 0 END",
            params![
                name,
                source_url,
                SiteStatus::Pending.to_db_string(),
                now(),
                SiteStatus::Completed.to_db_string(),
                SiteStatus::CompletedWithErrors.to_db_string(),
                SiteStatus::Empty.to_db_string()
            ],
        )?;
        require_site(&conn, name)
    }

    fn get_site(&self, name: &str) -> StorageResult<Option<SiteRecord>> {
        let conn = self.conn.lock();
        fetch_site(&conn, name)
    }

    fn get_site_status(&self, name: Option<&str>) -> StorageResult<Vec<SiteRecord>> {
        let conn = self.conn.lock();
        match name {
            Some(name) => Ok(vec![require_site(&conn, name)?]),
            None => {
                let mut stmt =
                    conn.prepare(&format!("SELECT {} FROM sites ORDER BY name", SITE_COLUMNS))?;
                let sites = stmt
                    .query_map([], row_to_site)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(sites)
            }
        }
    }

    fn mark_site_processing(&self, name: &str) -> StorageResult<()> {
        let conn = self.conn.lock();
        let site = require_site(&conn, name)?;
        if site.status.is_terminal() {
            return Ok(());
        }
        conn.execute(
            "UPDATE sites SET status = ?1, last_error = NULL, discovery_complete = 0,
             last_updated = ?2 WHERE name = ?3",
            params![SiteStatus::Processing.to_db_string(), now(), name],
        )?;
        Ok(())
    }

    fn mark_site_discovered(&self, name: &str) -> StorageResult<()> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE sites SET discovery_complete = 1, last_updated = ?1 WHERE name = ?2",
            params![now(), name],
        )?;
        if updated == 0 {
            return Err(StorageError::SiteNotFound(name.to_string()));
        }
        Ok(())
    }

    fn mark_site_empty(&self, name: &str) -> StorageResult<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let site = require_site(&tx, name)?;
        let records: i64 = tx.query_row(
            "SELECT COUNT(*) FROM downloads WHERE site_name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        if records > 0 || site.status.is_terminal() {
            return Ok(false);
        }

        let ts = now();
        tx.execute(
            "UPDATE sites SET status = ?1, total_files = 0, completed_files = 0, failed_files = 0,
             last_error = NULL, discovery_complete = 1, completed_at = ?2, last_updated = ?2
             WHERE name = ?3",
            params![SiteStatus::Empty.to_db_string(), ts, name],
        )?;
        tx.commit()?;
        Ok(true)
    }

    fn mark_site_stalled(&self, name: &str, error: &str) -> StorageResult<()> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE sites SET last_error = ?1, last_updated = ?2 WHERE name = ?3",
            params![error, now(), name],
        )?;
        if updated == 0 {
            return Err(StorageError::SiteNotFound(name.to_string()));
        }
        Ok(())
    }

    fn reset_site(&self, name: &str) -> StorageResult<u64> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let site = require_site(&tx, name)?;
        let (total, successful, failed, mb): (i64, i64, i64, f64) = tx.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN status = ?1 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = ?2 AND retry_count >= ?3 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = ?1 THEN size_mb ELSE 0 END), 0)
             FROM downloads WHERE site_name = ?4",
            params![
                DownloadStatus::Completed.to_db_string(),
                DownloadStatus::Failed.to_db_string(),
                self.max_retry,
                name
            ],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;
        let sites_completed = match site.status {
            SiteStatus::Completed | SiteStatus::CompletedWithErrors => 1.0,
            _ => 0.0,
        };

        // Withdraw the removed rows from the durable counters
        let ts = now();
        let withdrawn = [
            (metrics::TOTAL_FILES, total as f64),
            (metrics::SUCCESSFUL_DOWNLOADS, successful as f64),
            (metrics::FAILED_DOWNLOADS, failed as f64),
            (metrics::MB_DOWNLOADED, mb),
            (metrics::SITES_COMPLETED, sites_completed),
        ];
        for (stat, value) in withdrawn {
            if value == 0.0 {
                continue;
            }
            tx.execute(
                "UPDATE statistics SET stat_value = MAX(stat_value - ?1, 0), last_updated = ?2
                 WHERE stat_name = ?3",
                params![value, ts, stat],
            )?;
        }

        let removed = tx.execute("DELETE FROM downloads WHERE site_name = ?1", params![name])?;
        tx.execute(
            "UPDATE sites SET status = ?1, total_files = 0, completed_files = 0, failed_files = 0,
             started_at = NULL, completed_at = NULL, last_error = NULL, discovery_complete = 0,
             last_updated = ?2 WHERE name = ?3",
            params![SiteStatus::Pending.to_db_string(), ts, name],
        )?;
        tx.commit()?;

        info!("Reset site {}: removed {} download records", name, removed);
        Ok(removed as u64)
    }

    fn recompute_site_aggregate(&self, name: &str) -> StorageResult<SiteAggregate> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let site = require_site(&tx, name)?;
        let (total, completed, failed): (i64, i64, i64) = tx.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN status = ?2 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = ?3 AND retry_count >= ?4 THEN 1 ELSE 0 END), 0)
             FROM downloads WHERE site_name = ?1",
            params![
                name,
                DownloadStatus::Completed.to_db_string(),
                DownloadStatus::Failed.to_db_string(),
                self.max_retry
            ],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        if site.status.is_terminal() {
            return Ok(SiteAggregate {
                status: site.status,
                total_files: site.total_files,
                completed_files: site.completed_files,
                failed_files: site.failed_files,
                became_terminal: false,
            });
        }

        let (total, completed, failed) = (total as u64, completed as u64, failed as u64);
        let status = SiteStatus::derive(
            site.status,
            site.discovery_complete,
            total,
            completed,
            failed,
        );
        let became_terminal = status.is_terminal();
        let ts = now();

        tx.execute(
            "UPDATE sites SET status = ?1, total_files = ?2, completed_files = ?3, failed_files = ?4,
             completed_at = CASE WHEN ?5 THEN ?6 ELSE completed_at END, last_updated = ?6
             WHERE name = ?7",
            params![
                status.to_db_string(),
                total as i64,
                completed as i64,
                failed as i64,
                became_terminal,
                ts,
                name
            ],
        )?;
        tx.commit()?;

        Ok(SiteAggregate {
            status,
            total_files: total,
            completed_files: completed,
            failed_files: failed,
            became_terminal,
        })
    }

    // ===== Download Management =====

    fn upsert_discovered(&self, file: &NewDownload) -> StorageResult<DownloadRecord> {
        let conn = self.conn.lock();
        insert_discovered(&conn, file)?;
        let record = conn.query_row(
            &format!(
                "SELECT {} FROM downloads
                 WHERE site_name = ?1 AND library_name = ?2 AND file_name = ?3",
                DOWNLOAD_COLUMNS
            ),
            params![file.site_name, file.library_name, file.file_name],
            row_to_download,
        )?;
        Ok(record)
    }

    fn upsert_discovered_batch(&self, files: &[NewDownload]) -> StorageResult<u64> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut inserted = 0u64;
        for file in files {
            inserted += insert_discovered(&tx, file)? as u64;
        }
        tx.commit()?;

        debug!(
            "Upserted {} discovered files ({} new)",
            files.len(),
            inserted
        );
        Ok(inserted)
    }

    fn get_download(&self, id: i64) -> StorageResult<DownloadRecord> {
        let conn = self.conn.lock();
        fetch_download(&conn, id)
    }

    fn get_downloads_for_site(&self, site: &str) -> StorageResult<Vec<DownloadRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM downloads WHERE site_name = ?1 ORDER BY id",
            DOWNLOAD_COLUMNS
        ))?;
        let records = stmt
            .query_map(params![site], row_to_download)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn claim_next_downloadable(
        &self,
        site_filter: Option<&str>,
    ) -> StorageResult<Option<DownloadRecord>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let candidate = tx
            .query_row(
                &format!(
                    "SELECT {} FROM downloads
                     WHERE (status = ?1 OR (status = ?2 AND retry_count < ?3))
                       AND (?4 IS NULL OR site_name = ?4)
                     ORDER BY CASE status WHEN ?1 THEN 0 ELSE 1 END, id
                     LIMIT 1",
                    DOWNLOAD_COLUMNS
                ),
                params![
                    DownloadStatus::Discovered.to_db_string(),
                    DownloadStatus::Failed.to_db_string(),
                    self.max_retry,
                    site_filter
                ],
                row_to_download,
            )
            .optional()?;

        let mut record = match candidate {
            Some(record) => record,
            None => return Ok(None),
        };

        let ts = now();
        tx.execute(
            "UPDATE downloads SET status = ?1, last_attempt_at = ?2 WHERE id = ?3",
            params![DownloadStatus::Downloading.to_db_string(), ts, record.id],
        )?;
        tx.execute(
            "UPDATE sites SET started_at = COALESCE(started_at, ?1), last_updated = ?1
             WHERE name = ?2",
            params![ts, record.site_name],
        )?;
        tx.commit()?;

        record.status = DownloadStatus::Downloading;
        record.last_attempt_at = Some(ts);
        Ok(Some(record))
    }

    fn record_outcome(&self, id: i64, outcome: &Outcome) -> StorageResult<DownloadRecord> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let record = fetch_download(&tx, id)?;
        let target = match outcome {
            Outcome::Completed { .. } => DownloadStatus::Completed,
            Outcome::Failed { .. } => DownloadStatus::Failed,
        };
        if record.status != DownloadStatus::Downloading {
            return Err(StorageError::InvalidTransition {
                id,
                from: record.status,
                to: target,
            });
        }

        match outcome {
            Outcome::Completed { bytes_written } => {
                tx.execute(
                    "UPDATE downloads SET status = ?1, size_bytes = ?2, size_mb = ?3,
                     completed_at = ?4, error_message = NULL WHERE id = ?5",
                    params![
                        target.to_db_string(),
                        *bytes_written as i64,
                        bytes_to_mb(*bytes_written),
                        now(),
                        id
                    ],
                )?;
            }
            Outcome::Failed { error, permanent } => {
                let retry_count = if *permanent {
                    self.max_retry
                } else {
                    (record.retry_count + 1).min(self.max_retry)
                };
                tx.execute(
                    "UPDATE downloads SET status = ?1, retry_count = ?2, error_message = ?3
                     WHERE id = ?4",
                    params![target.to_db_string(), retry_count, error, id],
                )?;
            }
        }

        let updated = fetch_download(&tx, id)?;
        tx.commit()?;
        Ok(updated)
    }

    fn release_claim(&self, id: i64) -> StorageResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let record = fetch_download(&tx, id)?;
        let target = released_status(record.retry_count);
        if record.status != DownloadStatus::Downloading {
            return Err(StorageError::InvalidTransition {
                id,
                from: record.status,
                to: target,
            });
        }

        tx.execute(
            "UPDATE downloads SET status = ?1 WHERE id = ?2",
            params![target.to_db_string(), id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn recover_interrupted(&self) -> StorageResult<Vec<DownloadRecord>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut records = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM downloads WHERE status = ?1 ORDER BY id",
                DOWNLOAD_COLUMNS
            ))?;
            let records = stmt
                .query_map(
                    params![DownloadStatus::Downloading.to_db_string()],
                    row_to_download,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            records
        };

        for record in &mut records {
            let target = released_status(record.retry_count);
            tx.execute(
                "UPDATE downloads SET status = ?1 WHERE id = ?2",
                params![target.to_db_string(), record.id],
            )?;
            record.status = target;
        }
        tx.commit()?;

        if !records.is_empty() {
            warn!(
                "Recovered {} downloads interrupted by a previous run",
                records.len()
            );
        }
        Ok(records)
    }

    fn pending_work(&self) -> StorageResult<PendingWork> {
        let conn = self.conn.lock();
        let (claimable, in_flight): (i64, i64) = conn.query_row(
            "SELECT
                COALESCE(SUM(CASE WHEN status = ?1 OR (status = ?2 AND retry_count < ?3)
                             THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = ?4 THEN 1 ELSE 0 END), 0)
             FROM downloads",
            params![
                DownloadStatus::Discovered.to_db_string(),
                DownloadStatus::Failed.to_db_string(),
                self.max_retry,
                DownloadStatus::Downloading.to_db_string()
            ],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(PendingWork {
            claimable: claimable as u64,
            in_flight: in_flight as u64,
        })
    }

    // ===== Statistics =====

    fn snapshot_statistics(&self) -> StorageResult<Statistics> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT stat_name, stat_value FROM statistics")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?;

        let mut stats = Statistics::new();
        for row in rows {
            let (name, value) = row?;
            stats.set(&name, value);
        }
        Ok(stats)
    }

    fn merge_statistics(&self, delta: &Statistics) -> StorageResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let ts = now();
        for (name, value) in delta.iter() {
            tx.execute(
                "INSERT INTO statistics (stat_name, stat_value, last_updated) VALUES (?1, ?2, ?3)
                 ON CONFLICT(stat_name) DO UPDATE
                 SET stat_value = stat_value + excluded.stat_value, last_updated = excluded.last_updated",
                params![name, value, ts],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn rebuild_statistics(&self) -> StorageResult<Statistics> {
        {
            let mut conn = self.conn.lock();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let (total, successful, failed, mb): (i64, i64, i64, f64) = tx.query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(CASE WHEN status = ?1 THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN status = ?2 AND retry_count >= ?3 THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN status = ?1 THEN size_mb ELSE 0 END), 0)
                 FROM downloads",
                params![
                    DownloadStatus::Completed.to_db_string(),
                    DownloadStatus::Failed.to_db_string(),
                    self.max_retry
                ],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )?;
            let sites_completed: i64 = tx.query_row(
                "SELECT COUNT(*) FROM sites WHERE status IN (?1, ?2)",
                params![
                    SiteStatus::Completed.to_db_string(),
                    SiteStatus::CompletedWithErrors.to_db_string()
                ],
                |row| row.get(0),
            )?;

            let ts = now();
            let derived = [
                (metrics::TOTAL_FILES, total as f64),
                (metrics::SUCCESSFUL_DOWNLOADS, successful as f64),
                (metrics::FAILED_DOWNLOADS, failed as f64),
                (metrics::MB_DOWNLOADED, mb),
                (metrics::SITES_COMPLETED, sites_completed as f64),
            ];
            for (name, value) in derived {
                tx.execute(
                    "INSERT INTO statistics (stat_name, stat_value, last_updated) VALUES (?1, ?2, ?3)
                     ON CONFLICT(stat_name) DO UPDATE
                     SET stat_value = excluded.stat_value, last_updated = excluded.last_updated",
                    params![name, value, ts],
                )?;
            }
            tx.commit()?;
        }

        info!("Statistics recalculated from database");
        self.snapshot_statistics()
    }

    fn count_by_status(&self) -> StorageResult<HashMap<DownloadStatus, u64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM downloads GROUP BY status")?;

        let mut counts = HashMap::new();
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            if let Some(status) = DownloadStatus::from_db_string(&status) {
                counts.insert(status, count as u64);
            }
        }
        Ok(counts)
    }

    fn get_failed_downloads(&self, limit: u32) -> StorageResult<Vec<DownloadRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM downloads WHERE status = ?1 AND retry_count >= ?2
             ORDER BY last_attempt_at DESC, id LIMIT ?3",
            DOWNLOAD_COLUMNS
        ))?;
        let records = stmt
            .query_map(
                params![DownloadStatus::Failed.to_db_string(), self.max_retry, limit],
                row_to_download,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn recent_activity(
        &self,
        completed_since: DateTime<Utc>,
        failed_since: DateTime<Utc>,
        failure_limit: u32,
    ) -> StorageResult<RecentActivity> {
        let conn = self.conn.lock();
        let (completed, in_flight): (i64, i64) = conn.query_row(
            "SELECT
                COALESCE(SUM(CASE WHEN status = ?1 AND completed_at >= ?2 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = ?3 THEN 1 ELSE 0 END), 0)
             FROM downloads",
            params![
                DownloadStatus::Completed.to_db_string(),
                completed_since.to_rfc3339(),
                DownloadStatus::Downloading.to_db_string()
            ],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM downloads WHERE status = ?1 AND last_attempt_at >= ?2
             ORDER BY last_attempt_at DESC, id LIMIT ?3",
            DOWNLOAD_COLUMNS
        ))?;
        let failures = stmt
            .query_map(
                params![
                    DownloadStatus::Failed.to_db_string(),
                    failed_since.to_rfc3339(),
                    failure_limit
                ],
                row_to_download,
            )?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(RecentActivity {
            completed: completed as u64,
            in_flight: in_flight as u64,
            failures,
        })
    }

    // ===== Backup =====

    fn backup(&self, backup_dir: &Path, keep: usize) -> StorageResult<PathBuf> {
        fs::create_dir_all(backup_dir)?;
        let file_name = format!(
            "{}{}.db",
            BACKUP_PREFIX,
            Utc::now().format("%Y%m%d_%H%M%S_%3f")
        );
        let path = backup_dir.join(file_name);

        {
            let conn = self.conn.lock();
            conn.backup(DatabaseName::Main, &path, None)?;
        }
        info!("Database backed up to {}", path.display());

        rotate_backups(backup_dir, keep)?;
        Ok(path)
    }
}

/// Removes all but the newest `keep` backups in `dir`
fn rotate_backups(dir: &Path, keep: usize) -> StorageResult<()> {
    let mut backups: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(BACKUP_PREFIX) && n.ends_with(".db"))
                .unwrap_or(false)
        })
        .collect();

    // Timestamped names sort chronologically
    backups.sort();

    let excess = backups.len().saturating_sub(keep);
    for old in backups.into_iter().take(excess) {
        debug!("Removing old backup {}", old.display());
        fs::remove_file(&old)?;
    }
    Ok(())
}
