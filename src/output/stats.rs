//! Statistics report from the progress database
//!
//! This module provides functionality for extracting and displaying mirror statistics from the
//! storage layer.

use crate::output::format_size;
use crate::state::DownloadStatus;
use crate::storage::{metrics, DownloadRecord, SessionRecord, Statistics, Storage};
use crate::MirrorError;
use std::collections::HashMap;
use std::fmt::Write;

/// Number of exhausted failures listed in the report
pub const FAILED_FILES_SHOWN: u32 = 10;

/// Mirror statistics summary
#[derive(Debug, Clone)]
pub struct MirrorStatistics {
    /// Durable counters
    pub statistics: Statistics,

    /// Count of downloads by status
    pub by_status: HashMap<DownloadStatus, u64>,

    /// Exhausted failures, most recent first
    pub failed_files: Vec<DownloadRecord>,

    pub latest_session: Option<SessionRecord>,
}

/// Loads statistics from storage
pub fn load_statistics(storage: &dyn Storage) -> Result<MirrorStatistics, MirrorError> {
    Ok(MirrorStatistics {
        statistics: storage.snapshot_statistics()?,
        by_status: storage.count_by_status()?,
        failed_files: storage.get_failed_downloads(FAILED_FILES_SHOWN)?,
        latest_session: storage.get_latest_session()?,
    })
}

/// Formats statistics for the terminal
pub fn format_statistics(stats: &MirrorStatistics) -> String {
    let counters = &stats.statistics;
    let mut out = String::new();

    let _ = writeln!(out, "=== Mirror Statistics ===\n");

    let _ = writeln!(out, "Overview:");
    let _ = writeln!(
        out,
        "  Total files discovered: {}",
        counters.get(metrics::TOTAL_FILES)
    );
    let _ = writeln!(
        out,
        "  Successful downloads: {}",
        counters.get(metrics::SUCCESSFUL_DOWNLOADS)
    );
    let _ = writeln!(
        out,
        "  Skipped (already present): {}",
        counters.get(metrics::SKIPPED_EXISTING)
    );
    let _ = writeln!(
        out,
        "  Failed downloads: {}",
        counters.get(metrics::FAILED_DOWNLOADS)
    );
    let _ = writeln!(out, "  API errors: {}", counters.get(metrics::API_ERRORS));
    let _ = writeln!(
        out,
        "  Data downloaded: {}",
        format_size(counters.get(metrics::MB_DOWNLOADED))
    );
    let _ = writeln!(
        out,
        "  Sites completed: {}",
        counters.get(metrics::SITES_COMPLETED)
    );
    let _ = writeln!(out);

    let total: u64 = stats.by_status.values().sum();
    let _ = writeln!(out, "Downloads by Status:");
    for status in DownloadStatus::all_statuses() {
        let count = stats.by_status.get(&status).copied().unwrap_or(0);
        let percentage = if total > 0 {
            (count as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        let _ = writeln!(out, "  {}: {} ({:.1}%)", status, count, percentage);
    }
    let _ = writeln!(out);

    if !stats.failed_files.is_empty() {
        let _ = writeln!(
            out,
            "Failed Files (first {}):",
            FAILED_FILES_SHOWN.min(stats.failed_files.len() as u32)
        );
        for record in &stats.failed_files {
            let _ = writeln!(
                out,
                "  - {}/{}/{} ({} attempts): {}",
                record.site_name,
                record.library_name,
                record.file_name,
                record.retry_count,
                record.error_message.as_deref().unwrap_or("unknown error")
            );
        }
        let _ = writeln!(out);
    }

    if let Some(session) = &stats.latest_session {
        let _ = writeln!(out, "Latest Session:");
        let _ = writeln!(out, "  Id: {} ({})", session.id, session.status);
        let _ = writeln!(out, "  Started: {}", session.started_at);
        if let Some(ended) = &session.ended_at {
            let _ = writeln!(out, "  Ended: {}", ended);
        }
        let _ = writeln!(
            out,
            "  Files processed: {} ({} downloaded, {} failed, {})",
            session.progress.files_processed,
            session.progress.files_downloaded,
            session.progress.files_failed,
            format_size(session.progress.mb_downloaded)
        );
    }

    out
}

/// Prints statistics to stdout
pub fn print_statistics(stats: &MirrorStatistics) {
    print!("{}", format_statistics(stats));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{NewDownload, Outcome, SqliteStorage};

    #[test]
    fn test_report_lists_failures_and_counts() {
        let storage = SqliteStorage::new_in_memory(1).unwrap();
        storage
            .register_site("Legal", "https://contoso.example.com/sites/legal")
            .unwrap();
        for name in ["contract.pdf", "memo.docx"] {
            storage
                .upsert_discovered(&NewDownload {
                    site_name: "Legal".to_string(),
                    library_name: "Documents".to_string(),
                    file_name: name.to_string(),
                    remote_id: format!("d/{}", name),
                    destination_path: format!("/out/Legal/Documents/{}", name),
                    size_bytes: Some(10),
                })
                .unwrap();
        }
        let claimed = storage.claim_next_downloadable(None).unwrap().unwrap();
        storage
            .record_outcome(
                claimed.id,
                &Outcome::Failed {
                    error: "HTTP 404".to_string(),
                    permanent: true,
                },
            )
            .unwrap();
        storage.create_session("hash").unwrap();

        let stats = load_statistics(&storage).unwrap();
        assert_eq!(stats.failed_files.len(), 1);
        assert_eq!(stats.by_status.get(&DownloadStatus::Discovered), Some(&1));

        let report = format_statistics(&stats);
        assert!(report.contains("Legal/Documents/contract.pdf (1 attempts): HTTP 404"));
        assert!(report.contains("discovered: 1 (50.0%)"));
        assert!(report.contains("Latest Session:"));
    }

    #[test]
    fn test_empty_database_report() {
        let storage = SqliteStorage::new_in_memory(3).unwrap();
        let report = format_statistics(&load_statistics(&storage).unwrap());
        assert!(report.contains("Total files discovered: 0"));
        assert!(!report.contains("Failed Files"));
        assert!(!report.contains("Latest Session"));
    }
}
