//! Statistics aggregation
//!
//! Workers and discovery report events here. Counters are buffered in memory and merged into
//! the durable statistics table when enough events accumulate, when the progress timer fires
//! and at shutdown.

use crate::storage::{bytes_to_mb, metrics, SessionProgress, Statistics, Storage, StorageResult};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Something worth counting
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StatEvent {
    /// New download records created by discovery
    FilesDiscovered(u64),
    Downloaded { bytes: u64 },
    /// Destination already held the file; counted as a success without a transfer
    SkippedExisting { bytes: u64 },
    /// Failed attempt that will be retried
    AttemptFailed,
    /// Failure that used up the retry budget
    FailedTerminal,
    ApiError,
    SiteCompleted,
}

#[derive(Default)]
struct Pending {
    delta: Statistics,
    events: u64,
}

/// Buffers counters and persists them in batches
pub struct StatisticsAggregator {
    storage: Arc<dyn Storage>,
    pending: Mutex<Pending>,
    session: Mutex<SessionProgress>,
    flush_threshold: u64,
}

impl StatisticsAggregator {
    pub fn new(storage: Arc<dyn Storage>, flush_threshold: u64) -> Self {
        Self {
            storage,
            pending: Mutex::new(Pending::default()),
            session: Mutex::new(SessionProgress::default()),
            flush_threshold: flush_threshold.max(1),
        }
    }

    /// Records an event, flushing if the buffer is full
    pub fn record(&self, event: StatEvent) -> StorageResult<()> {
        let due = {
            let mut pending = self.pending.lock();
            let delta = &mut pending.delta;
            match event {
                StatEvent::FilesDiscovered(count) => delta.add(metrics::TOTAL_FILES, count as f64),
                StatEvent::Downloaded { bytes } => {
                    delta.add(metrics::SUCCESSFUL_DOWNLOADS, 1.0);
                    delta.add(metrics::MB_DOWNLOADED, bytes_to_mb(bytes));
                }
                StatEvent::SkippedExisting { bytes } => {
                    delta.add(metrics::SKIPPED_EXISTING, 1.0);
                    delta.add(metrics::SUCCESSFUL_DOWNLOADS, 1.0);
                    delta.add(metrics::MB_DOWNLOADED, bytes_to_mb(bytes));
                }
                StatEvent::AttemptFailed => {}
                StatEvent::FailedTerminal => delta.add(metrics::FAILED_DOWNLOADS, 1.0),
                StatEvent::ApiError => delta.add(metrics::API_ERRORS, 1.0),
                StatEvent::SiteCompleted => delta.add(metrics::SITES_COMPLETED, 1.0),
            }
            pending.events += 1;
            pending.events >= self.flush_threshold
        };

        {
            let mut session = self.session.lock();
            match event {
                StatEvent::Downloaded { bytes } | StatEvent::SkippedExisting { bytes } => {
                    session.files_processed += 1;
                    session.files_downloaded += 1;
                    session.mb_downloaded += bytes_to_mb(bytes);
                }
                StatEvent::AttemptFailed => session.files_processed += 1,
                StatEvent::FailedTerminal => {
                    session.files_processed += 1;
                    session.files_failed += 1;
                }
                _ => {}
            }
        }

        if due {
            self.flush()?;
        }
        Ok(())
    }

    /// Merges buffered counters into storage and returns how many events were flushed
    ///
    /// On failure the buffer is kept for the next attempt.
    pub fn flush(&self) -> StorageResult<u64> {
        let mut pending = self.pending.lock();
        if pending.events == 0 {
            return Ok(0);
        }
        self.storage.merge_statistics(&pending.delta)?;
        let flushed = pending.events;
        *pending = Pending::default();
        debug!("Flushed {} statistics events", flushed);
        Ok(flushed)
    }

    /// Durable counters plus everything still buffered
    pub fn snapshot(&self) -> StorageResult<Statistics> {
        let pending = self.pending.lock();
        let mut stats = self.storage.snapshot_statistics()?;
        stats.merge(&pending.delta);
        Ok(stats)
    }

    /// Counters for the current session only
    pub fn session_progress(&self) -> SessionProgress {
        *self.session.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStorage;

    fn aggregator(threshold: u64) -> (Arc<SqliteStorage>, StatisticsAggregator) {
        let storage = Arc::new(SqliteStorage::new_in_memory(3).unwrap());
        let stats = StatisticsAggregator::new(storage.clone(), threshold);
        (storage, stats)
    }

    #[test]
    fn test_snapshot_includes_pending() {
        let (storage, stats) = aggregator(100);
        stats.record(StatEvent::ApiError).unwrap();
        stats.record(StatEvent::ApiError).unwrap();

        assert_eq!(
            storage.snapshot_statistics().unwrap().get(metrics::API_ERRORS),
            0.0
        );
        assert_eq!(stats.snapshot().unwrap().get(metrics::API_ERRORS), 2.0);
    }

    #[test]
    fn test_flushes_at_threshold() {
        let (storage, stats) = aggregator(3);
        stats.record(StatEvent::FilesDiscovered(10)).unwrap();
        stats.record(StatEvent::Downloaded { bytes: 1024 * 1024 }).unwrap();
        assert_eq!(
            storage.snapshot_statistics().unwrap().get(metrics::TOTAL_FILES),
            0.0
        );

        stats.record(StatEvent::FailedTerminal).unwrap();
        let durable = storage.snapshot_statistics().unwrap();
        assert_eq!(durable.get(metrics::TOTAL_FILES), 10.0);
        assert_eq!(durable.get(metrics::SUCCESSFUL_DOWNLOADS), 1.0);
        assert_eq!(durable.get(metrics::MB_DOWNLOADED), 1.0);
        assert_eq!(durable.get(metrics::FAILED_DOWNLOADS), 1.0);
        assert_eq!(stats.flush().unwrap(), 0);
    }

    #[test]
    fn test_skip_counts_as_success() {
        let (_storage, stats) = aggregator(100);
        stats
            .record(StatEvent::SkippedExisting { bytes: 2048 })
            .unwrap();

        let snapshot = stats.snapshot().unwrap();
        assert_eq!(snapshot.get(metrics::SKIPPED_EXISTING), 1.0);
        assert_eq!(snapshot.get(metrics::SUCCESSFUL_DOWNLOADS), 1.0);
    }

    #[test]
    fn test_session_progress() {
        let (_storage, stats) = aggregator(100);
        stats.record(StatEvent::Downloaded { bytes: 1024 * 1024 }).unwrap();
        stats.record(StatEvent::AttemptFailed).unwrap();
        stats.record(StatEvent::FailedTerminal).unwrap();
        stats.record(StatEvent::ApiError).unwrap();

        let progress = stats.session_progress();
        assert_eq!(progress.files_processed, 3);
        assert_eq!(progress.files_downloaded, 1);
        assert_eq!(progress.files_failed, 1);
        assert_eq!(progress.mb_downloaded, 1.0);
    }
}
