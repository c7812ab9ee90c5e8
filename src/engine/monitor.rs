//! Site completion monitor

use crate::engine::stats::{StatEvent, StatisticsAggregator};
use crate::state::SiteStatus;
use crate::storage::{SiteAggregate, Storage};
use crate::MirrorError;
use std::sync::Arc;
use tracing::{info, warn};

/// Promotes sites to a terminal status once every file is terminal
///
/// Evaluation is idempotent; it is safe to call after every outcome.
pub struct SiteCompletionMonitor {
    storage: Arc<dyn Storage>,
    stats: Arc<StatisticsAggregator>,
}

impl SiteCompletionMonitor {
    pub fn new(storage: Arc<dyn Storage>, stats: Arc<StatisticsAggregator>) -> Self {
        Self { storage, stats }
    }

    pub fn evaluate(&self, site: &str) -> Result<SiteAggregate, MirrorError> {
        let aggregate = self.storage.recompute_site_aggregate(site)?;

        if aggregate.became_terminal {
            match aggregate.status {
                SiteStatus::Completed => info!(
                    "Site {} completed: {} files",
                    site, aggregate.completed_files
                ),
                SiteStatus::CompletedWithErrors => warn!(
                    "Site {} completed with errors: {}/{} files, {} failed",
                    site, aggregate.completed_files, aggregate.total_files, aggregate.failed_files
                ),
                _ => {}
            }
            self.stats.record(StatEvent::SiteCompleted)?;
        }

        Ok(aggregate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{metrics, NewDownload, Outcome, SqliteStorage};

    #[test]
    fn test_site_counted_once() {
        let storage = Arc::new(SqliteStorage::new_in_memory(3).unwrap());
        storage
            .register_site("HR", "https://contoso.example.com/sites/hr")
            .unwrap();
        storage
            .upsert_discovered(&NewDownload {
                site_name: "HR".to_string(),
                library_name: "Documents".to_string(),
                file_name: "a.txt".to_string(),
                remote_id: "d/a".to_string(),
                destination_path: "/tmp/out/HR/Documents/a.txt".to_string(),
                size_bytes: Some(1),
            })
            .unwrap();

        let stats = Arc::new(StatisticsAggregator::new(storage.clone(), 100));
        let monitor = SiteCompletionMonitor::new(storage.clone(), stats.clone());

        assert_eq!(monitor.evaluate("HR").unwrap().status, SiteStatus::Processing);

        let claimed = storage.claim_next_downloadable(None).unwrap().unwrap();
        storage
            .record_outcome(claimed.id, &Outcome::Completed { bytes_written: 1 })
            .unwrap();

        // Every row is done, but the listing has not been confirmed complete
        assert_eq!(monitor.evaluate("HR").unwrap().status, SiteStatus::Processing);

        storage.mark_site_discovered("HR").unwrap();
        let aggregate = monitor.evaluate("HR").unwrap();
        assert_eq!(aggregate.status, SiteStatus::Completed);
        assert!(aggregate.became_terminal);
        monitor.evaluate("HR").unwrap();

        assert_eq!(stats.snapshot().unwrap().get(metrics::SITES_COMPLETED), 1.0);
    }

    #[test]
    fn test_unknown_site_is_an_error() {
        let storage = Arc::new(SqliteStorage::new_in_memory(3).unwrap());
        let stats = Arc::new(StatisticsAggregator::new(storage.clone(), 100));
        let monitor = SiteCompletionMonitor::new(storage, stats);

        assert!(matches!(
            monitor.evaluate("Nope"),
            Err(MirrorError::Storage(_))
        ));
    }
}
