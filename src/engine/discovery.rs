//! Discovery stage
//!
//! For every site that still needs it, lists libraries and files through the content source
//! and records one download per file. Enumeration failures are retried; a site that keeps
//! failing is left `processing` with its error recorded, and the other sites carry on.

use crate::config::SiteEntry;
use crate::engine::monitor::SiteCompletionMonitor;
use crate::engine::session::SessionManager;
use crate::engine::stats::{StatEvent, StatisticsAggregator};
use crate::source::{ContentSource, SessionHandle, SourceError};
use crate::storage::{DownloadRecord, NewDownload, Storage};
use crate::MirrorError;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What discovery did with one site
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SiteDiscovery {
    Discovered { files: u64, new: u64 },
    Empty,
    Stalled(String),
    /// Already terminal
    Skipped,
    Cancelled,
}

/// Totals over one discovery pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoverySummary {
    pub sites_discovered: u64,
    pub sites_empty: u64,
    pub sites_stalled: u64,
    pub files_new: u64,
}

pub struct Discovery {
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) source: Arc<dyn ContentSource>,
    pub(crate) sessions: Arc<SessionManager>,
    pub(crate) monitor: Arc<SiteCompletionMonitor>,
    pub(crate) stats: Arc<StatisticsAggregator>,
    pub(crate) output_dir: PathBuf,
    pub(crate) batch_size: usize,
    pub(crate) max_attempts: u32,
    pub(crate) retry_delay: Duration,
    pub(crate) shutdown: CancellationToken,
}

impl Discovery {
    /// Discovers every listed site in order
    pub async fn run(&self, sites: &[SiteEntry]) -> Result<DiscoverySummary, MirrorError> {
        let mut summary = DiscoverySummary::default();

        for entry in sites {
            if self.shutdown.is_cancelled() {
                info!("Discovery cancelled");
                break;
            }
            match self.discover_site(entry).await? {
                SiteDiscovery::Discovered { new, .. } => {
                    summary.sites_discovered += 1;
                    summary.files_new += new;
                }
                SiteDiscovery::Empty => summary.sites_empty += 1,
                SiteDiscovery::Stalled(_) => summary.sites_stalled += 1,
                SiteDiscovery::Skipped => {}
                SiteDiscovery::Cancelled => break,
            }
        }

        info!(
            "Discovery finished: {} sites, {} new files, {} empty, {} stalled",
            summary.sites_discovered, summary.files_new, summary.sites_empty, summary.sites_stalled
        );
        Ok(summary)
    }

    pub async fn discover_site(&self, entry: &SiteEntry) -> Result<SiteDiscovery, MirrorError> {
        let site = self
            .storage
            .get_site(&entry.name)?
            .ok_or_else(|| MirrorError::UnknownSite(entry.name.clone()))?;
        if !site.status.needs_discovery() {
            debug!("Site {} is {}, skipping discovery", entry.name, site.status);
            return Ok(SiteDiscovery::Skipped);
        }

        self.storage.mark_site_processing(&entry.name)?;
        info!("Discovering site {} ({})", entry.name, entry.url);

        let mut files = match self.enumerate_with_retry(entry).await? {
            Ok(files) => files,
            Err(_) if self.shutdown.is_cancelled() => return Ok(SiteDiscovery::Cancelled),
            Err(e) => {
                let message = e.to_string();
                error!(
                    "Enumeration of site {} failed, leaving it for a later run: {}",
                    entry.name, message
                );
                self.storage.mark_site_stalled(&entry.name, &message)?;
                return Ok(SiteDiscovery::Stalled(message));
            }
        };

        if files.is_empty() {
            if self.storage.mark_site_empty(&entry.name)? {
                info!("Site {} has no files", entry.name);
                return Ok(SiteDiscovery::Empty);
            }
            // Earlier runs recorded files that are gone now; keep them
            self.storage.mark_site_discovered(&entry.name)?;
            self.monitor.evaluate(&entry.name)?;
            return Ok(SiteDiscovery::Discovered { files: 0, new: 0 });
        }

        let known = self.storage.get_downloads_for_site(&entry.name)?;
        let renamed = assign_unique_destinations(&mut files, &known);
        if renamed > 0 {
            warn!(
                "Site {}: {} files renamed locally to avoid overwriting a file with the same safe name",
                entry.name, renamed
            );
        }

        let mut new = 0;
        for batch in files.chunks(self.batch_size.max(1)) {
            new += self.storage.upsert_discovered_batch(batch)?;
        }
        self.storage.mark_site_discovered(&entry.name)?;
        if new > 0 {
            self.stats.record(StatEvent::FilesDiscovered(new))?;
        }
        info!(
            "Site {}: {} files listed, {} new",
            entry.name,
            files.len(),
            new
        );

        self.monitor.evaluate(&entry.name)?;
        Ok(SiteDiscovery::Discovered {
            files: files.len() as u64,
            new,
        })
    }

    /// Enumerates a site, retrying failures; the outer error is fatal to the run
    async fn enumerate_with_retry(
        &self,
        entry: &SiteEntry,
    ) -> Result<Result<Vec<NewDownload>, SourceError>, MirrorError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let session = self.sessions.get_session().await?;

            let error = match self.enumerate(&session, entry).await {
                Ok(files) => return Ok(Ok(files)),
                Err(e) => e,
            };

            if error.is_api_error() {
                self.stats.record(StatEvent::ApiError)?;
            }
            if error.is_permanent() || attempt >= self.max_attempts {
                return Ok(Err(error));
            }
            warn!(
                "Enumeration of site {} failed (attempt {}/{}): {}",
                entry.name, attempt, self.max_attempts, error
            );

            if let SourceError::AuthExpired(_) = error {
                self.sessions.refresh_if_stale(session.generation).await?;
            } else {
                tokio::select! {
                    _ = tokio::time::sleep(self.retry_delay) => {}
                    _ = self.shutdown.cancelled() => return Ok(Err(error)),
                }
            }
        }
    }

    async fn enumerate(
        &self,
        session: &SessionHandle,
        entry: &SiteEntry,
    ) -> Result<Vec<NewDownload>, SourceError> {
        let libraries = self.source.list_libraries(session, &entry.url).await?;

        let mut files = Vec::new();
        for library in libraries {
            let listed = self.source.list_files(session, &library).await?;
            debug!(
                "Library {} of site {}: {} files",
                library.name,
                entry.name,
                listed.len()
            );
            for file in listed {
                let destination =
                    destination_path(&self.output_dir, &entry.name, &library.name, &file.name);
                files.push(NewDownload {
                    site_name: entry.name.clone(),
                    library_name: library.name.clone(),
                    file_name: file.name,
                    remote_id: file.remote_id,
                    destination_path: destination.to_string_lossy().into_owned(),
                    size_bytes: file.size,
                });
            }
        }
        Ok(files)
    }
}

/// Replaces characters that are unsafe in a single path component
pub fn safe_path_component(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim().trim_end_matches('.').to_string();

    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        "_".to_string()
    } else {
        cleaned
    }
}

/// Gives every file of one site a destination no other file of the site uses
///
/// Sanitizing is lossy (`a?.txt` and `a*.txt` both become `a_.txt`) and some file systems ignore
/// case, so two remote files can map onto one local path. Files already recorded keep their
/// stored destination. Among the rest, in `(library, name)` order, a file whose path is taken
/// gets a tag derived from its remote id before the extension. Returns how many were tagged.
pub fn assign_unique_destinations(files: &mut [NewDownload], known: &[DownloadRecord]) -> usize {
    let mut owners: HashMap<String, (&str, &str)> = HashMap::new();
    let mut recorded: HashMap<(&str, &str), &str> = HashMap::new();
    for record in known {
        owners.insert(
            collision_key(&record.destination_path),
            (&record.library_name, &record.file_name),
        );
        recorded.insert(
            (&record.library_name, &record.file_name),
            &record.destination_path,
        );
    }

    let mut order: Vec<usize> = (0..files.len()).collect();
    order.sort_by(|&a, &b| {
        (&files[a].library_name, &files[a].file_name)
            .cmp(&(&files[b].library_name, &files[b].file_name))
    });

    let mut assigned: Vec<Option<String>> = vec![None; files.len()];
    let mut taken: HashMap<String, usize> = HashMap::new();
    let mut renamed = 0;
    for &i in &order {
        let file = &files[i];
        let key = (file.library_name.as_str(), file.file_name.as_str());
        if let Some(destination) = recorded.get(&key) {
            assigned[i] = Some(destination.to_string());
            continue;
        }

        let mut destination = file.destination_path.clone();
        let mut attempt = 0;
        loop {
            let collision = collision_key(&destination);
            let owned_by_other = owners
                .get(&collision)
                .map(|owner| *owner != key)
                .unwrap_or(false);
            if !owned_by_other && !taken.contains_key(&collision) {
                taken.insert(collision, i);
                break;
            }
            destination = tagged_path(&file.destination_path, &file.remote_id, attempt);
            attempt += 1;
        }
        if destination != file.destination_path {
            renamed += 1;
        }
        assigned[i] = Some(destination);
    }

    for (file, destination) in files.iter_mut().zip(assigned) {
        if let Some(destination) = destination {
            file.destination_path = destination;
        }
    }
    renamed
}

fn collision_key(destination: &str) -> String {
    destination.to_lowercase()
}

/// `dir/name (tag).ext`, with the tag taken from the SHA-256 of the remote id
fn tagged_path(destination: &str, remote_id: &str, attempt: u32) -> String {
    let digest = hex::encode(Sha256::digest(remote_id.as_bytes()));
    let tag = match attempt {
        0 => digest[..8].to_string(),
        n => format!("{}-{}", &digest[..8], n),
    };

    let path = Path::new(destination);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{} ({}).{}", stem, tag, ext.to_string_lossy()),
        None => format!("{} ({})", stem, tag),
    };
    path.with_file_name(name).to_string_lossy().into_owned()
}

/// `<output>/<site>/<library>/<relative path>`, each component made safe
pub fn destination_path(output_dir: &Path, site: &str, library: &str, relative: &str) -> PathBuf {
    let mut path = output_dir
        .join(safe_path_component(site))
        .join(safe_path_component(library));
    for segment in relative.split(|c: char| c == '/' || c == '\\').filter(|s| !s.is_empty()) {
        path.push(safe_path_component(segment));
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::FakeSource;
    use crate::state::SiteStatus;
    use crate::storage::{metrics, SqliteStorage};

    const SITE_URL: &str = "https://contoso.example.com/sites/sales";

    struct Fixture {
        storage: Arc<SqliteStorage>,
        source: Arc<FakeSource>,
        stats: Arc<StatisticsAggregator>,
        discovery: Discovery,
    }

    fn fixture(batch_size: usize) -> Fixture {
        let storage = Arc::new(SqliteStorage::new_in_memory(3).unwrap());
        storage.register_site("Sales", SITE_URL).unwrap();
        let source = Arc::new(FakeSource::new());
        let stats = Arc::new(StatisticsAggregator::new(storage.clone(), 1000));
        let monitor = Arc::new(SiteCompletionMonitor::new(storage.clone(), stats.clone()));
        let sessions = Arc::new(SessionManager::new(
            source.clone(),
            FakeSource::credentials(),
            5000,
            3,
            Duration::from_millis(1),
        ));
        let discovery = Discovery {
            storage: storage.clone(),
            source: source.clone(),
            sessions,
            monitor,
            stats: stats.clone(),
            output_dir: PathBuf::from("/mirror"),
            batch_size,
            max_attempts: 3,
            retry_delay: Duration::from_millis(1),
            shutdown: CancellationToken::new(),
        };
        Fixture {
            storage,
            source,
            stats,
            discovery,
        }
    }

    fn entry() -> SiteEntry {
        SiteEntry {
            name: "Sales".to_string(),
            url: SITE_URL.to_string(),
        }
    }

    #[test]
    fn test_safe_path_component() {
        assert_eq!(safe_path_component("Q1: plan?"), "Q1_ plan_");
        assert_eq!(safe_path_component(".."), "_");
        assert_eq!(safe_path_component("notes. "), "notes");
        assert_eq!(safe_path_component(""), "_");
    }

    #[test]
    fn test_destination_path() {
        let path = destination_path(
            Path::new("/mirror"),
            "Sales/EMEA",
            "Shared Documents",
            "2024/Q1/report*.xlsx",
        );
        assert_eq!(
            path,
            PathBuf::from("/mirror/Sales_EMEA/Shared Documents/2024/Q1/report_.xlsx")
        );
    }

    #[tokio::test]
    async fn test_discovery_records_files_in_batches() {
        let f = fixture(2);
        for i in 0..5 {
            f.source
                .add_file(SITE_URL, "Documents", &format!("dir/f{}.txt", i), b"x");
        }

        let result = f.discovery.discover_site(&entry()).await.unwrap();
        assert_eq!(result, SiteDiscovery::Discovered { files: 5, new: 5 });

        let records = f.storage.get_downloads_for_site("Sales").unwrap();
        assert_eq!(records.len(), 5);
        assert_eq!(records[0].file_name, "dir/f0.txt");
        assert_eq!(
            records[0].destination_path,
            "/mirror/Sales/Documents/dir/f0.txt"
        );
        assert_eq!(f.stats.snapshot().unwrap().get(metrics::TOTAL_FILES), 5.0);

        let site = f.storage.get_site("Sales").unwrap().unwrap();
        assert_eq!(site.status, SiteStatus::Processing);
        assert_eq!(site.total_files, 5);
    }

    #[tokio::test]
    async fn test_colliding_safe_names_get_distinct_destinations() {
        let f = fixture(10);
        let question = f.source.add_file(SITE_URL, "Documents", "a?.txt", b"AAAA");
        let star = f.source.add_file(SITE_URL, "Documents", "a*.txt", b"BBBB");
        f.source.add_file(SITE_URL, "Documents", "A_.TXT", b"CCCC");

        f.discovery.discover_site(&entry()).await.unwrap();

        let records = f.storage.get_downloads_for_site("Sales").unwrap();
        let destination_of = |remote_id: &str| {
            records
                .iter()
                .find(|r| r.remote_id == remote_id)
                .map(|r| r.destination_path.clone())
                .unwrap()
        };
        let mut destinations: Vec<String> = records
            .iter()
            .map(|r| r.destination_path.to_lowercase())
            .collect();
        destinations.sort();
        destinations.dedup();
        assert_eq!(destinations.len(), 3);
        // "A_.TXT" sorts first and keeps the plain name
        assert!(destination_of(&question).ends_with(").txt"));
        assert!(destination_of(&star).ends_with(").txt"));

        // A later pass keeps every stored destination
        let before: Vec<_> = records.iter().map(|r| r.destination_path.clone()).collect();
        f.discovery.discover_site(&entry()).await.unwrap();
        let after: Vec<_> = f
            .storage
            .get_downloads_for_site("Sales")
            .unwrap()
            .into_iter()
            .map(|r| r.destination_path)
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_newcomer_never_takes_a_recorded_destination() {
        let known = vec![DownloadRecord {
            id: 1,
            site_name: "Sales".to_string(),
            library_name: "Documents".to_string(),
            file_name: "z?.txt".to_string(),
            remote_id: "d/z1".to_string(),
            destination_path: "/mirror/Sales/Documents/z_.txt".to_string(),
            size_bytes: Some(1),
            size_mb: 0.0,
            status: crate::state::DownloadStatus::Completed,
            retry_count: 0,
            error_message: None,
            discovered_at: "2024-01-01T00:00:00Z".to_string(),
            last_attempt_at: None,
            completed_at: None,
        }];
        let mut files = vec![NewDownload {
            site_name: "Sales".to_string(),
            library_name: "Documents".to_string(),
            file_name: "z*.txt".to_string(),
            remote_id: "d/z2".to_string(),
            destination_path: "/mirror/Sales/Documents/z_.txt".to_string(),
            size_bytes: Some(1),
        }];

        assert_eq!(assign_unique_destinations(&mut files, &known), 1);
        assert_ne!(files[0].destination_path, known[0].destination_path);
        assert!(files[0].destination_path.starts_with("/mirror/Sales/Documents/z_ ("));
        assert_eq!(tagged_path("/m/README", "d/x", 0).matches('(').count(), 1);
        assert!(tagged_path("/m/README", "d/x", 1).ends_with("-1)"));
    }

    #[tokio::test]
    async fn test_discovery_marks_site_complete_after_all_batches() {
        let f = fixture(1);
        for i in 0..3 {
            f.source
                .add_file(SITE_URL, "Documents", &format!("f{}.txt", i), b"x");
        }
        f.storage.mark_site_processing("Sales").unwrap();
        assert!(!f.storage.get_site("Sales").unwrap().unwrap().discovery_complete);

        f.discovery.discover_site(&entry()).await.unwrap();
        assert!(f.storage.get_site("Sales").unwrap().unwrap().discovery_complete);
    }

    #[tokio::test]
    async fn test_stalled_site_is_not_marked_discovered() {
        let f = fixture(10);
        f.source
            .fail_listing(SITE_URL, SourceError::Permanent("403".to_string()));

        f.discovery.discover_site(&entry()).await.unwrap();
        assert!(!f.storage.get_site("Sales").unwrap().unwrap().discovery_complete);
    }

    #[tokio::test]
    async fn test_rediscovery_is_a_noop() {
        let f = fixture(10);
        f.source.add_file(SITE_URL, "Documents", "a.txt", b"x");

        f.discovery.discover_site(&entry()).await.unwrap();
        let again = f.discovery.discover_site(&entry()).await.unwrap();

        assert_eq!(again, SiteDiscovery::Discovered { files: 1, new: 0 });
        assert_eq!(f.storage.get_downloads_for_site("Sales").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_site() {
        let f = fixture(10);
        f.source.add_site(SITE_URL);

        let result = f.discovery.discover_site(&entry()).await.unwrap();
        assert_eq!(result, SiteDiscovery::Empty);
        assert_eq!(
            f.storage.get_site("Sales").unwrap().unwrap().status,
            SiteStatus::Empty
        );

        let result = f.discovery.discover_site(&entry()).await.unwrap();
        assert_eq!(result, SiteDiscovery::Skipped);
    }

    #[tokio::test]
    async fn test_transient_listing_errors_are_retried() {
        let f = fixture(10);
        f.source.add_file(SITE_URL, "Documents", "a.txt", b"x");
        f.source
            .fail_listing(SITE_URL, SourceError::Transient("503".to_string()));
        f.source
            .fail_listing(SITE_URL, SourceError::Transient("503".to_string()));

        let result = f.discovery.discover_site(&entry()).await.unwrap();
        assert_eq!(result, SiteDiscovery::Discovered { files: 1, new: 1 });
        assert_eq!(f.stats.snapshot().unwrap().get(metrics::API_ERRORS), 2.0);
    }

    #[tokio::test]
    async fn test_exhausted_listing_stalls_site() {
        let f = fixture(10);
        f.source.add_file(SITE_URL, "Documents", "a.txt", b"x");
        for _ in 0..3 {
            f.source
                .fail_listing(SITE_URL, SourceError::Transient("503".to_string()));
        }

        let result = f.discovery.discover_site(&entry()).await.unwrap();
        assert!(matches!(result, SiteDiscovery::Stalled(_)));

        let site = f.storage.get_site("Sales").unwrap().unwrap();
        assert_eq!(site.status, SiteStatus::Processing);
        assert!(site.last_error.unwrap().contains("503"));
    }

    #[tokio::test]
    async fn test_permanent_listing_error_is_not_retried() {
        let f = fixture(10);
        f.source
            .fail_listing(SITE_URL, SourceError::Permanent("403".to_string()));
        f.source.add_file(SITE_URL, "Documents", "a.txt", b"x");

        let result = f.discovery.discover_site(&entry()).await.unwrap();
        assert!(matches!(result, SiteDiscovery::Stalled(_)));
    }

    #[tokio::test]
    async fn test_unknown_site() {
        let f = fixture(10);
        let result = f
            .discovery
            .discover_site(&SiteEntry {
                name: "Ghost".to_string(),
                url: SITE_URL.to_string(),
            })
            .await;
        assert!(matches!(result, Err(MirrorError::UnknownSite(_))));
    }
}
