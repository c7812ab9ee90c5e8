//! Live progress dashboard
//!
//! The dashboard only reads the progress database, so it can watch a mirror running in another
//! process. Each refresh takes a [`MonitorSnapshot`] and redraws the terminal from it.

use crate::output::format_size;
use crate::state::{DownloadStatus, SiteStatus};
use crate::storage::{
    metrics, RecentActivity, SessionRecord, SessionStatus, SiteRecord, Statistics, Storage,
};
use crate::MirrorError;
use chrono::{DateTime, Duration as Span, Utc};
use std::collections::HashMap;
use std::fmt::Write;
use std::io::Write as _;
use std::time::Duration;

/// Completions newer than this count as current activity
pub const COMPLETED_WINDOW_MINUTES: i64 = 5;

/// Failures newer than this are listed
pub const FAILURE_WINDOW_MINUTES: i64 = 10;

pub const RECENT_FAILURES_SHOWN: u32 = 5;

const PROGRESS_BAR_WIDTH: usize = 40;
const ERROR_PREVIEW_CHARS: usize = 60;

/// Everything one dashboard frame shows
#[derive(Debug, Clone)]
pub struct MonitorSnapshot {
    pub taken_at: DateTime<Utc>,

    /// Number of sites in each status
    pub sites: HashMap<SiteStatus, u64>,

    /// Processing site updated most recently
    pub current_site: Option<SiteRecord>,

    pub by_status: HashMap<DownloadStatus, u64>,

    pub statistics: Statistics,

    /// Latest session, if it is still running
    pub active_session: Option<SessionRecord>,

    pub activity: RecentActivity,
}

impl MonitorSnapshot {
    pub fn total_sites(&self) -> u64 {
        self.sites.values().sum()
    }

    pub fn total_files(&self) -> u64 {
        self.by_status.values().sum()
    }

    /// Share of recorded files that are completed, in percent
    pub fn overall_progress(&self) -> f64 {
        let total = self.total_files();
        if total == 0 {
            return 0.0;
        }
        let completed = self
            .by_status
            .get(&DownloadStatus::Completed)
            .copied()
            .unwrap_or(0);
        completed as f64 / total as f64 * 100.0
    }

    /// Time since the active session started
    pub fn session_runtime(&self) -> Option<Span> {
        let session = self.active_session.as_ref()?;
        let started = DateTime::parse_from_rfc3339(&session.started_at).ok()?;
        Some(self.taken_at.signed_duration_since(started.with_timezone(&Utc)))
    }
}

/// Reads one dashboard frame from storage
pub fn load_snapshot(
    storage: &dyn Storage,
    now: DateTime<Utc>,
) -> Result<MonitorSnapshot, MirrorError> {
    let site_records = storage.get_site_status(None)?;
    let mut sites = HashMap::new();
    for site in &site_records {
        *sites.entry(site.status).or_insert(0) += 1;
    }
    let current_site = site_records
        .into_iter()
        .filter(|site| site.status == SiteStatus::Processing)
        .max_by(|a, b| a.last_updated.cmp(&b.last_updated));

    let active_session = storage
        .get_latest_session()?
        .filter(|session| session.status == SessionStatus::Running);

    let activity = storage.recent_activity(
        now - Span::minutes(COMPLETED_WINDOW_MINUTES),
        now - Span::minutes(FAILURE_WINDOW_MINUTES),
        RECENT_FAILURES_SHOWN,
    )?;

    Ok(MonitorSnapshot {
        taken_at: now,
        sites,
        current_site,
        by_status: storage.count_by_status()?,
        statistics: storage.snapshot_statistics()?,
        active_session,
        activity,
    })
}

/// Renders a dashboard frame
pub fn format_dashboard(snapshot: &MonitorSnapshot, interval: Duration) -> String {
    let mut out = String::new();
    let rule = "=".repeat(80);
    let divider = "-".repeat(40);

    let _ = writeln!(out, "{}", rule);
    let _ = writeln!(
        out,
        "Site-Mirror Monitor - {}",
        snapshot
            .taken_at
            .with_timezone(&chrono::Local)
            .format("%Y-%m-%d %H:%M:%S")
    );
    let _ = writeln!(out, "{}", rule);

    if snapshot.total_sites() > 0 {
        let count = |status: SiteStatus| snapshot.sites.get(&status).copied().unwrap_or(0);
        let _ = writeln!(out, "\nSites:\n{}", divider);
        let _ = writeln!(out, "  Total:        {}", snapshot.total_sites());
        let _ = writeln!(out, "  Completed:    {}", count(SiteStatus::Completed));
        let _ = writeln!(
            out,
            "  With errors:  {}",
            count(SiteStatus::CompletedWithErrors)
        );
        let _ = writeln!(out, "  Empty:        {}", count(SiteStatus::Empty));
        let _ = writeln!(out, "  Processing:   {}", count(SiteStatus::Processing));
        let _ = writeln!(out, "  Pending:      {}", count(SiteStatus::Pending));

        if let Some(site) = &snapshot.current_site {
            let percent = if site.total_files > 0 {
                site.completed_files as f64 / site.total_files as f64 * 100.0
            } else {
                0.0
            };
            let _ = writeln!(out, "\n  Current site: {}", site.name);
            let _ = writeln!(
                out,
                "    Progress: {}/{} files ({:.1}%)",
                site.completed_files, site.total_files, percent
            );
            if site.failed_files > 0 {
                let _ = writeln!(out, "    Failed: {} files", site.failed_files);
            }
        }
    }

    let _ = writeln!(out, "\nFiles:\n{}", divider);
    for status in DownloadStatus::all_statuses() {
        let count = snapshot.by_status.get(&status).copied().unwrap_or(0);
        let _ = writeln!(out, "  {:<12} {}", format!("{}:", status), count);
    }
    let _ = writeln!(out, "  {:<12} {}", "total:", snapshot.total_files());

    let counters = &snapshot.statistics;
    let _ = writeln!(out, "\nDownloads:\n{}", divider);
    let _ = writeln!(
        out,
        "  Successful:   {}",
        counters.get(metrics::SUCCESSFUL_DOWNLOADS)
    );
    let _ = writeln!(
        out,
        "  Failed:       {}",
        counters.get(metrics::FAILED_DOWNLOADS)
    );
    let _ = writeln!(
        out,
        "  Downloaded:   {}",
        format_size(counters.get(metrics::MB_DOWNLOADED))
    );

    if snapshot.total_files() > 0 {
        let _ = writeln!(
            out,
            "\n  Overall: [{}] {:.1}%",
            progress_bar(snapshot.overall_progress(), PROGRESS_BAR_WIDTH),
            snapshot.overall_progress()
        );
    }

    let _ = writeln!(out, "\nActivity:\n{}", divider);
    let _ = writeln!(
        out,
        "  Completed in last {} min: {}",
        COMPLETED_WINDOW_MINUTES, snapshot.activity.completed
    );
    let _ = writeln!(
        out,
        "  Downloading now: {}",
        snapshot.activity.in_flight
    );

    if let (Some(session), Some(runtime)) = (&snapshot.active_session, snapshot.session_runtime())
    {
        let _ = writeln!(out, "\nSession {}:\n{}", session.id, divider);
        let _ = writeln!(out, "  Runtime: {}", format_runtime(runtime));
        let hours = runtime.num_seconds() as f64 / 3600.0;
        if hours > 0.0 && session.progress.files_downloaded > 0 {
            let _ = writeln!(
                out,
                "  Rate: {:.1} files/hour ({}/hour)",
                session.progress.files_downloaded as f64 / hours,
                format_size(session.progress.mb_downloaded / hours)
            );
        }
    }

    if !snapshot.activity.failures.is_empty() {
        let _ = writeln!(
            out,
            "\nFailures in last {} min:\n{}",
            FAILURE_WINDOW_MINUTES, divider
        );
        for record in &snapshot.activity.failures {
            let _ = writeln!(
                out,
                "  - {}/{}/{}",
                record.site_name, record.library_name, record.file_name
            );
            let _ = writeln!(
                out,
                "    Error: {}",
                preview(record.error_message.as_deref().unwrap_or("unknown error"))
            );
            if let Some(at) = &record.last_attempt_at {
                let _ = writeln!(out, "    At: {}", at);
            }
        }
    }

    let _ = writeln!(out, "\n{}", rule);
    let _ = writeln!(
        out,
        "Refreshing every {}s. Press Ctrl+C to exit",
        interval.as_secs()
    );
    out
}

/// Redraws the dashboard every `interval` until Ctrl+C
pub async fn run_monitor(storage: &dyn Storage, interval: Duration) -> Result<(), MirrorError> {
    loop {
        let snapshot = load_snapshot(storage, Utc::now())?;
        // Clear screen and home the cursor
        print!("\x1B[2J\x1B[H{}", format_dashboard(&snapshot, interval));
        std::io::stdout().flush()?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    println!("\nMonitor stopped");
    Ok(())
}

fn progress_bar(percent: f64, width: usize) -> String {
    let filled = ((percent.clamp(0.0, 100.0) / 100.0) * width as f64) as usize;
    format!("{}{}", "█".repeat(filled), "░".repeat(width - filled))
}

fn format_runtime(runtime: Span) -> String {
    let secs = runtime.num_seconds().max(0);
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

fn preview(message: &str) -> String {
    if message.chars().count() <= ERROR_PREVIEW_CHARS {
        message.to_string()
    } else {
        let head: String = message.chars().take(ERROR_PREVIEW_CHARS).collect();
        format!("{}...", head)
    }
}
