//! Output module for status and statistics reports
//!
//! This module handles:
//! - Per-status download counts and the list of exhausted failures
//! - Per-site progress
//! - A live dashboard refreshed from the database
//! - Human-readable sizes

pub mod monitor;
mod report;
pub mod stats;

pub use monitor::{format_dashboard, load_snapshot, run_monitor, MonitorSnapshot};
pub use report::{format_site_status, print_site_status};
pub use stats::{format_statistics, load_statistics, print_statistics, MirrorStatistics};

/// Formats a size given in megabytes as MB, GB or TB
pub fn format_size(mb: f64) -> String {
    if mb >= 1024.0 * 1024.0 {
        format!("{:.2} TB", mb / (1024.0 * 1024.0))
    } else if mb >= 1024.0 {
        format!("{:.2} GB", mb / 1024.0)
    } else {
        format!("{:.2} MB", mb)
    }
}
