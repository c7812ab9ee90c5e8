//! Per-site status report

use crate::state::SiteStatus;
use crate::storage::SiteRecord;
use std::fmt::Write;

/// Formats one block per site with its progress and any enumeration error
pub fn format_site_status(sites: &[SiteRecord]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "=== Site Status ===\n");

    if sites.is_empty() {
        let _ = writeln!(out, "No sites recorded yet.");
        return out;
    }

    for site in sites {
        let percentage = if site.total_files > 0 {
            (site.completed_files as f64 / site.total_files as f64) * 100.0
        } else {
            0.0
        };
        let _ = writeln!(out, "{} [{}]", site.name, site.status);
        let _ = writeln!(out, "  URL: {}", site.source_url);
        let _ = writeln!(
            out,
            "  Files: {}/{} completed ({:.1}%), {} failed",
            site.completed_files, site.total_files, percentage, site.failed_files
        );
        if let Some(started) = &site.started_at {
            let _ = writeln!(out, "  Started: {}", started);
        }
        if let Some(completed) = &site.completed_at {
            let _ = writeln!(out, "  Completed: {}", completed);
        }
        if let Some(error) = &site.last_error {
            let _ = writeln!(out, "  Last error: {}", error);
        }
    }

    let done = sites.iter().filter(|s| s.status.is_terminal()).count();
    let with_errors = sites
        .iter()
        .filter(|s| s.status == SiteStatus::CompletedWithErrors)
        .count();
    let _ = writeln!(
        out,
        "\n{} of {} sites finished ({} with errors)",
        done,
        sites.len(),
        with_errors
    );
    out
}

pub fn print_site_status(sites: &[SiteRecord]) {
    print!("{}", format_site_status(sites));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(name: &str, status: SiteStatus, total: u64, completed: u64, failed: u64) -> SiteRecord {
        SiteRecord {
            name: name.to_string(),
            source_url: format!("https://contoso.example.com/sites/{}", name.to_lowercase()),
            status,
            total_files: total,
            completed_files: completed,
            failed_files: failed,
            started_at: None,
            completed_at: None,
            last_error: None,
            last_updated: "2024-01-01T00:00:00Z".to_string(),
            discovery_complete: status != SiteStatus::Processing,
        }
    }

    #[test]
    fn test_site_report() {
        let mut stalled = site("Finance", SiteStatus::Processing, 0, 0, 0);
        stalled.last_error = Some("Transient error: 503".to_string());
        let report = format_site_status(&[
            site("Marketing", SiteStatus::CompletedWithErrors, 3, 2, 1),
            stalled,
        ]);

        assert!(report.contains("Marketing [completed_with_errors]"));
        assert!(report.contains("Files: 2/3 completed (66.7%), 1 failed"));
        assert!(report.contains("Last error: Transient error: 503"));
        assert!(report.contains("1 of 2 sites finished (1 with errors)"));
    }

    #[test]
    fn test_no_sites() {
        assert!(format_site_status(&[]).contains("No sites recorded yet."));
    }
}
