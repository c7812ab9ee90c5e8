//! Site list loading
//!
//! The site list is a CSV file with a `SiteName,SiteURL` header, one site per row.

use crate::ConfigError;
use csv::{ReaderBuilder, Trim};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, warn};
use url::Url;

/// A site to mirror, as listed in the site CSV
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteEntry {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Deserialize)]
struct SiteRow {
    #[serde(rename = "SiteName", default)]
    name: String,
    #[serde(rename = "SiteURL", default)]
    url: String,
}

/// Reads the site list from `path`
pub fn load_sites(path: &Path) -> Result<Vec<SiteEntry>, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    parse_sites(&content)
}

/// Parses site list CSV content
///
/// A leading byte-order mark is ignored and rows with both columns blank are skipped. Site
/// names must be unique and every URL must parse.
pub fn parse_sites(content: &str) -> Result<Vec<SiteEntry>, ConfigError> {
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);

    let mut reader = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .from_reader(content.as_bytes());

    let mut seen = HashSet::new();
    let mut sites = Vec::new();

    for (index, result) in reader.deserialize::<SiteRow>().enumerate() {
        let row = result?;
        let line = index + 2;

        if row.name.is_empty() && row.url.is_empty() {
            continue;
        }
        if row.name.is_empty() || row.url.is_empty() {
            warn!("Skipping incomplete site list row {}", line);
            continue;
        }

        Url::parse(&row.url).map_err(|e| {
            ConfigError::InvalidUrl(format!(
                "Site '{}' has invalid URL '{}': {}",
                row.name, row.url, e
            ))
        })?;

        if !seen.insert(row.name.clone()) {
            return Err(ConfigError::Validation(format!(
                "Site '{}' is listed more than once",
                row.name
            )));
        }

        debug!("Site list entry: {} -> {}", row.name, row.url);
        sites.push(SiteEntry {
            name: row.name,
            url: row.url,
        });
    }

    Ok(sites)
}
