//! Sample files written by `--create-config`

use crate::ConfigError;
use std::path::{Path, PathBuf};
use tracing::info;

pub const SAMPLE_CONFIG: &str = r#"# Site-Mirror configuration

[engine]
# Number of concurrent download workers
num-threads = 5
# Attempts before a failed download is given up
max-retry = 3
# Discovery upserts per transaction
batch-size = 1000
# Files processed before the access token is refreshed
max-files-per-session = 5000
# Pause in seconds after rate-limit or server errors
api-retry-delay = 30
# Token refresh interval in seconds (45 minutes)
token-refresh-interval = 2700
# Statistics and session progress save interval in seconds
progress-save-interval = 300
# Database backup interval in seconds
db-backup-interval = 600

[paths]
output-dir = "./site_mirror"
sites-csv = "./sites.csv"
credentials-path = "./credentials.txt"
log-dir = "./logs"
database-path = "./progress.db"

[logging]
# trace, debug, info, warn or error
level = "info"
debug = false
"#;

pub const SAMPLE_SITES: &str = "SiteName,SiteURL
Marketing Team,https://yourcompany.sharepoint.com/sites/marketing
Sales Department,https://yourcompany.sharepoint.com/sites/sales
Engineering,https://yourcompany.sharepoint.com/sites/engineering
";

pub const CREDENTIALS_TEMPLATE: &str = "# Site-Mirror credentials
# Register an application in Azure AD with these application permissions:
# - Files.Read.All
# - Sites.Read.All

CLIENT_ID=your-client-id-here
CLIENT_SECRET=your-client-secret-here
TENANT_ID=your-tenant-id-here
";

/// Writes the sample config, site list and credentials template into `dir`
pub fn write_sample_files(dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let files = [
        ("config.toml.sample", SAMPLE_CONFIG),
        ("sites.csv.sample", SAMPLE_SITES),
        ("credentials.txt.template", CREDENTIALS_TEMPLATE),
    ];

    let mut written = Vec::with_capacity(files.len());
    for (name, content) in files {
        let path = dir.join(name);
        std::fs::write(&path, content)?;
        info!("Created {}", path.display());
        written.push(path);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::Config;
    use crate::config::{parse_credentials, parse_sites, validate};
    use tempfile::TempDir;

    #[test]
    fn test_samples_are_loadable() {
        let config: Config = toml::from_str(SAMPLE_CONFIG).unwrap();
        assert!(validate(&config).is_ok());
        assert_eq!(parse_sites(SAMPLE_SITES).unwrap().len(), 3);
        assert!(parse_credentials(CREDENTIALS_TEMPLATE).is_ok());
    }

    #[test]
    fn test_write_sample_files() {
        let temp = TempDir::new().unwrap();
        let written = write_sample_files(temp.path()).unwrap();

        assert_eq!(written.len(), 3);
        for path in written {
            assert!(path.exists());
        }
    }
}
