use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure for Site-Mirror
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    pub paths: PathsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub source: SourceConfig,
}

impl Config {
    pub fn output_dir(&self) -> PathBuf {
        PathBuf::from(&self.paths.output_dir)
    }

    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(&self.paths.database_path)
    }

    pub fn log_dir(&self) -> PathBuf {
        PathBuf::from(&self.paths.log_dir)
    }

    /// Directory receiving periodic database backups
    pub fn backup_dir(&self) -> PathBuf {
        self.output_dir().join("db_backups")
    }
}

/// Engine tuning knobs
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Number of concurrent download workers
    #[serde(rename = "num-threads", default = "default_num_threads")]
    pub num_threads: u32,

    /// Attempts after which a failed download is terminal
    #[serde(rename = "max-retry", default = "default_max_retry")]
    pub max_retry: u32,

    /// Discovery upserts per transaction, and buffered events per statistics flush
    #[serde(rename = "batch-size", default = "default_batch_size")]
    pub batch_size: u32,

    /// Files processed before the credential is refreshed
    #[serde(
        rename = "max-files-per-session",
        default = "default_max_files_per_session"
    )]
    pub max_files_per_session: u64,

    /// Pool-wide pause after a rate-limit or transient error (seconds)
    #[serde(rename = "api-retry-delay", default = "default_api_retry_delay")]
    pub api_retry_delay: u64,

    /// Seconds between scheduled credential refreshes
    #[serde(
        rename = "token-refresh-interval",
        default = "default_token_refresh_interval"
    )]
    pub token_refresh_interval: u64,

    /// Seconds between statistics and session progress flushes
    #[serde(
        rename = "progress-save-interval",
        default = "default_progress_save_interval"
    )]
    pub progress_save_interval: u64,

    /// Seconds between database backups
    #[serde(rename = "db-backup-interval", default = "default_db_backup_interval")]
    pub db_backup_interval: u64,
}

impl EngineConfig {
    pub fn api_retry_delay(&self) -> Duration {
        Duration::from_secs(self.api_retry_delay)
    }

    pub fn token_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.token_refresh_interval)
    }

    pub fn progress_save_interval(&self) -> Duration {
        Duration::from_secs(self.progress_save_interval)
    }

    pub fn db_backup_interval(&self) -> Duration {
        Duration::from_secs(self.db_backup_interval)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_threads: default_num_threads(),
            max_retry: default_max_retry(),
            batch_size: default_batch_size(),
            max_files_per_session: default_max_files_per_session(),
            api_retry_delay: default_api_retry_delay(),
            token_refresh_interval: default_token_refresh_interval(),
            progress_save_interval: default_progress_save_interval(),
            db_backup_interval: default_db_backup_interval(),
        }
    }
}

/// Filesystem locations
#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    /// Root directory receiving mirrored files
    #[serde(rename = "output-dir")]
    pub output_dir: String,

    /// CSV file listing the sites to mirror
    #[serde(rename = "sites-csv", default = "default_sites_csv")]
    pub sites_csv: String,

    /// KEY=VALUE file with the application credentials
    #[serde(rename = "credentials-path", default = "default_credentials_path")]
    pub credentials_path: String,

    #[serde(rename = "log-dir", default = "default_log_dir")]
    pub log_dir: String,

    /// Path to the SQLite progress database
    #[serde(rename = "database-path", default = "default_database_path")]
    pub database_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub debug: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            debug: false,
        }
    }
}

/// Endpoints of the Microsoft Graph content source
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    #[serde(rename = "graph-url", default = "default_graph_url")]
    pub graph_url: String,

    #[serde(rename = "authority-url", default = "default_authority_url")]
    pub authority_url: String,

    /// Seconds a download may wait for headers or the next chunk before it is abandoned
    #[serde(rename = "stall-timeout", default = "default_stall_timeout")]
    pub stall_timeout: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            graph_url: default_graph_url(),
            authority_url: default_authority_url(),
            stall_timeout: default_stall_timeout(),
        }
    }
}

fn default_num_threads() -> u32 {
    5
}

fn default_max_retry() -> u32 {
    3
}

fn default_batch_size() -> u32 {
    1000
}

fn default_max_files_per_session() -> u64 {
    5000
}

fn default_api_retry_delay() -> u64 {
    30
}

fn default_token_refresh_interval() -> u64 {
    2700
}

fn default_progress_save_interval() -> u64 {
    300
}

fn default_db_backup_interval() -> u64 {
    600
}

fn default_sites_csv() -> String {
    "./sites.csv".to_string()
}

fn default_credentials_path() -> String {
    "./credentials.txt".to_string()
}

fn default_log_dir() -> String {
    "./logs".to_string()
}

fn default_database_path() -> String {
    "./progress.db".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_graph_url() -> String {
    "https://graph.microsoft.com/v1.0".to_string()
}

fn default_authority_url() -> String {
    "https://login.microsoftonline.com".to_string()
}

fn default_stall_timeout() -> u64 {
    60
}
