//! Site-Mirror: a resumable mirror of remote document sites
//!
//! This crate mirrors a hierarchy of remote sites, document libraries and files onto local
//! storage. Progress is tracked in an SQLite database so that multi-hour runs survive crashes,
//! network failures and credential expiry without downloading a file twice.

pub mod config;
pub mod engine;
pub mod output;
pub mod source;
pub mod state;
pub mod storage;

use thiserror::Error;

/// Main error type for Site-Mirror operations
#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Content source error: {0}")]
    Source(#[from] source::SourceError),

    #[error("Credential refresh failed: {0}")]
    Credential(String),

    #[error("Unknown site: {0}")]
    UnknownSite(String),

    #[error("Output directory is not writable: {path}: {source}")]
    OutputNotWritable {
        path: String,
        source: std::io::Error,
    },

    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to read site list: {0}")]
    Csv(#[from] csv::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),

    #[error("Invalid environment override {key}={value}")]
    InvalidOverride { key: String, value: String },

    #[error("Missing credential: {0}")]
    MissingCredential(String),
}

/// Result type alias for Site-Mirror operations
pub type Result<T> = std::result::Result<T, MirrorError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// Re-export commonly used types
pub use config::Config;
pub use engine::{run_mirror, Engine};
pub use state::{DownloadStatus, SiteStatus};
pub use storage::{SqliteStorage, Storage};
