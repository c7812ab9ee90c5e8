//! Configuration module for Site-Mirror
//!
//! This module handles loading, parsing, and validating the TOML configuration file, the site
//! list CSV and the credentials file.
//!
//! # Example
//!
//! ```no_run
//! use site_mirror::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("config.toml")).unwrap();
//! println!("Mirroring into {}", config.paths.output_dir);
//! ```

mod credentials;
mod parser;
mod samples;
mod sites;
mod types;
mod validation;

// Re-export types
pub use types::{Config, EngineConfig, LoggingConfig, PathsConfig, SourceConfig};

pub use credentials::{load_credentials, parse_credentials};
pub use parser::{apply_env_overrides, compute_config_hash, load_config, load_config_with_hash};
pub use samples::write_sample_files;
pub use sites::{load_sites, parse_sites, SiteEntry};
pub use validation::validate;
