use crate::config::types::{Config, EngineConfig, LoggingConfig, PathsConfig, SourceConfig};
use crate::ConfigError;
use url::Url;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_engine_config(&config.engine)?;
    validate_paths_config(&config.paths)?;
    validate_logging_config(&config.logging)?;
    validate_source_config(&config.source)?;
    Ok(())
}

/// Validates engine configuration
fn validate_engine_config(config: &EngineConfig) -> Result<(), ConfigError> {
    if config.num_threads < 1 || config.num_threads > 64 {
        return Err(ConfigError::Validation(format!(
            "num-threads must be between 1 and 64, got {}",
            config.num_threads
        )));
    }

    if config.max_retry < 1 {
        return Err(ConfigError::Validation(format!(
            "max-retry must be >= 1, got {}",
            config.max_retry
        )));
    }

    if config.batch_size < 1 {
        return Err(ConfigError::Validation(format!(
            "batch-size must be >= 1, got {}",
            config.batch_size
        )));
    }

    if config.max_files_per_session < 1 {
        return Err(ConfigError::Validation(format!(
            "max-files-per-session must be >= 1, got {}",
            config.max_files_per_session
        )));
    }

    // Timer periods feed tokio intervals, which reject zero
    for (name, value) in [
        ("token-refresh-interval", config.token_refresh_interval),
        ("progress-save-interval", config.progress_save_interval),
        ("db-backup-interval", config.db_backup_interval),
    ] {
        if value == 0 {
            return Err(ConfigError::Validation(format!(
                "{} must be > 0 seconds",
                name
            )));
        }
    }

    Ok(())
}

fn validate_paths_config(config: &PathsConfig) -> Result<(), ConfigError> {
    for (name, value) in [
        ("output-dir", &config.output_dir),
        ("sites-csv", &config.sites_csv),
        ("credentials-path", &config.credentials_path),
        ("log-dir", &config.log_dir),
        ("database-path", &config.database_path),
    ] {
        if value.trim().is_empty() {
            return Err(ConfigError::Validation(format!("{} cannot be empty", name)));
        }
    }
    Ok(())
}

fn validate_logging_config(config: &LoggingConfig) -> Result<(), ConfigError> {
    if !LOG_LEVELS.contains(&config.level.to_lowercase().as_str()) {
        return Err(ConfigError::Validation(format!(
            "logging level must be one of {}, got '{}'",
            LOG_LEVELS.join(", "),
            config.level
        )));
    }
    Ok(())
}

fn validate_source_config(config: &SourceConfig) -> Result<(), ConfigError> {
    for (name, value) in [
        ("graph-url", &config.graph_url),
        ("authority-url", &config.authority_url),
    ] {
        let url = Url::parse(value)
            .map_err(|e| ConfigError::InvalidUrl(format!("Invalid {} '{}': {}", name, value, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::Validation(format!(
                "{} must use HTTP(S), got '{}'",
                name, value
            )));
        }
    }
    if config.stall_timeout == 0 {
        return Err(ConfigError::Validation(
            "stall-timeout must be greater than 0".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        toml::from_str("[paths]\noutput-dir = \"./mirror\"\n").unwrap()
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate(&base_config()).is_ok());
    }

    #[test]
    fn test_thread_bounds() {
        let mut config = base_config();
        config.engine.num_threads = 65;
        assert!(validate(&config).is_err());

        config.engine.num_threads = 64;
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_zero_max_retry_rejected() {
        let mut config = base_config();
        config.engine.max_retry = 0;
        assert!(matches!(validate(&config), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_zero_intervals_rejected() {
        let mut config = base_config();
        config.engine.progress_save_interval = 0;
        assert!(validate(&config).is_err());

        let mut config = base_config();
        config.engine.db_backup_interval = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_zero_api_delay_allowed() {
        let mut config = base_config();
        config.engine.api_retry_delay = 0;
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_empty_output_dir_rejected() {
        let mut config = base_config();
        config.paths.output_dir = "  ".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_log_level() {
        let mut config = base_config();
        config.logging.level = "WARN".to_string();
        assert!(validate(&config).is_ok());

        config.logging.level = "loud".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_source_urls() {
        let mut config = base_config();
        config.source.graph_url = "not a url".to_string();
        assert!(matches!(validate(&config), Err(ConfigError::InvalidUrl(_))));

        let mut config = base_config();
        config.source.authority_url = "ftp://login.example.com".to_string();
        assert!(matches!(validate(&config), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_stall_timeout() {
        let mut config = base_config();
        assert_eq!(config.source.stall_timeout, 60);
        config.source.stall_timeout = 0;
        assert!(matches!(validate(&config), Err(ConfigError::Validation(_))));
    }
}
