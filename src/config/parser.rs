use crate::config::types::Config;
use crate::config::validation::validate;
use crate::ConfigError;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

/// Loads and parses a configuration file from the given path
///
/// Environment overrides (`SITE_MIRROR_*`) are applied after parsing and before validation.
///
/// # Arguments
///
/// * `path` - Path to the TOML configuration file
///
/// # Returns
///
/// * `Ok(Config)` - Successfully loaded and validated configuration
/// * `Err(ConfigError)` - Failed to load, parse, or validate the configuration
///
/// # Example
///
/// ```no_run
/// use std::path::Path;
/// use site_mirror::config::load_config;
///
/// let config = load_config(Path::new("config.toml")).unwrap();
/// println!("Workers: {}", config.engine.num_threads);
/// ```
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;

    let mut config: Config = toml::from_str(&content)?;

    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;

    validate(&config)?;

    Ok(config)
}

/// Applies `SITE_MIRROR_*` overrides looked up through `lookup`
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let engine = &mut config.engine;
    override_number(&lookup, "SITE_MIRROR_THREADS", &mut engine.num_threads)?;
    override_number(&lookup, "SITE_MIRROR_MAX_RETRY", &mut engine.max_retry)?;
    override_number(&lookup, "SITE_MIRROR_BATCH_SIZE", &mut engine.batch_size)?;
    override_number(
        &lookup,
        "SITE_MIRROR_MAX_FILES",
        &mut engine.max_files_per_session,
    )?;
    override_number(&lookup, "SITE_MIRROR_API_DELAY", &mut engine.api_retry_delay)?;
    override_number(
        &lookup,
        "SITE_MIRROR_TOKEN_REFRESH",
        &mut engine.token_refresh_interval,
    )?;
    override_number(
        &lookup,
        "SITE_MIRROR_PROGRESS_INTERVAL",
        &mut engine.progress_save_interval,
    )?;
    override_number(
        &lookup,
        "SITE_MIRROR_DB_BACKUP_INTERVAL",
        &mut engine.db_backup_interval,
    )?;

    let paths = &mut config.paths;
    for (key, target) in [
        ("SITE_MIRROR_OUTPUT_DIR", &mut paths.output_dir),
        ("SITE_MIRROR_DB_PATH", &mut paths.database_path),
        ("SITE_MIRROR_LOG_DIR", &mut paths.log_dir),
    ] {
        if let Some(value) = lookup(key) {
            debug!("Config override {}={}", key, value);
            *target = value;
        }
    }

    Ok(())
}

fn override_number<F, T>(lookup: &F, key: &str, target: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(value) = lookup(key) {
        *target = value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidOverride {
                key: key.to_string(),
                value: value.clone(),
            })?;
        debug!("Config override {}={}", key, value);
    }
    Ok(())
}

/// Computes a SHA-256 hash of the configuration file content
///
/// This is recorded on every session so runs with different settings can be told apart.
pub fn compute_config_hash(path: &Path) -> Result<String, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let result = hasher.finalize();
    Ok(hex::encode(result))
}

/// Loads a configuration and returns both the config and its hash
pub fn load_config_with_hash(path: &Path) -> Result<(Config, String), ConfigError> {
    let config = load_config(path)?;
    let hash = compute_config_hash(path)?;
    Ok((config, hash))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    const MINIMAL: &str = r#"
[paths]
output-dir = "./mirror"
"#;

    #[test]
    fn test_load_valid_config() {
        let config_content = r#"
[engine]
num-threads = 8
max-retry = 4
api-retry-delay = 10

[paths]
output-dir = "./mirror"
sites-csv = "./sites.csv"
database-path = "./mirror/progress.db"

[logging]
level = "debug"
"#;

        let file = create_temp_config(config_content);
        let config = load_config(file.path()).unwrap();

        assert_eq!(config.engine.num_threads, 8);
        assert_eq!(config.engine.max_retry, 4);
        assert_eq!(config.engine.api_retry_delay, 10);
        assert_eq!(config.engine.batch_size, 1000);
        assert_eq!(config.paths.database_path, "./mirror/progress.db");
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_defaults_applied() {
        let config: Config = toml::from_str(MINIMAL).unwrap();

        assert_eq!(config.engine.num_threads, 5);
        assert_eq!(config.engine.max_retry, 3);
        assert_eq!(config.engine.max_files_per_session, 5000);
        assert_eq!(config.engine.token_refresh_interval, 2700);
        assert_eq!(config.engine.progress_save_interval, 300);
        assert_eq!(config.engine.db_backup_interval, 600);
        assert_eq!(config.paths.credentials_path, "./credentials.txt");
        assert_eq!(config.source.graph_url, "https://graph.microsoft.com/v1.0");
        assert!(!config.logging.debug);
    }

    #[test]
    fn test_load_config_with_invalid_path() {
        let result = load_config(Path::new("/nonexistent/config.toml"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_load_config_with_invalid_toml() {
        let file = create_temp_config("this is not valid TOML {{{");
        let result = load_config(file.path());
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_load_config_with_validation_error() {
        let config_content = r#"
[engine]
num-threads = 0

[paths]
output-dir = "./mirror"
"#;
        let file = create_temp_config(config_content);
        let result = load_config(file.path());
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_env_overrides() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        let env: HashMap<&str, &str> = [
            ("SITE_MIRROR_THREADS", "12"),
            ("SITE_MIRROR_API_DELAY", " 2 "),
            ("SITE_MIRROR_OUTPUT_DIR", "/data/mirror"),
        ]
        .into_iter()
        .collect();

        apply_env_overrides(&mut config, |key| env.get(key).map(|v| v.to_string())).unwrap();

        assert_eq!(config.engine.num_threads, 12);
        assert_eq!(config.engine.api_retry_delay, 2);
        assert_eq!(config.paths.output_dir, "/data/mirror");
        assert_eq!(config.engine.max_retry, 3);
    }

    #[test]
    fn test_invalid_env_override() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        let result = apply_env_overrides(&mut config, |key| {
            (key == "SITE_MIRROR_MAX_RETRY").then(|| "many".to_string())
        });

        match result {
            Err(ConfigError::InvalidOverride { key, value }) => {
                assert_eq!(key, "SITE_MIRROR_MAX_RETRY");
                assert_eq!(value, "many");
            }
            other => panic!("expected InvalidOverride, got {:?}", other),
        }
    }

    #[test]
    fn test_config_hash() {
        let file = create_temp_config(MINIMAL);
        let hash1 = compute_config_hash(file.path()).unwrap();
        let hash2 = compute_config_hash(file.path()).unwrap();

        assert_eq!(hash1, hash2);
        assert_eq!(hash1.len(), 64);

        let other = create_temp_config("[paths]\noutput-dir = \"./elsewhere\"\n");
        assert_ne!(hash1, compute_config_hash(other.path()).unwrap());
    }
}
