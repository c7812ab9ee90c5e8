//! Credentials file parsing
//!
//! The file holds `KEY=VALUE` lines; `#` starts a comment line.

use crate::source::Credentials;
use crate::ConfigError;
use std::collections::HashMap;
use std::path::Path;

pub fn load_credentials(path: &Path) -> Result<Credentials, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    parse_credentials(&content)
}

pub fn parse_credentials(content: &str) -> Result<Credentials, ConfigError> {
    let mut values = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            values.insert(key.trim().to_uppercase(), value.trim().to_string());
        }
    }

    let mut take = |key: &str| {
        values
            .remove(key)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ConfigError::MissingCredential(key.to_string()))
    };

    Ok(Credentials {
        client_id: take("CLIENT_ID")?,
        client_secret: take("CLIENT_SECRET")?,
        tenant_id: take("TENANT_ID")?,
    })
}
