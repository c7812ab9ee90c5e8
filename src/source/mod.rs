//! Content source interface
//!
//! The engine talks to the remote store only through [`ContentSource`]. A Microsoft Graph
//! implementation ships in [`graph`]; tests substitute in-memory sources.

pub mod graph;

pub use graph::GraphContentSource;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Application credentials used to obtain a session
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
    pub tenant_id: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("tenant_id", &self.tenant_id)
            .finish()
    }
}

/// An authenticated handle to the content source
#[derive(Clone)]
pub struct SessionHandle {
    pub token: String,
    /// Incremented by the session manager on every successful refresh
    pub generation: u64,
    pub expires_at: Option<DateTime<Utc>>,
}

impl SessionHandle {
    pub fn new(token: impl Into<String>, expires_in: Option<Duration>) -> Self {
        let expires_at = expires_in
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| Utc::now() + d);
        Self {
            token: token.into(),
            generation: 0,
            expires_at,
        }
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("generation", &self.generation)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// A document library within a site
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryDescriptor {
    pub id: String,
    pub name: String,
}

/// A file listed by the content source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    /// Path relative to the library root, `/`-separated
    pub name: String,
    pub size: Option<u64>,
    pub remote_id: String,
}

/// Errors reported by a content source
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Permanent error: {0}")]
    Permanent(String),

    #[error("Authentication expired: {0}")]
    AuthExpired(String),

    #[error("Transfer interrupted: {0}")]
    Interrupted(String),
}

impl SourceError {
    /// Returns true if another attempt may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Transient(_) | Self::Interrupted(_)
        )
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    /// Returns true for errors that reflect pressure or failure on the remote API
    pub fn is_api_error(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Transient(_) | Self::AuthExpired(_)
        )
    }

    /// Returns true if the whole pool should back off before the next request
    pub fn pauses_pool(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Transient(_))
    }
}

/// The contract the engine requires from a remote content store
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Obtains a fresh session
    async fn authenticate(&self, credentials: &Credentials) -> Result<SessionHandle, SourceError>;

    /// Lists the document libraries of the site at `site_url`
    async fn list_libraries(
        &self,
        session: &SessionHandle,
        site_url: &str,
    ) -> Result<Vec<LibraryDescriptor>, SourceError>;

    /// Lists every file in a library, recursively
    async fn list_files(
        &self,
        session: &SessionHandle,
        library: &LibraryDescriptor,
    ) -> Result<Vec<RemoteFile>, SourceError>;

    /// Streams a file to `destination` and returns the number of bytes written
    async fn download(
        &self,
        session: &SessionHandle,
        remote_id: &str,
        destination: &Path,
    ) -> Result<u64, SourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let rate = SourceError::RateLimited {
            message: "slow down".to_string(),
            retry_after: None,
        };
        assert!(rate.is_retryable());
        assert!(rate.pauses_pool());
        assert!(rate.is_api_error());

        let interrupted = SourceError::Interrupted("reset".to_string());
        assert!(interrupted.is_retryable());
        assert!(!interrupted.pauses_pool());
        assert!(!interrupted.is_api_error());

        let permanent = SourceError::Permanent("404".to_string());
        assert!(permanent.is_permanent());
        assert!(!permanent.is_retryable());

        let auth = SourceError::AuthExpired("401".to_string());
        assert!(!auth.is_retryable());
        assert!(auth.is_api_error());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let creds = Credentials {
            client_id: "id".to_string(),
            client_secret: "hunter2".to_string(),
            tenant_id: "t".to_string(),
        };
        assert!(!format!("{:?}", creds).contains("hunter2"));

        let handle = SessionHandle::new("token-value", Some(Duration::from_secs(60)));
        assert!(!format!("{:?}", handle).contains("token-value"));
        assert!(handle.expires_at.is_some());
    }
}
