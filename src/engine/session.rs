//! Credential session management
//!
//! One [`SessionManager`] owns the current session handle for the whole engine. Readers clone
//! an `Arc` of the handle and use it for one operation; refreshes swap the handle atomically, so
//! holders of the old handle finish with it and pick up the new one on their next call.

use crate::source::{ContentSource, Credentials, SessionHandle};
use crate::MirrorError;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

/// Owns and refreshes the shared session handle
pub struct SessionManager {
    source: Arc<dyn ContentSource>,
    credentials: Credentials,
    current: RwLock<Option<Arc<SessionHandle>>>,
    /// Serializes refreshes so concurrent requests coalesce
    refresh_lock: AsyncMutex<()>,
    generation: AtomicU64,
    failed: AtomicBool,
    files_since_refresh: AtomicU64,
    max_files_per_session: u64,
    max_attempts: u32,
    retry_delay: Duration,
}

impl SessionManager {
    pub fn new(
        source: Arc<dyn ContentSource>,
        credentials: Credentials,
        max_files_per_session: u64,
        max_attempts: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            source,
            credentials,
            current: RwLock::new(None),
            refresh_lock: AsyncMutex::new(()),
            generation: AtomicU64::new(0),
            failed: AtomicBool::new(false),
            files_since_refresh: AtomicU64::new(0),
            max_files_per_session: max_files_per_session.max(1),
            max_attempts: max_attempts.max(1),
            retry_delay,
        }
    }

    /// Returns the current handle, authenticating first if there is none
    ///
    /// Fails with [`MirrorError::Credential`] while the manager is in the failed state.
    pub async fn get_session(&self) -> Result<Arc<SessionHandle>, MirrorError> {
        if self.is_failed() {
            return Err(MirrorError::Credential(
                "credential refresh attempts exhausted".to_string(),
            ));
        }
        let current = self.current.read().clone();
        match current {
            Some(handle) => Ok(handle),
            None => self.refresh_if_stale(0).await,
        }
    }

    /// Generation of the current handle, zero before the first authentication
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Unconditionally replaces the current handle
    pub async fn refresh(&self) -> Result<Arc<SessionHandle>, MirrorError> {
        self.refresh_if_stale(self.generation()).await
    }

    /// Refreshes unless a handle newer than `seen_generation` already exists
    ///
    /// Callers that observed a failure with a given handle pass its generation; the first one
    /// performs the refresh and the rest receive its result.
    pub async fn refresh_if_stale(
        &self,
        seen_generation: u64,
    ) -> Result<Arc<SessionHandle>, MirrorError> {
        let _guard = self.refresh_lock.lock().await;

        let current = self.current.read().clone();
        if !self.is_failed() {
            if let Some(handle) = current {
                if handle.generation > seen_generation {
                    debug!(
                        "Session already refreshed to generation {}",
                        handle.generation
                    );
                    return Ok(handle);
                }
            }
        }

        let mut last_error = None;
        for attempt in 1..=self.max_attempts {
            match self.source.authenticate(&self.credentials).await {
                Ok(mut handle) => {
                    let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
                    handle.generation = generation;
                    let handle = Arc::new(handle);
                    *self.current.write() = Some(Arc::clone(&handle));
                    self.files_since_refresh.store(0, Ordering::Release);
                    self.failed.store(false, Ordering::Release);
                    info!("Authenticated (session generation {})", generation);
                    return Ok(handle);
                }
                Err(e) => {
                    warn!(
                        "Authentication attempt {}/{} failed: {}",
                        attempt, self.max_attempts, e
                    );
                    last_error = Some(e);
                    if attempt < self.max_attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }

        self.failed.store(true, Ordering::Release);
        let message = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempts made".to_string());
        error!("Credential refresh failed: {}", message);
        Err(MirrorError::Credential(message))
    }

    /// Counts a processed file and reports whether the per-session budget is now used up
    pub fn record_file_processed(&self) -> bool {
        let count = self.files_since_refresh.fetch_add(1, Ordering::AcqRel) + 1;
        count == self.max_files_per_session
    }
}
