/// Download status definitions for the per-file state machine
///
/// ```text
/// discovered -> downloading -> completed
///                    |
///                    +-----> failed (retry_count < max) -> downloading ...
///                    +-----> failed (retry_count = max)   terminal
/// ```
use std::fmt;

/// Represents the current status of a file task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DownloadStatus {
    /// Recorded by discovery, never attempted
    Discovered,

    /// Claimed by a worker
    Downloading,

    /// Transferred and moved into place
    Completed,

    /// Last attempt failed; retryable while the retry budget remains
    Failed,
}

impl DownloadStatus {
    /// Returns true if a record in this status may be claimed, given its retry count
    pub fn is_claimable(&self, retry_count: u32, max_retry: u32) -> bool {
        match self {
            Self::Discovered => true,
            Self::Failed => retry_count < max_retry,
            Self::Downloading | Self::Completed => false,
        }
    }

    /// Returns true if the record will never be picked up again without a reset
    pub fn is_terminal(&self, retry_count: u32, max_retry: u32) -> bool {
        match self {
            Self::Completed => true,
            Self::Failed => retry_count >= max_retry,
            Self::Discovered | Self::Downloading => false,
        }
    }

    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Downloading => "downloading",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "discovered" => Some(Self::Discovered),
            "downloading" => Some(Self::Downloading),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn all_statuses() -> Vec<Self> {
        vec![
            Self::Discovered,
            Self::Downloading,
            Self::Completed,
            Self::Failed,
        ]
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}
