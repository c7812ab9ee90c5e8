/// Site status definitions
///
/// A site moves forward through these states; the only backward transition is an explicit
/// operator reset to `Pending`.
use std::fmt;

/// Represents the current status of a site being mirrored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SiteStatus {
    /// Referenced from the site list but not yet enumerated
    Pending,

    /// Enumeration has started; files may still be downloading
    Processing,

    /// Every file was downloaded
    Completed,

    /// Every file is terminal and at least one failed permanently
    CompletedWithErrors,

    /// Enumeration found no files
    Empty,
}

impl SiteStatus {
    /// Returns true if no further automatic transition happens from this status
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::CompletedWithErrors | Self::Empty
        )
    }

    /// Returns true if discovery should (re)enumerate a site in this status
    pub fn needs_discovery(&self) -> bool {
        matches!(self, Self::Pending | Self::Processing)
    }

    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::CompletedWithErrors => "completed_with_errors",
            Self::Empty => "empty",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "completed_with_errors" => Some(Self::CompletedWithErrors),
            "empty" => Some(Self::Empty),
            _ => None,
        }
    }

    /// Applies the terminal-state rule to a site's download counts
    ///
    /// `completed` and `failed` count terminal records only. A terminal site never moves, and a
    /// site with no records keeps its current status. Until `discovered` is set the record set
    /// may still grow, so the site can go no further than `Processing`.
    pub fn derive(current: Self, discovered: bool, total: u64, completed: u64, failed: u64) -> Self {
        if current.is_terminal() || total == 0 {
            return current;
        }
        if !discovered {
            Self::Processing
        } else if completed == total {
            Self::Completed
        } else if completed + failed == total {
            Self::CompletedWithErrors
        } else {
            Self::Processing
        }
    }

    /// Returns all possible site statuses
    pub fn all_statuses() -> Vec<Self> {
        vec![
            Self::Pending,
            Self::Processing,
            Self::Completed,
            Self::CompletedWithErrors,
            Self::Empty,
        ]
    }
}

impl fmt::Display for SiteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}
