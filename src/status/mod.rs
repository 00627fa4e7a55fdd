//! Run status - derived from marker files, memoized in a status cache

mod cache;
mod probe;

pub use cache::StatusCache;
pub use probe::{probe, MarkerKind};

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Lifecycle state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    NotSubmitted,
    Submitted,
    InSubmission,
    Started,
    Finished,
    Timeout,
    Killed,
    Failed,
}

impl Status {
    /// Numeric code, as reported by the queue daemon
    pub fn code(self) -> u8 {
        match self {
            Self::NotSubmitted => 0,
            Self::Submitted => 1,
            Self::InSubmission => 2,
            Self::Started => 3,
            Self::Finished => 4,
            Self::Timeout => 5,
            Self::Killed => 6,
            Self::Failed => 7,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::NotSubmitted,
            1 => Self::Submitted,
            2 => Self::InSubmission,
            3 => Self::Started,
            4 => Self::Finished,
            5 => Self::Timeout,
            6 => Self::Killed,
            7 => Self::Failed,
            _ => return None,
        })
    }

    pub fn is_positive(self) -> bool {
        self == Self::Finished
    }

    pub fn is_neutral(self) -> bool {
        matches!(self, Self::InSubmission | Self::Submitted | Self::Started)
    }

    pub fn is_negative(self) -> bool {
        matches!(self, Self::Timeout | Self::Killed | Self::Failed)
    }

    pub fn is_terminal(self) -> bool {
        self.is_positive() || self.is_negative()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotSubmitted => write!(f, "not submitted"),
            Self::Submitted => write!(f, "submitted"),
            Self::InSubmission => write!(f, "in submission"),
            Self::Started => write!(f, "started"),
            Self::Finished => write!(f, "finished"),
            Self::Timeout => write!(f, "timeout"),
            Self::Killed => write!(f, "killed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Error recorded when the program of a run does not exist
pub const EXECUTABLE_NOT_FOUND: &str = "executable_not_found";

/// Terminal record of a run, published once the child has exited
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusDoc {
    /// The run exceeded its declared timeout
    pub timeout: bool,
    /// Wall clock seconds
    pub walltime: f64,
    /// Exit code; `-1` if the program could not be started
    pub status: Option<i32>,
    /// Name of the terminating signal
    pub signal: Option<String>,
    pub error: Option<String>,
}

impl StatusDoc {
    pub fn status(&self) -> Status {
        if self.timeout {
            Status::Timeout
        } else if self.signal.is_some() {
            Status::Killed
        } else if self.error.is_some() || self.status != Some(0) {
            Status::Failed
        } else {
            Status::Finished
        }
    }

    pub fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Write to `<path>.tmp` and rename, so readers never see a partial record
    pub fn publish(&self, path: &Path) -> Result<()> {
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        std::fs::write(&tmp, serde_yaml::to_string(self)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}
