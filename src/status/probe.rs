//! Prioritized probing of a run's marker files

use super::{Status, StatusDoc};
use crate::layout::RunIdentity;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The marker file that determined a status, most specific first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MarkerKind {
    /// `output/.../<inst>.status`
    StatusDoc,
    /// `output/.../<inst>.out`
    Output,
    /// `aux/.../<inst>.run`
    Submission,
    /// `aux/.../<inst>.lock`
    Lock,
}

impl MarkerKind {
    pub const ALL: [MarkerKind; 4] = [
        MarkerKind::StatusDoc,
        MarkerKind::Output,
        MarkerKind::Submission,
        MarkerKind::Lock,
    ];

    pub fn path(self, base_dir: &Path, run: &RunIdentity) -> PathBuf {
        match self {
            Self::StatusDoc => run.output_file_path(base_dir, "status"),
            Self::Output => run.output_file_path(base_dir, "out"),
            Self::Submission => run.aux_file_path(base_dir, "run"),
            Self::Lock => run.aux_file_path(base_dir, "lock"),
        }
    }

    /// The kind of marker a status can originate from
    pub fn implied_by(status: Status) -> Option<Self> {
        match status {
            Status::NotSubmitted => None,
            Status::InSubmission => Some(Self::Lock),
            Status::Submitted => Some(Self::Submission),
            Status::Started => Some(Self::Output),
            Status::Finished | Status::Timeout | Status::Killed | Status::Failed => {
                Some(Self::StatusDoc)
            }
        }
    }

    /// Kinds that take priority over this one
    pub fn more_specific(self) -> impl Iterator<Item = MarkerKind> {
        Self::ALL.into_iter().take_while(move |k| *k != self)
    }
}

/// Determine a run's status from its markers; also returns the deciding marker
///
/// An unreadable status document counts as a failed run.
pub fn probe(base_dir: &Path, run: &RunIdentity) -> (Status, Option<MarkerKind>) {
    let status_path = MarkerKind::StatusDoc.path(base_dir, run);
    if status_path.exists() {
        let status = match StatusDoc::read(&status_path) {
            Ok(doc) => doc.status(),
            Err(e) => {
                log::warn!("Cannot read {}: {}", status_path.display(), e);
                Status::Failed
            }
        };
        return (status, Some(MarkerKind::StatusDoc));
    }

    let rest = [
        (MarkerKind::Output, Status::Started),
        (MarkerKind::Submission, Status::Submitted),
        (MarkerKind::Lock, Status::InSubmission),
    ];
    for (kind, status) in rest {
        if kind.path(base_dir, run).exists() {
            return (status, Some(kind));
        }
    }
    (Status::NotSubmitted, None)
}
