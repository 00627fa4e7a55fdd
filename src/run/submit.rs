//! Submission markers: the per-run lock, the `.run` file, and purging

use crate::error::Result;
use crate::layout::RunIdentity;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::Path;

/// Content of the `.run` submission marker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionMarker {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_jobid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_jobid: Option<String>,
}

/// Claim a run by creating its lock file exclusively
///
/// Returns `false` if the run is already locked by someone else.
pub fn lock_run(base_dir: &Path, run: &RunIdentity) -> Result<bool> {
    std::fs::create_dir_all(run.aux_subdir(base_dir))?;
    std::fs::create_dir_all(run.output_subdir(base_dir))?;

    match OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(run.aux_file_path(base_dir, "lock"))
    {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Write the `.run` marker that signals a successful submission
pub fn create_run_file(base_dir: &Path, run: &RunIdentity, marker: &SubmissionMarker) -> Result<()> {
    let tmp = run.aux_file_path(base_dir, "run.tmp");
    std::fs::write(&tmp, serde_yaml::to_string(marker)?)?;
    std::fs::rename(&tmp, run.aux_file_path(base_dir, "run"))?;
    Ok(())
}

pub fn read_run_file(base_dir: &Path, run: &RunIdentity) -> Result<SubmissionMarker> {
    let content = std::fs::read_to_string(run.aux_file_path(base_dir, "run"))?;
    Ok(serde_yaml::from_str(&content)?)
}

fn remove_if_exists(path: &Path) -> Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Remove all markers and outputs of a run so it can be launched again
///
/// Returns the number of removed files.
pub fn purge_run<'a>(
    base_dir: &Path,
    run: &RunIdentity,
    output_extensions: impl IntoIterator<Item = &'a String>,
) -> Result<usize> {
    let mut removed = 0;
    for ext in ["status", "status.tmp", "out"] {
        removed += remove_if_exists(&run.output_file_path(base_dir, ext))? as usize;
    }
    for ext in output_extensions {
        removed += remove_if_exists(&run.output_file_path(base_dir, ext))? as usize;
    }
    for ext in ["stdout", "stderr", "run", "run.tmp", "lock"] {
        removed += remove_if_exists(&run.aux_file_path(base_dir, ext))? as usize;
    }
    Ok(removed)
}
