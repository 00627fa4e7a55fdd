//! Deterministic directory and file naming for runs
//!
//! `aux/<experiment>[~v1,v2][@revision]/<instance>.<ext>[<rep>]` holds files
//! that are not needed to evaluate a run (lock, submission marker, captured
//! streams); `output/...` holds results and the status document.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Identity of one run, independent of the live configuration
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunIdentity {
    pub experiment: String,
    pub variation: Vec<String>,
    pub revision: Option<String>,
    pub instance: String,
    pub repetition: u32,
}

fn subdir_name(experiment: &str, variation: &[String], revision: Option<&str>) -> String {
    let mut name = experiment.to_string();
    if !variation.is_empty() {
        name.push('~');
        name.push_str(&variation.join(","));
    }
    if let Some(rev) = revision {
        name.push('@');
        name.push_str(rev);
    }
    name
}

/// `<base>/aux/<experiment>[~variation][@revision]`
pub fn aux_subdir(base_dir: &Path, experiment: &str, variation: &[String], revision: Option<&str>) -> PathBuf {
    base_dir
        .join("aux")
        .join(subdir_name(experiment, variation, revision))
}

/// `<base>/output/<experiment>[~variation][@revision]`
pub fn output_subdir(
    base_dir: &Path,
    experiment: &str,
    variation: &[String],
    revision: Option<&str>,
) -> PathBuf {
    base_dir
        .join("output")
        .join(subdir_name(experiment, variation, revision))
}

/// `<instance>.<ext>[<rep>]`, the repetition suffix is omitted for repetition 0
pub fn run_file_name(ext: &str, instance: &str, repetition: u32) -> String {
    if repetition > 0 {
        format!("{}.{}[{}]", instance, ext, repetition)
    } else {
        format!("{}.{}", instance, ext)
    }
}

impl RunIdentity {
    pub fn aux_subdir(&self, base_dir: &Path) -> PathBuf {
        aux_subdir(base_dir, &self.experiment, &self.variation, self.revision.as_deref())
    }

    pub fn output_subdir(&self, base_dir: &Path) -> PathBuf {
        output_subdir(base_dir, &self.experiment, &self.variation, self.revision.as_deref())
    }

    pub fn aux_file_path(&self, base_dir: &Path, ext: &str) -> PathBuf {
        self.aux_subdir(base_dir)
            .join(run_file_name(ext, &self.instance, self.repetition))
    }

    pub fn output_file_path(&self, base_dir: &Path, ext: &str) -> PathBuf {
        self.output_subdir(base_dir)
            .join(run_file_name(ext, &self.instance, self.repetition))
    }

    /// Unique composite name, used as the status cache key
    pub fn composite_name(&self) -> String {
        format!(
            "{}/{}",
            subdir_name(&self.experiment, &self.variation, self.revision.as_deref()),
            run_file_name("run", &self.instance, self.repetition)
        )
    }

    /// `exp ~ v1, v2 @ rev`
    pub fn experiment_display_name(&self) -> String {
        display_name(&self.experiment, &self.variation, self.revision.as_deref())
    }

    /// `exp ~ v1, v2 @ rev/instance[rep]`
    pub fn display_name(&self) -> String {
        let mut name = format!("{}/{}", self.experiment_display_name(), self.instance);
        if self.repetition > 0 {
            name.push_str(&format!("[{}]", self.repetition));
        }
        name
    }
}

pub fn display_name(experiment: &str, variation: &[String], revision: Option<&str>) -> String {
    let mut name = experiment.to_string();
    if !variation.is_empty() {
        name.push_str(" ~ ");
        name.push_str(&variation.join(", "));
    }
    if let Some(rev) = revision {
        name.push_str(" @ ");
        name.push_str(rev);
    }
    name
}

/// Replace `path` with `contents` through a temporary file of this writer
///
/// Every writer renames its own complete file, so readers see either the
/// old or a new document, and concurrent writers do not disturb each other.
pub fn replace_file(path: &Path, contents: &[u8]) -> Result<()> {
    static NEXT_TMP: AtomicU64 = AtomicU64::new(0);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(
        ".{}.{}.{}.tmp",
        name,
        std::process::id(),
        NEXT_TMP.fetch_add(1, Ordering::Relaxed)
    ));
    let written = std::fs::write(&tmp, contents).and_then(|()| std::fs::rename(&tmp, path));
    if let Err(e) = written {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}
