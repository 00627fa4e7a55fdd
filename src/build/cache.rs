//! Phase completion markers of builds
//!
//! The checkout marker is a file inside the source directory, so it vanishes
//! together with the clone. All later markers are kept in one JSON document
//! under `builds/build-cache.json`.

use crate::config::Build;
use crate::error::Result;
use crate::layout::replace_file;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

const CACHE_FILE: &str = "builds/build-cache.json";
const CHECKOUT_MARKER: &str = "checkedout.expctl";

/// Build phases in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Checkout,
    Regenerate,
    Configure,
    Compile,
    Install,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Checkout,
        Phase::Regenerate,
        Phase::Configure,
        Phase::Compile,
        Phase::Install,
    ];
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Checkout => write!(f, "checkout"),
            Self::Regenerate => write!(f, "regenerate"),
            Self::Configure => write!(f, "configure"),
            Self::Compile => write!(f, "compile"),
            Self::Install => write!(f, "install"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum Marker {
    Regenerated,
    Configured,
    Compiled,
    Installed,
}

impl Marker {
    fn for_phase(phase: Phase) -> Option<Self> {
        match phase {
            Phase::Checkout => None,
            Phase::Regenerate => Some(Self::Regenerated),
            Phase::Configure => Some(Self::Configured),
            Phase::Compile => Some(Self::Compiled),
            Phase::Install => Some(Self::Installed),
        }
    }
}

/// Markers of every build of a base directory
#[derive(Debug, Default)]
pub struct BuildCache {
    path: PathBuf,
    records: BTreeMap<String, BTreeSet<Marker>>,
}

impl BuildCache {
    /// Load the cache; a missing or unreadable document is an empty cache
    pub fn load(base_dir: &Path) -> Self {
        let path = base_dir.join(CACHE_FILE);
        let records = std::fs::read(&path)
            .ok()
            .and_then(|bytes| match serde_json::from_slice(&bytes) {
                Ok(records) => Some(records),
                Err(e) => {
                    log::warn!("Ignoring corrupt build cache {}: {}", path.display(), e);
                    None
                }
            })
            .unwrap_or_default();
        Self { path, records }
    }

    fn checkout_marker(build: &Build<'_>) -> PathBuf {
        build.source_dir().join(CHECKOUT_MARKER)
    }

    pub fn is_done(&self, build: &Build<'_>, phase: Phase) -> bool {
        match Marker::for_phase(phase) {
            None => Self::checkout_marker(build).is_file(),
            Some(marker) => self
                .records
                .get(&build.cache_key())
                .map_or(false, |r| r.contains(&marker)),
        }
    }

    /// Phases whose markers are present
    pub fn done_phases(&self, build: &Build<'_>) -> BTreeSet<Phase> {
        Phase::ALL
            .into_iter()
            .filter(|p| self.is_done(build, *p))
            .collect()
    }

    /// Drop the markers of `phase` and every later phase
    pub fn invalidate_from(&mut self, build: &Build<'_>, phase: Phase) -> Result<()> {
        match Marker::for_phase(phase) {
            None => {
                match std::fs::remove_file(Self::checkout_marker(build)) {
                    Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
                    _ => {}
                }
                self.records.remove(&build.cache_key());
            }
            Some(first) => {
                if let Some(record) = self.records.get_mut(&build.cache_key()) {
                    record.retain(|m| *m < first);
                }
            }
        }
        Ok(())
    }

    /// Record a finished phase and persist the document
    pub fn mark_done(&mut self, build: &Build<'_>, phase: Phase) -> Result<()> {
        match Marker::for_phase(phase) {
            None => {
                let marker = Self::checkout_marker(build);
                std::fs::write(marker, b"")?;
            }
            Some(marker) => {
                self.records
                    .entry(build.cache_key())
                    .or_default()
                    .insert(marker);
            }
        }
        self.save()
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        replace_file(&self.path, &serde_json::to_vec_pretty(&self.records)?)?;
        Ok(())
    }
}
