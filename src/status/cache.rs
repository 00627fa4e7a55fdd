//! Status cache - memoizes `probe` per base directory
//!
//! An entry is trusted only while no more specific marker exists, the marker
//! that produced it still has the recorded mtime, and that marker is of the
//! kind its status implies. Anything else triggers a full probe.

use super::probe::{probe, MarkerKind};
use super::Status;
use crate::error::Result;
use crate::layout::{replace_file, RunIdentity};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

const CACHE_FILE: &str = "aux/_status_cache.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Entry {
    status: Status,
    marker: MarkerKind,
    mtime_ns: u64,
}

fn mtime_ns(path: &Path) -> Option<u64> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    let since = modified.duration_since(UNIX_EPOCH).ok()?;
    u64::try_from(since.as_nanos()).ok()
}

pub struct StatusCache {
    base_dir: PathBuf,
    path: PathBuf,
    entries: BTreeMap<String, Entry>,
    dirty: bool,
    full_probes: usize,
}

impl StatusCache {
    /// Load the cache of a base directory; missing or corrupt means empty
    pub fn load(base_dir: &Path) -> Self {
        let path = base_dir.join(CACHE_FILE);
        let entries = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                log::warn!("Discarding corrupt status cache {}: {}", path.display(), e);
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        };
        Self {
            base_dir: base_dir.to_path_buf(),
            path,
            entries,
            dirty: false,
            full_probes: 0,
        }
    }

    /// Number of lookups that needed a full probe
    pub fn full_probes(&self) -> usize {
        self.full_probes
    }

    fn is_valid(&self, run: &RunIdentity, entry: &Entry) -> bool {
        if MarkerKind::implied_by(entry.status) != Some(entry.marker) {
            return false;
        }
        if entry
            .marker
            .more_specific()
            .any(|kind| kind.path(&self.base_dir, run).exists())
        {
            return false;
        }
        mtime_ns(&entry.marker.path(&self.base_dir, run)) == Some(entry.mtime_ns)
    }

    /// Current status of a run
    pub fn status(&mut self, run: &RunIdentity) -> Status {
        let key = run.composite_name();
        if let Some(entry) = self.entries.get(&key) {
            if self.is_valid(run, entry) {
                return entry.status;
            }
        }

        self.full_probes += 1;
        let (status, marker) = probe(&self.base_dir, run);
        let entry = marker.and_then(|marker| {
            mtime_ns(&marker.path(&self.base_dir, run)).map(|mtime_ns| Entry {
                status,
                marker,
                mtime_ns,
            })
        });
        match entry {
            Some(entry) => {
                if self.entries.get(&key) != Some(&entry) {
                    self.entries.insert(key, entry);
                    self.dirty = true;
                }
            }
            None => {
                if self.entries.remove(&key).is_some() {
                    self.dirty = true;
                }
            }
        }
        status
    }

    /// Rewrite the document atomically if any lookup changed it
    pub fn save(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        replace_file(&self.path, &serde_json::to_vec(&self.entries)?)?;
        self.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusDoc;
    use tempfile::TempDir;

    fn setup() -> (TempDir, RunIdentity) {
        let dir = TempDir::new().unwrap();
        let run = RunIdentity {
            experiment: "bubble-sort".to_string(),
            variation: vec![],
            revision: None,
            instance: "uniform".to_string(),
            repetition: 0,
        };
        std::fs::create_dir_all(run.aux_subdir(dir.path())).unwrap();
        std::fs::create_dir_all(run.output_subdir(dir.path())).unwrap();
        (dir, run)
    }

    fn finish(dir: &TempDir, run: &RunIdentity) {
        StatusDoc {
            timeout: false,
            walltime: 0.1,
            status: Some(0),
            signal: None,
            error: None,
        }
        .publish(&MarkerKind::StatusDoc.path(dir.path(), run))
        .unwrap();
    }

    #[test]
    fn test_terminal_status_is_served_from_cache() {
        let (dir, run) = setup();
        finish(&dir, &run);

        let mut cache = StatusCache::load(dir.path());
        assert_eq!(cache.status(&run), Status::Finished);
        cache.save().unwrap();

        let mut reloaded = StatusCache::load(dir.path());
        for _ in 0..3 {
            assert_eq!(reloaded.status(&run), Status::Finished);
        }
        assert_eq!(reloaded.full_probes(), 0);
    }

    #[test]
    fn test_more_specific_marker_invalidates() {
        let (dir, run) = setup();
        std::fs::write(MarkerKind::Output.path(dir.path(), &run), b"").unwrap();

        let mut cache = StatusCache::load(dir.path());
        assert_eq!(cache.status(&run), Status::Started);
        assert_eq!(cache.status(&run), Status::Started);
        assert_eq!(cache.full_probes(), 1);

        finish(&dir, &run);
        assert_eq!(cache.status(&run), Status::Finished);
        assert_eq!(cache.full_probes(), 2);
    }

    #[test]
    fn test_regression_after_purge() {
        let (dir, run) = setup();
        finish(&dir, &run);
        let mut cache = StatusCache::load(dir.path());
        assert_eq!(cache.status(&run), Status::Finished);

        std::fs::remove_file(MarkerKind::StatusDoc.path(dir.path(), &run)).unwrap();
        std::fs::write(MarkerKind::Lock.path(dir.path(), &run), b"").unwrap();
        assert_eq!(cache.status(&run), Status::InSubmission);

        std::fs::remove_file(MarkerKind::Lock.path(dir.path(), &run)).unwrap();
        assert_eq!(cache.status(&run), Status::NotSubmitted);
    }

    #[test]
    fn test_kind_mismatch_is_not_trusted() {
        let (dir, run) = setup();
        let out = MarkerKind::Output.path(dir.path(), &run);
        std::fs::write(&out, b"").unwrap();

        // A terminal status claiming to come from the output file
        let forged = BTreeMap::from([(
            run.composite_name(),
            Entry {
                status: Status::Finished,
                marker: MarkerKind::Output,
                mtime_ns: mtime_ns(&out).unwrap(),
            },
        )]);
        std::fs::write(dir.path().join(CACHE_FILE), serde_json::to_vec(&forged).unwrap()).unwrap();

        let mut cache = StatusCache::load(dir.path());
        assert_eq!(cache.status(&run), Status::Started);
        assert_eq!(cache.full_probes(), 1);
    }

    #[test]
    fn test_corrupt_cache_is_empty() {
        let (dir, run) = setup();
        std::fs::write(dir.path().join(CACHE_FILE), b"[[[").unwrap();
        let mut cache = StatusCache::load(dir.path());
        assert_eq!(cache.status(&run), Status::NotSubmitted);
        assert_eq!(cache.full_probes(), 1);
    }

    #[test]
    fn test_concurrent_saves() {
        let (dir, run) = setup();
        finish(&dir, &run);

        let savers: Vec<_> = (0..4)
            .map(|_| {
                let base = dir.path().to_path_buf();
                let run = run.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        let mut cache = StatusCache::load(&base);
                        assert_eq!(cache.status(&run), Status::Finished);
                        cache.dirty = true;
                        cache.save().unwrap();
                    }
                })
            })
            .collect();
        for saver in savers {
            saver.join().unwrap();
        }

        let mut cache = StatusCache::load(dir.path());
        assert_eq!(cache.status(&run), Status::Finished);
        assert_eq!(cache.full_probes(), 0);
    }
}
