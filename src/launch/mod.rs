//! Launch backends
//!
//! Every backend claims a run through its lock file before anything else, so
//! a run is never submitted twice, whichever backend is used.

mod cluster;
mod fork;
mod queue;

pub use cluster::ClusterLauncher;

use crate::config::{Config, Run};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::run::{compile_manifest, invoke_run, RunManifest};
use crate::status::StatusDoc;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Content of a stored spec file: one manifest, or one per array task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SpecFile {
    Array { manifests: Vec<RunManifest> },
    Single(RunManifest),
}

impl SpecFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Select the manifest to execute; arrays need the task index
    pub fn into_manifest(self, index: Option<usize>) -> Result<RunManifest> {
        match (self, index) {
            (SpecFile::Single(manifest), _) => Ok(manifest),
            (SpecFile::Array { mut manifests }, Some(i)) if i < manifests.len() => {
                Ok(manifests.swap_remove(i))
            }
            (SpecFile::Array { manifests }, Some(i)) => Err(Error::InvalidConfig(format!(
                "Array index {} out of range for {} manifests",
                i,
                manifests.len()
            ))),
            (SpecFile::Array { .. }, None) => Err(Error::InvalidConfig(
                "Spec file holds multiple manifests but no array index was given".to_string(),
            )),
        }
    }
}

/// Execute a stored spec file in this process
///
/// This is what queue workers and cluster jobs run.
pub async fn invoke_specfile(path: &Path, index: Option<usize>, ctx: &Context) -> Result<StatusDoc> {
    let manifest = SpecFile::load(path)?.into_manifest(index)?;
    invoke_run(&manifest, ctx, true).await
}

/// Compile a run's manifest and expand its command once
///
/// Unresolvable placeholders fail here, before the run is locked.
fn compile_checked(cfg: &Config, run: &Run<'_>) -> Result<RunManifest> {
    let manifest = compile_manifest(cfg, run)?;
    manifest.resolve()?;
    Ok(manifest)
}

/// Create `<dir>/<stamp>-<pid>-<n>-spec.yml` with a name no other submission uses
pub(crate) fn store_specfile(dir: &Path, spec: &SpecFile) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let content = serde_yaml::to_string(spec)?;
    let stamp = chrono::Local::now().format("%Y%m%d%H%M%S");
    let pid = std::process::id();

    for n in 0u32.. {
        let path = dir.join(format!("{}-{}-{}-spec.yml", stamp, pid, n));
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                file.write_all(content.as_bytes())?;
                return Ok(path);
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(Error::Submission(format!("no free spec file name in {}", dir.display())))
}

/// A launch backend
#[derive(Debug, Clone)]
pub enum Launcher {
    /// Run in this process, one after another
    Fork,
    /// Hand runs to the local queue daemon
    Queue,
    /// Submit to a batch scheduler
    Cluster(ClusterLauncher),
}

impl Launcher {
    /// Submit one run; returns `false` if it was already claimed
    pub async fn submit(&self, cfg: &Config, run: &Run<'_>, ctx: &Context) -> Result<bool> {
        match self {
            Launcher::Fork => fork::submit(cfg, run, ctx).await,
            Launcher::Queue => queue::submit(cfg, run, ctx),
            Launcher::Cluster(cluster) => Ok(cluster.submit_group(cfg, std::slice::from_ref(run), ctx)? > 0),
        }
    }

    /// Submit a batch of runs; returns how many were submitted
    pub async fn submit_multiple(&self, cfg: &Config, runs: &[Run<'_>], ctx: &Context) -> Result<usize> {
        match self {
            Launcher::Cluster(cluster) => cluster.submit_multiple(cfg, runs, ctx),
            _ => {
                let mut submitted = 0;
                for run in runs {
                    if self.submit(cfg, run, ctx).await? {
                        submitted += 1;
                    }
                }
                Ok(submitted)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::config::{Config, ConfigDocument};
    use std::path::Path;

    pub fn load(base: &Path, yml: &str) -> Config {
        let doc: ConfigDocument = serde_yaml::from_str(yml).unwrap();
        Config::new(base, doc).unwrap()
    }

    pub const TWO_EXPERIMENTS: &str = r#"
instances:
  - repo: local
    items: [a, b]
experiments:
  - name: hello
    args: ['sh', '-c', 'echo hello $0', '@REPETITION@']
    stdout: out
  - name: greet
    args: ['sh', '-c', 'echo hi']
    stdout: out
"#;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{probe, Status};
    use tempfile::TempDir;

    #[test]
    fn test_store_specfile_unique_names() {
        let dir = TempDir::new().unwrap();
        let cfg = testing::load(dir.path(), testing::TWO_EXPERIMENTS);
        let runs = cfg.discover_all_runs().unwrap();
        let manifest = crate::run::compile_manifest(&cfg, &runs[0]).unwrap();
        let spec = SpecFile::Single(manifest.clone());

        let first = store_specfile(&dir.path().join("q"), &spec).unwrap();
        let second = store_specfile(&dir.path().join("q"), &spec).unwrap();
        assert_ne!(first, second);
        assert!(first.to_string_lossy().ends_with("-spec.yml"));
        assert_eq!(SpecFile::load(&first).unwrap(), spec);
        assert_eq!(SpecFile::load(&first).unwrap().into_manifest(None).unwrap(), manifest);
    }

    #[test]
    fn test_array_spec_needs_index() {
        let dir = TempDir::new().unwrap();
        let cfg = testing::load(dir.path(), testing::TWO_EXPERIMENTS);
        let manifests: Vec<RunManifest> = cfg
            .discover_all_runs()
            .unwrap()
            .iter()
            .map(|r| crate::run::compile_manifest(&cfg, r).unwrap())
            .collect();
        let path = store_specfile(
            dir.path(),
            &SpecFile::Array {
                manifests: manifests.clone(),
            },
        )
        .unwrap();

        let loaded = SpecFile::load(&path).unwrap();
        assert!(loaded.clone().into_manifest(None).is_err());
        assert!(loaded.clone().into_manifest(Some(manifests.len())).is_err());
        assert_eq!(loaded.into_manifest(Some(1)).unwrap(), manifests[1]);
    }

    #[tokio::test]
    async fn test_fork_launch_runs_everything_once() {
        let dir = TempDir::new().unwrap();
        let cfg = testing::load(dir.path(), testing::TWO_EXPERIMENTS);
        let runs = cfg.discover_all_runs().unwrap();
        let ctx = Context::default();

        let submitted = Launcher::Fork.submit_multiple(&cfg, &runs, &ctx).await.unwrap();
        assert_eq!(submitted, 4);
        for run in &runs {
            assert_eq!(probe(cfg.base_dir(), &run.identity()).0, Status::Finished);
        }
        let out = std::fs::read_to_string(runs[2].identity().output_file_path(cfg.base_dir(), "out")).unwrap();
        assert_eq!(out, "hello 0\n");

        let again = Launcher::Fork.submit_multiple(&cfg, &runs, &ctx).await.unwrap();
        assert_eq!(again, 0);
    }

    #[tokio::test]
    async fn test_unresolved_placeholder_fails_before_locking() {
        let dir = TempDir::new().unwrap();
        let cfg = testing::load(
            dir.path(),
            r#"
instances:
  - repo: local
    items: [a]
experiments:
  - name: bad
    args: ['echo', '@NO_SUCH@']
"#,
        );
        let runs = cfg.discover_all_runs().unwrap();

        let err = Launcher::Fork
            .submit_multiple(&cfg, &runs, &Context::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Placeholder { .. }), "{:?}", err);
        let id = runs[0].identity();
        assert_eq!(probe(cfg.base_dir(), &id).0, Status::NotSubmitted);
        assert!(!id.aux_file_path(cfg.base_dir(), "lock").exists());
    }
}
