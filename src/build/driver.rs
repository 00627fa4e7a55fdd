//! Drives builds through their phases

use super::cache::{BuildCache, Phase};
use super::order::{compute_order, traverse_requirements};
use crate::config::{Build, BuildInfo, Config, Revision, Step};
use crate::error::{Error, Result};
use crate::template::{self, Param};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::process::Command;

/// Executes one build step
pub trait StepRunner {
    fn run(&mut self, args: &[String], workdir: &Path, environ: &BTreeMap<String, String>) -> Result<()>;
}

/// Runs steps as child processes and waits for them
#[derive(Debug, Default)]
pub struct ProcessRunner;

impl StepRunner for ProcessRunner {
    fn run(&mut self, args: &[String], workdir: &Path, environ: &BTreeMap<String, String>) -> Result<()> {
        let Some((program, rest)) = args.split_first() else {
            return Err(Error::InvalidConfig("build step without arguments".to_string()));
        };
        log::debug!("Running {:?} in {}", args, workdir.display());
        let status = Command::new(program)
            .args(rest)
            .current_dir(workdir)
            .envs(environ)
            .status()?;
        if !status.success() {
            return Err(Error::CommandFailed {
                command: args.join(" "),
                status: status.to_string(),
            });
        }
        Ok(())
    }
}

/// Number of CPUs usable by this process, else the number of CPUs
pub fn host_parallelism() -> usize {
    use nix::sched::{sched_getaffinity, CpuSet};
    use nix::unistd::Pid;

    if let Ok(set) = sched_getaffinity(Pid::from_raw(0)) {
        let n = (0..CpuSet::count())
            .filter(|&i| set.is_set(i).unwrap_or(false))
            .count();
        if n > 0 {
            return n;
        }
    }
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn prepend_env(var: &str, items: &[PathBuf]) -> String {
    let mut parts: Vec<String> = items.iter().map(|p| p.display().to_string()).collect();
    if let Ok(existing) = std::env::var(var) {
        if !existing.is_empty() {
            parts.push(existing);
        }
    }
    parts.join(":")
}

/// Which phases were explicitly requested, e.g. by `--recompile`
#[derive(Debug, Clone, Default)]
pub struct PhaseRequest {
    requested: BTreeSet<Phase>,
}

impl PhaseRequest {
    pub fn new(phases: impl IntoIterator<Item = Phase>) -> Self {
        Self {
            requested: phases.into_iter().collect(),
        }
    }

    fn lowest(&self) -> Option<Phase> {
        self.requested.iter().next().copied()
    }
}

/// Drives builds of one revision
pub struct BuildDriver<'a, R: StepRunner> {
    cfg: &'a Config,
    revision: &'a Revision,
    runner: R,
    request: PhaseRequest,
    cache: BuildCache,
}

impl<'a, R: StepRunner> BuildDriver<'a, R> {
    pub fn new(cfg: &'a Config, revision: &'a Revision, runner: R) -> Self {
        Self {
            cfg,
            revision,
            runner,
            request: PhaseRequest::default(),
            cache: BuildCache::load(cfg.base_dir()),
        }
    }

    pub fn with_request(mut self, request: PhaseRequest) -> Self {
        self.request = request;
        self
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Make `names` and everything they require, dependencies first
    ///
    /// Ordering and version checks happen before any step runs.
    pub fn make(&mut self, names: &[String]) -> Result<()> {
        let desired = names
            .iter()
            .map(|n| self.cfg.get_build_info(n))
            .collect::<Result<Vec<_>>>()?;
        let order = compute_order(self.cfg, &desired)?;
        let builds = order
            .iter()
            .map(|info| self.cfg.get_build(&info.name, self.revision))
            .collect::<Result<Vec<_>>>()?;

        let listed: Vec<&str> = builds.iter().map(|b| b.name()).collect();
        log::info!("Making builds {} @ {}", listed.join(", "), self.revision.name);
        for build in &builds {
            self.make_one(build)?;
        }
        Ok(())
    }

    fn make_one(&mut self, build: &Build<'a>) -> Result<()> {
        let requirements = traverse_requirements(self.cfg, build.info)?;
        let required_builds = requirements
            .iter()
            .map(|info| self.cfg.get_build(&info.name, self.revision))
            .collect::<Result<Vec<_>>>()?;
        let pkgconfig: Vec<PathBuf> = required_builds
            .iter()
            .map(|b| b.prefix_dir().join("lib/pkgconfig"))
            .collect();

        let mut environ = BTreeMap::new();
        environ.insert("PKG_CONFIG_PATH".to_string(), prepend_env("PKG_CONFIG_PATH", &pkgconfig));

        let done = self.cache.done_phases(build);
        let lowest = self.request.lowest();
        let mut ran_earlier = false;
        for phase in Phase::ALL {
            let wanted = !done.contains(&phase)
                || lowest.map_or(false, |l| phase >= l)
                || ran_earlier;
            if !wanted {
                continue;
            }
            log::info!("Running {}-phase for build {}", phase, build.name());
            self.cache.invalidate_from(build, phase)?;
            self.run_phase(build, phase, &environ)?;
            self.cache.mark_done(build, phase)?;
            ran_earlier = true;
        }
        if !ran_earlier {
            log::info!("Nothing to do for {}", build.name());
        }
        Ok(())
    }

    fn run_phase(&mut self, build: &Build<'a>, phase: Phase, environ: &BTreeMap<String, String>) -> Result<()> {
        let info: &BuildInfo = build.info;
        let failed = |e: Error| Error::StepFailed {
            build: build.name().to_string(),
            phase: phase.to_string(),
            detail: e.to_string(),
        };

        match phase {
            Phase::Checkout => self.checkout(build).map_err(failed),
            Phase::Regenerate => self.run_steps(build, &info.regenerate, &build.source_dir(), environ).map_err(failed),
            Phase::Configure => {
                recreate_dir(&build.compile_dir())?;
                self.run_steps(build, &info.configure, &build.compile_dir(), environ).map_err(failed)
            }
            Phase::Compile => self.run_steps(build, &info.compile, &build.compile_dir(), environ).map_err(failed),
            Phase::Install => {
                recreate_dir(&build.prefix_dir())?;
                self.run_steps(build, &info.install, &build.compile_dir(), environ).map_err(failed)
            }
        }
    }

    fn checkout(&mut self, build: &Build<'a>) -> Result<()> {
        let source = build.source_dir();
        if build.revision.develop {
            // Develop sources are owned by the user and never touched.
            std::fs::create_dir_all(&source)?;
            return Ok(());
        }

        let Some(url) = &build.info.git else {
            return Err(Error::InvalidConfig(format!(
                "build '{}' does not declare a git repository",
                build.name()
            )));
        };
        let version = build.revision.version_for(build.name()).ok_or_else(|| Error::MissingBuild {
            build: build.name().to_string(),
            revision: build.revision.name.clone(),
        })?;

        if source.exists() {
            std::fs::remove_dir_all(&source)?;
        }
        let parent = source.parent().unwrap_or(self.cfg.base_dir());
        std::fs::create_dir_all(parent)?;

        let source_str = source.display().to_string();
        let mut clone = vec!["git".to_string(), "clone".to_string()];
        if build.info.recursive_clone {
            clone.push("--recursive".to_string());
        }
        clone.push(url.clone());
        clone.push(source_str.clone());
        self.runner.run(&clone, parent, &BTreeMap::new())?;

        let checkout = vec![
            "git".to_string(),
            "--git-dir".to_string(),
            format!("{}/.git", source_str),
            "--work-tree".to_string(),
            source_str,
            "checkout".to_string(),
            version.to_string(),
        ];
        self.runner.run(&checkout, parent, &BTreeMap::new())
    }

    fn run_steps(
        &mut self,
        build: &Build<'a>,
        steps: &[Step],
        default_workdir: &Path,
        base_environ: &BTreeMap<String, String>,
    ) -> Result<()> {
        let (cfg, revision) = (self.cfg, self.revision);
        for step in steps {
            let mut lookup = |p: &Param<'_>| substitute(cfg, revision, build, p);
            let args = template::expand_args(&step.args, &mut lookup, template::no_lists)?;
            let mut environ = base_environ.clone();
            for (var, value) in &step.environ {
                environ.insert(var.clone(), template::expand(value, &mut lookup)?);
            }
            let workdir = match &step.workdir {
                Some(w) => default_workdir.join(template::expand(w, &mut lookup)?),
                None => default_workdir.to_path_buf(),
            };
            self.runner.run(&args, &workdir, &environ)?;
        }
        Ok(())
    }
}

fn substitute(cfg: &Config, revision: &Revision, build: &Build<'_>, param: &Param<'_>) -> Result<Option<String>> {
    let other = |name: &str| cfg.get_build(name, revision);
    let path = match param.name {
        "THIS_CLONE_DIR" | "THIS_SOURCE_DIR" => build.source_dir(),
        "THIS_COMPILE_DIR" => build.compile_dir(),
        "THIS_PREFIX_DIR" => build.prefix_dir(),
        "SOURCE_DIR_FOR" => other(param.required_arg()?)?.source_dir(),
        "COMPILE_DIR_FOR" => other(param.required_arg()?)?.compile_dir(),
        "PREFIX_DIR_FOR" => other(param.required_arg()?)?.prefix_dir(),
        "BASE_DIR" => cfg.base_dir().to_path_buf(),
        "PARALLELISM" => return Ok(Some(host_parallelism().to_string())),
        _ => return Ok(None),
    };
    Ok(Some(path.display().to_string()))
}

fn recreate_dir(path: &Path) -> Result<()> {
    if path.exists() {
        std::fs::remove_dir_all(path)?;
    }
    std::fs::create_dir_all(path)?;
    Ok(())
}

/// Make builds with child processes
pub fn make_builds(cfg: &Config, revision: &Revision, names: &[String], request: PhaseRequest) -> Result<()> {
    BuildDriver::new(cfg, revision, ProcessRunner)
        .with_request(request)
        .make(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigDocument;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder {
        calls: Vec<(Vec<String>, PathBuf)>,
        fail_on: Option<String>,
    }

    impl StepRunner for Recorder {
        fn run(&mut self, args: &[String], workdir: &Path, _environ: &BTreeMap<String, String>) -> Result<()> {
            self.calls.push((args.to_vec(), workdir.to_path_buf()));
            if self.fail_on.as_deref() == args.first().map(String::as_str) {
                return Err(Error::CommandFailed {
                    command: args.join(" "),
                    status: "exit status: 1".to_string(),
                });
            }
            Ok(())
        }
    }

    const CONFIG: &str = r#"
builds:
  - name: app
    requires: lib
    configure:
      - args: ['configure', '--prefix=@THIS_PREFIX_DIR@', '--with-lib=@PREFIX_DIR_FOR:lib@']
    compile:
      - args: ['make', '-j@PARALLELISM@']
    install:
      - args: ['install']
  - name: lib
    compile:
      - args: ['make']
  - name: loop-a
    requires: loop-b
    compile:
      - args: ['make']
  - name: loop-b
    requires: loop-a
revisions:
  - name: dev
    develop: true
"#;

    fn config(dir: &TempDir) -> Config {
        let doc: ConfigDocument = serde_yaml::from_str(CONFIG).unwrap();
        Config::new(dir.path(), doc).unwrap()
    }

    fn programs(runner: &Recorder) -> Vec<String> {
        runner.calls.iter().map(|(a, _)| a[0].clone()).collect()
    }

    #[test]
    fn test_cycle_runs_nothing() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir);
        let rev = cfg.get_revision("dev").unwrap();
        let mut driver = BuildDriver::new(&cfg, rev, Recorder::default());
        let err = driver.make(&["loop-a".to_string()]).unwrap_err();
        assert!(matches!(err, Error::CyclicDependency { .. }));
        assert!(driver.runner().calls.is_empty());
    }

    #[test]
    fn test_dependencies_first_and_idempotent() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir);
        let rev = cfg.get_revision("dev").unwrap();

        let mut driver = BuildDriver::new(&cfg, rev, Recorder::default());
        driver.make(&["app".to_string()]).unwrap();
        assert_eq!(programs(driver.runner()), vec!["make", "configure", "make", "install"]);

        let (configure, _) = &driver.runner().calls[1];
        let lib_prefix = dir.path().join("dev-builds/lib@dev");
        assert_eq!(configure[2], format!("--with-lib={}", lib_prefix.display()));
        assert!(driver.runner().calls[2].0[1].starts_with("-j"));

        let mut again = BuildDriver::new(&cfg, rev, Recorder::default());
        again.make(&["app".to_string()]).unwrap();
        assert!(again.runner().calls.is_empty());
    }

    #[test]
    fn test_recompile_keeps_configure() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir);
        let rev = cfg.get_revision("dev").unwrap();
        BuildDriver::new(&cfg, rev, Recorder::default())
            .make(&["app".to_string()])
            .unwrap();

        let mut driver = BuildDriver::new(&cfg, rev, Recorder::default())
            .with_request(PhaseRequest::new([Phase::Compile]));
        driver.make(&["app".to_string()]).unwrap();
        // lib is recompiled too, since the request applies to every build
        assert_eq!(programs(driver.runner()), vec!["make", "make", "install"]);
    }

    #[test]
    fn test_failed_step_keeps_earlier_markers() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir);
        let rev = cfg.get_revision("dev").unwrap();
        let runner = Recorder {
            fail_on: Some("install".to_string()),
            ..Recorder::default()
        };
        let mut driver = BuildDriver::new(&cfg, rev, runner);
        let err = driver.make(&["app".to_string()]).unwrap_err();
        assert!(matches!(err, Error::StepFailed { ref phase, .. } if phase == "install"));

        let cache = BuildCache::load(dir.path());
        let app = cfg.get_build("app", rev).unwrap();
        assert!(cache.is_done(&app, Phase::Compile));
        assert!(!cache.is_done(&app, Phase::Install));
    }
}
