//! Self-contained description of one run
//!
//! A manifest is compiled from the live configuration and then stands on its
//! own: it is stored as YAML and consumed by the execution engine, possibly in
//! another process or on another host.

use crate::config::{Config, InstanceFiles, Run};
use crate::error::{Error, Result};
use crate::layout::RunIdentity;
use crate::template::{self, Param};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantManifest {
    pub name: String,
    pub axis: String,
    pub extra_args: Vec<String>,
    pub environ: BTreeMap<String, String>,
    pub is_dynamic: bool,
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildManifest {
    pub source: PathBuf,
    pub compile: PathBuf,
    pub prefix: PathBuf,
    pub exports_python: Vec<String>,
    pub extra_paths: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub base_dir: PathBuf,
    pub instance_dir: PathBuf,
    pub experiment: String,
    pub variants: Vec<VariantManifest>,
    pub revision: Option<String>,
    /// Short name of the instance
    pub instance: String,
    /// Name of the instance as configured, including its extension
    pub instance_name: String,
    pub instance_extensions: Option<Vec<String>>,
    pub instance_files: Option<Vec<String>>,
    pub instance_extra_args: Vec<String>,
    pub instance_is_fileless: bool,
    pub repetition: u32,
    /// Used builds and everything they require
    pub builds: BTreeMap<String, BuildManifest>,
    pub args: Vec<String>,
    pub environ: BTreeMap<String, String>,
    pub timeout: Option<f64>,
    pub output_extensions: BTreeSet<String>,
    pub stdout: Option<String>,
    pub workdir: Option<String>,
}

/// Compile the manifest of a run
pub fn compile_manifest(cfg: &Config, run: &Run<'_>) -> Result<RunManifest> {
    let exp = &run.experiment;

    let mut builds = BTreeMap::new();
    if exp.info.uses_builds() {
        let revision = exp.revision.ok_or_else(|| {
            Error::InvalidConfig(format!("Experiment '{}' uses builds but has no revision", exp.name()))
        })?;

        let mut queue: VecDeque<String> = exp.info.used_builds().iter().cloned().collect();
        while let Some(name) = queue.pop_front() {
            if builds.contains_key(&name) {
                continue;
            }
            let build = cfg.get_build(&name, revision)?;
            queue.extend(build.info.requires.iter().cloned());
            builds.insert(
                name,
                BuildManifest {
                    source: build.source_dir(),
                    compile: build.compile_dir(),
                    prefix: build.prefix_dir(),
                    exports_python: build.info.exports_python.clone(),
                    extra_paths: build.info.extra_paths.clone(),
                },
            );
        }
    }

    let variants = exp
        .variation
        .iter()
        .map(|v| VariantManifest {
            name: v.name.clone(),
            axis: v.axis.clone(),
            extra_args: v.extra_args.clone(),
            environ: v.environ.clone(),
            is_dynamic: v.is_dynamic(),
            value: v.value.clone(),
        })
        .collect();

    let (instance_files, instance_extensions) = match &run.instance.files {
        InstanceFiles::Files(files) => (Some(files.clone()), None),
        InstanceFiles::Extensions(exts) => (None, Some(exts.clone())),
        InstanceFiles::Single | InstanceFiles::Fileless => (None, None),
    };

    Ok(RunManifest {
        base_dir: cfg.base_dir().to_path_buf(),
        instance_dir: cfg.instance_dir(),
        experiment: exp.name().to_string(),
        variants,
        revision: exp.revision_name().map(str::to_string),
        instance: run.instance.short_name.clone(),
        instance_name: run.instance.yml_name.clone(),
        instance_extensions,
        instance_files,
        instance_extra_args: run.instance.extra_args.clone(),
        instance_is_fileless: run.instance.is_fileless(),
        repetition: run.repetition,
        builds,
        args: exp.info.args.clone(),
        environ: exp.info.environ.clone(),
        timeout: exp.info.timeout,
        output_extensions: exp.info.output_extensions.clone(),
        stdout: exp.info.stdout.clone(),
        workdir: exp.info.workdir.clone(),
    })
}

/// A command ready to be spawned
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedCommand {
    pub args: Vec<String>,
    /// Variables set on top of the inherited environment
    pub environ: BTreeMap<String, String>,
    pub workdir: PathBuf,
    /// Where standard output ends up, also available as `@OUTPUT@`
    pub stdout_path: PathBuf,
}

fn prepend_env(var: &str, items: &[String]) -> String {
    let mut parts = items.to_vec();
    if let Ok(existing) = std::env::var(var) {
        if !existing.is_empty() {
            parts.push(existing);
        }
    }
    parts.join(":")
}

impl RunManifest {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    pub fn identity(&self) -> RunIdentity {
        RunIdentity {
            experiment: self.experiment.clone(),
            variation: self.variants.iter().map(|v| v.name.clone()).collect(),
            revision: self.revision.clone(),
            instance: self.instance.clone(),
            repetition: self.repetition,
        }
    }

    pub fn aux_file_path(&self, ext: &str) -> PathBuf {
        self.identity().aux_file_path(&self.base_dir, ext)
    }

    pub fn output_file_path(&self, ext: &str) -> PathBuf {
        self.identity().output_file_path(&self.base_dir, ext)
    }

    /// Output file of a declared extension
    pub fn qualified_output_file(&self, ext: &str) -> Result<PathBuf> {
        if !self.output_extensions.contains(ext) {
            return Err(Error::placeholder(
                &format!("@OUTPUT:{}@", ext),
                format!("unexpected output extension for experiment '{}'", self.experiment),
            ));
        }
        Ok(self.output_file_path(ext))
    }

    /// Path that receives standard output
    pub fn stdout_path(&self) -> Result<PathBuf> {
        match &self.stdout {
            Some(ext) => self.qualified_output_file(ext),
            None => Ok(self.aux_file_path("stdout")),
        }
    }

    fn variant_value(&self, axis: &str) -> Result<String> {
        let variant = self
            .variants
            .iter()
            .find(|v| v.axis == axis)
            .ok_or_else(|| {
                Error::placeholder(
                    &format!("@VARIANT_VALUE:{}@", axis),
                    format!("experiment '{}' does not use the axis '{}'", self.experiment, axis),
                )
            })?;
        match (&variant.value, variant.is_dynamic) {
            (Some(value), true) => Ok(value.clone()),
            _ => Err(Error::placeholder(
                &format!("@VARIANT_VALUE:{}@", axis),
                format!("the axis '{}' does not have dynamic variants", axis),
            )),
        }
    }

    fn build(&self, name: &str) -> Result<&BuildManifest> {
        self.builds.get(name).ok_or_else(|| {
            Error::placeholder(
                name,
                format!("experiment '{}' does not use the build '{}'", self.experiment, name),
            )
        })
    }

    fn qualified_instance_file(&self, identifier: &str) -> Result<PathBuf> {
        let fail = |reason: String| Error::placeholder(&format!("@INSTANCE:{}@", identifier), reason);
        if self.instance_is_fileless {
            return Err(fail(format!("the instance '{}' is fileless", self.instance)));
        }

        if let Ok(index) = identifier.parse::<usize>() {
            let files = self.instance_files.as_ref().ok_or_else(|| {
                fail(format!("instance '{}' does not declare files", self.instance))
            })?;
            let file = files
                .get(index)
                .ok_or_else(|| fail(format!("file index out of range: {}", index)))?;
            return Ok(self.instance_dir.join(file));
        }

        let exts = self.instance_extensions.as_ref().ok_or_else(|| {
            fail(format!("instance '{}' does not declare extensions", self.instance))
        })?;
        if !exts.iter().any(|e| e == identifier) {
            return Err(fail(format!(
                "unexpected file extension for instance '{}': .{}",
                self.instance, identifier
            )));
        }
        Ok(self
            .instance_dir
            .join(format!("{}.{}", self.instance_name, identifier)))
    }

    /// Value of a run placeholder, `None` for unknown names
    fn substitute(&self, param: &Param<'_>, stdout_path: &Path) -> Result<Option<String>> {
        let path = match param.name {
            "INSTANCE" => match param.arg {
                Some(identifier) => self.qualified_instance_file(identifier)?,
                None => {
                    if self.instance_is_fileless {
                        return Err(Error::placeholder(
                            "@INSTANCE@",
                            format!("the instance '{}' is fileless", self.instance),
                        ));
                    }
                    self.instance_dir.join(&self.instance_name)
                }
            },
            "REPETITION" => return Ok(Some(self.repetition.to_string())),
            "OUTPUT" => match param.arg {
                Some(ext) => self.qualified_output_file(ext)?,
                None => stdout_path.to_path_buf(),
            },
            "OUTPUT_SUBDIR" => self.identity().output_subdir(&self.base_dir),
            "SOURCE_DIR_FOR" => self.build(param.required_arg()?)?.source.clone(),
            "COMPILE_DIR_FOR" => self.build(param.required_arg()?)?.compile.clone(),
            "PREFIX_DIR_FOR" => self.build(param.required_arg()?)?.prefix.clone(),
            "VARIANT_VALUE" => return self.variant_value(param.required_arg()?).map(Some),
            "BASE_DIR" => self.base_dir.clone(),
            "INSTANCE_DIR" => self.instance_dir.clone(),
            _ => return Ok(None),
        };
        Ok(Some(path.display().to_string()))
    }

    /// Extra arguments of all variants followed by those of the instance
    pub fn extra_args(&self) -> Vec<String> {
        self.variants
            .iter()
            .flat_map(|v| v.extra_args.iter().cloned())
            .chain(self.instance_extra_args.iter().cloned())
            .collect()
    }

    /// Placeholders usable in a build's `extra_paths`
    fn substitute_extra_path(&self, build: &BuildManifest, param: &Param<'_>) -> Result<Option<String>> {
        let path = match param.name {
            "THIS_CLONE_DIR" | "THIS_SOURCE_DIR" => build.source.clone(),
            "THIS_COMPILE_DIR" => build.compile.clone(),
            "THIS_PREFIX_DIR" => build.prefix.clone(),
            "SOURCE_DIR_FOR" => self.build(param.required_arg()?)?.source.clone(),
            "COMPILE_DIR_FOR" => self.build(param.required_arg()?)?.compile.clone(),
            "PREFIX_DIR_FOR" => self.build(param.required_arg()?)?.prefix.clone(),
            "BASE_DIR" => self.base_dir.clone(),
            "INSTANCE_DIR" => self.instance_dir.clone(),
            _ => return Ok(None),
        };
        Ok(Some(path.display().to_string()))
    }

    /// Expand arguments, environment and working directory
    pub fn resolve(&self) -> Result<ResolvedCommand> {
        let stdout_path = self.stdout_path()?;
        let mut lookup = |p: &Param<'_>| self.substitute(p, &stdout_path);
        let args = template::expand_args(&self.args, &mut lookup, |name, lookup| {
            if name != "EXTRA_ARGS" {
                return Ok(None);
            }
            self.extra_args()
                .iter()
                .map(|arg| template::expand(arg, &mut *lookup))
                .collect::<Result<Vec<_>>>()
                .map(Some)
        })?;

        let mut paths = Vec::new();
        let mut ld_paths = Vec::new();
        let mut python_paths = Vec::new();
        for build in self.builds.values() {
            paths.push(build.prefix.join("bin").display().to_string());
            ld_paths.push(build.prefix.join("lib64").display().to_string());
            ld_paths.push(build.prefix.join("lib").display().to_string());
            for export in &build.exports_python {
                python_paths.push(build.prefix.join(export).display().to_string());
            }
        }
        for build in self.builds.values() {
            let mut extra = |p: &Param<'_>| self.substitute_extra_path(build, p);
            for path in &build.extra_paths {
                paths.push(template::expand(path, &mut extra)?);
            }
        }

        let mut environ = BTreeMap::new();
        environ.insert("PATH".to_string(), prepend_env("PATH", &paths));
        environ.insert("LD_LIBRARY_PATH".to_string(), prepend_env("LD_LIBRARY_PATH", &ld_paths));
        environ.insert("PYTHONPATH".to_string(), prepend_env("PYTHONPATH", &python_paths));

        let declared = self
            .environ
            .iter()
            .chain(self.variants.iter().flat_map(|v| v.environ.iter()));
        for (var, value) in declared {
            environ.insert(var.clone(), template::expand(value, &mut lookup)?);
        }

        let workdir = match &self.workdir {
            Some(w) => self.base_dir.join(template::expand(w, &mut lookup)?),
            None => self.base_dir.clone(),
        };

        Ok(ResolvedCommand {
            args,
            environ,
            workdir,
            stdout_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigDocument;
    use crate::matrix::{expand_runs, ScopeNode};

    const CONFIG: &str = r#"
instances:
  - repo: local
    items:
      - name: graph.txt
        extra_args: ['--directed']
  - repo: local
    extensions: [nodes, edges]
    items: [road]
builds:
  - name: solver
    git: https://example.com/solver.git
    requires: lib
    extra_paths: ['@THIS_PREFIX_DIR@/scripts']
  - name: lib
    exports_python: python
revisions:
  - name: main
    build_version: {solver: v1, lib: v2}
variants:
  - axis: threads
    items:
      - name: t4
        value: 4
        extra_args: ['--threads=@VARIANT_VALUE:threads@']
        environ: {OMP_NUM_THREADS: 4}
experiments:
  - name: solve
    use_builds: [solver]
    args: ['@PREFIX_DIR_FOR:solver@/bin/solve', '@INSTANCE@', '@EXTRA_ARGS@', '-o', '@OUTPUT:result@']
    environ:
      DATA: '@INSTANCE_DIR@/data'
    output_extensions: [result]
    stdout: out
    timeout: 10
  - name: edges
    args: ['count', '@INSTANCE:edges@', '@REPETITION@']
"#;

    fn config() -> Config {
        let doc: ConfigDocument = serde_yaml::from_str(CONFIG).unwrap();
        Config::new(Path::new("/exp"), doc).unwrap()
    }

    fn manifest_for(cfg: &Config, display: &str) -> RunManifest {
        let runs = expand_runs(cfg, &ScopeNode::all()).unwrap();
        let run = runs
            .iter()
            .find(|r| r.display_name() == display)
            .unwrap_or_else(|| panic!("no run {display}"));
        compile_manifest(cfg, run).unwrap()
    }

    #[test]
    fn test_compile_manifest_closure() {
        let cfg = config();
        let manifest = manifest_for(&cfg, "solve ~ t4 @ main/graph");
        assert_eq!(manifest.builds.len(), 2);
        assert_eq!(manifest.builds["lib"].prefix, PathBuf::from("/exp/builds/lib@main"));
        assert_eq!(manifest.instance_name, "graph.txt");
        assert_eq!(manifest.stdout.as_deref(), Some("out"));
        assert!(manifest.output_extensions.contains("out"));

        let yml = serde_yaml::to_string(&manifest).unwrap();
        let back: RunManifest = serde_yaml::from_str(&yml).unwrap();
        assert_eq!(back, manifest);
    }

    #[test]
    fn test_resolve_command() {
        let cfg = config();
        let manifest = manifest_for(&cfg, "solve ~ t4 @ main/graph");
        let cmd = manifest.resolve().unwrap();
        assert_eq!(
            cmd.args,
            vec![
                "/exp/builds/solver@main/bin/solve",
                "/exp/instances/graph.txt",
                "--threads=4",
                "--directed",
                "-o",
                "/exp/output/solve~t4@main/graph.result",
            ]
        );
        assert_eq!(cmd.stdout_path, PathBuf::from("/exp/output/solve~t4@main/graph.out"));
        assert_eq!(cmd.environ["OMP_NUM_THREADS"], "4");
        assert_eq!(cmd.environ["DATA"], "/exp/instances/data");
        assert!(cmd.environ["PATH"].starts_with("/exp/builds/lib@main/bin:/exp/builds/solver@main/bin"));
        assert!(cmd.environ["PATH"].contains("/exp/builds/solver@main/scripts"));
        assert!(cmd.environ["PYTHONPATH"].starts_with("/exp/builds/lib@main/python"));
        assert_eq!(cmd.workdir, PathBuf::from("/exp"));
    }

    #[test]
    fn test_instance_extension_placeholder() {
        let cfg = config();
        let manifest = manifest_for(&cfg, "edges ~ t4/road");
        let cmd = manifest.resolve().unwrap();
        assert_eq!(cmd.args, vec!["count", "/exp/instances/road.edges", "0"]);
        assert_eq!(cmd.stdout_path, PathBuf::from("/exp/aux/edges~t4/road.stdout"));

        let graph = manifest_for(&cfg, "edges ~ t4/graph");
        assert!(matches!(graph.resolve(), Err(Error::Placeholder { .. })));
    }

    #[test]
    fn test_unknown_placeholder() {
        let cfg = config();
        let mut manifest = manifest_for(&cfg, "edges ~ t4/road");
        manifest.args.push("@NO_SUCH_THING@".to_string());
        assert!(matches!(manifest.resolve(), Err(Error::Placeholder { .. })));
    }
}
