//! Named entities of a loaded configuration
//!
//! Every namespace (instances, builds, revisions, variants, experiments) is
//! keyed by name; collisions and reserved names are rejected at load time.

use super::document::{
    BuildDoc, ConfigDocument, EnvironDoc, ExperimentDoc, InstanceGroupDoc, InstanceItemDoc,
    MatrixDoc, RevisionDoc, StepDoc, VariantDoc,
};
use crate::error::{Error, Result};
use crate::layout;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// File name of the configuration document inside the base directory
pub const CONFIG_FILE: &str = "experiments.yml";

fn stringify_environ(environ: &EnvironDoc) -> BTreeMap<String, String> {
    environ
        .iter()
        .map(|(k, v)| (k.clone(), v.to_string()))
        .collect()
}

fn check_reserved(name: &str) -> Result<()> {
    if name.starts_with('_') {
        return Err(Error::ReservedName(name.to_string()));
    }
    Ok(())
}

fn insert_unique<T>(map: &mut BTreeMap<String, T>, kind: &'static str, name: &str, value: T) -> Result<()> {
    check_reserved(name)?;
    if map.contains_key(name) {
        return Err(Error::Ambiguous {
            kind,
            name: name.to_string(),
        });
    }
    map.insert(name.to_string(), value);
    Ok(())
}

/// How the files backing an instance are named
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceFiles {
    /// One file named like the instance
    Single,
    /// `<name>.<ext>` for every extension
    Extensions(Vec<String>),
    /// Explicit list of file names
    Files(Vec<String>),
    /// The instance is only a name passed to the program
    Fileless,
}

#[derive(Debug, Clone)]
pub struct Instance {
    /// Name as written in the configuration, possibly with an extension
    pub yml_name: String,
    /// `yml_name` without its extension, used for run file names
    pub short_name: String,
    pub files: InstanceFiles,
    /// Instance sets this instance belongs to; `None` is the untagged set
    pub instsets: BTreeSet<Option<String>>,
    pub extra_args: Vec<String>,
    pub repo: Option<String>,
    pub generator: Option<Vec<String>>,
}

impl Instance {
    fn from_doc(group: &InstanceGroupDoc, item: &InstanceItemDoc) -> Self {
        let (yml_name, files, item_args) = match item {
            InstanceItemDoc::Name(name) => (name.clone(), None, Vec::new()),
            InstanceItemDoc::Detailed {
                name,
                files,
                extra_args,
            } => (name.clone(), files.clone(), extra_args.clone()),
        };

        let files = if group.repo.as_deref() == Some("fileless") {
            InstanceFiles::Fileless
        } else if let Some(files) = files {
            InstanceFiles::Files(files)
        } else if let Some(exts) = &group.extensions {
            InstanceFiles::Extensions(exts.clone())
        } else {
            InstanceFiles::Single
        };

        let instsets = match &group.set {
            None => BTreeSet::from([None]),
            Some(set) => set.clone().into_vec().into_iter().map(Some).collect(),
        };

        let short_name = Path::new(&yml_name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| yml_name.clone());

        let mut extra_args = group.extra_args.clone();
        extra_args.extend(item_args);

        Self {
            yml_name,
            short_name,
            files,
            instsets,
            extra_args,
            repo: group.repo.clone(),
            generator: group.generator.as_ref().map(|g| g.args.clone()),
        }
    }

    pub fn is_fileless(&self) -> bool {
        self.files == InstanceFiles::Fileless
    }

    /// Names of all backing files, relative to the instance directory
    pub fn filenames(&self) -> Vec<String> {
        match &self.files {
            InstanceFiles::Single => vec![self.yml_name.clone()],
            InstanceFiles::Extensions(exts) => exts
                .iter()
                .map(|ext| format!("{}.{}", self.yml_name, ext))
                .collect(),
            InstanceFiles::Files(files) => files.clone(),
            InstanceFiles::Fileless => Vec::new(),
        }
    }

    pub fn unique_filename(&self) -> Result<String> {
        let mut names = self.filenames();
        if names.len() != 1 {
            return Err(Error::InvalidConfig(format!(
                "The instance '{}' does not have a unique filename",
                self.yml_name
            )));
        }
        Ok(names.remove(0))
    }

    /// True if every backing file exists in `instance_dir`
    pub fn check_available(&self, instance_dir: &Path) -> bool {
        self.filenames()
            .iter()
            .all(|f| instance_dir.join(f).is_file())
    }
}

/// A single command executed during a build phase
#[derive(Debug, Clone)]
pub struct Step {
    pub args: Vec<String>,
    pub environ: BTreeMap<String, String>,
    pub workdir: Option<String>,
}

impl From<&StepDoc> for Step {
    fn from(doc: &StepDoc) -> Self {
        Self {
            args: doc.args.clone(),
            environ: stringify_environ(&doc.environ),
            workdir: doc.workdir.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuildInfo {
    pub name: String,
    pub git: Option<String>,
    pub recursive_clone: bool,
    pub requires: Vec<String>,
    pub regenerate: Vec<Step>,
    pub configure: Vec<Step>,
    pub compile: Vec<Step>,
    pub install: Vec<Step>,
    pub exports_python: Vec<String>,
    pub extra_paths: Vec<String>,
}

impl From<&BuildDoc> for BuildInfo {
    fn from(doc: &BuildDoc) -> Self {
        let steps = |v: &[StepDoc]| v.iter().map(Step::from).collect();
        Self {
            name: doc.name.clone(),
            git: doc.git.clone(),
            recursive_clone: doc.recursive_clone,
            requires: doc.requires.clone().map(|r| r.into_vec()).unwrap_or_default(),
            regenerate: steps(&doc.regenerate),
            configure: steps(&doc.configure),
            compile: steps(&doc.compile),
            install: steps(&doc.install),
            exports_python: doc.exports_python.clone().into_iter().collect(),
            extra_paths: doc.extra_paths.clone().map(|p| p.into_vec()).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revision {
    pub name: String,
    pub build_version: BTreeMap<String, String>,
    /// Develop revisions build from a local source tree without version control
    pub develop: bool,
}

impl From<&RevisionDoc> for Revision {
    fn from(doc: &RevisionDoc) -> Self {
        Self {
            name: doc.name.clone(),
            build_version: doc.build_version.clone(),
            develop: doc.develop,
        }
    }
}

impl Revision {
    pub fn version_for(&self, build: &str) -> Option<&str> {
        self.build_version.get(build).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessSettings {
    pub num_nodes: u32,
    pub procs_per_node: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadSettings {
    pub num_threads: u32,
}

fn process_settings(num_nodes: Option<u32>, procs_per_node: Option<u32>) -> Option<ProcessSettings> {
    num_nodes.map(|num_nodes| ProcessSettings {
        num_nodes,
        procs_per_node,
    })
}

#[derive(Debug, Clone)]
pub struct Variant {
    pub name: String,
    pub axis: String,
    pub extra_args: Vec<String>,
    pub environ: BTreeMap<String, String>,
    /// Set for dynamic variants, available as `@VARIANT_VALUE:<axis>@`
    pub value: Option<String>,
    pub process_settings: Option<ProcessSettings>,
    pub thread_settings: Option<ThreadSettings>,
}

impl Variant {
    fn from_doc(axis: &str, doc: &VariantDoc) -> Self {
        Self {
            name: doc.name.clone(),
            axis: axis.to_string(),
            extra_args: doc.extra_args.clone(),
            environ: stringify_environ(&doc.environ),
            value: doc.value.as_ref().map(|v| v.to_string()),
            process_settings: process_settings(doc.num_nodes, doc.procs_per_node),
            thread_settings: doc.num_threads.map(|num_threads| ThreadSettings { num_threads }),
        }
    }

    pub fn is_dynamic(&self) -> bool {
        self.value.is_some()
    }
}

/// Static description of an experiment
#[derive(Debug, Clone)]
pub struct ExperimentInfo {
    pub name: String,
    pub args: Vec<String>,
    pub environ: BTreeMap<String, String>,
    /// Timeout in seconds
    pub timeout: Option<f64>,
    /// Output extension that receives standard output directly
    pub stdout: Option<String>,
    pub output_extensions: BTreeSet<String>,
    /// `None` if the experiment does not use builds at all
    pub used_builds: Option<Vec<String>>,
    pub repeat: Option<u32>,
    pub workdir: Option<String>,
    pub process_settings: Option<ProcessSettings>,
    pub thread_settings: Option<ThreadSettings>,
    pub slurm_args: Vec<String>,
}

impl From<&ExperimentDoc> for ExperimentInfo {
    fn from(doc: &ExperimentDoc) -> Self {
        let stdout = doc.stdout.clone().or_else(|| {
            (doc.output.as_deref() == Some("stdout")).then(|| "out".to_string())
        });

        let mut output_extensions: BTreeSet<String> = doc
            .output_extensions
            .clone()
            .unwrap_or_default()
            .into_iter()
            .collect();
        output_extensions.extend(stdout.clone());

        Self {
            name: doc.name.clone(),
            args: doc.args.clone(),
            environ: stringify_environ(&doc.environ),
            timeout: doc.timeout,
            stdout,
            output_extensions,
            used_builds: doc.use_builds.clone(),
            repeat: doc.repeat,
            workdir: doc.workdir.clone(),
            process_settings: process_settings(doc.num_nodes, doc.procs_per_node),
            thread_settings: doc.num_threads.map(|num_threads| ThreadSettings { num_threads }),
            slurm_args: doc.slurm_args.clone(),
        }
    }
}

impl ExperimentInfo {
    pub fn uses_builds(&self) -> bool {
        self.used_builds.is_some()
    }

    pub fn used_builds(&self) -> &[String] {
        self.used_builds.as_deref().unwrap_or_default()
    }
}

/// A build descriptor pinned to a revision; derives all build directories
#[derive(Debug, Clone, Copy)]
pub struct Build<'a> {
    pub info: &'a BuildInfo,
    pub revision: &'a Revision,
    base_dir: &'a Path,
}

impl<'a> Build<'a> {
    pub fn name(&self) -> &'a str {
        &self.info.name
    }

    fn dir(&self, root: &str, suffix: &str) -> PathBuf {
        self.base_dir
            .join(root)
            .join(format!("{}@{}{}", self.info.name, self.revision.name, suffix))
    }

    /// Directory containing the sources: a git clone, or the develop tree
    pub fn source_dir(&self) -> PathBuf {
        if self.revision.develop {
            self.dir("develop", "")
        } else {
            self.dir("builds", ".clone")
        }
    }

    pub fn compile_dir(&self) -> PathBuf {
        if self.revision.develop {
            self.dir("dev-builds", ".compile")
        } else {
            self.dir("builds", ".compile")
        }
    }

    pub fn prefix_dir(&self) -> PathBuf {
        if self.revision.develop {
            self.dir("dev-builds", "")
        } else {
            self.dir("builds", "")
        }
    }

    /// Key of this build in the build cache document
    pub fn cache_key(&self) -> String {
        format!("{}@{}", self.info.name, self.revision.name)
    }
}

/// The entire loaded configuration of one base directory
#[derive(Debug, Clone)]
pub struct Config {
    base_dir: PathBuf,
    instdir: String,
    instances: BTreeMap<String, Instance>,
    build_infos: BTreeMap<String, BuildInfo>,
    revisions: BTreeMap<String, Revision>,
    variants: BTreeMap<String, Variant>,
    axes: BTreeMap<String, Vec<String>>,
    experiments: BTreeMap<String, ExperimentInfo>,
    matrix: Option<MatrixDoc>,
}

impl Config {
    /// Load `experiments.yml` from a base directory
    pub fn from_dir(base_dir: &Path) -> Result<Self> {
        let base_dir = base_dir.canonicalize()?;
        let content = std::fs::read_to_string(base_dir.join(CONFIG_FILE))?;
        let doc: ConfigDocument = serde_yaml::from_str(&content)?;
        Self::new(&base_dir, doc)
    }

    /// Build the entity maps from a parsed document
    pub fn new(base_dir: &Path, doc: ConfigDocument) -> Result<Self> {
        if !base_dir.is_absolute() {
            return Err(Error::InvalidConfig(format!(
                "base directory must be absolute: {}",
                base_dir.display()
            )));
        }

        let mut instances = BTreeMap::new();
        for group in &doc.instances {
            for item in &group.items {
                let inst = Instance::from_doc(group, item);
                let name = inst.short_name.clone();
                insert_unique(&mut instances, "instance", &name, inst)?;
            }
        }

        let mut build_infos = BTreeMap::new();
        for build in &doc.builds {
            insert_unique(&mut build_infos, "build", &build.name, BuildInfo::from(build))?;
        }

        let mut revisions = BTreeMap::new();
        for rev in &doc.revisions {
            insert_unique(&mut revisions, "revision", &rev.name, Revision::from(rev))?;
        }

        let mut variants = BTreeMap::new();
        let mut axes: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for axis in &doc.variants {
            check_reserved(&axis.axis)?;
            if axes.contains_key(&axis.axis) {
                return Err(Error::Ambiguous {
                    kind: "axis",
                    name: axis.axis.clone(),
                });
            }
            let mut names = Vec::with_capacity(axis.items.len());
            for item in &axis.items {
                insert_unique(&mut variants, "variant", &item.name, Variant::from_doc(&axis.axis, item))?;
                names.push(item.name.clone());
            }
            names.sort();
            axes.insert(axis.axis.clone(), names);
        }

        let mut experiments = BTreeMap::new();
        for exp in &doc.experiments {
            insert_unique(&mut experiments, "experiment", &exp.name, ExperimentInfo::from(exp))?;
        }

        let config = Self {
            base_dir: base_dir.to_path_buf(),
            instdir: doc.instdir,
            instances,
            build_infos,
            revisions,
            variants,
            axes,
            experiments,
            matrix: doc.matrix,
        };
        config.check_references()?;
        Ok(config)
    }

    fn check_references(&self) -> Result<()> {
        for exp in self.experiments.values() {
            for name in exp.used_builds() {
                self.get_build_info(name)?;
            }
        }
        for info in self.build_infos.values() {
            for name in &info.requires {
                self.get_build_info(name)?;
            }
        }
        Ok(())
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Directory that stores all instances
    pub fn instance_dir(&self) -> PathBuf {
        let rel = Path::new(&self.instdir);
        self.base_dir.join(rel.strip_prefix(".").unwrap_or(rel))
    }

    pub fn matrix(&self) -> Option<&MatrixDoc> {
        self.matrix.as_ref()
    }

    pub fn all_instances(&self) -> impl Iterator<Item = &Instance> {
        self.instances.values()
    }

    pub fn get_instance(&self, name: &str) -> Result<&Instance> {
        self.instances
            .get(name)
            .ok_or_else(|| Error::lookup("Instance", name))
    }

    /// Union of the instance sets of all instances
    pub fn all_instsets(&self) -> BTreeSet<Option<String>> {
        self.instances
            .values()
            .flat_map(|inst| inst.instsets.iter().cloned())
            .collect()
    }

    pub fn all_build_infos(&self) -> impl Iterator<Item = &BuildInfo> {
        self.build_infos.values()
    }

    pub fn get_build_info(&self, name: &str) -> Result<&BuildInfo> {
        self.build_infos
            .get(name)
            .ok_or_else(|| Error::lookup("Build", name))
    }

    pub fn all_revisions(&self) -> impl Iterator<Item = &Revision> {
        self.revisions.values()
    }

    pub fn get_revision(&self, name: &str) -> Result<&Revision> {
        self.revisions
            .get(name)
            .ok_or_else(|| Error::lookup("Revision", name))
    }

    /// Resolve a build for a revision; regular revisions must pin a version
    pub fn get_build<'a>(&'a self, name: &str, revision: &'a Revision) -> Result<Build<'a>> {
        let info = self.get_build_info(name)?;
        if !revision.develop && revision.version_for(name).is_none() {
            return Err(Error::MissingBuild {
                build: name.to_string(),
                revision: revision.name.clone(),
            });
        }
        Ok(Build {
            info,
            revision,
            base_dir: &self.base_dir,
        })
    }

    pub fn all_variants(&self) -> impl Iterator<Item = &Variant> {
        self.variants.values()
    }

    pub fn get_variant(&self, name: &str) -> Result<&Variant> {
        self.variants
            .get(name)
            .ok_or_else(|| Error::lookup("Variant", name))
    }

    /// Axis names in sorted order
    pub fn axes(&self) -> impl Iterator<Item = &str> {
        self.axes.keys().map(String::as_str)
    }

    /// Sorted variant names of an axis
    pub fn axis_variants(&self, axis: &str) -> Result<&[String]> {
        self.axes
            .get(axis)
            .map(Vec::as_slice)
            .ok_or_else(|| Error::lookup("Axis", axis))
    }

    pub fn all_experiment_infos(&self) -> impl Iterator<Item = &ExperimentInfo> {
        self.experiments.values()
    }

    pub fn get_experiment_info(&self, name: &str) -> Result<&ExperimentInfo> {
        self.experiments
            .get(name)
            .ok_or_else(|| Error::lookup("Experiment", name))
    }
}

/// An experiment on a revision with a variation; produced by expansion
#[derive(Debug, Clone)]
pub struct Experiment<'a> {
    pub info: &'a ExperimentInfo,
    pub revision: Option<&'a Revision>,
    /// Sorted by variant name, at most one variant per axis
    pub variation: Vec<&'a Variant>,
}

impl<'a> Experiment<'a> {
    pub fn name(&self) -> &'a str {
        &self.info.name
    }

    pub fn revision_name(&self) -> Option<&'a str> {
        self.revision.map(|r| r.name.as_str())
    }

    pub fn variation_names(&self) -> Vec<String> {
        self.variation.iter().map(|v| v.name.clone()).collect()
    }

    pub fn display_name(&self) -> String {
        layout::display_name(self.name(), &self.variation_names(), self.revision_name())
    }

    pub fn aux_subdir(&self, base_dir: &Path) -> PathBuf {
        layout::aux_subdir(base_dir, self.name(), &self.variation_names(), self.revision_name())
    }

    pub fn output_subdir(&self, base_dir: &Path) -> PathBuf {
        layout::output_subdir(base_dir, self.name(), &self.variation_names(), self.revision_name())
    }

    /// Process settings of the one overriding variant, else the experiment's
    pub fn effective_process_settings(&self) -> Result<Option<ProcessSettings>> {
        let mut found = None;
        for variant in &self.variation {
            if let Some(s) = variant.process_settings {
                if found.is_some() {
                    return Err(Error::InvalidConfig(format!(
                        "Process settings of '{}' overridden by multiple variants",
                        self.display_name()
                    )));
                }
                found = Some(s);
            }
        }
        Ok(found.or(self.info.process_settings))
    }

    /// Thread settings of the one overriding variant, else the experiment's
    pub fn effective_thread_settings(&self) -> Result<Option<ThreadSettings>> {
        let mut found = None;
        for variant in &self.variation {
            if let Some(s) = variant.thread_settings {
                if found.is_some() {
                    return Err(Error::InvalidConfig(format!(
                        "Thread settings of '{}' overridden by multiple variants",
                        self.display_name()
                    )));
                }
                found = Some(s);
            }
        }
        Ok(found.or(self.info.thread_settings))
    }
}

/// One repetition of an experiment on an instance; produced by expansion
#[derive(Debug, Clone)]
pub struct Run<'a> {
    pub experiment: Experiment<'a>,
    pub instance: &'a Instance,
    pub repetition: u32,
}

impl<'a> Run<'a> {
    pub fn identity(&self) -> layout::RunIdentity {
        layout::RunIdentity {
            experiment: self.experiment.name().to_string(),
            variation: self.experiment.variation_names(),
            revision: self.experiment.revision_name().map(str::to_string),
            instance: self.instance.short_name.clone(),
            repetition: self.repetition,
        }
    }

    pub fn display_name(&self) -> String {
        self.identity().display_name()
    }
}
