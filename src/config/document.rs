//! Serde representation of `experiments.yml`
//!
//! Schema validation happens upstream; these types only give the document a
//! typed shape. Entity semantics live in [`super::model`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

fn default_instdir() -> String {
    "./instances".to_string()
}

/// Root of an `experiments.yml` document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigDocument {
    #[serde(default = "default_instdir")]
    pub instdir: String,
    #[serde(default)]
    pub instances: Vec<InstanceGroupDoc>,
    #[serde(default)]
    pub builds: Vec<BuildDoc>,
    #[serde(default)]
    pub revisions: Vec<RevisionDoc>,
    #[serde(default)]
    pub variants: Vec<AxisDoc>,
    #[serde(default)]
    pub experiments: Vec<ExperimentDoc>,
    pub matrix: Option<MatrixDoc>,
}

/// A value that may be written either as a scalar or as a list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            Self::One(v) => vec![v],
            Self::Many(v) => v,
        }
    }
}

/// Scalar YAML value used in environments and variant values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{}", v),
            Self::Int(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::Str(v) => write!(f, "{}", v),
        }
    }
}

pub type EnvironDoc = BTreeMap<String, ScalarValue>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceGroupDoc {
    pub repo: Option<String>,
    pub set: Option<OneOrMany<String>>,
    pub items: Vec<InstanceItemDoc>,
    pub extensions: Option<Vec<String>>,
    #[serde(default)]
    pub extra_args: Vec<String>,
    pub generator: Option<GeneratorDoc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InstanceItemDoc {
    Name(String),
    Detailed {
        name: String,
        files: Option<Vec<String>>,
        #[serde(default)]
        extra_args: Vec<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorDoc {
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepDoc {
    pub args: Vec<String>,
    #[serde(default)]
    pub environ: EnvironDoc,
    pub workdir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildDoc {
    pub name: String,
    pub git: Option<String>,
    #[serde(rename = "recursive-clone", default)]
    pub recursive_clone: bool,
    pub requires: Option<OneOrMany<String>>,
    #[serde(default)]
    pub regenerate: Vec<StepDoc>,
    #[serde(default)]
    pub configure: Vec<StepDoc>,
    #[serde(default)]
    pub compile: Vec<StepDoc>,
    #[serde(default)]
    pub install: Vec<StepDoc>,
    pub exports_python: Option<String>,
    pub extra_paths: Option<OneOrMany<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevisionDoc {
    pub name: String,
    #[serde(default)]
    pub build_version: BTreeMap<String, String>,
    #[serde(default)]
    pub develop: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AxisDoc {
    pub axis: String,
    pub items: Vec<VariantDoc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantDoc {
    pub name: String,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default)]
    pub environ: EnvironDoc,
    pub value: Option<ScalarValue>,
    pub num_nodes: Option<u32>,
    pub procs_per_node: Option<u32>,
    pub num_threads: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentDoc {
    pub name: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub environ: EnvironDoc,
    pub timeout: Option<f64>,
    /// `stdout` sends standard output to the `.out` output file
    pub output: Option<String>,
    /// Output extension that receives standard output
    pub stdout: Option<String>,
    pub output_extensions: Option<Vec<String>>,
    pub use_builds: Option<Vec<String>>,
    pub repeat: Option<u32>,
    pub workdir: Option<String>,
    pub num_nodes: Option<u32>,
    pub procs_per_node: Option<u32>,
    pub num_threads: Option<u32>,
    #[serde(default)]
    pub slurm_args: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatrixDoc {
    #[serde(default)]
    pub include: Vec<ScopeDoc>,
}

/// One node of the scope tree; nested `include` entries restrict further
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScopeDoc {
    pub experiments: Option<Vec<String>>,
    pub revisions: Option<Vec<String>>,
    pub axes: Option<Vec<String>>,
    pub variants: Option<Vec<String>>,
    pub instsets: Option<Vec<String>>,
    pub repeat: Option<u32>,
    #[serde(default)]
    pub include: Vec<ScopeDoc>,
}
