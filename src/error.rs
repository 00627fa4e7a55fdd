//! Error types shared by the library

use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by configuration loading, expansion, builds, and the queue
#[derive(Debug, Error)]
pub enum Error {
    #[error("{kind} '{name}' does not exist")]
    Lookup { kind: &'static str, name: String },

    #[error("The {kind} name '{name}' is ambiguous")]
    Ambiguous { kind: &'static str, name: String },

    #[error("Names starting with an underscore are reserved: {0}")]
    ReservedName(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Builds have circular dependencies: {}", chain.join(" -> "))]
    CyclicDependency { chain: Vec<String> },

    #[error("Build '{build}' is required but revision '{revision}' does not specify a version for it")]
    MissingBuild { build: String, revision: String },

    #[error("{phase}-phase of build '{build}' failed: {detail}")]
    StepFailed {
        build: String,
        phase: String,
        detail: String,
    },

    #[error("`{command}` exited with {status}")]
    CommandFailed { command: String, status: String },

    #[error("Cannot expand @-parameter in '{template}': {reason}")]
    Placeholder { template: String, reason: String },

    #[error("Run was interrupted by a termination signal; the child process was killed")]
    Interrupted,

    #[error("Queue protocol error: {0}")]
    Protocol(String),

    #[error(
        "Stale queue socket at {0}: no daemon is listening. Remove it or restart the daemon with --force"
    )]
    StaleSocket(PathBuf),

    #[error("A queue daemon is already serving on {0}")]
    DaemonBusy(PathBuf),

    #[error("Cluster submission failed: {0}")]
    Submission(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn lookup(kind: &'static str, name: impl Into<String>) -> Self {
        Self::Lookup {
            kind,
            name: name.into(),
        }
    }

    pub(crate) fn placeholder(template: &str, reason: impl Into<String>) -> Self {
        Self::Placeholder {
            template: template.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
