//! expctl - Experiment Controller
//!
//! Expands a declarative experiment matrix into runs, builds the program
//! revisions those runs need, executes runs locally, through a queue daemon
//! or on a cluster, and tracks their status durably on disk.

pub mod build;
pub mod config;
pub mod context;
pub mod error;
pub mod instances;
pub mod launch;
pub mod layout;
pub mod matrix;
pub mod queue;
pub mod run;
pub mod status;
pub mod template;

// Re-exports
pub use config::{Config, Experiment, Run};
pub use context::Context;
pub use error::{Error, Result};
pub use launch::Launcher;
pub use layout::RunIdentity;
pub use matrix::ScopeNode;
pub use status::{Status, StatusCache};
