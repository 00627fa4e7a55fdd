//! Matrix expansion - resolves scope trees into experiments and runs

mod expand;
mod scope;

pub use expand::{expand_experiments, expand_runs, ExperimentKey};
pub use scope::{walk, ScopeNode, Selection};

use crate::config::{Config, Experiment, Run};
use crate::error::Result;

impl Config {
    /// Every experiment selected by the configured matrix
    pub fn all_experiments(&self) -> Result<Vec<Experiment<'_>>> {
        expand_experiments(self, &ScopeNode::from_config(self))
    }

    /// Every run selected by the configured matrix
    pub fn discover_all_runs(&self) -> Result<Vec<Run<'_>>> {
        expand_runs(self, &ScopeNode::from_config(self))
    }
}
