//! Configuration model - parses experiments.yml into named entities

mod document;
mod model;

pub use document::{
    AxisDoc, BuildDoc, ConfigDocument, ExperimentDoc, InstanceGroupDoc, InstanceItemDoc, MatrixDoc,
    OneOrMany, RevisionDoc, ScalarValue, ScopeDoc, StepDoc, VariantDoc,
};
pub use model::{
    Build, BuildInfo, Config, Experiment, ExperimentInfo, Instance, InstanceFiles, ProcessSettings,
    Revision, Run, Step, ThreadSettings, Variant, CONFIG_FILE,
};
