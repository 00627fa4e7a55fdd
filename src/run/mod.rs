//! Run execution engine - manifests, child supervision, submission markers

mod invoke;
mod manifest;
mod submit;

pub use invoke::{invoke_run, LazyWriter};
pub use manifest::{compile_manifest, BuildManifest, ResolvedCommand, RunManifest, VariantManifest};
pub use submit::{create_run_file, lock_run, purge_run, read_run_file, SubmissionMarker};
