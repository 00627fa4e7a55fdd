//! Build dependency resolver - orders builds and drives their phases

mod cache;
mod driver;
mod order;

pub use cache::{BuildCache, Phase};
pub use driver::{host_parallelism, make_builds, BuildDriver, PhaseRequest, ProcessRunner, StepRunner};
pub use order::{compute_order, traverse_requirements};
