//! Local queue backend - a daemon that runs submitted manifests strictly one at a time

pub mod client;
mod daemon;
mod protocol;

pub use daemon::{job_id_for, run_daemon, QueueDaemon};
pub use protocol::{AckResponse, JobStatusDict, LaunchResponse, Request, Response, ShowResponse};
