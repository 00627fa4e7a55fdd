//! Queue launcher: runs are stored as spec files and handed to the daemon

use super::{compile_checked, store_specfile, SpecFile};
use crate::config::{Config, Run};
use crate::context::Context;
use crate::error::Result;
use crate::queue::{client, job_id_for};
use crate::run::{create_run_file, lock_run, SubmissionMarker};

pub(super) fn submit(cfg: &Config, run: &Run<'_>, ctx: &Context) -> Result<bool> {
    let id = run.identity();
    let manifest = compile_checked(cfg, run)?;
    if !lock_run(cfg.base_dir(), &id)? {
        log::debug!("Skipping {}: already submitted", id.display_name());
        return Ok(false);
    }

    let specfile = store_specfile(&cfg.base_dir().join("aux").join("_queue"), &SpecFile::Single(manifest))?;
    // Job ids derive from the spec file name; the marker precedes the hand-off.
    let job_id = job_id_for(&specfile);
    let marker = SubmissionMarker {
        queue_jobid: Some(job_id.clone()),
        cluster_jobid: None,
    };
    let launched = create_run_file(cfg.base_dir(), &id, &marker)
        .and_then(|()| client::launch(&ctx.queue_socket, &specfile));
    match launched {
        Ok(accepted) if accepted != job_id => {
            log::warn!("Daemon queued {} as {}, expected {}", id.display_name(), accepted, job_id);
        }
        Ok(_) => {}
        Err(e) => {
            // Give the run back so it can be launched once the daemon is up.
            for path in [
                specfile,
                id.aux_file_path(cfg.base_dir(), "run"),
                id.aux_file_path(cfg.base_dir(), "lock"),
            ] {
                let _ = std::fs::remove_file(path);
            }
            return Err(e);
        }
    }
    log::info!("Queued {} as job {}", id.display_name(), job_id);
    Ok(true)
}
