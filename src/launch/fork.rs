//! Local launcher: runs execute in this process, one after another

use crate::config::{Config, Run};
use crate::context::Context;
use crate::error::Result;
use super::compile_checked;
use crate::run::{create_run_file, invoke_run, lock_run, SubmissionMarker};

pub(super) async fn submit(cfg: &Config, run: &Run<'_>, ctx: &Context) -> Result<bool> {
    let id = run.identity();
    let manifest = compile_checked(cfg, run)?;
    if !lock_run(cfg.base_dir(), &id)? {
        log::debug!("Skipping {}: already submitted", id.display_name());
        return Ok(false);
    }
    create_run_file(cfg.base_dir(), &id, &SubmissionMarker::default())?;

    log::info!("Launching {} on local machine", id.display_name());
    // An interruption is returned as an error and ends the whole batch.
    invoke_run(&manifest, ctx, true).await?;
    Ok(true)
}
