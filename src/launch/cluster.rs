//! Batch-scheduler launcher (Slurm-style `sbatch` interface)
//!
//! Runs of one experiment are submitted together: a single run as a plain
//! job, several runs as a job array whose tasks pick their manifest by index.

use super::{compile_checked, store_specfile, SpecFile};
use crate::config::{Config, Run};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::layout::RunIdentity;
use crate::run::{create_run_file, lock_run, RunManifest, SubmissionMarker};
use regex::Regex;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::OnceLock;

/// Environment variable carrying the array task index inside a job
pub const ARRAY_INDEX_ENV: &str = "SLURM_ARRAY_TASK_ID";

fn jobid_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Submitted batch job (?P<jobid>\S+)").ok())
        .as_ref()
}

/// Extract the job id from the submission command's output
pub fn parse_job_id(output: &str) -> Option<String> {
    let caps = jobid_regex()?.captures(output)?;
    Some(caps["jobid"].to_string())
}

fn shell_quote(word: &str) -> String {
    if !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c))
    {
        return word.to_string();
    }
    format!("'{}'", word.replace('\'', r"'\''"))
}

#[derive(Debug, Clone)]
pub struct ClusterLauncher {
    /// Command reading the job script from stdin, e.g. `["sbatch"]`
    pub submit_cmd: Vec<String>,
    /// Partition to submit to; the scheduler's default if unset
    pub partition: Option<String>,
}

impl Default for ClusterLauncher {
    fn default() -> Self {
        Self {
            submit_cmd: vec!["sbatch".to_string()],
            partition: None,
        }
    }
}

impl ClusterLauncher {
    pub fn new(submit_cmd: Vec<String>) -> Self {
        Self {
            submit_cmd,
            partition: None,
        }
    }

    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = Some(partition.into());
        self
    }

    /// Group runs by experiment and submit each group as one job
    pub fn submit_multiple(&self, cfg: &Config, runs: &[Run<'_>], ctx: &Context) -> Result<usize> {
        let mut groups: BTreeMap<String, Vec<Run<'_>>> = BTreeMap::new();
        for run in runs {
            groups
                .entry(run.identity().experiment_display_name())
                .or_default()
                .push(run.clone());
        }

        let mut submitted = 0;
        for group in groups.values() {
            submitted += self.submit_group(cfg, group, ctx)?;
        }
        Ok(submitted)
    }

    /// Submit runs of a single experiment; returns how many were claimed
    pub(super) fn submit_group(&self, cfg: &Config, runs: &[Run<'_>], ctx: &Context) -> Result<usize> {
        let Some(first) = runs.first() else {
            return Ok(0);
        };
        let Some((program, prefix)) = self.submit_cmd.split_first() else {
            return Err(Error::Submission("empty submission command".to_string()));
        };
        let experiment = &first.experiment;
        let process = experiment.effective_process_settings()?;
        let threads = experiment.effective_thread_settings()?;

        let mut manifests = Vec::new();
        let mut locked: Vec<RunIdentity> = Vec::new();
        for run in runs {
            match claim(cfg, run) {
                Ok(Some(manifest)) => {
                    manifests.push(manifest);
                    locked.push(run.identity());
                }
                Ok(None) => {}
                Err(e) => {
                    release(cfg.base_dir(), &locked);
                    return Err(e);
                }
            }
        }
        if locked.is_empty() {
            return Ok(0);
        }

        let use_array = locked.len() > 1;
        let log_dir = cfg.base_dir().join("aux").join("_cluster");
        let spec = match use_array {
            true => SpecFile::Array { manifests },
            false => SpecFile::Single(manifests.remove(0)),
        };
        let specfile = match store_specfile(&log_dir, &spec) {
            Ok(path) => path,
            Err(e) => {
                release(cfg.base_dir(), &locked);
                return Err(e);
            }
        };

        let mut script = String::from("#!/bin/sh\n");
        let mut invoke: Vec<String> = ctx.worker_command.iter().map(|w| shell_quote(w)).collect();
        if use_array {
            invoke.push(format!("--array-index-env={}", ARRAY_INDEX_ENV));
        }
        invoke.push(shell_quote(&specfile.display().to_string()));
        script.push_str(&invoke.join(" "));
        script.push('\n');

        let mut args: Vec<String> = prefix.to_vec();
        args.extend(["-J".to_string(), experiment.display_name()]);
        if let Some(partition) = &self.partition {
            args.extend(["-p".to_string(), partition.clone()]);
        }
        if let Some(ps) = process {
            args.extend(["-N".to_string(), ps.num_nodes.to_string()]);
            if let Some(ppn) = ps.procs_per_node {
                args.extend(["--ntasks-per-node".to_string(), ppn.to_string()]);
            }
        }
        if let Some(ts) = threads {
            args.extend(["-c".to_string(), ts.num_threads.to_string()]);
        }
        let pattern = if use_array { "%A-%a" } else { "%A" };
        args.extend([
            "-o".to_string(),
            log_dir.join(format!("{}.out", pattern)).display().to_string(),
            "-e".to_string(),
            log_dir.join(format!("{}.err", pattern)).display().to_string(),
        ]);
        if use_array {
            args.push(format!("--array=0-{}", locked.len() - 1));
        }
        args.extend(experiment.info.slurm_args.iter().cloned());

        for id in &locked {
            log::info!("Submitting {} to {}", id.display_name(), program);
        }
        let job_id = match submit_script(program, &args, &script) {
            Ok(job_id) => job_id,
            Err(e) => {
                release(cfg.base_dir(), &locked);
                let _ = std::fs::remove_file(&specfile);
                return Err(e);
            }
        };

        for (idx, id) in locked.iter().enumerate() {
            let cluster_jobid = match use_array {
                true => format!("{}_{}", job_id, idx),
                false => job_id.clone(),
            };
            create_run_file(
                cfg.base_dir(),
                id,
                &SubmissionMarker {
                    queue_jobid: None,
                    cluster_jobid: Some(cluster_jobid),
                },
            )?;
        }
        Ok(locked.len())
    }
}

/// Compile and lock one run; `None` if someone else holds it
fn claim(cfg: &Config, run: &Run<'_>) -> Result<Option<RunManifest>> {
    let manifest = compile_checked(cfg, run)?;
    let id = run.identity();
    if !lock_run(cfg.base_dir(), &id)? {
        log::debug!("Skipping {}: already submitted", id.display_name());
        return Ok(None);
    }
    Ok(Some(manifest))
}

/// Give locked runs back after a failed submission
fn release(base_dir: &Path, locked: &[RunIdentity]) {
    for id in locked {
        if let Err(e) = std::fs::remove_file(id.aux_file_path(base_dir, "lock")) {
            log::warn!("Cannot release {}: {}", id.display_name(), e);
        }
    }
}

/// Pipe the script into the submission command and return the job id
fn submit_script(program: &str, args: &[String], script: &str) -> Result<String> {
    log::debug!("Running {} {}", program, args.join(" "));
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .map_err(|e| Error::Submission(format!("cannot run {}: {}", program, e)))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(script.as_bytes())?;
    }
    let output = child.wait_with_output()?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() {
        return Err(Error::Submission(format!(
            "{} exited with {}: {}",
            program,
            output.status,
            stdout.trim()
        )));
    }
    parse_job_id(&stdout)
        .ok_or_else(|| Error::Submission(format!("no job id in output of {}: {}", program, stdout.trim())))
}
