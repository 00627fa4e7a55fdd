//! Execution engine - supervises the child process of one run
//!
//! One loop per run multiplexes the child's pipes, its exit, optional
//! termination signals and a bounded sleep that paces timeout checks.

use super::manifest::RunManifest;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::status::{StatusDoc, EXECUTABLE_NOT_FOUND};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::signal::unix::{signal, Signal as SignalStream, SignalKind};

const CHUNK_SIZE: usize = 16 * 1024;
const DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

/// Writes a stream to a file that is only created once data arrives
pub struct LazyWriter {
    path: PathBuf,
    file: Option<File>,
}

impl LazyWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }

    pub async fn write(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        if self.file.is_none() {
            self.file = Some(File::create(&self.path).await?);
        }
        match &mut self.file {
            Some(file) => {
                file.write_all(chunk).await?;
                file.flush().await
            }
            None => Ok(()),
        }
    }
}

/// A child pipe paired with the writer that receives it
struct Capture<R> {
    reader: Option<R>,
    writer: LazyWriter,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> Capture<R> {
    fn new(reader: Option<R>, path: PathBuf) -> Self {
        Self {
            reader,
            writer: LazyWriter::new(path),
            buf: vec![0; CHUNK_SIZE],
        }
    }

    /// Read one chunk; pending forever once the pipe is closed
    async fn read(reader: &mut Option<R>, buf: &mut [u8]) -> std::io::Result<usize> {
        match reader {
            Some(r) => r.read(buf).await,
            None => std::future::pending().await,
        }
    }

    async fn handle(&mut self, read: std::io::Result<usize>) -> Result<()> {
        match read {
            Ok(0) => self.reader = None,
            Ok(n) => self.writer.write(&self.buf[..n]).await?,
            Err(e) => {
                log::warn!("Reading child output failed: {}", e);
                self.reader = None;
            }
        }
        Ok(())
    }

    /// Consume what is left after the child exited
    async fn drain(&mut self) -> Result<()> {
        while let Some(reader) = &mut self.reader {
            match tokio::time::timeout(DRAIN_TIMEOUT, reader.read(&mut self.buf)).await {
                Ok(Ok(0)) | Err(_) => self.reader = None,
                Ok(Ok(n)) => self.writer.write(&self.buf[..n]).await?,
                Ok(Err(e)) => {
                    log::warn!("Draining child output failed: {}", e);
                    self.reader = None;
                }
            }
        }
        Ok(())
    }
}

/// SIGTERM and SIGINT as readiness events
struct Interrupts {
    term: SignalStream,
    int: SignalStream,
}

impl Interrupts {
    fn new() -> Result<Self> {
        Ok(Self {
            term: signal(SignalKind::terminate())?,
            int: signal(SignalKind::interrupt())?,
        })
    }

    async fn recv(interrupts: &mut Option<Self>) {
        match interrupts {
            Some(s) => {
                tokio::select! {
                    _ = s.term.recv() => {}
                    _ = s.int.recv() => {}
                }
            }
            None => std::future::pending().await,
        }
    }
}

fn signal_name(status: &ExitStatus) -> Option<String> {
    let sig = status.signal()?;
    Some(match Signal::try_from(sig) {
        Ok(s) => s.as_str().to_string(),
        Err(_) => format!("SIG{}", sig),
    })
}

fn touch(path: &Path) -> Result<()> {
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    Ok(())
}

/// Record a start failure: diagnostic side file plus a terminal status
fn publish_spawn_failure(manifest: &RunManifest, args: &[String], err: &std::io::Error) -> Result<StatusDoc> {
    let kind = if err.kind() == std::io::ErrorKind::NotFound {
        EXECUTABLE_NOT_FOUND
    } else {
        "spawn_failed"
    };
    log::warn!("Cannot start {}: {}", args.join(" "), err);

    let diagnostic = format!(
        "Failed to start run {}\ncommand: {:?}\nerror: {}\ndetail: {:?}\n",
        manifest.identity().display_name(),
        args,
        err,
        err
    );
    std::fs::write(manifest.aux_file_path("stderr"), diagnostic)?;

    let doc = StatusDoc {
        timeout: false,
        walltime: 0.0,
        status: Some(-1),
        signal: None,
        error: Some(kind.to_string()),
    };
    doc.publish(&manifest.output_file_path("status"))?;
    Ok(doc)
}

/// Execute a run to completion and publish its status document
///
/// With `handle_signals`, SIGTERM and SIGINT kill the child; the status is
/// still published and `Error::Interrupted` is returned afterwards.
pub async fn invoke_run(manifest: &RunManifest, ctx: &Context, handle_signals: bool) -> Result<StatusDoc> {
    let id = manifest.identity();
    std::fs::create_dir_all(id.aux_subdir(&manifest.base_dir))?;
    std::fs::create_dir_all(id.output_subdir(&manifest.base_dir))?;

    let cmd = manifest.resolve()?;
    let Some((program, rest)) = cmd.args.split_first() else {
        return Err(Error::InvalidConfig(format!(
            "Experiment '{}' has no arguments",
            manifest.experiment
        )));
    };

    let stdout = match &manifest.stdout {
        Some(_) => Stdio::from(std::fs::File::create(&cmd.stdout_path)?),
        None => Stdio::piped(),
    };
    for ext in &manifest.output_extensions {
        if manifest.stdout.as_deref() != Some(ext.as_str()) {
            touch(&manifest.output_file_path(ext))?;
        }
    }

    let mut interrupts = if handle_signals {
        Some(Interrupts::new()?)
    } else {
        None
    };

    log::debug!("Starting {:?} in {}", cmd.args, cmd.workdir.display());
    let start = Instant::now();
    let spawned = Command::new(program)
        .args(rest)
        .current_dir(&cmd.workdir)
        .envs(&cmd.environ)
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(Stdio::piped())
        .spawn();
    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => return publish_spawn_failure(manifest, &cmd.args, &e),
    };
    let pid = child.id().map(|id| Pid::from_raw(id as i32));

    let mut out = Capture::new(child.stdout.take(), manifest.aux_file_path("stdout"));
    let mut err = Capture::new(child.stderr.take(), manifest.aux_file_path("stderr"));

    let timeout = manifest.timeout.map(Duration::from_secs_f64);
    let mut soft_signal_sent = false;
    let mut kill_sent = false;
    let mut interrupted = false;

    let exit = loop {
        let elapsed = start.elapsed();
        if let Some(timeout) = timeout {
            if elapsed > timeout + ctx.grace_period {
                if !kill_sent {
                    log::info!("Killing {} after grace period", id.display_name());
                    child.start_kill()?;
                    kill_sent = true;
                }
            } else if elapsed > timeout && !soft_signal_sent {
                if let Some(pid) = pid {
                    // The program may catch SIGXCPU and keep running.
                    if let Err(e) = kill(pid, Signal::SIGXCPU) {
                        log::warn!("Cannot signal {}: {}", id.display_name(), e);
                    }
                }
                soft_signal_sent = true;
            }
        }

        tokio::select! {
            status = child.wait() => break status?,
            read = Capture::read(&mut out.reader, &mut out.buf) => out.handle(read).await?,
            read = Capture::read(&mut err.reader, &mut err.buf) => err.handle(read).await?,
            _ = Interrupts::recv(&mut interrupts) => {
                log::warn!("Received termination signal; killing {}", id.display_name());
                child.start_kill()?;
                interrupts = None;
                interrupted = true;
            }
            _ = tokio::time::sleep(ctx.poll_interval) => {}
        }
    };

    out.drain().await?;
    err.drain().await?;
    let walltime = start.elapsed();

    let doc = StatusDoc {
        timeout: timeout.map_or(false, |t| walltime > t),
        walltime: walltime.as_secs_f64(),
        status: exit.code(),
        signal: signal_name(&exit),
        error: None,
    };
    doc.publish(&manifest.output_file_path("status"))?;
    log::info!("Run {} finished: {}", id.display_name(), doc.status());

    if interrupted {
        return Err(Error::Interrupted);
    }
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};
    use tempfile::TempDir;

    fn manifest(base: &Path, args: &[&str], timeout: Option<f64>, stdout: Option<&str>) -> RunManifest {
        RunManifest {
            base_dir: base.to_path_buf(),
            instance_dir: base.join("instances"),
            experiment: "exp".to_string(),
            variants: vec![],
            revision: None,
            instance: "inst".to_string(),
            instance_name: "inst".to_string(),
            instance_extensions: None,
            instance_files: None,
            instance_extra_args: vec![],
            instance_is_fileless: true,
            repetition: 0,
            builds: BTreeMap::new(),
            args: args.iter().map(|s| s.to_string()).collect(),
            environ: BTreeMap::new(),
            timeout,
            output_extensions: stdout.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
            stdout: stdout.map(str::to_string),
            workdir: None,
        }
    }

    fn fast_context() -> Context {
        Context {
            poll_interval: Duration::from_millis(50),
            ..Context::default()
        }
    }

    #[tokio::test]
    async fn test_finished_run_captures_stdout() {
        let dir = TempDir::new().unwrap();
        let m = manifest(dir.path(), &["sh", "-c", "echo hello"], None, Some("out"));
        let doc = invoke_run(&m, &fast_context(), false).await.unwrap();
        assert_eq!(doc.status, Some(0));
        assert_eq!(doc.status(), crate::status::Status::Finished);

        let out = std::fs::read_to_string(m.output_file_path("out")).unwrap();
        assert_eq!(out, "hello\n");
        // stderr was empty, so no file was created
        assert!(!m.aux_file_path("stderr").exists());
        assert_eq!(StatusDoc::read(&m.output_file_path("status")).unwrap(), doc);
    }

    #[tokio::test]
    async fn test_piped_streams_are_written_lazily() {
        let dir = TempDir::new().unwrap();
        let m = manifest(dir.path(), &["sh", "-c", "echo oops >&2; exit 3"], None, None);
        let doc = invoke_run(&m, &fast_context(), false).await.unwrap();
        assert_eq!(doc.status, Some(3));
        assert_eq!(doc.status(), crate::status::Status::Failed);
        assert_eq!(std::fs::read_to_string(m.aux_file_path("stderr")).unwrap(), "oops\n");
        assert!(!m.aux_file_path("stdout").exists());
    }

    #[tokio::test]
    async fn test_timeout_with_ignored_soft_signal() {
        let dir = TempDir::new().unwrap();
        let m = manifest(
            dir.path(),
            &["sh", "-c", "trap '' XCPU; sleep 2.5"],
            Some(1.0),
            None,
        );
        let doc = invoke_run(&m, &fast_context(), false).await.unwrap();
        assert!(doc.timeout);
        assert_eq!(doc.signal, None);
        assert_eq!(doc.status, Some(0));
    }

    #[tokio::test]
    async fn test_kill_after_grace_period() {
        let dir = TempDir::new().unwrap();
        let m = manifest(
            dir.path(),
            &["sh", "-c", "trap '' XCPU; exec sleep 30"],
            Some(0.3),
            None,
        );
        let ctx = Context {
            grace_period: Duration::from_millis(500),
            ..fast_context()
        };
        let started = Instant::now();
        let doc = invoke_run(&m, &ctx, false).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(doc.timeout);
        assert_eq!(doc.signal.as_deref(), Some("SIGKILL"));
        assert_eq!(doc.status, None);
    }

    #[tokio::test]
    async fn test_missing_executable() {
        let dir = TempDir::new().unwrap();
        let m = manifest(dir.path(), &["/nonexistent/program"], None, None);
        let doc = invoke_run(&m, &fast_context(), false).await.unwrap();
        assert_eq!(doc.status, Some(-1));
        assert_eq!(doc.error.as_deref(), Some(EXECUTABLE_NOT_FOUND));
        let diagnostic = std::fs::read_to_string(m.aux_file_path("stderr")).unwrap();
        assert!(!diagnostic.is_empty());
        assert_eq!(StatusDoc::read(&m.output_file_path("status")).unwrap(), doc);
    }
}
