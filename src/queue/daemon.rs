//! Queue daemon - runs submitted manifests one after another
//!
//! A single dispatch loop owns all state. Connections are served by small
//! tasks that forward their request to the loop and write back its reply;
//! they are tracked by id in an arena so shutdown can finish or abort them.

use super::protocol::{JobStatusDict, LaunchResponse, Request, Response, ShowResponse};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::run::RunManifest;
use crate::status::Status;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::{HashMap, VecDeque};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::process::{Child, Command};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const REPLY_GRACE: Duration = Duration::from_millis(500);
/// How long a worker may take to publish its run's status after SIGTERM
const WORKER_STOP_GRACE: Duration = Duration::from_secs(5);

type ConnId = u64;

/// A request forwarded from a connection task to the dispatch loop
struct Incoming {
    conn: ConnId,
    request: Request,
    reply: oneshot::Sender<Response>,
}

/// Registration of one live connection
struct Registration {
    task: JoinHandle<()>,
    /// The loop already produced a reply that the task may still be writing
    answered: bool,
}

#[derive(Debug, Clone)]
struct Job {
    id: String,
    specfile: PathBuf,
    display_name: String,
}

struct Worker {
    job: Job,
    child: Child,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Serving,
    /// `stop` was received; finish the queue, accept nothing new
    Draining,
    Exit,
}

/// Job id of a stored manifest: its file name without the `-spec.yml` suffix
pub fn job_id_for(specfile: &Path) -> String {
    let name = specfile
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.strip_suffix("-spec.yml")
        .map(str::to_string)
        .unwrap_or(name)
}

/// Refuse to take over a socket path that is live or left behind
fn check_socket(path: &Path, force: bool) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    match std::os::unix::net::UnixStream::connect(path) {
        Ok(_) => Err(Error::DaemonBusy(path.to_path_buf())),
        Err(_) if force => {
            log::warn!("Removing stale socket {}", path.display());
            std::fs::remove_file(path)?;
            Ok(())
        }
        Err(_) => Err(Error::StaleSocket(path.to_path_buf())),
    }
}

async fn wait_worker(worker: &mut Option<Worker>) -> std::io::Result<ExitStatus> {
    match worker {
        Some(w) => w.child.wait().await,
        None => std::future::pending().await,
    }
}

/// Read one request line, hand it to the loop, write back the reply
async fn serve_connection(
    conn: ConnId,
    stream: UnixStream,
    requests: mpsc::Sender<Incoming>,
    closed: mpsc::UnboundedSender<ConnId>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut line = String::new();
    let response = match BufReader::new(read_half).read_line(&mut line).await {
        Err(e) => Response::error(format!("cannot read request: {}", e)),
        Ok(_) => match serde_json::from_str::<Request>(line.trim()) {
            Err(e) => Response::error(format!("malformed request: {}", e)),
            Ok(request) => {
                let (tx, rx) = oneshot::channel();
                let forwarded = requests
                    .send(Incoming {
                        conn,
                        request,
                        reply: tx,
                    })
                    .await;
                match forwarded {
                    Ok(()) => rx
                        .await
                        .unwrap_or_else(|_| Response::error("queue is shutting down")),
                    Err(_) => Response::error("queue is shutting down"),
                }
            }
        },
    };

    match serde_json::to_vec(&response) {
        Ok(mut bytes) => {
            bytes.push(b'\n');
            if let Err(e) = write_half.write_all(&bytes).await {
                log::debug!("Connection {} went away: {}", conn, e);
            }
            let _ = write_half.shutdown().await;
        }
        Err(e) => log::error!("Cannot encode reply: {}", e),
    }
    let _ = closed.send(conn);
}

pub struct QueueDaemon {
    ctx: Context,
    listener: UnixListener,
    socket_path: PathBuf,
    pending: VecDeque<Job>,
    current: Option<Worker>,
    completed: usize,
    mode: Mode,
    connections: HashMap<ConnId, Registration>,
    next_conn: ConnId,
}

impl QueueDaemon {
    /// Bind the socket from `ctx`; must be called inside a tokio runtime
    ///
    /// An existing socket with a listening daemon is `DaemonBusy`; one without
    /// is `StaleSocket` unless `force` removes it.
    pub fn bind(ctx: &Context, force: bool) -> Result<Self> {
        let socket_path = ctx.queue_socket.clone();
        check_socket(&socket_path, force)?;
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(&socket_path)?;
        log::info!("Serving on {}", socket_path.display());

        Ok(Self {
            ctx: ctx.clone(),
            listener,
            socket_path,
            pending: VecDeque::new(),
            current: None,
            completed: 0,
            mode: Mode::Serving,
            connections: HashMap::new(),
            next_conn: 0,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Dispatch until `stop` drained the queue, `kill`, or a termination signal
    pub async fn serve(mut self) -> Result<()> {
        let (req_tx, mut req_rx) = mpsc::channel::<Incoming>(16);
        let (closed_tx, mut closed_rx) = mpsc::unbounded_channel::<ConnId>();
        let mut term = signal(SignalKind::terminate())?;
        let mut int = signal(SignalKind::interrupt())?;

        let result = loop {
            if let Err(e) = self.start_next() {
                break Err(e);
            }
            if self.mode == Mode::Draining && self.current.is_none() && self.pending.is_empty() {
                log::info!("Queue drained, exiting");
                break Ok(());
            }
            if self.mode == Mode::Exit {
                break Ok(());
            }

            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => self.register(stream, req_tx.clone(), closed_tx.clone()),
                    Err(e) => log::warn!("Accept failed: {}", e),
                },
                Some(incoming) = req_rx.recv() => {
                    if let Some(reg) = self.connections.get_mut(&incoming.conn) {
                        reg.answered = true;
                    }
                    let response = self.dispatch(incoming.request).await;
                    let _ = incoming.reply.send(response);
                }
                Some(conn) = closed_rx.recv() => {
                    self.connections.remove(&conn);
                }
                status = wait_worker(&mut self.current) => {
                    if let Some(worker) = self.current.take() {
                        match status {
                            Ok(s) if s.success() => log::info!("Completed {}", worker.job.display_name),
                            Ok(s) => log::warn!("Worker for {} exited with {}", worker.job.display_name, s),
                            Err(e) => log::error!("Waiting for worker of {} failed: {}", worker.job.display_name, e),
                        }
                        self.completed += 1;
                    }
                }
                _ = term.recv() => {
                    log::warn!("Received SIGTERM");
                    self.kill_worker().await;
                    break Ok(());
                }
                _ = int.recv() => {
                    log::warn!("Received SIGINT");
                    self.kill_worker().await;
                    break Ok(());
                }
            }
        };

        self.shutdown().await;
        result
    }

    fn register(&mut self, stream: UnixStream, requests: mpsc::Sender<Incoming>, closed: mpsc::UnboundedSender<ConnId>) {
        let conn = self.next_conn;
        self.next_conn += 1;
        let task = tokio::spawn(serve_connection(conn, stream, requests, closed));
        self.connections.insert(
            conn,
            Registration {
                task,
                answered: false,
            },
        );
    }

    async fn dispatch(&mut self, request: Request) -> Response {
        match request {
            Request::Launch { specfile_path } => {
                if self.mode != Mode::Serving {
                    return Response::error("queue is stopping and accepts no new runs");
                }
                let manifest = match RunManifest::from_file(&specfile_path) {
                    Ok(m) => m,
                    Err(e) => {
                        return Response::error(format!(
                            "cannot read manifest {}: {}",
                            specfile_path.display(),
                            e
                        ))
                    }
                };
                let job = Job {
                    id: job_id_for(&specfile_path),
                    specfile: specfile_path,
                    display_name: manifest.identity().display_name(),
                };
                log::info!("Queued {} as job {}", job.display_name, job.id);
                let job_id = job.id.clone();
                self.pending.push_back(job);
                Response::Launched(LaunchResponse { job_id })
            }
            Request::Show => Response::Show(ShowResponse {
                current_run: self.current.as_ref().map(|w| w.job.display_name.clone()),
                pending_runs: self.pending.iter().map(|j| j.display_name.clone()).collect(),
                num_completed_runs: self.completed,
            }),
            Request::GetJobStatusDict => {
                let mut dict = JobStatusDict::new();
                if let Some(worker) = &self.current {
                    dict.insert(worker.job.id.clone(), Status::Started.code());
                }
                for job in &self.pending {
                    dict.insert(job.id.clone(), Status::Submitted.code());
                }
                Response::JobStatus(dict)
            }
            Request::Stop => {
                log::info!("Stop requested; draining {} pending runs", self.pending.len());
                self.mode = Mode::Draining;
                Response::ack()
            }
            Request::Kill => {
                log::info!("Kill requested");
                self.kill_worker().await;
                self.mode = Mode::Exit;
                Response::ack()
            }
        }
    }

    /// Start the next pending job if the worker slot is free
    fn start_next(&mut self) -> Result<()> {
        if self.current.is_some() || self.mode == Mode::Exit {
            return Ok(());
        }
        let Some(job) = self.pending.pop_front() else {
            return Ok(());
        };
        let Some((program, prefix)) = self.ctx.worker_command.split_first() else {
            return Err(Error::InvalidConfig("empty worker command".to_string()));
        };

        log::info!("Processing {}", job.display_name);
        let spawned = Command::new(program)
            .args(prefix)
            .arg(&job.specfile)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn();
        match spawned {
            Ok(child) => self.current = Some(Worker { job, child }),
            Err(e) => {
                log::error!("Cannot start worker for {}: {}", job.display_name, e);
                self.completed += 1;
            }
        }
        Ok(())
    }

    /// Stop the in-flight worker, giving it time to kill and record its run
    async fn kill_worker(&mut self) {
        let Some(mut worker) = self.current.take() else {
            return;
        };
        let name = worker.job.display_name.clone();
        log::warn!("Stopping worker of {}", name);

        if let Some(pid) = worker.child.id() {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                log::error!("Cannot signal worker of {}: {}", name, e);
            }
            match tokio::time::timeout(WORKER_STOP_GRACE, worker.child.wait()).await {
                Ok(Ok(status)) => {
                    log::info!("Worker of {} exited with {}", name, status);
                    self.completed += 1;
                    return;
                }
                Ok(Err(e)) => log::error!("Waiting for worker of {} failed: {}", name, e),
                Err(_) => log::warn!("Worker of {} did not exit after SIGTERM", name),
            }
        }
        if let Err(e) = worker.child.kill().await {
            log::error!("Cannot kill worker of {}: {}", name, e);
        }
    }

    async fn shutdown(&mut self) {
        for (_, reg) in self.connections.drain() {
            if reg.answered {
                if tokio::time::timeout(REPLY_GRACE, reg.task).await.is_err() {
                    log::debug!("Reply did not finish in time");
                }
            } else {
                reg.task.abort();
            }
        }
        match std::fs::remove_file(&self.socket_path) {
            Err(e) if e.kind() != ErrorKind::NotFound => {
                log::warn!("Cannot remove {}: {}", self.socket_path.display(), e)
            }
            _ => {}
        }
    }
}

/// Bind and serve on a fresh current-thread runtime
pub fn run_daemon(ctx: &Context, force: bool) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        let daemon = QueueDaemon::bind(ctx, force)?;
        daemon.serve().await
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_job_id_from_specfile() {
        assert_eq!(job_id_for(Path::new("/x/_queue/1700000000-42-spec.yml")), "1700000000-42");
        assert_eq!(job_id_for(Path::new("/x/other.yml")), "other.yml");
    }

    #[test]
    fn test_stale_socket_vs_busy() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("q.sock");

        let listener = std::os::unix::net::UnixListener::bind(&path).unwrap();
        assert!(matches!(check_socket(&path, false), Err(Error::DaemonBusy(_))));
        assert!(matches!(check_socket(&path, true), Err(Error::DaemonBusy(_))));
        drop(listener);

        assert!(path.exists());
        assert!(matches!(check_socket(&path, false), Err(Error::StaleSocket(_))));
        check_socket(&path, true).unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_show_and_stop() {
        let dir = TempDir::new().unwrap();
        let ctx = Context::default()
            .with_queue_socket(dir.path().join("q.sock"))
            .with_worker_command(vec!["true".to_string()]);
        let daemon = QueueDaemon::bind(&ctx, false).unwrap();
        let server = tokio::spawn(daemon.serve());

        let socket = ctx.queue_socket.clone();
        let show = tokio::task::spawn_blocking(move || super::super::client::show(&socket))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(show, ShowResponse::default());

        let socket = ctx.queue_socket.clone();
        tokio::task::spawn_blocking(move || super::super::client::stop(&socket))
            .await
            .unwrap()
            .unwrap();
        server.await.unwrap().unwrap();
        assert!(!ctx.queue_socket.exists());
    }
}
