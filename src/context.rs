//! Runtime settings threaded through launchers, the execution engine and the queue

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Time a run may exceed its timeout after the soft signal before it is killed
pub const TIMEOUT_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Upper bound of one readiness wait in the supervising loops
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

const QUEUE_SOCKET_ENV: &str = "EXPCTL_QUEUE_SOCKET";

/// Explicit settings replacing process-wide flags
#[derive(Debug, Clone)]
pub struct Context {
    /// Path of the queue daemon's Unix socket
    pub queue_socket: PathBuf,
    /// Grace period between soft signal and kill
    pub grace_period: Duration,
    /// Bounded readiness wait of the supervising loops
    pub poll_interval: Duration,
    /// Command prefix that runs the execution engine on a stored manifest.
    /// The manifest path is appended as last argument.
    pub worker_command: Vec<String>,
}

impl Default for Context {
    fn default() -> Self {
        let worker = std::env::current_exe()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| "expctl".to_string());

        Self {
            queue_socket: default_queue_socket(),
            grace_period: TIMEOUT_GRACE_PERIOD,
            poll_interval: POLL_INTERVAL,
            worker_command: vec![worker, "internal-invoke".to_string()],
        }
    }
}

impl Context {
    pub fn with_queue_socket(mut self, path: impl AsRef<Path>) -> Self {
        self.queue_socket = path.as_ref().to_path_buf();
        self
    }

    pub fn with_worker_command(mut self, command: Vec<String>) -> Self {
        self.worker_command = command;
        self
    }
}

/// `$EXPCTL_QUEUE_SOCKET`, else `~/.extlq.sock`
pub fn default_queue_socket() -> PathBuf {
    if let Some(path) = std::env::var_os(QUEUE_SOCKET_ENV) {
        return PathBuf::from(path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".extlq.sock")
}
