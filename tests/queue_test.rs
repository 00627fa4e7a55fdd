use assert_cmd::Command;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use predicates::prelude::*;
use std::path::{Path, PathBuf};
use std::process::{Child, Stdio};
use std::time::{Duration, Instant};
use tempfile::TempDir;

const CONFIG: &str = r#"
instances:
  - repo: fileless
    items: [only]
experiments:
  - name: first
    args: ['sh', '-c', 'echo start $(date +%s%N); sleep 1; echo end $(date +%s%N)']
    stdout: out
  - name: second
    args: ['sh', '-c', 'echo start $(date +%s%N); sleep 1; echo end $(date +%s%N)']
    stdout: out
"#;

const LONG_RUN: &str = r#"
instances:
  - repo: fileless
    items: [only]
experiments:
  - name: long
    args: ['sh', '-c', 'echo $$ > @BASE_DIR@/pid; exec sleep 37']
"#;

fn expctl(dir: &Path, socket: &Path) -> Command {
    let mut cmd = Command::cargo_bin("expctl").unwrap();
    cmd.arg("-C").arg(dir).arg("--socket").arg(socket);
    cmd
}

fn spawn_daemon(socket: &Path, force: bool) -> Child {
    let mut cmd = std::process::Command::new(assert_cmd::cargo::cargo_bin("expctl"));
    cmd.arg("--socket").arg(socket).args(["queue", "daemon"]);
    if force {
        cmd.arg("--force");
    }
    let child = cmd.stdout(Stdio::null()).spawn().unwrap();
    wait_for(Duration::from_secs(10), || socket.exists());
    child
}

fn wait_for(limit: Duration, mut done: impl FnMut() -> bool) {
    let start = Instant::now();
    while !done() {
        assert!(start.elapsed() < limit, "timed out after {:?}", limit);
        std::thread::sleep(Duration::from_millis(50));
    }
}

fn wait_exit(child: &mut Child) -> std::process::ExitStatus {
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait().unwrap() {
            return status;
        }
        if start.elapsed() > Duration::from_secs(10) {
            child.kill().unwrap();
            panic!("daemon did not exit");
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

fn stamps(path: PathBuf) -> (u128, u128) {
    let content = std::fs::read_to_string(path).unwrap();
    let value = |prefix: &str| -> u128 {
        content
            .lines()
            .find_map(|l| l.strip_prefix(prefix))
            .unwrap()
            .trim()
            .parse()
            .unwrap()
    };
    (value("start "), value("end "))
}

#[test]
fn test_queued_runs_execute_sequentially() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("experiments.yml"), CONFIG).unwrap();
    let socket = dir.path().join("queue.sock");
    let mut daemon = spawn_daemon(&socket, false);

    expctl(dir.path(), &socket)
        .args(["experiments", "launch", "--launcher", "queue"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Submitted 2 of 2 runs"));

    for exp in ["first", "second"] {
        let marker = std::fs::read_to_string(dir.path().join(format!("aux/{}/only.run", exp))).unwrap();
        assert!(marker.contains("queue_jobid"), "{}", marker);
    }

    let status_of = |exp: &str| dir.path().join(format!("output/{}/only.status", exp));
    wait_for(Duration::from_secs(30), || status_of("first").exists() && status_of("second").exists());

    let (_, first_end) = stamps(dir.path().join("output/first/only.out"));
    let (second_start, _) = stamps(dir.path().join("output/second/only.out"));
    assert!(second_start >= first_end, "second run started before the first one finished");

    expctl(dir.path(), &socket)
        .args(["queue", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Completed: 2"));

    expctl(dir.path(), &socket).args(["queue", "stop"]).assert().success();
    assert!(wait_exit(&mut daemon).success());
    assert!(!socket.exists());

    expctl(dir.path(), &socket)
        .args(["experiments", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("1 finished"));
}

#[test]
fn test_stale_socket_needs_force() {
    let dir = TempDir::new().unwrap();
    let socket = dir.path().join("queue.sock");
    drop(std::os::unix::net::UnixListener::bind(&socket).unwrap());
    assert!(socket.exists());

    expctl(dir.path(), &socket)
        .args(["queue", "daemon"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Stale queue socket"));

    let mut daemon = spawn_daemon(&socket, true);
    // The stale file existed before; wait until the daemon answers.
    wait_for(Duration::from_secs(10), || {
        std::os::unix::net::UnixStream::connect(&socket).is_ok()
    });
    expctl(dir.path(), &socket)
        .args(["queue", "daemon"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already serving"));

    expctl(dir.path(), &socket).args(["queue", "kill"]).assert().success();
    assert!(wait_exit(&mut daemon).success());
    assert!(!socket.exists());
}

/// Queue the long run and return the pid of its program once it is running
fn start_long_run(dir: &Path, socket: &Path) -> i32 {
    std::fs::write(dir.join("experiments.yml"), LONG_RUN).unwrap();
    expctl(dir, socket)
        .args(["experiments", "launch", "--launcher", "queue"])
        .assert()
        .success();

    let pid_file = dir.join("pid");
    wait_for(Duration::from_secs(10), || {
        std::fs::read_to_string(&pid_file).map_or(false, |p| p.ends_with('\n'))
    });
    std::fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap()
}

fn assert_run_was_killed(dir: &Path, pid: i32) {
    wait_for(Duration::from_secs(5), || {
        !Path::new(&format!("/proc/{}", pid)).exists()
    });
    let doc = std::fs::read_to_string(dir.join("output/long/only.status")).unwrap();
    assert!(doc.contains("signal: SIGKILL"), "{}", doc);

    expctl(dir, &dir.join("unused.sock"))
        .args(["experiments", "list", "--full"])
        .assert()
        .success()
        .stdout(predicate::str::contains("killed"));
}

#[test]
fn test_kill_stops_the_running_program() {
    let dir = TempDir::new().unwrap();
    let socket = dir.path().join("queue.sock");
    let mut daemon = spawn_daemon(&socket, false);
    let pid = start_long_run(dir.path(), &socket);

    expctl(dir.path(), &socket).args(["queue", "kill"]).assert().success();
    assert!(wait_exit(&mut daemon).success());
    assert_run_was_killed(dir.path(), pid);
}

#[test]
fn test_sigterm_stops_the_running_program() {
    let dir = TempDir::new().unwrap();
    let socket = dir.path().join("queue.sock");
    let mut daemon = spawn_daemon(&socket, false);
    let pid = start_long_run(dir.path(), &socket);

    kill(Pid::from_raw(daemon.id() as i32), Signal::SIGTERM).unwrap();
    assert!(wait_exit(&mut daemon).success());
    assert!(!socket.exists());
    assert_run_was_killed(dir.path(), pid);
}
