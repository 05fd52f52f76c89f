//! Bounded execution of one external process.
//!
//! Agents and judges are both plain subprocesses. [`run_process`] starts the
//! child in its own process group, feeds it an optional prompt on stdin,
//! collects stdout and stderr interleaved in arrival order, and makes sure
//! nothing it started survives the call: on timeout or cancellation the
//! whole group gets SIGTERM, then SIGKILL once the grace window runs out.
//! When the child exits on its own, anything it left running in its group
//! is swept the same way.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Time between SIGTERM and SIGKILL.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

/// How long to keep reading output after the child has exited. Bounds the
/// wait when an orphaned grandchild still holds the pipes open.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// What to run and under which limits.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Extra environment, merged over the inherited one.
    pub env: BTreeMap<String, String>,
    /// Written to the child's stdin, which is then closed.
    pub stdin: Option<String>,
    pub timeout: Duration,
    pub kill_grace: Duration,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: BTreeMap::new(),
            stdin: None,
            timeout,
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }
}

/// How a process ended.
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    /// Exit code; `None` when the process died from a signal.
    pub exit_code: Option<i32>,
    /// Combined stdout and stderr, one line per line, in arrival order.
    pub output: String,
    pub timed_out: bool,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration: Duration,
}

impl ProcessOutcome {
    /// Exited on its own with status 0.
    pub fn succeeded(&self) -> bool {
        !self.timed_out && !self.cancelled && self.exit_code == Some(0)
    }
}

enum Ended {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Run `spec` to completion, timeout, or cancellation.
///
/// Returns `Err` only if the process could not be started.
pub async fn run_process(spec: &ProcessSpec, cancel: &CancellationToken) -> Result<ProcessOutcome> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .current_dir(&spec.cwd)
        .envs(&spec.env)
        .stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let started_at = Utc::now();
    let clock = Instant::now();
    let mut child = cmd.spawn().with_context(|| {
        format!(
            "failed to spawn '{}' in {} -- is it installed and on PATH?",
            spec.program,
            spec.cwd.display()
        )
    })?;
    // `Child::id` is gone once the child has been reaped.
    let pid = child.id();
    debug!(program = %spec.program, pid = ?pid, "spawned process");

    if let (Some(mut stdin), Some(input)) = (child.stdin.take(), spec.stdin.clone()) {
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(input.as_bytes()).await {
                debug!(error = %e, "child closed stdin early");
            }
            // dropping stdin sends EOF
        });
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(forward_lines(stdout, tx.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(forward_lines(stderr, tx.clone())));
    }
    drop(tx);

    let ended = tokio::select! {
        status = child.wait() => Ended::Exited(status),
        _ = tokio::time::sleep(spec.timeout) => Ended::TimedOut,
        _ = cancel.cancelled() => Ended::Cancelled,
    };

    let (status, timed_out, cancelled) = match ended {
        Ended::Exited(status) => {
            sweep_group(pid, spec.kill_grace).await;
            (status.ok(), false, false)
        }
        Ended::TimedOut => {
            warn!(program = %spec.program, timeout_secs = spec.timeout.as_secs(), "process timed out");
            (terminate(&mut child, spec.kill_grace).await, true, false)
        }
        Ended::Cancelled => {
            debug!(program = %spec.program, "process cancelled");
            (terminate(&mut child, spec.kill_grace).await, false, true)
        }
    };

    let mut lines = Vec::new();
    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while let Some(line) = rx.recv().await {
            lines.push(line);
        }
    })
    .await;
    if drained.is_err() {
        debug!(program = %spec.program, "output pipes still open after exit, stopped reading");
        for reader in &readers {
            reader.abort();
        }
        while let Ok(line) = rx.try_recv() {
            lines.push(line);
        }
    }

    Ok(ProcessOutcome {
        exit_code: status.and_then(|s| s.code()),
        output: lines.join("\n"),
        timed_out,
        cancelled,
        started_at,
        finished_at: Utc::now(),
        duration: clock.elapsed(),
    })
}

async fn forward_lines<R>(pipe: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                if tx.send(line.to_string()).is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "error reading process output");
                break;
            }
        }
    }
}

/// SIGTERM the child's process group, wait `grace`, then SIGKILL.
async fn terminate(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    let pid = child.id();
    signal_group(pid, Signal::Term);

    let status = match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(pid = ?pid, "process exited after SIGTERM");
            Some(status)
        }
        _ => {
            debug!(pid = ?pid, "process did not exit after SIGTERM, sending SIGKILL");
            signal_group(pid, Signal::Kill);
            let _ = child.kill().await;
            child.try_wait().ok().flatten()
        }
    };
    // Stragglers that ignored SIGTERM after the leader exited.
    signal_group(pid, Signal::Kill);
    status
}

/// Interval between checks for leftover group members.
const SWEEP_POLL: Duration = Duration::from_millis(50);

/// Terminate whatever is still running in the group of a leader that
/// already exited.
async fn sweep_group(pid: Option<u32>, grace: Duration) {
    if !group_alive(pid) {
        return;
    }
    debug!(pid = ?pid, "process left children behind, terminating its group");
    signal_group(pid, Signal::Term);
    let deadline = Instant::now() + grace;
    while group_alive(pid) && Instant::now() < deadline {
        tokio::time::sleep(SWEEP_POLL).await;
    }
    if group_alive(pid) {
        debug!(pid = ?pid, "group survived SIGTERM, sending SIGKILL");
        signal_group(pid, Signal::Kill);
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: Signal) {
    let Some(pgid) = pid.and_then(|p| libc::pid_t::try_from(p).ok()) else {
        return;
    };
    let signo = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: the child was spawned as leader of its own group, so -pgid
    // addresses only processes it started.
    let ret = unsafe { libc::kill(-pgid, signo) };
    if ret != 0 && matches!(signal, Signal::Term) {
        warn!(pgid, "SIGTERM to process group failed");
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _signal: Signal) {}

/// Whether any process is left in the group led by `pid`.
#[cfg(unix)]
fn group_alive(pid: Option<u32>) -> bool {
    let Some(pgid) = pid.and_then(|p| libc::pid_t::try_from(p).ok()) else {
        return false;
    };
    // SAFETY: signal 0 only checks for existence.
    unsafe { libc::kill(-pgid, 0) == 0 }
}

#[cfg(not(unix))]
fn group_alive(_pid: Option<u32>) -> bool {
    false
}

/// Locate `program` the way a shell would: paths containing a separator are
/// checked directly, bare names are searched on `PATH`.
pub fn find_executable(program: &str) -> Option<PathBuf> {
    if program.is_empty() {
        return None;
    }
    let direct = Path::new(program);
    if direct.components().count() > 1 {
        return is_executable(direct).then(|| direct.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str, timeout: Duration) -> ProcessSpec {
        let mut spec = ProcessSpec::new("sh", std::env::temp_dir(), timeout);
        spec.args = vec!["-c".to_string(), script.to_string()];
        spec
    }

    #[tokio::test]
    async fn captures_stdout_and_stderr() {
        let spec = sh("echo out; echo err 1>&2; exit 3", Duration::from_secs(10));
        let outcome = run_process(&spec, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.exit_code, Some(3));
        assert!(!outcome.succeeded());
        assert!(outcome.output.contains("out"));
        assert!(outcome.output.contains("err"));
        assert!(!outcome.timed_out);
    }

    #[tokio::test]
    async fn feeds_stdin_and_env() {
        let mut spec = sh("read line; echo \"got $line $EXTRA\"", Duration::from_secs(10));
        spec.stdin = Some("hello\n".to_string());
        spec.env.insert("EXTRA".to_string(), "there".to_string());
        let outcome = run_process(&spec, &CancellationToken::new()).await.unwrap();
        assert!(outcome.succeeded());
        assert_eq!(outcome.output, "got hello there");
    }

    #[tokio::test]
    async fn timeout_terminates_process() {
        let mut spec = sh("echo started; sleep 30", Duration::from_millis(300));
        spec.kill_grace = Duration::from_secs(1);
        let clock = Instant::now();
        let outcome = run_process(&spec, &CancellationToken::new()).await.unwrap();
        assert!(outcome.timed_out);
        assert!(!outcome.succeeded());
        assert!(outcome.output.contains("started"));
        assert!(clock.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn sigterm_ignoring_process_is_killed() {
        let mut spec = sh("trap '' TERM; sleep 30", Duration::from_millis(200));
        spec.kill_grace = Duration::from_millis(300);
        let clock = Instant::now();
        let outcome = run_process(&spec, &CancellationToken::new()).await.unwrap();
        assert!(outcome.timed_out);
        assert_eq!(outcome.exit_code, None);
        assert!(clock.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn cancellation_stops_process() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });
        let mut spec = sh("sleep 30", Duration::from_secs(60));
        spec.kill_grace = Duration::from_secs(1);
        let outcome = run_process(&spec, &cancel).await.unwrap();
        assert!(outcome.cancelled);
        assert!(!outcome.timed_out);
    }

    /// Running and not a zombie.
    fn running(pid: i32) -> bool {
        // SAFETY: signal 0 only checks for existence.
        if unsafe { libc::kill(pid, 0) } != 0 {
            return false;
        }
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => !stat
                .rsplit_once(") ")
                .is_some_and(|(_, rest)| rest.starts_with('Z')),
            Err(_) => true,
        }
    }

    #[tokio::test]
    async fn background_children_do_not_outlive_the_call() {
        let mut spec = sh("sleep 60 & echo $!; exit 0", Duration::from_secs(10));
        spec.kill_grace = Duration::from_secs(1);
        let outcome = run_process(&spec, &CancellationToken::new()).await.unwrap();
        assert!(outcome.succeeded());
        let bg: i32 = outcome.output.trim().parse().unwrap();

        let clock = Instant::now();
        while running(bg) && clock.elapsed() < Duration::from_secs(2) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!running(bg), "background pid {bg} outlived run_process");
    }

    #[tokio::test]
    async fn clean_exit_does_not_wait_out_the_grace() {
        let mut spec = sh("echo done", Duration::from_secs(10));
        spec.kill_grace = Duration::from_secs(30);
        let clock = Instant::now();
        let outcome = run_process(&spec, &CancellationToken::new()).await.unwrap();
        assert!(outcome.succeeded());
        assert!(clock.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn missing_program_is_an_error() {
        let spec = ProcessSpec::new(
            "/definitely/not/a/program",
            std::env::temp_dir(),
            Duration::from_secs(1),
        );
        let err = run_process(&spec, &CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("failed to spawn"));
    }

    #[test]
    fn find_executable_on_path() {
        assert!(find_executable("sh").is_some());
        assert!(find_executable("no-such-binary-yardstick").is_none());
        assert!(find_executable("").is_none());
    }
}
