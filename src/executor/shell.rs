//! Shell command execution with a hard wall-clock timeout.
//!
//! Commands run through the host shell (`sh -c`, or `cmd /C` on Windows) in
//! their own process group with stdout and stderr captured in full. On
//! timeout the whole group is killed, so grandchildren do not outlive the job.
//! Background processes that keep the output pipes open after the shell
//! exits are killed the same way once a short grace period has passed.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::ExecError;

/// Maximum stderr characters kept in a failure reason.
const MAX_REASON_STDERR: usize = 200;

/// How long to keep reading pipes after the shell itself has exited.
/// Processes still holding them afterwards are killed with the group.
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(2);

const PIPE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long to wait for a killed process to be reaped.
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Result of running one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutcome {
    /// Exit code, if the process exited normally.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// The timeout fired and the process group was killed.
    pub timed_out: bool,
    /// The command could not be started or awaited.
    pub internal_error: Option<String>,
    /// The timeout that was enforced.
    pub timeout: Duration,
    /// Wall-clock time spent.
    pub duration: Duration,
}

impl ExecOutcome {
    fn internal(message: String, timeout: Duration, duration: Duration) -> Self {
        Self {
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            timed_out: false,
            internal_error: Some(message),
            timeout,
            duration,
        }
    }

    pub fn is_success(&self) -> bool {
        !self.timed_out && self.internal_error.is_none() && self.exit_code == Some(0)
    }

    /// Human-readable reason recorded as the job's `last_error`, or `None`
    /// on success.
    pub fn failure_reason(&self) -> Option<String> {
        if self.is_success() {
            return None;
        }
        if let Some(ref e) = self.internal_error {
            return Some(e.clone());
        }
        if self.timed_out {
            return Some(format!("Timeout after {}s", format_secs(self.timeout)));
        }
        let stderr: String = self.stderr.trim().chars().take(MAX_REASON_STDERR).collect();
        Some(format!("Exit {}: {}", self.exit_code.unwrap_or(-1), stderr))
    }
}

fn format_secs(d: Duration) -> String {
    if d.subsec_nanos() == 0 {
        d.as_secs().to_string()
    } else {
        format!("{:.3}", d.as_secs_f64())
    }
}

/// Runs opaque command strings through the host shell.
#[derive(Debug, Clone, Default)]
pub struct Executor {
    /// Working directory for commands (if None, uses cwd).
    working_dir: Option<PathBuf>,
}

impl Executor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the working directory.
    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    fn shell_command(&self, cmd: &str) -> Command {
        let mut command = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", cmd]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", cmd]);
            c
        };

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        command.process_group(0);

        if let Some(ref dir) = self.working_dir {
            command.current_dir(dir);
        }
        command
    }

    /// Run `cmd`, killing its process group if it outlives `timeout`.
    ///
    /// Never fails: launch errors are reported through `internal_error`.
    pub async fn run(&self, cmd: &str, timeout: Duration) -> ExecOutcome {
        let started = Instant::now();

        let mut child = match self.shell_command(cmd).spawn() {
            Ok(child) => child,
            Err(e) => {
                return ExecOutcome::internal(
                    ExecError::Spawn(e.to_string()).to_string(),
                    timeout,
                    started.elapsed(),
                );
            }
        };

        let pgid = child.id().and_then(|pid| i32::try_from(pid).ok());
        let stdout = child.stdout.take().map(PipeReader::spawn);
        let stderr = child.stderr.take().map(PipeReader::spawn);

        let (exit_code, timed_out, internal_error) =
            match tokio::time::timeout(timeout, child.wait()).await {
                Ok(Ok(status)) => (status.code(), false, None),
                Ok(Err(e)) => (None, false, Some(format!("Failed to wait for command: {e}"))),
                Err(_) => {
                    kill_process_group(&mut child, pgid).await;
                    (None, true, None)
                }
            };

        let readers: Vec<&PipeReader> = stdout.iter().chain(stderr.iter()).collect();
        if !wait_closed(&readers, PIPE_DRAIN_GRACE).await {
            warn!(pgid = ?pgid, "Background processes still hold the output pipes, killing the process group");
            signal_group(pgid);
            if !wait_closed(&readers, KILL_WAIT).await {
                warn!(pgid = ?pgid, "Output pipes still open, keeping partial output");
            }
        }

        let stdout = match stdout {
            Some(reader) => reader.into_string().await,
            None => String::new(),
        };
        let stderr = match stderr {
            Some(reader) => reader.into_string().await,
            None => String::new(),
        };

        let outcome = ExecOutcome {
            exit_code,
            stdout,
            stderr,
            timed_out,
            internal_error,
            timeout,
            duration: started.elapsed(),
        };
        debug!(
            exit_code = ?outcome.exit_code,
            timed_out = outcome.timed_out,
            duration_ms = outcome.duration.as_millis() as u64,
            "Command finished"
        );
        outcome
    }
}

/// Background reader for one output pipe.
///
/// Bytes land in a shared buffer as they arrive, so whatever was read is
/// still available if the pipe never reaches EOF.
struct PipeReader {
    buf: Arc<Mutex<Vec<u8>>>,
    handle: JoinHandle<()>,
}

impl PipeReader {
    fn spawn<R: AsyncRead + Unpin + Send + 'static>(mut reader: R) -> Self {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buf);
        let handle = tokio::spawn(async move {
            let mut chunk = [0u8; 8192];
            loop {
                match reader.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => sink.lock().await.extend_from_slice(&chunk[..n]),
                    Err(e) => {
                        debug!(error = %e, "Output pipe read failed");
                        break;
                    }
                }
            }
        });
        Self { buf, handle }
    }

    fn is_closed(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop reading and return everything captured so far.
    async fn into_string(self) -> String {
        self.handle.abort();
        let buf = self.buf.lock().await;
        String::from_utf8_lossy(&buf).into_owned()
    }
}

/// Wait up to `grace` for every pipe to reach EOF.
async fn wait_closed(readers: &[&PipeReader], grace: Duration) -> bool {
    let deadline = Instant::now() + grace;
    loop {
        if readers.iter().all(|r| r.is_closed()) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(PIPE_POLL_INTERVAL).await;
    }
}

/// SIGKILL every process left in the job's group.
#[cfg(unix)]
fn signal_group(pgid: Option<i32>) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    if let Some(pgid) = pgid {
        if let Err(e) = killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
            debug!(pgid, error = %e, "killpg failed");
        }
    }
}

#[cfg(not(unix))]
fn signal_group(_pgid: Option<i32>) {}

/// Kill the whole process group, then make sure the shell is reaped.
async fn kill_process_group(child: &mut Child, pgid: Option<i32>) {
    signal_group(pgid);
    let _ = child.start_kill();
    match tokio::time::timeout(KILL_WAIT, child.wait()).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => warn!(error = %e, "Error waiting for killed process"),
        Err(_) => warn!("Process still alive 5 s after SIGKILL"),
    }
}
