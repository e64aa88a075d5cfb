//! Worker process control: PID file bookkeeping and stop signalling.
//!
//! `worker start` holds a [`PidFile`] for its lifetime. `worker stop` reads
//! it and sends SIGTERM, which the running process maps onto a graceful
//! pool stop.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::ControlError;

/// PID file owned by the running worker process; removed on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    pid: u32,
}

impl PidFile {
    /// Record the current process id at `path`.
    pub fn create(path: &Path) -> Result<Self, ControlError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let pid = std::process::id();
        fs::write(path, pid.to_string())?;
        debug!(path = %path.display(), pid, "PID file written");
        Ok(Self {
            path: path.to_path_buf(),
            pid,
        })
    }

}

impl Drop for PidFile {
    fn drop(&mut self) {
        // Leave the file alone if another worker has since taken it over.
        match read_pid(&self.path) {
            Ok(Some(pid)) if pid == self.pid as i32 => {
                if let Err(e) = fs::remove_file(&self.path) {
                    warn!(path = %self.path.display(), error = %e, "Failed to remove PID file");
                }
            }
            _ => {}
        }
    }
}

/// Read the PID recorded at `path`, if any.
pub fn read_pid(path: &Path) -> Result<Option<i32>, ControlError> {
    match fs::read_to_string(path) {
        Ok(raw) => Ok(raw.trim().parse().ok()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Whether a process with `pid` exists.
#[cfg(unix)]
pub fn is_process_alive(pid: i32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    if pid <= 0 {
        return false;
    }
    // Signal 0 only checks for existence; EPERM still means it exists.
    matches!(kill(Pid::from_raw(pid), None::<Signal>), Ok(()) | Err(Errno::EPERM))
}

#[cfg(not(unix))]
pub fn is_process_alive(pid: i32) -> bool {
    pid > 0
}

/// PID of the live worker recorded at `path`, if any.
pub fn running_worker(path: &Path) -> Result<Option<i32>, ControlError> {
    Ok(read_pid(path)?.filter(|pid| is_process_alive(*pid)))
}

/// Ask the worker recorded at `path` to stop gracefully.
///
/// A stale PID file (process gone) is removed and reported as `NotRunning`.
pub fn request_stop(path: &Path) -> Result<i32, ControlError> {
    let Some(pid) = read_pid(path)? else {
        return Err(ControlError::NotRunning);
    };
    if !is_process_alive(pid) {
        let _ = fs::remove_file(path);
        info!(pid, "Removed stale worker PID file");
        return Err(ControlError::NotRunning);
    }
    send_terminate(pid)?;
    info!(pid, "Stop requested");
    Ok(pid)
}

#[cfg(unix)]
fn send_terminate(pid: i32) -> Result<(), ControlError> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid), Signal::SIGTERM).map_err(|e| ControlError::Signal {
        pid,
        reason: e.to_string(),
    })
}

#[cfg(not(unix))]
fn send_terminate(pid: i32) -> Result<(), ControlError> {
    Err(ControlError::Signal {
        pid,
        reason: "signals are not supported on this platform".into(),
    })
}

/// Resolve when the process receives Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
