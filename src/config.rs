//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use crate::jobs::DEFAULT_BACKOFF_BASE;

/// Default per-job timeout when a job does not set one.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default idle poll interval for workers.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// Process-level configuration, read from `QUEUECTL_*` environment variables.
///
/// Runtime settings that workers consult per job (such as `backoff_base`)
/// live in the store's `config` table instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Directory holding the database, logs and PID file.
    pub home: PathBuf,
    /// SQLite database file.
    pub db_path: PathBuf,
    /// Directory for per-job transcripts.
    pub logs_dir: PathBuf,
    /// PID file written by `worker start`.
    pub pid_path: PathBuf,
    /// Timeout for jobs without their own.
    pub default_timeout: Duration,
    /// Sleep between empty claims.
    pub poll_interval: Duration,
    /// Fallback when the `backoff_base` config key is missing or invalid.
    pub backoff_base: u32,
}

impl QueueConfig {
    /// Build a config rooted at `home` with default settings.
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        Self {
            db_path: home.join("queue.db"),
            logs_dir: home.join("logs"),
            pid_path: home.join("queue.worker.pid"),
            home,
            default_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            backoff_base: DEFAULT_BACKOFF_BASE,
        }
    }

    /// Load from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` to resolve variable names.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let home = lookup("QUEUECTL_HOME")
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| ".".to_string());
        let mut config = Self::with_home(home);

        if let Some(path) = lookup("QUEUECTL_DB_PATH").filter(|s| !s.is_empty()) {
            config.db_path = PathBuf::from(path);
        }
        if let Some(path) = lookup("QUEUECTL_LOGS_DIR").filter(|s| !s.is_empty()) {
            config.logs_dir = PathBuf::from(path);
        }

        let timeout_secs: u64 = lookup("QUEUECTL_DEFAULT_TIMEOUT_SECS")
            .and_then(|s| s.parse().ok())
            .filter(|s| *s > 0)
            .unwrap_or(DEFAULT_TIMEOUT_SECS);
        config.default_timeout = Duration::from_secs(timeout_secs);

        let poll_ms: u64 = lookup("QUEUECTL_POLL_INTERVAL_MS")
            .and_then(|s| s.parse().ok())
            .filter(|ms| *ms > 0)
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS);
        config.poll_interval = Duration::from_millis(poll_ms);

        config.backoff_base = lookup("QUEUECTL_BACKOFF_BASE")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_BACKOFF_BASE);

        config
    }

    /// Settings handed to each worker loop.
    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            poll_interval: self.poll_interval,
            default_timeout: self.default_timeout,
            default_backoff_base: self.backoff_base,
            logs_dir: self.logs_dir.clone(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::with_home(".")
    }
}

/// Per-worker settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    /// Sleep between empty claims.
    pub poll_interval: Duration,
    /// Timeout for jobs without their own.
    pub default_timeout: Duration,
    /// Used when the store has no valid `backoff_base`.
    pub default_backoff_base: u32,
    /// Directory for transcripts of jobs without a recorded log path.
    pub logs_dir: PathBuf,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        QueueConfig::default().worker_settings()
    }
}
