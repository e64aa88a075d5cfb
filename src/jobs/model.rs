//! Job data model: the persisted record, its lifecycle states and the
//! enqueue request shape.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Retry budget applied when an enqueue request omits `max_retries`.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Stored lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting to be claimed (possibly not yet eligible).
    Pending,
    /// Claimed by exactly one worker.
    Processing,
    /// Ran successfully.
    Completed,
    /// Retry budget exhausted.
    Dead,
}

impl JobState {
    pub const ALL: [JobState; 4] = [
        JobState::Pending,
        JobState::Processing,
        JobState::Completed,
        JobState::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Dead => "dead",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "dead" => Ok(Self::Dead),
            _ => Err(format!("Unknown job state: {}", s)),
        }
    }
}

/// Reporting filter for `list`.
///
/// `Failed` is not a stored state: it selects pending jobs that have
/// failed at least once and are waiting for their next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobFilter {
    State(JobState),
    Failed,
}

impl std::str::FromStr for JobFilter {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "failed" => Ok(Self::Failed),
            other => other.parse().map(Self::State),
        }
    }
}

/// A persisted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Caller-supplied unique ID.
    pub id: String,
    /// Shell command, passed verbatim to the executor.
    pub command: String,
    /// Lifecycle state.
    pub state: JobState,
    /// Execution attempts so far.
    pub attempts: u32,
    /// Failures tolerated before the job is dead-lettered.
    pub max_retries: u32,
    /// Higher claims first.
    pub priority: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Backoff gate set after a failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Scheduled start; not claimable before this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_at: Option<DateTime<Utc>>,
    /// Most recent failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Per-job timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Transcript file, assigned on first execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<String>,
}

impl Job {
    /// The timeout to enforce, falling back to `default` when unset.
    pub fn effective_timeout(&self, default: Duration) -> Duration {
        self.timeout.map(Duration::from_secs).unwrap_or(default)
    }
}

/// An enqueue request, as accepted on the command line.
///
/// ```json
/// {"id": "job1", "command": "sleep 2", "max_retries": 2, "priority": 5}
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NewJob {
    pub id: String,
    pub command: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub priority: i64,
    /// Starting attempt count; imports may carry over prior attempts.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub timeout: Option<u64>,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl NewJob {
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            max_retries: DEFAULT_MAX_RETRIES,
            priority: 0,
            attempts: 0,
            run_at: None,
            timeout: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Some(secs);
        self
    }

    /// Parse and validate a JSON job definition.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let job: NewJob =
            serde_json::from_str(raw).map_err(|e| ConfigError::InvalidJob(e.to_string()))?;
        job.validate()?;
        Ok(job)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::InvalidJob("id must not be empty".into()));
        }
        if self.command.trim().is_empty() {
            return Err(ConfigError::InvalidJob("command must not be empty".into()));
        }
        if self.timeout == Some(0) {
            return Err(ConfigError::InvalidJob("timeout must be at least 1 second".into()));
        }
        if self.attempts > self.max_retries {
            return Err(ConfigError::InvalidJob(format!(
                "attempts ({}) must not exceed max_retries ({})",
                self.attempts, self.max_retries
            )));
        }
        Ok(())
    }
}

/// Job counts by stored state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub dead: u64,
}

impl JobCounts {
    pub fn get(&self, state: JobState) -> u64 {
        match state {
            JobState::Pending => self.pending,
            JobState::Processing => self.processing,
            JobState::Completed => self.completed,
            JobState::Dead => self.dead,
        }
    }

    pub fn set(&mut self, state: JobState, count: u64) {
        match state {
            JobState::Pending => self.pending = count,
            JobState::Processing => self.processing = count,
            JobState::Completed => self.completed = count,
            JobState::Dead => self.dead = count,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.dead
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_job() -> Job {
        let now = Utc::now();
        Job {
            id: "j1".into(),
            command: "true".into(),
            state: JobState::Pending,
            attempts: 0,
            max_retries: 3,
            priority: 0,
            created_at: now,
            updated_at: now,
            next_attempt_at: None,
            run_at: None,
            last_error: None,
            timeout: None,
            log_path: None,
        }
    }

    #[test]
    fn state_string_roundtrip() {
        for state in JobState::ALL {
            assert_eq!(state.to_string().parse::<JobState>().unwrap(), state);
        }
        assert!("failed".parse::<JobState>().is_err());
    }

    #[test]
    fn filter_parses_failed_label() {
        assert_eq!("failed".parse::<JobFilter>().unwrap(), JobFilter::Failed);
        assert_eq!(
            "dead".parse::<JobFilter>().unwrap(),
            JobFilter::State(JobState::Dead)
        );
        assert!("bogus".parse::<JobFilter>().is_err());
    }

    #[test]
    fn effective_timeout_falls_back() {
        let mut job = pending_job();
        assert_eq!(job.effective_timeout(Duration::from_secs(30)), Duration::from_secs(30));
        job.timeout = Some(2);
        assert_eq!(job.effective_timeout(Duration::from_secs(30)), Duration::from_secs(2));
    }

    #[test]
    fn new_job_from_json_defaults() {
        let job = NewJob::from_json(r#"{"id":"job1","command":"sleep 2"}"#).unwrap();
        assert_eq!(job.id, "job1");
        assert_eq!(job.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(job.priority, 0);
        assert_eq!(job.attempts, 0);
        assert!(job.run_at.is_none());
        assert!(job.timeout.is_none());
    }

    #[test]
    fn new_job_from_json_full() {
        let job = NewJob::from_json(
            r#"{"id":"slow","command":"sleep 10","max_retries":1,"timeout":1,"priority":7,
                "run_at":"2030-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(job.max_retries, 1);
        assert_eq!(job.timeout, Some(1));
        assert_eq!(job.priority, 7);
        assert_eq!(job.run_at.unwrap().to_rfc3339(), "2030-01-01T00:00:00+00:00");
    }

    #[test]
    fn new_job_rejects_invalid() {
        assert!(NewJob::from_json("not json").is_err());
        assert!(NewJob::from_json(r#"{"command":"true"}"#).is_err());
        assert!(NewJob::from_json(r#"{"id":"","command":"true"}"#).is_err());
        assert!(NewJob::from_json(r#"{"id":"x","command":"  "}"#).is_err());
        assert!(NewJob::from_json(r#"{"id":"x","command":"true","timeout":0}"#).is_err());
        assert!(
            NewJob::from_json(r#"{"id":"x","command":"true","attempts":10,"max_retries":3}"#)
                .is_err()
        );
        assert!(
            NewJob::from_json(r#"{"id":"x","command":"true","attempts":3,"max_retries":3}"#)
                .is_ok()
        );
    }

    #[test]
    fn counts_total() {
        let mut counts = JobCounts::default();
        counts.set(JobState::Pending, 2);
        counts.set(JobState::Dead, 1);
        assert_eq!(counts.get(JobState::Pending), 2);
        assert_eq!(counts.total(), 3);
    }
}
