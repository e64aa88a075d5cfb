//! A single worker: claim a job, run it, report the outcome, repeat.
//!
//! The loop is an explicit `Idle -> Executing -> Reporting -> Idle` state
//! machine. Stop requests are only honoured in `Idle`, so a claimed job
//! always runs to completion (or timeout) and its outcome is recorded.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::WorkerSettings;
use crate::error::DatabaseError;
use crate::executor::{ExecOutcome, Executor, log_path_for};
use crate::jobs::{Job, JobState};
use crate::metrics::Metric;
use crate::store::JobStore;

/// Retries for a store write that keeps hitting lock contention.
const MAX_BUSY_RETRIES: u32 = 50;

/// Base sleep between busy retries; grows linearly up to one second.
const BUSY_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Config key consulted before each failure decision.
pub const BACKOFF_BASE_KEY: &str = "backoff_base";

enum Phase {
    Idle,
    Executing(Job),
    Reporting(Job, ExecOutcome),
}

/// What one worker did before it stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub completed: u64,
    pub failed: u64,
}

pub struct WorkerLoop {
    id: usize,
    store: Arc<dyn JobStore>,
    executor: Arc<Executor>,
    settings: WorkerSettings,
    stop_rx: watch::Receiver<bool>,
    /// Every stop sender is gone; treated as a stop request.
    orphaned: bool,
}

impl WorkerLoop {
    pub fn new(
        id: usize,
        store: Arc<dyn JobStore>,
        executor: Arc<Executor>,
        settings: WorkerSettings,
        stop_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            id,
            store,
            executor,
            settings,
            stop_rx,
            orphaned: false,
        }
    }

    /// Run until a stop request is observed while idle.
    pub async fn run(mut self) -> WorkerStats {
        info!(worker = self.id, "Worker started");
        let mut stats = WorkerStats::default();
        let mut phase = Phase::Idle;

        loop {
            phase = match phase {
                Phase::Idle => {
                    if self.stop_requested() {
                        break;
                    }
                    match self.claim().await {
                        Some(job) => Phase::Executing(job),
                        None => {
                            self.idle_wait().await;
                            Phase::Idle
                        }
                    }
                }
                Phase::Executing(job) => {
                    let outcome = self.execute(&job).await;
                    Phase::Reporting(job, outcome)
                }
                Phase::Reporting(job, outcome) => {
                    if outcome.is_success() {
                        self.report_success(&job).await;
                        stats.completed += 1;
                    } else {
                        self.report_failure(&job, &outcome).await;
                        stats.failed += 1;
                    }
                    Phase::Idle
                }
            };
        }

        info!(
            worker = self.id,
            completed = stats.completed,
            failed = stats.failed,
            "Worker exiting"
        );
        stats
    }

    fn stop_requested(&self) -> bool {
        self.orphaned || *self.stop_rx.borrow()
    }

    /// Sleep one poll interval, waking early if the stop flag changes.
    async fn idle_wait(&mut self) {
        tokio::select! {
            _ = tokio::time::sleep(self.settings.poll_interval) => {}
            changed = self.stop_rx.changed() => {
                if changed.is_err() {
                    self.orphaned = true;
                }
            }
        }
    }

    async fn claim(&self) -> Option<Job> {
        match self.store.claim().await {
            Ok(job) => job,
            Err(e) if e.is_busy() => {
                debug!(worker = self.id, error = %e, "Store busy during claim, will retry");
                None
            }
            Err(e) => {
                error!(worker = self.id, error = %e, "Failed to claim job");
                None
            }
        }
    }

    async fn execute(&self, job: &Job) -> ExecOutcome {
        let timeout = job.effective_timeout(self.settings.default_timeout);
        let log_path = self.log_path(job).await;

        info!(
            worker = self.id,
            job_id = %job.id,
            attempts = job.attempts,
            command = %job.command,
            "Executing job"
        );
        self.executor
            .run_logged(&job.command, timeout, &log_path)
            .await
    }

    /// The job's recorded transcript path, assigning the default on first run.
    async fn log_path(&self, job: &Job) -> PathBuf {
        if let Some(ref path) = job.log_path {
            return PathBuf::from(path);
        }
        let default = log_path_for(&self.settings.logs_dir, &job.id);
        let default_str = default.to_string_lossy().into_owned();
        match with_busy_retry(|| self.store.assign_log_path(&job.id, &default_str)).await {
            Ok(path) => PathBuf::from(path),
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Failed to record log path");
                default
            }
        }
    }

    async fn report_success(&self, job: &Job) {
        match with_busy_retry(|| self.store.complete(&job.id)).await {
            Ok(()) => {
                info!(worker = self.id, job_id = %job.id, "Job completed");
                self.bump(Metric::JobsProcessed).await;
            }
            Err(e) => error!(job_id = %job.id, error = %e, "Failed to mark job completed"),
        }
    }

    async fn report_failure(&self, job: &Job, outcome: &ExecOutcome) {
        let reason = outcome
            .failure_reason()
            .unwrap_or_else(|| "Unknown failure".to_string());
        let backoff_base = self.backoff_base().await;

        let updated = match with_busy_retry(|| self.store.fail(&job.id, &reason, backoff_base)).await {
            Ok(updated) => updated,
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Failed to record job failure");
                return;
            }
        };
        if updated.state == JobState::Dead {
            warn!(
                worker = self.id,
                job_id = %job.id,
                attempts = updated.attempts,
                error = %reason,
                "Job failed permanently"
            );
        } else {
            warn!(
                worker = self.id,
                job_id = %job.id,
                attempts = updated.attempts,
                next_attempt_at = ?updated.next_attempt_at,
                error = %reason,
                "Job failed, retry scheduled"
            );
        }
        self.bump(Metric::JobsFailed).await;
        self.bump(Metric::JobsRetried).await;
    }

    /// Current `backoff_base` from the store, or the configured default.
    async fn backoff_base(&self) -> u32 {
        match self.store.get_config(BACKOFF_BASE_KEY).await {
            Ok(Some(raw)) => raw.trim().parse().unwrap_or_else(|_| {
                warn!(value = %raw, "Invalid backoff_base in config, using default");
                self.settings.default_backoff_base
            }),
            Ok(None) => self.settings.default_backoff_base,
            Err(e) => {
                warn!(error = %e, "Failed to read backoff_base, using default");
                self.settings.default_backoff_base
            }
        }
    }

    /// Best-effort counter update.
    async fn bump(&self, metric: Metric) {
        if let Err(e) = self.store.increment_metric(metric.key(), 1).await {
            warn!(metric = %metric, error = %e, "Failed to update metric");
        }
    }
}

/// Retry `op` while the store reports lock contention.
async fn with_busy_retry<T, F, Fut>(mut op: F) -> Result<T, DatabaseError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DatabaseError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(e) if e.is_busy() && attempt < MAX_BUSY_RETRIES => {
                attempt += 1;
                debug!(attempt, error = %e, "Store busy, retrying");
                tokio::time::sleep((BUSY_RETRY_DELAY * attempt).min(Duration::from_secs(1))).await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::jobs::NewJob;
    use crate::store::LibSqlBackend;

    async fn setup() -> (Arc<dyn JobStore>, WorkerSettings, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn JobStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let settings = WorkerSettings {
            poll_interval: Duration::from_millis(20),
            default_timeout: Duration::from_secs(5),
            default_backoff_base: 2,
            logs_dir: dir.path().join("logs"),
        };
        (store, settings, dir)
    }

    /// Run one worker until `done` holds for the store, then stop it.
    async fn run_until<F>(store: Arc<dyn JobStore>, settings: WorkerSettings, done: F) -> WorkerStats
    where
        F: Fn(crate::jobs::JobCounts) -> bool,
    {
        let (tx, rx) = watch::channel(false);
        let worker = WorkerLoop::new(1, Arc::clone(&store), Arc::new(Executor::new()), settings, rx);
        let handle = tokio::spawn(worker.run());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !done(store.stats().await.unwrap()) {
            assert!(tokio::time::Instant::now() < deadline, "worker did not finish in time");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tx.send(true).unwrap();
        handle.await.unwrap()
    }

    #[tokio::test]
    async fn completes_successful_job() {
        let (store, settings, _dir) = setup().await;
        store.enqueue(&NewJob::new("ok", "echo hi")).await.unwrap();

        let stats = run_until(Arc::clone(&store), settings.clone(), |c| c.completed == 1).await;
        assert_eq!(stats, WorkerStats { completed: 1, failed: 0 });

        let job = store.get_job("ok").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        let log_path = job.log_path.unwrap();
        assert_eq!(PathBuf::from(&log_path), settings.logs_dir.join("ok.log"));
        let transcript = tokio::fs::read_to_string(&log_path).await.unwrap();
        assert!(transcript.contains("STDOUT:\nhi\n"));

        let metrics = store.metrics().await.unwrap();
        assert_eq!(metrics["jobs_processed"], 1);
        assert_eq!(metrics["jobs_failed"], 0);
    }

    #[tokio::test]
    async fn failing_job_uses_configured_backoff() {
        let (store, settings, _dir) = setup().await;
        store.set_config(BACKOFF_BASE_KEY, "0").await.unwrap();
        store
            .enqueue(&NewJob::new("flaky", "echo nope >&2; exit 4").with_max_retries(2))
            .await
            .unwrap();

        // Base 0 means no delay, so the worker burns through all three attempts.
        let stats = run_until(Arc::clone(&store), settings, |c| c.dead == 1).await;
        assert_eq!(stats.failed, 3);

        let job = store.get_job("flaky").await.unwrap().unwrap();
        assert_eq!(job.attempts, 3);
        assert_eq!(job.last_error.as_deref(), Some("Exit 4: nope"));

        let metrics = store.metrics().await.unwrap();
        assert_eq!(metrics["jobs_failed"], 3);
        assert_eq!(metrics["jobs_retried"], 3);
        assert_eq!(metrics["jobs_processed"], 0);
    }

    #[tokio::test]
    async fn stop_is_observed_while_idle() {
        let (store, settings, _dir) = setup().await;
        let (tx, rx) = watch::channel(false);
        let worker = WorkerLoop::new(1, store, Arc::new(Executor::new()), settings, rx);
        let handle = tokio::spawn(worker.run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        let stats = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats, WorkerStats::default());
    }

    #[tokio::test]
    async fn dropped_stop_sender_ends_loop() {
        let (store, settings, _dir) = setup().await;
        let (tx, rx) = watch::channel(false);
        let worker = WorkerLoop::new(1, store, Arc::new(Executor::new()), settings, rx);
        let handle = tokio::spawn(worker.run());

        drop(tx);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn in_flight_job_finishes_before_stop() {
        let (store, settings, _dir) = setup().await;
        store.enqueue(&NewJob::new("slowish", "sleep 0.3")).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let worker = WorkerLoop::new(1, Arc::clone(&store), Arc::new(Executor::new()), settings, rx);
        let handle = tokio::spawn(worker.run());

        // Wait until the job is claimed, then ask to stop mid-execution.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while store.stats().await.unwrap().processing == 0 {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        let stats = handle.await.unwrap();

        assert_eq!(stats.completed, 1);
        assert_eq!(
            store.get_job("slowish").await.unwrap().unwrap().state,
            JobState::Completed
        );
    }

    #[tokio::test]
    async fn unrecorded_outcomes_are_not_counted() {
        let (store, settings, _dir) = setup().await;
        let job = store.enqueue(&NewJob::new("idle", "true")).await.unwrap();
        let (_tx, rx) = watch::channel(false);
        let worker = WorkerLoop::new(1, Arc::clone(&store), Arc::new(Executor::new()), settings, rx);

        // Never claimed, so neither outcome can be recorded.
        worker.report_success(&job).await;
        let failed = ExecOutcome {
            exit_code: Some(1),
            stdout: String::new(),
            stderr: String::new(),
            timed_out: false,
            internal_error: None,
            timeout: Duration::from_secs(1),
            duration: Duration::ZERO,
        };
        worker.report_failure(&job, &failed).await;

        let metrics = store.metrics().await.unwrap();
        assert_eq!(metrics["jobs_processed"], 0);
        assert_eq!(metrics["jobs_failed"], 0);
        assert_eq!(metrics["jobs_retried"], 0);
        assert_eq!(
            store.get_job("idle").await.unwrap().unwrap().state,
            JobState::Pending
        );
    }

    #[tokio::test]
    async fn busy_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let result = with_busy_retry(|| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(DatabaseError::Busy("database is locked".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_busy_retry(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(DatabaseError::Query("boom".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
