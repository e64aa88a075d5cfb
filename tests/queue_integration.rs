//! End-to-end tests: a file-backed store driven by a real worker pool
//! running real shell commands.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use futures::future::BoxFuture;

use queuectl::config::{QueueConfig, WorkerSettings};
use queuectl::jobs::{Job, JobFilter, JobState, NewJob};
use queuectl::store::{JobStore, LibSqlBackend};
use queuectl::worker::{PoolReport, WorkerPool};

/// Upper bound for any single wait; a hung test fails instead of blocking.
const TEST_TIMEOUT: Duration = Duration::from_secs(15);

struct Harness {
    dir: tempfile::TempDir,
    store: Arc<dyn JobStore>,
    settings: WorkerSettings,
}

impl Harness {
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = QueueConfig::with_home(dir.path());
        let store: Arc<dyn JobStore> =
            Arc::new(LibSqlBackend::new_local(&config.db_path).await.unwrap());
        let mut settings = config.worker_settings();
        settings.poll_interval = Duration::from_millis(25);
        Self {
            dir,
            store,
            settings,
        }
    }

    async fn enqueue(&self, raw: &str) -> Job {
        let job = NewJob::from_json(raw).unwrap();
        self.store.enqueue(&job).await.unwrap()
    }

    async fn job(&self, id: &str) -> Job {
        self.store.get_job(id).await.unwrap().unwrap()
    }

    /// Run `count` workers until `done` holds, then stop them gracefully.
    async fn run_workers_until<F, Fut>(&self, count: usize, done: F) -> PoolReport
    where
        F: Fn(Arc<dyn JobStore>) -> Fut,
        Fut: Future<Output = bool>,
    {
        let pool = Arc::new(WorkerPool::new(
            Arc::clone(&self.store),
            self.settings.clone(),
        ));
        let stop = pool.stop_handle();
        let runner = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.start(count).await })
        };

        let deadline = Instant::now() + TEST_TIMEOUT;
        while !done(Arc::clone(&self.store)).await {
            assert!(Instant::now() < deadline, "condition never reached");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        stop.request_stop();
        tokio::time::timeout(TEST_TIMEOUT, runner)
            .await
            .expect("workers did not stop")
            .unwrap()
    }
}

fn in_state(id: &'static str, state: JobState) -> impl Fn(Arc<dyn JobStore>) -> BoxFuture<'static, bool> {
    move |store| {
        async move {
            store
                .get_job(id)
                .await
                .unwrap()
                .is_some_and(|job| job.state == state)
        }
        .boxed()
    }
}

#[tokio::test]
async fn successful_job_completes() {
    let h = Harness::new().await;
    h.enqueue(r#"{"id":"ok","command":"true","max_retries":1}"#)
        .await;

    let report = h
        .run_workers_until(1, in_state("ok", JobState::Completed))
        .await;
    assert_eq!(report.completed, 1);
    assert_eq!(report.failed, 0);

    let job = h.job("ok").await;
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempts, 0);
    assert!(job.last_error.is_none());

    let metrics = h.store.metrics().await.unwrap();
    assert_eq!(metrics["jobs_processed"], 1);
    assert_eq!(metrics["jobs_failed"], 0);
}

#[tokio::test]
async fn failing_job_without_retries_is_dead_lettered() {
    let h = Harness::new().await;
    h.enqueue(r#"{"id":"bad","command":"false","max_retries":0}"#)
        .await;

    let report = h
        .run_workers_until(1, in_state("bad", JobState::Dead))
        .await;
    assert_eq!(report.failed, 1);

    let job = h.job("bad").await;
    assert_eq!(job.state, JobState::Dead);
    assert_eq!(job.attempts, 1);
    assert!(job.next_attempt_at.is_none());
    let reason = job.last_error.unwrap();
    assert!(reason.starts_with("Exit 1"), "unexpected reason: {reason}");

    let dead = h
        .store
        .list(Some(JobFilter::State(JobState::Dead)))
        .await
        .unwrap();
    assert_eq!(dead.len(), 1);

    let metrics = h.store.metrics().await.unwrap();
    assert_eq!(metrics["jobs_failed"], 1);
    assert_eq!(metrics["jobs_processed"], 0);
}

#[tokio::test]
async fn slow_job_times_out_and_is_rescheduled() {
    let h = Harness::new().await;
    h.enqueue(r#"{"id":"slow","command":"sleep 10","max_retries":1,"timeout":1}"#)
        .await;

    let started = Instant::now();
    h.run_workers_until(1, |store| async move {
        store
            .get_job("slow")
            .await
            .unwrap()
            .is_some_and(|job| job.attempts == 1)
    })
    .await;
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "timeout took {:?}",
        started.elapsed()
    );

    let job = h.job("slow").await;
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempts, 1);
    assert!(job.last_error.unwrap().starts_with("Timeout after 1s"));
    assert!(job.next_attempt_at.unwrap() > Utc::now());

    let failed = h.store.list(Some(JobFilter::Failed)).await.unwrap();
    assert_eq!(failed.len(), 1);

    let metrics = h.store.metrics().await.unwrap();
    assert_eq!(metrics["jobs_retried"], 1);

    let transcript = std::fs::read_to_string(job.log_path.unwrap()).unwrap();
    assert!(transcript.starts_with("--- RUN "));
    assert!(transcript.contains("Timeout after 1s"));
}

#[tokio::test]
async fn concurrent_workers_execute_each_job_once() {
    let h = Harness::new().await;
    let runs = h.dir.path().join("runs.txt");
    for i in 0..5 {
        let command = format!("echo job{i} >> '{}'", runs.display());
        let raw = serde_json::json!({"id": format!("job{i}"), "command": command, "max_retries": 1});
        h.enqueue(&raw.to_string()).await;
    }

    let report = h
        .run_workers_until(2, |store| async move {
            let counts = store.stats().await.unwrap();
            counts.pending == 0 && counts.processing == 0
        })
        .await;
    assert_eq!(report.workers, 2);
    assert_eq!(report.completed, 5);

    let counts = h.store.stats().await.unwrap();
    assert_eq!(counts.completed + counts.dead, 5);
    assert_eq!(counts.pending, 0);
    assert_eq!(counts.processing, 0);

    let log = std::fs::read_to_string(&runs).unwrap();
    for i in 0..5 {
        let needle = format!("job{i}");
        assert_eq!(
            log.lines().filter(|line| *line == needle).count(),
            1,
            "{needle} ran more than once"
        );
    }
    assert_eq!(h.store.metrics().await.unwrap()["jobs_processed"], 5);
}

#[tokio::test]
async fn retried_dead_job_runs_again() {
    let h = Harness::new().await;
    let marker = h.dir.path().join("ready");
    let command = format!("test -f '{}'", marker.display());
    let raw = serde_json::json!({"id": "flaky", "command": command, "max_retries": 0});
    h.enqueue(&raw.to_string()).await;

    h.run_workers_until(1, in_state("flaky", JobState::Dead))
        .await;

    std::fs::write(&marker, "").unwrap();
    assert!(h.store.retry_dead("flaky").await.unwrap());
    let job = h.job("flaky").await;
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempts, 0);

    h.run_workers_until(1, in_state("flaky", JobState::Completed))
        .await;
    let transcript = std::fs::read_to_string(h.job("flaky").await.log_path.unwrap()).unwrap();
    assert_eq!(transcript.matches("--- RUN ").count(), 2);
}

#[tokio::test]
async fn state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("queue.db");
    {
        let store = LibSqlBackend::new_local(&db_path).await.unwrap();
        store
            .enqueue(&NewJob::new("persisted", "true").with_priority(4))
            .await
            .unwrap();
        store.set_config("backoff_base", "5").await.unwrap();
    }

    let store = LibSqlBackend::new_local(&db_path).await.unwrap();
    let job = store.get_job("persisted").await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.priority, 4);
    assert_eq!(
        store.get_config("backoff_base").await.unwrap().as_deref(),
        Some("5")
    );
}
