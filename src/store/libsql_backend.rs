//! libSQL backend: async `JobStore` implementation.
//!
//! Supports local file and in-memory databases. A file database is opened in
//! WAL mode with a busy timeout so that the CLI and a running worker process
//! can share it.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, SecondsFormat, TimeDelta, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};

use crate::error::DatabaseError;
use crate::jobs::{Job, JobCounts, JobFilter, JobState, NewJob, RetryDecision, RetryPolicy};
use crate::store::migrations;
use crate::store::traits::JobStore;

/// How long SQLite waits on a locked database before reporting busy.
const BUSY_TIMEOUT_MS: u64 = 5_000;

/// Compare-and-swap attempts for `fail` before giving up with `Busy`.
const MAX_CAS_ATTEMPTS: usize = 5;

/// 9999-12-31T23:59:59Z, the latest instant that still orders correctly as text.
const LATEST_SCHEDULE_TS: i64 = 253_402_300_799;

/// Column order matches `row_to_job`.
const JOB_COLUMNS: &str = "id, command, state, attempts, max_retries, priority, created_at, \
    updated_at, next_attempt_at, run_at, last_error, timeout, log_path";

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Open(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Open(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Open(format!("Failed to create connection: {e}")))?;

        // Both pragmas return a row, so they go through `query`.
        conn.query(&format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}"), ())
            .await
            .map_err(|e| DatabaseError::Open(format!("Failed to set busy timeout: {e}")))?;
        if let Err(e) = conn.query("PRAGMA journal_mode = WAL", ()).await {
            warn!(error = %e, "Failed to enable WAL journal mode");
        }

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Open(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Open(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn require_job(&self, id: &str) -> Result<Job, DatabaseError> {
        self.get_job(id).await?.ok_or_else(|| not_found(id))
    }

    async fn collect_jobs(
        &self,
        op: &str,
        mut rows: libsql::Rows,
    ) -> Result<Vec<Job>, DatabaseError> {
        let mut jobs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::from_libsql(op, e))?
        {
            jobs.push(row_to_job(&row)?);
        }
        Ok(jobs)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp text. Fixed width, so text order is time order.
fn format_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    // Naive ISO timestamps without an offset are UTC.
    let trimmed = s.trim_end_matches('Z');
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(trimmed, fmt) {
            return ndt.and_utc();
        }
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.filter(|s| !s.is_empty()).map(|s| parse_datetime(&s))
}

/// `now + delay`, clamped to the latest representable schedule.
fn schedule_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    let latest =
        DateTime::<Utc>::from_timestamp(LATEST_SCHEDULE_TS, 0).unwrap_or(DateTime::<Utc>::MAX_UTC);
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .filter(|t| t.year() <= 9999)
        .unwrap_or(latest)
}

fn not_found(id: &str) -> DatabaseError {
    DatabaseError::NotFound {
        entity: "job".into(),
        id: id.to_string(),
    }
}

fn invalid_transition(job: &Job, target: JobState) -> DatabaseError {
    DatabaseError::InvalidTransition {
        id: job.id.clone(),
        state: job.state.to_string(),
        target: target.to_string(),
    }
}

/// Map a libsql Row to a Job.
///
/// Column order matches JOB_COLUMNS:
/// 0:id, 1:command, 2:state, 3:attempts, 4:max_retries, 5:priority,
/// 6:created_at, 7:updated_at, 8:next_attempt_at, 9:run_at, 10:last_error,
/// 11:timeout, 12:log_path
///
/// Rows written by older releases may carry NULLs in the later columns.
fn row_to_job(row: &libsql::Row) -> Result<Job, DatabaseError> {
    let id: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("job.id: {e}")))?;
    let command: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("job.command: {e}")))?;
    let state_str: String = row
        .get(2)
        .map_err(|e| DatabaseError::Query(format!("job.state: {e}")))?;
    let state: JobState = state_str
        .parse()
        .map_err(|e: String| DatabaseError::Serialization(format!("job {id}: {e}")))?;

    let attempts = row.get::<i64>(3).unwrap_or(0);
    let max_retries = row.get::<i64>(4).unwrap_or(0);
    let priority = row.get::<i64>(5).unwrap_or(0);

    let created_at = row
        .get::<String>(6)
        .map(|s| parse_datetime(&s))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    let updated_at = row
        .get::<String>(7)
        .map(|s| parse_datetime(&s))
        .unwrap_or(created_at);

    Ok(Job {
        id,
        command,
        state,
        attempts: u32::try_from(attempts).unwrap_or(0),
        max_retries: u32::try_from(max_retries).unwrap_or(0),
        priority,
        created_at,
        updated_at,
        next_attempt_at: parse_optional_datetime(row.get::<String>(8).ok()),
        run_at: parse_optional_datetime(row.get::<String>(9).ok()),
        last_error: row.get::<String>(10).ok(),
        timeout: row
            .get::<i64>(11)
            .ok()
            .and_then(|t| u64::try_from(t).ok())
            .filter(|t| *t > 0),
        log_path: row.get::<String>(12).ok().filter(|p| !p.is_empty()),
    })
}

#[async_trait]
impl JobStore for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Jobs ────────────────────────────────────────────────────────

    async fn enqueue(&self, job: &NewJob) -> Result<Job, DatabaseError> {
        job.validate()
            .map_err(|e| DatabaseError::Constraint(e.to_string()))?;

        let conn = self.conn();
        let now = format_ts(&Utc::now());
        let inserted = conn
            .execute(
                "INSERT INTO jobs (id, command, state, attempts, max_retries, priority, created_at, updated_at, run_at, timeout)
                 VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?6, ?6, ?7, ?8)
                 ON CONFLICT(id) DO NOTHING",
                params![
                    job.id.as_str(),
                    job.command.as_str(),
                    job.attempts as i64,
                    job.max_retries as i64,
                    job.priority,
                    now,
                    job.run_at.map(|t| format_ts(&t)),
                    job.timeout.map(|t| t as i64),
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("enqueue", e))?;

        if inserted == 0 {
            return Err(DatabaseError::Duplicate {
                entity: "job".into(),
                id: job.id.clone(),
            });
        }
        debug!(job_id = %job.id, "Job enqueued");
        self.require_job(&job.id).await
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("get_job", e))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_job(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::from_libsql("get_job row", e)),
        }
    }

    async fn claim(&self) -> Result<Option<Job>, DatabaseError> {
        let conn = self.conn();
        let now = format_ts(&Utc::now());

        // One statement: the outer `state = 'pending'` guard makes the
        // transition succeed for exactly one caller.
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE jobs SET state = 'processing', updated_at = ?1
                     WHERE id = (
                         SELECT id FROM jobs
                         WHERE state = 'pending'
                           AND (next_attempt_at IS NULL OR next_attempt_at <= ?1)
                           AND (run_at IS NULL OR run_at <= ?1)
                         ORDER BY priority DESC, created_at ASC, rowid ASC
                         LIMIT 1
                     ) AND state = 'pending'
                     RETURNING {JOB_COLUMNS}"
                ),
                params![now],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("claim", e))?;

        let job = match rows
            .next()
            .await
            .map_err(|e| DatabaseError::from_libsql("claim row", e))?
        {
            Some(row) => Some(row_to_job(&row)?),
            None => None,
        };
        if let Some(ref job) = job {
            debug!(job_id = %job.id, attempts = job.attempts, "Job claimed");
        }
        Ok(job)
    }

    async fn complete(&self, id: &str) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let now = format_ts(&Utc::now());
        let updated = conn
            .execute(
                "UPDATE jobs SET state = 'completed', updated_at = ?2, next_attempt_at = NULL
                 WHERE id = ?1 AND state = 'processing'",
                params![id, now],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("complete", e))?;

        if updated == 1 {
            debug!(job_id = %id, "Job completed");
            return Ok(());
        }

        let job = self.require_job(id).await?;
        match job.state {
            JobState::Completed => Ok(()),
            _ => Err(invalid_transition(&job, JobState::Completed)),
        }
    }

    async fn fail(&self, id: &str, error: &str, backoff_base: u32) -> Result<Job, DatabaseError> {
        let policy = RetryPolicy::new(backoff_base);
        let conn = self.conn();

        for _ in 0..MAX_CAS_ATTEMPTS {
            let job = self.require_job(id).await?;
            if job.state != JobState::Processing {
                return Err(invalid_transition(&job, JobState::Pending));
            }

            let attempts = job.attempts.saturating_add(1);
            let now = Utc::now();
            let (state, next_attempt_at) = match policy.decide(attempts, job.max_retries) {
                RetryDecision::Retry { delay } => {
                    (JobState::Pending, Some(schedule_after(now, delay)))
                }
                RetryDecision::DeadLetter => (JobState::Dead, None),
            };

            let updated = conn
                .execute(
                    "UPDATE jobs SET state = ?1, attempts = ?2, next_attempt_at = ?3,
                         last_error = ?4, updated_at = ?5
                     WHERE id = ?6 AND state = 'processing' AND attempts = ?7",
                    params![
                        state.as_str(),
                        attempts as i64,
                        next_attempt_at.map(|t| format_ts(&t)),
                        error,
                        format_ts(&now),
                        id,
                        job.attempts as i64,
                    ],
                )
                .await
                .map_err(|e| DatabaseError::from_libsql("fail", e))?;

            if updated == 1 {
                match state {
                    JobState::Dead => {
                        info!(job_id = %id, attempts, error, "Job moved to dead-letter queue")
                    }
                    _ => debug!(
                        job_id = %id,
                        attempts,
                        next_attempt_at = ?next_attempt_at,
                        "Job rescheduled"
                    ),
                }
                return self.require_job(id).await;
            }
            debug!(job_id = %id, "Job changed while recording failure, retrying");
        }

        Err(DatabaseError::Busy(format!(
            "fail: job {id} kept changing while recording the failure"
        )))
    }

    async fn retry_dead(&self, id: &str) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let now = format_ts(&Utc::now());
        let updated = conn
            .execute(
                "UPDATE jobs SET state = 'pending', attempts = 0, next_attempt_at = NULL,
                     last_error = NULL, updated_at = ?2
                 WHERE id = ?1 AND state = 'dead'",
                params![id, now],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("retry_dead", e))?;

        if updated == 1 {
            info!(job_id = %id, "Dead job requeued");
            return Ok(true);
        }
        self.require_job(id).await?;
        Ok(false)
    }

    async fn list(&self, filter: Option<JobFilter>) -> Result<Vec<Job>, DatabaseError> {
        let conn = self.conn();
        let rows = match filter {
            None => {
                conn.query(
                    &format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at ASC, rowid ASC"),
                    (),
                )
                .await
            }
            Some(JobFilter::State(state)) => {
                conn.query(
                    &format!(
                        "SELECT {JOB_COLUMNS} FROM jobs WHERE state = ?1 ORDER BY created_at ASC, rowid ASC"
                    ),
                    params![state.as_str()],
                )
                .await
            }
            Some(JobFilter::Failed) => {
                conn.query(
                    &format!(
                        "SELECT {JOB_COLUMNS} FROM jobs WHERE state = 'pending' AND attempts > 0
                         ORDER BY created_at ASC, rowid ASC"
                    ),
                    (),
                )
                .await
            }
        }
        .map_err(|e| DatabaseError::from_libsql("list", e))?;

        self.collect_jobs("list row", rows).await
    }

    async fn stats(&self) -> Result<JobCounts, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query("SELECT state, COUNT(*) FROM jobs GROUP BY state", ())
            .await
            .map_err(|e| DatabaseError::from_libsql("stats", e))?;

        let mut counts = JobCounts::default();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::from_libsql("stats row", e))?
        {
            let state_str: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("stats.state: {e}")))?;
            let count: i64 = row.get(1).unwrap_or(0);
            match state_str.parse::<JobState>() {
                Ok(state) => counts.set(state, u64::try_from(count).unwrap_or(0)),
                Err(_) => warn!(state = %state_str, count, "Ignoring jobs in unknown state"),
            }
        }
        Ok(counts)
    }

    async fn assign_log_path(&self, id: &str, path: &str) -> Result<String, DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "UPDATE jobs SET log_path = ?2 WHERE id = ?1 AND (log_path IS NULL OR log_path = '')",
            params![id, path],
        )
        .await
        .map_err(|e| DatabaseError::from_libsql("assign_log_path", e))?;

        let job = self.require_job(id).await?;
        Ok(job.log_path.unwrap_or_else(|| path.to_string()))
    }

    // ── Config ──────────────────────────────────────────────────────

    async fn get_config(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query("SELECT value FROM config WHERE key = ?1", params![key])
            .await
            .map_err(|e| DatabaseError::from_libsql("get_config", e))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<String>(0).ok()),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::from_libsql("get_config row", e)),
        }
    }

    async fn set_config(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )
        .await
        .map_err(|e| DatabaseError::from_libsql("set_config", e))?;
        debug!(key, value, "Config updated");
        Ok(())
    }

    // ── Metrics ─────────────────────────────────────────────────────

    async fn increment_metric(&self, name: &str, amount: i64) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO metrics (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = COALESCE(value, 0) + excluded.value",
            params![name, amount as f64],
        )
        .await
        .map_err(|e| DatabaseError::from_libsql("increment_metric", e))?;
        Ok(())
    }

    async fn metrics(&self) -> Result<BTreeMap<String, i64>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT key, CAST(COALESCE(value, 0) AS INTEGER) FROM metrics ORDER BY key",
                (),
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("metrics", e))?;

        let mut metrics = BTreeMap::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::from_libsql("metrics row", e))?
        {
            let key: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("metrics.key: {e}")))?;
            metrics.insert(key, row.get::<i64>(1).unwrap_or(0));
        }
        Ok(metrics)
    }
}
