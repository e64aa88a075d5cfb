//! `JobStore` trait: the single async interface for queue persistence.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::DatabaseError;
use crate::jobs::{Job, JobCounts, JobFilter, NewJob};

/// Backend-agnostic store covering jobs, runtime config and counters.
///
/// Every state-changing job operation is a single conditional write scoped
/// to one row, so concurrent callers on distinct ids never coordinate.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Jobs ────────────────────────────────────────────────────────

    /// Insert a new pending job. Fails with `Duplicate` if the id exists.
    async fn enqueue(&self, job: &NewJob) -> Result<Job, DatabaseError>;

    /// Get a job by ID.
    async fn get_job(&self, id: &str) -> Result<Option<Job>, DatabaseError>;

    /// Atomically move the highest-priority, oldest eligible pending job to
    /// `processing` and return it. Each job is returned to at most one caller.
    async fn claim(&self) -> Result<Option<Job>, DatabaseError>;

    /// `processing -> completed`. A no-op if the job is already completed.
    async fn complete(&self, id: &str) -> Result<(), DatabaseError>;

    /// Record a failed attempt: bump `attempts`, then either reschedule with
    /// exponential backoff or move the job to `dead`. Returns the updated job.
    async fn fail(&self, id: &str, error: &str, backoff_base: u32) -> Result<Job, DatabaseError>;

    /// `dead -> pending` with attempts reset. Returns `false` if the job
    /// exists but is not dead.
    async fn retry_dead(&self, id: &str) -> Result<bool, DatabaseError>;

    /// Jobs ordered by creation time, optionally filtered.
    async fn list(&self, filter: Option<JobFilter>) -> Result<Vec<Job>, DatabaseError>;

    /// Counts by state.
    async fn stats(&self) -> Result<JobCounts, DatabaseError>;

    /// Set the transcript path if none is recorded yet. Returns the path in
    /// effect afterwards.
    async fn assign_log_path(&self, id: &str, path: &str) -> Result<String, DatabaseError>;

    // ── Config ──────────────────────────────────────────────────────

    async fn get_config(&self, key: &str) -> Result<Option<String>, DatabaseError>;

    async fn set_config(&self, key: &str, value: &str) -> Result<(), DatabaseError>;

    // ── Metrics ─────────────────────────────────────────────────────

    /// Add `amount` to a named counter, creating it if needed.
    async fn increment_metric(&self, name: &str, amount: i64) -> Result<(), DatabaseError>;

    /// All counters by name.
    async fn metrics(&self) -> Result<BTreeMap<String, i64>, DatabaseError>;
}
