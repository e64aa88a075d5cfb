//! Job records and the retry policy that drives their lifecycle.

pub mod model;
pub mod retry;

pub use model::{DEFAULT_MAX_RETRIES, Job, JobCounts, JobFilter, JobState, NewJob};
pub use retry::{DEFAULT_BACKOFF_BASE, RetryDecision, RetryPolicy};
