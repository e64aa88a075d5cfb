//! Persistent queue counters.

use std::fmt;

/// Counters bumped by workers as a side effect of outcome handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    /// Jobs that ran to success.
    JobsProcessed,
    /// Failed executions (non-zero exit, timeout or launch error).
    JobsFailed,
    /// Failures routed through the retry policy.
    JobsRetried,
}

impl Metric {
    pub const ALL: [Metric; 3] = [Metric::JobsProcessed, Metric::JobsFailed, Metric::JobsRetried];

    pub fn key(&self) -> &'static str {
        match self {
            Self::JobsProcessed => "jobs_processed",
            Self::JobsFailed => "jobs_failed",
            Self::JobsRetried => "jobs_retried",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}
