//! Command execution and per-job transcripts.

pub mod shell;
pub mod transcript;

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use tracing::warn;

pub use shell::{ExecOutcome, Executor};
pub use transcript::log_path_for;

impl Executor {
    /// Run `cmd` and append its transcript to `log_path`.
    ///
    /// A transcript write failure is logged and never changes the outcome.
    pub async fn run_logged(&self, cmd: &str, timeout: Duration, log_path: &Path) -> ExecOutcome {
        let started_at = Utc::now();
        let outcome = self.run(cmd, timeout).await;
        let text = transcript::render(started_at, &outcome);
        if let Err(e) = transcript::append(log_path, &text).await {
            warn!(error = %e, "Failed to write job transcript");
        }
        outcome
    }
}
