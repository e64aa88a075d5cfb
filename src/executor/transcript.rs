//! Per-job execution transcripts.
//!
//! Each job gets one append-only text file. Every run adds a block:
//!
//! ```text
//! --- RUN 2024-05-01T10:20:30.123456Z ---
//! STDOUT:
//! ...
//! STDERR:
//! ...
//! ```
//!
//! Sections are omitted when the stream was empty.

use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::ExecError;
use crate::executor::shell::ExecOutcome;

/// Default transcript location for a job inside `logs_dir`.
///
/// Bytes outside `[A-Za-z0-9._-]` are percent-encoded, as is a leading dot,
/// so distinct ids always get distinct files directly inside `logs_dir`.
pub fn log_path_for(logs_dir: &Path, job_id: &str) -> PathBuf {
    let mut name = String::with_capacity(job_id.len());
    for (i, byte) in job_id.bytes().enumerate() {
        let keep = byte.is_ascii_alphanumeric()
            || matches!(byte, b'-' | b'_')
            || (byte == b'.' && i > 0);
        if keep {
            name.push(char::from(byte));
        } else {
            name.push_str(&format!("%{byte:02X}"));
        }
    }
    if name.is_empty() {
        // Never produced by a non-empty id.
        name.push('%');
    }
    logs_dir.join(format!("{name}.log"))
}

/// Render one run block.
pub fn render(started_at: DateTime<Utc>, outcome: &ExecOutcome) -> String {
    let mut out = format!(
        "--- RUN {} ---\n",
        started_at.to_rfc3339_opts(SecondsFormat::Micros, true)
    );
    if !outcome.stdout.is_empty() {
        out.push_str("STDOUT:\n");
        out.push_str(&outcome.stdout);
        out.push('\n');
    }
    if !outcome.stderr.is_empty() {
        out.push_str("STDERR:\n");
        out.push_str(&outcome.stderr);
        out.push('\n');
    }
    if outcome.timed_out || outcome.internal_error.is_some() {
        if let Some(reason) = outcome.failure_reason() {
            out.push_str(&format!("FAILED: {reason}\n"));
        }
    }
    out
}

/// Append `text` to the transcript at `path`, creating parent directories
/// on first use.
pub async fn append(path: &Path, text: &str) -> Result<(), ExecError> {
    let log_err = |e: std::io::Error| ExecError::Log {
        path: path.display().to_string(),
        reason: e.to_string(),
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await.map_err(log_err)?;
    }

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(log_err)?;
    file.write_all(text.as_bytes()).await.map_err(log_err)?;
    file.flush().await.map_err(log_err)?;
    Ok(())
}
