//! Command-line surface: argument parsing and subcommand dispatch.

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};

use crate::config::QueueConfig;
use crate::control::{self, PidFile};
use crate::error::{ConfigError, ControlError};
use crate::jobs::{JobFilter, JobState, NewJob};
use crate::store::JobStore;
use crate::worker::{BACKOFF_BASE_KEY, WorkerPool};

/// queuectl - durable background job queue
#[derive(Parser, Debug)]
#[command(name = "queuectl")]
#[command(version)]
#[command(about = "Durable background job queue with retries and a dead-letter queue", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Enqueue a job, e.g. '{"id":"job1","command":"sleep 2"}'
    Enqueue {
        /// Job definition as JSON
        job: String,
    },

    /// Start or stop workers
    Worker {
        #[command(subcommand)]
        action: WorkerCommand,
    },

    /// Show job counts, counters and worker state
    Status,

    /// List jobs
    List {
        /// Filter: pending, processing, completed, dead or failed
        #[arg(long)]
        state: Option<JobFilter>,
    },

    /// Inspect or retry dead-lettered jobs
    Dlq {
        #[command(subcommand)]
        action: DlqCommand,
    },

    /// Read or write runtime configuration
    Config {
        #[command(subcommand)]
        action: ConfigCommand,
    },

    /// Print queue counters
    Metrics,

    /// Print a job's execution transcript
    Logs {
        job_id: String,
    },
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum WorkerCommand {
    /// Run workers in the foreground until stopped
    Start {
        /// Number of concurrent workers
        #[arg(long, default_value_t = 1)]
        count: usize,

        /// Backoff base used when none is configured
        #[arg(long = "backoff-base")]
        backoff_base: Option<u32>,
    },
    /// Ask the running worker process to stop after its current jobs
    Stop,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum DlqCommand {
    /// List dead jobs
    List,
    /// Move a dead job back to pending
    Retry { job_id: String },
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum ConfigCommand {
    Get { key: String },
    Set { key: String, value: String },
}

impl Command {
    /// Long-running commands log at `info` by default; one-shot commands
    /// stay quiet unless something goes wrong.
    pub fn default_log_level(&self) -> &'static str {
        match self {
            Command::Worker {
                action: WorkerCommand::Start { .. },
            } => "info",
            _ => "warn",
        }
    }
}

/// Execute `command` against `store`, writing user-facing output to `out`.
pub async fn run(
    command: Command,
    config: &QueueConfig,
    store: Arc<dyn JobStore>,
    out: &mut dyn Write,
) -> anyhow::Result<()> {
    match command {
        Command::Enqueue { job } => {
            let job = NewJob::from_json(&job)?;
            let job = store
                .enqueue(&job)
                .await
                .with_context(|| format!("Failed to enqueue job {}", job.id))?;
            writeln!(out, "Enqueued job {}", job.id)?;
        }

        Command::Worker {
            action: WorkerCommand::Start {
                count,
                backoff_base,
            },
        } => start_workers(config, store, count, backoff_base, out).await?,

        Command::Worker {
            action: WorkerCommand::Stop,
        } => match control::request_stop(&config.pid_path) {
            Ok(pid) => writeln!(
                out,
                "Stop requested (pid {pid}). Workers will exit after finishing current jobs."
            )?,
            Err(ControlError::NotRunning) => writeln!(out, "No running worker found")?,
            Err(e) => return Err(e.into()),
        },

        Command::Status => {
            let counts = store.stats().await?;
            writeln!(out, "Job states:")?;
            for state in JobState::ALL {
                writeln!(out, "  {state}: {}", counts.get(state))?;
            }
            writeln!(out, "Metrics:")?;
            for (name, value) in store.metrics().await? {
                writeln!(out, "  {name}: {value}")?;
            }
            match control::running_worker(&config.pid_path)? {
                Some(pid) => writeln!(out, "Worker: running (pid {pid})")?,
                None => writeln!(out, "Worker: not running")?,
            }
        }

        Command::List { state } => print_jobs(store.as_ref(), state, out).await?,

        Command::Dlq {
            action: DlqCommand::List,
        } => print_jobs(store.as_ref(), Some(JobFilter::State(JobState::Dead)), out).await?,

        Command::Dlq {
            action: DlqCommand::Retry { job_id },
        } => {
            if !store.retry_dead(&job_id).await? {
                bail!("Job {job_id} is not in the dead-letter queue");
            }
            writeln!(out, "Requeued job {job_id}")?;
        }

        Command::Config {
            action: ConfigCommand::Get { key },
        } => match store.get_config(&key).await? {
            Some(value) => writeln!(out, "{value}")?,
            None => bail!("Config key {key} is not set"),
        },

        Command::Config {
            action: ConfigCommand::Set { key, value },
        } => {
            validate_config(&key, &value)?;
            store.set_config(&key, &value).await?;
            writeln!(out, "Set config {key} = {value}")?;
        }

        Command::Metrics => {
            for (name, value) in store.metrics().await? {
                writeln!(out, "{name}: {value}")?;
            }
        }

        Command::Logs { job_id } => {
            let job = store
                .get_job(&job_id)
                .await?
                .with_context(|| format!("Job {job_id} not found"))?;
            match job.log_path {
                Some(path) => {
                    let text = tokio::fs::read_to_string(&path)
                        .await
                        .with_context(|| format!("Failed to read transcript {path}"))?;
                    write!(out, "{text}")?;
                }
                None => writeln!(out, "No transcript recorded for job {job_id}")?,
            }
        }
    }
    Ok(())
}

async fn print_jobs(
    store: &dyn JobStore,
    filter: Option<JobFilter>,
    out: &mut dyn Write,
) -> anyhow::Result<()> {
    for job in store.list(filter).await? {
        writeln!(out, "{}", serde_json::to_string(&job)?)?;
    }
    Ok(())
}

/// Reject values the workers could not use.
fn validate_config(key: &str, value: &str) -> Result<(), ConfigError> {
    if key == BACKOFF_BASE_KEY && value.trim().parse::<u32>().is_err() {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a non-negative integer, got {value:?}"),
        });
    }
    Ok(())
}

async fn start_workers(
    config: &QueueConfig,
    store: Arc<dyn JobStore>,
    count: usize,
    backoff_base: Option<u32>,
    out: &mut dyn Write,
) -> anyhow::Result<()> {
    if let Some(pid) = control::running_worker(&config.pid_path)? {
        if pid != std::process::id() as i32 {
            bail!("A worker is already running (pid {pid})");
        }
    }
    let _pid_file = PidFile::create(&config.pid_path)?;

    let mut settings = config.worker_settings();
    if let Some(base) = backoff_base {
        settings.default_backoff_base = base;
    }

    let pool = WorkerPool::new(store, settings);
    let stop = pool.stop_handle();
    let signals = tokio::spawn(async move {
        control::shutdown_signal().await;
        stop.request_stop();
    });

    writeln!(
        out,
        "Starting workers (count={count}) - Ctrl-C or 'queuectl worker stop' to stop"
    )?;
    out.flush()?;

    let report = pool.start(count).await;
    signals.abort();

    writeln!(
        out,
        "Workers stopped: {} completed, {} failed",
        report.completed, report.failed
    )?;
    Ok(())
}
