use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use queuectl::cli::{self, Cli};
use queuectl::config::QueueConfig;
use queuectl::store::{JobStore, LibSqlBackend};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.command.default_log_level())),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = QueueConfig::from_env();

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn JobStore> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );

    let mut stdout = std::io::stdout();
    cli::run(cli.command, &config, store, &mut stdout).await?;
    stdout.flush()?;
    Ok(())
}
