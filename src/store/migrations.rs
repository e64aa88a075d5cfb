//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.
//! On first run against a legacy queue file (a `jobs` table but no
//! `_migrations` table), the columns added by later releases of the tool
//! are patched in place before V1 is recorded.

use libsql::Connection;

use crate::error::DatabaseError;
use crate::metrics::Metric;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "initial_schema",
    sql: r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            command TEXT NOT NULL,
            state TEXT NOT NULL DEFAULT 'pending',
            attempts INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 3,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            next_attempt_at TEXT,
            last_error TEXT,
            priority INTEGER NOT NULL DEFAULT 0,
            run_at TEXT,
            log_path TEXT,
            timeout INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs(state, priority DESC, created_at);
        CREATE INDEX IF NOT EXISTS idx_jobs_created ON jobs(created_at);

        CREATE TABLE IF NOT EXISTS config (
            key TEXT PRIMARY KEY,
            value TEXT
        );

        CREATE TABLE IF NOT EXISTS metrics (
            key TEXT PRIMARY KEY,
            value REAL NOT NULL DEFAULT 0
        );

        INSERT OR IGNORE INTO config (key, value) VALUES ('backoff_base', '2');
    "#,
}];

/// Columns that older queue files may lack, with their definitions.
const LEGACY_JOB_COLUMNS: &[(&str, &str)] = &[
    ("priority", "INTEGER DEFAULT 0"),
    ("run_at", "TEXT"),
    ("log_path", "TEXT"),
    ("timeout", "INTEGER"),
];

/// Run all pending migrations.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    // Legacy queue file: jobs table exists but nothing was ever recorded.
    if current_version == 0 && legacy_tables_exist(conn).await? {
        let existing = job_columns(conn).await?;
        for (column, definition) in LEGACY_JOB_COLUMNS {
            if existing.iter().any(|c| c == column) {
                continue;
            }
            conn.execute(
                &format!("ALTER TABLE jobs ADD COLUMN {column} {definition}"),
                (),
            )
            .await
            .map_err(|e| {
                DatabaseError::Migration(format!("Failed to add jobs.{column} on legacy DB: {e}"))
            })?;
        }
        tracing::info!("Legacy queue database detected, patched jobs columns");
        // V1 is idempotent and fills in the config/metrics tables and seeds.
    }

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    seed_metrics(conn).await?;

    let version = get_current_version(conn).await?;
    tracing::debug!(version, "Database migrations complete");

    Ok(())
}

/// Make sure every known counter has a row, so readers always see all of them.
async fn seed_metrics(conn: &Connection) -> Result<(), DatabaseError> {
    for metric in Metric::ALL {
        conn.execute(
            "INSERT OR IGNORE INTO metrics (key, value) VALUES (?1, 0)",
            libsql::params![metric.key()],
        )
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to seed metric {metric}: {e}")))?;
    }
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Check if a `jobs` table already exists.
async fn legacy_tables_exist(conn: &Connection) -> Result<bool, DatabaseError> {
    let mut rows = conn
        .query(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='jobs'",
            (),
        )
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to inspect schema: {e}")))?;

    let count: i64 = match rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to inspect schema: {e}")))?
    {
        Some(row) => row.get(0).unwrap_or(0),
        None => 0,
    };
    Ok(count > 0)
}

/// Column names of the `jobs` table.
async fn job_columns(conn: &Connection) -> Result<Vec<String>, DatabaseError> {
    let mut rows = conn
        .query("SELECT name FROM pragma_table_info('jobs')", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read jobs columns: {e}")))?;

    let mut columns = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read jobs columns: {e}")))?
    {
        if let Ok(name) = row.get::<String>(0) {
            columns.push(name);
        }
    }
    Ok(columns)
}

async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
