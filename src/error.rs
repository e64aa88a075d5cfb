//! Error types for queuectl.

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse job definition: {0}")]
    InvalidJob(String),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Failed to open database: {0}")]
    Open(String),

    #[error("Query failed: {0}")]
    Query(String),

    /// Another connection holds the write lock. Callers retry after a short sleep.
    #[error("Database busy: {0}")]
    Busy(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Duplicate {entity} with id {id}")]
    Duplicate { entity: String, id: String },

    #[error("Job {id} is in state {state}, cannot transition to {target}")]
    InvalidTransition {
        id: String,
        state: String,
        target: String,
    },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DatabaseError {
    /// Classify a libsql error raised by `op`, separating lock contention
    /// from everything else.
    pub fn from_libsql(op: &str, e: libsql::Error) -> Self {
        let msg = e.to_string();
        let lower = msg.to_lowercase();
        if lower.contains("database is locked") || lower.contains("busy") {
            DatabaseError::Busy(format!("{op}: {msg}"))
        } else {
            DatabaseError::Query(format!("{op}: {msg}"))
        }
    }

    /// Whether this error is transient lock contention.
    pub fn is_busy(&self) -> bool {
        matches!(self, DatabaseError::Busy(_))
    }
}

/// Command execution errors.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("Failed to spawn command: {0}")]
    Spawn(String),

    #[error("Failed to write job log {path}: {reason}")]
    Log { path: String, reason: String },
}

/// Worker process control errors.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("No running worker found")]
    NotRunning,

    #[error("Failed to signal worker {pid}: {reason}")]
    Signal { pid: i32, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
