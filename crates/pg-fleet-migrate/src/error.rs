//! Error types for the migration library.

use thiserror::Error;

use crate::orchestrator::BatchResult;

/// Exit code for configuration errors.
pub const EXIT_CONFIG_ERROR: u8 = 1;
/// Exit code for pre-execution validation failures and naming conflicts.
pub const EXIT_VALIDATION_ERROR: u8 = 2;
/// Exit code for unreachable endpoints.
pub const EXIT_CONNECTIVITY_ERROR: u8 = 3;
/// Exit code for export/import failures.
pub const EXIT_TRANSFER_ERROR: u8 = 4;
/// Exit code for a batch stopped by `stop_on_error`.
pub const EXIT_BATCH_ABORTED: u8 = 5;
/// Exit code for permission script failures.
pub const EXIT_PERMISSION_ERROR: u8 = 6;
/// Exit code for filesystem errors.
pub const EXIT_IO_ERROR: u8 = 7;
/// Exit code for everything else.
pub const EXIT_OTHER_ERROR: u8 = 8;

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing mapping fields, unknown strategy, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Aggregated pre-execution validation failures.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Database name collision under the `fail` conflict policy.
    #[error("Database name conflict: '{database}' is provided by {}", sources.join(", "))]
    Conflict {
        database: String,
        sources: Vec<String>,
    },

    /// Endpoint unreachable during preflight or post-migration validation.
    #[error("Cannot connect to {endpoint}: {message}")]
    Connectivity { endpoint: String, message: String },

    /// Discovery found nothing to migrate.
    #[error("No databases to migrate on {endpoint}")]
    NoDatabases { endpoint: String },

    /// Export or import failed for a specific database.
    #[error("Transfer failed for database {database}: {message}")]
    Transfer { database: String, message: String },

    /// A permission or role statement could not be applied.
    ///
    /// The engine logs these as warnings; they never fail a task.
    #[error("Failed to apply permission statement `{statement}`: {message}")]
    PermissionApply { statement: String, message: String },

    /// Raised when `stop_on_error` halts admission of new tasks.
    ///
    /// Carries the bookkeeping that existed when the batch stopped, including
    /// every task that was never started.
    #[error("Stopping batch execution: task {task_id} failed: {reason}")]
    BatchAborted {
        task_id: String,
        reason: String,
        result: Box<BatchResult>,
    },

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// PostgreSQL query or connection error
    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    /// IO error (file operations, subprocesses)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Batch was interrupted (SIGINT, etc.)
    #[error("Migration cancelled")]
    Cancelled,
}

impl MigrateError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl Into<String>, context: impl Into<String>) -> Self {
        MigrateError::Pool {
            message: message.into(),
            context: context.into(),
        }
    }

    /// Create a Transfer error
    pub fn transfer(database: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Transfer {
            database: database.into(),
            message: message.into(),
        }
    }

    /// Create a Connectivity error
    pub fn connectivity(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Connectivity {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_) | MigrateError::Yaml(_) => EXIT_CONFIG_ERROR,
            MigrateError::Validation(_) | MigrateError::Conflict { .. } => EXIT_VALIDATION_ERROR,
            MigrateError::Connectivity { .. } | MigrateError::Pool { .. } => {
                EXIT_CONNECTIVITY_ERROR
            }
            MigrateError::Transfer { .. } | MigrateError::NoDatabases { .. } => {
                EXIT_TRANSFER_ERROR
            }
            MigrateError::BatchAborted { .. } => EXIT_BATCH_ABORTED,
            MigrateError::PermissionApply { .. } => EXIT_PERMISSION_ERROR,
            MigrateError::Io(_) => EXIT_IO_ERROR,
            MigrateError::Database(_) | MigrateError::Json(_) | MigrateError::Cancelled => {
                EXIT_OTHER_ERROR
            }
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        // Add error chain for wrapped errors
        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
