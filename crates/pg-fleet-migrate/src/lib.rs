//! # pg-fleet-migrate
//!
//! Batch migrations of PostgreSQL databases between managed cloud instances.
//!
//! A migration request is turned into work in three stages:
//!
//! - **Mapping** normalizes sources, targets and a strategy (simple,
//!   consolidate, version-based, custom) into an immutable [`Mapping`] and
//!   expands it into per-pair [`MigrationTask`]s.
//! - **Orchestrator** runs those tasks through a bounded sliding window,
//!   with optional stop-on-error, sequential retry of failures, and a
//!   consolidation audit for many-to-one merges.
//! - **ExecutionEngine** drives one operation through its ordered phases
//!   (validation, discovery, preflight, optional roles, export, import,
//!   optional permissions, post-validation, cleanup).
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pg_fleet_migrate::{
//!     Config, ExecutionEngine, MigrationTool, Orchestrator, PgConnectionProvider, PgDumpTools,
//! };
//!
//! #[tokio::main]
//! async fn main() -> pg_fleet_migrate::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let connections = Arc::new(PgConnectionProvider::new(config.connection.clone())?);
//!     let dump = Arc::new(PgDumpTools::new(config.tools.clone(), connections.clone()));
//!     let engine = ExecutionEngine::new(connections, dump.clone(), dump);
//!     let orchestrator = Orchestrator::new(Arc::new(MigrationTool::new(engine)))
//!         .with_work_dir(config.tools.work_dir());
//!
//!     let report = orchestrator.execute_batch(&config.mapping()?, None).await?;
//!     println!("{} of {} tasks succeeded", report.summary.successful, report.summary.total_tasks);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod dump;
pub mod engine;
pub mod error;
pub mod mapping;
pub mod operation;
pub mod orchestrator;
pub mod permissions;
pub mod postgres;
pub mod progress;
pub mod state;
pub mod tool;

#[cfg(test)]
mod testing;

// Re-exports for convenient access
pub use config::{Config, ConnectionConfig, ToolsConfig};
pub use crate::core::{DatabaseSelection, Endpoint, ProgressSink, StatusLevel};
pub use dump::PgDumpTools;
pub use engine::{ExecutionEngine, MigrationResult, Phase, TaskFailure};
pub use error::{MigrateError, Result};
pub use mapping::{ConflictResolution, Mapping, MappingType, MigrationTask, Strategy};
pub use operation::Operation;
pub use orchestrator::{BatchPhase, BatchReport, BatchResult, BatchStatus, Orchestrator};
pub use permissions::PgPermissions;
pub use postgres::{PgConnectionProvider, SslMode};
pub use progress::{JsonProgress, NoopProgress, TracingProgress};
pub use state::TaskStatus;
pub use tool::{MigrationTool, Tool};
