//! Tools: the units the orchestrator schedules.
//!
//! A [`Tool`] validates, executes and estimates a single [`Operation`]. The
//! orchestrator only sees this trait, so batches can be driven by the real
//! [`MigrationTool`] or by a test double.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use crate::core::ProgressSink;
use crate::core::DatabaseInfo;
use crate::engine::{self, ExecutionEngine, MigrationResult, TaskFailure};
use crate::error::Result;
use crate::operation::Operation;
use crate::progress::ScopedProgress;

/// Nominal dump-and-restore throughput used for estimates (bytes/sec).
pub const ESTIMATE_THROUGHPUT_BYTES_PER_SEC: u64 = 25 * 1024 * 1024;

/// Fixed per-database overhead used for estimates (seconds).
pub const ESTIMATE_PER_DATABASE_SECS: u64 = 5;

/// Pre-run size and duration estimate for one operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Estimate {
    pub operation_id: String,
    pub database_count: usize,
    pub total_bytes: u64,
    pub estimated_seconds: u64,
}

impl Estimate {
    /// Estimate from a database count and total size.
    ///
    /// Every byte is moved twice: once by the export, once by the import.
    pub fn from_size(operation_id: impl Into<String>, database_count: usize, total_bytes: u64) -> Self {
        let transfer_secs = (total_bytes * 2).div_ceil(ESTIMATE_THROUGHPUT_BYTES_PER_SEC);
        Self {
            operation_id: operation_id.into(),
            database_count,
            total_bytes,
            estimated_seconds: transfer_secs + database_count as u64 * ESTIMATE_PER_DATABASE_SECS,
        }
    }
}

/// Executes operations on behalf of the orchestrator.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Cheap pre-execution checks. Must not modify anything.
    async fn validate(&self, op: &Operation) -> Result<()>;

    /// Run the operation. A failure carries the phase it stopped in.
    async fn execute(
        &self,
        op: &Operation,
        progress: Arc<dyn ProgressSink>,
    ) -> std::result::Result<MigrationResult, TaskFailure>;

    /// Names of the source databases `execute` would migrate.
    async fn discover(&self, op: &Operation) -> Result<Vec<String>>;

    async fn estimate(&self, op: &Operation) -> Result<Estimate>;
}

/// Dump-and-restore migration of every selected database of one instance.
pub struct MigrationTool {
    engine: ExecutionEngine,
}

impl MigrationTool {
    pub fn new(engine: ExecutionEngine) -> Self {
        Self { engine }
    }

    async fn selected_databases(&self, op: &Operation) -> Result<Vec<DatabaseInfo>> {
        let listing = self
            .engine
            .connections()
            .list_databases(op.source(), true)
            .await?;
        Ok(engine::select_databases(listing, op.task().databases()))
    }
}

#[async_trait]
impl Tool for MigrationTool {
    async fn validate(&self, op: &Operation) -> Result<()> {
        engine::check_endpoints(op)?;
        debug!("{}: validated", op.label());
        Ok(())
    }

    async fn execute(
        &self,
        op: &Operation,
        progress: Arc<dyn ProgressSink>,
    ) -> std::result::Result<MigrationResult, TaskFailure> {
        let scoped = ScopedProgress::new(op.id(), progress);
        self.engine.execute(op, &scoped).await
    }

    async fn discover(&self, op: &Operation) -> Result<Vec<String>> {
        let databases = self.selected_databases(op).await?;
        Ok(databases.into_iter().map(|db| db.name).collect())
    }

    async fn estimate(&self, op: &Operation) -> Result<Estimate> {
        let databases = self.selected_databases(op).await?;
        let total_bytes = databases.iter().map(|db| db.size_bytes).sum();
        Ok(Estimate::from_size(op.id(), databases.len(), total_bytes))
    }
}
