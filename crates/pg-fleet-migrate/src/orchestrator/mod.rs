//! Batch orchestrator.
//!
//! Expands a [`Mapping`] into operations and runs them through a [`Tool`]
//! with bounded parallelism:
//!
//! 1. Initialization: validate the mapping, plan tasks, create operations
//! 2. Validation: every operation is validated up front, concurrently, then
//!    database-name collisions on shared targets are resolved
//! 3. Execution: at most `max_parallel` operations in flight
//! 4. Consolidation: N:1 merge batches get a per-target database audit
//! 5. Reporting: summary, per-task records and duration statistics

pub mod phase;
pub mod report;

pub use phase::{BatchMetrics, BatchPhase, BatchState};
pub use report::{BatchReport, BatchSummary, ConsolidationAudit, PerformanceStats, TaskRecord};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::{ProgressSink, StatusLevel};
use crate::engine::MigrationResult;
use crate::error::{MigrateError, Result};
use crate::mapping::{
    resolve_database_conflicts, BatchOptions, ConflictResolution, DatabaseEntry, Mapping,
    MappingType,
};
use crate::operation::{Operation, OperationOptions, RunMetadata};
use crate::progress::TracingProgress;
use crate::state::{ErrorRecord, TaskStatus};
use crate::tool::{Estimate, Tool};

/// Reason recorded for tasks never started after a `stop_on_error` failure.
pub const SKIPPED_AFTER_FAILURE: &str = "Skipped due to previous failure";

/// Reason recorded for tasks never started after `cancel_batch`.
pub const SKIPPED_AFTER_CANCEL: &str = "Skipped due to cancellation";

/// A task that finished successfully.
#[derive(Debug, Clone, Serialize)]
pub struct CompletedTask {
    pub operation: Operation,
    pub result: MigrationResult,
}

/// A task that failed.
#[derive(Debug, Clone, Serialize)]
pub struct FailedTask {
    pub operation: Operation,
    pub error: String,
    /// Full error chain.
    pub details: String,
    /// Phase the task failed in; `None` when it never reached one.
    pub phase: Option<String>,
    pub failed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl FailedTask {
    fn new(operation: Operation, record: ErrorRecord, elapsed: Duration) -> Self {
        Self {
            operation,
            error: record.message,
            details: record.stack,
            phase: record.phase,
            failed_at: record.timestamp,
            duration_ms: elapsed.as_millis() as u64,
        }
    }
}

/// A task that was never started.
#[derive(Debug, Clone, Serialize)]
pub struct SkippedTask {
    pub operation: Operation,
    pub reason: String,
}

/// Per-batch bookkeeping.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchResult {
    pub successful: Vec<CompletedTask>,
    pub failed: Vec<FailedTask>,
    pub skipped: Vec<SkippedTask>,
}

impl BatchResult {
    pub fn total(&self) -> usize {
        self.successful.len() + self.failed.len() + self.skipped.len()
    }
}

/// Progress snapshot passed to the batch callback after each completion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchProgress {
    pub completed: usize,
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    /// Operation that just finished.
    pub current: String,
    pub percentage: f64,
}

/// Callback invoked after each task completion. May borrow from the caller.
pub type ProgressCallback<'a> = dyn Fn(&BatchProgress) + Send + Sync + 'a;

/// Operations planned for one batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchPlan {
    pub batch_id: String,
    pub strategy: String,
    pub mapping_type: MappingType,
    pub operations: Vec<Operation>,
    pub warnings: Vec<String>,
}

/// Estimates for every operation of a batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchEstimate {
    pub estimates: Vec<Estimate>,
    pub total_databases: usize,
    pub total_bytes: u64,
    /// Sum of per-operation estimates.
    pub sequential_seconds: u64,
    /// Rough wall-clock estimate with `max_parallel` lanes.
    pub parallel_seconds: u64,
}

/// A task currently executing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveTask {
    pub id: String,
    pub elapsed_ms: u64,
}

/// Point-in-time view of the running batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchStatus {
    pub batch_id: Option<String>,
    pub status: TaskStatus,
    pub phase: Option<BatchPhase>,
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed_ms: u64,
    pub active: Vec<ActiveTask>,
    pub completed: usize,
    pub failed: usize,
    pub pending: usize,
    pub skipped: usize,
    pub cancelled: bool,
    /// Set when the batch itself failed.
    pub error: Option<ErrorRecord>,
}

/// Shared tracker. Only the orchestrator writes to it.
#[derive(Debug, Default)]
struct BatchTracker {
    state: Option<BatchState>,
    active: HashMap<String, Instant>,
    /// Sticky: survives `start` so a cancel issued early is not lost.
    cancelled: bool,
}

impl BatchTracker {
    fn start(&mut self, batch_id: &str) {
        let mut state = BatchState::new(batch_id);
        state.start();
        state.enter_phase(BatchPhase::Initialization);
        self.state = Some(state);
        self.active.clear();
    }

    fn enter(&mut self, phase: BatchPhase) {
        if let Some(state) = self.state.as_mut() {
            state.enter_phase(phase);
        }
    }

    fn metrics(&mut self) -> Option<&mut BatchMetrics> {
        self.state.as_mut().map(|s| &mut s.metrics)
    }

    fn planned(&mut self, total: usize) {
        if let Some(metrics) = self.metrics() {
            metrics.total_tasks = total;
            metrics.pending = total;
        }
    }

    fn begin(&mut self, id: &str) {
        if let Some(metrics) = self.metrics() {
            metrics.pending = metrics.pending.saturating_sub(1);
        }
        self.active.insert(id.to_string(), Instant::now());
    }

    fn finish(&mut self, id: &str, result: &BatchResult) {
        self.active.remove(id);
        if let Some(metrics) = self.metrics() {
            metrics.completed = result.successful.len();
            metrics.failed = result.failed.len();
        }
    }

    fn skip_remaining(&mut self, skipped: usize) {
        if let Some(metrics) = self.metrics() {
            metrics.pending = 0;
            metrics.skipped = skipped;
        }
    }

    fn close(&mut self, outcome: &Result<BatchReport>) {
        let Some(state) = self.state.as_mut() else {
            return;
        };
        match outcome {
            Ok(_) => {
                state.complete();
            }
            Err(e) => {
                state.fail(e.to_string(), e.format_detailed());
            }
        }
    }
}

/// Outcome of one launched operation.
struct Completion {
    operation: Operation,
    elapsed: Duration,
    outcome: std::result::Result<MigrationResult, ErrorRecord>,
}

/// Schedules operations for a mapping.
pub struct Orchestrator {
    tool: Arc<dyn Tool>,
    progress: Arc<dyn ProgressSink>,
    work_dir: PathBuf,
    tracker: Arc<Mutex<BatchTracker>>,
}

impl Orchestrator {
    pub fn new(tool: Arc<dyn Tool>) -> Self {
        Self {
            tool,
            progress: Arc::new(TracingProgress),
            work_dir: OperationOptions::default().work_dir,
            tracker: Arc::new(Mutex::new(BatchTracker::default())),
        }
    }

    /// Set the sink that receives phase and status events.
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    /// Set the directory for temporary backup files.
    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = work_dir.into();
        self
    }

    /// Validate the mapping and create one operation per planned task.
    pub fn plan(&self, mapping: &Mapping) -> Result<BatchPlan> {
        self.plan_batch(mapping, Uuid::new_v4().to_string())
    }

    fn plan_batch(&self, mapping: &Mapping, batch_id: String) -> Result<BatchPlan> {
        let warnings = mapping.validate().into_result()?;
        for warning in &warnings {
            warn!("{}", warning);
        }

        let tasks = mapping.generate_execution_plan();
        if tasks.is_empty() {
            return Err(MigrateError::Config(
                "mapping produced no migration tasks".to_string(),
            ));
        }

        let options = OperationOptions {
            include_users: mapping.options().include_users,
            work_dir: self.work_dir.join(&batch_id),
        };
        let total = tasks.len();
        let operations = tasks
            .into_iter()
            .enumerate()
            .map(|(index, task)| {
                Operation::new(
                    task,
                    options.clone(),
                    RunMetadata {
                        batch_id: batch_id.clone(),
                        task_index: index,
                        total_tasks: total,
                        strategy: mapping.strategy().name().to_string(),
                    },
                )
            })
            .collect();

        Ok(BatchPlan {
            batch_id,
            strategy: mapping.strategy().name().to_string(),
            mapping_type: mapping.mapping_type(),
            operations,
            warnings,
        })
    }

    /// Run every task of `mapping` and produce a report.
    ///
    /// With `stop_on_error`, the first failure stops admission of new tasks;
    /// in-flight tasks finish, the rest are skipped, and the call returns
    /// [`MigrateError::BatchAborted`] carrying the partial bookkeeping.
    pub async fn execute_batch(
        &self,
        mapping: &Mapping,
        on_progress: Option<&ProgressCallback<'_>>,
    ) -> Result<BatchReport> {
        let batch_id = Uuid::new_v4().to_string();
        self.tracker.lock().start(&batch_id);

        let outcome = self.run_batch(mapping, batch_id, on_progress).await;
        self.tracker.lock().close(&outcome);
        outcome
    }

    async fn run_batch(
        &self,
        mapping: &Mapping,
        batch_id: String,
        on_progress: Option<&ProgressCallback<'_>>,
    ) -> Result<BatchReport> {
        let started = Instant::now();
        let mut plan = self.plan_batch(mapping, batch_id)?;
        self.tracker.lock().planned(plan.operations.len());

        info!(
            "Batch {}: {} task(s), strategy {}, mapping {}, max_parallel {}",
            plan.batch_id,
            plan.operations.len(),
            plan.strategy,
            plan.mapping_type,
            mapping.options().max_parallel
        );

        self.enter(BatchPhase::Validation);
        self.validate_operations(&plan.operations).await?;
        self.resolve_conflicts(mapping, &mut plan.operations).await?;

        self.enter(BatchPhase::Execution);
        let mut result = self
            .run_operations(plan.operations, mapping.options(), on_progress)
            .await?;

        if mapping.options().retry_failed && !result.failed.is_empty() {
            self.retry_failed(&mut result).await;
        }

        self.enter(BatchPhase::Consolidation);
        let consolidation = consolidation_audit(mapping, &result)?;

        self.enter(BatchPhase::Reporting);
        let report = BatchReport::build(
            plan.batch_id,
            mapping,
            &result,
            started.elapsed(),
            consolidation,
            plan.warnings,
        );

        info!(
            "Batch {} finished: {} succeeded, {} failed, {} skipped in {}",
            report.batch_id,
            report.summary.successful,
            report.summary.failed,
            report.summary.skipped,
            report.summary.duration
        );
        Ok(report)
    }

    fn enter(&self, phase: BatchPhase) {
        debug!("Batch phase: {}", phase);
        self.tracker.lock().enter(phase);
    }

    /// Estimate size and duration for every task of `mapping`.
    pub async fn estimate_batch(&self, mapping: &Mapping) -> Result<BatchEstimate> {
        let plan = self.plan(mapping)?;
        let mut estimates = Vec::with_capacity(plan.operations.len());
        for op in &plan.operations {
            estimates.push(self.tool.estimate(op).await?);
        }

        let sequential_seconds: u64 = estimates.iter().map(|e| e.estimated_seconds).sum();
        let lanes = mapping.options().max_parallel.max(1) as u64;
        let longest = estimates
            .iter()
            .map(|e| e.estimated_seconds)
            .max()
            .unwrap_or(0);

        Ok(BatchEstimate {
            total_databases: estimates.iter().map(|e| e.database_count).sum(),
            total_bytes: estimates.iter().map(|e| e.total_bytes).sum(),
            parallel_seconds: sequential_seconds.div_ceil(lanes).max(longest),
            sequential_seconds,
            estimates,
        })
    }

    /// Stop admitting tasks and forget in-flight tracking.
    ///
    /// Running tasks are not interrupted. Returns how many were active.
    /// Cancellation is sticky: a batch started afterwards on this
    /// orchestrator skips every task.
    pub fn cancel_batch(&self) -> usize {
        let mut tracker = self.tracker.lock();
        let active = tracker.active.len();
        tracker.active.clear();
        tracker.cancelled = true;
        warn!("Batch cancellation requested ({} task(s) in flight)", active);
        active
    }

    pub fn get_status(&self) -> BatchStatus {
        let tracker = self.tracker.lock();
        let mut active: Vec<ActiveTask> = tracker
            .active
            .iter()
            .map(|(id, since)| ActiveTask {
                id: id.clone(),
                elapsed_ms: since.elapsed().as_millis() as u64,
            })
            .collect();
        active.sort_by(|a, b| a.id.cmp(&b.id));

        let Some(state) = tracker.state.as_ref() else {
            return BatchStatus {
                active,
                cancelled: tracker.cancelled,
                ..BatchStatus::default()
            };
        };
        BatchStatus {
            batch_id: Some(state.id.clone()),
            status: state.status(),
            phase: state.current_phase(),
            started_at: state.started_at(),
            elapsed_ms: state.elapsed().as_millis() as u64,
            active,
            completed: state.metrics.completed,
            failed: state.metrics.failed,
            pending: state.metrics.pending,
            skipped: state.metrics.skipped,
            cancelled: tracker.cancelled,
            error: state.error().cloned(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.tracker.lock().cancelled
    }

    async fn validate_operations(&self, operations: &[Operation]) -> Result<()> {
        self.progress
            .start_phase("Validation", operations.len() as u64);
        let outcomes = join_all(operations.iter().map(|op| self.tool.validate(op))).await;

        let failures: Vec<String> = operations
            .iter()
            .zip(outcomes)
            .filter_map(|(op, outcome)| outcome.err().map(|e| format!("{}: {}", op.id(), e)))
            .collect();

        if !failures.is_empty() {
            for failure in &failures {
                error!("{}", failure);
            }
            self.progress.status(
                &format!("{} operation(s) failed validation", failures.len()),
                StatusLevel::Error,
            );
            return Err(MigrateError::Validation(format!(
                "{} operation(s) failed validation: {}",
                failures.len(),
                failures.join("; ")
            )));
        }

        self.progress
            .complete_phase(&format!("{} operation(s) valid", operations.len()));
        Ok(())
    }

    /// Resolve database-name collisions between operations sharing a target.
    ///
    /// Runs before anything executes. `fail` aborts the batch naming the
    /// database; `prefix` and `suffix` record the new names on the operation
    /// that brings the duplicate. `merge` batches are audited afterwards.
    async fn resolve_conflicts(&self, mapping: &Mapping, operations: &mut [Operation]) -> Result<()> {
        let policy = mapping.conflict_resolution();
        if policy == ConflictResolution::Merge {
            return Ok(());
        }

        let mut by_target: Vec<(String, Vec<usize>)> = Vec::new();
        for (index, op) in operations.iter().enumerate() {
            let target = op.target().key();
            match by_target.iter_mut().find(|(t, _)| *t == target) {
                Some((_, members)) => members.push(index),
                None => by_target.push((target, vec![index])),
            }
        }

        for (target, members) in by_target.into_iter().filter(|(_, m)| m.len() > 1) {
            // (operation index, source database name), aligned with `entries`
            let mut origins: Vec<(usize, String)> = Vec::new();
            let mut entries: Vec<DatabaseEntry> = Vec::new();
            for index in members {
                let op = &operations[index];
                let names = match self.tool.discover(op).await {
                    Ok(names) => names,
                    Err(e) => {
                        warn!(
                            "{}: cannot list databases for conflict check: {}",
                            op.label(),
                            e
                        );
                        continue;
                    }
                };
                for name in names {
                    entries.push(DatabaseEntry::new(
                        op.target_database_name(&name),
                        op.source().instance.clone(),
                    ));
                    origins.push((index, name));
                }
            }

            let resolved = match resolve_database_conflicts(&entries, policy) {
                Ok(resolved) => resolved,
                Err(e) => {
                    error!("{}: {}", target, e);
                    self.progress
                        .status(&format!("{}: {}", target, e), StatusLevel::Error);
                    return Err(e);
                }
            };

            for ((index, source_name), db) in origins.into_iter().zip(resolved) {
                if db.name == db.original_name {
                    continue;
                }
                let op = &mut operations[index];
                info!(
                    "{}: database '{}' will be restored as '{}' on {}",
                    op.id(),
                    source_name,
                    db.name,
                    target
                );
                op.rename_database(source_name, db.name);
                if let Some(metrics) = self.tracker.lock().metrics() {
                    metrics.renamed_databases += 1;
                }
            }
        }
        Ok(())
    }

    async fn run_operations(
        &self,
        operations: Vec<Operation>,
        options: &BatchOptions,
        on_progress: Option<&ProgressCallback<'_>>,
    ) -> Result<BatchResult> {
        let total = operations.len();
        let max_parallel = options.max_parallel.max(1);
        let mut queue = operations.into_iter();
        let mut in_flight = FuturesUnordered::new();
        let mut result = BatchResult::default();
        let mut first_failure: Option<(String, String)> = None;

        self.progress.start_phase("Execution", total as u64);

        loop {
            while in_flight.len() < max_parallel && first_failure.is_none() && !self.is_cancelled() {
                let Some(op) = queue.next() else { break };
                self.tracker.lock().begin(op.id());
                info!("{}: started", op.label());
                in_flight.push(launch(self.tool.clone(), self.progress.clone(), op));
            }

            let Some(done) = in_flight.next().await else {
                break;
            };

            let id = done.operation.id().to_string();
            let failure = self.record(&mut result, done);
            if let Some(reason) = failure {
                if options.stop_on_error && first_failure.is_none() {
                    warn!("{}: failed, stopping admission of new tasks", id);
                    first_failure = Some((id.clone(), reason));
                }
            }

            let completed = result.successful.len() + result.failed.len();
            self.progress.update(completed as u64, &id, None);
            if let Some(callback) = on_progress {
                callback(&BatchProgress {
                    completed,
                    total,
                    successful: result.successful.len(),
                    failed: result.failed.len(),
                    current: id,
                    percentage: completed as f64 * 100.0 / total as f64,
                });
            }
        }

        let reason = if first_failure.is_some() {
            SKIPPED_AFTER_FAILURE
        } else {
            SKIPPED_AFTER_CANCEL
        };
        for operation in queue {
            info!("{}: skipped ({})", operation.label(), reason);
            result.skipped.push(SkippedTask {
                operation,
                reason: reason.to_string(),
            });
        }
        self.tracker.lock().skip_remaining(result.skipped.len());

        self.progress.complete_phase(&format!(
            "{} succeeded, {} failed, {} skipped",
            result.successful.len(),
            result.failed.len(),
            result.skipped.len()
        ));

        if let Some((task_id, reason)) = first_failure {
            return Err(MigrateError::BatchAborted {
                task_id,
                reason,
                result: Box::new(result),
            });
        }
        Ok(result)
    }

    /// Run failed tasks once more, one at a time.
    async fn retry_failed(&self, result: &mut BatchResult) {
        let failed = std::mem::take(&mut result.failed);
        info!("Retrying {} failed task(s)", failed.len());
        self.progress.start_phase("Retry", failed.len() as u64);

        for (i, task) in failed.into_iter().enumerate() {
            if self.is_cancelled() {
                result.failed.push(task);
                continue;
            }
            {
                let mut tracker = self.tracker.lock();
                tracker.begin(task.operation.id());
                if let Some(metrics) = tracker.metrics() {
                    metrics.retried += 1;
                }
            }
            info!("{}: retrying", task.operation.label());
            let done = launch(self.tool.clone(), self.progress.clone(), task.operation).await;
            self.record(result, done);
            self.progress.update(i as u64 + 1, "retry", None);
        }

        self.progress.complete_phase(&format!(
            "{} task(s) still failing after retry",
            result.failed.len()
        ));
    }

    /// Store a completion. Returns the error message if it failed.
    fn record(&self, result: &mut BatchResult, done: Completion) -> Option<String> {
        let id = done.operation.id().to_string();
        let failure = match done.outcome {
            Ok(outcome) => {
                info!("{}: completed in {}ms", id, outcome.duration_ms);
                result.successful.push(CompletedTask {
                    operation: done.operation,
                    result: outcome,
                });
                None
            }
            Err(record) => {
                let error = record.message.clone();
                match record.phase.as_deref() {
                    Some(phase) => error!("{}: failed during {} - {}", id, phase, error),
                    None => error!("{}: failed - {}", id, error),
                }
                self.progress
                    .status(&format!("{}: {}", id, error), StatusLevel::Error);
                result
                    .failed
                    .push(FailedTask::new(done.operation, record, done.elapsed));
                Some(error)
            }
        };
        self.tracker.lock().finish(&id, result);
        failure
    }
}

/// Spawn one operation. Panics inside the tool are reported as failures.
fn launch(
    tool: Arc<dyn Tool>,
    progress: Arc<dyn ProgressSink>,
    operation: Operation,
) -> impl Future<Output = Completion> + Send + 'static {
    async move {
        let started = Instant::now();
        let op = operation.clone();
        let handle = tokio::spawn(async move { tool.execute(&op, progress).await });
        let outcome = match handle.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(failure)) => Err(failure.record),
            Err(e) => {
                error!("{}: task panicked - {}", operation.id(), e);
                let message = format!("Task panicked: {}", e);
                Err(ErrorRecord::new(message.clone(), message, None))
            }
        };
        Completion {
            operation,
            elapsed: started.elapsed(),
            outcome,
        }
    }
}

/// Audit database names per target for N:1 batches under `merge`.
fn consolidation_audit(mapping: &Mapping, result: &BatchResult) -> Result<Vec<ConsolidationAudit>> {
    if mapping.mapping_type() != MappingType::ManyToOne
        || mapping.conflict_resolution() != ConflictResolution::Merge
    {
        return Ok(Vec::new());
    }

    let mut by_target: Vec<(String, Vec<DatabaseEntry>)> = Vec::new();
    for task in &result.successful {
        let target = task.result.target.clone();
        let entries = task.result.databases.iter().map(|db| {
            DatabaseEntry::new(db.target_name.clone(), task.operation.source().instance.clone())
        });
        match by_target.iter_mut().find(|(t, _)| *t == target) {
            Some((_, existing)) => existing.extend(entries),
            None => by_target.push((target, entries.collect())),
        }
    }

    let mut audits = Vec::with_capacity(by_target.len());
    for (target, entries) in by_target {
        let databases = resolve_database_conflicts(&entries, ConflictResolution::Merge)?;
        let merged: Vec<String> = databases
            .iter()
            .filter(|db| db.sources.len() > 1)
            .map(|db| db.name.clone())
            .collect();
        for name in &merged {
            warn!(
                "{}: database '{}' was restored from more than one source",
                target, name
            );
        }
        audits.push(ConsolidationAudit {
            target,
            databases,
            merged,
        });
    }
    Ok(audits)
}
