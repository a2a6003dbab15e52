//! In-memory execution state for tasks and batches.
//!
//! Each state value is owned by exactly one writer: the execution engine for
//! a task, the orchestrator for a batch. Status only moves forward:
//! `pending -> running -> {completed | failed}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::warn;

/// Execution status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Check whether `self -> next` is a legal transition.
    pub fn can_advance_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fatal error captured at the point it stopped execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    /// Full error chain.
    pub stack: String,
    /// Phase that was running, if any.
    pub phase: Option<String>,
}

impl ErrorRecord {
    pub fn new(message: impl Into<String>, stack: impl Into<String>, phase: Option<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            message: message.into(),
            stack: stack.into(),
            phase,
        }
    }
}

/// Status, current phase, timing and metrics of one task or one batch.
///
/// `P` is the phase type, `M` the metrics type.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionState<P, M> {
    pub id: String,
    status: TaskStatus,
    current_phase: Option<P>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    clock: Option<Instant>,
    pub metrics: M,
    error: Option<ErrorRecord>,
}

impl<P: Copy + fmt::Display, M: Default> ExecutionState<P, M> {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: TaskStatus::Pending,
            current_phase: None,
            started_at: None,
            completed_at: None,
            clock: None,
            metrics: M::default(),
            error: None,
        }
    }

    /// Move to `running` and start the clock.
    pub fn start(&mut self) -> bool {
        if !self.advance(TaskStatus::Running) {
            return false;
        }
        self.started_at = Some(Utc::now());
        self.clock = Some(Instant::now());
        true
    }

    /// Record the phase now executing.
    pub fn enter_phase(&mut self, phase: P) {
        self.current_phase = Some(phase);
    }

    /// Move to `completed`.
    pub fn complete(&mut self) -> bool {
        if !self.advance(TaskStatus::Completed) {
            return false;
        }
        self.completed_at = Some(Utc::now());
        true
    }

    /// Move to `failed`, recording the error against the current phase.
    pub fn fail(&mut self, message: impl Into<String>, stack: impl Into<String>) -> bool {
        if !self.advance(TaskStatus::Failed) {
            return false;
        }
        self.completed_at = Some(Utc::now());
        let phase = self.current_phase.map(|p| p.to_string());
        self.error = Some(ErrorRecord::new(message, stack, phase));
        true
    }

    fn advance(&mut self, next: TaskStatus) -> bool {
        if !self.status.can_advance_to(next) {
            warn!(
                "{}: ignoring status transition {} -> {}",
                self.id, self.status, next
            );
            return false;
        }
        self.status = next;
        true
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn current_phase(&self) -> Option<P> {
        self.current_phase
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn error(&self) -> Option<&ErrorRecord> {
        self.error.as_ref()
    }

    /// Time since `start()`, zero if not started.
    pub fn elapsed(&self) -> Duration {
        self.clock.map_or(Duration::ZERO, |c| c.elapsed())
    }
}
