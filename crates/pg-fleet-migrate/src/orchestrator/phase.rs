//! Batch phases and counters.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::state::ExecutionState;

/// One stage of a batch, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchPhase {
    Initialization,
    Validation,
    Execution,
    Consolidation,
    Reporting,
}

impl BatchPhase {
    pub fn name(&self) -> &'static str {
        match self {
            BatchPhase::Initialization => "Initialization",
            BatchPhase::Validation => "Validation",
            BatchPhase::Execution => "Execution",
            BatchPhase::Consolidation => "Consolidation",
            BatchPhase::Reporting => "Reporting",
        }
    }
}

impl fmt::Display for BatchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Counters for the running batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchMetrics {
    pub total_tasks: usize,
    pub completed: usize,
    pub failed: usize,
    pub pending: usize,
    pub skipped: usize,
    /// Tasks run a second time by the retry pass.
    pub retried: usize,
    /// Databases given a new target name before execution.
    pub renamed_databases: usize,
}

/// Execution state of one batch.
pub type BatchState = ExecutionState<BatchPhase, BatchMetrics>;
