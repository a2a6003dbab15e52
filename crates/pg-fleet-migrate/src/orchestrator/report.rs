//! Batch report generation.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

use super::BatchResult;
use crate::error::Result;
use crate::mapping::{Mapping, MappingType, ResolvedDatabase};
use crate::progress::format_duration;

/// Headline numbers for a batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSummary {
    pub strategy: String,
    pub mapping_type: MappingType,
    pub total_tasks: usize,
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duration_ms: u64,
    /// Human-readable duration.
    pub duration: String,
    /// Successful over total, two decimals, e.g. `50.00%`.
    pub success_rate: String,
}

/// Outcome of one task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskRecord {
    pub id: String,
    pub source: String,
    pub target: String,
    /// `completed`, `failed` or `skipped`.
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub databases: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Phase a failed task stopped in.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

/// Duration statistics over successful tasks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceStats {
    pub average_ms: u64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub total_ms: u64,
}

impl PerformanceStats {
    fn from_durations(durations: &[u64]) -> Option<Self> {
        let total_ms: u64 = durations.iter().sum();
        Some(Self {
            average_ms: total_ms / durations.len().max(1) as u64,
            min_ms: *durations.iter().min()?,
            max_ms: *durations.iter().max()?,
            total_ms,
        })
    }
}

/// Database names that ended up on one consolidation target.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsolidationAudit {
    pub target: String,
    pub databases: Vec<ResolvedDatabase>,
    /// Names restored from more than one source.
    pub merged: Vec<String>,
}

/// Final report for a batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub batch_id: String,
    pub generated_at: DateTime<Utc>,
    pub summary: BatchSummary,
    pub tasks: Vec<TaskRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub performance: Option<PerformanceStats>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub consolidation: Vec<ConsolidationAudit>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl BatchReport {
    pub fn build(
        batch_id: String,
        mapping: &Mapping,
        result: &BatchResult,
        elapsed: Duration,
        consolidation: Vec<ConsolidationAudit>,
        warnings: Vec<String>,
    ) -> Self {
        let mut tasks: Vec<TaskRecord> = Vec::with_capacity(result.total());

        for task in &result.successful {
            tasks.push(TaskRecord {
                id: task.operation.id().to_string(),
                source: task.operation.source().key(),
                target: task.operation.target().key(),
                status: "completed".to_string(),
                duration_ms: Some(task.result.duration_ms),
                databases: task
                    .result
                    .target_database_names()
                    .into_iter()
                    .map(String::from)
                    .collect(),
                error: None,
                phase: None,
            });
        }
        for task in &result.failed {
            tasks.push(TaskRecord {
                id: task.operation.id().to_string(),
                source: task.operation.source().key(),
                target: task.operation.target().key(),
                status: "failed".to_string(),
                duration_ms: Some(task.duration_ms),
                databases: Vec::new(),
                error: Some(task.error.clone()),
                phase: task.phase.clone(),
            });
        }
        for task in &result.skipped {
            tasks.push(TaskRecord {
                id: task.operation.id().to_string(),
                source: task.operation.source().key(),
                target: task.operation.target().key(),
                status: "skipped".to_string(),
                duration_ms: None,
                databases: Vec::new(),
                error: Some(task.reason.clone()),
                phase: None,
            });
        }
        tasks.sort_by_key(|t| task_index(&t.id));

        let durations: Vec<u64> = result
            .successful
            .iter()
            .map(|t| t.result.duration_ms)
            .collect();

        let total = result.total();
        let success_rate = if total == 0 {
            0.0
        } else {
            result.successful.len() as f64 * 100.0 / total as f64
        };

        Self {
            batch_id,
            generated_at: Utc::now(),
            summary: BatchSummary {
                strategy: mapping.strategy().name().to_string(),
                mapping_type: mapping.mapping_type(),
                total_tasks: total,
                successful: result.successful.len(),
                failed: result.failed.len(),
                skipped: result.skipped.len(),
                duration_ms: elapsed.as_millis() as u64,
                duration: format_duration(elapsed),
                success_rate: format!("{:.2}%", success_rate),
            },
            tasks,
            performance: PerformanceStats::from_durations(&durations),
            consolidation,
            warnings,
        }
    }

    pub fn is_success(&self) -> bool {
        self.summary.failed == 0 && self.summary.skipped == 0
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Numeric part of `task-N`, for ordering.
fn task_index(id: &str) -> usize {
    id.strip_prefix("task-")
        .and_then(|n| n.parse().ok())
        .unwrap_or(usize::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{MigratedDatabase, MigrationResult, TaskMetrics};
    use crate::mapping::tests::ep;
    use crate::mapping::Strategy;
    use crate::orchestrator::{CompletedTask, FailedTask, SkippedTask};
    use crate::operation::{Operation, OperationOptions, RunMetadata};

    fn mapping() -> Mapping {
        Mapping::new(Strategy::Simple {
            sources: vec![ep("p", "a"), ep("p", "b"), ep("p", "c")],
            targets: vec![ep("p", "t")],
        })
    }

    fn ops() -> Vec<Operation> {
        mapping()
            .generate_execution_plan()
            .into_iter()
            .enumerate()
            .map(|(i, task)| {
                Operation::new(
                    task,
                    OperationOptions::default(),
                    RunMetadata {
                        batch_id: "b".to_string(),
                        task_index: i,
                        total_tasks: 3,
                        strategy: "simple".to_string(),
                    },
                )
            })
            .collect()
    }

    fn success(op: Operation, duration_ms: u64) -> CompletedTask {
        CompletedTask {
            result: MigrationResult {
                success: true,
                migration_id: op.id().to_string(),
                duration_ms,
                metrics: TaskMetrics::default(),
                databases: vec![MigratedDatabase {
                    source_name: "app".to_string(),
                    target_name: "app".to_string(),
                    size_bytes: 1,
                }],
                source: op.source().key(),
                target: op.target().key(),
            },
            operation: op,
        }
    }

    #[test]
    fn test_report_summary() {
        let mut ops = ops().into_iter();
        let (a, b, c) = (ops.next().unwrap(), ops.next().unwrap(), ops.next().unwrap());
        let result = BatchResult {
            successful: vec![success(c, 300), success(a, 100)],
            failed: vec![FailedTask {
                operation: b,
                error: "boom".to_string(),
                details: "Error: boom".to_string(),
                phase: Some("Import".to_string()),
                failed_at: Utc::now(),
                duration_ms: 5,
            }],
            skipped: vec![],
        };

        let report = BatchReport::build(
            "batch-1".to_string(),
            &mapping(),
            &result,
            Duration::from_millis(1500),
            vec![],
            vec![],
        );

        assert_eq!(report.summary.total_tasks, 3);
        assert_eq!(report.summary.success_rate, "66.67%");
        assert_eq!(report.summary.duration, "1.5s");
        assert_eq!(report.summary.mapping_type, MappingType::ManyToOne);
        let ids: Vec<&str> = report.tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["task-1", "task-2", "task-3"]);
        let perf = report.performance.unwrap();
        assert_eq!((perf.min_ms, perf.max_ms, perf.average_ms), (100, 300, 200));
        assert_eq!(report.summary.successful, 2);
        assert_eq!(report.tasks[1].phase.as_deref(), Some("Import"));
        assert!(report.tasks[0].phase.is_none());
    }

    #[test]
    fn test_report_with_skips_is_not_success() {
        let mut ops = ops().into_iter();
        let a = ops.next().unwrap();
        let result = BatchResult {
            successful: vec![success(a, 10)],
            failed: vec![],
            skipped: ops
                .map(|operation| SkippedTask {
                    operation,
                    reason: "Skipped due to previous failure".to_string(),
                })
                .collect(),
        };
        let report = BatchReport::build(
            "batch-2".to_string(),
            &mapping(),
            &result,
            Duration::from_millis(20),
            vec![],
            vec![],
        );
        assert!(!report.is_success());
        assert_eq!(report.summary.skipped, 2);
        assert_eq!(report.summary.success_rate, "33.33%");

        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["summary"]["mapping_type"], "N:1");
        assert_eq!(json["tasks"][1]["status"], "skipped");
    }

    #[test]
    fn test_empty_batch_stats() {
        let report = BatchReport::build(
            "batch-3".to_string(),
            &mapping(),
            &BatchResult::default(),
            Duration::ZERO,
            vec![],
            vec![],
        );
        assert_eq!(report.summary.success_rate, "0.00%");
        assert!(report.performance.is_none());
    }
}
