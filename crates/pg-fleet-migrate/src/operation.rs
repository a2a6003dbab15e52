//! Operations: planned tasks bound to resolved options and run metadata.
//!
//! The orchestrator creates one [`Operation`] per task at initialization and
//! records database renames during validation. Operations are never modified
//! once execution starts; the engine and tools only read them.

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::core::Endpoint;
use crate::mapping::MigrationTask;

/// Options resolved for every operation of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationOptions {
    /// Replicate roles and database grants.
    pub include_users: bool,
    /// Directory for temporary backup files.
    pub work_dir: PathBuf,
}

impl Default for OperationOptions {
    fn default() -> Self {
        Self {
            include_users: false,
            work_dir: std::env::temp_dir().join("pg-fleet-migrate"),
        }
    }
}

/// Where an operation sits within its batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunMetadata {
    pub batch_id: String,
    pub task_index: usize,
    pub total_tasks: usize,
    pub strategy: String,
}

/// The unit of execution handed to a [`Tool`](crate::tool::Tool).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Operation {
    id: String,
    task: MigrationTask,
    options: OperationOptions,
    run: RunMetadata,
    /// Source database name to target name, set by conflict resolution.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    renames: BTreeMap<String, String>,
}

impl Operation {
    pub fn new(task: MigrationTask, options: OperationOptions, run: RunMetadata) -> Self {
        Self {
            id: format!("task-{}", run.task_index + 1),
            task,
            options,
            run,
            renames: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn task(&self) -> &MigrationTask {
        &self.task
    }

    pub fn source(&self) -> &Endpoint {
        self.task.source()
    }

    pub fn target(&self) -> &Endpoint {
        self.task.target()
    }

    pub fn options(&self) -> &OperationOptions {
        &self.options
    }

    pub fn run(&self) -> &RunMetadata {
        &self.run
    }

    /// Restore `source_name` under `target_name` instead of its planned name.
    pub fn rename_database(&mut self, source_name: impl Into<String>, target_name: impl Into<String>) {
        self.renames.insert(source_name.into(), target_name.into());
    }

    pub fn renames(&self) -> &BTreeMap<String, String> {
        &self.renames
    }

    /// Name a source database will have on the target.
    pub fn target_database_name(&self, source_name: &str) -> String {
        if let Some(renamed) = self.renames.get(source_name) {
            return renamed.clone();
        }
        match self.task.prefix_with() {
            Some(prefix) => format!("{}_{}", prefix, source_name),
            None => source_name.to_string(),
        }
    }

    /// Short label used in logs and reports.
    pub fn label(&self) -> String {
        format!("{} ({})", self.id, self.task.path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::tests::ep;
    use crate::mapping::{ConflictResolution, Mapping, Strategy};

    fn operation(policy: ConflictResolution) -> Operation {
        let mapping = Mapping::new(Strategy::Consolidate {
            sources: vec![ep("p", "a"), ep("p", "b")],
            targets: vec![ep("p", "t")],
        })
        .with_conflict_resolution(policy);
        let task = mapping.generate_execution_plan().remove(1);
        Operation::new(
            task,
            OperationOptions::default(),
            RunMetadata {
                batch_id: "batch".to_string(),
                task_index: 1,
                total_tasks: 2,
                strategy: "consolidate".to_string(),
            },
        )
    }

    #[test]
    fn test_operation_identity() {
        let op = operation(ConflictResolution::Fail);
        assert_eq!(op.id(), "task-2");
        assert_eq!(op.label(), "task-2 (p:b -> p:t)");
        assert_eq!(op.source().instance, "b");
        assert_eq!(op.run().total_tasks, 2);
    }

    #[test]
    fn test_target_database_name() {
        assert_eq!(
            operation(ConflictResolution::Prefix).target_database_name("users"),
            "b_users"
        );
        assert_eq!(
            operation(ConflictResolution::Fail).target_database_name("users"),
            "users"
        );
    }

    #[test]
    fn test_rename_takes_precedence() {
        let mut op = operation(ConflictResolution::Suffix);
        op.rename_database("users", "users_2");
        assert_eq!(op.target_database_name("users"), "users_2");
        assert_eq!(op.target_database_name("orders"), "orders");

        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["renames"]["users"], "users_2");
    }
}
