//! Phase sequence, metrics and result types for a single migration.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::MigrateError;
use crate::state::ErrorRecord;

/// One stage of a migration, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Validation,
    Discovery,
    Preflight,
    UsersRoles,
    Export,
    Import,
    ApplyPermissions,
    PostValidation,
    Cleanup,
}

impl Phase {
    /// Human-readable phase name.
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Validation => "Validation",
            Phase::Discovery => "Discovery",
            Phase::Preflight => "Pre-flight Checks",
            Phase::UsersRoles => "Users & Roles Setup",
            Phase::Export => "Export",
            Phase::Import => "Import",
            Phase::ApplyPermissions => "Apply Permissions",
            Phase::PostValidation => "Post-migration Validation",
            Phase::Cleanup => "Cleanup",
        }
    }

    /// Phases run for an operation; the two permission phases are flag-gated.
    pub fn sequence(with_permissions: bool) -> Vec<Phase> {
        let mut phases = vec![Phase::Validation, Phase::Discovery, Phase::Preflight];
        if with_permissions {
            phases.push(Phase::UsersRoles);
        }
        phases.extend([Phase::Export, Phase::Import]);
        if with_permissions {
            phases.push(Phase::ApplyPermissions);
        }
        phases.extend([Phase::PostValidation, Phase::Cleanup]);
        phases
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Wall-clock time spent in one phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTiming {
    pub phase: Phase,
    pub duration_ms: u64,
}

/// Counters collected while a migration runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMetrics {
    pub databases_total: usize,
    pub bytes_total: u64,
    pub databases_exported: usize,
    pub bytes_exported: u64,
    pub databases_imported: usize,
    pub roles_applied: usize,
    pub role_failures: usize,
    pub permissions_applied: usize,
    pub permission_failures: usize,
    pub phases: Vec<PhaseTiming>,
}

/// A database that reached the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigratedDatabase {
    pub source_name: String,
    pub target_name: String,
    pub size_bytes: u64,
}

/// Result of one successful migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationResult {
    pub success: bool,
    pub migration_id: String,
    pub duration_ms: u64,
    pub metrics: TaskMetrics,
    pub databases: Vec<MigratedDatabase>,
    pub source: String,
    pub target: String,
}

impl MigrationResult {
    /// Names of the migrated databases on the target.
    pub fn target_database_names(&self) -> Vec<&str> {
        self.databases.iter().map(|d| d.target_name.as_str()).collect()
    }

    /// Convert to JSON string.
    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// A failed migration: the error and the record taken when it stopped.
#[derive(Debug)]
pub struct TaskFailure {
    pub error: MigrateError,
    /// Carries the phase that was running.
    pub record: ErrorRecord,
}

impl TaskFailure {
    /// Phase the migration failed in, if it got that far.
    pub fn phase(&self) -> Option<&str> {
        self.record.phase.as_deref()
    }
}

impl From<MigrateError> for TaskFailure {
    fn from(error: MigrateError) -> Self {
        let record = ErrorRecord::new(error.to_string(), error.format_detailed(), None);
        Self { error, record }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.phase() {
            Some(phase) => write!(f, "{} (during {})", self.error, phase),
            None => write!(f, "{}", self.error),
        }
    }
}
