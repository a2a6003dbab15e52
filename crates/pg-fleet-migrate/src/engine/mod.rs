//! Per-operation execution engine.
//!
//! Runs the fixed phase sequence for one source-to-target operation:
//!
//! 1. Validation: endpoint identity checks
//! 2. Discovery: list source databases, apply the selection, drop system databases
//! 3. Pre-flight: both instances must be reachable
//! 4. Users & Roles (optional): replicate roles, statement failures only warn
//! 5. Export: dump each database to the work directory
//! 6. Import: restore each dump under its target name
//! 7. Apply Permissions (optional): ownership and grants, statement failures only warn
//! 8. Post-migration Validation: every migrated database must accept connections
//! 9. Cleanup: always runs, never masks the original error

pub mod phase;

pub use phase::{MigratedDatabase, MigrationResult, Phase, PhaseTiming, TaskFailure, TaskMetrics};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::core::{
    is_system_database, ConnectionProvider, DatabaseInfo, DatabasePermissions, DatabaseSelection,
    Endpoint, ExportOptions, ExportPrimitive, ImportOptions, ImportPrimitive,
    PermissionsCollaborator, ProgressSink, StatementFailure, StatusLevel,
};
use crate::error::{MigrateError, Result};
use crate::operation::Operation;
use crate::progress::format_bytes;
use crate::state::ExecutionState;

/// Execution state of one operation.
pub type TaskState = ExecutionState<Phase, TaskMetrics>;

/// A database exported to a local backup file.
#[derive(Debug, Clone)]
struct ExportedDatabase {
    source_name: String,
    target_name: String,
    size_bytes: u64,
    backup_file: PathBuf,
}

/// Per-execution context: the single writer of its task state.
struct Run<'a> {
    op: &'a Operation,
    progress: &'a dyn ProgressSink,
    state: TaskState,
    artifacts: Vec<PathBuf>,
    permissions: Vec<DatabasePermissions>,
    used_permissions: bool,
}

/// Databases to migrate from a source listing.
///
/// System databases are always excluded, whatever the selection says.
pub fn select_databases(listing: Vec<DatabaseInfo>, selection: &DatabaseSelection) -> Vec<DatabaseInfo> {
    listing
        .into_iter()
        .filter(|db| !is_system_database(&db.name) && selection.includes(&db.name))
        .collect()
}

/// Check that an operation's endpoints are complete and distinct.
pub fn check_endpoints(op: &Operation) -> Result<()> {
    for (role, endpoint) in [("source", op.source()), ("target", op.target())] {
        if endpoint.project.trim().is_empty() {
            return Err(MigrateError::Config(format!("{}.project is required", role)));
        }
        if endpoint.instance.trim().is_empty() {
            return Err(MigrateError::Config(format!("{}.instance is required", role)));
        }
    }
    if op.source().key() == op.target().key() {
        return Err(MigrateError::Config(format!(
            "source and target are the same instance ({})",
            op.source().key()
        )));
    }
    Ok(())
}

/// Drives the collaborators through the phase sequence.
pub struct ExecutionEngine {
    connections: Arc<dyn ConnectionProvider>,
    exporter: Arc<dyn ExportPrimitive>,
    importer: Arc<dyn ImportPrimitive>,
    permissions: Option<Arc<dyn PermissionsCollaborator>>,
}

impl ExecutionEngine {
    pub fn new(
        connections: Arc<dyn ConnectionProvider>,
        exporter: Arc<dyn ExportPrimitive>,
        importer: Arc<dyn ImportPrimitive>,
    ) -> Self {
        Self {
            connections,
            exporter,
            importer,
            permissions: None,
        }
    }

    /// Enable role and grant replication for operations with `include_users`.
    pub fn with_permissions(mut self, permissions: Arc<dyn PermissionsCollaborator>) -> Self {
        self.permissions = Some(permissions);
        self
    }

    pub fn connections(&self) -> &Arc<dyn ConnectionProvider> {
        &self.connections
    }

    /// Run every phase for `op`.
    ///
    /// On failure the error is recorded against the running phase, cleanup
    /// still runs, and the original error is returned with that record.
    pub async fn execute(
        &self,
        op: &Operation,
        progress: &dyn ProgressSink,
    ) -> std::result::Result<MigrationResult, TaskFailure> {
        let mut run = Run {
            op,
            progress,
            state: TaskState::new(op.id()),
            artifacts: Vec::new(),
            permissions: Vec::new(),
            used_permissions: false,
        };
        run.state.start();
        info!("{}: starting migration", op.label());

        let outcome = self.run_phases(&mut run).await;

        if let Err(e) = &outcome {
            let phase = run.state.current_phase();
            run.state.fail(e.to_string(), e.format_detailed());
            error!(
                "{}: failed during {}: {}",
                op.id(),
                phase.map_or("startup", |p| p.name()),
                e
            );
        }

        self.cleanup(&mut run).await;

        let databases = match outcome {
            Ok(databases) => databases,
            Err(error) => {
                return Err(match run.state.error() {
                    Some(record) => TaskFailure {
                        record: record.clone(),
                        error,
                    },
                    None => TaskFailure::from(error),
                });
            }
        };
        run.state.complete();
        let duration_ms = run.state.elapsed().as_millis() as u64;
        info!(
            "{}: migrated {} database(s) in {}ms",
            op.id(),
            databases.len(),
            duration_ms
        );

        Ok(MigrationResult {
            success: true,
            migration_id: op.id().to_string(),
            duration_ms,
            metrics: run.state.metrics,
            databases,
            source: op.source().key(),
            target: op.target().key(),
        })
    }

    async fn run_phases(&self, run: &mut Run<'_>) -> Result<Vec<MigratedDatabase>> {
        let with_permissions = self.permissions_enabled(run.op);

        let started = self.begin(run, Phase::Validation);
        let result = check_endpoints(run.op);
        self.finish(run, Phase::Validation, started, result, |_| {
            "endpoints valid".to_string()
        })?;

        let started = self.begin(run, Phase::Discovery);
        let result = self.discover(run).await;
        let databases = self.finish(run, Phase::Discovery, started, result, |dbs| {
            format!("found {} database(s)", dbs.len())
        })?;

        let started = self.begin(run, Phase::Preflight);
        let result = self.preflight(run).await;
        self.finish(run, Phase::Preflight, started, result, |_| {
            "source and target reachable".to_string()
        })?;

        if with_permissions {
            let started = self.begin(run, Phase::UsersRoles);
            let result = self.replicate_roles(run, &databases).await;
            self.finish(run, Phase::UsersRoles, started, result, |n| {
                format!("applied {} role statement(s)", n)
            })?;
        }

        let started = self.begin(run, Phase::Export);
        let result = self.export(run, &databases).await;
        let exported = self.finish(run, Phase::Export, started, result, |e| {
            format!("exported {} database(s)", e.len())
        })?;

        let started = self.begin(run, Phase::Import);
        let result = self.import(run, &exported).await;
        let migrated = self.finish(run, Phase::Import, started, result, |m| {
            format!("imported {} database(s)", m.len())
        })?;

        if with_permissions {
            let started = self.begin(run, Phase::ApplyPermissions);
            let result = self.apply_permissions(run, &migrated).await;
            self.finish(run, Phase::ApplyPermissions, started, result, |n| {
                format!("applied {} permission statement(s)", n)
            })?;
        }

        let started = self.begin(run, Phase::PostValidation);
        let result = self.post_validate(run, &migrated).await;
        self.finish(run, Phase::PostValidation, started, result, |_| {
            "all databases reachable on target".to_string()
        })?;

        Ok(migrated)
    }

    fn permissions_enabled(&self, op: &Operation) -> bool {
        if !op.options().include_users {
            return false;
        }
        if self.permissions.is_none() {
            warn!(
                "{}: include_users is set but no permissions collaborator is configured, skipping roles",
                op.id()
            );
            return false;
        }
        true
    }

    fn begin(&self, run: &mut Run<'_>, phase: Phase) -> Instant {
        run.state.enter_phase(phase);
        run.progress.start_phase(phase.name(), 1);
        debug!("{}: entering phase {}", run.op.id(), phase);
        Instant::now()
    }

    fn finish<T>(
        &self,
        run: &mut Run<'_>,
        phase: Phase,
        started: Instant,
        result: Result<T>,
        summary: impl FnOnce(&T) -> String,
    ) -> Result<T> {
        run.state.metrics.phases.push(PhaseTiming {
            phase,
            duration_ms: started.elapsed().as_millis() as u64,
        });
        match result {
            Ok(value) => {
                run.progress.update(1, "complete", None);
                run.progress.complete_phase(&summary(&value));
                Ok(value)
            }
            Err(e) => {
                run.progress
                    .status(&format!("{} failed: {}", phase.name(), e), StatusLevel::Error);
                Err(e)
            }
        }
    }

    async fn discover(&self, run: &mut Run<'_>) -> Result<Vec<DatabaseInfo>> {
        let source = run.op.source();
        let selection = run.op.task().databases();
        let listing = self.connections.list_databases(source, true).await?;

        if let DatabaseSelection::Only(wanted) = selection {
            for name in wanted {
                if !listing.iter().any(|db| &db.name == name) {
                    warn!("{}: database '{}' not found on {}", run.op.id(), name, source);
                }
            }
        }

        let databases = select_databases(listing, selection);
        if databases.is_empty() {
            return Err(MigrateError::NoDatabases {
                endpoint: source.key(),
            });
        }

        let total_bytes: u64 = databases.iter().map(|db| db.size_bytes).sum();
        run.state.metrics.databases_total = databases.len();
        run.state.metrics.bytes_total = total_bytes;
        run.progress.update(
            0,
            &format!(
                "{} database(s), {} total",
                databases.len(),
                format_bytes(total_bytes)
            ),
            Some(total_bytes),
        );
        Ok(databases)
    }

    async fn preflight(&self, run: &mut Run<'_>) -> Result<()> {
        for endpoint in [run.op.source(), run.op.target()] {
            self.reach(endpoint, None).await?;
        }
        Ok(())
    }

    async fn reach(&self, endpoint: &Endpoint, database: Option<&str>) -> Result<()> {
        match self.connections.test_connection(endpoint, database).await {
            Ok(()) => Ok(()),
            Err(e @ MigrateError::Connectivity { .. }) => Err(e),
            Err(e) => {
                let target = match database {
                    Some(db) => format!("{}/{}", endpoint.key(), db),
                    None => endpoint.key(),
                };
                Err(MigrateError::connectivity(target, e.to_string()))
            }
        }
    }

    async fn replicate_roles(&self, run: &mut Run<'_>, databases: &[DatabaseInfo]) -> Result<usize> {
        let Some(permissions) = self.permissions.as_ref() else {
            return Ok(0);
        };
        run.used_permissions = true;

        let roles = permissions
            .extract_users_and_roles(run.op.source())
            .await?;
        let names: Vec<String> = databases.iter().map(|db| db.name.clone()).collect();
        run.permissions = permissions
            .extract_database_permissions(run.op.source(), &names)
            .await?;

        let script = permissions.generate_create_script(&roles)?;
        let summary = permissions
            .apply_users_and_roles(run.op.target(), &script)
            .await?;

        run.state.metrics.roles_applied = summary.applied;
        run.state.metrics.role_failures = summary.failures.len();
        report_statement_failures(run, "role", &summary.failures, script.len());
        Ok(summary.applied)
    }

    async fn export(
        &self,
        run: &mut Run<'_>,
        databases: &[DatabaseInfo],
    ) -> Result<Vec<ExportedDatabase>> {
        let work_dir = run.op.options().work_dir.clone();
        tokio::fs::create_dir_all(&work_dir).await?;
        let opts = ExportOptions {
            work_dir,
            file_prefix: format!("{}-{}", run.op.run().batch_id, run.op.id()),
        };

        let mut exported = Vec::with_capacity(databases.len());
        let mut bytes_done = 0u64;
        for db in databases {
            run.progress.update(
                0,
                &format!("exporting {} ({})", db.name, format_bytes(db.size_bytes)),
                Some(bytes_done),
            );
            let output = self
                .exporter
                .export_database(run.op.source(), &db.name, &opts)
                .await
                .map_err(|e| as_transfer(&db.name, e))?;
            run.artifacts.push(output.backup_file.clone());

            bytes_done += output.bytes;
            run.state.metrics.databases_exported += 1;
            run.state.metrics.bytes_exported = bytes_done;
            exported.push(ExportedDatabase {
                source_name: db.name.clone(),
                target_name: run.op.target_database_name(&db.name),
                size_bytes: db.size_bytes,
                backup_file: output.backup_file,
            });
        }
        Ok(exported)
    }

    async fn import(
        &self,
        run: &mut Run<'_>,
        exported: &[ExportedDatabase],
    ) -> Result<Vec<MigratedDatabase>> {
        let mut migrated = Vec::with_capacity(exported.len());
        for db in exported {
            run.progress.update(
                0,
                &format!("importing {} into {}", db.source_name, db.target_name),
                None,
            );
            let opts = ImportOptions {
                source_database: db.source_name.clone(),
                create_if_missing: true,
            };
            self.importer
                .import_database(run.op.target(), &db.target_name, &db.backup_file, &opts)
                .await
                .map_err(|e| as_transfer(&db.target_name, e))?;

            run.state.metrics.databases_imported += 1;
            migrated.push(MigratedDatabase {
                source_name: db.source_name.clone(),
                target_name: db.target_name.clone(),
                size_bytes: db.size_bytes,
            });
        }
        Ok(migrated)
    }

    async fn apply_permissions(
        &self,
        run: &mut Run<'_>,
        migrated: &[MigratedDatabase],
    ) -> Result<usize> {
        let Some(permissions) = self.permissions.as_ref() else {
            return Ok(0);
        };
        let renames: Vec<(String, String)> = migrated
            .iter()
            .map(|db| (db.source_name.clone(), db.target_name.clone()))
            .collect();
        let script = permissions.generate_permissions_script(&run.permissions, &renames)?;
        let summary = permissions
            .apply_permissions(run.op.target(), &script)
            .await?;

        run.state.metrics.permissions_applied = summary.applied;
        run.state.metrics.permission_failures = summary.failures.len();
        report_statement_failures(run, "permission", &summary.failures, script.len());
        Ok(summary.applied)
    }

    async fn post_validate(&self, run: &mut Run<'_>, migrated: &[MigratedDatabase]) -> Result<()> {
        for db in migrated {
            self.reach(run.op.target(), Some(&db.target_name)).await?;
        }
        Ok(())
    }

    /// Release connections, delete backups and drop permission temp state.
    ///
    /// Failures here are logged and swallowed.
    async fn cleanup(&self, run: &mut Run<'_>) {
        run.progress.start_phase(Phase::Cleanup.name(), 1);
        let mut problems = 0usize;

        for endpoint in [run.op.source(), run.op.target()] {
            if let Err(e) = self.connections.release(endpoint).await {
                warn!("{}: failed to release connections for {}: {}", run.op.id(), endpoint, e);
                problems += 1;
            }
        }

        for file in run.artifacts.drain(..) {
            match tokio::fs::remove_file(&file).await {
                Ok(()) => debug!("removed {}", file.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("{}: failed to remove {}: {}", run.op.id(), file.display(), e);
                    problems += 1;
                }
            }
        }

        if run.used_permissions {
            if let Some(permissions) = self.permissions.as_ref() {
                if let Err(e) = permissions.cleanup().await {
                    warn!("{}: permissions cleanup failed: {}", run.op.id(), e);
                    problems += 1;
                }
            }
        }

        run.progress.update(1, "complete", None);
        if problems == 0 {
            run.progress.complete_phase("cleanup complete");
        } else {
            run.progress
                .complete_phase(&format!("cleanup finished with {} warning(s)", problems));
        }
    }
}

/// Attribute a collaborator error to one database.
/// Warn about statements that could not be applied. Never fails the task.
fn report_statement_failures(run: &Run<'_>, kind: &str, failures: &[StatementFailure], total: usize) {
    if failures.is_empty() {
        return;
    }
    for failure in failures {
        let err = MigrateError::PermissionApply {
            statement: failure.statement.clone(),
            message: failure.message.clone(),
        };
        warn!("{}: {} statement skipped: {}", run.op.id(), kind, err);
    }
    run.progress.status(
        &format!("{} of {} {} statement(s) failed", failures.len(), total, kind),
        StatusLevel::Warn,
    );
}

fn as_transfer(database: &str, err: MigrateError) -> MigrateError {
    match err {
        e @ MigrateError::Transfer { .. } => e,
        e => MigrateError::transfer(database, e.to_string()),
    }
}
