//! In-memory collaborators for unit tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::core::{
    ApplySummary, ConnectionProvider, DatabaseGrant, DatabaseInfo, DatabasePermissions, Endpoint,
    ExportOptions, ExportOutput, ExportPrimitive, ImportOptions, ImportPrimitive,
    PermissionsCollaborator, ProgressSink, RoleDefinition, StatementFailure, StatusLevel,
};
use crate::error::{MigrateError, Result};

/// Connection provider backed by a fixed database listing per endpoint key.
#[derive(Default)]
pub struct FakeConnections {
    pub databases: HashMap<String, Vec<DatabaseInfo>>,
    /// Endpoint keys, or `key/database`, that refuse connections.
    pub unreachable: HashSet<String>,
    pub fail_release: bool,
    pub released: Mutex<Vec<String>>,
    pub checked: Mutex<Vec<String>>,
    pub closed: AtomicBool,
}

impl FakeConnections {
    pub fn with_databases(mut self, endpoint: &Endpoint, dbs: &[(&str, u64)]) -> Self {
        self.databases.insert(
            endpoint.key(),
            dbs.iter()
                .map(|(name, size)| DatabaseInfo::new(*name, *size))
                .collect(),
        );
        self
    }

    pub fn unreachable(mut self, target: impl Into<String>) -> Self {
        self.unreachable.insert(target.into());
        self
    }
}

#[async_trait]
impl ConnectionProvider for FakeConnections {
    async fn list_databases(&self, endpoint: &Endpoint, _is_source: bool) -> Result<Vec<DatabaseInfo>> {
        Ok(self.databases.get(&endpoint.key()).cloned().unwrap_or_default())
    }

    async fn test_connection(&self, endpoint: &Endpoint, database: Option<&str>) -> Result<()> {
        let target = match database {
            Some(db) => format!("{}/{}", endpoint.key(), db),
            None => endpoint.key(),
        };
        self.checked.lock().push(target.clone());
        if self.unreachable.contains(&target) {
            return Err(MigrateError::connectivity(target, "connection refused"));
        }
        Ok(())
    }

    async fn release(&self, endpoint: &Endpoint) -> Result<()> {
        self.released.lock().push(endpoint.key());
        if self.fail_release {
            return Err(MigrateError::pool("release failed", endpoint.key()));
        }
        Ok(())
    }

    async fn close_all_connections(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Export and import primitive that writes small files into the work dir.
#[derive(Default)]
pub struct FakeDump {
    pub fail_export: HashSet<String>,
    pub fail_import: HashSet<String>,
    pub exported: Mutex<Vec<String>>,
    /// `(target database, source database)` per import.
    pub imported: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl ExportPrimitive for FakeDump {
    async fn export_database(
        &self,
        _endpoint: &Endpoint,
        database: &str,
        opts: &ExportOptions,
    ) -> Result<ExportOutput> {
        if self.fail_export.contains(database) {
            return Err(MigrateError::transfer(database, "pg_dump exited with status 1"));
        }
        let backup_file = opts
            .work_dir
            .join(format!("{}-{}.dump", opts.file_prefix, database));
        tokio::fs::write(&backup_file, b"dump").await?;
        self.exported.lock().push(database.to_string());
        Ok(ExportOutput {
            backup_file,
            bytes: 4,
        })
    }
}

#[async_trait]
impl ImportPrimitive for FakeDump {
    async fn import_database(
        &self,
        _endpoint: &Endpoint,
        database: &str,
        backup_file: &Path,
        opts: &ImportOptions,
    ) -> Result<()> {
        if !backup_file.exists() {
            return Err(MigrateError::transfer(database, "backup file missing"));
        }
        if self.fail_import.contains(database) {
            return Err(MigrateError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "pg_restore crashed",
            )));
        }
        self.imported
            .lock()
            .push((database.to_string(), opts.source_database.clone()));
        Ok(())
    }
}

/// Permissions collaborator with canned roles and statement failures.
#[derive(Default)]
pub struct FakePermissions {
    pub roles: Vec<RoleDefinition>,
    /// Statements containing any of these fragments fail.
    pub failing: Vec<String>,
    pub fail_cleanup: bool,
    pub applied: Mutex<Vec<String>>,
    pub cleanups: AtomicUsize,
}

impl FakePermissions {
    pub fn with_role(mut self, name: &str) -> Self {
        self.roles.push(RoleDefinition {
            name: name.to_string(),
            can_login: true,
            create_db: false,
            create_role: false,
            inherit: true,
            member_of: vec![],
        });
        self
    }

    fn apply(&self, script: &[String]) -> ApplySummary {
        let mut summary = ApplySummary::default();
        for statement in script {
            if self.failing.iter().any(|f| statement.contains(f.as_str())) {
                summary.failures.push(StatementFailure {
                    statement: statement.clone(),
                    message: "role does not exist".to_string(),
                });
            } else {
                self.applied.lock().push(statement.clone());
                summary.applied += 1;
            }
        }
        summary
    }
}

#[async_trait]
impl PermissionsCollaborator for FakePermissions {
    async fn extract_users_and_roles(&self, _source: &Endpoint) -> Result<Vec<RoleDefinition>> {
        Ok(self.roles.clone())
    }

    async fn extract_database_permissions(
        &self,
        _source: &Endpoint,
        databases: &[String],
    ) -> Result<Vec<DatabasePermissions>> {
        Ok(databases
            .iter()
            .map(|db| DatabasePermissions {
                database: db.clone(),
                owner: "app_owner".to_string(),
                grants: vec![DatabaseGrant {
                    grantee: "reader".to_string(),
                    privileges: vec!["CONNECT".to_string()],
                }],
            })
            .collect())
    }

    fn generate_create_script(&self, roles: &[RoleDefinition]) -> Result<Vec<String>> {
        Ok(roles
            .iter()
            .map(|r| format!("CREATE ROLE \"{}\"", r.name))
            .collect())
    }

    async fn apply_users_and_roles(
        &self,
        _target: &Endpoint,
        script: &[String],
    ) -> Result<ApplySummary> {
        Ok(self.apply(script))
    }

    fn generate_permissions_script(
        &self,
        permissions: &[DatabasePermissions],
        renames: &[(String, String)],
    ) -> Result<Vec<String>> {
        let mut script = Vec::new();
        for perms in permissions {
            let name = renames
                .iter()
                .find(|(src, _)| *src == perms.database)
                .map(|(_, tgt)| tgt.as_str())
                .unwrap_or(perms.database.as_str());
            script.push(format!("ALTER DATABASE \"{}\" OWNER TO \"{}\"", name, perms.owner));
        }
        Ok(script)
    }

    async fn apply_permissions(&self, _target: &Endpoint, script: &[String]) -> Result<ApplySummary> {
        Ok(self.apply(script))
    }

    async fn cleanup(&self) -> Result<()> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        if self.fail_cleanup {
            return Err(MigrateError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "cannot remove temp files",
            )));
        }
        Ok(())
    }
}

/// One recorded progress event.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Start(String, u64),
    Update(u64, String),
    Complete(String),
    Status(String, StatusLevel),
}

/// Progress sink that records every event.
#[derive(Default)]
pub struct RecordingProgress {
    pub events: Mutex<Vec<Event>>,
}

impl RecordingProgress {
    pub fn phases_started(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::Start(name, _) => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn statuses(&self, level: StatusLevel) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::Status(msg, l) if *l == level => Some(msg.clone()),
                _ => None,
            })
            .collect()
    }
}

impl ProgressSink for RecordingProgress {
    fn start_phase(&self, name: &str, total: u64) {
        self.events.lock().push(Event::Start(name.to_string(), total));
    }

    fn update(&self, current: u64, status: &str, _bytes: Option<u64>) {
        self.events
            .lock()
            .push(Event::Update(current, status.to_string()));
    }

    fn complete_phase(&self, summary: &str) {
        self.events.lock().push(Event::Complete(summary.to_string()));
    }

    fn status(&self, message: &str, level: StatusLevel) {
        self.events
            .lock()
            .push(Event::Status(message.to_string(), level));
    }
}

/// Scratch work directory for a test.
pub fn work_dir() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().to_path_buf();
    (dir, path)
}
