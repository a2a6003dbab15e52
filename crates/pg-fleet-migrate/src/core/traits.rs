//! Collaborator traits consumed by the execution engine.
//!
//! The engine never talks to a database or a dump tool directly. It drives
//! these abstractions instead:
//!
//! - [`ConnectionProvider`]: lists databases and checks reachability
//! - [`ExportPrimitive`] / [`ImportPrimitive`]: move one database at a time
//! - [`PermissionsCollaborator`]: optional role and grant replication
//! - [`ProgressSink`]: observational progress events
//!
//! Concrete PostgreSQL implementations live in `postgres`, `dump` and
//! `permissions`; tests substitute in-memory fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Result;

use super::endpoint::{DatabaseInfo, Endpoint};

/// Database listing and reachability checks.
///
/// # Thread Safety
///
/// One provider is shared by every concurrently running task.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    /// List databases on an instance with their on-disk size.
    async fn list_databases(&self, endpoint: &Endpoint, is_source: bool)
        -> Result<Vec<DatabaseInfo>>;

    /// Open (or reuse) a connection and run a trivial query.
    ///
    /// `database` of `None` means the instance's maintenance database.
    async fn test_connection(&self, endpoint: &Endpoint, database: Option<&str>) -> Result<()>;

    /// Release pooled connections held for one endpoint.
    async fn release(&self, endpoint: &Endpoint) -> Result<()>;

    /// Close every pooled connection.
    async fn close_all_connections(&self);
}

/// Options for a single database export.
#[derive(Debug, Clone)]
pub struct ExportOptions {
    /// Directory that receives the backup file.
    pub work_dir: PathBuf,
    /// File name prefix, unique per operation.
    pub file_prefix: String,
}

/// Output of a single database export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportOutput {
    pub backup_file: PathBuf,
    pub bytes: u64,
}

/// Options for a single database import.
#[derive(Debug, Clone)]
pub struct ImportOptions {
    /// Database name on the source the backup was taken from.
    pub source_database: String,
    /// Create the target database when it does not exist.
    pub create_if_missing: bool,
}

/// Dump one database to a local file.
#[async_trait]
pub trait ExportPrimitive: Send + Sync {
    async fn export_database(
        &self,
        endpoint: &Endpoint,
        database: &str,
        opts: &ExportOptions,
    ) -> Result<ExportOutput>;
}

/// Restore one database from a local file.
#[async_trait]
pub trait ImportPrimitive: Send + Sync {
    async fn import_database(
        &self,
        endpoint: &Endpoint,
        database: &str,
        backup_file: &Path,
        opts: &ImportOptions,
    ) -> Result<()>;
}

/// A login or group role read from the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleDefinition {
    pub name: String,
    pub can_login: bool,
    pub create_db: bool,
    pub create_role: bool,
    pub inherit: bool,
    /// Roles this role is a member of.
    #[serde(default)]
    pub member_of: Vec<String>,
}

/// A single `GRANT ... ON DATABASE` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseGrant {
    pub grantee: String,
    pub privileges: Vec<String>,
}

/// Ownership and grants for one database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabasePermissions {
    pub database: String,
    pub owner: String,
    pub grants: Vec<DatabaseGrant>,
}

/// One statement that failed while applying a script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementFailure {
    pub statement: String,
    pub message: String,
}

/// Outcome of applying a generated script statement by statement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplySummary {
    pub applied: usize,
    pub failures: Vec<StatementFailure>,
}

impl ApplySummary {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Role and permission replication.
///
/// Script generation is pure; extraction and application talk to the
/// instances. `apply_*` methods return `Err` only when the script could not
/// be run at all; individual statement failures are reported in the summary.
#[async_trait]
pub trait PermissionsCollaborator: Send + Sync {
    async fn extract_users_and_roles(&self, source: &Endpoint) -> Result<Vec<RoleDefinition>>;

    async fn extract_database_permissions(
        &self,
        source: &Endpoint,
        databases: &[String],
    ) -> Result<Vec<DatabasePermissions>>;

    fn generate_create_script(&self, roles: &[RoleDefinition]) -> Result<Vec<String>>;

    async fn apply_users_and_roles(&self, target: &Endpoint, script: &[String])
        -> Result<ApplySummary>;

    /// Build ownership and grant statements.
    ///
    /// `renames` maps source database names to their names on the target.
    fn generate_permissions_script(
        &self,
        permissions: &[DatabasePermissions],
        renames: &[(String, String)],
    ) -> Result<Vec<String>>;

    async fn apply_permissions(&self, target: &Endpoint, script: &[String])
        -> Result<ApplySummary>;

    async fn cleanup(&self) -> Result<()>;
}

/// Severity of a progress status message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusLevel {
    Info,
    Success,
    Warn,
    Error,
}

/// Observational progress events. Implementations must not influence control flow.
pub trait ProgressSink: Send + Sync {
    fn start_phase(&self, name: &str, total: u64);

    fn update(&self, current: u64, status: &str, bytes: Option<u64>);

    fn complete_phase(&self, summary: &str);

    fn status(&self, message: &str, level: StatusLevel);
}
