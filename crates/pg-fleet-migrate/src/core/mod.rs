//! Core types shared by the planner, orchestrator and execution engine.
//!
//! - [`endpoint`]: instance endpoints and database selection
//! - [`traits`]: collaborator contracts the engine drives
//! - [`identifier`]: identifier quoting for generated SQL

pub mod endpoint;
pub mod identifier;
pub mod traits;

pub use endpoint::{is_system_database, DatabaseInfo, DatabaseSelection, Endpoint, SYSTEM_DATABASES};
pub use traits::{
    ApplySummary, ConnectionProvider, DatabaseGrant, DatabasePermissions, ExportOptions,
    ExportOutput, ExportPrimitive, ImportOptions, ImportPrimitive, PermissionsCollaborator,
    ProgressSink, RoleDefinition, StatementFailure, StatusLevel,
};
