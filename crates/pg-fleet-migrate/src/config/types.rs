//! Configuration type definitions.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::mapping::MappingSpec;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Migration intent: strategy, endpoints, conflict policy and batch options.
    pub mapping: MappingSpec,

    /// Connection settings shared by every endpoint.
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// External dump/restore tools.
    #[serde(default)]
    pub tools: ToolsConfig,
}

/// Connection settings applied to every instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// PostgreSQL port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    /// SSL mode: disable, require, verify-ca, verify-full (default: "disable").
    #[serde(default = "default_ssl_mode")]
    pub ssl_mode: String,

    /// Connect timeout in seconds (default: 10).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Pool size per endpoint and database (default: 4).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            port: default_pg_port(),
            ssl_mode: default_ssl_mode(),
            connect_timeout_secs: default_connect_timeout(),
            max_connections: default_max_connections(),
        }
    }
}

/// Dump and restore tool settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Path to `pg_dump` (default: "pg_dump" on PATH).
    #[serde(default = "default_pg_dump")]
    pub pg_dump: String,

    /// Path to `pg_restore` (default: "pg_restore" on PATH).
    #[serde(default = "default_pg_restore")]
    pub pg_restore: String,

    /// Directory for backup files (default: system temp dir).
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,

    /// Parallel jobs passed to `pg_restore --jobs` (default: 1).
    #[serde(default = "default_jobs")]
    pub jobs: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            pg_dump: default_pg_dump(),
            pg_restore: default_pg_restore(),
            temp_dir: None,
            jobs: default_jobs(),
        }
    }
}

impl ToolsConfig {
    /// Directory that receives batch work directories.
    pub fn work_dir(&self) -> PathBuf {
        self.temp_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("pg-fleet-migrate"))
    }
}

fn default_pg_port() -> u16 {
    5432
}

fn default_ssl_mode() -> String {
    "disable".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_max_connections() -> usize {
    4
}

fn default_pg_dump() -> String {
    "pg_dump".to_string()
}

fn default_pg_restore() -> String {
    "pg_restore".to_string()
}

fn default_jobs() -> usize {
    1
}
