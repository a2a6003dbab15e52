//! Endpoint and database selection types shared by every component.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Databases that exist on every PostgreSQL instance and are never migrated.
pub const SYSTEM_DATABASES: &[&str] = &["postgres", "template0", "template1"];

/// Check whether a database name is a built-in system database.
pub fn is_system_database(name: &str) -> bool {
    SYSTEM_DATABASES.contains(&name)
}

/// A managed PostgreSQL instance plus the credentials used to reach it.
///
/// Identity is `project:instance`; credentials and address do not
/// participate in it.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Endpoint {
    /// Cloud project the instance belongs to.
    #[serde(default)]
    pub project: String,

    /// Instance name.
    #[serde(default)]
    pub instance: String,

    /// Login role (default: "postgres").
    #[serde(default = "default_user")]
    pub user: String,

    /// Password. Never serialized.
    #[serde(default, skip_serializing)]
    pub password: String,

    /// Reachable address of the instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

impl Endpoint {
    /// Create an endpoint with default credentials.
    pub fn new(project: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            instance: instance.into(),
            user: default_user(),
            password: String::new(),
            ip: None,
        }
    }

    /// Set login credentials.
    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }

    /// Set the instance address.
    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    /// Identity key: `project:instance`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.project, self.instance)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.project, self.instance)
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("project", &self.project)
            .field("instance", &self.instance)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("ip", &self.ip)
            .finish()
    }
}

/// Which databases a task migrates.
///
/// Serialized as the string `"all"` or as a list of names.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DatabaseSelection {
    /// Every non-system database on the source.
    #[default]
    All,
    /// Only the listed databases.
    Only(Vec<String>),
}

impl DatabaseSelection {
    /// Whether discovery should keep every database.
    pub fn includes_all(&self) -> bool {
        matches!(self, DatabaseSelection::All)
    }

    /// Check whether a database name is selected.
    pub fn includes(&self, name: &str) -> bool {
        match self {
            DatabaseSelection::All => true,
            DatabaseSelection::Only(names) => names.iter().any(|n| n == name),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawSelection {
    Keyword(String),
    List(Vec<String>),
}

impl Serialize for DatabaseSelection {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            DatabaseSelection::All => RawSelection::Keyword("all".to_string()).serialize(serializer),
            DatabaseSelection::Only(names) => RawSelection::List(names.clone()).serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for DatabaseSelection {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match RawSelection::deserialize(deserializer)? {
            RawSelection::Keyword(k) if k.eq_ignore_ascii_case("all") => Ok(DatabaseSelection::All),
            RawSelection::Keyword(other) => Err(serde::de::Error::custom(format!(
                "databases must be \"all\" or a list of names, got {:?}",
                other
            ))),
            RawSelection::List(names) => Ok(DatabaseSelection::Only(names)),
        }
    }
}

/// A database found on an instance during discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    pub name: String,
    pub size_bytes: u64,
}

impl DatabaseInfo {
    pub fn new(name: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            name: name.into(),
            size_bytes,
        }
    }
}

fn default_user() -> String {
    "postgres".to_string()
}
