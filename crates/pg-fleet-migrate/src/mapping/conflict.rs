//! Database-name collision handling for several sources feeding one target.

use serde::Serialize;
use std::collections::HashMap;

use super::ConflictResolution;
use crate::error::{MigrateError, Result};

/// A database name contributed by one source instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseEntry {
    pub name: String,
    pub source: String,
}

impl DatabaseEntry {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
        }
    }
}

/// A database after conflict resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedDatabase {
    /// Name on the source.
    pub original_name: String,
    /// Name on the target.
    pub name: String,
    /// First (or only) contributing source.
    pub source: String,
    /// Every contributing source; more than one only under `merge`.
    pub sources: Vec<String>,
}

impl ResolvedDatabase {
    fn passthrough(entry: &DatabaseEntry) -> Self {
        Self::renamed(entry, entry.name.clone())
    }

    fn renamed(entry: &DatabaseEntry, name: String) -> Self {
        Self {
            original_name: entry.name.clone(),
            name,
            source: entry.source.clone(),
            sources: vec![entry.source.clone()],
        }
    }
}

/// Resolve name collisions in encounter order.
///
/// Names seen once pass through unchanged under every policy.
pub fn resolve_database_conflicts(
    entries: &[DatabaseEntry],
    policy: ConflictResolution,
) -> Result<Vec<ResolvedDatabase>> {
    let mut occurrences: HashMap<&str, Vec<&DatabaseEntry>> = HashMap::new();
    for entry in entries {
        occurrences.entry(entry.name.as_str()).or_default().push(entry);
    }

    let mut resolved = Vec::with_capacity(entries.len());
    let mut seen: HashMap<&str, usize> = HashMap::new();

    for entry in entries {
        let group = &occurrences[entry.name.as_str()];
        let nth = seen.entry(entry.name.as_str()).or_insert(0);
        *nth += 1;

        if group.len() == 1 {
            resolved.push(ResolvedDatabase::passthrough(entry));
            continue;
        }

        match policy {
            ConflictResolution::Fail => {
                return Err(MigrateError::Conflict {
                    database: entry.name.clone(),
                    sources: group.iter().map(|e| e.source.clone()).collect(),
                });
            }
            ConflictResolution::Prefix => {
                let name = format!("{}_{}", entry.source, entry.name);
                resolved.push(ResolvedDatabase::renamed(entry, name));
            }
            ConflictResolution::Suffix => {
                if *nth == 1 {
                    resolved.push(ResolvedDatabase::passthrough(entry));
                } else {
                    let name = format!("{}_{}", entry.name, nth);
                    resolved.push(ResolvedDatabase::renamed(entry, name));
                }
            }
            ConflictResolution::Merge => {
                if *nth == 1 {
                    let mut merged = ResolvedDatabase::passthrough(entry);
                    merged.sources = group.iter().map(|e| e.source.clone()).collect();
                    resolved.push(merged);
                }
            }
        }
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users_from_two_sources() -> Vec<DatabaseEntry> {
        vec![
            DatabaseEntry::new("users", "inst1"),
            DatabaseEntry::new("orders", "inst1"),
            DatabaseEntry::new("users", "inst2"),
        ]
    }

    fn names(resolved: &[ResolvedDatabase]) -> Vec<&str> {
        resolved.iter().map(|r| r.name.as_str()).collect()
    }

    #[test]
    fn test_no_collision_passthrough() {
        let entries = vec![
            DatabaseEntry::new("a", "inst1"),
            DatabaseEntry::new("b", "inst2"),
        ];
        for policy in [
            ConflictResolution::Fail,
            ConflictResolution::Prefix,
            ConflictResolution::Suffix,
            ConflictResolution::Merge,
        ] {
            let resolved = resolve_database_conflicts(&entries, policy).unwrap();
            assert_eq!(names(&resolved), vec!["a", "b"]);
        }
    }

    #[test]
    fn test_prefix() {
        let resolved =
            resolve_database_conflicts(&users_from_two_sources(), ConflictResolution::Prefix)
                .unwrap();
        assert_eq!(names(&resolved), vec!["inst1_users", "orders", "inst2_users"]);
        assert_eq!(resolved[2].original_name, "users");
    }

    #[test]
    fn test_suffix() {
        let mut entries = users_from_two_sources();
        entries.push(DatabaseEntry::new("users", "inst3"));
        let resolved = resolve_database_conflicts(&entries, ConflictResolution::Suffix).unwrap();
        assert_eq!(names(&resolved), vec!["users", "orders", "users_2", "users_3"]);
        assert_eq!(resolved[2].source, "inst2");
    }

    #[test]
    fn test_merge() {
        let resolved =
            resolve_database_conflicts(&users_from_two_sources(), ConflictResolution::Merge)
                .unwrap();
        assert_eq!(names(&resolved), vec!["users", "orders"]);
        assert_eq!(resolved[0].sources, vec!["inst1", "inst2"]);
        assert_eq!(resolved[1].sources, vec!["inst1"]);
    }

    #[test]
    fn test_fail_names_database() {
        let err = resolve_database_conflicts(&users_from_two_sources(), ConflictResolution::Fail)
            .unwrap_err();
        match err {
            MigrateError::Conflict { database, sources } => {
                assert_eq!(database, "users");
                assert_eq!(sources, vec!["inst1", "inst2"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
