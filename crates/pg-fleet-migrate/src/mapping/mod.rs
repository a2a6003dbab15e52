//! Declarative migration mappings and the planner that expands them into tasks.
//!
//! A [`Mapping`] describes which source instances migrate to which targets,
//! under which [`Strategy`] and [`ConflictResolution`] policy. It is built
//! once per batch from a [`MappingSpec`] (the raw YAML shape) and never
//! mutated afterwards; `with_*` builders consume and return a new value so
//! derived variants are produced by cloning.
//!
//! - [`planner`]: `Mapping::generate_execution_plan`
//! - [`validation`]: `Mapping::validate`
//! - [`conflict`]: database-name collision handling

pub mod conflict;
pub mod planner;
pub mod validation;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

use crate::core::{DatabaseSelection, Endpoint};
use crate::error::{MigrateError, Result};

pub use conflict::{resolve_database_conflicts, DatabaseEntry, ResolvedDatabase};
pub use validation::MappingValidation;

/// Naming policy for database-name collisions when several sources feed one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictResolution {
    /// Abort on the first collision.
    #[default]
    Fail,
    /// Rename every colliding database to `{sourceInstance}_{name}`.
    Prefix,
    /// Keep the first name, number the rest `{name}_2`, `{name}_3`, ...
    Suffix,
    /// Keep one logical database fed by every contributing source.
    Merge,
}

impl fmt::Display for ConflictResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConflictResolution::Fail => "fail",
            ConflictResolution::Prefix => "prefix",
            ConflictResolution::Suffix => "suffix",
            ConflictResolution::Merge => "merge",
        };
        f.write_str(s)
    }
}

/// Topology of a mapping, derived from distinct endpoint counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MappingType {
    #[serde(rename = "1:1")]
    OneToOne,
    #[serde(rename = "N:1")]
    ManyToOne,
    #[serde(rename = "1:N")]
    OneToMany,
    #[serde(rename = "N:N")]
    ManyToMany,
}

impl MappingType {
    /// Classify by the number of distinct source and target endpoints.
    pub fn from_counts(sources: usize, targets: usize) -> Self {
        match (sources > 1, targets > 1) {
            (true, true) => MappingType::ManyToMany,
            (true, false) => MappingType::ManyToOne,
            (false, true) => MappingType::OneToMany,
            (false, false) => MappingType::OneToOne,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MappingType::OneToOne => "1:1",
            MappingType::ManyToOne => "N:1",
            MappingType::OneToMany => "1:N",
            MappingType::ManyToMany => "N:N",
        }
    }
}

impl fmt::Display for MappingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sources sharing one engine version, all routed to one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionGroup {
    #[serde(default)]
    pub sources: Vec<Endpoint>,
    pub target: Endpoint,
}

/// One explicit entry of a custom mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomMigration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Endpoint>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<Endpoint>,
    pub target: Endpoint,
    /// Overrides the mapping-wide database selection for this entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub databases: Option<DatabaseSelection>,
}

impl CustomMigration {
    /// Sources of this entry: `sources` when present, otherwise the single `source`.
    pub fn source_endpoints(&self) -> Vec<&Endpoint> {
        if !self.sources.is_empty() {
            self.sources.iter().collect()
        } else {
            self.source.iter().collect()
        }
    }
}

/// Planning strategy, with the data each variant plans from.
#[derive(Debug, Clone, PartialEq)]
pub enum Strategy {
    /// One target takes every source; otherwise sources and targets zip by index.
    Simple {
        sources: Vec<Endpoint>,
        targets: Vec<Endpoint>,
    },
    /// Every source goes to the first target.
    Consolidate {
        sources: Vec<Endpoint>,
        targets: Vec<Endpoint>,
    },
    /// One task per source of each version group.
    VersionBased {
        version_mapping: BTreeMap<String, VersionGroup>,
    },
    /// Explicit source/target entries.
    CustomMapping { migrations: Vec<CustomMigration> },
}

impl Strategy {
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::Simple { .. } => "simple",
            Strategy::Consolidate { .. } => "consolidate",
            Strategy::VersionBased { .. } => "version-based",
            Strategy::CustomMapping { .. } => "custom-mapping",
        }
    }

    /// Every source endpoint mentioned by the strategy, in declaration order.
    pub fn source_endpoints(&self) -> Vec<&Endpoint> {
        match self {
            Strategy::Simple { sources, .. } | Strategy::Consolidate { sources, .. } => {
                sources.iter().collect()
            }
            Strategy::VersionBased { version_mapping } => version_mapping
                .values()
                .flat_map(|g| g.sources.iter())
                .collect(),
            Strategy::CustomMapping { migrations } => migrations
                .iter()
                .flat_map(|m| m.source_endpoints())
                .collect(),
        }
    }

    /// Every target endpoint mentioned by the strategy, in declaration order.
    pub fn target_endpoints(&self) -> Vec<&Endpoint> {
        match self {
            Strategy::Simple { targets, .. } | Strategy::Consolidate { targets, .. } => {
                targets.iter().collect()
            }
            Strategy::VersionBased { version_mapping } => {
                version_mapping.values().map(|g| &g.target).collect()
            }
            Strategy::CustomMapping { migrations } => {
                migrations.iter().map(|m| &m.target).collect()
            }
        }
    }
}

/// Batch execution knobs carried by a mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOptions {
    /// Maximum tasks in flight at once (default: 3).
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Stop admitting tasks after the first failure.
    #[serde(default)]
    pub stop_on_error: bool,

    /// Run one sequential retry pass over failed tasks.
    #[serde(default)]
    pub retry_failed: bool,

    /// Replicate roles and database grants.
    #[serde(default)]
    pub include_users: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            stop_on_error: false,
            retry_failed: false,
            include_users: false,
        }
    }
}

fn default_max_parallel() -> usize {
    3
}

/// Derived topology summary. Recomputed whenever the strategy changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MappingMetadata {
    pub mapping_type: MappingType,
    pub total_sources: usize,
    pub total_targets: usize,
}

impl MappingMetadata {
    fn compute(strategy: &Strategy) -> Self {
        let total_sources = distinct(strategy.source_endpoints());
        let total_targets = distinct(strategy.target_endpoints());
        Self {
            mapping_type: MappingType::from_counts(total_sources, total_targets),
            total_sources,
            total_targets,
        }
    }
}

fn distinct(endpoints: Vec<&Endpoint>) -> usize {
    endpoints
        .into_iter()
        .map(|e| e.key())
        .collect::<HashSet<_>>()
        .len()
}

/// A validated-shape, immutable migration intent.
#[derive(Debug, Clone, PartialEq)]
pub struct Mapping {
    strategy: Strategy,
    conflict_resolution: ConflictResolution,
    databases: DatabaseSelection,
    options: BatchOptions,
    metadata: MappingMetadata,
}

impl Mapping {
    /// Create a mapping with default policy and options.
    pub fn new(strategy: Strategy) -> Self {
        let metadata = MappingMetadata::compute(&strategy);
        Self {
            strategy,
            conflict_resolution: ConflictResolution::default(),
            databases: DatabaseSelection::default(),
            options: BatchOptions::default(),
            metadata,
        }
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.metadata = MappingMetadata::compute(&strategy);
        self.strategy = strategy;
        self
    }

    pub fn with_conflict_resolution(mut self, policy: ConflictResolution) -> Self {
        self.conflict_resolution = policy;
        self
    }

    pub fn with_databases(mut self, databases: DatabaseSelection) -> Self {
        self.databases = databases;
        self
    }

    pub fn with_options(mut self, options: BatchOptions) -> Self {
        self.options = options;
        self
    }

    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    pub fn conflict_resolution(&self) -> ConflictResolution {
        self.conflict_resolution
    }

    pub fn databases(&self) -> &DatabaseSelection {
        &self.databases
    }

    pub fn options(&self) -> &BatchOptions {
        &self.options
    }

    pub fn metadata(&self) -> MappingMetadata {
        self.metadata
    }

    pub fn mapping_type(&self) -> MappingType {
        self.metadata.mapping_type
    }

    /// Resolve database-name collisions with this mapping's policy.
    pub fn resolve_database_conflicts(
        &self,
        entries: &[DatabaseEntry],
    ) -> Result<Vec<ResolvedDatabase>> {
        resolve_database_conflicts(entries, self.conflict_resolution)
    }
}

/// One concrete source-to-target unit of work, produced by the planner.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationTask {
    pub(crate) source: Endpoint,
    pub(crate) target: Endpoint,
    pub(crate) databases: DatabaseSelection,
    pub(crate) conflict_resolution: ConflictResolution,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) prefix_with: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) version: Option<String>,
}

impl MigrationTask {
    pub fn source(&self) -> &Endpoint {
        &self.source
    }

    pub fn target(&self) -> &Endpoint {
        &self.target
    }

    pub fn databases(&self) -> &DatabaseSelection {
        &self.databases
    }

    pub fn conflict_resolution(&self) -> ConflictResolution {
        self.conflict_resolution
    }

    pub fn prefix_with(&self) -> Option<&str> {
        self.prefix_with.as_deref()
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// `src -> tgt` path used for duplicate detection and display.
    pub fn path(&self) -> String {
        format!("{} -> {}", self.source.key(), self.target.key())
    }
}

/// Raw mapping as written in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingSpec {
    pub strategy: String,

    #[serde(default)]
    pub conflict_resolution: ConflictResolution,

    #[serde(default)]
    pub databases: DatabaseSelection,

    #[serde(default)]
    pub sources: Vec<Endpoint>,

    #[serde(default)]
    pub targets: Vec<Endpoint>,

    #[serde(default)]
    pub version_mapping: BTreeMap<String, VersionGroup>,

    #[serde(default)]
    pub migrations: Vec<CustomMigration>,

    #[serde(default)]
    pub options: BatchOptions,
}

impl TryFrom<MappingSpec> for Mapping {
    type Error = MigrateError;

    fn try_from(spec: MappingSpec) -> Result<Self> {
        let strategy = match spec.strategy.trim().to_lowercase().replace('_', "-").as_str() {
            "simple" => Strategy::Simple {
                sources: spec.sources,
                targets: spec.targets,
            },
            "consolidate" => Strategy::Consolidate {
                sources: spec.sources,
                targets: spec.targets,
            },
            "version-based" => Strategy::VersionBased {
                version_mapping: spec.version_mapping,
            },
            "custom-mapping" => Strategy::CustomMapping {
                migrations: spec.migrations,
            },
            _ => {
                return Err(MigrateError::Config(format!(
                    "Unknown mapping strategy '{}'. Valid values: simple, consolidate, version-based, custom-mapping",
                    spec.strategy
                )))
            }
        };

        Ok(Mapping::new(strategy)
            .with_conflict_resolution(spec.conflict_resolution)
            .with_databases(spec.databases)
            .with_options(spec.options))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn ep(project: &str, instance: &str) -> Endpoint {
        Endpoint::new(project, instance).with_credentials("postgres", "secret")
    }

    #[test]
    fn test_mapping_type_from_counts() {
        assert_eq!(MappingType::from_counts(1, 1), MappingType::OneToOne);
        assert_eq!(MappingType::from_counts(3, 1), MappingType::ManyToOne);
        assert_eq!(MappingType::from_counts(1, 2), MappingType::OneToMany);
        assert_eq!(MappingType::from_counts(2, 2), MappingType::ManyToMany);
        assert_eq!(MappingType::from_counts(0, 0), MappingType::OneToOne);
    }

    #[test]
    fn test_mapping_type_counts_distinct_endpoints() {
        // Same instance listed twice is one endpoint.
        let mapping = Mapping::new(Strategy::Simple {
            sources: vec![ep("p", "a"), ep("p", "a")],
            targets: vec![ep("p", "t")],
        });
        assert_eq!(mapping.mapping_type(), MappingType::OneToOne);
        assert_eq!(mapping.metadata().total_sources, 1);
    }

    #[test]
    fn test_mapping_type_recomputed_on_strategy_change() {
        let mapping = Mapping::new(Strategy::Simple {
            sources: vec![ep("p", "a")],
            targets: vec![ep("p", "t")],
        });
        assert_eq!(mapping.mapping_type(), MappingType::OneToOne);

        let derived = mapping.clone().with_strategy(Strategy::Consolidate {
            sources: vec![ep("p", "a"), ep("p", "b")],
            targets: vec![ep("p", "t")],
        });
        assert_eq!(derived.mapping_type(), MappingType::ManyToOne);
        // Original is untouched.
        assert_eq!(mapping.mapping_type(), MappingType::OneToOne);
    }

    #[test]
    fn test_version_based_mapping_type() {
        let mut version_mapping = BTreeMap::new();
        version_mapping.insert(
            "14".to_string(),
            VersionGroup {
                sources: vec![ep("p", "a"), ep("p", "b")],
                target: ep("p", "t14"),
            },
        );
        version_mapping.insert(
            "15".to_string(),
            VersionGroup {
                sources: vec![ep("p", "c")],
                target: ep("p", "t15"),
            },
        );
        let mapping = Mapping::new(Strategy::VersionBased { version_mapping });
        assert_eq!(mapping.mapping_type(), MappingType::ManyToMany);
        assert_eq!(mapping.metadata().total_sources, 3);
        assert_eq!(mapping.metadata().total_targets, 2);
    }

    #[test]
    fn test_spec_from_yaml() {
        let yaml = r#"
strategy: consolidate
conflict_resolution: prefix
databases: [app]
sources:
  - { project: p, instance: a, password: x, ip: 10.0.0.1 }
  - { project: p, instance: b }
targets:
  - { project: p, instance: t }
options:
  max_parallel: 2
  stop_on_error: true
"#;
        let spec: MappingSpec = serde_yaml::from_str(yaml).unwrap();
        let mapping = Mapping::try_from(spec).unwrap();
        assert_eq!(mapping.strategy().name(), "consolidate");
        assert_eq!(mapping.conflict_resolution(), ConflictResolution::Prefix);
        assert_eq!(mapping.mapping_type(), MappingType::ManyToOne);
        assert_eq!(mapping.options().max_parallel, 2);
        assert!(mapping.options().stop_on_error);
        assert!(!mapping.options().retry_failed);
        assert_eq!(
            mapping.databases(),
            &DatabaseSelection::Only(vec!["app".to_string()])
        );
    }

    #[test]
    fn test_unknown_strategy_is_config_error() {
        let spec: MappingSpec = serde_yaml::from_str("strategy: round-robin").unwrap();
        let err = Mapping::try_from(spec).unwrap_err();
        assert!(matches!(err, MigrateError::Config(_)));
        assert!(err.to_string().contains("round-robin"));
    }

    #[test]
    fn test_strategy_aliases() {
        let spec: MappingSpec = serde_yaml::from_str("strategy: version_based").unwrap();
        let mapping = Mapping::try_from(spec).unwrap();
        assert_eq!(mapping.strategy().name(), "version-based");
    }

    #[test]
    fn test_unknown_conflict_policy_rejected() {
        let result: std::result::Result<MappingSpec, _> =
            serde_yaml::from_str("strategy: simple\nconflict_resolution: overwrite");
        assert!(result.is_err());
    }
}
