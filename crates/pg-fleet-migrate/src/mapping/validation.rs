//! Structural validation of a mapping.

use std::collections::HashSet;

use super::{ConflictResolution, Mapping, MappingType, Strategy};
use crate::core::Endpoint;
use crate::error::{MigrateError, Result};

/// Validation outcome: errors block execution, warnings do not.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MappingValidation {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl MappingValidation {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Turn errors into a single `Config` error listing every issue.
    ///
    /// Returns the warnings on success.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.errors.is_empty() {
            Ok(self.warnings)
        } else {
            Err(MigrateError::Config(format!(
                "Invalid mapping: {}",
                self.errors.join("; ")
            )))
        }
    }
}

impl Mapping {
    /// Check the mapping's structure and report likely misconfigurations.
    pub fn validate(&self) -> MappingValidation {
        let mut report = MappingValidation::default();

        match self.strategy() {
            Strategy::Simple { sources, targets } | Strategy::Consolidate { sources, targets } => {
                if sources.is_empty() {
                    report.errors.push(format!(
                        "strategy '{}' requires at least one source",
                        self.strategy().name()
                    ));
                }
                if targets.is_empty() {
                    report.errors.push(format!(
                        "strategy '{}' requires at least one target",
                        self.strategy().name()
                    ));
                }
                check_endpoints(&mut report, "sources", sources.iter());
                check_endpoints(&mut report, "targets", targets.iter());

                if matches!(self.strategy(), Strategy::Simple { .. })
                    && targets.len() > 1
                    && sources.len() > targets.len()
                {
                    for source in &sources[targets.len()..] {
                        report.warnings.push(format!(
                            "source {} has no target at the same index and will not be migrated",
                            source.key()
                        ));
                    }
                }
            }
            Strategy::VersionBased { version_mapping } => {
                if version_mapping.is_empty() {
                    report
                        .errors
                        .push("strategy 'version-based' requires a non-empty version_mapping".into());
                }
                for (version, group) in version_mapping {
                    if group.sources.is_empty() {
                        report
                            .errors
                            .push(format!("version_mapping['{}'] has no sources", version));
                    }
                    check_endpoints(
                        &mut report,
                        &format!("version_mapping['{}'].sources", version),
                        group.sources.iter(),
                    );
                    check_endpoints(
                        &mut report,
                        &format!("version_mapping['{}'].target", version),
                        std::iter::once(&group.target),
                    );
                }
            }
            Strategy::CustomMapping { migrations } => {
                if migrations.is_empty() {
                    report
                        .errors
                        .push("strategy 'custom-mapping' requires at least one migrations entry".into());
                }
                for (i, m) in migrations.iter().enumerate() {
                    let sources = m.source_endpoints();
                    if sources.is_empty() {
                        report
                            .errors
                            .push(format!("migrations[{}] has neither source nor sources", i));
                    }
                    check_endpoints(
                        &mut report,
                        &format!("migrations[{}].sources", i),
                        sources.into_iter(),
                    );
                    check_endpoints(
                        &mut report,
                        &format!("migrations[{}].target", i),
                        std::iter::once(&m.target),
                    );
                }
            }
        }

        if self.mapping_type() == MappingType::ManyToOne
            && self.conflict_resolution() == ConflictResolution::Fail
        {
            report.warnings.push(
                "N:1 mapping with conflict_resolution 'fail': any database name present on more \
                 than one source will fail its migration"
                    .into(),
            );
        }

        let mut seen = HashSet::new();
        for task in self.generate_execution_plan() {
            let path = task.path();
            if !seen.insert(path.clone()) {
                report
                    .warnings
                    .push(format!("duplicate migration path: {}", path));
            }
        }

        report
    }
}

fn check_endpoints<'a>(
    report: &mut MappingValidation,
    field: &str,
    endpoints: impl Iterator<Item = &'a Endpoint>,
) {
    for (i, endpoint) in endpoints.enumerate() {
        if endpoint.instance.trim().is_empty() {
            report
                .errors
                .push(format!("{}[{}].instance is required", field, i));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::tests::ep;
    use crate::mapping::{CustomMigration, VersionGroup};
    use std::collections::BTreeMap;

    #[test]
    fn test_valid_simple_mapping() {
        let mapping = Mapping::new(Strategy::Simple {
            sources: vec![ep("p", "a")],
            targets: vec![ep("p", "t")],
        });
        let report = mapping.validate();
        assert!(report.is_valid());
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_missing_sources_and_targets() {
        let mapping = Mapping::new(Strategy::Consolidate {
            sources: vec![],
            targets: vec![],
        });
        let report = mapping.validate();
        assert_eq!(report.errors.len(), 2);
        let err = report.into_result().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("at least one source"));
        assert!(msg.contains("at least one target"));
    }

    #[test]
    fn test_missing_instance() {
        let mapping = Mapping::new(Strategy::Simple {
            sources: vec![ep("p", "a"), ep("p", "")],
            targets: vec![ep("p", " ")],
        });
        let report = mapping.validate();
        assert!(report.errors.contains(&"sources[1].instance is required".to_string()));
        assert!(report.errors.contains(&"targets[0].instance is required".to_string()));
    }

    #[test]
    fn test_empty_version_mapping() {
        let mapping = Mapping::new(Strategy::VersionBased {
            version_mapping: BTreeMap::new(),
        });
        assert!(!mapping.validate().is_valid());
    }

    #[test]
    fn test_version_group_without_sources() {
        let mut version_mapping = BTreeMap::new();
        version_mapping.insert(
            "14".to_string(),
            VersionGroup {
                sources: vec![],
                target: ep("p", "t"),
            },
        );
        let report = Mapping::new(Strategy::VersionBased { version_mapping }).validate();
        assert!(report.errors.iter().any(|e| e.contains("'14'")));
    }

    #[test]
    fn test_empty_custom_mapping() {
        let mapping = Mapping::new(Strategy::CustomMapping { migrations: vec![] });
        assert!(!mapping.validate().is_valid());

        let mapping = Mapping::new(Strategy::CustomMapping {
            migrations: vec![CustomMigration {
                source: None,
                sources: vec![],
                target: ep("p", "t"),
                databases: None,
            }],
        });
        let report = mapping.validate();
        assert!(report.errors[0].contains("migrations[0]"));
    }

    #[test]
    fn test_many_to_one_fail_warns() {
        let mapping = Mapping::new(Strategy::Consolidate {
            sources: vec![ep("p", "a"), ep("p", "b")],
            targets: vec![ep("p", "t")],
        });
        let report = mapping.validate();
        assert!(report.is_valid());
        assert!(report.warnings.iter().any(|w| w.starts_with("N:1")));

        let prefixed = mapping.with_conflict_resolution(ConflictResolution::Prefix);
        assert!(prefixed.validate().warnings.is_empty());
    }

    #[test]
    fn test_duplicate_paths_warn() {
        let mapping = Mapping::new(Strategy::CustomMapping {
            migrations: vec![
                CustomMigration {
                    source: Some(ep("p", "a")),
                    sources: vec![],
                    target: ep("p", "t"),
                    databases: None,
                },
                CustomMigration {
                    source: Some(ep("p", "a")),
                    sources: vec![],
                    target: ep("p", "t"),
                    databases: None,
                },
            ],
        });
        let report = mapping.validate();
        assert!(report.is_valid());
        assert_eq!(report.warnings, vec!["duplicate migration path: p:a -> p:t"]);
    }

    #[test]
    fn test_simple_zip_drop_warns() {
        let mapping = Mapping::new(Strategy::Simple {
            sources: vec![ep("p", "a"), ep("p", "b"), ep("p", "c")],
            targets: vec![ep("p", "x"), ep("p", "y")],
        });
        let report = mapping.validate();
        assert!(report.is_valid());
        assert!(report.warnings.iter().any(|w| w.contains("p:c")));
    }
}
