//! Expansion of a mapping into an ordered list of migration tasks.
//!
//! Planning is pure and deterministic: the same mapping always yields the
//! same tasks in the same order.

use super::{ConflictResolution, Mapping, MigrationTask, Strategy};
use crate::core::{DatabaseSelection, Endpoint};

impl Mapping {
    /// Produce one task per source-to-target path.
    pub fn generate_execution_plan(&self) -> Vec<MigrationTask> {
        match self.strategy() {
            Strategy::Simple { sources, targets } => self.plan_simple(sources, targets),
            Strategy::Consolidate { sources, targets } => self.plan_consolidate(sources, targets),
            Strategy::VersionBased { version_mapping } => version_mapping
                .iter()
                .flat_map(|(version, group)| {
                    group.sources.iter().map(move |source| {
                        self.task(source, &group.target, self.databases().clone())
                            .tagged(version)
                    })
                })
                .collect(),
            Strategy::CustomMapping { migrations } => migrations
                .iter()
                .flat_map(|m| {
                    let databases = m.databases.clone().unwrap_or_else(|| self.databases().clone());
                    m.source_endpoints()
                        .into_iter()
                        .map(move |source| self.task(source, &m.target, databases.clone()))
                })
                .collect(),
        }
    }

    fn plan_simple(&self, sources: &[Endpoint], targets: &[Endpoint]) -> Vec<MigrationTask> {
        if let [target] = targets {
            return sources
                .iter()
                .map(|source| self.task(source, target, self.databases().clone()))
                .collect();
        }

        // Sources past the last target index are dropped.
        sources
            .iter()
            .zip(targets.iter())
            .map(|(source, target)| self.task(source, target, self.databases().clone()))
            .collect()
    }

    fn plan_consolidate(&self, sources: &[Endpoint], targets: &[Endpoint]) -> Vec<MigrationTask> {
        let Some(target) = targets.first() else {
            return Vec::new();
        };

        sources
            .iter()
            .map(|source| {
                let mut task = self.task(source, target, self.databases().clone());
                if self.conflict_resolution() == ConflictResolution::Prefix {
                    task.prefix_with = Some(source.instance.clone());
                }
                task
            })
            .collect()
    }

    fn task(
        &self,
        source: &Endpoint,
        target: &Endpoint,
        databases: DatabaseSelection,
    ) -> MigrationTask {
        MigrationTask {
            source: source.clone(),
            target: target.clone(),
            databases,
            conflict_resolution: self.conflict_resolution(),
            prefix_with: None,
            version: None,
        }
    }
}

impl MigrationTask {
    fn tagged(mut self, version: &str) -> Self {
        self.version = Some(version.to_string());
        self
    }
}
