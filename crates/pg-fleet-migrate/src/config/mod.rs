//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;
pub use validation::SSL_MODES;

use crate::error::Result;
use crate::mapping::Mapping;
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// Normalize the raw mapping section into an immutable [`Mapping`].
    pub fn mapping(&self) -> Result<Mapping> {
        Mapping::try_from(self.mapping.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MigrateError;
    use crate::mapping::{ConflictResolution, MappingType};
    use std::io::Write;

    const YAML: &str = r#"
mapping:
  strategy: consolidate
  conflict_resolution: prefix
  sources:
    - { project: prod, instance: a, password: pw1, ip: 10.0.0.1 }
    - { project: prod, instance: b, password: pw2, ip: 10.0.0.2 }
  targets:
    - { project: prod, instance: central, password: pw3, ip: 10.0.0.9 }
  options:
    max_parallel: 2
connection:
  ssl_mode: require
tools:
  jobs: 4
"#;

    #[test]
    fn test_from_yaml_with_defaults() {
        let config = Config::from_yaml(YAML).unwrap();
        assert_eq!(config.connection.port, 5432);
        assert_eq!(config.connection.ssl_mode, "require");
        assert_eq!(config.connection.connect_timeout_secs, 10);
        assert_eq!(config.tools.pg_dump, "pg_dump");
        assert_eq!(config.tools.jobs, 4);

        let mapping = config.mapping().unwrap();
        assert_eq!(mapping.mapping_type(), MappingType::ManyToOne);
        assert_eq!(mapping.conflict_resolution(), ConflictResolution::Prefix);
        assert_eq!(mapping.options().max_parallel, 2);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(YAML.as_bytes()).unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.mapping.sources.len(), 2);
    }

    #[test]
    fn test_missing_mapping_is_yaml_error() {
        let err = Config::from_yaml("connection: { port: 5432 }").unwrap_err();
        assert!(matches!(err, MigrateError::Yaml(_)));
    }

    #[test]
    fn test_unknown_strategy_surfaces_on_mapping() {
        let config = Config::from_yaml("mapping: { strategy: shuffle }").unwrap();
        assert!(matches!(config.mapping(), Err(MigrateError::Config(_))));
    }
}
