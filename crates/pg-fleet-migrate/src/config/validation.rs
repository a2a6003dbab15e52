//! Configuration validation.

use super::Config;
use crate::error::{MigrateError, Result};

/// SSL modes accepted by the connection provider.
pub const SSL_MODES: [&str; 4] = ["disable", "require", "verify-ca", "verify-full"];

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    if config.mapping.strategy.trim().is_empty() {
        return Err(MigrateError::Config("mapping.strategy is required".into()));
    }
    if config.mapping.options.max_parallel == 0 {
        return Err(MigrateError::Config(
            "mapping.options.max_parallel must be at least 1".into(),
        ));
    }

    if config.connection.max_connections == 0 {
        return Err(MigrateError::Config(
            "connection.max_connections must be at least 1".into(),
        ));
    }
    if config.connection.port == 0 {
        return Err(MigrateError::Config("connection.port must be set".into()));
    }
    let ssl_mode = config.connection.ssl_mode.to_lowercase();
    if !SSL_MODES.contains(&ssl_mode.as_str()) {
        return Err(MigrateError::Config(format!(
            "connection.ssl_mode must be one of {}, got '{}'",
            SSL_MODES.join(", "),
            config.connection.ssl_mode
        )));
    }

    if config.tools.jobs == 0 {
        return Err(MigrateError::Config("tools.jobs must be at least 1".into()));
    }
    if config.tools.pg_dump.trim().is_empty() {
        return Err(MigrateError::Config("tools.pg_dump is required".into()));
    }
    if config.tools.pg_restore.trim().is_empty() {
        return Err(MigrateError::Config("tools.pg_restore is required".into()));
    }

    Ok(())
}
