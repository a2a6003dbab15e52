//! Identifier validation and quoting for generated role and permission scripts.
//!
//! Role names, database names and privilege keywords cannot be passed as
//! statement parameters, so every script line built by the permissions
//! collaborator goes through these helpers:
//!
//! 1. Validate identifiers for suspicious patterns (null bytes, excessive length)
//! 2. Quote with PostgreSQL double quotes, doubling embedded quotes
//! 3. Accept privilege keywords only from a fixed allow-list

use crate::error::{MigrateError, Result};

/// PostgreSQL truncates identifiers at 63 bytes (NAMEDATALEN - 1).
const MAX_IDENTIFIER_LENGTH: usize = 63;

/// Database-level privileges that may appear in a generated GRANT.
const DATABASE_PRIVILEGES: &[&str] = &["CONNECT", "CREATE", "TEMPORARY", "TEMP", "ALL"];

/// Validate an identifier for security issues.
///
/// Rejects:
/// - Empty identifiers
/// - Identifiers containing null bytes (injection vector)
/// - Identifiers exceeding the PostgreSQL length limit
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(MigrateError::Config(
            "Identifier cannot be empty".to_string(),
        ));
    }

    if name.contains('\0') {
        return Err(MigrateError::Config(format!(
            "SECURITY: Identifier contains null byte (possible injection attempt): {:?}",
            name
        )));
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(MigrateError::Config(format!(
            "Identifier exceeds maximum length of {} bytes (got {} bytes): {:?}",
            MAX_IDENTIFIER_LENGTH,
            name.len(),
            name
        )));
    }

    Ok(())
}

/// Quote a PostgreSQL identifier.
///
/// Escapes double quotes by doubling them and wraps in double quotes.
///
/// ```ignore
/// assert_eq!(quote_ident("users")?, "\"users\"");
/// assert_eq!(quote_ident("role\"x")?, "\"role\"\"x\"");
/// ```
pub fn quote_ident(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// Normalize and check a database privilege keyword.
pub fn validate_privilege(privilege: &str) -> Result<&'static str> {
    let upper = privilege.trim().to_uppercase();
    DATABASE_PRIVILEGES
        .iter()
        .find(|p| **p == upper)
        .copied()
        .ok_or_else(|| {
            MigrateError::Config(format!("Unsupported database privilege: {:?}", privilege))
        })
}
