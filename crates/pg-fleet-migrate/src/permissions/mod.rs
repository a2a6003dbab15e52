//! Role and database permission replication.
//!
//! Roles are read from `pg_roles` on the source, minus the built-in
//! `pg_*` roles and the `cloudsql*` roles managed by the provider. Passwords
//! cannot be read back, so login roles are created without one and must be
//! given credentials on the target separately.
//!
//! Database permissions are the owner plus the `datacl` entries, expanded
//! with `aclexplode`. They are captured before export and replayed after
//! import, under the database's name on the target.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_postgres::error::SqlState;
use tracing::{debug, info};

use crate::core::identifier::{quote_ident, validate_privilege};
use crate::core::{
    ApplySummary, DatabaseGrant, DatabasePermissions, Endpoint, PermissionsCollaborator,
    RoleDefinition, StatementFailure,
};
use crate::error::Result;
use crate::postgres::{PgConnectionProvider, MAINTENANCE_DATABASE};

/// Role name prefixes that are never replicated.
pub const RESERVED_ROLE_PREFIXES: &[&str] = &["pg_", "cloudsql"];

/// The instance's default administrator role.
const ADMIN_ROLE: &str = "postgres";

/// `datacl` grantee for PUBLIC.
const PUBLIC: &str = "PUBLIC";

const ROLES_SQL: &str = r#"
SELECT r.rolname,
       r.rolcanlogin,
       r.rolcreatedb,
       r.rolcreaterole,
       r.rolinherit,
       ARRAY(
           SELECT g.rolname
           FROM pg_auth_members m
           JOIN pg_roles g ON g.oid = m.roleid
           WHERE m.member = r.oid
           ORDER BY g.rolname
       ) AS member_of
FROM pg_roles r
ORDER BY r.rolname
"#;

const OWNERS_SQL: &str = r#"
SELECT d.datname, pg_get_userbyid(d.datdba)
FROM pg_database d
WHERE d.datname = ANY($1)
ORDER BY d.datname
"#;

const GRANTS_SQL: &str = r#"
SELECT d.datname,
       COALESCE(r.rolname, 'PUBLIC'),
       a.privilege_type
FROM pg_database d
CROSS JOIN LATERAL aclexplode(d.datacl) a
LEFT JOIN pg_roles r ON r.oid = a.grantee
WHERE d.datname = ANY($1)
ORDER BY 1, 2, 3
"#;

/// Check whether a role is built in or managed by the provider.
pub fn is_reserved_role(name: &str) -> bool {
    name == ADMIN_ROLE || RESERVED_ROLE_PREFIXES.iter().any(|p| name.starts_with(p))
}

fn grantee_sql(grantee: &str) -> Result<String> {
    if grantee.eq_ignore_ascii_case(PUBLIC) {
        Ok(PUBLIC.to_string())
    } else {
        quote_ident(grantee)
    }
}

/// Build `CREATE ROLE` statements followed by membership grants.
///
/// Memberships in reserved roles are dropped along with the roles themselves.
pub fn create_role_statements(roles: &[RoleDefinition]) -> Result<Vec<String>> {
    let roles: Vec<&RoleDefinition> = roles.iter().filter(|r| !is_reserved_role(&r.name)).collect();
    let mut statements = Vec::with_capacity(roles.len());

    for role in &roles {
        let attrs = [
            if role.can_login { "LOGIN" } else { "NOLOGIN" },
            if role.create_db { "CREATEDB" } else { "NOCREATEDB" },
            if role.create_role { "CREATEROLE" } else { "NOCREATEROLE" },
            if role.inherit { "INHERIT" } else { "NOINHERIT" },
        ];
        statements.push(format!(
            "CREATE ROLE {} WITH {}",
            quote_ident(&role.name)?,
            attrs.join(" ")
        ));
    }

    for role in &roles {
        for parent in role.member_of.iter().filter(|p| !is_reserved_role(p)) {
            statements.push(format!(
                "GRANT {} TO {}",
                quote_ident(parent)?,
                quote_ident(&role.name)?
            ));
        }
    }

    Ok(statements)
}

/// Build ownership and grant statements for databases present in `renames`.
pub fn permission_statements(
    permissions: &[DatabasePermissions],
    renames: &[(String, String)],
) -> Result<Vec<String>> {
    let mut statements = Vec::new();

    for perms in permissions {
        let Some((_, target_name)) = renames.iter().find(|(src, _)| *src == perms.database) else {
            debug!("no migrated database for {}, skipping its permissions", perms.database);
            continue;
        };
        let database = quote_ident(target_name)?;

        if !perms.owner.is_empty() && !is_reserved_role(&perms.owner) {
            statements.push(format!(
                "ALTER DATABASE {} OWNER TO {}",
                database,
                quote_ident(&perms.owner)?
            ));
        }

        for grant in &perms.grants {
            if is_reserved_role(&grant.grantee) || grant.privileges.is_empty() {
                continue;
            }
            let privileges = grant
                .privileges
                .iter()
                .map(|p| validate_privilege(p))
                .collect::<Result<Vec<_>>>()?;
            statements.push(format!(
                "GRANT {} ON DATABASE {} TO {}",
                privileges.join(", "),
                database,
                grantee_sql(&grant.grantee)?
            ));
        }
    }

    Ok(statements)
}

/// Group `(database, grantee, privilege)` rows into per-grantee grants.
fn group_grants(rows: Vec<(String, String, String)>) -> BTreeMap<String, Vec<DatabaseGrant>> {
    let mut grouped: BTreeMap<String, BTreeMap<String, Vec<String>>> = BTreeMap::new();
    for (database, grantee, privilege) in rows {
        grouped
            .entry(database)
            .or_default()
            .entry(grantee)
            .or_default()
            .push(privilege);
    }
    grouped
        .into_iter()
        .map(|(database, grantees)| {
            let grants = grantees
                .into_iter()
                .map(|(grantee, privileges)| DatabaseGrant { grantee, privileges })
                .collect();
            (database, grants)
        })
        .collect()
}

/// PostgreSQL-backed [`PermissionsCollaborator`].
pub struct PgPermissions {
    connections: Arc<PgConnectionProvider>,
}

impl PgPermissions {
    pub fn new(connections: Arc<PgConnectionProvider>) -> Self {
        Self { connections }
    }

    /// Run statements one at a time, collecting failures instead of stopping.
    ///
    /// `tolerate_existing` counts "already exists" errors as applied.
    async fn apply(
        &self,
        target: &Endpoint,
        script: &[String],
        tolerate_existing: bool,
    ) -> Result<ApplySummary> {
        let mut summary = ApplySummary::default();
        if script.is_empty() {
            return Ok(summary);
        }

        let client = self.connections.client(target, MAINTENANCE_DATABASE).await?;
        for statement in script {
            match client.batch_execute(statement).await {
                Ok(()) => summary.applied += 1,
                Err(e) if tolerate_existing && e.code() == Some(&SqlState::DUPLICATE_OBJECT) => {
                    debug!("{}: already present: {}", target, statement);
                    summary.applied += 1;
                }
                Err(e) => summary.failures.push(StatementFailure {
                    statement: statement.clone(),
                    message: e.as_db_error().map_or_else(|| e.to_string(), |db| db.message().to_string()),
                }),
            }
        }
        Ok(summary)
    }
}

#[async_trait]
impl PermissionsCollaborator for PgPermissions {
    async fn extract_users_and_roles(&self, source: &Endpoint) -> Result<Vec<RoleDefinition>> {
        let client = self.connections.client(source, MAINTENANCE_DATABASE).await?;
        let rows = client.query(ROLES_SQL, &[]).await?;

        let roles: Vec<RoleDefinition> = rows
            .iter()
            .map(|row| RoleDefinition {
                name: row.get(0),
                can_login: row.get(1),
                create_db: row.get(2),
                create_role: row.get(3),
                inherit: row.get(4),
                member_of: row.get(5),
            })
            .filter(|role| !is_reserved_role(&role.name))
            .collect();

        info!("{}: extracted {} role(s)", source, roles.len());
        Ok(roles)
    }

    async fn extract_database_permissions(
        &self,
        source: &Endpoint,
        databases: &[String],
    ) -> Result<Vec<DatabasePermissions>> {
        if databases.is_empty() {
            return Ok(Vec::new());
        }
        let client = self.connections.client(source, MAINTENANCE_DATABASE).await?;

        let owners = client.query(OWNERS_SQL, &[&databases]).await?;
        let grant_rows = client.query(GRANTS_SQL, &[&databases]).await?;
        let mut grants = group_grants(
            grant_rows
                .iter()
                .map(|row| (row.get(0), row.get(1), row.get(2)))
                .collect(),
        );

        let permissions: Vec<DatabasePermissions> = owners
            .iter()
            .map(|row| {
                let database: String = row.get(0);
                DatabasePermissions {
                    grants: grants.remove(&database).unwrap_or_default(),
                    owner: row.get(1),
                    database,
                }
            })
            .collect();

        debug!(
            "{}: captured permissions for {} database(s)",
            source,
            permissions.len()
        );
        Ok(permissions)
    }

    fn generate_create_script(&self, roles: &[RoleDefinition]) -> Result<Vec<String>> {
        create_role_statements(roles)
    }

    async fn apply_users_and_roles(&self, target: &Endpoint, script: &[String]) -> Result<ApplySummary> {
        self.apply(target, script, true).await
    }

    fn generate_permissions_script(
        &self,
        permissions: &[DatabasePermissions],
        renames: &[(String, String)],
    ) -> Result<Vec<String>> {
        permission_statements(permissions, renames)
    }

    async fn apply_permissions(&self, target: &Endpoint, script: &[String]) -> Result<ApplySummary> {
        self.apply(target, script, false).await
    }

    async fn cleanup(&self) -> Result<()> {
        // Connections are pooled by the provider and released by the engine.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn role(name: &str, member_of: &[&str]) -> RoleDefinition {
        RoleDefinition {
            name: name.to_string(),
            can_login: true,
            create_db: false,
            create_role: false,
            inherit: true,
            member_of: member_of.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_reserved_roles() {
        assert!(is_reserved_role("pg_read_all_data"));
        assert!(is_reserved_role("cloudsqlsuperuser"));
        assert!(is_reserved_role("postgres"));
        assert!(!is_reserved_role("app_reader"));
    }

    #[test]
    fn test_create_script_orders_roles_before_memberships() {
        let mut group = role("readers", &[]);
        group.can_login = false;
        let roles = vec![
            role("app", &["readers", "cloudsqlsuperuser"]),
            group,
            role("pg_monitor", &[]),
        ];

        let script = create_role_statements(&roles).unwrap();
        assert_eq!(
            script,
            vec![
                "CREATE ROLE \"app\" WITH LOGIN NOCREATEDB NOCREATEROLE INHERIT",
                "CREATE ROLE \"readers\" WITH NOLOGIN NOCREATEDB NOCREATEROLE INHERIT",
                "GRANT \"readers\" TO \"app\"",
            ]
        );
    }

    #[test]
    fn test_create_script_quotes_names() {
        let script = create_role_statements(&[role("o\"brien", &[])]).unwrap();
        assert!(script[0].starts_with("CREATE ROLE \"o\"\"brien\""));
    }

    #[test]
    fn test_permissions_script_uses_target_names() {
        let perms = vec![
            DatabasePermissions {
                database: "users".to_string(),
                owner: "app".to_string(),
                grants: vec![
                    DatabaseGrant {
                        grantee: "readers".to_string(),
                        privileges: vec!["CONNECT".to_string(), "TEMPORARY".to_string()],
                    },
                    DatabaseGrant {
                        grantee: "PUBLIC".to_string(),
                        privileges: vec!["CONNECT".to_string()],
                    },
                ],
            },
            DatabasePermissions {
                database: "not_migrated".to_string(),
                owner: "app".to_string(),
                grants: vec![],
            },
        ];
        let renames = vec![("users".to_string(), "a_users".to_string())];

        let script = permission_statements(&perms, &renames).unwrap();
        assert_eq!(
            script,
            vec![
                "ALTER DATABASE \"a_users\" OWNER TO \"app\"",
                "GRANT CONNECT, TEMPORARY ON DATABASE \"a_users\" TO \"readers\"",
                "GRANT CONNECT ON DATABASE \"a_users\" TO PUBLIC",
            ]
        );
    }

    #[test]
    fn test_permissions_script_skips_reserved_owner() {
        let perms = vec![DatabasePermissions {
            database: "app".to_string(),
            owner: "cloudsqlsuperuser".to_string(),
            grants: vec![DatabaseGrant {
                grantee: "postgres".to_string(),
                privileges: vec!["ALL".to_string()],
            }],
        }];
        let renames = vec![("app".to_string(), "app".to_string())];
        assert!(permission_statements(&perms, &renames).unwrap().is_empty());
    }

    #[test]
    fn test_permissions_script_rejects_unknown_privilege() {
        let perms = vec![DatabasePermissions {
            database: "app".to_string(),
            owner: String::new(),
            grants: vec![DatabaseGrant {
                grantee: "app".to_string(),
                privileges: vec!["CONNECT; DROP DATABASE app".to_string()],
            }],
        }];
        let renames = vec![("app".to_string(), "app".to_string())];
        assert!(permission_statements(&perms, &renames).is_err());
    }

    #[test]
    fn test_group_grants() {
        let rows = vec![
            ("a".to_string(), "PUBLIC".to_string(), "CONNECT".to_string()),
            ("a".to_string(), "app".to_string(), "CONNECT".to_string()),
            ("a".to_string(), "app".to_string(), "CREATE".to_string()),
            ("b".to_string(), "app".to_string(), "TEMPORARY".to_string()),
        ];
        let grouped = group_grants(rows);
        assert_eq!(grouped.len(), 2);
        assert_eq!(
            grouped["a"],
            vec![
                DatabaseGrant {
                    grantee: "PUBLIC".to_string(),
                    privileges: vec!["CONNECT".to_string()],
                },
                DatabaseGrant {
                    grantee: "app".to_string(),
                    privileges: vec!["CONNECT".to_string(), "CREATE".to_string()],
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_script_needs_no_connection() {
        let connections = Arc::new(
            PgConnectionProvider::new(crate::config::ConnectionConfig::default()).unwrap(),
        );
        let permissions = PgPermissions::new(connections);
        // No ip: any connection attempt would fail.
        let target = Endpoint::new("p", "t");
        let summary = permissions.apply_permissions(&target, &[]).await.unwrap();
        assert!(summary.is_clean());
        assert_eq!(summary.applied, 0);
        assert!(permissions
            .extract_database_permissions(&target, &[])
            .await
            .unwrap()
            .is_empty());
    }
}
