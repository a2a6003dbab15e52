//! Export and import through `pg_dump` / `pg_restore`.
//!
//! Each database is dumped in custom format (`-Fc`) to a file in the
//! operation's work directory and restored with `--no-owner --no-acl`;
//! ownership and grants are reapplied by the permissions phase. Credentials
//! are passed through libpq environment variables, never on the command line.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::ToolsConfig;
use crate::core::identifier::quote_ident;
use crate::core::{
    Endpoint, ExportOptions, ExportOutput, ExportPrimitive, ImportOptions, ImportPrimitive,
};
use crate::error::{MigrateError, Result};
use crate::postgres::{PgConnectionProvider, MAINTENANCE_DATABASE};

/// Lines of stderr kept in a failure message.
const STDERR_TAIL_LINES: usize = 5;

/// `pg_dump` / `pg_restore` wrapper implementing both transfer primitives.
pub struct PgDumpTools {
    settings: ToolsConfig,
    connections: Arc<PgConnectionProvider>,
}

impl PgDumpTools {
    pub fn new(settings: ToolsConfig, connections: Arc<PgConnectionProvider>) -> Self {
        Self {
            settings,
            connections,
        }
    }

    /// Arguments for dumping `database` to `file`.
    pub fn dump_args(database: &str, file: &Path) -> Vec<String> {
        vec![
            "--format=custom".to_string(),
            "--no-password".to_string(),
            "--dbname".to_string(),
            database.to_string(),
            "--file".to_string(),
            file.display().to_string(),
        ]
    }

    /// Arguments for restoring `file` into `database`.
    pub fn restore_args(database: &str, file: &Path, jobs: usize) -> Vec<String> {
        let mut args = vec![
            "--no-owner".to_string(),
            "--no-acl".to_string(),
            "--no-password".to_string(),
            "--exit-on-error".to_string(),
            "--dbname".to_string(),
            database.to_string(),
        ];
        if jobs > 1 {
            args.push("--jobs".to_string());
            args.push(jobs.to_string());
        }
        args.push(file.display().to_string());
        args
    }

    /// Backup file path for one database.
    pub fn backup_path(opts: &ExportOptions, database: &str) -> PathBuf {
        let safe: String = database
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        opts.work_dir
            .join(format!("{}-{}.dump", opts.file_prefix, safe))
    }

    fn command(&self, program: &str, endpoint: &Endpoint) -> Result<Command> {
        let settings = self.connections.settings();
        let mut cmd = Command::new(program);
        cmd.env("PGHOST", PgConnectionProvider::host(endpoint)?)
            .env("PGPORT", settings.port.to_string())
            .env("PGUSER", &endpoint.user)
            .env("PGPASSWORD", &endpoint.password)
            .env("PGSSLMODE", self.connections.ssl_mode().as_str())
            .env("PGCONNECT_TIMEOUT", settings.connect_timeout_secs.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd)
    }

    async fn run(&self, mut cmd: Command, program: &str, database: &str) -> Result<()> {
        let output = cmd.output().await.map_err(|e| {
            MigrateError::transfer(database, format!("failed to run {}: {}", program, e))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MigrateError::transfer(
                database,
                format!("{} exited with {}: {}", program, output.status, stderr_tail(&stderr)),
            ));
        }
        Ok(())
    }

    /// Create `database` on the target unless it already exists.
    ///
    /// Returns true when the database was created.
    pub async fn create_database_if_missing(&self, endpoint: &Endpoint, database: &str) -> Result<bool> {
        let client = self.connections.client(endpoint, MAINTENANCE_DATABASE).await?;
        let existing = client
            .query_opt("SELECT 1 FROM pg_database WHERE datname = $1", &[&database])
            .await?;
        if existing.is_some() {
            debug!("{}/{} already exists", endpoint, database);
            return Ok(false);
        }

        client
            .batch_execute(&format!("CREATE DATABASE {}", quote_ident(database)?))
            .await?;
        info!("Created database {} on {}", database, endpoint);
        Ok(true)
    }
}

#[async_trait]
impl ExportPrimitive for PgDumpTools {
    async fn export_database(
        &self,
        endpoint: &Endpoint,
        database: &str,
        opts: &ExportOptions,
    ) -> Result<ExportOutput> {
        let backup_file = Self::backup_path(opts, database);
        let mut cmd = self.command(&self.settings.pg_dump, endpoint)?;
        cmd.args(Self::dump_args(database, &backup_file));

        debug!("pg_dump {}/{} -> {}", endpoint, database, backup_file.display());
        self.run(cmd, &self.settings.pg_dump, database).await?;

        let bytes = tokio::fs::metadata(&backup_file).await?.len();
        Ok(ExportOutput { backup_file, bytes })
    }
}

#[async_trait]
impl ImportPrimitive for PgDumpTools {
    async fn import_database(
        &self,
        endpoint: &Endpoint,
        database: &str,
        backup_file: &Path,
        opts: &ImportOptions,
    ) -> Result<()> {
        if opts.create_if_missing {
            self.create_database_if_missing(endpoint, database).await?;
        }

        let mut cmd = self.command(&self.settings.pg_restore, endpoint)?;
        cmd.args(Self::restore_args(database, backup_file, self.settings.jobs));

        debug!(
            "pg_restore {} -> {}/{} (from {})",
            backup_file.display(),
            endpoint,
            database,
            opts.source_database
        );
        self.run(cmd, &self.settings.pg_restore, database).await
    }
}

fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    let tail = lines[start..].join(" | ");
    if tail.is_empty() {
        "no error output".to_string()
    } else {
        tail
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;

    fn tools(pg_dump: &str) -> PgDumpTools {
        let connections = Arc::new(PgConnectionProvider::new(ConnectionConfig::default()).unwrap());
        PgDumpTools::new(
            ToolsConfig {
                pg_dump: pg_dump.to_string(),
                ..ToolsConfig::default()
            },
            connections,
        )
    }

    #[test]
    fn test_dump_args() {
        let args = PgDumpTools::dump_args("app", Path::new("/tmp/x.dump"));
        assert_eq!(args[0], "--format=custom");
        assert!(args.windows(2).any(|w| w == ["--dbname", "app"]));
        assert_eq!(args.last().map(String::as_str), Some("/tmp/x.dump"));
    }

    #[test]
    fn test_restore_args() {
        let args = PgDumpTools::restore_args("b_users", Path::new("/tmp/x.dump"), 1);
        assert!(args.contains(&"--no-owner".to_string()));
        assert!(args.contains(&"--no-acl".to_string()));
        assert!(!args.contains(&"--jobs".to_string()));

        let parallel = PgDumpTools::restore_args("b_users", Path::new("/tmp/x.dump"), 4);
        assert!(parallel.windows(2).any(|w| w == ["--jobs", "4"]));
    }

    #[test]
    fn test_backup_path_is_sanitized() {
        let opts = ExportOptions {
            work_dir: PathBuf::from("/work"),
            file_prefix: "b1-task-1".to_string(),
        };
        assert_eq!(
            PgDumpTools::backup_path(&opts, "my db/../x"),
            PathBuf::from("/work/b1-task-1-my_db____x.dump")
        );
    }

    #[test]
    fn test_stderr_tail() {
        let stderr = (1..=8).map(|i| format!("line {}\n", i)).collect::<String>();
        assert_eq!(stderr_tail(&stderr), "line 4 | line 5 | line 6 | line 7 | line 8");
        assert_eq!(stderr_tail("\n\n"), "no error output");
    }

    #[tokio::test]
    async fn test_missing_binary_is_transfer_error() {
        let dir = tempfile::tempdir().unwrap();
        let tools = tools("/nonexistent/pg_dump");
        let endpoint = Endpoint::new("p", "a").with_ip("127.0.0.1");
        let opts = ExportOptions {
            work_dir: dir.path().to_path_buf(),
            file_prefix: "t".to_string(),
        };

        let err = tools
            .export_database(&endpoint, "app", &opts)
            .await
            .unwrap_err();
        match err {
            MigrateError::Transfer { database, message } => {
                assert_eq!(database, "app");
                assert!(message.contains("failed to run"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_missing_ip_fails_before_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let opts = ExportOptions {
            work_dir: dir.path().to_path_buf(),
            file_prefix: "t".to_string(),
        };
        let err = tools("pg_dump")
            .export_database(&Endpoint::new("p", "a"), "app", &opts)
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::Config(_)));
    }
}
