//! PostgreSQL connection provider.
//!
//! Keeps one deadpool-postgres pool per `(endpoint, database)` pair, created
//! lazily on first use. Pools for an endpoint are dropped from the cache by
//! [`ConnectionProvider::release`] when a task finishes with it, and closed
//! by [`ConnectionProvider::close_all_connections`].

pub mod tls;

pub use tls::SslMode;

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio_postgres::Config as PgConfig;
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::core::{ConnectionProvider, DatabaseInfo, Endpoint};
use crate::error::{MigrateError, Result};

/// Database used for instance-level queries.
pub const MAINTENANCE_DATABASE: &str = "postgres";

const LIST_DATABASES_SQL: &str = "SELECT datname, pg_database_size(datname)::bigint \
     FROM pg_database WHERE datallowconn AND NOT datistemplate ORDER BY datname";

/// deadpool-backed [`ConnectionProvider`].
pub struct PgConnectionProvider {
    settings: ConnectionConfig,
    ssl_mode: SslMode,
    tls: Option<MakeRustlsConnect>,
    pools: Mutex<HashMap<(String, String), Pool>>,
}

impl PgConnectionProvider {
    pub fn new(settings: ConnectionConfig) -> Result<Self> {
        let ssl_mode: SslMode = settings.ssl_mode.parse()?;
        let tls = ssl_mode.connector()?;
        if !ssl_mode.requires_tls() {
            warn!("PostgreSQL TLS is disabled. Credentials will be transmitted in plaintext.");
        }
        Ok(Self {
            settings,
            ssl_mode,
            tls,
            pools: Mutex::new(HashMap::new()),
        })
    }

    pub fn settings(&self) -> &ConnectionConfig {
        &self.settings
    }

    pub fn ssl_mode(&self) -> SslMode {
        self.ssl_mode
    }

    /// Host to connect to for an endpoint.
    pub fn host(endpoint: &Endpoint) -> Result<&str> {
        endpoint
            .ip
            .as_deref()
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| {
                MigrateError::Config(format!("{}: ip is required to connect", endpoint.key()))
            })
    }

    /// tokio-postgres config for one database of an endpoint.
    pub fn pg_config(&self, endpoint: &Endpoint, database: &str) -> Result<PgConfig> {
        let mut pg_config = PgConfig::new();
        pg_config.host(Self::host(endpoint)?);
        pg_config.port(self.settings.port);
        pg_config.dbname(database);
        pg_config.user(&endpoint.user);
        pg_config.password(&endpoint.password);
        pg_config.application_name("pg-fleet-migrate");
        pg_config.keepalives(true);
        pg_config.keepalives_idle(Duration::from_secs(30));
        pg_config.connect_timeout(Duration::from_secs(self.settings.connect_timeout_secs));
        Ok(pg_config)
    }

    fn pool(&self, endpoint: &Endpoint, database: &str) -> Result<Pool> {
        let key = (endpoint.key(), database.to_string());
        let mut pools = self.pools.lock();
        if let Some(pool) = pools.get(&key) {
            return Ok(pool.clone());
        }

        let pg_config = self.pg_config(endpoint, database)?;
        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let mgr = match &self.tls {
            Some(tls) => Manager::from_config(pg_config, tls.clone(), mgr_config),
            None => Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config),
        };
        let pool = Pool::builder(mgr)
            .max_size(self.settings.max_connections)
            .build()
            .map_err(|e| {
                MigrateError::pool(e.to_string(), format!("creating pool for {}/{}", key.0, key.1))
            })?;

        debug!("created pool for {}/{}", key.0, key.1);
        pools.insert(key, pool.clone());
        Ok(pool)
    }

    /// Check out a pooled client for one database of an endpoint.
    pub async fn client(&self, endpoint: &Endpoint, database: &str) -> Result<Object> {
        let pool = self.pool(endpoint, database)?;
        pool.get().await.map_err(|e| {
            MigrateError::connectivity(format!("{}/{}", endpoint.key(), database), e.to_string())
        })
    }

    fn drain(&self, endpoint_key: Option<&str>) -> Vec<Pool> {
        let mut pools = self.pools.lock();
        let keys: Vec<(String, String)> = pools
            .keys()
            .filter(|(ep, _)| endpoint_key.map_or(true, |k| ep == k))
            .cloned()
            .collect();
        keys.iter().filter_map(|k| pools.remove(k)).collect()
    }

    fn pool_count(&self) -> usize {
        self.pools.lock().len()
    }
}

#[async_trait]
impl ConnectionProvider for PgConnectionProvider {
    async fn list_databases(&self, endpoint: &Endpoint, is_source: bool) -> Result<Vec<DatabaseInfo>> {
        let client = self.client(endpoint, MAINTENANCE_DATABASE).await?;
        let rows = client.query(LIST_DATABASES_SQL, &[]).await?;

        let databases: Vec<DatabaseInfo> = rows
            .iter()
            .map(|row| {
                let size: i64 = row.get(1);
                DatabaseInfo::new(row.get::<_, String>(0), size.max(0) as u64)
            })
            .collect();

        debug!(
            "{} {}: {} database(s)",
            if is_source { "source" } else { "target" },
            endpoint,
            databases.len()
        );
        Ok(databases)
    }

    async fn test_connection(&self, endpoint: &Endpoint, database: Option<&str>) -> Result<()> {
        let database = database.unwrap_or(MAINTENANCE_DATABASE);
        let client = self.client(endpoint, database).await?;
        client.simple_query("SELECT 1").await.map_err(|e| {
            MigrateError::connectivity(format!("{}/{}", endpoint.key(), database), e.to_string())
        })?;
        debug!("connection ok: {}/{}", endpoint, database);
        Ok(())
    }

    async fn release(&self, endpoint: &Endpoint) -> Result<()> {
        // Dropped, not closed: concurrent tasks may still hold clones.
        let pools = self.drain(Some(&endpoint.key()));
        debug!("released {} pool(s) for {}", pools.len(), endpoint);
        Ok(())
    }

    async fn close_all_connections(&self) {
        let pools = self.drain(None);
        for pool in &pools {
            pool.close();
        }
        if !pools.is_empty() {
            info!("Closed {} connection pool(s)", pools.len());
        }
    }
}
