//! Connection resolution: logical target → live, query-capable connection.
//!
//! One provider interface covers both the plain and the tunneled path; the
//! only difference is whether the target carries a [`TunnelSpec`]. Release
//! semantics are identical on both paths, and tunnel teardown happens even
//! when the database connection attempt fails.
//!
//! Arbitrary diagnostic SQL runs over the simple-query protocol so every cell
//! arrives as text regardless of its column type.

pub mod tunnel;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_postgres::{NoTls, SimpleQueryMessage};
use tracing::debug;

use crate::error::{ConnectPhase, ConnectionError, QueryError};
use crate::model::{Instance, TunnelSpec};

use tunnel::{SshTunneler, TunnelHandle, Tunneler};

/// Default timeout for establishing a database connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A fully resolved connection target.
#[derive(Debug, Clone)]
pub struct TargetSpec {
    /// Human-readable identity carried into errors, logs and reports.
    pub label: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub dbname: String,
    pub tunnel: Option<TunnelSpec>,
}

impl TargetSpec {
    /// Target for an instance's configured database.
    pub fn for_instance(instance: &Instance) -> Self {
        Self {
            label: instance.label(),
            host: instance.host.clone(),
            port: instance.port,
            username: instance.username.clone(),
            password: instance.password.clone(),
            dbname: instance.database.clone(),
            tunnel: instance.tunnel.clone(),
        }
    }

    /// Same instance, different database.
    pub fn with_database(&self, dbname: &str) -> Self {
        let mut t = self.clone();
        t.dbname = dbname.to_string();
        t.label = format!("{}/{}", self.label, dbname);
        t
    }
}

/// Rows of one query, every cell as text (`None` = SQL NULL).
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl ResultSet {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Cell by row index and column name.
    pub fn text(&self, row: usize, column: &str) -> Option<&str> {
        let idx = self.column_index(column)?;
        self.rows.get(row)?.get(idx)?.as_deref()
    }
}

/// A live connection. `close` must be invoked exactly once on every exit
/// path; implementations tear down the tunnel (if any) as part of it.
#[async_trait]
pub trait Connection: Send {
    async fn query(&mut self, sql: &str) -> Result<ResultSet, QueryError>;

    async fn close(self: Box<Self>);
}

/// Resolves a target descriptor into a connected handle.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    async fn connect(&self, target: &TargetSpec) -> Result<Box<dyn Connection>, ConnectionError>;
}

/// Enumerates non-template, connectable databases on the instance behind
/// `conn`.
pub async fn list_user_databases(conn: &mut dyn Connection) -> Result<Vec<String>, QueryError> {
    let result = conn
        .query(
            "SELECT datname FROM pg_database \
             WHERE NOT datistemplate AND datallowconn \
             ORDER BY datname",
        )
        .await?;
    Ok(result
        .rows
        .iter()
        .filter_map(|row| row.first().cloned().flatten())
        .collect())
}

/// [`ConnectionProvider`] backed by tokio-postgres, with optional SSH
/// tunneling.
pub struct PgConnectionProvider {
    tunneler: Arc<dyn Tunneler>,
    connect_timeout: Duration,
}

impl PgConnectionProvider {
    pub fn new() -> Self {
        Self {
            tunneler: Arc::new(SshTunneler::default()),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_tunneler(mut self, tunneler: Arc<dyn Tunneler>) -> Self {
        self.tunneler = tunneler;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Default for PgConnectionProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectionProvider for PgConnectionProvider {
    async fn connect(&self, target: &TargetSpec) -> Result<Box<dyn Connection>, ConnectionError> {
        // Forwarding channel first, when configured.
        let tunnel = match &target.tunnel {
            Some(spec) => Some(
                self.tunneler
                    .open(spec, &target.host, target.port, &target.label)
                    .await?,
            ),
            None => None,
        };

        let (host, port) = match &tunnel {
            Some(t) => ("127.0.0.1".to_string(), t.local_port()),
            None => (target.host.clone(), target.port),
        };

        let mut config = tokio_postgres::Config::new();
        config
            .host(&host)
            .port(port)
            .user(&target.username)
            .dbname(&target.dbname)
            .connect_timeout(self.connect_timeout);
        if !target.password.is_empty() {
            config.password(&target.password);
        }

        match config.connect(NoTls).await {
            Ok((client, connection)) => {
                let label = target.label.clone();
                let driver = tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        debug!(target = %label, error = %e, "connection task ended");
                    }
                });
                Ok(Box::new(PgConnection {
                    target: target.label.clone(),
                    client,
                    driver,
                    tunnel,
                }))
            }
            Err(e) => {
                // Teardown must happen even when the connect fails.
                if let Some(t) = tunnel {
                    t.close().await;
                }
                Err(ConnectionError {
                    target: target.label.clone(),
                    phase: ConnectPhase::Database,
                    message: format_postgres_error(&e),
                })
            }
        }
    }
}

struct PgConnection {
    target: String,
    client: tokio_postgres::Client,
    driver: tokio::task::JoinHandle<()>,
    tunnel: Option<Box<dyn TunnelHandle>>,
}

#[async_trait]
impl Connection for PgConnection {
    async fn query(&mut self, sql: &str) -> Result<ResultSet, QueryError> {
        let messages = self
            .client
            .simple_query(sql)
            .await
            .map_err(|e| QueryError::new(format_postgres_error(&e)))?;

        let mut result = ResultSet::default();
        for message in messages {
            match message {
                SimpleQueryMessage::RowDescription(desc) => {
                    if result.columns.is_empty() {
                        result.columns = desc.iter().map(|c| c.name().to_string()).collect();
                    }
                }
                SimpleQueryMessage::Row(row) => {
                    if result.columns.is_empty() {
                        result.columns =
                            row.columns().iter().map(|c| c.name().to_string()).collect();
                    }
                    let cells = (0..row.len())
                        .map(|i| row.get(i).map(str::to_string))
                        .collect();
                    result.rows.push(cells);
                }
                SimpleQueryMessage::CommandComplete(_) => {}
                _ => {}
            }
        }
        Ok(result)
    }

    async fn close(self: Box<Self>) {
        let target = self.target;
        // Dropping the client terminates the driver task.
        drop(self.client);
        self.driver.abort();
        if let Some(t) = self.tunnel {
            t.close().await;
        }
        debug!(target = %target, "connection released");
    }
}

/// Formats a driver error for display without leaking protocol internals.
pub(crate) fn format_postgres_error(e: &tokio_postgres::Error) -> String {
    if let Some(db_error) = e.as_db_error() {
        format!("{}: {}", db_error.severity(), db_error.message())
    } else {
        let msg = e.to_string();
        if msg.contains("Connection refused") {
            "connection refused".to_string()
        } else if msg.contains("password authentication failed") {
            "password authentication failed".to_string()
        } else {
            msg
        }
    }
}
