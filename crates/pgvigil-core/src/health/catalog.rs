//! The health-check catalog: data-driven check definitions.
//!
//! Adding a check means adding a definition here (or supplying a custom
//! [`CatalogSource`]), not writing engine code. Each definition carries its
//! SQL and the scopes deciding which instances and databases it runs against.

use serde::{Deserialize, Serialize};

/// Which instances of the cluster a check runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceScope {
    /// The cluster's writer instance only.
    WriterOnly,
    /// Every instance, writer and readers alike.
    AllInstances,
}

/// Which databases of an instance a check runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatabaseScope {
    /// The instance's configured database only.
    Configured,
    /// Every non-template, connectable database on the instance.
    AllUserDatabases,
}

/// One diagnostic check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckDefinition {
    /// Stable machine name.
    pub name: String,
    /// Heading used in the report.
    pub title: String,
    pub sql: String,
    pub instance_scope: InstanceScope,
    pub database_scope: DatabaseScope,
    /// Report ordering; lower runs (and renders) first.
    pub order: u32,
    pub active: bool,
    /// When set, any returned row means the check found something to flag.
    pub warn_on_rows: bool,
}

/// Supplies the definitions an engine run executes.
pub trait CatalogSource: Send + Sync {
    fn definitions(&self) -> Vec<HealthCheckDefinition>;
}

/// [`CatalogSource`] over a fixed list.
pub struct StaticCatalog {
    definitions: Vec<HealthCheckDefinition>,
}

impl StaticCatalog {
    pub fn new(definitions: Vec<HealthCheckDefinition>) -> Self {
        Self { definitions }
    }
}

impl CatalogSource for StaticCatalog {
    fn definitions(&self) -> Vec<HealthCheckDefinition> {
        self.definitions.clone()
    }
}

fn def(
    name: &str,
    title: &str,
    sql: &str,
    instance_scope: InstanceScope,
    database_scope: DatabaseScope,
    order: u32,
    warn_on_rows: bool,
) -> HealthCheckDefinition {
    HealthCheckDefinition {
        name: name.to_string(),
        title: title.to_string(),
        sql: sql.to_string(),
        instance_scope,
        database_scope,
        order,
        active: true,
        warn_on_rows,
    }
}

/// The built-in check set.
pub fn default_catalog() -> StaticCatalog {
    StaticCatalog::new(vec![
        def(
            "replication_status",
            "Replication status",
            r#"
                SELECT
                    COALESCE(client_addr::text, 'local') as client,
                    COALESCE(application_name, '') as application,
                    state,
                    COALESCE(sync_state, '') as sync_state,
                    COALESCE(EXTRACT(EPOCH FROM replay_lag)::double precision, 0) as replay_lag_s
                FROM pg_stat_replication
                ORDER BY client_addr
            "#,
            InstanceScope::WriterOnly,
            DatabaseScope::Configured,
            10,
            false,
        ),
        def(
            "wraparound_risk",
            "Transaction ID wraparound risk",
            r#"
                SELECT
                    datname,
                    age(datfrozenxid) as xid_age,
                    round(age(datfrozenxid) * 100.0 / 2000000000, 2) as pct_to_wraparound
                FROM pg_database
                WHERE age(datfrozenxid) > 1000000000
                ORDER BY age(datfrozenxid) DESC
                LIMIT 50
            "#,
            InstanceScope::WriterOnly,
            DatabaseScope::Configured,
            20,
            true,
        ),
        def(
            "long_transactions",
            "Long-running transactions",
            r#"
                SELECT
                    pid,
                    COALESCE(usename, '') as usename,
                    state,
                    EXTRACT(EPOCH FROM (now() - xact_start))::bigint as xact_age_s,
                    COALESCE(LEFT(query, 120), '') as query
                FROM pg_stat_activity
                WHERE xact_start IS NOT NULL
                  AND now() - xact_start > interval '5 minutes'
                  AND backend_type = 'client backend'
                ORDER BY xact_start
                LIMIT 50
            "#,
            InstanceScope::AllInstances,
            DatabaseScope::Configured,
            30,
            true,
        ),
        def(
            "blocked_sessions",
            "Blocked sessions",
            r#"
                SELECT
                    blocked.pid as blocked_pid,
                    COALESCE(blocked.usename, '') as blocked_user,
                    blocking.pid as blocking_pid,
                    COALESCE(LEFT(blocked.query, 120), '') as blocked_query
                FROM pg_stat_activity blocked
                JOIN pg_stat_activity blocking
                  ON blocking.pid = ANY(pg_blocking_pids(blocked.pid))
                ORDER BY blocked.pid
                LIMIT 50
            "#,
            InstanceScope::AllInstances,
            DatabaseScope::Configured,
            40,
            true,
        ),
        def(
            "unused_indexes",
            "Unused indexes",
            r#"
                SELECT
                    schemaname,
                    relname,
                    indexrelname,
                    pg_size_pretty(pg_relation_size(indexrelid)) as index_size
                FROM pg_stat_user_indexes
                WHERE idx_scan = 0
                  AND pg_relation_size(indexrelid) > 10 * 1024 * 1024
                ORDER BY pg_relation_size(indexrelid) DESC
                LIMIT 50
            "#,
            InstanceScope::WriterOnly,
            DatabaseScope::AllUserDatabases,
            50,
            true,
        ),
        def(
            "invalid_indexes",
            "Invalid indexes",
            r#"
                SELECT
                    n.nspname as schemaname,
                    c.relname as indexname
                FROM pg_index i
                JOIN pg_class c ON c.oid = i.indexrelid
                JOIN pg_namespace n ON n.oid = c.relnamespace
                WHERE NOT i.indisvalid
                ORDER BY n.nspname, c.relname
                LIMIT 50
            "#,
            InstanceScope::WriterOnly,
            DatabaseScope::AllUserDatabases,
            60,
            true,
        ),
        def(
            "dead_tuple_bloat",
            "Dead tuple bloat",
            r#"
                SELECT
                    schemaname,
                    relname,
                    n_live_tup,
                    n_dead_tup,
                    round(n_dead_tup * 100.0 / (n_live_tup + n_dead_tup), 2) as dead_pct,
                    COALESCE(last_autovacuum::text, 'never') as last_autovacuum
                FROM pg_stat_user_tables
                WHERE n_dead_tup > 10000
                  AND n_dead_tup > n_live_tup * 0.2
                ORDER BY n_dead_tup DESC
                LIMIT 50
            "#,
            InstanceScope::WriterOnly,
            DatabaseScope::AllUserDatabases,
            70,
            true,
        ),
        def(
            "connection_saturation",
            "Connection saturation",
            r#"
                SELECT
                    current_setting('max_connections')::int as max_connections,
                    count(*) as connections,
                    round(count(*) * 100.0 / current_setting('max_connections')::int, 1) as used_pct
                FROM pg_stat_activity
            "#,
            InstanceScope::AllInstances,
            DatabaseScope::Configured,
            80,
            false,
        ),
    ])
}
