//! On-demand cluster health checks.
//!
//! A run fans the catalog's active definitions out across the cluster's
//! instances (and, for per-database checks, across every user database of the
//! writer), collecting one structured result per (check, target) pair and a
//! markdown report. Target-level failures are isolated into error results;
//! only catalog-level preconditions fail a run, and a failed run records zero
//! results.

pub mod catalog;
pub mod report;

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::connect::{Connection, ConnectionProvider, ResultSet, TargetSpec, list_user_databases};
use crate::error::CatalogError;
use crate::model::{ClusterId, ExecutionId, Instance};
use crate::repo::{ExecutionStore, Inventory};

use catalog::{CatalogSource, DatabaseScope, HealthCheckDefinition, InstanceScope};
use report::{ReportBuilder, failure_report};

/// Lifecycle state of one health-check run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
}

/// Outcome severity of one (check, target) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckStatus {
    Success,
    /// The check ran and flagged rows.
    Warning,
    /// The target could not be reached or the check's query failed.
    Error,
}

/// Query output retained with a result, every cell rendered as text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl ResultTable {
    fn from_result_set(rs: &ResultSet) -> Self {
        Self {
            columns: rs.columns.clone(),
            rows: rs
                .rows
                .iter()
                .map(|row| {
                    row.iter()
                        .map(|cell| cell.clone().unwrap_or_default())
                        .collect()
                })
                .collect(),
        }
    }
}

/// One check's outcome on one target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub check_name: String,
    pub check_title: String,
    /// The connection target the check ran against.
    pub target: String,
    pub status: CheckStatus,
    /// Error cause, or a short note for warnings. Empty on plain success.
    pub message: String,
    pub row_count: usize,
    pub duration_ms: u64,
    pub table: Option<ResultTable>,
}

/// Record of one run, as persisted by the [`ExecutionStore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckExecution {
    pub id: ExecutionId,
    pub cluster_id: ClusterId,
    pub requested_by: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub markdown: String,
    pub results: Vec<CheckResult>,
}

/// Runs catalog checks against clusters.
pub struct HealthCheckEngine {
    inventory: Arc<dyn Inventory>,
    catalog: Arc<dyn CatalogSource>,
    executions: Arc<dyn ExecutionStore>,
    provider: Arc<dyn ConnectionProvider>,
}

impl HealthCheckEngine {
    pub fn new(
        inventory: Arc<dyn Inventory>,
        catalog: Arc<dyn CatalogSource>,
        executions: Arc<dyn ExecutionStore>,
        provider: Arc<dyn ConnectionProvider>,
    ) -> Self {
        Self {
            inventory,
            catalog,
            executions,
            provider,
        }
    }

    /// Start a run for `cluster_id` and return its execution id immediately;
    /// the checks proceed in a background task.
    pub fn execute(
        self: &Arc<Self>,
        cluster_id: ClusterId,
        requested_by: &str,
    ) -> Result<ExecutionId, CatalogError> {
        let cluster = self
            .inventory
            .cluster(cluster_id)
            .ok_or(CatalogError::ClusterNotFound(cluster_id))?;

        let execution = self.executions.create(cluster_id, requested_by, Utc::now());
        info!(
            cluster = %cluster.name,
            execution = %execution.id,
            requested_by,
            "health check started"
        );

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.run(execution.id, cluster.name, cluster_id, execution.started_at).await;
        });
        Ok(execution.id)
    }

    async fn run(
        &self,
        execution_id: ExecutionId,
        cluster_name: String,
        cluster_id: ClusterId,
        started_at: DateTime<Utc>,
    ) {
        match self.run_inner(&cluster_name, cluster_id, started_at).await {
            Ok((markdown, results)) => {
                let errors = results
                    .iter()
                    .filter(|r| r.status == CheckStatus::Error)
                    .count();
                info!(
                    cluster = %cluster_name,
                    execution = %execution_id,
                    results = results.len(),
                    errors,
                    "health check complete"
                );
                self.executions
                    .complete(execution_id, markdown, results, Utc::now());
            }
            Err(e) => {
                warn!(cluster = %cluster_name, execution = %execution_id, error = %e, "health check failed");
                let markdown = failure_report(&cluster_name, started_at, &e.to_string());
                self.executions.fail(execution_id, markdown, Utc::now());
            }
        }
    }

    async fn run_inner(
        &self,
        cluster_name: &str,
        cluster_id: ClusterId,
        started_at: DateTime<Utc>,
    ) -> Result<(String, Vec<CheckResult>), CatalogError> {
        let mut definitions: Vec<HealthCheckDefinition> = self
            .catalog
            .definitions()
            .into_iter()
            .filter(|d| d.active)
            .collect();
        if definitions.is_empty() {
            return Err(CatalogError::NoActiveDefinitions);
        }
        definitions.sort_by_key(|d| d.order);

        let instances = self.inventory.cluster_instances(cluster_id);
        let writer = instances.iter().find(|i| i.writer).cloned();

        // Precondition before any check runs, so a failed run has no partial
        // results.
        let needs_writer = definitions
            .iter()
            .any(|d| d.instance_scope == InstanceScope::WriterOnly);
        if needs_writer && writer.is_none() {
            return Err(CatalogError::NoWriter(cluster_id));
        }

        let mut builder = ReportBuilder::new(cluster_name, started_at);
        let mut results = Vec::new();

        for definition in &definitions {
            builder.begin_check(&definition.title);

            let targets: Vec<&Instance> = match definition.instance_scope {
                InstanceScope::WriterOnly => writer.iter().collect(),
                InstanceScope::AllInstances => instances.iter().collect(),
            };

            for instance in targets {
                for result in self.run_on_instance(definition, instance).await {
                    builder.add_result(&result);
                    results.push(result);
                }
            }
        }

        Ok((builder.finish(), results))
    }

    /// All results of one definition on one instance: a single result for
    /// configured-database checks, one per user database otherwise.
    async fn run_on_instance(
        &self,
        definition: &HealthCheckDefinition,
        instance: &Instance,
    ) -> Vec<CheckResult> {
        let base = TargetSpec::for_instance(instance);
        match definition.database_scope {
            DatabaseScope::Configured => {
                vec![self.run_on_target(definition, &base).await]
            }
            DatabaseScope::AllUserDatabases => {
                let databases = match self.enumerate_databases(&base).await {
                    Ok(databases) => databases,
                    Err(message) => {
                        // Enumeration failure yields a single error result for
                        // the instance.
                        return vec![error_result(definition, &base.label, message)];
                    }
                };
                let mut results = Vec::with_capacity(databases.len());
                for dbname in databases {
                    let target = base.with_database(&dbname);
                    results.push(self.run_on_target(definition, &target).await);
                }
                results
            }
        }
    }

    async fn enumerate_databases(&self, target: &TargetSpec) -> Result<Vec<String>, String> {
        let mut conn = self
            .provider
            .connect(target)
            .await
            .map_err(|e| e.to_string())?;
        let outcome = list_user_databases(conn.as_mut()).await;
        conn.close().await;
        outcome.map_err(|e| e.to_string())
    }

    async fn run_on_target(
        &self,
        definition: &HealthCheckDefinition,
        target: &TargetSpec,
    ) -> CheckResult {
        let clock = Instant::now();
        let mut conn = match self.provider.connect(target).await {
            Ok(conn) => conn,
            Err(e) => return error_result(definition, &target.label, e.to_string()),
        };
        let outcome = run_query(definition, target, conn.as_mut(), clock).await;
        conn.close().await;
        outcome
    }
}

async fn run_query(
    definition: &HealthCheckDefinition,
    target: &TargetSpec,
    conn: &mut dyn Connection,
    clock: Instant,
) -> CheckResult {
    match conn.query(&definition.sql).await {
        Ok(rs) => {
            let row_count = rs.rows.len();
            let (status, message) = if definition.warn_on_rows && row_count > 0 {
                (CheckStatus::Warning, format!("{row_count} rows flagged"))
            } else {
                (CheckStatus::Success, String::new())
            };
            CheckResult {
                check_name: definition.name.clone(),
                check_title: definition.title.clone(),
                target: target.label.clone(),
                status,
                message,
                row_count,
                duration_ms: clock.elapsed().as_millis() as u64,
                table: Some(ResultTable::from_result_set(&rs)),
            }
        }
        Err(e) => {
            warn!(check = %definition.name, target = %target.label, error = %e, "check query failed");
            error_result(definition, &target.label, e.to_string())
        }
    }
}

fn error_result(
    definition: &HealthCheckDefinition,
    target_label: &str,
    message: String,
) -> CheckResult {
    CheckResult {
        check_name: definition.name.clone(),
        check_title: definition.title.clone(),
        target: target_label.to_string(),
        status: CheckStatus::Error,
        message,
        row_count: 0,
        duration_ms: 0,
        table: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use super::catalog::StaticCatalog;

    use crate::mock::{MockConnectionProvider, table};
    use crate::model::InstanceId;
    use crate::repo::{MemoryExecutionStore, MemoryInventory};

    fn check(
        name: &str,
        sql_marker: &str,
        instance_scope: InstanceScope,
        database_scope: DatabaseScope,
        warn_on_rows: bool,
    ) -> HealthCheckDefinition {
        HealthCheckDefinition {
            name: name.to_string(),
            title: name.replace('_', " "),
            sql: format!("SELECT 1 /* {sql_marker} */"),
            instance_scope,
            database_scope,
            order: 10,
            active: true,
            warn_on_rows,
        }
    }

    fn instance(inventory: &MemoryInventory, cluster: ClusterId, host: &str, writer: bool) {
        inventory.add_instance(Instance {
            id: InstanceId::new(),
            cluster_id: cluster,
            host: host.to_string(),
            port: 5432,
            username: "app".to_string(),
            password: String::new(),
            database: "postgres".to_string(),
            writer,
            tunnel: None,
        });
    }

    struct Fixture {
        engine: Arc<HealthCheckEngine>,
        executions: Arc<MemoryExecutionStore>,
        provider: Arc<MockConnectionProvider>,
        cluster_id: ClusterId,
    }

    fn fixture(
        provider: MockConnectionProvider,
        checks: Vec<HealthCheckDefinition>,
        hosts: &[(&str, bool)],
    ) -> Fixture {
        let inventory = Arc::new(MemoryInventory::new());
        let cluster = inventory.add_cluster("prod");
        for (host, writer) in hosts {
            instance(&inventory, cluster.id, host, *writer);
        }
        let executions = Arc::new(MemoryExecutionStore::new());
        let provider = Arc::new(provider);
        let engine = Arc::new(HealthCheckEngine::new(
            inventory,
            Arc::new(StaticCatalog::new(checks)),
            Arc::clone(&executions) as Arc<dyn ExecutionStore>,
            Arc::clone(&provider) as Arc<dyn ConnectionProvider>,
        ));
        Fixture {
            engine,
            executions,
            provider,
            cluster_id: cluster.id,
        }
    }

    async fn finished(f: &Fixture, id: ExecutionId) -> HealthCheckExecution {
        for _ in 0..100 {
            let execution = f.executions.get(id).unwrap();
            if execution.status != ExecutionStatus::Running {
                return execution;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("execution did not finish");
    }

    #[tokio::test]
    async fn unknown_cluster_is_rejected_synchronously() {
        let f = fixture(MockConnectionProvider::new(), vec![], &[]);
        let err = f.engine.execute(ClusterId::new(), "alice").err().unwrap();
        assert!(matches!(err, CatalogError::ClusterNotFound(_)));
    }

    #[tokio::test]
    async fn unreachable_instance_is_isolated_into_an_error_result() {
        let provider = MockConnectionProvider::new().refuse_target("db-b");
        let checks = vec![check(
            "connection_saturation",
            "activity",
            InstanceScope::AllInstances,
            DatabaseScope::Configured,
            false,
        )];
        let f = fixture(
            provider,
            checks,
            &[("db-a", true), ("db-b", false), ("db-c", false)],
        );

        let id = f.engine.execute(f.cluster_id, "alice").unwrap();
        let execution = finished(&f, id).await;

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.results.len(), 3);
        let failed: Vec<_> = execution
            .results
            .iter()
            .filter(|r| r.status == CheckStatus::Error)
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].target, "db-b:5432");
        assert!(execution.markdown.contains("### db-b:5432"));
        assert!(execution.markdown.contains("Status: ERROR"));
    }

    #[tokio::test]
    async fn missing_writer_fails_the_run_with_no_results() {
        let checks = vec![check(
            "wraparound_risk",
            "datfrozenxid",
            InstanceScope::WriterOnly,
            DatabaseScope::Configured,
            true,
        )];
        let f = fixture(MockConnectionProvider::new(), checks, &[("db-a", false)]);

        let id = f.engine.execute(f.cluster_id, "alice").unwrap();
        let execution = finished(&f, id).await;

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(execution.results.is_empty());
        assert!(execution.markdown.contains("Run failed:"));
        assert!(execution.markdown.contains("no writer instance"));
    }

    #[tokio::test]
    async fn no_active_definitions_fails_the_run() {
        let mut inactive = check(
            "wraparound_risk",
            "datfrozenxid",
            InstanceScope::WriterOnly,
            DatabaseScope::Configured,
            true,
        );
        inactive.active = false;
        let f = fixture(MockConnectionProvider::new(), vec![inactive], &[("db-a", true)]);

        let id = f.engine.execute(f.cluster_id, "alice").unwrap();
        let execution = finished(&f, id).await;
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(execution.results.is_empty());
    }

    #[tokio::test]
    async fn flagged_rows_become_warnings() {
        let provider = MockConnectionProvider::new().on_query(
            "long_transactions",
            table(&["pid", "xact_age_s"], &[&["101", "900"], &["102", "340"]]),
        );
        let checks = vec![check(
            "long_transactions",
            "long_transactions",
            InstanceScope::AllInstances,
            DatabaseScope::Configured,
            true,
        )];
        let f = fixture(provider, checks, &[("db-a", true)]);

        let id = f.engine.execute(f.cluster_id, "alice").unwrap();
        let execution = finished(&f, id).await;

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.results.len(), 1);
        let result = &execution.results[0];
        assert_eq!(result.status, CheckStatus::Warning);
        assert_eq!(result.row_count, 2);
        assert!(execution.markdown.contains("Status: WARNING"));
        assert!(execution.markdown.contains("| pid | xact_age_s |"));
        assert!(execution.markdown.contains("| 101 | 900 |"));
    }

    #[tokio::test]
    async fn per_database_checks_fan_out_over_user_databases() {
        let provider = MockConnectionProvider::new()
            .on_query(
                "pg_database",
                table(&["datname"], &[&["app"], &["reporting"]]),
            )
            .on_target_query("/app", "unused_indexes", table(&["indexrelname"], &[]))
            .on_target_query("/reporting", "unused_indexes", table(&["indexrelname"], &[]));
        let checks = vec![check(
            "unused_indexes",
            "unused_indexes",
            InstanceScope::WriterOnly,
            DatabaseScope::AllUserDatabases,
            true,
        )];
        let f = fixture(provider, checks, &[("db-a", true), ("db-b", false)]);

        let id = f.engine.execute(f.cluster_id, "alice").unwrap();
        let execution = finished(&f, id).await;

        assert_eq!(execution.status, ExecutionStatus::Completed);
        let targets: Vec<&str> = execution.results.iter().map(|r| r.target.as_str()).collect();
        assert_eq!(targets, vec!["db-a:5432/app", "db-a:5432/reporting"]);
        assert!(execution
            .results
            .iter()
            .all(|r| r.status == CheckStatus::Success));
    }

    #[tokio::test]
    async fn enumeration_failure_yields_one_error_for_the_instance() {
        let provider = MockConnectionProvider::new().fail_query("pg_database", "permission denied");
        let checks = vec![check(
            "invalid_indexes",
            "indisvalid",
            InstanceScope::WriterOnly,
            DatabaseScope::AllUserDatabases,
            true,
        )];
        let f = fixture(provider, checks, &[("db-a", true)]);

        let id = f.engine.execute(f.cluster_id, "alice").unwrap();
        let execution = finished(&f, id).await;

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.results.len(), 1);
        assert_eq!(execution.results[0].status, CheckStatus::Error);
        assert!(execution.results[0].message.contains("permission denied"));
    }

    #[tokio::test]
    async fn every_connection_is_released() {
        let provider = MockConnectionProvider::new().refuse_target("db-c");
        let checks = vec![check(
            "connection_saturation",
            "activity",
            InstanceScope::AllInstances,
            DatabaseScope::Configured,
            false,
        )];
        let f = fixture(provider, checks, &[("db-a", true), ("db-b", false), ("db-c", false)]);

        let id = f.engine.execute(f.cluster_id, "alice").unwrap();
        finished(&f, id).await;

        // db-c is refused before a connection exists; the two that connected
        // were both released.
        assert_eq!(f.provider.connect_count(), 2);
        assert_eq!(f.provider.close_count(), 2);
    }
}
