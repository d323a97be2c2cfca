//! Narrow persistence contracts consumed from the surrounding console.
//!
//! The console owns CRUD for clusters, instances, sessions and executions;
//! this crate only needs the operations below. The in-memory implementations
//! are the reference collaborators used by tests and embedders.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::connect::TargetSpec;
use crate::health::{CheckResult, ExecutionStatus, HealthCheckExecution};
use crate::model::{Cluster, ClusterId, DatabaseId, ExecutionId, Instance, SessionId};
use crate::monitor::SessionRecord;

/// Read access to the managed inventory: clusters, their instances, and the
/// connection targets of registered databases.
pub trait Inventory: Send + Sync {
    fn cluster(&self, id: ClusterId) -> Option<Cluster>;

    fn cluster_instances(&self, id: ClusterId) -> Vec<Instance>;

    fn database_target(&self, id: DatabaseId) -> Option<TargetSpec>;
}

/// Persistence of monitoring-session records.
pub trait SessionStore: Send + Sync {
    /// Reuse the database's existing session record (re-marking it active and
    /// refreshing its parameters) or create a new one.
    fn create_or_reactivate(
        &self,
        database_id: DatabaseId,
        requested_by: &str,
        interval_secs: u64,
        scheduled_end: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> SessionRecord;

    fn get(&self, id: SessionId) -> Option<SessionRecord>;

    fn set_active(&self, id: SessionId, active: bool);

    fn set_last_run(&self, id: SessionId, at: DateTime<Utc>);
}

/// Persistence of health-check executions.
pub trait ExecutionStore: Send + Sync {
    fn create(
        &self,
        cluster_id: ClusterId,
        requested_by: &str,
        now: DateTime<Utc>,
    ) -> HealthCheckExecution;

    fn get(&self, id: ExecutionId) -> Option<HealthCheckExecution>;

    fn complete(
        &self,
        id: ExecutionId,
        markdown: String,
        results: Vec<CheckResult>,
        finished_at: DateTime<Utc>,
    );

    fn fail(&self, id: ExecutionId, markdown: String, finished_at: DateTime<Utc>);
}

// ============================================================
// In-memory implementations
// ============================================================

#[derive(Default)]
struct InventoryInner {
    clusters: HashMap<ClusterId, Cluster>,
    instances: Vec<Instance>,
    databases: HashMap<DatabaseId, TargetSpec>,
}

/// In-memory [`Inventory`].
#[derive(Default)]
pub struct MemoryInventory {
    inner: Mutex<InventoryInner>,
}

impl MemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_cluster(&self, name: &str) -> Cluster {
        let cluster = Cluster {
            id: ClusterId::new(),
            name: name.to_string(),
        };
        self.inner
            .lock()
            .unwrap()
            .clusters
            .insert(cluster.id, cluster.clone());
        cluster
    }

    pub fn add_instance(&self, instance: Instance) {
        self.inner.lock().unwrap().instances.push(instance);
    }

    /// Register a monitorable database and return its identity.
    pub fn add_database(&self, target: TargetSpec) -> DatabaseId {
        let id = DatabaseId::new();
        self.inner.lock().unwrap().databases.insert(id, target);
        id
    }
}

impl Inventory for MemoryInventory {
    fn cluster(&self, id: ClusterId) -> Option<Cluster> {
        self.inner.lock().unwrap().clusters.get(&id).cloned()
    }

    fn cluster_instances(&self, id: ClusterId) -> Vec<Instance> {
        self.inner
            .lock()
            .unwrap()
            .instances
            .iter()
            .filter(|i| i.cluster_id == id)
            .cloned()
            .collect()
    }

    fn database_target(&self, id: DatabaseId) -> Option<TargetSpec> {
        self.inner.lock().unwrap().databases.get(&id).cloned()
    }
}

/// In-memory [`SessionStore`].
#[derive(Default)]
pub struct MemorySessionStore {
    inner: Mutex<HashMap<SessionId, SessionRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn create_or_reactivate(
        &self,
        database_id: DatabaseId,
        requested_by: &str,
        interval_secs: u64,
        scheduled_end: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> SessionRecord {
        let mut inner = self.inner.lock().unwrap();

        if let Some(record) = inner.values_mut().find(|r| r.database_id == database_id) {
            record.active = true;
            record.requested_by = requested_by.to_string();
            record.interval_secs = interval_secs;
            record.scheduled_end = scheduled_end;
            return record.clone();
        }

        let record = SessionRecord {
            id: SessionId::new(),
            database_id,
            active: true,
            requested_by: requested_by.to_string(),
            interval_secs,
            scheduled_end,
            last_run_at: None,
            started_at: now,
        };
        inner.insert(record.id, record.clone());
        record
    }

    fn get(&self, id: SessionId) -> Option<SessionRecord> {
        self.inner.lock().unwrap().get(&id).cloned()
    }

    fn set_active(&self, id: SessionId, active: bool) {
        if let Some(record) = self.inner.lock().unwrap().get_mut(&id) {
            record.active = active;
        }
    }

    fn set_last_run(&self, id: SessionId, at: DateTime<Utc>) {
        if let Some(record) = self.inner.lock().unwrap().get_mut(&id) {
            record.last_run_at = Some(at);
        }
    }
}

/// In-memory [`ExecutionStore`].
#[derive(Default)]
pub struct MemoryExecutionStore {
    inner: Mutex<HashMap<ExecutionId, HealthCheckExecution>>,
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExecutionStore for MemoryExecutionStore {
    fn create(
        &self,
        cluster_id: ClusterId,
        requested_by: &str,
        now: DateTime<Utc>,
    ) -> HealthCheckExecution {
        let execution = HealthCheckExecution {
            id: ExecutionId::new(),
            cluster_id,
            requested_by: requested_by.to_string(),
            status: ExecutionStatus::Running,
            started_at: now,
            finished_at: None,
            markdown: String::new(),
            results: Vec::new(),
        };
        self.inner
            .lock()
            .unwrap()
            .insert(execution.id, execution.clone());
        execution
    }

    fn get(&self, id: ExecutionId) -> Option<HealthCheckExecution> {
        self.inner.lock().unwrap().get(&id).cloned()
    }

    fn complete(
        &self,
        id: ExecutionId,
        markdown: String,
        results: Vec<CheckResult>,
        finished_at: DateTime<Utc>,
    ) {
        if let Some(execution) = self.inner.lock().unwrap().get_mut(&id) {
            execution.status = ExecutionStatus::Completed;
            execution.markdown = markdown;
            execution.results = results;
            execution.finished_at = Some(finished_at);
        }
    }

    fn fail(&self, id: ExecutionId, markdown: String, finished_at: DateTime<Utc>) {
        if let Some(execution) = self.inner.lock().unwrap().get_mut(&id) {
            execution.status = ExecutionStatus::Failed;
            execution.markdown = markdown;
            execution.finished_at = Some(finished_at);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_record_is_reused_per_database() {
        let store = MemorySessionStore::new();
        let db = DatabaseId::new();
        let now = Utc::now();

        let first = store.create_or_reactivate(db, "alice", 60, None, now);
        store.set_active(first.id, false);
        let second = store.create_or_reactivate(db, "bob", 30, None, now);

        assert_eq!(first.id, second.id);
        assert!(second.active);
        assert_eq!(second.interval_secs, 30);
        assert_eq!(second.requested_by, "bob");
    }

    #[test]
    fn executions_transition_running_to_completed() {
        let store = MemoryExecutionStore::new();
        let now = Utc::now();
        let execution = store.create(ClusterId::new(), "alice", now);
        assert_eq!(execution.status, ExecutionStatus::Running);

        store.complete(execution.id, "# report".to_string(), Vec::new(), now);
        let finished = store.get(execution.id).unwrap();
        assert_eq!(finished.status, ExecutionStatus::Completed);
        assert_eq!(finished.markdown, "# report");
        assert!(finished.finished_at.is_some());
    }
}
