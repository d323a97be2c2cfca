//! Periodic statement monitoring sessions.
//!
//! One background task per monitored database samples `pg_stat_statements`
//! on a fixed interval, normalizes the raw statements and upserts them into
//! the observation store. A registry keyed by database rejects duplicate
//! starts, so at most one sampling loop runs per database.
//!
//! Connections are per-cycle: open, sample, close. Cycle failures are logged
//! and the session carries on; only an explicit stop, a deactivated record or
//! a passed scheduled end terminates the loop.

pub mod sampler;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::connect::ConnectionProvider;
use crate::error::{MonitorError, SampleError};
use crate::model::{DatabaseId, SessionId};
use crate::normalize::{normalize_and_hash, signature};
use crate::repo::{Inventory, SessionStore};
use crate::store::{ObservationStore, Upsert};

use sampler::{DEFAULT_STATEMENT_LIMIT, sample_statements};

/// Persistent state of one monitoring session.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: SessionId,
    pub database_id: DatabaseId,
    pub active: bool,
    pub requested_by: String,
    pub interval_secs: u64,
    /// When set, the loop stops on its own once this time has passed.
    pub scheduled_end: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
}

/// Externally visible session state.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub active: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub scheduled_end: Option<DateTime<Utc>>,
}

struct ActiveSession {
    session_id: SessionId,
    cancel: CancellationToken,
    #[allow(dead_code)]
    task: JoinHandle<()>,
}

/// Outcome of one sampling cycle.
enum Cycle {
    /// Rest for the given duration, then run again.
    Continue(Duration),
    Stop,
}

/// Owns the session registry and the per-database sampling loops.
pub struct Monitor {
    inventory: Arc<dyn Inventory>,
    sessions: Arc<dyn SessionStore>,
    store: Arc<dyn ObservationStore>,
    provider: Arc<dyn ConnectionProvider>,
    registry: DashMap<DatabaseId, ActiveSession>,
    statement_limit: usize,
}

impl Monitor {
    pub fn new(
        inventory: Arc<dyn Inventory>,
        sessions: Arc<dyn SessionStore>,
        store: Arc<dyn ObservationStore>,
        provider: Arc<dyn ConnectionProvider>,
    ) -> Self {
        Self {
            inventory,
            sessions,
            store,
            provider,
            registry: DashMap::new(),
            statement_limit: DEFAULT_STATEMENT_LIMIT,
        }
    }

    pub fn with_statement_limit(mut self, limit: usize) -> Self {
        self.statement_limit = limit;
        self
    }

    /// Start monitoring a database.
    ///
    /// Reuses the database's session record when one exists. Returns
    /// [`MonitorError::AlreadyMonitoring`] when a loop for this database is
    /// already registered.
    pub fn start(
        self: &Arc<Self>,
        database_id: DatabaseId,
        requested_by: &str,
        interval: Duration,
        scheduled_end: Option<DateTime<Utc>>,
    ) -> Result<SessionId, MonitorError> {
        if self.inventory.database_target(database_id).is_none() {
            return Err(MonitorError::UnknownDatabase(database_id));
        }

        // The registry entry is the mutual-exclusion point: holding the
        // vacant entry while spawning makes a concurrent duplicate start
        // observe it as occupied.
        match self.registry.entry(database_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(MonitorError::AlreadyMonitoring(database_id))
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let record = self.sessions.create_or_reactivate(
                    database_id,
                    requested_by,
                    interval.as_secs(),
                    scheduled_end,
                    Utc::now(),
                );
                let session_id = record.id;
                let cancel = CancellationToken::new();
                let task = tokio::spawn(
                    Arc::clone(self).run_loop(database_id, session_id, cancel.clone()),
                );
                vacant.insert(ActiveSession {
                    session_id,
                    cancel,
                    task,
                });
                info!(
                    database = %database_id,
                    session = %session_id,
                    requested_by,
                    interval_secs = interval.as_secs(),
                    "monitoring session started"
                );
                Ok(session_id)
            }
        }
    }

    /// Stop a session: deactivate its record, then wake and cancel its loop.
    pub fn stop(&self, session_id: SessionId) -> Result<(), MonitorError> {
        let record = self
            .sessions
            .get(session_id)
            .ok_or(MonitorError::UnknownSession(session_id))?;

        // Deactivate first so a cycle racing with the stop sees the flag.
        self.sessions.set_active(session_id, false);

        if let Some(active) = self.registry.get(&record.database_id)
            && active.session_id == session_id
        {
            active.cancel.cancel();
        }
        info!(database = %record.database_id, session = %session_id, "monitoring session stopped");
        Ok(())
    }

    pub fn status(&self, session_id: SessionId) -> Result<SessionStatus, MonitorError> {
        let record = self
            .sessions
            .get(session_id)
            .ok_or(MonitorError::UnknownSession(session_id))?;
        Ok(SessionStatus {
            active: record.active,
            last_run_at: record.last_run_at,
            scheduled_end: record.scheduled_end,
        })
    }

    async fn run_loop(
        self: Arc<Self>,
        database_id: DatabaseId,
        session_id: SessionId,
        cancel: CancellationToken,
    ) {
        loop {
            match self.run_cycle(database_id, session_id).await {
                Cycle::Stop => break,
                Cycle::Continue(rest) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(rest) => {}
                    }
                }
            }
        }
        self.registry
            .remove_if(&database_id, |_, active| active.session_id == session_id);
        info!(database = %database_id, session = %session_id, "sampling loop exited");
    }

    /// One sampling cycle. Re-reads the session record so external state
    /// changes (deactivation, rescheduling, interval edits) take effect at the
    /// next cycle boundary.
    async fn run_cycle(&self, database_id: DatabaseId, session_id: SessionId) -> Cycle {
        let Some(record) = self.sessions.get(session_id) else {
            return Cycle::Stop;
        };
        if !record.active {
            return Cycle::Stop;
        }
        let now = Utc::now();
        if let Some(end) = record.scheduled_end
            && now >= end
        {
            self.sessions.set_active(session_id, false);
            info!(database = %database_id, session = %session_id, "scheduled end reached");
            return Cycle::Stop;
        }
        let rest = Duration::from_secs(record.interval_secs.max(1));

        let clock = std::time::Instant::now();

        let Some(target) = self.inventory.database_target(database_id) else {
            // The database was deleted out from under the session.
            warn!(database = %database_id, "monitored database no longer exists");
            self.sessions.set_active(session_id, false);
            return Cycle::Stop;
        };

        let mut conn = match self.provider.connect(&target).await {
            Ok(conn) => conn,
            Err(e) => {
                // Self-healing: the target may come back before the next cycle.
                warn!(database = %database_id, error = %e, "sampling cycle skipped");
                self.sessions.set_last_run(session_id, now);
                return Cycle::Continue(rest);
            }
        };

        let outcome = sample_statements(conn.as_mut(), self.statement_limit).await;
        conn.close().await;

        match outcome {
            Ok(observations) => {
                let statements = observations.len();
                let mut inserted = 0usize;
                let mut updated = 0usize;
                for obs in observations {
                    let (canonical, sig) = normalize_and_hash(&obs.query);
                    let (canonical_id, upsert) =
                        self.store
                            .upsert_canonical(database_id, &canonical, &sig, now);
                    match upsert {
                        Upsert::Inserted => inserted += 1,
                        Upsert::Updated => updated += 1,
                    }
                    let raw_hash = signature(&obs.query);
                    if let Err(e) =
                        self.store
                            .upsert_sample(canonical_id, &obs.query, &raw_hash, obs.stats, now)
                    {
                        warn!(database = %database_id, error = %e, "sample upsert failed");
                    }
                }
                info!(
                    database = %database_id,
                    statements,
                    inserted,
                    updated,
                    duration_ms = clock.elapsed().as_millis() as u64,
                    "sampling cycle complete"
                );
            }
            Err(SampleError::ExtensionUnavailable) => {
                warn!(
                    database = %database_id,
                    "pg_stat_statements not installed, cycle skipped"
                );
            }
            Err(SampleError::Query(e)) => {
                warn!(database = %database_id, error = %e, "sampling query failed");
            }
        }

        self.sessions.set_last_run(session_id, now);
        Cycle::Continue(rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connect::TargetSpec;
    use crate::mock::{MockConnectionProvider, table};
    use crate::repo::{MemoryInventory, MemorySessionStore};
    use crate::store::{MemoryObservationStore, StatementFilter};

    fn target(label: &str) -> TargetSpec {
        TargetSpec {
            label: label.to_string(),
            host: label.to_string(),
            port: 5432,
            username: "app".to_string(),
            password: String::new(),
            dbname: "main".to_string(),
            tunnel: None,
        }
    }

    struct Fixture {
        monitor: Arc<Monitor>,
        provider: Arc<MockConnectionProvider>,
        sessions: Arc<MemorySessionStore>,
        store: Arc<MemoryObservationStore>,
        database_id: DatabaseId,
    }

    fn fixture(provider: MockConnectionProvider) -> Fixture {
        let inventory = Arc::new(MemoryInventory::new());
        let database_id = inventory.add_database(target("db-1"));
        let sessions = Arc::new(MemorySessionStore::new());
        let store = Arc::new(MemoryObservationStore::new());
        let provider = Arc::new(provider);
        let monitor = Arc::new(Monitor::new(
            inventory,
            Arc::clone(&sessions) as Arc<dyn SessionStore>,
            Arc::clone(&store) as Arc<dyn ObservationStore>,
            Arc::clone(&provider) as Arc<dyn ConnectionProvider>,
        ));
        Fixture {
            monitor,
            provider,
            sessions,
            store,
            database_id,
        }
    }

    fn extension_present() -> MockConnectionProvider {
        MockConnectionProvider::new()
            .on_query("pg_extension", table(&["extversion"], &[&["1.10"]]))
            .on_query("server_version_num", table(&["server_version_num"], &[&["150004"]]))
    }

    fn stats_rows(rows: &[&[&str]]) -> crate::connect::ResultSet {
        table(
            &[
                "query",
                "calls",
                "total_exec_time",
                "mean_exec_time",
                "min_exec_time",
                "max_exec_time",
            ],
            rows,
        )
    }

    #[tokio::test]
    async fn unknown_database_is_rejected() {
        let f = fixture(MockConnectionProvider::new());
        let err = f
            .monitor
            .start(DatabaseId::new(), "alice", Duration::from_secs(60), None)
            .err()
            .unwrap();
        assert!(matches!(err, MonitorError::UnknownDatabase(_)));
    }

    #[tokio::test]
    async fn duplicate_start_is_rejected() {
        let f = fixture(MockConnectionProvider::new());
        let first = f
            .monitor
            .start(f.database_id, "alice", Duration::from_secs(3600), None)
            .unwrap();
        let err = f
            .monitor
            .start(f.database_id, "bob", Duration::from_secs(60), None)
            .err()
            .unwrap();
        assert!(matches!(err, MonitorError::AlreadyMonitoring(_)));
        f.monitor.stop(first).unwrap();
    }

    #[tokio::test]
    async fn stop_flips_status_immediately() {
        let f = fixture(MockConnectionProvider::new());
        let session = f
            .monitor
            .start(f.database_id, "alice", Duration::from_secs(3600), None)
            .unwrap();
        assert!(f.monitor.status(session).unwrap().active);

        f.monitor.stop(session).unwrap();
        assert!(!f.monitor.status(session).unwrap().active);
    }

    #[tokio::test]
    async fn cycle_upserts_sampled_statements() {
        let provider = extension_present().on_query(
            "pg_stat_statements",
            stats_rows(&[
                &["SELECT * FROM users WHERE id = 1", "10", "50.0", "5.0", "1.0", "9.0"],
                &["SELECT * FROM users WHERE id = 2", "4", "12.0", "3.0", "2.0", "4.0"],
            ]),
        );
        let f = fixture(provider);
        let record = f.sessions.create_or_reactivate(
            f.database_id,
            "alice",
            60,
            None,
            Utc::now(),
        );

        let cycle = f.monitor.run_cycle(f.database_id, record.id).await;
        assert!(matches!(cycle, Cycle::Continue(_)));

        // Both raws normalize to the same canonical statement.
        let views = f.store.query(f.database_id, &StatementFilter::default());
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].sample_count, 2);
        assert_eq!(views[0].calls, 14);
        assert!(f.sessions.get(record.id).unwrap().last_run_at.is_some());
    }

    #[tokio::test]
    async fn missing_extension_keeps_session_alive() {
        // No pg_extension rule: the availability probe returns no rows.
        let f = fixture(MockConnectionProvider::new());
        let record = f.sessions.create_or_reactivate(
            f.database_id,
            "alice",
            60,
            None,
            Utc::now(),
        );

        let cycle = f.monitor.run_cycle(f.database_id, record.id).await;
        assert!(matches!(cycle, Cycle::Continue(_)));
        assert!(f.store.query(f.database_id, &StatementFilter::default()).is_empty());
        assert!(f.sessions.get(record.id).unwrap().active);
    }

    #[tokio::test]
    async fn connect_failure_skips_cycle_without_stopping() {
        let f = fixture(MockConnectionProvider::new().refuse_target("db-1"));
        let record = f.sessions.create_or_reactivate(
            f.database_id,
            "alice",
            60,
            None,
            Utc::now(),
        );

        let cycle = f.monitor.run_cycle(f.database_id, record.id).await;
        assert!(matches!(cycle, Cycle::Continue(_)));
        assert!(f.sessions.get(record.id).unwrap().active);
        assert_eq!(f.provider.connect_count(), 0);
    }

    #[tokio::test]
    async fn connection_is_released_when_sampling_fails() {
        let provider = extension_present().fail_query("pg_stat_statements", "relation vanished");
        let f = fixture(provider);
        let record = f.sessions.create_or_reactivate(
            f.database_id,
            "alice",
            60,
            None,
            Utc::now(),
        );

        f.monitor.run_cycle(f.database_id, record.id).await;
        assert_eq!(f.provider.connect_count(), 1);
        assert_eq!(f.provider.close_count(), 1);
        assert!(f.sessions.get(record.id).unwrap().active);
    }

    #[tokio::test]
    async fn deactivated_record_stops_the_cycle() {
        let f = fixture(extension_present());
        let record = f.sessions.create_or_reactivate(
            f.database_id,
            "alice",
            60,
            None,
            Utc::now(),
        );
        f.sessions.set_active(record.id, false);

        let cycle = f.monitor.run_cycle(f.database_id, record.id).await;
        assert!(matches!(cycle, Cycle::Stop));
        assert_eq!(f.provider.connect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_loop_schedules_no_further_cycles() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let f = fixture(extension_present());
        let session = f
            .monitor
            .start(f.database_id, "alice", Duration::from_secs(60), None)
            .unwrap();

        // Virtual time: the first cycle runs immediately, then one per minute.
        tokio::time::sleep(Duration::from_secs(150)).await;
        let before_stop = f.provider.connect_count();
        assert!(before_stop >= 2);

        f.monitor.stop(session).unwrap();
        for _ in 0..50 {
            if !f.monitor.registry.contains_key(&f.database_id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!f.monitor.registry.contains_key(&f.database_id));

        let settled = f.provider.connect_count();
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(f.provider.connect_count(), settled);
        assert!(!f.monitor.status(session).unwrap().active);
    }

    #[tokio::test]
    async fn passed_scheduled_end_stops_without_connecting() {
        let f = fixture(MockConnectionProvider::new());
        let past = Utc::now() - chrono::Duration::hours(1);
        let record = f.sessions.create_or_reactivate(
            f.database_id,
            "alice",
            60,
            Some(past),
            Utc::now(),
        );

        let cycle = f.monitor.run_cycle(f.database_id, record.id).await;
        assert!(matches!(cycle, Cycle::Stop));
        assert!(!f.sessions.get(record.id).unwrap().active);
        assert_eq!(f.provider.connect_count(), 0);
    }

    #[tokio::test]
    async fn restart_after_stop_reuses_the_session_record() {
        let f = fixture(MockConnectionProvider::new());
        let first = f
            .monitor
            .start(f.database_id, "alice", Duration::from_secs(3600), None)
            .unwrap();
        f.monitor.stop(first).unwrap();
        // Loop exit is async; wait for the registry slot to clear.
        for _ in 0..50 {
            if !f.monitor.registry.contains_key(&f.database_id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let second = f
            .monitor
            .start(f.database_id, "bob", Duration::from_secs(60), None)
            .unwrap();
        assert_eq!(first, second);
        assert!(f.monitor.status(second).unwrap().active);
        f.monitor.stop(second).unwrap();
    }
}
