//! Scripted connection provider for tests and demos.
//!
//! Mirrors the real provider's contract without any network: targets can be
//! refused outright, and queries are answered by substring-matched rules.
//! Connect/close counters make release semantics assertable.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::connect::{Connection, ConnectionProvider, ResultSet, TargetSpec};
use crate::error::{ConnectPhase, ConnectionError, QueryError};

struct Rule {
    /// Only applies to targets whose label contains this, when set.
    target_contains: Option<String>,
    sql_contains: String,
    outcome: Result<ResultSet, String>,
}

#[derive(Default)]
struct Script {
    refuse: Vec<String>,
    rules: Vec<Rule>,
}

/// [`ConnectionProvider`] with scripted responses.
#[derive(Default)]
pub struct MockConnectionProvider {
    script: Arc<Mutex<Script>>,
    connects: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
    connected_labels: Arc<Mutex<Vec<String>>>,
}

impl MockConnectionProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse connections to targets whose label contains `label_part`.
    pub fn refuse_target(self, label_part: &str) -> Self {
        self.script
            .lock()
            .unwrap()
            .refuse
            .push(label_part.to_string());
        self
    }

    /// Answer queries containing `sql_part` with `result`, on any target.
    pub fn on_query(self, sql_part: &str, result: ResultSet) -> Self {
        self.script.lock().unwrap().rules.push(Rule {
            target_contains: None,
            sql_contains: sql_part.to_string(),
            outcome: Ok(result),
        });
        self
    }

    /// Like [`Self::on_query`], restricted to targets whose label contains
    /// `label_part`.
    pub fn on_target_query(self, label_part: &str, sql_part: &str, result: ResultSet) -> Self {
        self.script.lock().unwrap().rules.push(Rule {
            target_contains: Some(label_part.to_string()),
            sql_contains: sql_part.to_string(),
            outcome: Ok(result),
        });
        self
    }

    /// Fail queries containing `sql_part` with `message`.
    pub fn fail_query(self, sql_part: &str, message: &str) -> Self {
        self.script.lock().unwrap().rules.push(Rule {
            target_contains: None,
            sql_contains: sql_part.to_string(),
            outcome: Err(message.to_string()),
        });
        self
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Labels of all successfully connected targets, in connect order.
    pub fn connected_labels(&self) -> Vec<String> {
        self.connected_labels.lock().unwrap().clone()
    }
}

/// Builds a [`ResultSet`] from string literals.
pub fn table(columns: &[&str], rows: &[&[&str]]) -> ResultSet {
    ResultSet {
        columns: columns.iter().map(|c| c.to_string()).collect(),
        rows: rows
            .iter()
            .map(|r| r.iter().map(|v| Some(v.to_string())).collect())
            .collect(),
    }
}

#[async_trait]
impl ConnectionProvider for MockConnectionProvider {
    async fn connect(&self, target: &TargetSpec) -> Result<Box<dyn Connection>, ConnectionError> {
        {
            let script = self.script.lock().unwrap();
            if script.refuse.iter().any(|p| target.label.contains(p)) {
                return Err(ConnectionError {
                    target: target.label.clone(),
                    phase: ConnectPhase::Database,
                    message: "connection refused".to_string(),
                });
            }
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.connected_labels
            .lock()
            .unwrap()
            .push(target.label.clone());
        Ok(Box::new(MockConnection {
            label: target.label.clone(),
            script: Arc::clone(&self.script),
            closes: Arc::clone(&self.closes),
        }))
    }
}

struct MockConnection {
    label: String,
    script: Arc<Mutex<Script>>,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl Connection for MockConnection {
    async fn query(&mut self, sql: &str) -> Result<ResultSet, QueryError> {
        let script = self.script.lock().unwrap();
        for rule in &script.rules {
            if !sql.contains(&rule.sql_contains) {
                continue;
            }
            if let Some(ref part) = rule.target_contains {
                if !self.label.contains(part) {
                    continue;
                }
            }
            return match &rule.outcome {
                Ok(result) => Ok(result.clone()),
                Err(message) => Err(QueryError::new(message.clone())),
            };
        }
        // Unscripted queries succeed with no rows.
        Ok(ResultSet::default())
    }

    async fn close(self: Box<Self>) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}
