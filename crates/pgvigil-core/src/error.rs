//! Error types for connection resolution, sampling, monitoring and health runs.
//!
//! Per-cycle and per-target errors are caught at their boundary and recorded
//! as structured results; only catalog-level preconditions propagate to the
//! caller of `execute`/`start`. Normalization has no error type at all — it
//! degrades to passthrough instead of failing.

use crate::model::{ClusterId, DatabaseId, SessionId};

/// Phase in which a connection attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectPhase {
    /// Establishing the SSH forwarding channel.
    Tunnel,
    /// Connecting to the database endpoint (possibly through the tunnel).
    Database,
}

/// Connection to a target could not be established.
///
/// Carries the target identity and the underlying cause; callers never see
/// raw protocol-level errors.
#[derive(Debug, Clone)]
pub struct ConnectionError {
    pub target: String,
    pub phase: ConnectPhase,
    pub message: String,
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.phase {
            ConnectPhase::Tunnel => write!(f, "tunnel to {}: {}", self.target, self.message),
            ConnectPhase::Database => write!(f, "connect to {}: {}", self.target, self.message),
        }
    }
}

impl std::error::Error for ConnectionError {}

/// A query on an established connection failed.
#[derive(Debug, Clone)]
pub struct QueryError {
    pub message: String,
}

impl QueryError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for QueryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "query error: {}", self.message)
    }
}

impl std::error::Error for QueryError {}

/// Statement sampling failed for one cycle.
#[derive(Debug, Clone)]
pub enum SampleError {
    /// `pg_stat_statements` is not installed on the target database.
    /// Degrades the cycle to a no-op; never fatal to the session.
    ExtensionUnavailable,
    /// The sampling query itself failed.
    Query(QueryError),
}

impl std::fmt::Display for SampleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SampleError::ExtensionUnavailable => {
                write!(f, "pg_stat_statements extension is not installed")
            }
            SampleError::Query(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for SampleError {}

/// Catalog-level precondition failure — fatal to a whole health-check run.
#[derive(Debug, Clone)]
pub enum CatalogError {
    ClusterNotFound(ClusterId),
    /// A writer-only definition exists but the cluster has no writer instance.
    NoWriter(ClusterId),
    NoActiveDefinitions,
}

impl std::fmt::Display for CatalogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CatalogError::ClusterNotFound(id) => write!(f, "cluster {} not found", id),
            CatalogError::NoWriter(id) => {
                write!(f, "cluster {} has no writer instance", id)
            }
            CatalogError::NoActiveDefinitions => write!(f, "no active health-check definitions"),
        }
    }
}

impl std::error::Error for CatalogError {}

/// Errors returned by the monitoring API surface.
#[derive(Debug, Clone)]
pub enum MonitorError {
    UnknownDatabase(DatabaseId),
    UnknownSession(SessionId),
    /// A session for this database is already running; duplicate starts are
    /// rejected instead of spawning a second interleaved sampling loop.
    AlreadyMonitoring(DatabaseId),
}

impl std::fmt::Display for MonitorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonitorError::UnknownDatabase(id) => write!(f, "database {} not found", id),
            MonitorError::UnknownSession(id) => write!(f, "session {} not found", id),
            MonitorError::AlreadyMonitoring(id) => {
                write!(f, "database {} is already being monitored", id)
            }
        }
    }
}

impl std::error::Error for MonitorError {}
