//! Observation store — the dedup/aggregation data access layer.
//!
//! Canonical statements are keyed by (database, signature); samples are keyed
//! by raw-text hash under their canonical statement. All mutation is
//! insert-or-update by natural key, so concurrent writers converge.
//!
//! Statements accumulate until externally purged; no deletions are defined
//! (deleting a group only nulls the references to it).

mod memory;

pub use memory::MemoryObservationStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{CanonicalStatementId, DatabaseId, GroupId};

/// Whether an upsert created a new row or updated an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Updated,
}

/// Call/latency aggregates of one observed statement, as reported by the
/// statistics extension (times in milliseconds).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatementStats {
    pub calls: i64,
    pub total_time_ms: f64,
    pub min_time_ms: f64,
    pub max_time_ms: f64,
    pub mean_time_ms: f64,
}

/// Partial triage update; `None` fields are left unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct TriageUpdate {
    pub known: Option<bool>,
    /// `Some(None)` clears the group reference.
    pub group: Option<Option<GroupId>>,
}

/// Filters for querying canonical statements. All filters are conjunctive.
#[derive(Debug, Clone, Default)]
pub struct StatementFilter {
    /// Only statements last seen at or after this time.
    pub seen_after: Option<DateTime<Utc>>,
    /// Only statements first seen at or before this time.
    pub seen_before: Option<DateTime<Utc>>,
    /// Case-insensitive substring match over any associated sample's raw text.
    pub search: Option<String>,
    pub known: Option<bool>,
    pub group: Option<GroupId>,
}

/// A canonical statement with aggregates computed across its samples.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalStatementView {
    pub id: CanonicalStatementId,
    pub canonical_text: String,
    pub signature: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub known: bool,
    pub group: Option<GroupId>,
    pub sample_count: usize,
    /// Sum of calls across samples.
    pub calls: i64,
    pub total_time_ms: f64,
    pub min_time_ms: f64,
    pub max_time_ms: f64,
    /// Call-weighted mean across samples.
    pub mean_time_ms: f64,
    /// Raw text of the most recently updated sample.
    pub representative_text: String,
}

/// A user-defined label bucket for canonical statements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatementGroup {
    pub id: GroupId,
    pub name: String,
}

/// Errors from store operations on unknown identities.
#[derive(Debug, Clone)]
pub enum StoreError {
    UnknownStatement(CanonicalStatementId),
    UnknownGroup(GroupId),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::UnknownStatement(id) => write!(f, "canonical statement {} not found", id),
            StoreError::UnknownGroup(id) => write!(f, "statement group {} not found", id),
        }
    }
}

impl std::error::Error for StoreError {}

/// Data access contract for statement observations.
///
/// The real console backs this with its persistence layer;
/// [`MemoryObservationStore`] is the in-process reference implementation.
pub trait ObservationStore: Send + Sync {
    /// Insert a canonical statement or, if one with this signature already
    /// exists for the database, bump its last-seen timestamp.
    ///
    /// New statements start as `known = false` with first-seen = last-seen =
    /// `observed_at`. Last-seen never moves backwards.
    fn upsert_canonical(
        &self,
        database_id: DatabaseId,
        canonical_text: &str,
        signature: &str,
        observed_at: DateTime<Utc>,
    ) -> (CanonicalStatementId, Upsert);

    /// Insert a sample or overwrite the aggregates of the sample with the
    /// same raw hash under this canonical statement.
    fn upsert_sample(
        &self,
        canonical_id: CanonicalStatementId,
        raw_text: &str,
        raw_hash: &str,
        stats: StatementStats,
        observed_at: DateTime<Utc>,
    ) -> Result<Upsert, StoreError>;

    /// Manual classification: known flag and/or group reference.
    fn set_triage(
        &self,
        canonical_id: CanonicalStatementId,
        update: TriageUpdate,
    ) -> Result<(), StoreError>;

    /// Canonical statements for a database matching `filter`, most recently
    /// seen first.
    fn query(&self, database_id: DatabaseId, filter: &StatementFilter)
    -> Vec<CanonicalStatementView>;

    fn create_group(&self, name: &str) -> StatementGroup;

    fn list_groups(&self) -> Vec<StatementGroup>;

    /// Delete a group; statements referencing it keep existing with a null
    /// group reference.
    fn delete_group(&self, group_id: GroupId) -> Result<(), StoreError>;
}
