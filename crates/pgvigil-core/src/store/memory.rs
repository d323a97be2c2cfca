//! In-memory observation store.
//!
//! Reference implementation of [`ObservationStore`] behind a single mutex,
//! used by tests and by embedders that do not bring their own persistence.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::model::{CanonicalStatementId, DatabaseId, GroupId};

use super::{
    CanonicalStatementView, ObservationStore, StatementFilter, StatementGroup, StatementStats,
    StoreError, TriageUpdate, Upsert,
};

#[derive(Debug, Clone)]
struct CanonicalRow {
    id: CanonicalStatementId,
    database_id: DatabaseId,
    canonical_text: String,
    signature: String,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    known: bool,
    group: Option<GroupId>,
}

#[derive(Debug, Clone)]
struct SampleRow {
    raw_text: String,
    stats: StatementStats,
    updated_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    statements: HashMap<CanonicalStatementId, CanonicalRow>,
    /// Natural key (database, signature) → statement id.
    by_signature: HashMap<(DatabaseId, String), CanonicalStatementId>,
    /// Statement id → raw hash → sample.
    samples: HashMap<CanonicalStatementId, HashMap<String, SampleRow>>,
    groups: HashMap<GroupId, StatementGroup>,
}

/// In-memory [`ObservationStore`].
#[derive(Default)]
pub struct MemoryObservationStore {
    inner: Mutex<Inner>,
}

impl MemoryObservationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ObservationStore for MemoryObservationStore {
    fn upsert_canonical(
        &self,
        database_id: DatabaseId,
        canonical_text: &str,
        signature: &str,
        observed_at: DateTime<Utc>,
    ) -> (CanonicalStatementId, Upsert) {
        let mut inner = self.inner.lock().unwrap();
        let key = (database_id, signature.to_string());

        if let Some(&id) = inner.by_signature.get(&key) {
            if let Some(row) = inner.statements.get_mut(&id) {
                // Last-seen never moves backwards.
                if observed_at > row.last_seen {
                    row.last_seen = observed_at;
                }
            }
            return (id, Upsert::Updated);
        }

        let id = CanonicalStatementId::new();
        inner.statements.insert(
            id,
            CanonicalRow {
                id,
                database_id,
                canonical_text: canonical_text.to_string(),
                signature: signature.to_string(),
                first_seen: observed_at,
                last_seen: observed_at,
                known: false,
                group: None,
            },
        );
        inner.by_signature.insert(key, id);
        (id, Upsert::Inserted)
    }

    fn upsert_sample(
        &self,
        canonical_id: CanonicalStatementId,
        raw_text: &str,
        raw_hash: &str,
        stats: StatementStats,
        observed_at: DateTime<Utc>,
    ) -> Result<Upsert, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.statements.contains_key(&canonical_id) {
            return Err(StoreError::UnknownStatement(canonical_id));
        }

        let samples = inner.samples.entry(canonical_id).or_default();
        let outcome = if samples.contains_key(raw_hash) {
            Upsert::Updated
        } else {
            Upsert::Inserted
        };
        samples.insert(
            raw_hash.to_string(),
            SampleRow {
                raw_text: raw_text.to_string(),
                stats,
                updated_at: observed_at,
            },
        );
        Ok(outcome)
    }

    fn set_triage(
        &self,
        canonical_id: CanonicalStatementId,
        update: TriageUpdate,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(Some(group_id)) = update.group {
            if !inner.groups.contains_key(&group_id) {
                return Err(StoreError::UnknownGroup(group_id));
            }
        }

        let row = inner
            .statements
            .get_mut(&canonical_id)
            .ok_or(StoreError::UnknownStatement(canonical_id))?;
        if let Some(known) = update.known {
            row.known = known;
        }
        if let Some(group) = update.group {
            row.group = group;
        }
        Ok(())
    }

    fn query(
        &self,
        database_id: DatabaseId,
        filter: &StatementFilter,
    ) -> Vec<CanonicalStatementView> {
        let inner = self.inner.lock().unwrap();
        let search = filter.search.as_ref().map(|s| s.to_lowercase());

        let mut views: Vec<CanonicalStatementView> = inner
            .statements
            .values()
            .filter(|row| row.database_id == database_id)
            .filter(|row| filter.seen_after.is_none_or(|t| row.last_seen >= t))
            .filter(|row| filter.seen_before.is_none_or(|t| row.first_seen <= t))
            .filter(|row| filter.known.is_none_or(|k| row.known == k))
            .filter(|row| filter.group.is_none_or(|g| row.group == Some(g)))
            .filter_map(|row| {
                let samples = inner.samples.get(&row.id);
                if let Some(ref needle) = search {
                    let hit = samples.is_some_and(|m| {
                        m.values()
                            .any(|s| s.raw_text.to_lowercase().contains(needle))
                    });
                    if !hit {
                        return None;
                    }
                }
                Some(aggregate(row, samples))
            })
            .collect();

        views.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        views
    }

    fn create_group(&self, name: &str) -> StatementGroup {
        let mut inner = self.inner.lock().unwrap();
        let group = StatementGroup {
            id: GroupId::new(),
            name: name.to_string(),
        };
        inner.groups.insert(group.id, group.clone());
        group
    }

    fn list_groups(&self) -> Vec<StatementGroup> {
        let inner = self.inner.lock().unwrap();
        let mut groups: Vec<_> = inner.groups.values().cloned().collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        groups
    }

    fn delete_group(&self, group_id: GroupId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.groups.remove(&group_id).is_none() {
            return Err(StoreError::UnknownGroup(group_id));
        }
        // References become null, statements stay.
        for row in inner.statements.values_mut() {
            if row.group == Some(group_id) {
                row.group = None;
            }
        }
        Ok(())
    }
}

fn aggregate(row: &CanonicalRow, samples: Option<&HashMap<String, SampleRow>>) -> CanonicalStatementView {
    let mut calls = 0i64;
    let mut total = 0.0f64;
    let mut min = f64::INFINITY;
    let mut max = 0.0f64;
    let mut representative: Option<&SampleRow> = None;
    let mut sample_count = 0usize;

    if let Some(samples) = samples {
        sample_count = samples.len();
        for sample in samples.values() {
            calls += sample.stats.calls;
            total += sample.stats.total_time_ms;
            min = min.min(sample.stats.min_time_ms);
            max = max.max(sample.stats.max_time_ms);
            if representative.is_none_or(|r| sample.updated_at > r.updated_at) {
                representative = Some(sample);
            }
        }
    }

    let mean = if calls > 0 { total / calls as f64 } else { 0.0 };

    CanonicalStatementView {
        id: row.id,
        canonical_text: row.canonical_text.clone(),
        signature: row.signature.clone(),
        first_seen: row.first_seen,
        last_seen: row.last_seen,
        known: row.known,
        group: row.group,
        sample_count,
        calls,
        total_time_ms: total,
        min_time_ms: if min.is_finite() { min } else { 0.0 },
        max_time_ms: max,
        mean_time_ms: mean,
        representative_text: representative.map(|s| s.raw_text.clone()).unwrap_or_default(),
    }
}
