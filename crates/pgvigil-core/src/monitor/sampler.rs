//! Statement-statistics sampling via `pg_stat_statements`.
//!
//! Requires the `pg_stat_statements` extension on the target database;
//! presence is checked before every sample and its absence degrades the cycle
//! to a no-op instead of failing the session.

use tracing::debug;

use crate::connect::{Connection, ResultSet};
use crate::error::{QueryError, SampleError};
use crate::store::StatementStats;

/// Cap on statements fetched per cycle. Limits memory when a target tracks
/// many unique queries.
pub const DEFAULT_STATEMENT_LIMIT: usize = 500;

/// One raw statement as observed in the statistics view.
#[derive(Debug, Clone)]
pub struct RawStatementObservation {
    pub query: String,
    pub stats: StatementStats,
}

/// Builds the version-aware sampling query.
///
/// PG 13 renamed the timing columns (`total_time` → `total_exec_time` etc.);
/// older servers get the legacy names aliased to the new ones.
pub fn build_statement_stats_query(server_version_num: Option<i32>, limit: usize) -> String {
    let v = server_version_num.unwrap_or(0);
    let (total_expr, mean_expr, min_expr, max_expr) = if v >= 130000 {
        (
            "s.total_exec_time",
            "s.mean_exec_time",
            "s.min_exec_time",
            "s.max_exec_time",
        )
    } else {
        ("s.total_time", "s.mean_time", "s.min_time", "s.max_time")
    };

    format!(
        r#"
            SELECT
                COALESCE(s.query, '') as query,
                s.calls,
                {total_expr}::double precision as total_exec_time,
                {mean_expr}::double precision as mean_exec_time,
                {min_expr}::double precision as min_exec_time,
                {max_expr}::double precision as max_exec_time
            FROM pg_stat_statements s
            JOIN pg_database d ON d.oid = s.dbid
            WHERE d.datname = current_database()
            ORDER BY total_exec_time DESC
            LIMIT {limit}
        "#
    )
}

/// True if the `pg_stat_statements` extension is installed on the connected
/// database.
pub async fn extension_available(conn: &mut dyn Connection) -> Result<bool, QueryError> {
    let result = conn
        .query("SELECT extversion FROM pg_extension WHERE extname = 'pg_stat_statements'")
        .await?;
    Ok(!result.is_empty())
}

/// Server version as reported by `server_version_num`, if parseable.
pub async fn server_version_num(conn: &mut dyn Connection) -> Option<i32> {
    let result = conn.query("SHOW server_version_num").await.ok()?;
    result
        .rows
        .first()
        .and_then(|row| row.first().cloned().flatten())
        .and_then(|v| v.parse::<i32>().ok())
}

/// Samples current statement statistics for the connected database.
pub async fn sample_statements(
    conn: &mut dyn Connection,
    limit: usize,
) -> Result<Vec<RawStatementObservation>, SampleError> {
    if !extension_available(conn).await.map_err(SampleError::Query)? {
        return Err(SampleError::ExtensionUnavailable);
    }

    let version = server_version_num(conn).await;
    let query = build_statement_stats_query(version, limit);
    let result = conn.query(&query).await.map_err(SampleError::Query)?;

    let mut observations = Vec::with_capacity(result.rows.len());
    for row in 0..result.rows.len() {
        let query_text = result.text(row, "query").unwrap_or_default();
        if query_text.is_empty() {
            continue;
        }
        observations.push(RawStatementObservation {
            query: query_text.to_string(),
            stats: StatementStats {
                calls: i64_cell(&result, row, "calls"),
                total_time_ms: f64_cell(&result, row, "total_exec_time"),
                mean_time_ms: f64_cell(&result, row, "mean_exec_time"),
                min_time_ms: f64_cell(&result, row, "min_exec_time"),
                max_time_ms: f64_cell(&result, row, "max_exec_time"),
            },
        });
    }

    debug!(statements = observations.len(), "statistics sampled");
    Ok(observations)
}

fn i64_cell(result: &ResultSet, row: usize, column: &str) -> i64 {
    result
        .text(row, column)
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(0)
}

fn f64_cell(result: &ResultSet, row: usize, column: &str) -> f64 {
    result
        .text(row, column)
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_query_uses_exec_time_columns_on_pg13_plus() {
        let q = build_statement_stats_query(Some(130000), 500);
        assert!(q.contains("s.total_exec_time::double precision as total_exec_time"));
        assert!(q.contains("s.mean_exec_time::double precision as mean_exec_time"));
        assert!(q.contains("LIMIT 500"));
    }

    #[test]
    fn stats_query_uses_legacy_columns_on_pg12_and_older() {
        let q = build_statement_stats_query(Some(120000), 100);
        assert!(q.contains("s.total_time::double precision as total_exec_time"));
        assert!(q.contains("s.min_time::double precision as min_exec_time"));
        assert!(q.contains("LIMIT 100"));
    }

    #[test]
    fn stats_query_scopes_to_current_database() {
        let q = build_statement_stats_query(None, 500);
        assert!(q.contains("d.datname = current_database()"));
    }

    #[test]
    fn numeric_cells_default_to_zero_when_missing() {
        let rs = ResultSet {
            columns: vec!["calls".to_string()],
            rows: vec![vec![None]],
        };
        assert_eq!(i64_cell(&rs, 0, "calls"), 0);
        assert_eq!(f64_cell(&rs, 0, "total_exec_time"), 0.0);
    }
}
