//! Markdown rendering of health-check runs.

use chrono::{DateTime, Utc};

use super::{CheckResult, CheckStatus, ResultTable};

/// Accumulates a run's markdown report section by section.
pub struct ReportBuilder {
    out: String,
}

impl ReportBuilder {
    pub fn new(cluster_name: &str, started_at: DateTime<Utc>) -> Self {
        let mut out = String::new();
        out.push_str(&format!("# Health check: {cluster_name}\n\n"));
        out.push_str(&format!(
            "Started: {}\n",
            started_at.format("%Y-%m-%d %H:%M:%S UTC")
        ));
        Self { out }
    }

    /// Open the section for one check definition.
    pub fn begin_check(&mut self, title: &str) {
        self.out.push_str(&format!("\n## {title}\n"));
    }

    /// Render one target's result under the current check section.
    pub fn add_result(&mut self, result: &CheckResult) {
        self.out.push_str(&format!("\n### {}\n\n", result.target));
        let status = match result.status {
            CheckStatus::Success => "OK",
            CheckStatus::Warning => "WARNING",
            CheckStatus::Error => "ERROR",
        };
        self.out.push_str(&format!("Status: {status}"));
        if !result.message.is_empty() {
            self.out.push_str(&format!(" — {}", result.message));
        }
        self.out.push('\n');

        if let Some(table) = &result.table
            && !table.rows.is_empty()
        {
            self.out.push('\n');
            render_table(&mut self.out, table);
        }
    }

    pub fn finish(self) -> String {
        self.out
    }
}

/// Body of a report for a run that failed before producing results.
pub fn failure_report(cluster_name: &str, started_at: DateTime<Utc>, message: &str) -> String {
    let mut builder = ReportBuilder::new(cluster_name, started_at);
    builder.out.push_str(&format!("\nRun failed: {message}\n"));
    builder.finish()
}

fn render_table(out: &mut String, table: &ResultTable) {
    out.push_str("| ");
    out.push_str(
        &table
            .columns
            .iter()
            .map(|c| escape_cell(c))
            .collect::<Vec<_>>()
            .join(" | "),
    );
    out.push_str(" |\n");

    out.push_str("| ");
    out.push_str(
        &table
            .columns
            .iter()
            .map(|_| "---")
            .collect::<Vec<_>>()
            .join(" | "),
    );
    out.push_str(" |\n");

    for row in &table.rows {
        out.push_str("| ");
        out.push_str(
            &row.iter()
                .map(|v| escape_cell(v))
                .collect::<Vec<_>>()
                .join(" | "),
        );
        out.push_str(" |\n");
    }
}

fn escape_cell(value: &str) -> String {
    value.replace('|', "\\|").replace('\n', " ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(target: &str, status: CheckStatus, table: Option<ResultTable>) -> CheckResult {
        CheckResult {
            check_name: "replication_status".to_string(),
            check_title: "Replication status".to_string(),
            target: target.to_string(),
            status,
            message: String::new(),
            row_count: table.as_ref().map(|t| t.rows.len()).unwrap_or(0),
            duration_ms: 3,
            table,
        }
    }

    #[test]
    fn report_nests_targets_under_checks() {
        let mut builder = ReportBuilder::new("prod", Utc::now());
        builder.begin_check("Replication status");
        builder.add_result(&result("db-1:5432", CheckStatus::Success, None));
        builder.add_result(&result("db-2:5432", CheckStatus::Error, None));
        let md = builder.finish();

        assert!(md.starts_with("# Health check: prod\n"));
        assert!(md.contains("\n## Replication status\n"));
        assert!(md.contains("\n### db-1:5432\n"));
        assert!(md.contains("Status: OK"));
        assert!(md.contains("Status: ERROR"));
    }

    #[test]
    fn tables_escape_pipes_and_newlines() {
        let table = ResultTable {
            columns: vec!["query".to_string()],
            rows: vec![vec!["a | b\nc".to_string()]],
        };
        let mut builder = ReportBuilder::new("prod", Utc::now());
        builder.begin_check("Long-running transactions");
        builder.add_result(&result("db-1:5432", CheckStatus::Warning, Some(table)));
        let md = builder.finish();

        assert!(md.contains("| query |"));
        assert!(md.contains("| a \\| b c |"));
    }

    #[test]
    fn failure_report_carries_the_message() {
        let md = failure_report("prod", Utc::now(), "cluster prod has no writer instance");
        assert!(md.contains("Run failed: cluster prod has no writer instance"));
    }
}
