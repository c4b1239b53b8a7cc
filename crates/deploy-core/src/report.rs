//! Timeline report TSV generation.
//!
//! One row per recorded milestone of a deployment run.
//!
//! Columns: `timestamp_ms`, `owner`, `status`, `elapsed_ms`, `created_by`, `detail`

use crate::timeline::TimelineEntry;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// A single row in a timeline report.
#[derive(Debug, Clone)]
pub struct ReportRow {
    /// Unix timestamp in milliseconds.
    pub timestamp_ms: i64,
    pub owner: String,
    pub status: String,
    /// Time since the previous milestone, if any.
    pub elapsed_ms: Option<i64>,
    pub created_by: i32,
    pub detail: String,
}

impl ReportRow {
    fn to_tsv_line(&self) -> String {
        let elapsed = self.elapsed_ms.map(|e| e.to_string()).unwrap_or_default();
        format!(
            "{}\t{}\t{}\t{}\t{}\t{}",
            self.timestamp_ms,
            self.owner,
            self.status,
            elapsed,
            self.created_by,
            sanitize_field(&self.detail),
        )
    }
}

/// Build rows from timeline entries ordered by status time.
pub fn rows_from_timeline(entries: &[TimelineEntry]) -> Vec<ReportRow> {
    let mut sorted: Vec<&TimelineEntry> = entries.iter().collect();
    sorted.sort_by_key(|e| e.status_time);

    let mut previous: Option<i64> = None;
    sorted
        .into_iter()
        .map(|entry| {
            let ts = entry.status_time.timestamp_millis();
            let row = ReportRow {
                timestamp_ms: ts,
                owner: format!("{}:{}", entry.owner.kind(), entry.owner.id()),
                status: entry.status.as_str().to_string(),
                elapsed_ms: previous.map(|p| ts - p),
                created_by: entry.created_by,
                detail: entry.status_detail.clone(),
            };
            previous = Some(ts);
            row
        })
        .collect()
}

fn sanitize_field(value: &str) -> String {
    value.replace(['\t', '\n', '\r'], " ")
}

const HEADER: &str = "timestamp_ms\towner\tstatus\telapsed_ms\tcreated_by\tdetail";

/// Write a full report file, replacing any existing one.
pub fn write_report(path: &Path, rows: &[ReportRow]) -> std::io::Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    writeln!(writer, "{HEADER}")?;
    for row in rows {
        writeln!(writer, "{}", row.to_tsv_line())?;
    }

    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeline::{TimelineOwner, TimelineStatus};
    use crate::types::Id;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn entry(status: TimelineStatus, ms: i64, detail: &str) -> TimelineEntry {
        TimelineEntry::with_detail(
            TimelineOwner::Runner(Id::from_string("run-1")),
            status,
            detail,
            7,
        )
        .at(Utc.timestamp_millis_opt(ms).unwrap())
    }

    #[test]
    fn rows_are_sorted_with_elapsed_time() {
        let entries = vec![
            entry(TimelineStatus::GitCommit, 2_500, "ok"),
            entry(TimelineStatus::DeploymentInitiated, 1_000, "start"),
        ];
        let rows = rows_from_timeline(&entries);
        assert_eq!(rows[0].status, "DEPLOYMENT_INITIATED");
        assert_eq!(rows[0].elapsed_ms, None);
        assert_eq!(rows[1].status, "GIT_COMMIT");
        assert_eq!(rows[1].elapsed_ms, Some(1_500));
        assert_eq!(rows[1].owner, "runner:run-1");
    }

    #[test]
    fn tsv_line_sanitizes_detail() {
        let rows = rows_from_timeline(&[entry(
            TimelineStatus::GitCommitFailed,
            10,
            "Git commit failed - remote\trejected\npush",
        )]);
        assert_eq!(
            rows[0].to_tsv_line(),
            "10\trunner:run-1\tGIT_COMMIT_FAILED\t\t7\tGit commit failed - remote rejected push"
        );
    }

    #[test]
    fn write_report_creates_file_with_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("timeline.tsv");
        let rows = rows_from_timeline(&[entry(TimelineStatus::Healthy, 5, "up")]);

        write_report(&path, &rows).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], HEADER);
        assert!(lines[1].starts_with("5\trunner:run-1\tHEALTHY"));
    }
}
