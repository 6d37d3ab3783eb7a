//! Per-table sync outcome.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Terminal status of one table copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableSyncStatus {
    Success,
    /// The copy raised an error.
    Fail,
    /// The copy finished but source and target row counts disagree.
    Mismatch,
    /// Nothing was copied because the target table does not exist.
    Skipped,
}

impl fmt::Display for TableSyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TableSyncStatus::Success => "success",
            TableSyncStatus::Fail => "fail",
            TableSyncStatus::Mismatch => "mismatch",
            TableSyncStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// How a table was copied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyMethod {
    Linked,
    Bcp,
    Batched,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSyncResult {
    pub schema: String,
    pub table: String,
    pub source_row_count: Option<i64>,
    pub target_row_count: Option<i64>,
    pub status: TableSyncStatus,
    pub error: Option<String>,
    pub method: Option<CopyMethod>,
    pub elapsed_seconds: f64,
}

impl TableSyncResult {
    /// Result from the post-copy row-count comparison.
    pub fn verified(
        schema: &str,
        table: &str,
        method: CopyMethod,
        source_count: i64,
        target_count: i64,
        elapsed: Duration,
    ) -> Self {
        let (status, error) = if source_count == target_count {
            (TableSyncStatus::Success, None)
        } else {
            (
                TableSyncStatus::Mismatch,
                Some(format!(
                    "row count mismatch: source {} / target {}",
                    source_count, target_count
                )),
            )
        };
        Self {
            schema: schema.to_string(),
            table: table.to_string(),
            source_row_count: Some(source_count),
            target_row_count: Some(target_count),
            status,
            error,
            method: Some(method),
            elapsed_seconds: elapsed.as_secs_f64(),
        }
    }

    pub fn failed(schema: &str, table: &str, message: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            schema: schema.to_string(),
            table: table.to_string(),
            source_row_count: None,
            target_row_count: None,
            status: TableSyncStatus::Fail,
            error: Some(message.into()),
            method: None,
            elapsed_seconds: elapsed.as_secs_f64(),
        }
    }

    pub fn skipped(schema: &str, table: &str, reason: impl Into<String>) -> Self {
        Self {
            status: TableSyncStatus::Skipped,
            ..Self::failed(schema, table, reason, Duration::ZERO)
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TableSyncStatus::Success
    }

    /// Fail and mismatch both count as failures.
    pub fn is_failure(&self) -> bool {
        matches!(
            self.status,
            TableSyncStatus::Fail | TableSyncStatus::Mismatch
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_counts_are_success() {
        let r = TableSyncResult::verified("dbo", "T", CopyMethod::Bcp, 10, 10, Duration::from_millis(1500));
        assert_eq!(r.status, TableSyncStatus::Success);
        assert!(r.error.is_none());
        assert!((r.elapsed_seconds - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_unequal_counts_are_mismatch() {
        let r = TableSyncResult::verified("dbo", "T", CopyMethod::Linked, 10, 7, Duration::ZERO);
        assert_eq!(r.status, TableSyncStatus::Mismatch);
        assert_eq!(r.error.as_deref(), Some("row count mismatch: source 10 / target 7"));
        assert!(r.is_failure());
    }

    #[test]
    fn test_skipped_is_neither_success_nor_failure() {
        let r = TableSyncResult::skipped("dbo", "T", "not present in target");
        assert!(!r.is_success());
        assert!(!r.is_failure());
        assert_eq!(serde_json::to_value(r.status).unwrap(), "skipped");
    }
}
