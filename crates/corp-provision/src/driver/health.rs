//! Health-check report types shared by all drivers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity of a single check or of a whole report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Normal,
    Warning,
    Error,
}

impl HealthStatus {
    /// Classify a value against ascending thresholds: below `warn_at` is
    /// normal, below `error_at` is a warning, anything else an error.
    pub fn grade(value: f64, warn_at: f64, error_at: f64) -> Self {
        if value < warn_at {
            HealthStatus::Normal
        } else if value < error_at {
            HealthStatus::Warning
        } else {
            HealthStatus::Error
        }
    }

    /// Classify a count where zero is normal and up to `warn_max` is a warning.
    pub fn grade_count(count: i64, warn_max: i64) -> Self {
        if count <= 0 {
            HealthStatus::Normal
        } else if count <= warn_max {
            HealthStatus::Warning
        } else {
            HealthStatus::Error
        }
    }
}

/// One named check inside a report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub name: String,
    pub status: HealthStatus,
    pub value: String,
    pub detail: String,
}

impl HealthCheck {
    pub fn new(
        name: impl Into<String>,
        status: HealthStatus,
        value: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            status,
            value: value.into(),
            detail: detail.into(),
        }
    }

    /// A check the login is not permitted to run.
    pub fn unavailable(name: impl Into<String>) -> Self {
        Self::new(name, HealthStatus::Normal, "unavailable", "permission required")
    }
}

/// Collected checks and the issues they raised.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checks: Vec<HealthCheck>,
    pub issues: Vec<String>,
}

impl Default for HealthReport {
    fn default() -> Self {
        Self {
            status: HealthStatus::Normal,
            checks: Vec::new(),
            issues: Vec::new(),
        }
    }
}

impl HealthReport {
    /// Add a check; non-normal checks also record `issue`.
    pub fn push(&mut self, check: HealthCheck, issue: impl FnOnce() -> String) {
        if check.status != HealthStatus::Normal {
            self.issues.push(issue());
        }
        self.status = self.status.max(check.status);
        self.checks.push(check);
    }

    /// Record a failure that prevented further checks.
    pub fn fail(&mut self, issue: impl Into<String>) {
        self.status = HealthStatus::Error;
        self.issues.push(issue.into());
    }
}

/// Server-level health report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerHealth {
    pub server_id: i64,
    pub server_name: String,
    pub host: String,
    pub port: u16,
    pub checked_at: DateTime<Utc>,
    #[serde(flatten)]
    pub report: HealthReport,
}

/// Database-level health report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseHealth {
    pub db_name: String,
    pub checked_at: DateTime<Utc>,
    #[serde(flatten)]
    pub report: HealthReport,
}

/// Grade a connection round trip in milliseconds.
pub fn response_time_check(elapsed_ms: u128) -> HealthCheck {
    let status = HealthStatus::grade(elapsed_ms as f64, 1000.0, 3000.0);
    HealthCheck::new(
        "response_time",
        status,
        format!("{}ms", elapsed_ms),
        "under 1s recommended",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grade_thresholds() {
        assert_eq!(HealthStatus::grade(79.0, 80.0, 95.0), HealthStatus::Normal);
        assert_eq!(HealthStatus::grade(80.0, 80.0, 95.0), HealthStatus::Warning);
        assert_eq!(HealthStatus::grade(97.0, 80.0, 95.0), HealthStatus::Error);
    }

    #[test]
    fn test_grade_count() {
        assert_eq!(HealthStatus::grade_count(0, 5), HealthStatus::Normal);
        assert_eq!(HealthStatus::grade_count(5, 5), HealthStatus::Warning);
        assert_eq!(HealthStatus::grade_count(6, 5), HealthStatus::Error);
    }

    #[test]
    fn test_report_takes_worst_status() {
        let mut report = HealthReport::default();
        report.push(response_time_check(120), || "slow".into());
        assert_eq!(report.status, HealthStatus::Normal);
        assert!(report.issues.is_empty());

        report.push(response_time_check(1500), || "slow response".into());
        assert_eq!(report.status, HealthStatus::Warning);

        report.push(HealthCheck::unavailable("memory"), || "unused".into());
        assert_eq!(report.status, HealthStatus::Warning);
        assert_eq!(report.issues, vec!["slow response".to_string()]);
        assert_eq!(report.checks.len(), 3);
    }
}
