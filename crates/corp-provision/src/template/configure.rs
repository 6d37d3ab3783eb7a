//! Operational database options applied after `CREATE DATABASE`.
//!
//! Statements are grouped into named sections and run one at a time on a
//! single `master` connection. A failing statement becomes a warning tagged
//! with its section and the run continues: not every option is legal on
//! every edition. Every statement is a plain `SET`, so configuring the same
//! database twice yields the same verification snapshot.

use crate::core::{Row, SqlValue};
use crate::driver::Driver;
use crate::error::{ProvisionError, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Section names, in execution order.
pub const SECTION_NAMES: [&str; 8] = [
    "fulltext",
    "ansi",
    "performance",
    "security",
    "recovery",
    "storage",
    "query_store",
    "finalize",
];

const VERIFY_SQL: &str = r#"
SELECT d.name                          AS db_name,
       CONVERT(nvarchar(30), d.create_date, 120) AS created_at,
       d.recovery_model_desc           AS recovery_model,
       d.page_verify_option_desc       AS page_verify,
       d.is_query_store_on             AS query_store,
       d.is_broker_enabled             AS broker_enabled,
       d.is_read_committed_snapshot_on AS rcsi,
       d.snapshot_isolation_state_desc AS snapshot_isolation,
       d.is_fulltext_enabled           AS fulltext_enabled,
       CAST(mf_data.size AS bigint) * 8 AS data_size_kb,
       CAST(mf_log.size AS bigint) * 8  AS log_size_kb
  FROM sys.databases d
  LEFT JOIN sys.master_files mf_data ON mf_data.database_id = d.database_id AND mf_data.type = 0
  LEFT JOIN sys.master_files mf_log  ON mf_log.database_id = d.database_id AND mf_log.type = 1
 WHERE d.name = @P1"#;

/// Durable database state read back after configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    pub db_name: String,
    pub created_at: Option<String>,
    pub recovery_model: String,
    pub page_verify: String,
    pub query_store: bool,
    pub broker_enabled: bool,
    pub rcsi: bool,
    pub snapshot_isolation: String,
    pub fulltext_enabled: bool,
    pub data_size_kb: Option<i64>,
    pub log_size_kb: Option<i64>,
}

impl Verification {
    fn from_row(row: &Row) -> Self {
        Self {
            db_name: row.get_string("db_name"),
            created_at: row.get_str("created_at").map(str::to_string),
            recovery_model: row.get_string("recovery_model"),
            page_verify: row.get_string("page_verify"),
            query_store: row.get_bool("query_store"),
            broker_enabled: row.get_bool("broker_enabled"),
            rcsi: row.get_bool("rcsi"),
            snapshot_isolation: row.get_string("snapshot_isolation"),
            fulltext_enabled: row.get_bool("fulltext_enabled"),
            data_size_kb: row.get_i64("data_size_kb"),
            log_size_kb: row.get_i64("log_size_kb"),
        }
    }
}

/// Outcome of [`configure_database`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigureResult {
    pub db_name: String,
    /// True once every section has run, whether or not statements failed.
    pub success: bool,
    /// Statements the server refused.
    pub failed_statements: usize,
    /// One entry per failed statement, `"[section] message"`.
    pub warnings: Vec<String>,
    pub verification: Option<Verification>,
}

/// The configuration statements for `db_name`, grouped by section.
pub fn configure_sections(db_name: &str) -> Vec<(&'static str, Vec<String>)> {
    let alter = |option: &str| format!("ALTER DATABASE [{}] SET {}", db_name, option);
    let alter_all = |options: &[&str]| options.iter().map(|o| alter(*o)).collect::<Vec<_>>();

    vec![
        (
            "fulltext",
            vec![format!(
                "IF CONVERT(int, FULLTEXTSERVICEPROPERTY('IsFullTextInstalled')) = 1\n\
                 BEGIN\n\
                 \x20   DECLARE @ftsql nvarchar(max) = N'USE [{}]; EXEC dbo.sp_fulltext_database @action = ''disable'';';\n\
                 \x20   EXEC sys.sp_executesql @ftsql;\n\
                 END",
                db_name
            )],
        ),
        (
            "ansi",
            alter_all(&[
                "ANSI_NULL_DEFAULT OFF",
                "ANSI_NULLS OFF",
                "ANSI_PADDING OFF",
                "ANSI_WARNINGS OFF",
                "ARITHABORT OFF",
                "CONCAT_NULL_YIELDS_NULL OFF",
                "NUMERIC_ROUNDABORT OFF",
                "QUOTED_IDENTIFIER OFF",
                "RECURSIVE_TRIGGERS OFF",
            ]),
        ),
        (
            "performance",
            alter_all(&[
                "AUTO_CLOSE OFF",
                "AUTO_SHRINK OFF",
                "AUTO_UPDATE_STATISTICS ON",
                "AUTO_UPDATE_STATISTICS_ASYNC OFF",
                "CURSOR_CLOSE_ON_COMMIT OFF",
                "CURSOR_DEFAULT GLOBAL",
                "PARAMETERIZATION SIMPLE",
                "DATE_CORRELATION_OPTIMIZATION OFF",
            ]),
        ),
        (
            "security",
            alter_all(&[
                "TRUSTWORTHY OFF",
                "DB_CHAINING OFF",
                "ALLOW_SNAPSHOT_ISOLATION OFF",
                "READ_COMMITTED_SNAPSHOT OFF",
            ]),
        ),
        (
            "recovery",
            alter_all(&[
                "DISABLE_BROKER",
                "HONOR_BROKER_PRIORITY OFF",
                "RECOVERY SIMPLE",
                "MULTI_USER",
            ]),
        ),
        (
            "storage",
            alter_all(&[
                "PAGE_VERIFY CHECKSUM",
                "FILESTREAM( NON_TRANSACTED_ACCESS = OFF )",
                "TARGET_RECOVERY_TIME = 60 SECONDS",
                "DELAYED_DURABILITY = DISABLED",
                "ACCELERATED_DATABASE_RECOVERY = OFF",
            ]),
        ),
        (
            "query_store",
            vec![alter(
                "QUERY_STORE = ON (\n\
                 \x20   OPERATION_MODE = READ_WRITE,\n\
                 \x20   CLEANUP_POLICY = (STALE_QUERY_THRESHOLD_DAYS = 30),\n\
                 \x20   DATA_FLUSH_INTERVAL_SECONDS = 900,\n\
                 \x20   INTERVAL_LENGTH_MINUTES = 60,\n\
                 \x20   MAX_STORAGE_SIZE_MB = 1000,\n\
                 \x20   QUERY_CAPTURE_MODE = AUTO,\n\
                 \x20   SIZE_BASED_CLEANUP_MODE = AUTO,\n\
                 \x20   MAX_PLANS_PER_QUERY = 200,\n\
                 \x20   WAIT_STATS_CAPTURE_MODE = ON\n\
                 )",
            )],
        ),
        ("finalize", vec![alter("READ_WRITE")]),
    ]
}

/// Apply the operational options to an existing database.
///
/// Fails only when the `master` connection cannot be opened or the database
/// does not exist. Statement failures are returned as warnings.
pub async fn configure_database(driver: &dyn Driver, db_name: &str) -> Result<ConfigureResult> {
    let mut conn = driver.connect(driver.server().system_db()).await?;

    let exists = conn
        .query("SELECT DB_ID(@P1) AS db_id", &[SqlValue::from(db_name)])
        .await?;
    let found = exists
        .first()
        .and_then(|r| r.get("db_id"))
        .is_some_and(|v| !v.is_null());
    if !found {
        return Err(ProvisionError::not_found(format!("database {}", db_name)));
    }

    let mut result = ConfigureResult {
        db_name: db_name.to_string(),
        ..Default::default()
    };

    for (section, statements) in configure_sections(db_name) {
        debug!("Configuring {} [{}]", db_name, section);
        for statement in statements {
            if let Err(e) = conn.execute(&statement, &[]).await {
                warn!("Configure {} [{}] failed: {}", db_name, section, e);
                result.failed_statements += 1;
                result.warnings.push(format!("[{}] {}", section, e));
            }
        }
    }

    match conn.query(VERIFY_SQL, &[SqlValue::from(db_name)]).await {
        Ok(rows) => result.verification = rows.first().map(Verification::from_row),
        Err(e) => result.warnings.push(format!("[verify] verification query failed: {}", e)),
    }

    conn.close().await?;
    result.success = true;
    info!(
        "Configured {} ({} warning(s))",
        db_name,
        result.warnings.len()
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockDriver;

    fn verify_row() -> Row {
        Row::from_pairs([
            ("db_name", SqlValue::from("ACME01")),
            ("created_at", SqlValue::from("2026-01-05 09:00:00")),
            ("recovery_model", SqlValue::from("SIMPLE")),
            ("page_verify", SqlValue::from("CHECKSUM")),
            ("query_store", SqlValue::Bool(true)),
            ("broker_enabled", SqlValue::Bool(false)),
            ("rcsi", SqlValue::Bool(false)),
            ("snapshot_isolation", SqlValue::from("OFF")),
            ("fulltext_enabled", SqlValue::Bool(false)),
            ("data_size_kb", SqlValue::I64(102400)),
            ("log_size_kb", SqlValue::I64(65536)),
        ])
    }

    #[test]
    fn test_sections_are_ordered_and_scoped() {
        let sections = configure_sections("ACME01");
        let names: Vec<_> = sections.iter().map(|(n, _)| *n).collect();
        assert_eq!(names, SECTION_NAMES);
        for (_, statements) in &sections {
            assert!(!statements.is_empty());
            assert!(statements.iter().all(|s| s.contains("[ACME01]")));
        }
        let recovery = &sections[4].1;
        assert!(recovery.contains(&"ALTER DATABASE [ACME01] SET RECOVERY SIMPLE".to_string()));
        assert!(sections[6].1[0].contains("MAX_PLANS_PER_QUERY = 200"));
    }

    #[tokio::test]
    async fn test_missing_database_is_not_found() {
        let driver = MockDriver::new(1);
        driver.on_query("DB_ID", vec![Row::from_pairs([("db_id", SqlValue::Null(crate::core::SqlNullType::I32))])]);
        let err = configure_database(&driver, "NOPE").await.unwrap_err();
        assert!(matches!(err, ProvisionError::NotFound(_)));
        assert_eq!(driver.count_matching("ALTER DATABASE"), 0);
    }

    #[tokio::test]
    async fn test_failed_statements_become_section_warnings() {
        let driver = MockDriver::new(1);
        driver.on_query("DB_ID", vec![Row::from_pairs([("db_id", SqlValue::I32(7))])]);
        driver.on_query("sys.master_files", vec![verify_row()]);
        driver.fail_on("ACCELERATED_DATABASE_RECOVERY", "option not supported");
        driver.fail_on("QUERY_STORE = ON", "edition does not support query store");

        let result = configure_database(&driver, "ACME01").await.unwrap();
        assert!(result.success);
        assert_eq!(result.failed_statements, 2);
        assert_eq!(result.warnings.len(), 2);
        assert!(result.warnings[0].starts_with("[storage]"));
        assert!(result.warnings[1].starts_with("[query_store]"));
        // READ_WRITE still ran after the failures
        assert_eq!(driver.count_matching("SET READ_WRITE"), 1);
        let verification = result.verification.unwrap();
        assert_eq!(verification.recovery_model, "SIMPLE");
        assert!(verification.query_store);
        assert_eq!(verification.data_size_kb, Some(102400));
    }

    #[tokio::test]
    async fn test_reconfigure_yields_same_verification() {
        let driver = MockDriver::new(1);
        driver.on_query("DB_ID", vec![Row::from_pairs([("db_id", SqlValue::I32(7))])]);
        driver.on_query("sys.master_files", vec![verify_row()]);

        let first = configure_database(&driver, "ACME01").await.unwrap();
        let second = configure_database(&driver, "ACME01").await.unwrap();
        assert!(first.success && second.success);
        assert_eq!(first.failed_statements, 0);
        assert_eq!(first.verification, second.verification);
    }

    #[tokio::test]
    async fn test_verify_failure_is_a_warning() {
        let driver = MockDriver::new(1);
        driver.on_query("DB_ID", vec![Row::from_pairs([("db_id", SqlValue::I32(7))])]);
        driver.fail_on("sys.master_files", "permission denied");

        let result = configure_database(&driver, "ACME01").await.unwrap();
        assert!(result.success);
        assert_eq!(result.failed_statements, 0);
        assert!(result.verification.is_none());
        assert!(result.warnings[0].starts_with("[verify]"));
    }

    #[tokio::test]
    async fn test_connection_failure_propagates() {
        let driver = MockDriver::new(1);
        driver.fail_connect("master");
        let err = configure_database(&driver, "ACME01").await.unwrap_err();
        assert!(err.is_connection());
    }
}
