//! Database driver capability.
//!
//! The engine talks to every managed server through [`Driver`], which
//! hands out short-lived [`Connection`]s bound to one database and exposes
//! read-only catalog introspection plus health checks. Engine variants
//! translate the contract into their own catalog views:
//!
//! - [`mssql`]: SQL Server over TDS (tiberius)
//! - [`postgres`]: PostgreSQL (tokio-postgres)
//!
//! A connection is released when it is dropped, so every exit path
//! (including `?` propagation) closes it. Nothing holds a connection
//! across provisioning steps or sync tables.

pub mod health;
pub mod mssql;
pub mod postgres;
pub mod tls;

pub use health::{DatabaseHealth, HealthCheck, HealthReport, HealthStatus, ServerHealth};
pub use mssql::MssqlDriver;
pub use postgres::PostgresDriver;

use crate::catalog::{EngineType, ServerRecord};
use crate::config::ConnectionConfig;
use crate::core::{Row, SqlValue};
use crate::error::{ProvisionError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// An open session against one database.
#[async_trait]
pub trait Connection: Send {
    /// Run a statement and collect every row of its first result set.
    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>>;

    /// Run a statement batch and return the affected row count.
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64>;

    /// Stream the rows of a query in chunks of `chunk_size`.
    ///
    /// Stops early without error if the receiver is dropped. Returns the
    /// number of rows sent.
    async fn query_chunked(
        &mut self,
        sql: &str,
        chunk_size: usize,
        tx: mpsc::Sender<Vec<Row>>,
    ) -> Result<u64>;

    /// Release the session. Dropping the connection has the same effect.
    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// A database on a server, as listed by [`Driver::list_databases`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseInfo {
    pub name: String,
    pub created_at: Option<DateTime<Utc>>,
    pub state: String,
    pub size_mb: f64,
}

/// A table, as listed by [`Driver::list_tables`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableInfo {
    pub schema: String,
    pub name: String,
    pub row_count: i64,
    pub size_mb: f64,
    pub description: String,
}

/// A column, as listed by [`Driver::list_columns`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    /// Upper-cased type with length/precision, e.g. `NVARCHAR(50)`.
    pub data_type: String,
    pub max_length: i32,
    pub is_nullable: bool,
    pub is_identity: bool,
    pub is_primary_key: bool,
    pub default_value: String,
    pub description: String,
}

/// Per-engine database capability.
#[async_trait]
pub trait Driver: Send + Sync {
    /// The server this driver connects to.
    fn server(&self) -> &ServerRecord;

    /// Open a connection to `database`.
    async fn connect(&self, database: &str) -> Result<Box<dyn Connection>>;

    /// Run a query on a fresh connection.
    async fn execute_query(
        &self,
        database: &str,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Vec<Row>> {
        let mut conn = self.connect(database).await?;
        conn.query(sql, params).await
    }

    /// Run a non-query on a fresh connection.
    async fn execute_non_query(
        &self,
        database: &str,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<u64> {
        let mut conn = self.connect(database).await?;
        conn.execute(sql, params).await
    }

    /// Connect to the system database and return the server version string.
    async fn test_connection(&self) -> Result<String>;

    /// User databases, optionally filtered by name prefix.
    async fn list_databases(&self, prefix: Option<&str>) -> Result<Vec<DatabaseInfo>>;

    async fn list_tables(&self, database: &str) -> Result<Vec<TableInfo>>;

    async fn list_columns(&self, database: &str, table: &str) -> Result<Vec<ColumnInfo>>;

    /// Total allocated size in MB.
    async fn get_size(&self, database: &str) -> Result<f64>;

    async fn check_server_health(&self) -> ServerHealth;

    async fn check_database_health(&self, database: &str) -> DatabaseHealth;
}

/// Build the driver for a server record.
pub fn connect_driver(server: &ServerRecord, options: &ConnectionConfig) -> Result<Arc<dyn Driver>> {
    match server.engine {
        EngineType::Mssql => Ok(Arc::new(MssqlDriver::new(server.clone(), *options))),
        EngineType::Postgresql => Ok(Arc::new(PostgresDriver::new(server.clone(), *options))),
        other => Err(ProvisionError::Config(format!(
            "engine '{}' is not supported by this build (server {})",
            other, server.name
        ))),
    }
}

/// Builds the driver for a server record. Injectable so the orchestrator
/// and the sync engine can run against scripted drivers.
pub type DriverFactory = Arc<dyn Fn(&ServerRecord) -> Result<Arc<dyn Driver>> + Send + Sync>;

/// Factory backed by [`connect_driver`].
pub fn driver_factory(options: ConnectionConfig) -> DriverFactory {
    Arc::new(move |server: &ServerRecord| connect_driver(server, &options))
}

/// Run `fut` under the command timeout, reporting `context` on expiry.
pub(crate) async fn with_timeout<T, F>(
    limit: std::time::Duration,
    context: &str,
    fut: F,
) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProvisionError::execution(
            context,
            format!("timed out after {}s", limit.as_secs()),
        )),
    }
}

/// Shorten a statement for log and error context.
pub(crate) fn sql_context(sql: &str) -> String {
    let flat: String = sql.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() > 80 {
        let head: String = flat.chars().take(77).collect();
        format!("{}...", head)
    } else {
        flat
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_driver_rejects_unsupported_engines() {
        let mut server = ServerRecord::mssql(1, "ora", "system", "pw");
        server.engine = EngineType::Oracle;
        let err = connect_driver(&server, &ConnectionConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, ProvisionError::Config(_)));
    }

    #[test]
    fn test_connect_driver_builds_mssql() {
        let server = ServerRecord::mssql(1, "sql01", "sa", "pw");
        let driver = connect_driver(&server, &ConnectionConfig::default()).unwrap();
        assert_eq!(driver.server().id, 1);
    }

    #[test]
    fn test_sql_context_flattens_and_truncates() {
        assert_eq!(sql_context("SELECT\n    1"), "SELECT 1");
        let long = format!("SELECT {}", "x, ".repeat(60));
        let ctx = sql_context(&long);
        assert!(ctx.ends_with("..."));
        assert_eq!(ctx.chars().count(), 80);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_reports_context() {
        let slow = async {
            tokio::time::sleep(std::time::Duration::from_secs(10)).await;
            Ok::<_, ProvisionError>(())
        };
        let err = with_timeout(std::time::Duration::from_secs(1), "COUNT", slow)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out after 1s"));
    }
}
