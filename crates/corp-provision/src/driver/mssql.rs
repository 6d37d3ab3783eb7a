//! SQL Server driver over TDS.
//!
//! Each [`Connection`] is a dedicated tiberius client bound to one
//! database; there is no pool because provisioning creates, reconfigures
//! and drops databases underneath any idle session.
//!
//! Statements with parameters run through `sp_executesql` (`@P1..`).
//! Session-level `SET` options issued that way only last for the batch
//! they are part of, so callers keep `SET IDENTITY_INSERT` in the same
//! statement text as the insert it covers.

use super::health::{response_time_check, HealthCheck, HealthReport, HealthStatus};
use super::{
    sql_context, with_timeout, ColumnInfo, Connection, DatabaseHealth, DatabaseInfo, Driver,
    ServerHealth, TableInfo,
};
use crate::catalog::ServerRecord;
use crate::config::ConnectionConfig;
use crate::core::{Row, SqlNullType, SqlValue};
use crate::error::{ProvisionError, Result};
use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use futures::TryStreamExt;
use rust_decimal::Decimal;
use std::time::Instant;
use tiberius::{AuthMethod, Client, ColumnData, Config, EncryptionLevel, FromSql, ToSql};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, warn};

/// Attempts made to open a connection before giving up.
const CONNECT_MAX_ATTEMPTS: u32 = 3;

/// Delay between connection attempts in milliseconds.
const CONNECT_RETRY_DELAY_MS: u64 = 1000;

type TdsClient = Client<Compat<TcpStream>>;

/// SQL Server driver for one server record.
pub struct MssqlDriver {
    server: ServerRecord,
    options: ConnectionConfig,
}

impl MssqlDriver {
    pub fn new(server: ServerRecord, options: ConnectionConfig) -> Self {
        Self { server, options }
    }

    fn build_config(&self, database: &str) -> Config {
        let mut config = Config::new();
        config.host(&self.server.host);
        config.port(self.server.port());
        config.database(database);
        config.application_name("corp-provision");
        config.authentication(AuthMethod::sql_server(
            &self.server.username,
            &self.server.password,
        ));

        if self.server.encrypt {
            if self.server.trust_server_cert {
                config.trust_cert();
            }
            config.encryption(EncryptionLevel::Required);
        } else {
            config.encryption(EncryptionLevel::NotSupported);
        }

        config
    }

    async fn open_once(&self, database: &str, context: &str) -> Result<TdsClient> {
        let config = self.build_config(database);
        let connect = async {
            let tcp = TcpStream::connect(config.get_addr())
                .await
                .map_err(|e| ProvisionError::connection(e, context))?;
            tcp.set_nodelay(true).ok();
            Client::connect(config, tcp.compat_write())
                .await
                .map_err(|e| ProvisionError::connection(e, context))
        };

        match tokio::time::timeout(self.options.login_timeout(), connect).await {
            Ok(result) => result,
            Err(_) => Err(ProvisionError::connection(
                format!(
                    "login timed out after {}s",
                    self.options.login_timeout_secs
                ),
                context,
            )),
        }
    }

    async fn open(&self, database: &str) -> Result<MssqlConnection> {
        let context = format!("{} / {}", self.server.address(), database);
        let mut attempt = 1;
        loop {
            match self.open_once(database, &context).await {
                Ok(client) => {
                    debug!("Connected to {}", context);
                    return Ok(MssqlConnection {
                        client,
                        command_timeout: self.options.command_timeout(),
                    });
                }
                Err(e) if attempt < CONNECT_MAX_ATTEMPTS => {
                    warn!(
                        "Connection to {} failed, retry {}/{}: {}",
                        context, attempt, CONNECT_MAX_ATTEMPTS, e
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(CONNECT_RETRY_DELAY_MS))
                        .await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run a health query; `None` when the login lacks permission.
    async fn try_query(conn: &mut MssqlConnection, sql: &str) -> Option<Vec<Row>> {
        match conn.query(sql, &[]).await {
            Ok(rows) => Some(rows),
            Err(e) => {
                debug!("Health query failed: {}", e);
                None
            }
        }
    }
}

/// One TDS session.
pub struct MssqlConnection {
    client: TdsClient,
    command_timeout: std::time::Duration,
}

#[async_trait]
impl Connection for MssqlConnection {
    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        let context = sql_context(sql);
        debug!("query: {}", context);
        let limit = self.command_timeout;
        let client = &mut self.client;
        with_timeout(limit, &context, async {
            let boxed: Vec<Box<dyn ToSql>> = params.iter().map(sql_value_to_sql_param).collect();
            let refs: Vec<&dyn ToSql> = boxed.iter().map(|b| b.as_ref()).collect();
            let result = if refs.is_empty() {
                client.simple_query(sql).await
            } else {
                client.query(sql, &refs).await
            };
            let stream = result.map_err(|e| ProvisionError::from_tiberius(e, &context))?;

            let rows = stream
                .into_first_result()
                .await
                .map_err(|e| ProvisionError::from_tiberius(e, &context))?;
            Ok(rows.into_iter().map(convert_row).collect())
        })
        .await
    }

    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        let context = sql_context(sql);
        debug!("execute: {}", context);
        let limit = self.command_timeout;
        let client = &mut self.client;
        with_timeout(limit, &context, async {
            let boxed: Vec<Box<dyn ToSql>> = params.iter().map(sql_value_to_sql_param).collect();
            let refs: Vec<&dyn ToSql> = boxed.iter().map(|b| b.as_ref()).collect();
            let result = client
                .execute(sql, &refs)
                .await
                .map_err(|e| ProvisionError::from_tiberius(e, &context))?;
            Ok(result.total())
        })
        .await
    }

    async fn query_chunked(
        &mut self,
        sql: &str,
        chunk_size: usize,
        tx: mpsc::Sender<Vec<Row>>,
    ) -> Result<u64> {
        let context = sql_context(sql);
        debug!("stream: {}", context);
        let chunk_size = chunk_size.max(1);
        let stream = self
            .client
            .simple_query(sql)
            .await
            .map_err(|e| ProvisionError::from_tiberius(e, &context))?;
        let mut rows = stream.into_row_stream();

        let mut sent = 0u64;
        let mut chunk = Vec::with_capacity(chunk_size);
        while let Some(row) = rows
            .try_next()
            .await
            .map_err(|e| ProvisionError::from_tiberius(e, &context))?
        {
            chunk.push(convert_row(row));
            if chunk.len() >= chunk_size {
                let n = chunk.len() as u64;
                if tx.send(std::mem::take(&mut chunk)).await.is_err() {
                    return Ok(sent);
                }
                sent += n;
            }
        }
        if !chunk.is_empty() {
            let n = chunk.len() as u64;
            if tx.send(chunk).await.is_ok() {
                sent += n;
            }
        }
        Ok(sent)
    }
}

#[async_trait]
impl Driver for MssqlDriver {
    fn server(&self) -> &ServerRecord {
        &self.server
    }

    async fn connect(&self, database: &str) -> Result<Box<dyn Connection>> {
        Ok(Box::new(self.open(database).await?))
    }

    async fn test_connection(&self) -> Result<String> {
        let mut conn = self.open(self.server.system_db()).await?;
        let rows = conn.query("SELECT @@VERSION AS version", &[]).await?;
        let version = rows
            .first()
            .map(|r| r.get_string("version"))
            .unwrap_or_default();
        Ok(version.lines().next().unwrap_or_default().trim().to_string())
    }

    async fn list_databases(&self, prefix: Option<&str>) -> Result<Vec<DatabaseInfo>> {
        let mut conn = self.open("master").await?;
        let base = r#"
            SELECT d.name AS db_name,
                   d.create_date,
                   d.state_desc AS state,
                   (SELECT SUM(CAST(size AS BIGINT)) * 8.0 / 1024
                      FROM sys.master_files
                     WHERE database_id = d.database_id) AS size_mb
              FROM sys.databases d
             WHERE d.state = 0"#;
        let rows = match prefix.filter(|p| !p.is_empty()) {
            Some(p) => {
                let sql = format!("{} AND d.name LIKE @P1 ORDER BY d.create_date DESC", base);
                let pattern = format!("{}%", escape_like(p));
                conn.query(&sql, &[SqlValue::from(pattern)]).await?
            }
            None => {
                let sql = format!(
                    "{} AND d.name NOT IN ('master', 'tempdb', 'model', 'msdb') ORDER BY d.create_date DESC",
                    base
                );
                conn.query(&sql, &[]).await?
            }
        };

        Ok(rows
            .iter()
            .map(|r| DatabaseInfo {
                name: r.get_string("db_name"),
                created_at: r
                    .get("create_date")
                    .and_then(SqlValue::as_datetime)
                    .map(|dt| dt.and_utc()),
                state: r.get_string("state"),
                size_mb: round2(r.get_f64("size_mb").unwrap_or(0.0)),
            })
            .collect())
    }

    async fn list_tables(&self, database: &str) -> Result<Vec<TableInfo>> {
        let mut conn = self.open(database).await?;
        let rows = conn
            .query(
                r#"
            SELECT s.name AS schema_name,
                   t.name AS table_name,
                   SUM(p.rows) AS row_count,
                   SUM(a.total_pages) * 8.0 / 1024 AS size_mb,
                   CAST(MAX(CAST(ep.value AS NVARCHAR(500))) AS NVARCHAR(500)) AS description
              FROM sys.tables t
              JOIN sys.schemas s ON t.schema_id = s.schema_id
              JOIN sys.indexes i ON t.object_id = i.object_id
              JOIN sys.partitions p ON i.object_id = p.object_id AND i.index_id = p.index_id
              JOIN sys.allocation_units a ON p.partition_id = a.container_id
              LEFT JOIN sys.extended_properties ep
                ON ep.major_id = t.object_id AND ep.minor_id = 0 AND ep.class = 1
               AND ep.name = 'MS_Description'
             WHERE i.index_id <= 1
             GROUP BY s.name, t.name
             ORDER BY s.name, t.name"#,
                &[],
            )
            .await?;

        Ok(rows
            .iter()
            .map(|r| TableInfo {
                schema: r.get_string("schema_name"),
                name: r.get_string("table_name"),
                row_count: r.get_i64("row_count").unwrap_or(0),
                size_mb: round2(r.get_f64("size_mb").unwrap_or(0.0)),
                description: r.get_string("description"),
            })
            .collect())
    }

    async fn list_columns(&self, database: &str, table: &str) -> Result<Vec<ColumnInfo>> {
        let mut conn = self.open(database).await?;
        let rows = conn
            .query(
                r#"
            SELECT c.name AS column_name,
                   t.name AS data_type,
                   CAST(c.max_length AS INT) AS max_length,
                   CAST(c.precision AS INT) AS precision,
                   CAST(c.scale AS INT) AS scale,
                   c.is_nullable,
                   c.is_identity,
                   CASE WHEN pk.column_id IS NOT NULL THEN 1 ELSE 0 END AS is_primary_key,
                   ISNULL(dc.definition, '') AS default_value,
                   ISNULL(CAST(ep.value AS NVARCHAR(500)), '') AS description
              FROM sys.columns c
              JOIN sys.types t ON c.user_type_id = t.user_type_id
              LEFT JOIN sys.default_constraints dc ON c.default_object_id = dc.object_id
              LEFT JOIN sys.extended_properties ep
                ON ep.major_id = c.object_id AND ep.minor_id = c.column_id
               AND ep.class = 1 AND ep.name = 'MS_Description'
              LEFT JOIN (
                    SELECT ic.object_id, ic.column_id
                      FROM sys.index_columns ic
                      JOIN sys.indexes i ON ic.object_id = i.object_id AND ic.index_id = i.index_id
                     WHERE i.is_primary_key = 1
              ) pk ON c.object_id = pk.object_id AND c.column_id = pk.column_id
             WHERE c.object_id = OBJECT_ID(@P1)
             ORDER BY c.column_id"#,
                &[SqlValue::from(table)],
            )
            .await?;

        Ok(rows
            .iter()
            .map(|r| {
                let max_length = r.get_i64("max_length").unwrap_or(0) as i32;
                ColumnInfo {
                    name: r.get_string("column_name"),
                    data_type: format_mssql_type(
                        r.get_str("data_type").unwrap_or_default(),
                        max_length,
                        r.get_i64("precision").unwrap_or(0) as u8,
                        r.get_i64("scale").unwrap_or(0) as u8,
                    )
                    .to_uppercase(),
                    max_length,
                    is_nullable: r.get_bool("is_nullable"),
                    is_identity: r.get_bool("is_identity"),
                    is_primary_key: r.get_bool("is_primary_key"),
                    default_value: r
                        .get_string("default_value")
                        .trim_start_matches('(')
                        .trim_end_matches(')')
                        .to_string(),
                    description: r.get_string("description"),
                }
            })
            .collect())
    }

    async fn get_size(&self, database: &str) -> Result<f64> {
        let mut conn = self.open("master").await?;
        let rows = conn
            .query(
                "SELECT SUM(CAST(size AS BIGINT)) * 8.0 / 1024 AS size_mb FROM sys.master_files WHERE database_id = DB_ID(@P1)",
                &[SqlValue::from(database)],
            )
            .await?;
        Ok(round2(
            rows.first().and_then(|r| r.get_f64("size_mb")).unwrap_or(0.0),
        ))
    }

    async fn check_server_health(&self) -> ServerHealth {
        let mut report = HealthReport::default();

        let start = Instant::now();
        let version = self.test_connection().await;
        let elapsed = start.elapsed().as_millis();

        match &version {
            Ok(v) => report.push(
                HealthCheck::new("connection", HealthStatus::Normal, "connected", v.clone()),
                String::new,
            ),
            Err(e) => report.push(
                HealthCheck::new("connection", HealthStatus::Error, "failed", e.to_string()),
                || format!("server connection failed: {}", e),
            ),
        }
        report.push(response_time_check(elapsed), || {
            format!("slow response: {}ms", elapsed)
        });

        if version.is_ok() {
            match self.open("master").await {
                Ok(mut conn) => mssql_resource_checks(&mut conn, &mut report).await,
                Err(e) => report.fail(format!("health check aborted: {}", e)),
            }
        }

        ServerHealth {
            server_id: self.server.id,
            server_name: self.server.name.clone(),
            host: self.server.host.clone(),
            port: self.server.port(),
            checked_at: Utc::now(),
            report,
        }
    }

    async fn check_database_health(&self, database: &str) -> DatabaseHealth {
        let mut report = HealthReport::default();

        match self.open("master").await {
            Ok(mut conn) => {
                let state = Self::try_query(
                    &mut conn,
                    &format!(
                        "SELECT state_desc, recovery_model_desc FROM sys.databases WHERE name = {}",
                        crate::core::identifier::quote_literal(database)
                    ),
                )
                .await
                .and_then(|rows| rows.into_iter().next());

                let state_desc = state
                    .as_ref()
                    .map(|r| r.get_string("state_desc"))
                    .unwrap_or_else(|| "UNKNOWN".to_string());
                let status = if state_desc == "ONLINE" {
                    HealthStatus::Normal
                } else {
                    HealthStatus::Error
                };
                report.push(
                    HealthCheck::new("state", status, state_desc.clone(), "-"),
                    || format!("database state is {}", state_desc),
                );
                if let Some(row) = &state {
                    report.push(
                        HealthCheck::new(
                            "recovery_model",
                            HealthStatus::Normal,
                            row.get_string("recovery_model_desc"),
                            "-",
                        ),
                        String::new,
                    );
                }

                let sizes = Self::try_query(
                    &mut conn,
                    &format!(
                        "SELECT type_desc, SUM(CAST(size AS BIGINT)) * 8 / 1024 AS size_mb \
                         FROM sys.master_files WHERE database_id = DB_ID({}) GROUP BY type_desc",
                        crate::core::identifier::quote_literal(database)
                    ),
                )
                .await;
                match sizes {
                    Some(rows) => {
                        for row in rows {
                            let kind = row.get_string("type_desc").to_lowercase();
                            let mb = row.get_i64("size_mb").unwrap_or(0);
                            report.push(
                                HealthCheck::new(
                                    format!("{}_size", kind),
                                    HealthStatus::Normal,
                                    format!("{}MB", mb),
                                    "-",
                                ),
                                String::new,
                            );
                        }
                    }
                    None => report.push(HealthCheck::unavailable("file_size"), String::new),
                }
            }
            Err(e) => report.fail(format!("database check failed: {}", e)),
        }

        DatabaseHealth {
            db_name: database.to_string(),
            checked_at: Utc::now(),
            report,
        }
    }
}

/// Memory, disk, blocking and long-running query checks.
async fn mssql_resource_checks(conn: &mut MssqlConnection, report: &mut HealthReport) {
    let memory = MssqlDriver::try_query(
        conn,
        "SELECT total_physical_memory_kb / 1024 AS total_mb, available_physical_memory_kb / 1024 AS available_mb FROM sys.dm_os_sys_memory",
    )
    .await
    .and_then(|rows| rows.into_iter().next());
    match memory.and_then(|r| Some((r.get_i64("total_mb")?, r.get_i64("available_mb")?))) {
        Some((total, available)) if total > 0 => {
            let used = total - available;
            let percent = used * 100 / total;
            report.push(
                HealthCheck::new(
                    "memory",
                    HealthStatus::grade(percent as f64, 80.0, 95.0),
                    format!("{}%", percent),
                    format!("{}MB / {}MB", used, total),
                ),
                || format!("high memory usage: {}%", percent),
            );
        }
        _ => report.push(HealthCheck::unavailable("memory"), String::new),
    }

    let disks = MssqlDriver::try_query(
        conn,
        r#"SELECT DISTINCT vs.volume_mount_point AS drive,
                  vs.total_bytes / 1073741824 AS total_gb,
                  vs.available_bytes / 1073741824 AS free_gb
             FROM sys.master_files mf
            CROSS APPLY sys.dm_os_volume_stats(mf.database_id, mf.file_id) vs"#,
    )
    .await;
    match disks {
        Some(rows) => {
            for row in rows {
                let total = row.get_i64("total_gb").unwrap_or(0);
                if total <= 0 {
                    continue;
                }
                let free = row.get_i64("free_gb").unwrap_or(0);
                let free_percent = free * 100 / total;
                let status = if free_percent > 20 {
                    HealthStatus::Normal
                } else if free_percent > 5 {
                    HealthStatus::Warning
                } else {
                    HealthStatus::Error
                };
                let drive = row.get_string("drive").trim().to_string();
                report.push(
                    HealthCheck::new(
                        format!("disk {}", drive),
                        status,
                        format!("{}% used", 100 - free_percent),
                        format!("free {}GB / total {}GB", free, total),
                    ),
                    || format!("low free space on {}: {}GB", drive, free),
                );
            }
        }
        None => report.push(HealthCheck::unavailable("disk"), String::new),
    }

    let blocked = MssqlDriver::try_query(
        conn,
        "SELECT COUNT(*) AS blocked_count FROM sys.dm_exec_requests WHERE blocking_session_id > 0",
    )
    .await
    .and_then(|rows| rows.first().and_then(|r| r.get_i64("blocked_count")));
    if let Some(count) = blocked {
        report.push(
            HealthCheck::new(
                "blocked_sessions",
                HealthStatus::grade_count(count, 5),
                count.to_string(),
                "0 recommended",
            ),
            || format!("blocked sessions: {}", count),
        );
    }

    let long_running = MssqlDriver::try_query(
        conn,
        r#"SELECT COUNT(*) AS long_query_count
             FROM sys.dm_exec_requests r
            WHERE r.status = 'running'
              AND r.start_time < DATEADD(MINUTE, -1, GETDATE())
              AND r.session_id > 50"#,
    )
    .await
    .and_then(|rows| rows.first().and_then(|r| r.get_i64("long_query_count")));
    if let Some(count) = long_running {
        report.push(
            HealthCheck::new(
                "long_running_queries",
                HealthStatus::grade_count(count, 3),
                count.to_string(),
                "running over 1 minute",
            ),
            || format!("long-running queries: {}", count),
        );
    }
}

/// Render a SQL Server column type from catalog metadata.
///
/// `max_length` is in bytes as reported by `sys.columns`; n-types are
/// halved and `-1` renders as `(max)`.
pub fn format_mssql_type(data_type: &str, max_length: i32, precision: u8, scale: u8) -> String {
    let dt = data_type.to_lowercase();
    match dt.as_str() {
        "nvarchar" | "nchar" => {
            if max_length == -1 {
                format!("{}(max)", dt)
            } else {
                format!("{}({})", dt, (max_length / 2).max(1))
            }
        }
        "varchar" | "char" | "varbinary" | "binary" => {
            if max_length == -1 {
                format!("{}(max)", dt)
            } else {
                format!("{}({})", dt, max_length.max(1))
            }
        }
        "decimal" | "numeric" => format!("{}({},{})", dt, precision, scale),
        "datetime2" | "time" | "datetimeoffset" => format!("{}({})", dt, scale),
        _ => dt,
    }
}

fn escape_like(prefix: &str) -> String {
    prefix
        .replace('[', "[[]")
        .replace('%', "[%]")
        .replace('_', "[_]")
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn convert_row(row: tiberius::Row) -> Row {
    let columns = row
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();
    let values = row.into_iter().map(column_data_to_value).collect();
    Row::new(columns, values)
}

/// Convert a TDS cell into an owned [`SqlValue`].
fn column_data_to_value(data: ColumnData<'static>) -> SqlValue {
    match data {
        ColumnData::U8(v) => v
            .map(|v| SqlValue::I16(i16::from(v)))
            .unwrap_or(SqlValue::Null(SqlNullType::I16)),
        ColumnData::I16(v) => v.map(SqlValue::I16).unwrap_or(SqlValue::Null(SqlNullType::I16)),
        ColumnData::I32(v) => v.map(SqlValue::I32).unwrap_or(SqlValue::Null(SqlNullType::I32)),
        ColumnData::I64(v) => v.map(SqlValue::I64).unwrap_or(SqlValue::Null(SqlNullType::I64)),
        ColumnData::F32(v) => v.map(SqlValue::F32).unwrap_or(SqlValue::Null(SqlNullType::F32)),
        ColumnData::F64(v) => v.map(SqlValue::F64).unwrap_or(SqlValue::Null(SqlNullType::F64)),
        ColumnData::Bit(v) => v.map(SqlValue::Bool).unwrap_or(SqlValue::Null(SqlNullType::Bool)),
        ColumnData::String(v) => v
            .map(|s| SqlValue::String(s.into_owned()))
            .unwrap_or(SqlValue::Null(SqlNullType::String)),
        ColumnData::Guid(v) => v.map(SqlValue::Uuid).unwrap_or(SqlValue::Null(SqlNullType::Uuid)),
        ColumnData::Binary(v) => v
            .map(|b| SqlValue::Bytes(b.into_owned()))
            .unwrap_or(SqlValue::Null(SqlNullType::Bytes)),
        ColumnData::Numeric(v) => match v {
            Some(n) => Decimal::try_from_i128_with_scale(n.value(), u32::from(n.scale()))
                .map(SqlValue::Decimal)
                .unwrap_or_else(|_| SqlValue::F64(f64::from(n))),
            None => SqlValue::Null(SqlNullType::Decimal),
        },
        ColumnData::Xml(v) => v
            .map(|x| SqlValue::String(x.into_owned().into_string()))
            .unwrap_or(SqlValue::Null(SqlNullType::String)),
        other @ (ColumnData::DateTime(_)
        | ColumnData::SmallDateTime(_)
        | ColumnData::DateTime2(_)) => NaiveDateTime::from_sql(&other)
            .ok()
            .flatten()
            .map(SqlValue::DateTime)
            .unwrap_or(SqlValue::Null(SqlNullType::DateTime)),
        other @ ColumnData::Date(_) => chrono::NaiveDate::from_sql(&other)
            .ok()
            .flatten()
            .map(SqlValue::Date)
            .unwrap_or(SqlValue::Null(SqlNullType::Date)),
        other @ ColumnData::Time(_) => chrono::NaiveTime::from_sql(&other)
            .ok()
            .flatten()
            .map(SqlValue::Time)
            .unwrap_or(SqlValue::Null(SqlNullType::Time)),
        other @ ColumnData::DateTimeOffset(_) => {
            chrono::DateTime::<chrono::FixedOffset>::from_sql(&other)
                .ok()
                .flatten()
                .map(SqlValue::DateTimeOffset)
                .unwrap_or(SqlValue::Null(SqlNullType::DateTimeOffset))
        }
    }
}

/// Convert a [`SqlValue`] into a boxed tiberius parameter.
fn sql_value_to_sql_param(value: &SqlValue) -> Box<dyn ToSql> {
    match value {
        SqlValue::Null(null_type) => match null_type {
            SqlNullType::Bool => Box::new(Option::<bool>::None),
            SqlNullType::I16 => Box::new(Option::<i16>::None),
            SqlNullType::I32 => Box::new(Option::<i32>::None),
            SqlNullType::I64 => Box::new(Option::<i64>::None),
            SqlNullType::F32 => Box::new(Option::<f32>::None),
            SqlNullType::F64 => Box::new(Option::<f64>::None),
            SqlNullType::String => Box::new(Option::<String>::None),
            SqlNullType::Bytes => Box::new(Option::<Vec<u8>>::None),
            SqlNullType::Uuid => Box::new(Option::<uuid::Uuid>::None),
            SqlNullType::Decimal => Box::new(Option::<Decimal>::None),
            SqlNullType::DateTime | SqlNullType::Date => {
                Box::new(Option::<NaiveDateTime>::None)
            }
            SqlNullType::DateTimeOffset => {
                Box::new(Option::<chrono::DateTime<chrono::FixedOffset>>::None)
            }
            SqlNullType::Time => Box::new(Option::<chrono::NaiveTime>::None),
        },
        SqlValue::Bool(b) => Box::new(*b),
        SqlValue::I16(i) => Box::new(*i),
        SqlValue::I32(i) => Box::new(*i),
        SqlValue::I64(i) => Box::new(*i),
        SqlValue::F32(f) => Box::new(*f),
        SqlValue::F64(f) => Box::new(*f),
        SqlValue::String(s) => Box::new(s.clone()),
        SqlValue::Bytes(b) => Box::new(b.clone()),
        SqlValue::Uuid(u) => Box::new(*u),
        SqlValue::Decimal(d) => Box::new(*d),
        SqlValue::DateTime(dt) => Box::new(*dt),
        SqlValue::DateTimeOffset(dto) => Box::new(*dto),
        SqlValue::Date(d) => Box::new(*d),
        SqlValue::Time(t) => Box::new(*t),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_mssql_type() {
        assert_eq!(format_mssql_type("nvarchar", 100, 0, 0), "nvarchar(50)");
        assert_eq!(format_mssql_type("NVARCHAR", -1, 0, 0), "nvarchar(max)");
        assert_eq!(format_mssql_type("varchar", 20, 0, 0), "varchar(20)");
        assert_eq!(format_mssql_type("varbinary", -1, 0, 0), "varbinary(max)");
        assert_eq!(format_mssql_type("decimal", 9, 18, 2), "decimal(18,2)");
        assert_eq!(format_mssql_type("datetime2", 8, 27, 7), "datetime2(7)");
        assert_eq!(format_mssql_type("int", 4, 10, 0), "int");
    }

    #[test]
    fn test_column_data_conversion() {
        assert_eq!(column_data_to_value(ColumnData::U8(Some(7))), SqlValue::I16(7));
        assert_eq!(
            column_data_to_value(ColumnData::String(None)),
            SqlValue::Null(SqlNullType::String)
        );
        assert_eq!(
            column_data_to_value(ColumnData::String(Some("ONLINE".into()))),
            SqlValue::String("ONLINE".to_string())
        );
        assert_eq!(
            column_data_to_value(ColumnData::Bit(Some(true))),
            SqlValue::Bool(true)
        );
    }

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("ACC_"), "ACC[_]");
        assert_eq!(escape_like("a%b"), "a[%]b");
    }

    #[test]
    fn test_build_config_uses_record() {
        let mut server = ServerRecord::mssql(1, "sql01", "sa", "pw");
        server.port = Some(14330);
        let driver = MssqlDriver::new(server, ConnectionConfig::default());
        let config = driver.build_config("master");
        assert_eq!(config.get_addr(), "sql01:14330");
    }
}
