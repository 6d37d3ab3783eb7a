//! PostgreSQL driver.
//!
//! Used for introspection and health checks of PostgreSQL servers in the
//! catalog. Provisioning and sync statements are SQL Server dialect and are
//! only ever sent to [`super::MssqlDriver`].

use super::health::{response_time_check, HealthCheck, HealthReport, HealthStatus};
use super::tls::TlsPolicy;
use super::{
    sql_context, with_timeout, ColumnInfo, Connection, DatabaseHealth, DatabaseInfo, Driver,
    ServerHealth, TableInfo,
};
use crate::catalog::ServerRecord;
use crate::config::ConnectionConfig;
use crate::core::{Row, SqlNullType, SqlValue};
use crate::error::{ProvisionError, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::TryStreamExt;
use rust_decimal::Decimal;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{Client, Config as PgConfig, NoTls, SimpleQueryMessage};
use tracing::debug;

/// PostgreSQL driver for one server record.
pub struct PostgresDriver {
    server: ServerRecord,
    options: ConnectionConfig,
}

impl PostgresDriver {
    pub fn new(server: ServerRecord, options: ConnectionConfig) -> Self {
        Self { server, options }
    }

    fn build_config(&self, database: &str) -> PgConfig {
        let mut config = PgConfig::new();
        config.host(&self.server.host);
        config.port(self.server.port());
        config.dbname(database);
        config.user(&self.server.username);
        config.password(&self.server.password);
        config.application_name("corp-provision");
        config.connect_timeout(self.options.login_timeout());
        config
    }

    async fn open(&self, database: &str) -> Result<PostgresConnection> {
        let context = format!("{}:{} / {}", self.server.host, self.server.port(), database);
        let config = self.build_config(database);

        let connect = async {
            match TlsPolicy::for_server(&self.server).connector() {
                None => {
                    let (client, connection) = config
                        .connect(NoTls)
                        .await
                        .map_err(|e| ProvisionError::connection(e, &context))?;
                    tokio::spawn(async move {
                        if let Err(e) = connection.await {
                            debug!("PostgreSQL connection closed: {}", e);
                        }
                    });
                    Ok::<_, ProvisionError>(client)
                }
                Some(tls) => {
                    let (client, connection) = config
                        .connect(tls)
                        .await
                        .map_err(|e| ProvisionError::connection(e, &context))?;
                    tokio::spawn(async move {
                        if let Err(e) = connection.await {
                            debug!("PostgreSQL connection closed: {}", e);
                        }
                    });
                    Ok(client)
                }
            }
        };

        let client = match tokio::time::timeout(self.options.login_timeout(), connect).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ProvisionError::connection(
                    format!("login timed out after {}s", self.options.login_timeout_secs),
                    context,
                ))
            }
        };
        debug!("Connected to {}", context);

        Ok(PostgresConnection {
            client,
            command_timeout: self.options.command_timeout(),
        })
    }

    async fn try_query(conn: &mut PostgresConnection, sql: &str) -> Option<Row> {
        match conn.query(sql, &[]).await {
            Ok(rows) => rows.into_iter().next(),
            Err(e) => {
                debug!("Health query failed: {}", e);
                None
            }
        }
    }
}

/// One PostgreSQL session.
pub struct PostgresConnection {
    client: Client,
    command_timeout: std::time::Duration,
}

#[async_trait]
impl Connection for PostgresConnection {
    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        let context = sql_context(sql);
        debug!("query: {}", context);
        let client = &self.client;
        with_timeout(self.command_timeout, &context, async {
            let boxed: Vec<Box<dyn ToSql + Sync + Send>> =
                params.iter().map(sql_value_to_pg_param).collect();
            let refs: Vec<&(dyn ToSql + Sync)> =
                boxed.iter().map(|b| b.as_ref() as &(dyn ToSql + Sync)).collect();
            let rows = client
                .query(sql, &refs)
                .await
                .map_err(|e| ProvisionError::from_postgres(e, &context))?;
            Ok(rows.iter().map(convert_row).collect())
        })
        .await
    }

    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        let context = sql_context(sql);
        debug!("execute: {}", context);
        let client = &self.client;
        with_timeout(self.command_timeout, &context, async {
            if params.is_empty() {
                let messages = client
                    .simple_query(sql)
                    .await
                    .map_err(|e| ProvisionError::from_postgres(e, &context))?;
                return Ok(messages
                    .iter()
                    .map(|m| match m {
                        SimpleQueryMessage::CommandComplete(n) => *n,
                        _ => 0,
                    })
                    .sum());
            }
            let boxed: Vec<Box<dyn ToSql + Sync + Send>> =
                params.iter().map(sql_value_to_pg_param).collect();
            let refs: Vec<&(dyn ToSql + Sync)> =
                boxed.iter().map(|b| b.as_ref() as &(dyn ToSql + Sync)).collect();
            client
                .execute(sql, &refs)
                .await
                .map_err(|e| ProvisionError::from_postgres(e, &context))
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
        let chunk_size = chunk_size.max(1);
        let no_params: Vec<&(dyn ToSql + Sync)> = Vec::new();
        let stream = self
            .client
            .query_raw(sql, no_params)
            .await
            .map_err(|e| ProvisionError::from_postgres(e, &context))?;
        let mut stream = std::pin::pin!(stream);

        let mut sent = 0u64;
        let mut chunk = Vec::with_capacity(chunk_size);
        while let Some(row) = stream
            .try_next()
            .await
            .map_err(|e| ProvisionError::from_postgres(e, &context))?
        {
            chunk.push(convert_row(&row));
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
impl Driver for PostgresDriver {
    fn server(&self) -> &ServerRecord {
        &self.server
    }

    async fn connect(&self, database: &str) -> Result<Box<dyn Connection>> {
        Ok(Box::new(self.open(database).await?))
    }

    async fn test_connection(&self) -> Result<String> {
        let mut conn = self.open(self.server.system_db()).await?;
        let rows = conn.query("SELECT version() AS version", &[]).await?;
        Ok(rows
            .first()
            .map(|r| r.get_string("version"))
            .unwrap_or_default())
    }

    async fn list_databases(&self, prefix: Option<&str>) -> Result<Vec<DatabaseInfo>> {
        let mut conn = self.open(self.server.system_db()).await?;
        let pattern = match prefix.filter(|p| !p.is_empty()) {
            Some(p) => format!("{}%", p.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")),
            None => "%".to_string(),
        };
        let rows = conn
            .query(
                r#"SELECT datname AS db_name,
                          CASE WHEN datallowconn THEN 'ONLINE' ELSE 'OFFLINE' END AS state,
                          (pg_database_size(datname) / 1048576.0)::float8 AS size_mb
                     FROM pg_database
                    WHERE NOT datistemplate
                      AND datname NOT IN ('postgres')
                      AND datname LIKE $1
                    ORDER BY datname"#,
                &[SqlValue::from(pattern)],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|r| DatabaseInfo {
                name: r.get_string("db_name"),
                created_at: None,
                state: r.get_string("state"),
                size_mb: round2(r.get_f64("size_mb").unwrap_or(0.0)),
            })
            .collect())
    }

    async fn list_tables(&self, database: &str) -> Result<Vec<TableInfo>> {
        let mut conn = self.open(database).await?;
        let rows = conn
            .query(
                r#"SELECT schemaname AS schema_name,
                          relname AS table_name,
                          n_live_tup AS row_count,
                          (pg_total_relation_size(relid) / 1048576.0)::float8 AS size_mb,
                          COALESCE(obj_description(relid, 'pg_class'), '') AS description
                     FROM pg_stat_user_tables
                    ORDER BY schemaname, relname"#,
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
        let (schema, name) = table.split_once('.').unwrap_or(("public", table));
        let rows = conn
            .query(
                r#"SELECT c.column_name,
                          c.data_type,
                          COALESCE(c.character_maximum_length, 0)::int4 AS max_length,
                          COALESCE(c.numeric_precision, 0)::int4 AS precision,
                          COALESCE(c.numeric_scale, 0)::int4 AS scale,
                          (c.is_nullable = 'YES') AS is_nullable,
                          (c.is_identity = 'YES' OR COALESCE(c.column_default, '') LIKE 'nextval(%') AS is_identity,
                          EXISTS (
                              SELECT 1
                                FROM information_schema.table_constraints tc
                                JOIN information_schema.key_column_usage k
                                  ON tc.constraint_name = k.constraint_name
                                 AND tc.table_schema = k.table_schema
                               WHERE tc.constraint_type = 'PRIMARY KEY'
                                 AND tc.table_schema = c.table_schema
                                 AND tc.table_name = c.table_name
                                 AND k.column_name = c.column_name
                          ) AS is_primary_key,
                          COALESCE(c.column_default, '') AS default_value,
                          COALESCE(col_description(
                              format('%I.%I', c.table_schema, c.table_name)::regclass,
                              c.ordinal_position::int), '') AS description
                     FROM information_schema.columns c
                    WHERE c.table_schema = $1 AND c.table_name = $2
                    ORDER BY c.ordinal_position"#,
                &[SqlValue::from(schema), SqlValue::from(name)],
            )
            .await?;

        Ok(rows
            .iter()
            .map(|r| {
                let base = r.get_string("data_type");
                let max_length = r.get_i64("max_length").unwrap_or(0) as i32;
                let data_type = match base.as_str() {
                    "character varying" | "character" if max_length > 0 => {
                        format!("{}({})", base, max_length)
                    }
                    "numeric" => format!(
                        "{}({},{})",
                        base,
                        r.get_i64("precision").unwrap_or(0),
                        r.get_i64("scale").unwrap_or(0)
                    ),
                    _ => base,
                };
                ColumnInfo {
                    name: r.get_string("column_name"),
                    data_type: data_type.to_uppercase(),
                    max_length,
                    is_nullable: r.get_bool("is_nullable"),
                    is_identity: r.get_bool("is_identity"),
                    is_primary_key: r.get_bool("is_primary_key"),
                    default_value: r.get_string("default_value"),
                    description: r.get_string("description"),
                }
            })
            .collect())
    }

    async fn get_size(&self, database: &str) -> Result<f64> {
        let mut conn = self.open(self.server.system_db()).await?;
        let rows = conn
            .query(
                "SELECT (pg_database_size($1) / 1048576.0)::float8 AS size_mb",
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
            match self.open(self.server.system_db()).await {
                Ok(mut conn) => {
                    let usage = Self::try_query(
                        &mut conn,
                        "SELECT (SELECT COUNT(*) FROM pg_stat_activity)::int8 AS used, \
                         current_setting('max_connections')::int8 AS max_conn",
                    )
                    .await;
                    match usage.and_then(|r| Some((r.get_i64("used")?, r.get_i64("max_conn")?))) {
                        Some((used, max)) if max > 0 => {
                            let percent = used * 100 / max;
                            report.push(
                                HealthCheck::new(
                                    "connections",
                                    HealthStatus::grade(percent as f64, 80.0, 95.0),
                                    format!("{}%", percent),
                                    format!("{} / {}", used, max),
                                ),
                                || format!("connection usage high: {}%", percent),
                            );
                        }
                        _ => report.push(HealthCheck::unavailable("connections"), String::new),
                    }

                    if let Some(count) = Self::try_query(
                        &mut conn,
                        "SELECT COUNT(*)::int8 AS blocked FROM pg_stat_activity WHERE wait_event_type = 'Lock'",
                    )
                    .await
                    .and_then(|r| r.get_i64("blocked"))
                    {
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

                    if let Some(count) = Self::try_query(
                        &mut conn,
                        "SELECT COUNT(*)::int8 AS long_running FROM pg_stat_activity \
                         WHERE state = 'active' AND now() - query_start > interval '1 minute'",
                    )
                    .await
                    .and_then(|r| r.get_i64("long_running"))
                    {
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
        match self.open(self.server.system_db()).await {
            Ok(mut conn) => {
                let row = conn
                    .query(
                        "SELECT datallowconn AS online, (pg_database_size(datname) / 1048576)::int8 AS size_mb \
                         FROM pg_database WHERE datname = $1",
                        &[SqlValue::from(database)],
                    )
                    .await
                    .ok()
                    .and_then(|rows| rows.into_iter().next());
                let online = row.as_ref().map(|r| r.get_bool("online")).unwrap_or(false);
                let state = if online { "ONLINE" } else { "UNKNOWN" };
                report.push(
                    HealthCheck::new(
                        "state",
                        if online { HealthStatus::Normal } else { HealthStatus::Error },
                        state,
                        "-",
                    ),
                    || format!("database state is {}", state),
                );
                if let Some(mb) = row.and_then(|r| r.get_i64("size_mb")) {
                    report.push(
                        HealthCheck::new("data_size", HealthStatus::Normal, format!("{}MB", mb), "-"),
                        String::new,
                    );
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

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn convert_row(row: &tokio_postgres::Row) -> Row {
    let columns = row.columns().iter().map(|c| c.name().to_string()).collect();
    let values = (0..row.len()).map(|idx| pg_value(row, idx)).collect();
    Row::new(columns, values)
}

/// Read one cell according to its wire type.
fn pg_value(row: &tokio_postgres::Row, idx: usize) -> SqlValue {
    macro_rules! cell {
        ($t:ty, $variant:expr, $null:expr) => {
            row.try_get::<_, Option<$t>>(idx)
                .ok()
                .flatten()
                .map($variant)
                .unwrap_or(SqlValue::Null($null))
        };
    }

    match *row.columns()[idx].type_() {
        Type::BOOL => cell!(bool, SqlValue::Bool, SqlNullType::Bool),
        Type::INT2 => cell!(i16, SqlValue::I16, SqlNullType::I16),
        Type::INT4 => cell!(i32, SqlValue::I32, SqlNullType::I32),
        Type::INT8 => cell!(i64, SqlValue::I64, SqlNullType::I64),
        Type::FLOAT4 => cell!(f32, SqlValue::F32, SqlNullType::F32),
        Type::FLOAT8 => cell!(f64, SqlValue::F64, SqlNullType::F64),
        Type::NUMERIC => cell!(Decimal, SqlValue::Decimal, SqlNullType::Decimal),
        Type::BYTEA => cell!(Vec<u8>, SqlValue::Bytes, SqlNullType::Bytes),
        Type::UUID => cell!(uuid::Uuid, SqlValue::Uuid, SqlNullType::Uuid),
        Type::TIMESTAMP => cell!(chrono::NaiveDateTime, SqlValue::DateTime, SqlNullType::DateTime),
        Type::TIMESTAMPTZ => cell!(
            chrono::DateTime<chrono::FixedOffset>,
            SqlValue::DateTimeOffset,
            SqlNullType::DateTimeOffset
        ),
        Type::DATE => cell!(chrono::NaiveDate, SqlValue::Date, SqlNullType::Date),
        Type::TIME => cell!(chrono::NaiveTime, SqlValue::Time, SqlNullType::Time),
        _ => cell!(String, SqlValue::String, SqlNullType::String),
    }
}

fn sql_value_to_pg_param(value: &SqlValue) -> Box<dyn ToSql + Sync + Send> {
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
            SqlNullType::DateTime => Box::new(Option::<chrono::NaiveDateTime>::None),
            SqlNullType::DateTimeOffset => {
                Box::new(Option::<chrono::DateTime<chrono::FixedOffset>>::None)
            }
            SqlNullType::Date => Box::new(Option::<chrono::NaiveDate>::None),
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
