//! Table sync between two SQL Server databases.
//!
//! A job copies an ordered list of tables, one at a time, with one of two
//! strategies:
//!
//! - [`SyncStrategy::Linked`]: `INSERT .. SELECT` run on the target through
//!   a server link, tested once before the first table
//! - [`SyncStrategy::BulkPipeline`]: `bcp` export/import or the batched
//!   fallback, bracketed by disabling constraints and triggers on every
//!   table of the job and re-enabling them afterwards
//!
//! Every copied table is verified by comparing `COUNT_BIG(*)` on both
//! sides. Per-table failures never stop the job; only cancellation does,
//! and it is checked between tables.
//!
//! [`init`] covers single-table initialization with tenant code rewriting.

pub mod bulk;
pub mod init;
pub mod job;
pub mod linked;
pub mod result;

pub use bulk::{locate_bcp, BulkPipeline};
pub use init::{
    TableDeleteRequest, TableDeleteResult, TableInitRequest, TableInitResult, TableInitializer,
};
pub use job::{JobRegistry, JobStatus, SyncJob};
pub use linked::{list_linked_databases, list_linked_servers, test_linked_server, LinkedServer};
pub use result::{CopyMethod, TableSyncResult, TableSyncStatus};

use crate::catalog::ServerRecord;
use crate::cloner::COPY_COLUMNS_SQL;
use crate::config::{ConnectionConfig, SyncConfig};
use crate::core::identifier::{qualify_mssql, qualify_mssql_linked, validate_identifier};
use crate::core::SqlValue;
use crate::driver::{driver_factory, Connection, Driver, DriverFactory};
use crate::error::{ProvisionError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A table to sync, `schema.name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRef {
    #[serde(default = "default_schema")]
    pub schema: String,
    pub name: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Parse `table`, `schema.table` or `[schema].[table]`.
    pub fn parse(name: &str) -> Result<Self> {
        let strip = |s: &str| s.trim().trim_start_matches('[').trim_end_matches(']').to_string();
        let table = match name.split_once('.') {
            Some((schema, name)) => Self::new(strip(schema), strip(name)),
            None => Self::new(default_schema(), strip(name)),
        };
        validate_identifier(&table.schema)?;
        validate_identifier(&table.name)?;
        Ok(table)
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// One side of a sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub server: ServerRecord,
    pub database: String,
}

impl Endpoint {
    pub fn new(server: ServerRecord, database: impl Into<String>) -> Self {
        Self {
            server,
            database: database.into(),
        }
    }

    /// `host,port/database`
    pub fn descriptor(&self) -> String {
        format!("{}/{}", self.server.address(), self.database)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncStrategy {
    /// Copy through a link registered on the target server.
    Linked { link_name: String },
    /// Export/import with `bcp`, or batched inserts without it.
    BulkPipeline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOptions {
    pub strategy: SyncStrategy,

    /// Empty each target table first (default: true).
    #[serde(default = "default_true")]
    pub truncate_before: bool,

    /// Copy identity values as-is (default: true).
    #[serde(default = "default_true")]
    pub keep_identity: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            strategy: SyncStrategy::BulkPipeline,
            truncate_before: true,
            keep_identity: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    pub source: Endpoint,
    pub target: Endpoint,
    pub tables: Vec<TableRef>,
    #[serde(default)]
    pub options: SyncOptions,
}

impl SyncRequest {
    pub fn validate(&self) -> Result<()> {
        if self.tables.is_empty() {
            return Err(ProvisionError::Validation(
                "sync request names no tables".into(),
            ));
        }
        validate_identifier(&self.source.database)?;
        validate_identifier(&self.target.database)?;
        for table in &self.tables {
            validate_identifier(&table.schema)?;
            validate_identifier(&table.name)?;
        }
        if let SyncStrategy::Linked { link_name } = &self.options.strategy {
            validate_identifier(link_name)?;
        }
        Ok(())
    }
}

/// Runs sync jobs and tracks them in a [`JobRegistry`].
#[derive(Clone)]
pub struct SyncEngine {
    config: SyncConfig,
    drivers: DriverFactory,
    registry: JobRegistry,
}

impl SyncEngine {
    pub fn new(config: SyncConfig, connection: ConnectionConfig, registry: JobRegistry) -> Self {
        Self {
            config,
            drivers: driver_factory(connection),
            registry,
        }
    }

    pub fn with_driver_factory(mut self, drivers: DriverFactory) -> Self {
        self.drivers = drivers;
        self
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Register a job and run it on its own task.
    pub fn start(&self, request: SyncRequest) -> Result<Uuid> {
        request.validate()?;
        let (id, cancel) = self.register(&request);
        let engine = self.clone();
        tokio::spawn(async move {
            engine.execute(id, request, cancel).await;
        });
        Ok(id)
    }

    /// Register a job and run it to completion on the caller's task.
    pub async fn run_job(&self, request: SyncRequest) -> Result<SyncJob> {
        request.validate()?;
        let (id, cancel) = self.register(&request);
        self.execute(id, request, cancel).await;
        self.registry
            .get(id)
            .ok_or_else(|| ProvisionError::not_found(format!("sync job {}", id)))
    }

    pub fn snapshot(&self, id: Uuid) -> Option<SyncJob> {
        self.registry.get(id)
    }

    pub fn cancel(&self, id: Uuid) -> bool {
        let accepted = self.registry.cancel(id);
        if accepted {
            info!("Cancellation requested for sync job {}", id);
        }
        accepted
    }

    fn register(&self, request: &SyncRequest) -> (Uuid, CancellationToken) {
        let job = SyncJob::new(
            request.source.descriptor(),
            request.target.descriptor(),
            request.tables.len(),
        );
        let id = job.job_id;
        (id, self.registry.insert(job))
    }

    async fn execute(&self, id: Uuid, request: SyncRequest, cancel: CancellationToken) {
        self.registry.update(id, |job| {
            job.status = JobStatus::Running;
            job.started_at = Some(Utc::now());
        });
        info!(
            "Sync job {}: {} table(s) {} -> {}",
            id,
            request.tables.len(),
            request.source.descriptor(),
            request.target.descriptor()
        );

        let outcome = match &request.options.strategy {
            SyncStrategy::Linked { link_name } => {
                self.run_linked(id, &request, link_name, &cancel).await
            }
            SyncStrategy::BulkPipeline => self.run_bulk(id, &request, &cancel).await,
        };

        self.registry.update(id, |job| {
            job.current_table = None;
            job.finished_at = Some(Utc::now());
            job.status = match &outcome {
                Err(e) => {
                    job.error = Some(e.to_string());
                    JobStatus::Failed
                }
                Ok(true) => JobStatus::Cancelled,
                Ok(false) if job.results.iter().all(TableSyncResult::is_success) => {
                    JobStatus::Completed
                }
                Ok(false) => JobStatus::Failed,
            };
        });

        match (&outcome, self.registry.get(id)) {
            (Err(e), _) => error!("Sync job {} failed: {}", id, e),
            (Ok(_), Some(job)) => info!(
                "Sync job {} {:?}: {} ok, {} failed, {}/{} table(s)",
                id,
                job.status,
                job.success_count(),
                job.fail_count(),
                job.completed_tables,
                job.total_tables
            ),
            (Ok(_), None) => {}
        }
    }

    fn begin_table(&self, id: Uuid, table: &TableRef) {
        debug!("Sync job {}: {}", id, table);
        self.registry
            .update(id, |job| job.current_table = Some(table.to_string()));
    }

    fn finish_table(&self, id: Uuid, result: TableSyncResult) {
        if !result.is_success() {
            warn!(
                "{}.{}: {} {}",
                result.schema,
                result.table,
                result.status,
                result.error.as_deref().unwrap_or("")
            );
        }
        self.registry.update(id, |job| job.push_result(result));
    }

    fn add_warnings(&self, id: Uuid, warnings: Vec<String>) {
        if !warnings.is_empty() {
            self.registry.update(id, |job| job.warnings.extend(warnings));
        }
    }

    /// Returns `Ok(true)` when the job stopped on cancellation.
    async fn run_linked(
        &self,
        id: Uuid,
        request: &SyncRequest,
        link: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let target = (self.drivers)(&request.target.server)?;
        let link_error = linked::test_linked_server(target.as_ref(), link)
            .await
            .err()
            .map(|e| e.to_string());
        if let Some(message) = &link_error {
            warn!("Linked server {} unavailable: {}", link, message);
        }

        for table in &request.tables {
            if cancel.is_cancelled() {
                return Ok(true);
            }
            self.begin_table(id, table);
            let started = Instant::now();
            let result = match &link_error {
                Some(message) => {
                    TableSyncResult::failed(&table.schema, &table.name, message.clone(), started.elapsed())
                }
                None => match self.sync_linked_table(target.as_ref(), link, request, table, started).await {
                    Ok(result) => result,
                    Err(e) => TableSyncResult::failed(&table.schema, &table.name, e.to_string(), started.elapsed()),
                },
            };
            self.finish_table(id, result);
        }
        Ok(false)
    }

    async fn sync_linked_table(
        &self,
        target: &dyn Driver,
        link: &str,
        request: &SyncRequest,
        table: &TableRef,
        started: Instant,
    ) -> Result<TableSyncResult> {
        let target_db = &request.target.database;
        let local = qualify_mssql(&table.schema, &table.name)?;
        if !table_exists(target, target_db, &local).await? {
            return Ok(TableSyncResult::skipped(&table.schema, &table.name, "not present in target"));
        }
        linked::copy_table(target, link, &request.source.database, target_db, table, &request.options)
            .await?;

        let remote = qualify_mssql_linked(link, &request.source.database, &table.schema, &table.name)?;
        let source_count = count_rows(target, target_db, &remote).await?;
        let target_count = count_rows(target, target_db, &local).await?;
        Ok(TableSyncResult::verified(
            &table.schema,
            &table.name,
            CopyMethod::Linked,
            source_count,
            target_count,
            started.elapsed(),
        ))
    }

    /// Returns `Ok(true)` when the job stopped on cancellation.
    async fn run_bulk(&self, id: Uuid, request: &SyncRequest, cancel: &CancellationToken) -> Result<bool> {
        let source = (self.drivers)(&request.source.server)?;
        let target = (self.drivers)(&request.target.server)?;
        let pipeline = BulkPipeline::new(&self.config)?;
        let target_db = &request.target.database;

        let warnings = set_constraints(target.as_ref(), target_db, &request.tables, false).await;
        self.add_warnings(id, warnings);

        let mut cancelled = false;
        for table in &request.tables {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            self.begin_table(id, table);
            let started = Instant::now();
            let result = match self
                .sync_bulk_table(&pipeline, source.as_ref(), target.as_ref(), request, table, started)
                .await
            {
                Ok(result) => result,
                Err(e) => TableSyncResult::failed(&table.schema, &table.name, e.to_string(), started.elapsed()),
            };
            self.finish_table(id, result);
        }

        let warnings = set_constraints(target.as_ref(), target_db, &request.tables, true).await;
        self.add_warnings(id, warnings);
        Ok(cancelled)
    }

    async fn sync_bulk_table(
        &self,
        pipeline: &BulkPipeline,
        source: &dyn Driver,
        target: &dyn Driver,
        request: &SyncRequest,
        table: &TableRef,
        started: Instant,
    ) -> Result<TableSyncResult> {
        let (source_db, target_db) = (&request.source.database, &request.target.database);
        let qualified = qualify_mssql(&table.schema, &table.name)?;
        if !table_exists(target, target_db, &qualified).await? {
            return Ok(TableSyncResult::skipped(&table.schema, &table.name, "not present in target"));
        }
        let method = pipeline
            .copy_table(source, source_db, target, target_db, table, &request.options)
            .await?;

        let source_count = count_rows(source, source_db, &qualified).await?;
        let target_count = count_rows(target, target_db, &qualified).await?;
        Ok(TableSyncResult::verified(
            &table.schema,
            &table.name,
            method,
            source_count,
            target_count,
            started.elapsed(),
        ))
    }
}

/// Insertable (non-computed) columns of a table and whether each is an
/// identity column. `NotFound` when the table has none.
pub(crate) async fn insertable_columns(
    driver: &dyn Driver,
    database: &str,
    schema: &str,
    table: &str,
) -> Result<Vec<(String, bool)>> {
    let rows = driver
        .execute_query(
            database,
            COPY_COLUMNS_SQL,
            &[SqlValue::from(qualify_mssql(schema, table)?)],
        )
        .await?;
    if rows.is_empty() {
        return Err(ProvisionError::not_found(format!(
            "columns of {}.{}.{}",
            database, schema, table
        )));
    }
    Ok(rows
        .iter()
        .map(|r| (r.get_string("column_name"), r.get_bool("is_identity")))
        .collect())
}

/// `TRUNCATE TABLE`, or `DELETE FROM` when truncation is refused
/// (e.g. the table is referenced by a foreign key).
pub(crate) async fn truncate_table(conn: &mut dyn Connection, qualified: &str) -> Result<()> {
    if let Err(e) = conn.execute(&format!("TRUNCATE TABLE {}", qualified), &[]).await {
        debug!("TRUNCATE {} refused ({}), deleting instead", qualified, e);
        conn.execute(&format!("DELETE FROM {}", qualified), &[]).await?;
    }
    Ok(())
}

/// `COUNT_BIG(*)` of a (possibly linked) table name.
pub(crate) async fn count_rows(driver: &dyn Driver, database: &str, object: &str) -> Result<i64> {
    let sql = format!("SELECT COUNT_BIG(*) AS row_count FROM {}", object);
    let rows = driver.execute_query(database, &sql, &[]).await?;
    rows.first()
        .and_then(|r| r.get_i64("row_count"))
        .ok_or_else(|| {
            ProvisionError::execution(
                format!("row count of {}", object),
                "query returned no count",
            )
        })
}

async fn table_exists(driver: &dyn Driver, database: &str, qualified: &str) -> Result<bool> {
    let rows = driver
        .execute_query(
            database,
            "SELECT OBJECT_ID(@P1, N'U') AS object_id",
            &[SqlValue::from(qualified)],
        )
        .await?;
    Ok(rows.first().and_then(|r| r.get_i64("object_id")).is_some())
}

/// Disable or re-enable constraints and triggers on every table.
/// Failures come back as warnings.
async fn set_constraints(
    driver: &dyn Driver,
    database: &str,
    tables: &[TableRef],
    enable: bool,
) -> Vec<String> {
    let action = if enable { "enable" } else { "disable" };
    let mut warnings = Vec::new();
    let mut conn = match driver.connect(database).await {
        Ok(conn) => conn,
        Err(e) => {
            warnings.push(format!("{} constraints: {}", action, e));
            return warnings;
        }
    };
    for table in tables {
        let qualified = match qualify_mssql(&table.schema, &table.name) {
            Ok(q) => q,
            Err(e) => {
                warnings.push(format!("{} constraints on {}: {}", action, table, e));
                continue;
            }
        };
        let statements = if enable {
            [
                format!("ALTER TABLE {} WITH CHECK CHECK CONSTRAINT ALL", qualified),
                format!("ENABLE TRIGGER ALL ON {}", qualified),
            ]
        } else {
            [
                format!("ALTER TABLE {} NOCHECK CONSTRAINT ALL", qualified),
                format!("DISABLE TRIGGER ALL ON {}", qualified),
            ]
        };
        for sql in &statements {
            if let Err(e) = conn.execute(sql, &[]).await {
                warn!("Could not {} constraints on {}: {}", action, table, e);
                warnings.push(format!("{} constraints on {}: {}", action, table, e));
                break;
            }
        }
    }
    warnings
}

fn default_schema() -> String {
    "dbo".to_string()
}

fn default_true() -> bool {
    true
}
