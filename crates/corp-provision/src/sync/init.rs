//! Single-table initialization with tenant code rewriting.
//!
//! Copies one table from a template (or a sibling tenant) into a tenant
//! database, rewriting the tenant code column on the way with
//! `REPLACE(col, source_code, target_code)`, and deletes table data either
//! for one tenant code or entirely.

use super::bulk::{stream_rows, InsertTarget};
use super::{count_rows, default_true, insertable_columns, truncate_table, Endpoint, TableRef};
use crate::config::{ConnectionConfig, SyncConfig};
use crate::core::identifier::{qualify_mssql, quote_literal, quote_mssql, validate_identifier};
use crate::core::SqlValue;
use crate::driver::{driver_factory, Driver, DriverFactory};
use crate::error::{ProvisionError, Result};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Column names that carry the tenant code, in lookup order.
pub const CODE_COLUMN_CANDIDATES: &[&str] =
    &["CORP_CD", "COMPANY_CD", "CO_CD", "CMPNY_CD", "CORP_CODE"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableInitRequest {
    pub source: Endpoint,
    pub target: Endpoint,
    pub table: TableRef,
    /// Tenant code as stored in the source rows.
    pub source_code: String,
    /// Tenant code written into the target rows.
    pub target_code: String,
    /// Detected from [`CODE_COLUMN_CANDIDATES`] when absent.
    #[serde(default)]
    pub code_column: Option<String>,
    #[serde(default = "default_true")]
    pub truncate_before: bool,
    #[serde(default = "default_true")]
    pub replace_code: bool,
    /// Copy identity values as-is (default: false).
    #[serde(default)]
    pub keep_identity: bool,
}

impl TableInitRequest {
    pub fn new(
        source: Endpoint,
        target: Endpoint,
        table: TableRef,
        source_code: impl Into<String>,
        target_code: impl Into<String>,
    ) -> Self {
        Self {
            source,
            target,
            table,
            source_code: source_code.into(),
            target_code: target_code.into(),
            code_column: None,
            truncate_before: true,
            replace_code: true,
            keep_identity: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_identifier(&self.source.database)?;
        validate_identifier(&self.target.database)?;
        validate_identifier(&self.table.schema)?;
        validate_identifier(&self.table.name)?;
        if let Some(column) = &self.code_column {
            validate_identifier(column)?;
        }
        Ok(())
    }

    /// Rewriting needs both codes; an empty one disables it.
    fn rewrites_code(&self) -> bool {
        self.replace_code && !self.source_code.is_empty() && !self.target_code.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableInitResult {
    pub success: bool,
    pub table: String,
    pub source_db: String,
    pub target_db: String,
    pub source_code: String,
    pub target_code: String,
    pub code_column: Option<String>,
    pub rows_copied: u64,
    /// Copied rows whose code column contained the source code.
    pub rows_replaced: u64,
    pub elapsed_seconds: f64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDeleteRequest {
    pub target: Endpoint,
    pub table: TableRef,
    /// Delete only this tenant's rows; the whole table when absent.
    #[serde(default)]
    pub tenant_code: Option<String>,
    #[serde(default)]
    pub code_column: Option<String>,
}

impl TableDeleteRequest {
    pub fn validate(&self) -> Result<()> {
        validate_identifier(&self.target.database)?;
        validate_identifier(&self.table.schema)?;
        validate_identifier(&self.table.name)?;
        if let Some(column) = &self.code_column {
            validate_identifier(column)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDeleteResult {
    pub success: bool,
    pub table: String,
    pub target_db: String,
    pub code_column: Option<String>,
    pub rows_deleted: u64,
    pub elapsed_seconds: f64,
    pub error: Option<String>,
}

struct Copied {
    code_column: Option<String>,
    rows_copied: u64,
    rows_replaced: u64,
}

/// Initializes and clears single tables.
#[derive(Clone)]
pub struct TableInitializer {
    config: SyncConfig,
    drivers: DriverFactory,
}

impl TableInitializer {
    pub fn new(config: SyncConfig, connection: ConnectionConfig) -> Self {
        Self {
            config,
            drivers: driver_factory(connection),
        }
    }

    pub fn with_driver_factory(mut self, drivers: DriverFactory) -> Self {
        self.drivers = drivers;
        self
    }

    /// Copy one table from source to target.
    ///
    /// Returns `Err` only for an invalid request; copy failures are
    /// reported inside the [`TableInitResult`].
    pub async fn init_table(&self, request: &TableInitRequest) -> Result<TableInitResult> {
        request.validate()?;
        let started = Instant::now();
        let mut result = TableInitResult {
            success: false,
            table: request.table.to_string(),
            source_db: request.source.database.clone(),
            target_db: request.target.database.clone(),
            source_code: request.source_code.clone(),
            target_code: request.target_code.clone(),
            code_column: None,
            rows_copied: 0,
            rows_replaced: 0,
            elapsed_seconds: 0.0,
            error: None,
        };

        match self.copy(request).await {
            Ok(copied) => {
                info!(
                    "Initialized {} in {}: {} row(s), {} rewritten",
                    request.table, request.target.database, copied.rows_copied, copied.rows_replaced
                );
                result.success = true;
                result.code_column = copied.code_column;
                result.rows_copied = copied.rows_copied;
                result.rows_replaced = copied.rows_replaced;
            }
            Err(e) => {
                warn!("Initializing {} failed: {}", request.table, e);
                result.error = Some(e.to_string());
            }
        }
        result.elapsed_seconds = started.elapsed().as_secs_f64();
        Ok(result)
    }

    async fn copy(&self, request: &TableInitRequest) -> Result<Copied> {
        let source = (self.drivers)(&request.source.server)?;
        let target = (self.drivers)(&request.target.server)?;
        let (source_db, target_db) = (&request.source.database, &request.target.database);
        let table = &request.table;

        let columns = insertable_columns(source.as_ref(), source_db, &table.schema, &table.name).await?;
        let code_column = resolve_code_column(&columns, request.code_column.as_deref())?;
        let has_identity = columns.iter().any(|(_, identity)| *identity);
        let selected: Vec<&str> = columns
            .iter()
            .filter(|(_, identity)| request.keep_identity || !identity)
            .map(|(name, _)| name.as_str())
            .collect();
        if selected.is_empty() {
            return Err(ProvisionError::Validation(format!(
                "{} has no insertable columns",
                table
            )));
        }

        let rewrite = code_column.as_deref().filter(|_| request.rewrites_code());
        let (from, to) = (
            quote_literal(&request.source_code),
            quote_literal(&request.target_code),
        );
        let mut column_list = Vec::with_capacity(selected.len());
        let mut select_list = Vec::with_capacity(selected.len());
        for name in &selected {
            let quoted = quote_mssql(name)?;
            select_list.push(match rewrite {
                Some(column) if column.eq_ignore_ascii_case(name) => {
                    format!("REPLACE({q}, {from}, {to}) AS {q}", q = quoted, from = from, to = to)
                }
                _ => quoted.clone(),
            });
            column_list.push(quoted);
        }
        let qualified = qualify_mssql(&table.schema, &table.name)?;

        let rows_replaced = match rewrite {
            Some(column) => {
                let sql = format!(
                    "SELECT COUNT_BIG(*) AS row_count FROM {} WHERE CHARINDEX({}, {}) > 0",
                    qualified,
                    from,
                    quote_mssql(column)?
                );
                let rows = source.execute_query(source_db, &sql, &[]).await?;
                rows.first()
                    .and_then(|r| r.get_i64("row_count"))
                    .unwrap_or_default()
                    .max(0) as u64
            }
            None => 0,
        };

        let mut target_conn = target.connect(target_db).await?;
        if request.truncate_before {
            truncate_table(target_conn.as_mut(), &qualified).await?;
        }
        let mut source_conn = source.connect(source_db).await?;
        let select = format!("SELECT {} FROM {}", select_list.join(", "), qualified);
        debug!("Initializing {} with {}", table, select);
        let column_list = column_list.join(", ");
        let rows_copied = stream_rows(
            source_conn.as_mut(),
            &select,
            target_conn.as_mut(),
            &InsertTarget {
                table: &qualified,
                column_list: &column_list,
                width: selected.len(),
                identity_insert: request.keep_identity && has_identity,
            },
            self.config.fallback_batch_size,
        )
        .await?;
        target_conn.close().await?;
        source_conn.close().await?;

        Ok(Copied {
            code_column,
            rows_copied,
            rows_replaced: rows_replaced.min(rows_copied),
        })
    }

    /// Delete a tenant's rows from a table, or empty it entirely.
    ///
    /// Returns `Err` only for an invalid request.
    pub async fn delete_table_data(&self, request: &TableDeleteRequest) -> Result<TableDeleteResult> {
        request.validate()?;
        let started = Instant::now();
        let mut result = TableDeleteResult {
            success: false,
            table: request.table.to_string(),
            target_db: request.target.database.clone(),
            code_column: None,
            rows_deleted: 0,
            elapsed_seconds: 0.0,
            error: None,
        };

        match self.delete(request).await {
            Ok((column, deleted)) => {
                info!(
                    "Deleted {} row(s) from {} in {}",
                    deleted, request.table, request.target.database
                );
                result.success = true;
                result.code_column = column;
                result.rows_deleted = deleted;
            }
            Err(e) => {
                warn!("Deleting from {} failed: {}", request.table, e);
                result.error = Some(e.to_string());
            }
        }
        result.elapsed_seconds = started.elapsed().as_secs_f64();
        Ok(result)
    }

    async fn delete(&self, request: &TableDeleteRequest) -> Result<(Option<String>, u64)> {
        let target = (self.drivers)(&request.target.server)?;
        let db = &request.target.database;
        let table = &request.table;
        let qualified = qualify_mssql(&table.schema, &table.name)?;

        let Some(code) = request.tenant_code.as_deref().filter(|c| !c.is_empty()) else {
            let before = count_rows(target.as_ref(), db, &qualified).await?;
            let mut conn = target.connect(db).await?;
            truncate_table(conn.as_mut(), &qualified).await?;
            conn.close().await?;
            return Ok((None, before.max(0) as u64));
        };

        // Never fall back to emptying the table when a code was asked for.
        let columns = insertable_columns(target.as_ref(), db, &table.schema, &table.name).await?;
        let column = resolve_code_column(&columns, request.code_column.as_deref())?
            .ok_or_else(|| {
                ProvisionError::Validation(format!("{} has no tenant code column", table))
            })?;

        let sql = format!("DELETE FROM {} WHERE {} = @P1", qualified, quote_mssql(&column)?);
        let deleted = target.execute_non_query(db, &sql, &[SqlValue::from(code)]).await?;
        Ok((Some(column), deleted))
    }
}

/// The requested code column as the table spells it, or the first
/// candidate the table has.
fn resolve_code_column(columns: &[(String, bool)], requested: Option<&str>) -> Result<Option<String>> {
    let find = |wanted: &str| {
        columns
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(wanted))
            .map(|(name, _)| name.clone())
    };
    match requested {
        Some(wanted) => find(wanted)
            .map(Some)
            .ok_or_else(|| ProvisionError::not_found(format!("column {}", wanted))),
        None => Ok(CODE_COLUMN_CANDIDATES.iter().find_map(|c| find(*c))),
    }
}
