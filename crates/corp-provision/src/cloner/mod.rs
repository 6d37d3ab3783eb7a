//! Schema and seed-data cloning from a template database.
//!
//! Two code paths, selected by whether source and target share a server:
//!
//! - same server: `SELECT * INTO .. WHERE 1=0` for structure and
//!   `INSERT .. SELECT` for data, both executed server-side on `master`
//! - cross server: `CREATE TABLE` synthesized from `sys.columns`, rows
//!   materialized from the source and inserted one at a time on the target
//!
//! Primary keys and descriptions are read from the source catalog and
//! re-applied on the target the same way for both paths. Only schema copy
//! is fatal; every other failure comes back as a warning.

pub mod ddl;

pub use ddl::{create_table_sql, PrimaryKey, SourceColumn};

use crate::config::CloneConfig;
use crate::core::identifier::{qualify_mssql, qualify_mssql_db, quote_mssql};
use crate::core::{Row, SqlValue};
use crate::driver::Driver;
use crate::error::{ProvisionError, Result};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

const SOURCE_TABLES_SQL: &str = "SELECT TABLE_NAME AS table_name FROM INFORMATION_SCHEMA.TABLES \
     WHERE TABLE_TYPE = 'BASE TABLE' AND TABLE_SCHEMA = @P1 ORDER BY TABLE_NAME";

const SOURCE_COLUMNS_SQL: &str = r#"
SELECT t.name  AS table_name,
       c.name  AS column_name,
       tp.name AS data_type,
       c.max_length,
       c.precision,
       c.scale,
       c.is_nullable,
       c.is_identity,
       CAST(IDENT_SEED(QUOTENAME(s.name) + '.' + QUOTENAME(t.name)) AS bigint) AS seed_value,
       CAST(IDENT_INCR(QUOTENAME(s.name) + '.' + QUOTENAME(t.name)) AS bigint) AS increment_value
  FROM sys.tables t
  JOIN sys.schemas s ON s.schema_id = t.schema_id
  JOIN sys.columns c ON c.object_id = t.object_id
  JOIN sys.types tp ON tp.user_type_id = c.user_type_id
 WHERE t.is_ms_shipped = 0 AND s.name = @P1
 ORDER BY t.name, c.column_id"#;

const PRIMARY_KEYS_SQL: &str = r#"
SELECT t.name       AS table_name,
       kc.name      AS pk_name,
       i.type_desc  AS index_type,
       STUFF((SELECT ',' + c.name
                FROM sys.index_columns ic
                JOIN sys.columns c ON c.object_id = ic.object_id AND c.column_id = ic.column_id
               WHERE ic.object_id = i.object_id AND ic.index_id = i.index_id AND ic.key_ordinal > 0
               ORDER BY ic.key_ordinal
                 FOR XML PATH(''), TYPE).value('.', 'nvarchar(max)'), 1, 1, '') AS key_columns
  FROM sys.key_constraints kc
  JOIN sys.indexes i ON i.object_id = kc.parent_object_id AND i.index_id = kc.unique_index_id
  JOIN sys.tables t ON t.object_id = kc.parent_object_id
  JOIN sys.schemas s ON s.schema_id = t.schema_id
 WHERE kc.type = 'PK' AND s.name = @P1"#;

const DESCRIPTIONS_SQL: &str = r#"
SELECT t.name AS table_name,
       ep.minor_id,
       COL_NAME(ep.major_id, ep.minor_id) AS column_name,
       CAST(ep.value AS nvarchar(4000)) AS description
  FROM sys.extended_properties ep
  JOIN sys.tables t ON t.object_id = ep.major_id
  JOIN sys.schemas s ON s.schema_id = t.schema_id
 WHERE ep.class = 1 AND ep.name = 'MS_Description' AND s.name = @P1
 ORDER BY t.name, ep.minor_id"#;

pub(crate) const COPY_COLUMNS_SQL: &str = "SELECT c.name AS column_name, c.is_identity FROM sys.columns c \
     WHERE c.object_id = OBJECT_ID(@P1) AND c.is_computed = 0 ORDER BY c.column_id";

const ADD_TABLE_DESCRIPTION_SQL: &str = "IF OBJECT_ID(@P1, N'U') IS NOT NULL \
     EXEC sp_addextendedproperty @name = N'MS_Description', @value = @P2, \
     @level0type = N'SCHEMA', @level0name = @P3, @level1type = N'TABLE', @level1name = @P4";

const ADD_COLUMN_DESCRIPTION_SQL: &str = "IF OBJECT_ID(@P1, N'U') IS NOT NULL AND COL_LENGTH(@P1, @P5) IS NOT NULL \
     EXEC sp_addextendedproperty @name = N'MS_Description', @value = @P2, \
     @level0type = N'SCHEMA', @level0name = @P3, @level1type = N'TABLE', @level1name = @P4, \
     @level2type = N'COLUMN', @level2name = @P5";

/// Outcome of one non-critical clone step.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StepReport {
    /// Objects applied (keys, descriptions or tables with data).
    pub applied: usize,
    /// Rows copied per table, data step only.
    pub rows: BTreeMap<String, u64>,
    pub warnings: Vec<String>,
}

/// Outcome of a full [`SchemaCloner::run`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct CloneOutcome {
    pub tables: Vec<String>,
    pub rows_copied: BTreeMap<String, u64>,
    pub warnings: Vec<String>,
}

/// Copies template tables from `source_db` into a freshly created `target_db`.
pub struct SchemaCloner {
    source: Arc<dyn Driver>,
    source_db: String,
    target: Arc<dyn Driver>,
    target_db: String,
    config: CloneConfig,
    schema: String,
}

impl SchemaCloner {
    pub fn new(
        source: Arc<dyn Driver>,
        source_db: impl Into<String>,
        target: Arc<dyn Driver>,
        target_db: impl Into<String>,
        config: CloneConfig,
    ) -> Self {
        Self {
            source,
            source_db: source_db.into(),
            target,
            target_db: target_db.into(),
            config,
            schema: "dbo".to_string(),
        }
    }

    /// Clone tables of `schema` instead of `dbo`.
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn same_server(&self) -> bool {
        self.source.server().id == self.target.server().id
    }

    /// Every base table of the source schema, spelled as the source spells
    /// them. Configured tables come first in configuration order, the rest
    /// follow in source order.
    pub async fn plan_tables(&self) -> Result<Vec<String>> {
        let rows = self
            .source
            .execute_query(&self.source_db, SOURCE_TABLES_SQL, &[SqlValue::from(self.schema.as_str())])
            .await?;
        let present: Vec<String> = rows.iter().map(|r| r.get_string("table_name")).collect();

        let mut tables: Vec<String> = Vec::with_capacity(present.len());
        for wanted in self.config.all_tables() {
            match present.iter().find(|t| t.eq_ignore_ascii_case(wanted)) {
                Some(actual) if !tables.contains(actual) => tables.push(actual.clone()),
                Some(_) => {}
                None => debug!("Configured table {} not found in {}", wanted, self.source_db),
            }
        }
        for table in present {
            if !tables.contains(&table) {
                tables.push(table);
            }
        }
        Ok(tables)
    }

    /// Create empty copies of `tables` in the target. Any failure is fatal.
    pub async fn copy_schema(&self, tables: &[String]) -> Result<Vec<String>> {
        let created = if self.same_server() {
            self.copy_schema_same_server(tables).await?
        } else {
            self.copy_schema_cross_server(tables).await?
        };
        info!(
            "Created {} table(s) in {} ({})",
            created.len(),
            self.target_db,
            if self.same_server() { "same server" } else { "cross server" }
        );
        Ok(created)
    }

    async fn copy_schema_same_server(&self, tables: &[String]) -> Result<Vec<String>> {
        let mut conn = self.target.connect(self.target.server().system_db()).await?;
        let mut created = Vec::with_capacity(tables.len());
        for table in tables {
            let sql = format!(
                "SELECT * INTO {} FROM {} WHERE 1=0",
                qualify_mssql_db(&self.target_db, &self.schema, table)?,
                qualify_mssql_db(&self.source_db, &self.schema, table)?
            );
            conn.execute(&sql, &[]).await?;
            created.push(table.clone());
        }
        conn.close().await?;
        Ok(created)
    }

    async fn copy_schema_cross_server(&self, tables: &[String]) -> Result<Vec<String>> {
        let rows = self
            .source
            .execute_query(&self.source_db, SOURCE_COLUMNS_SQL, &[SqlValue::from(self.schema.as_str())])
            .await?;
        let mut by_table: HashMap<String, Vec<SourceColumn>> = HashMap::new();
        for column in rows.iter().map(SourceColumn::from_row) {
            by_table.entry(column.table.to_uppercase()).or_default().push(column);
        }

        let mut conn = self.target.connect(&self.target_db).await?;
        let mut created = Vec::with_capacity(tables.len());
        for table in tables {
            let columns = by_table.get(&table.to_uppercase()).ok_or_else(|| {
                ProvisionError::not_found(format!("columns of {}.{}", self.source_db, table))
            })?;
            let sql = create_table_sql(&self.schema, table, columns)?;
            conn.execute(&sql, &[]).await?;
            created.push(table.clone());
        }
        conn.close().await?;
        Ok(created)
    }

    /// Re-create source primary keys on the target tables.
    pub async fn copy_primary_keys(&self, tables: &[String]) -> Result<StepReport> {
        let rows = self
            .source
            .execute_query(&self.source_db, PRIMARY_KEYS_SQL, &[SqlValue::from(self.schema.as_str())])
            .await?;
        let keys: Vec<PrimaryKey> = rows
            .iter()
            .map(PrimaryKey::from_row)
            .filter(|pk| contains_table(tables, &pk.table) && !pk.columns.is_empty())
            .collect();

        let mut report = StepReport::default();
        let mut conn = self.target.connect(&self.target_db).await?;
        for pk in &keys {
            match pk.create_sql(&self.schema) {
                Ok(sql) => match conn.execute(&sql, &[]).await {
                    Ok(_) => report.applied += 1,
                    Err(e) => {
                        warn!("Primary key {} on {} failed: {}", pk.name, pk.table, e);
                        report.warnings.push(format!("primary key {}: {}", pk.name, e));
                    }
                },
                Err(e) => report.warnings.push(format!("primary key {}: {}", pk.name, e)),
            }
        }
        conn.close().await?;
        Ok(report)
    }

    /// Copy table and column descriptions (`MS_Description`).
    pub async fn copy_extended_properties(&self, tables: &[String]) -> Result<StepReport> {
        let rows = self
            .source
            .execute_query(&self.source_db, DESCRIPTIONS_SQL, &[SqlValue::from(self.schema.as_str())])
            .await?;
        let properties: Vec<&Row> = rows
            .iter()
            .filter(|r| contains_table(tables, &r.get_string("table_name")))
            .collect();

        let mut report = StepReport::default();
        if properties.is_empty() {
            return Ok(report);
        }

        let mut conn = self.target.connect(&self.target_db).await?;
        for row in properties {
            let table = row.get_string("table_name");
            let description = row.get_string("description");
            let object = match qualify_mssql(&self.schema, &table) {
                Ok(o) => o,
                Err(e) => {
                    report.warnings.push(format!("description of {}: {}", table, e));
                    continue;
                }
            };
            let mut params = vec![
                SqlValue::from(object),
                SqlValue::from(description),
                SqlValue::from(self.schema.as_str()),
                SqlValue::from(table.as_str()),
            ];
            let (sql, label) = if row.get_i64("minor_id").unwrap_or(0) == 0 {
                (ADD_TABLE_DESCRIPTION_SQL, table.clone())
            } else {
                let column = row.get_string("column_name");
                let label = format!("{}.{}", table, column);
                params.push(SqlValue::from(column));
                (ADD_COLUMN_DESCRIPTION_SQL, label)
            };
            match conn.execute(sql, &params).await {
                Ok(_) => report.applied += 1,
                Err(e) => {
                    debug!("Description of {} skipped: {}", label, e);
                    report.warnings.push(format!("description of {}: {}", label, e));
                }
            }
        }
        conn.close().await?;
        Ok(report)
    }

    /// Copy rows of the `with_data` tables among `tables`.
    pub async fn copy_data(&self, tables: &[String]) -> Result<StepReport> {
        let mut report = StepReport::default();
        for table in tables.iter().filter(|t| self.config.copies_data(t)) {
            let copied = if self.same_server() {
                self.copy_table_same_server(table).await
            } else {
                self.copy_table_cross_server(table).await
            };
            match copied {
                Ok(rows) => {
                    debug!("Copied {} row(s) into {}", rows, table);
                    report.applied += 1;
                    report.rows.insert(table.clone(), rows);
                }
                Err(e) => {
                    warn!("Data copy of {} failed: {}", table, e);
                    report.warnings.push(format!("data of {}: {}", table, e));
                }
            }
        }
        Ok(report)
    }

    /// Insertable columns of a source table and whether one is an identity.
    async fn copy_columns(&self, table: &str) -> Result<(Vec<String>, bool)> {
        let rows = self
            .source
            .execute_query(
                &self.source_db,
                COPY_COLUMNS_SQL,
                &[SqlValue::from(qualify_mssql(&self.schema, table)?)],
            )
            .await?;
        if rows.is_empty() {
            return Err(ProvisionError::not_found(format!(
                "columns of {}.{}",
                self.source_db, table
            )));
        }
        let identity = rows.iter().any(|r| r.get_bool("is_identity"));
        let columns = rows.iter().map(|r| r.get_string("column_name")).collect();
        Ok((columns, identity))
    }

    async fn copy_table_same_server(&self, table: &str) -> Result<u64> {
        let (columns, identity) = self.copy_columns(table).await?;
        let column_list = column_list(&columns)?;
        let target = qualify_mssql_db(&self.target_db, &self.schema, table)?;
        let insert = format!(
            "INSERT INTO {target} ({cols}) SELECT {cols} FROM {source}",
            target = target,
            cols = column_list,
            source = qualify_mssql_db(&self.source_db, &self.schema, table)?
        );
        let sql = with_identity_insert(&target, identity, &insert);
        self.target
            .execute_non_query(self.target.server().system_db(), &sql, &[])
            .await
    }

    async fn copy_table_cross_server(&self, table: &str) -> Result<u64> {
        let (columns, identity) = self.copy_columns(table).await?;
        let column_list = column_list(&columns)?;
        let qualified = qualify_mssql(&self.schema, table)?;

        let rows = self
            .source
            .execute_query(
                &self.source_db,
                &format!("SELECT {} FROM {}", column_list, qualified),
                &[],
            )
            .await?;
        if rows.is_empty() {
            return Ok(0);
        }

        let placeholders = (1..=columns.len())
            .map(|i| format!("@P{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let insert = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            qualified, column_list, placeholders
        );
        let sql = with_identity_insert(&qualified, identity, &insert);

        let mut conn = self.target.connect(&self.target_db).await?;
        let mut copied = 0u64;
        for row in rows {
            copied += conn.execute(&sql, row.values()).await?;
        }
        conn.close().await?;
        Ok(copied)
    }

    /// Run every step: schema (fatal), then keys, descriptions and data.
    pub async fn run(&self) -> Result<CloneOutcome> {
        let planned = self.plan_tables().await?;
        let tables = self.copy_schema(&planned).await?;
        let mut outcome = CloneOutcome {
            tables,
            ..Default::default()
        };

        let keys = self.copy_primary_keys(&outcome.tables).await;
        let descriptions = self.copy_extended_properties(&outcome.tables).await;
        let data = self.copy_data(&outcome.tables).await;
        for (label, step) in [("indexes", keys), ("extended properties", descriptions), ("data", data)] {
            match step {
                Ok(report) => {
                    outcome.warnings.extend(report.warnings);
                    outcome.rows_copied.extend(report.rows);
                }
                Err(e) => outcome.warnings.push(format!("{}: {}", label, e)),
            }
        }
        Ok(outcome)
    }
}

fn contains_table(tables: &[String], name: &str) -> bool {
    tables.iter().any(|t| t.eq_ignore_ascii_case(name))
}

fn column_list(columns: &[String]) -> Result<String> {
    Ok(columns
        .iter()
        .map(|c| quote_mssql(c))
        .collect::<Result<Vec<_>>>()?
        .join(", "))
}

/// Wrap an insert in an `IDENTITY_INSERT` bracket when the table has an
/// identity column. The bracket must share the insert's batch.
pub(crate) fn with_identity_insert(table: &str, identity: bool, insert: &str) -> String {
    if identity {
        format!(
            "SET IDENTITY_INSERT {t} ON;\n{insert};\nSET IDENTITY_INSERT {t} OFF;",
            t = table,
            insert = insert
        )
    } else {
        insert.to_string()
    }
}
