//! DDL synthesized from source catalog metadata.

use crate::core::identifier::{qualify_mssql, quote_mssql};
use crate::core::Row;
use crate::driver::mssql::format_mssql_type;
use crate::error::Result;

/// One source column as read from `sys.columns`.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceColumn {
    pub table: String,
    pub name: String,
    pub data_type: String,
    pub max_length: i32,
    pub precision: u8,
    pub scale: u8,
    pub is_nullable: bool,
    pub is_identity: bool,
    pub seed: i64,
    pub increment: i64,
}

impl SourceColumn {
    pub(crate) fn from_row(row: &Row) -> Self {
        Self {
            table: row.get_string("table_name"),
            name: row.get_string("column_name"),
            data_type: row.get_string("data_type"),
            max_length: row.get_i64("max_length").unwrap_or(0) as i32,
            precision: row.get_i64("precision").unwrap_or(0).clamp(0, 255) as u8,
            scale: row.get_i64("scale").unwrap_or(0).clamp(0, 255) as u8,
            is_nullable: row.get_bool("is_nullable"),
            is_identity: row.get_bool("is_identity"),
            seed: row.get_i64("seed_value").unwrap_or(1),
            increment: row.get_i64("increment_value").unwrap_or(1),
        }
    }

    /// `[name] type [IDENTITY(seed,incr)] [NOT] NULL`
    pub fn definition(&self) -> Result<String> {
        let mut def = format!(
            "{} {}",
            quote_mssql(&self.name)?,
            format_mssql_type(&self.data_type, self.max_length, self.precision, self.scale)
        );
        if self.is_identity {
            def.push_str(&format!(" IDENTITY({},{})", self.seed, self.increment));
        }
        def.push_str(if self.is_nullable { " NULL" } else { " NOT NULL" });
        Ok(def)
    }
}

/// `CREATE TABLE` for one table's columns, in column order.
pub fn create_table_sql(schema: &str, table: &str, columns: &[SourceColumn]) -> Result<String> {
    let defs = columns
        .iter()
        .map(SourceColumn::definition)
        .collect::<Result<Vec<_>>>()?;
    Ok(format!(
        "CREATE TABLE {} (\n  {}\n)",
        qualify_mssql(schema, table)?,
        defs.join(",\n  ")
    ))
}

/// A primary key as read from `sys.key_constraints`.
#[derive(Debug, Clone, PartialEq)]
pub struct PrimaryKey {
    pub table: String,
    pub name: String,
    pub clustered: bool,
    /// Key columns in key order.
    pub columns: Vec<String>,
}

impl PrimaryKey {
    pub(crate) fn from_row(row: &Row) -> Self {
        Self {
            table: row.get_string("table_name"),
            name: row.get_string("pk_name"),
            clustered: row.get_string("index_type").eq_ignore_ascii_case("CLUSTERED"),
            columns: row
                .get_string("key_columns")
                .split(',')
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect(),
        }
    }

    /// `ALTER TABLE .. ADD CONSTRAINT`, skipped when the table is missing or
    /// already has a primary key.
    pub fn create_sql(&self, schema: &str) -> Result<String> {
        let qualified = qualify_mssql(schema, &self.table)?;
        let columns = self
            .columns
            .iter()
            .map(|c| quote_mssql(c))
            .collect::<Result<Vec<_>>>()?;
        let object = qualified.replace('\'', "''");
        Ok(format!(
            "IF OBJECT_ID(N'{object}', N'U') IS NOT NULL\n\
             \x20  AND NOT EXISTS (SELECT 1 FROM sys.key_constraints\n\
             \x20                  WHERE parent_object_id = OBJECT_ID(N'{object}') AND type = 'PK')\n\
             \x20   ALTER TABLE {qualified} ADD CONSTRAINT {name} PRIMARY KEY {kind} ({columns})",
            object = object,
            qualified = qualified,
            name = quote_mssql(&self.name)?,
            kind = if self.clustered { "CLUSTERED" } else { "NONCLUSTERED" },
            columns = columns.join(", "),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str, data_type: &str, max_length: i32) -> SourceColumn {
        SourceColumn {
            table: "TB_DEPT".into(),
            name: name.into(),
            data_type: data_type.into(),
            max_length,
            precision: 0,
            scale: 0,
            is_nullable: true,
            is_identity: false,
            seed: 1,
            increment: 1,
        }
    }

    #[test]
    fn test_column_definitions() {
        let mut id = column("DEPT_ID", "int", 4);
        id.is_identity = true;
        id.is_nullable = false;
        id.seed = 1000;
        assert_eq!(id.definition().unwrap(), "[DEPT_ID] int IDENTITY(1000,1) NOT NULL");

        assert_eq!(
            column("DEPT_NM", "nvarchar", 100).definition().unwrap(),
            "[DEPT_NM] nvarchar(50) NULL"
        );
        assert_eq!(
            column("MEMO", "nvarchar", -1).definition().unwrap(),
            "[MEMO] nvarchar(max) NULL"
        );

        let mut amount = column("AMT", "decimal", 9);
        amount.precision = 18;
        amount.scale = 2;
        assert_eq!(amount.definition().unwrap(), "[AMT] decimal(18,2) NULL");
    }

    #[test]
    fn test_create_table_sql() {
        let sql = create_table_sql(
            "dbo",
            "TB_DEPT",
            &[column("A", "int", 4), column("B", "varchar", 10)],
        )
        .unwrap();
        assert_eq!(sql, "CREATE TABLE [dbo].[TB_DEPT] (\n  [A] int NULL,\n  [B] varchar(10) NULL\n)");
    }

    #[test]
    fn test_primary_key_from_row_and_sql() {
        let row = Row::from_pairs([
            ("table_name", "TB_ROLE_MENU".into()),
            ("pk_name", "PK_TB_ROLE_MENU".into()),
            ("index_type", "CLUSTERED".into()),
            ("key_columns", "ROLE_CD, MENU_ID".into()),
        ]);
        let pk = PrimaryKey::from_row(&row);
        assert_eq!(pk.columns, vec!["ROLE_CD", "MENU_ID"]);
        let sql = pk.create_sql("dbo").unwrap();
        assert!(sql.starts_with("IF OBJECT_ID(N'[dbo].[TB_ROLE_MENU]', N'U') IS NOT NULL"));
        assert!(sql.contains(
            "ALTER TABLE [dbo].[TB_ROLE_MENU] ADD CONSTRAINT [PK_TB_ROLE_MENU] PRIMARY KEY CLUSTERED ([ROLE_CD], [MENU_ID])"
        ));
    }
}
