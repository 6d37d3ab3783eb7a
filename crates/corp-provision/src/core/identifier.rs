//! Identifier validation and quoting for dynamically built SQL.
//!
//! Database, table and column names cannot be bound as parameters, so every
//! name that reaches a DDL or cross-database statement goes through this
//! module. Names are validated (empty, null byte, length) and then quoted
//! with the engine's delimiter, doubling any embedded closing delimiter.
//! String literals that must be embedded (passwords in `CREATE LOGIN`,
//! descriptions in `sp_addextendedproperty`) use [`quote_literal`].

use crate::error::{ProvisionError, Result};

/// Maximum identifier length for SQL Server (`sysname`).
const MAX_IDENTIFIER_LENGTH: usize = 128;

/// Validate an identifier for security issues.
///
/// Rejects empty names, names containing a null byte and names longer
/// than 128 characters.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ProvisionError::Validation(
            "Identifier cannot be empty".to_string(),
        ));
    }

    if name.contains('\0') {
        return Err(ProvisionError::Validation(format!(
            "Identifier contains null byte: {:?}",
            name
        )));
    }

    if name.chars().count() > MAX_IDENTIFIER_LENGTH {
        return Err(ProvisionError::Validation(format!(
            "Identifier exceeds maximum length of {} characters: {:?}",
            MAX_IDENTIFIER_LENGTH, name
        )));
    }

    Ok(())
}

/// Quote a SQL Server identifier using brackets.
///
/// ```ignore
/// assert_eq!(quote_mssql("users")?, "[users]");
/// assert_eq!(quote_mssql("table]name")?, "[table]]name]");
/// ```
pub fn quote_mssql(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("[{}]", name.replace(']', "]]")))
}

/// Quote a PostgreSQL identifier using double quotes.
pub fn quote_pg(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// Qualify a SQL Server table name with schema: `[schema].[table]`.
pub fn qualify_mssql(schema: &str, table: &str) -> Result<String> {
    Ok(format!("{}.{}", quote_mssql(schema)?, quote_mssql(table)?))
}

/// Three-part SQL Server name: `[database].[schema].[table]`.
pub fn qualify_mssql_db(database: &str, schema: &str, table: &str) -> Result<String> {
    Ok(format!(
        "{}.{}.{}",
        quote_mssql(database)?,
        quote_mssql(schema)?,
        quote_mssql(table)?
    ))
}

/// Four-part SQL Server name through a linked server:
/// `[link].[database].[schema].[table]`.
pub fn qualify_mssql_linked(
    link: &str,
    database: &str,
    schema: &str,
    table: &str,
) -> Result<String> {
    Ok(format!(
        "{}.{}",
        quote_mssql(link)?,
        qualify_mssql_db(database, schema, table)?
    ))
}

/// Quote a Unicode string literal: `N'...'` with `'` doubled.
pub fn quote_literal(value: &str) -> String {
    format!("N'{}'", value.replace('\'', "''"))
}
