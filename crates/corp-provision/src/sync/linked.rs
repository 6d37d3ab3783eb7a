//! Linked-server strategy: the whole copy runs as one statement on the
//! target, reading the source through a pre-registered server link.

use super::{insertable_columns, truncate_table, SyncOptions, TableRef};
use crate::core::identifier::{qualify_mssql, qualify_mssql_linked, quote_mssql, validate_identifier};
use crate::core::SqlValue;
use crate::driver::Driver;
use crate::error::{ProvisionError, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

const LINKED_SERVERS_SQL: &str = "SELECT s.name AS server_name, s.data_source, s.provider, s.catalog \
     FROM sys.servers s WHERE s.is_linked = 1 ORDER BY s.name";

/// A server link registered on a SQL Server instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkedServer {
    pub name: String,
    pub data_source: String,
    pub provider: String,
    pub catalog: String,
}

/// Links registered on the server behind `driver`.
pub async fn list_linked_servers(driver: &dyn Driver) -> Result<Vec<LinkedServer>> {
    let rows = driver
        .execute_query(driver.server().system_db(), LINKED_SERVERS_SQL, &[])
        .await?;
    Ok(rows
        .iter()
        .map(|r| LinkedServer {
            name: r.get_string("server_name"),
            data_source: r.get_string("data_source"),
            provider: r.get_string("provider"),
            catalog: r.get_string("catalog"),
        })
        .collect())
}

/// Test a link with `sp_testlinkedserver`.
pub async fn test_linked_server(driver: &dyn Driver, name: &str) -> Result<()> {
    validate_identifier(name)?;
    driver
        .execute_non_query(
            driver.server().system_db(),
            "EXEC sp_testlinkedserver @servername = @P1",
            &[SqlValue::from(name)],
        )
        .await
        .map_err(|e| {
            ProvisionError::connection(e, format!("linked server {} failed its connectivity test", name))
        })?;
    debug!("Linked server {} is reachable", name);
    Ok(())
}

/// Online user databases visible through a link.
pub async fn list_linked_databases(driver: &dyn Driver, name: &str) -> Result<Vec<String>> {
    let sql = format!(
        "SELECT name FROM {}.master.sys.databases WHERE state = 0 \
         AND name NOT IN ('master', 'tempdb', 'model', 'msdb') ORDER BY name",
        quote_mssql(name)?
    );
    let rows = driver
        .execute_query(driver.server().system_db(), &sql, &[])
        .await?;
    Ok(rows.iter().map(|r| r.get_string("name")).collect())
}

/// Copy one table from `[link].[source_db]` into `target_db` on the target.
///
/// Returns the affected row count reported by the server.
pub(crate) async fn copy_table(
    target: &dyn Driver,
    link: &str,
    source_db: &str,
    target_db: &str,
    table: &TableRef,
    options: &SyncOptions,
) -> Result<u64> {
    let columns = insertable_columns(target, target_db, &table.schema, &table.name).await?;
    let has_identity = columns.iter().any(|(_, identity)| *identity);
    let keep_identity = options.keep_identity && has_identity;
    let names = columns
        .iter()
        .filter(|(_, identity)| options.keep_identity || !identity)
        .map(|(name, _)| quote_mssql(name))
        .collect::<Result<Vec<_>>>()?
        .join(", ");

    let local = qualify_mssql(&table.schema, &table.name)?;
    let remote = qualify_mssql_linked(link, source_db, &table.schema, &table.name)?;

    let mut conn = target.connect(target_db).await?;
    if options.truncate_before {
        truncate_table(conn.as_mut(), &local).await?;
    }

    let insert = format!(
        "INSERT INTO {local} ({cols}) SELECT {cols} FROM {remote}",
        local = local,
        cols = names,
        remote = remote
    );
    let sql = crate::cloner::with_identity_insert(&local, keep_identity, &insert);
    info!("Copying {} -> {}.{}", remote, target_db, local);

    match conn.execute(&sql, &[]).await {
        Ok(rows) => {
            conn.close().await?;
            Ok(rows)
        }
        Err(e) => {
            if keep_identity {
                let off = format!("SET IDENTITY_INSERT {} OFF", local);
                if let Err(cleanup) = conn.execute(&off, &[]).await {
                    warn!("IDENTITY_INSERT OFF on {} failed: {}", local, cleanup);
                }
            }
            Err(e)
        }
    }
}
