//! Bulk-pipeline strategy: export with `bcp out`, import with `bcp in`.
//!
//! When the utility is disabled or cannot be found, rows are streamed from
//! the source in chunks and written with multi-row parameterized inserts.

use super::result::CopyMethod;
use super::{insertable_columns, truncate_table, SyncOptions, TableRef};
use crate::catalog::ServerRecord;
use crate::cloner::with_identity_insert;
use crate::config::SyncConfig;
use crate::core::identifier::{qualify_mssql, qualify_mssql_db, quote_mssql};
use crate::core::{Row, SqlValue};
use crate::driver::{Connection, Driver};
use crate::error::{ProvisionError, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Parameters per insert statement, below SQL Server's 2100 per request.
const MAX_PARAMETERS: usize = 2000;

/// Row constructors allowed in one `VALUES` clause.
const MAX_ROWS_PER_INSERT: usize = 1000;

const WELL_KNOWN_BCP_PATHS: &[&str] = &[
    "/opt/mssql-tools18/bin/bcp",
    "/opt/mssql-tools/bin/bcp",
    r"C:\Program Files\Microsoft SQL Server\Client SDK\ODBC\170\Tools\Binn\bcp.exe",
    r"C:\Program Files\Microsoft SQL Server\150\Tools\Binn\bcp.exe",
    r"C:\Program Files\Microsoft SQL Server\Client SDK\ODBC\130\Tools\Binn\bcp.exe",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BcpDirection {
    Out,
    In,
}

impl BcpDirection {
    fn as_arg(self) -> &'static str {
        match self {
            BcpDirection::Out => "out",
            BcpDirection::In => "in",
        }
    }
}

/// Find the bulk utility: configured path, then `PATH`, then the usual
/// install locations. `None` when disabled or not installed.
pub fn locate_bcp(config: &SyncConfig) -> Option<PathBuf> {
    if !config.bcp_enabled {
        return None;
    }
    if let Some(path) = &config.bcp_path {
        if path.is_file() {
            return Some(path.clone());
        }
        warn!("Configured bcp_path {} does not exist, searching PATH", path.display());
    }
    if let Ok(path) = which::which("bcp") {
        return Some(path);
    }
    WELL_KNOWN_BCP_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|p| p.is_file())
}

/// Arguments for one `bcp` invocation in native format.
pub fn bcp_args(
    server: &ServerRecord,
    database: &str,
    table: &TableRef,
    direction: BcpDirection,
    file: &Path,
    batch_size: usize,
    keep_identity: bool,
) -> Result<Vec<String>> {
    let mut args = vec![
        qualify_mssql_db(database, &table.schema, &table.name)?,
        direction.as_arg().to_string(),
        file.display().to_string(),
        "-S".to_string(),
        server.address(),
        "-U".to_string(),
        server.username.clone(),
        "-P".to_string(),
        server.password.clone(),
        "-n".to_string(),
        "-b".to_string(),
        batch_size.to_string(),
    ];
    if direction == BcpDirection::In {
        args.push("-h".to_string());
        args.push("TABLOCK".to_string());
        if keep_identity {
            args.push("-E".to_string());
        }
    }
    Ok(args)
}

/// Arguments with the value after `-P` masked, for logs.
fn redacted(args: &[String]) -> String {
    let mut out = Vec::with_capacity(args.len());
    let mut mask_next = false;
    for arg in args {
        if mask_next {
            out.push("[REDACTED]");
            mask_next = false;
        } else {
            out.push(arg.as_str());
            mask_next = arg == "-P";
        }
    }
    out.join(" ")
}

/// Run the utility to completion. Non-zero exit, timeout and a missing
/// executable are all [`ProvisionError::Process`].
pub async fn run_bcp(program: &Path, args: &[String], limit: Duration, label: &str) -> Result<String> {
    debug!("{}: {} {}", label, program.display(), redacted(args));
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(limit, child).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ProvisionError::Process(format!(
                "{}: bulk utility not found at {} (install mssql-tools)",
                label,
                program.display()
            )))
        }
        Ok(Err(e)) => return Err(ProvisionError::Process(format!("{}: {}", label, e))),
        Err(_) => {
            return Err(ProvisionError::Process(format!(
                "{}: timed out after {}s",
                label,
                limit.as_secs()
            )))
        }
    };

    // bcp reports errors on stdout as often as on stderr
    let text = format!(
        "{}\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    )
    .trim()
    .to_string();

    if !output.status.success() {
        let detail = if text.is_empty() {
            format!("exit status {}", output.status)
        } else {
            text
        };
        return Err(ProvisionError::Process(format!("{}: {}", label, detail)));
    }
    Ok(text)
}

/// Rows per insert statement for `columns` parameters per row.
pub fn rows_per_statement(columns: usize, batch_size: usize) -> usize {
    (MAX_PARAMETERS / columns.max(1))
        .min(MAX_ROWS_PER_INSERT)
        .min(batch_size.max(1))
        .max(1)
}

/// `INSERT INTO t (cols) VALUES (@P1, @P2), (@P3, @P4)`
fn multi_row_insert(table: &str, column_list: &str, columns: usize, rows: usize) -> String {
    let mut sql = format!("INSERT INTO {} ({}) VALUES ", table, column_list);
    for row in 0..rows {
        if row > 0 {
            sql.push_str(", ");
        }
        sql.push('(');
        for col in 0..columns {
            if col > 0 {
                sql.push_str(", ");
            }
            sql.push_str(&format!("@P{}", row * columns + col + 1));
        }
        sql.push(')');
    }
    sql
}

/// Per-job bulk copier owning its scratch directory.
pub struct BulkPipeline {
    config: SyncConfig,
    bcp: Option<PathBuf>,
    work_dir: TempDir,
}

impl BulkPipeline {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("db_sync_");
        let work_dir = match &config.work_dir {
            Some(dir) => builder.tempdir_in(dir)?,
            None => builder.tempdir()?,
        };
        let bcp = locate_bcp(config);
        match &bcp {
            Some(path) => info!("Bulk pipeline using {}", path.display()),
            None => info!("Bulk utility unavailable, using batched inserts"),
        }
        Ok(Self {
            config: config.clone(),
            bcp,
            work_dir,
        })
    }

    /// Force the in-process fallback.
    pub fn without_bcp(mut self) -> Self {
        self.bcp = None;
        self
    }

    pub fn bcp_path(&self) -> Option<&Path> {
        self.bcp.as_deref()
    }

    pub fn work_dir(&self) -> &Path {
        self.work_dir.path()
    }

    /// Copy one table from `source_db` to `target_db`.
    pub(crate) async fn copy_table(
        &self,
        source: &dyn Driver,
        source_db: &str,
        target: &dyn Driver,
        target_db: &str,
        table: &TableRef,
        options: &SyncOptions,
    ) -> Result<CopyMethod> {
        match &self.bcp {
            Some(bcp) => {
                self.copy_with_bcp(bcp, source, source_db, target, target_db, table, options)
                    .await?;
                Ok(CopyMethod::Bcp)
            }
            None => {
                self.copy_batched(source, source_db, target, target_db, table, options)
                    .await?;
                Ok(CopyMethod::Batched)
            }
        }
    }

    fn data_file(&self, source_db: &str, table: &TableRef) -> PathBuf {
        let name: String = format!("{}_{}_{}", source_db, table.schema, table.name)
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
            .collect();
        self.work_dir.path().join(format!("{}.dat", name))
    }

    #[allow(clippy::too_many_arguments)]
    async fn copy_with_bcp(
        &self,
        bcp: &Path,
        source: &dyn Driver,
        source_db: &str,
        target: &dyn Driver,
        target_db: &str,
        table: &TableRef,
        options: &SyncOptions,
    ) -> Result<()> {
        let file = self.data_file(source_db, table);
        let result = self
            .bcp_round_trip(bcp, source, source_db, target, target_db, table, options, &file)
            .await;
        if file.exists() {
            if let Err(e) = tokio::fs::remove_file(&file).await {
                debug!("Could not remove {}: {}", file.display(), e);
            }
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn bcp_round_trip(
        &self,
        bcp: &Path,
        source: &dyn Driver,
        source_db: &str,
        target: &dyn Driver,
        target_db: &str,
        table: &TableRef,
        options: &SyncOptions,
        file: &Path,
    ) -> Result<()> {
        let timeout = self.config.bcp_timeout();
        let batch = self.config.bcp_batch_size;

        let export = bcp_args(source.server(), source_db, table, BcpDirection::Out, file, batch, false)?;
        run_bcp(bcp, &export, timeout, "bcp out").await?;

        let size = match tokio::fs::metadata(file).await {
            Ok(meta) => meta.len(),
            Err(_) => {
                return Err(ProvisionError::Process(format!(
                    "bcp out produced no data file for {}",
                    table
                )))
            }
        };
        debug!("Exported {} ({} bytes)", table, size);

        if options.truncate_before {
            let mut conn = target.connect(target_db).await?;
            truncate_table(conn.as_mut(), &qualify_mssql(&table.schema, &table.name)?).await?;
            conn.close().await?;
        }

        if size == 0 {
            info!("Source {} is empty, skipping import", table);
            return Ok(());
        }
        let import = bcp_args(
            target.server(),
            target_db,
            table,
            BcpDirection::In,
            file,
            batch,
            options.keep_identity,
        )?;
        run_bcp(bcp, &import, timeout, "bcp in").await?;
        Ok(())
    }

    async fn copy_batched(
        &self,
        source: &dyn Driver,
        source_db: &str,
        target: &dyn Driver,
        target_db: &str,
        table: &TableRef,
        options: &SyncOptions,
    ) -> Result<u64> {
        let columns = insertable_columns(source, source_db, &table.schema, &table.name).await?;
        let has_identity = columns.iter().any(|(_, identity)| *identity);
        let selected: Vec<&str> = columns
            .iter()
            .filter(|(_, identity)| options.keep_identity || !identity)
            .map(|(name, _)| name.as_str())
            .collect();
        if selected.is_empty() {
            return Err(ProvisionError::Validation(format!(
                "{} has no insertable columns",
                table
            )));
        }
        let column_list = selected
            .iter()
            .map(|c| quote_mssql(c))
            .collect::<Result<Vec<_>>>()?
            .join(", ");
        let qualified = qualify_mssql(&table.schema, &table.name)?;

        let mut target_conn = target.connect(target_db).await?;
        if options.truncate_before {
            truncate_table(target_conn.as_mut(), &qualified).await?;
        }
        let mut source_conn = source.connect(source_db).await?;

        let select = format!("SELECT {} FROM {}", column_list, qualified);
        let written = stream_rows(
            source_conn.as_mut(),
            &select,
            target_conn.as_mut(),
            &InsertTarget {
                table: &qualified,
                column_list: &column_list,
                width: selected.len(),
                identity_insert: options.keep_identity && has_identity,
            },
            self.config.fallback_batch_size,
        )
        .await?;
        target_conn.close().await?;
        debug!("Batched copy of {}: wrote {}", table, written);
        Ok(written)
    }
}

/// Where [`stream_rows`] writes: a qualified table and its column list.
pub(crate) struct InsertTarget<'a> {
    pub table: &'a str,
    pub column_list: &'a str,
    pub width: usize,
    pub identity_insert: bool,
}

/// Read `select` in chunks of `batch_size` rows and write each chunk with
/// multi-row parameterized inserts. Returns rows written.
pub(crate) async fn stream_rows(
    source: &mut dyn Connection,
    select: &str,
    target: &mut dyn Connection,
    into: &InsertTarget<'_>,
    batch_size: usize,
) -> Result<u64> {
    let chunk_rows = rows_per_statement(into.width, batch_size);
    let (tx, mut rx) = mpsc::channel::<Vec<Row>>(2);
    let reader = source.query_chunked(select, batch_size.max(1), tx);

    // rx moves in so a failed writer drops it and unblocks the reader
    let writer = async move {
        let mut written = 0u64;
        while let Some(chunk) = rx.recv().await {
            for batch in chunk.chunks(chunk_rows) {
                let insert = multi_row_insert(into.table, into.column_list, into.width, batch.len());
                let sql = with_identity_insert(into.table, into.identity_insert, &insert);
                let params: Vec<SqlValue> = batch
                    .iter()
                    .flat_map(|row| row.values().iter().cloned())
                    .collect();
                written += target.execute(&sql, &params).await?;
            }
        }
        Ok::<u64, ProvisionError>(written)
    };

    let (read, written) = tokio::join!(reader, writer);
    let read = read?;
    let written = written?;
    debug!("Streamed {} row(s) into {}, {} written", read, into.table, written);
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::SyncStrategy;
    use crate::testing::MockDriver;

    fn column(name: &str, identity: bool) -> Row {
        Row::from_pairs([
            ("column_name", SqlValue::from(name)),
            ("is_identity", SqlValue::Bool(identity)),
        ])
    }

    fn data_row(id: i32, name: &str) -> Row {
        Row::from_pairs([("ID", SqlValue::I32(id)), ("NAME", SqlValue::from(name))])
    }

    fn options(keep_identity: bool) -> SyncOptions {
        SyncOptions {
            strategy: SyncStrategy::BulkPipeline,
            truncate_before: true,
            keep_identity,
        }
    }

    fn batched(fallback_batch_size: usize) -> BulkPipeline {
        let config = SyncConfig {
            bcp_enabled: false,
            fallback_batch_size,
            ..Default::default()
        };
        BulkPipeline::new(&config).unwrap()
    }

    #[test]
    fn test_bcp_args() {
        let server = ServerRecord::mssql(1, "sql01", "sync", "pw");
        let table = TableRef::new("dbo", "TB_DEPT");
        let out = bcp_args(&server, "ERP", &table, BcpDirection::Out, Path::new("/tmp/x.dat"), 50000, true)
            .unwrap();
        assert_eq!(
            out,
            vec![
                "[ERP].[dbo].[TB_DEPT]", "out", "/tmp/x.dat", "-S", "sql01,1433", "-U", "sync", "-P", "pw",
                "-n", "-b", "50000"
            ]
        );

        let import = bcp_args(&server, "ERP", &table, BcpDirection::In, Path::new("/tmp/x.dat"), 100, true)
            .unwrap();
        assert!(import.ends_with(&["-h".to_string(), "TABLOCK".to_string(), "-E".to_string()]));
        assert!(redacted(&import).contains("-P [REDACTED] -n"));
    }

    #[test]
    fn test_rows_per_statement_respects_parameter_limit() {
        assert_eq!(rows_per_statement(2, 5000), 1000);
        assert_eq!(rows_per_statement(10, 5000), 200);
        assert_eq!(rows_per_statement(3000, 5000), 1);
        assert_eq!(rows_per_statement(2, 50), 50);
    }

    #[test]
    fn test_multi_row_insert_numbering() {
        assert_eq!(
            multi_row_insert("[dbo].[T]", "[A], [B]", 2, 2),
            "INSERT INTO [dbo].[T] ([A], [B]) VALUES (@P1, @P2), (@P3, @P4)"
        );
    }

    #[test]
    fn test_locate_bcp_prefers_configured_path() {
        let fake = tempfile::NamedTempFile::new().unwrap();
        let config = SyncConfig {
            bcp_path: Some(fake.path().to_path_buf()),
            ..Default::default()
        };
        assert_eq!(locate_bcp(&config).as_deref(), Some(fake.path()));

        let disabled = SyncConfig {
            bcp_enabled: false,
            ..config
        };
        assert!(locate_bcp(&disabled).is_none());
    }

    #[test]
    fn test_work_dir_is_removed_with_pipeline() {
        let pipeline = batched(10);
        let dir = pipeline.work_dir().to_path_buf();
        assert!(dir.is_dir());
        drop(pipeline);
        assert!(!dir.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_bcp_reports_failure_output() {
        let err = run_bcp(
            Path::new("sh"),
            &["-c".to_string(), "echo 'Login failed' >&2; exit 3".to_string()],
            Duration::from_secs(10),
            "bcp out",
        )
        .await
        .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("bcp out: Login failed"), "{}", message);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_bcp_success_returns_output() {
        let out = run_bcp(
            Path::new("sh"),
            &["-c".to_string(), "echo '3 rows copied.'".to_string()],
            Duration::from_secs(10),
            "bcp in",
        )
        .await
        .unwrap();
        assert_eq!(out, "3 rows copied.");
    }

    #[tokio::test]
    async fn test_missing_utility_is_process_error() {
        let err = run_bcp(
            Path::new("/nonexistent/bcp"),
            &[],
            Duration::from_secs(1),
            "bcp out",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProvisionError::Process(_)));
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn test_batched_copy_chunks_and_brackets_identity() {
        let source = MockDriver::new(1);
        let target = MockDriver::new(2);
        source.on_query("sys.columns", vec![column("ID", true), column("NAME", false)]);
        source.on_query(
            "SELECT [ID], [NAME] FROM [dbo].[TB_DEPT]",
            (1..=5).map(|i| data_row(i, "dept")).collect(),
        );
        target.on_execute("INSERT INTO", 2);
        let pipeline = batched(2);
        let table = TableRef::new("dbo", "TB_DEPT");

        let method = pipeline
            .copy_table(&source, "ERP", &target, "ERP_DEV", &table, &options(true))
            .await
            .unwrap();
        assert_eq!(method, CopyMethod::Batched);

        let inserts: Vec<_> = target
            .executed()
            .into_iter()
            .filter(|e| e.sql.contains("INSERT INTO"))
            .collect();
        // 5 rows in chunks of 2
        assert_eq!(inserts.len(), 3);
        assert!(inserts[0].sql.starts_with("SET IDENTITY_INSERT [dbo].[TB_DEPT] ON;"));
        assert_eq!(inserts[0].params.len(), 4);
        assert_eq!(inserts[2].params.len(), 2);
        assert!(target.position("TRUNCATE TABLE [dbo].[TB_DEPT]").unwrap() < target.position("INSERT INTO").unwrap());
    }

    #[tokio::test]
    async fn test_batched_copy_without_identity() {
        let source = MockDriver::new(1);
        let target = MockDriver::new(2);
        source.on_query("sys.columns", vec![column("ID", true), column("NAME", false)]);
        source.on_query(
            "SELECT [NAME] FROM [dbo].[TB_DEPT]",
            vec![Row::from_pairs([("NAME", SqlValue::from("HR"))])],
        );
        let pipeline = batched(100);
        let table = TableRef::new("dbo", "TB_DEPT");

        pipeline
            .copy_table(&source, "ERP", &target, "ERP_DEV", &table, &options(false))
            .await
            .unwrap();
        assert_eq!(target.count_matching("IDENTITY_INSERT"), 0);
        assert_eq!(
            target.count_matching("INSERT INTO [dbo].[TB_DEPT] ([NAME]) VALUES (@P1)"),
            1
        );
    }

    #[tokio::test]
    async fn test_truncate_falls_back_to_delete() {
        let source = MockDriver::new(1);
        let target = MockDriver::new(2);
        source.on_query("sys.columns", vec![column("NAME", false)]);
        target.fail_on("TRUNCATE TABLE", "referenced by a FOREIGN KEY constraint");
        let table = TableRef::new("dbo", "TB_DEPT");

        batched(100)
            .copy_table(&source, "ERP", &target, "ERP_DEV", &table, &options(true))
            .await
            .unwrap();
        assert_eq!(target.count_matching("DELETE FROM [dbo].[TB_DEPT]"), 1);
    }

    #[tokio::test]
    async fn test_write_failure_stops_copy() {
        let source = MockDriver::new(1);
        let target = MockDriver::new(2);
        source.on_query("sys.columns", vec![column("ID", false), column("NAME", false)]);
        source.on_query(
            "SELECT [ID], [NAME] FROM",
            (1..=10).map(|i| data_row(i, "x")).collect(),
        );
        target.fail_on("INSERT INTO", "string or binary data would be truncated");
        let table = TableRef::new("dbo", "TB_DEPT");

        let err = batched(2)
            .copy_table(&source, "ERP", &target, "ERP_DEV", &table, &options(true))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("would be truncated"));
        assert_eq!(target.count_matching("INSERT INTO"), 1);
    }
}
