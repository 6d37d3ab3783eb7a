//! SQL Server script templates for new tenant databases.
//!
//! [`generate_create_database_sql`] renders the `CREATE DATABASE` script an
//! operator may review and hand-edit before it runs; it has no side effects.
//! The operational options applied after creation live in [`configure`] and
//! are never user-editable.

pub mod configure;

pub use configure::{configure_database, configure_sections, ConfigureResult, Verification};

use crate::config::ProvisioningConfig;
use regex::Regex;
use std::fmt::Write;
use std::sync::LazyLock;

static CREATE_DATABASE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)CREATE\s+DATABASE\s+\[([^\]]+)\]").expect("valid CREATE DATABASE regex")
});

static GO_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^\s*GO\s*$").expect("valid GO separator regex"));

/// Inputs of the `CREATE DATABASE` script.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateDatabaseParams {
    pub db_name: String,
    pub data_path: String,
    pub log_path: String,
    pub initial_size_mb: u32,
    pub log_size_mb: u32,
    pub file_growth_mb: u32,
    pub log_growth_mb: u32,
    pub collation: String,

    /// Tenant shown in the script header, if any.
    pub tenant_code: Option<String>,
    pub tenant_name: Option<String>,
    pub source_db: Option<String>,
}

impl Default for CreateDatabaseParams {
    fn default() -> Self {
        Self::from_config(String::new(), &ProvisioningConfig::default())
    }
}

impl CreateDatabaseParams {
    /// Parameters from the provisioning config. File paths are the
    /// configured fallbacks; callers override them with the target
    /// server's own paths when it has them.
    pub fn from_config(db_name: impl Into<String>, config: &ProvisioningConfig) -> Self {
        Self {
            db_name: db_name.into(),
            data_path: config.data_path.clone(),
            log_path: config.log_path.clone(),
            initial_size_mb: config.initial_size_mb,
            log_size_mb: config.log_size_mb,
            file_growth_mb: config.file_growth_mb,
            log_growth_mb: config.log_growth_mb,
            collation: config.collation.clone(),
            tenant_code: None,
            tenant_name: None,
            source_db: None,
        }
    }

    /// Use the server's file directories where it defines them.
    pub fn with_paths(mut self, data_path: Option<&str>, log_path: Option<&str>) -> Self {
        if let Some(p) = data_path.filter(|p| !p.trim().is_empty()) {
            self.data_path = p.to_string();
        }
        if let Some(p) = log_path.filter(|p| !p.trim().is_empty()) {
            self.log_path = p.to_string();
        }
        self
    }

    pub fn with_tenant(
        mut self,
        code: impl Into<String>,
        name: impl Into<String>,
        source_db: impl Into<String>,
    ) -> Self {
        self.tenant_code = Some(code.into());
        self.tenant_name = Some(name.into());
        self.source_db = Some(source_db.into());
        self
    }
}

/// Join a directory and file name with the directory's own separator.
fn join_path(dir: &str, file: &str) -> String {
    let dir = dir.trim_end_matches(['/', '\\']);
    let sep = if dir.contains('/') { '/' } else { '\\' };
    format!("{}{}{}", dir, sep, file)
}

/// Render the `CREATE DATABASE` script.
pub fn generate_create_database_sql(params: &CreateDatabaseParams) -> String {
    let db = &params.db_name;
    let data_file = join_path(&params.data_path, &format!("{}.mdf", db));
    let log_file = join_path(&params.log_path, &format!("{}_log.ldf", db));
    let dash = "-".repeat(60);

    let mut sql = String::new();
    let _ = writeln!(sql, "-- {}", dash);
    let _ = writeln!(sql, "-- Tenant database: {}", db);
    if let Some(code) = &params.tenant_code {
        let _ = writeln!(sql, "-- Tenant code    : {}", code);
    }
    if let Some(name) = params.tenant_name.as_deref().filter(|n| !n.is_empty()) {
        let _ = writeln!(sql, "-- Tenant name    : {}", name);
    }
    if let Some(source) = params.source_db.as_deref().filter(|s| !s.is_empty()) {
        let _ = writeln!(sql, "-- Source db      : {}", source);
    }
    let _ = writeln!(sql, "-- Database options are applied automatically after creation.");
    let _ = writeln!(sql, "-- {}", dash);
    let _ = writeln!(sql);
    let _ = writeln!(sql, "CREATE DATABASE [{}]", db);
    let _ = writeln!(sql, "ON PRIMARY (");
    let _ = writeln!(sql, "    NAME       = N'{}_data',", db);
    let _ = writeln!(sql, "    FILENAME   = N'{}',", data_file);
    let _ = writeln!(sql, "    SIZE       = {}MB,", params.initial_size_mb);
    let _ = writeln!(sql, "    FILEGROWTH = {}MB", params.file_growth_mb);
    let _ = writeln!(sql, ")");
    let _ = writeln!(sql, "LOG ON (");
    let _ = writeln!(sql, "    NAME       = N'{}_log',", db);
    let _ = writeln!(sql, "    FILENAME   = N'{}',", log_file);
    let _ = writeln!(sql, "    SIZE       = {}MB,", params.log_size_mb);
    let _ = writeln!(sql, "    FILEGROWTH = {}MB", params.log_growth_mb);
    let _ = writeln!(sql, ")");
    let _ = writeln!(sql, "COLLATE {};", params.collation);
    let _ = writeln!(sql, "GO");
    sql
}

/// Name from the first `CREATE DATABASE [name]` in a script.
pub fn extract_database_name(script: &str) -> Option<String> {
    CREATE_DATABASE_RE
        .captures(script)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// `<prefix>_<tenant_code>`, used when a script names no database.
pub fn fallback_database_name(prefix: &str, tenant_code: &str) -> String {
    format!("{}_{}", prefix, tenant_code)
}

/// Split a `GO`-separated script into executable statements.
///
/// Comment-only and blank lines are dropped, and `USE` statements are
/// discarded because every statement runs on a fixed connection context.
pub fn parse_statements(script: &str) -> Vec<String> {
    GO_LINE_RE
        .split(script)
        .filter_map(|block| {
            let kept: Vec<&str> = block
                .lines()
                .filter(|line| {
                    let t = line.trim();
                    !t.is_empty() && !t.starts_with("--")
                })
                .collect();
            let statement = kept.join("\n").trim().to_string();
            if statement.is_empty() || statement.to_uppercase().starts_with("USE ") {
                None
            } else {
                Some(statement)
            }
        })
        .collect()
}
