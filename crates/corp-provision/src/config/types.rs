//! Configuration type definitions.

use crate::catalog::ServerRecord;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Managed servers (seed for the in-memory catalog).
    pub servers: Vec<ServerRecord>,

    /// Tenant database provisioning behavior.
    #[serde(default)]
    pub provisioning: ProvisioningConfig,

    /// Connection-layer timeouts.
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Table sync behavior.
    #[serde(default)]
    pub sync: SyncConfig,
}

/// Provisioning configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningConfig {
    /// Prefix prepended to the tenant code to form the database name.
    #[serde(default)]
    pub db_prefix: String,

    /// Data file directory when the server record has none.
    #[serde(default = "default_data_path")]
    pub data_path: String,

    /// Log file directory when the server record has none.
    #[serde(default = "default_log_path")]
    pub log_path: String,

    #[serde(default = "default_initial_size_mb")]
    pub initial_size_mb: u32,

    #[serde(default = "default_log_size_mb")]
    pub log_size_mb: u32,

    #[serde(default = "default_file_growth_mb")]
    pub file_growth_mb: u32,

    #[serde(default = "default_log_growth_mb")]
    pub log_growth_mb: u32,

    #[serde(default = "default_collation")]
    pub collation: String,

    /// Bound on the wait for a new database to come online.
    #[serde(default = "default_readiness_timeout_secs")]
    pub readiness_timeout_secs: u64,

    #[serde(default = "default_readiness_poll_ms")]
    pub readiness_poll_ms: u64,

    /// Length of generated login passwords.
    #[serde(default = "default_password_length")]
    pub password_length: usize,

    /// Schema that holds the cloned tables.
    #[serde(default = "default_dbo_schema")]
    pub schema: String,

    #[serde(default)]
    pub clone: CloneConfig,

    #[serde(default)]
    pub admin_account: AdminAccountConfig,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            db_prefix: String::new(),
            data_path: default_data_path(),
            log_path: default_log_path(),
            initial_size_mb: default_initial_size_mb(),
            log_size_mb: default_log_size_mb(),
            file_growth_mb: default_file_growth_mb(),
            log_growth_mb: default_log_growth_mb(),
            collation: default_collation(),
            readiness_timeout_secs: default_readiness_timeout_secs(),
            readiness_poll_ms: default_readiness_poll_ms(),
            password_length: default_password_length(),
            schema: default_dbo_schema(),
            clone: CloneConfig::default(),
            admin_account: AdminAccountConfig::default(),
        }
    }
}

impl ProvisioningConfig {
    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    pub fn readiness_poll(&self) -> Duration {
        Duration::from_millis(self.readiness_poll_ms)
    }
}

/// How template tables are cloned into a new tenant database.
///
/// Every base table of the template schema gets its structure cloned; the
/// lists only order the clone and decide which rows follow. Rows are only
/// ever copied for `with_data` tables, which are expected to be small
/// reference tables: the cross-server path holds a whole table in memory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CloneConfig {
    /// Tables cloned with their rows.
    #[serde(default = "default_with_data_tables")]
    pub with_data: Vec<String>,

    /// Tables known to be cloned as empty structures, created right after
    /// the `with_data` tables.
    #[serde(default = "default_schema_only_tables")]
    pub schema_only: Vec<String>,
}

impl Default for CloneConfig {
    fn default() -> Self {
        Self {
            with_data: default_with_data_tables(),
            schema_only: default_schema_only_tables(),
        }
    }
}

impl CloneConfig {
    /// Configured tables, data tables first.
    pub fn all_tables(&self) -> impl Iterator<Item = &String> {
        self.with_data.iter().chain(self.schema_only.iter())
    }

    pub fn copies_data(&self, table: &str) -> bool {
        self.with_data.iter().any(|t| t.eq_ignore_ascii_case(table))
    }
}

/// Initial administrator row created in every tenant database.
#[derive(Clone, Serialize, Deserialize)]
pub struct AdminAccountConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_admin_table")]
    pub table: String,

    #[serde(default = "default_admin_user")]
    pub user_id: String,

    #[serde(default = "default_admin_user_name")]
    pub user_name: String,

    #[serde(default = "default_admin_role")]
    pub role_code: String,

    /// Initial password, stored hashed (SHA2_256) by the database.
    #[serde(default = "default_admin_password")]
    pub initial_password: String,
}

impl Default for AdminAccountConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            table: default_admin_table(),
            user_id: default_admin_user(),
            user_name: default_admin_user_name(),
            role_code: default_admin_role(),
            initial_password: default_admin_password(),
        }
    }
}

impl fmt::Debug for AdminAccountConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminAccountConfig")
            .field("enabled", &self.enabled)
            .field("table", &self.table)
            .field("user_id", &self.user_id)
            .field("user_name", &self.user_name)
            .field("initial_password", &"[REDACTED]")
            .finish()
    }
}

/// Connection-layer timeouts applied by every driver.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ConnectionConfig {
    #[serde(default = "default_login_timeout_secs")]
    pub login_timeout_secs: u64,

    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            login_timeout_secs: default_login_timeout_secs(),
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

impl ConnectionConfig {
    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Sync engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Use the external bulk utility when it can be found (default: true).
    #[serde(default = "default_true")]
    pub bcp_enabled: bool,

    /// Explicit path to the bulk utility; searched on PATH otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bcp_path: Option<PathBuf>,

    #[serde(default = "default_bcp_batch_size")]
    pub bcp_batch_size: usize,

    #[serde(default = "default_bcp_timeout_secs")]
    pub bcp_timeout_secs: u64,

    /// Rows per chunk for the in-process fallback copy.
    #[serde(default = "default_fallback_batch_size")]
    pub fallback_batch_size: usize,

    /// Directory for export files (default: system temp dir).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            bcp_enabled: true,
            bcp_path: None,
            bcp_batch_size: default_bcp_batch_size(),
            bcp_timeout_secs: default_bcp_timeout_secs(),
            fallback_batch_size: default_fallback_batch_size(),
            work_dir: None,
        }
    }
}

impl SyncConfig {
    pub fn bcp_timeout(&self) -> Duration {
        Duration::from_secs(self.bcp_timeout_secs)
    }
}

fn default_true() -> bool {
    true
}

fn default_data_path() -> String {
    r"C:\Data".to_string()
}

fn default_log_path() -> String {
    r"C:\Log".to_string()
}

fn default_initial_size_mb() -> u32 {
    100
}

fn default_log_size_mb() -> u32 {
    64
}

fn default_file_growth_mb() -> u32 {
    100
}

fn default_log_growth_mb() -> u32 {
    1024
}

fn default_collation() -> String {
    "Korean_Wansung_CI_AS".to_string()
}

fn default_readiness_timeout_secs() -> u64 {
    30
}

fn default_readiness_poll_ms() -> u64 {
    1000
}

fn default_password_length() -> usize {
    16
}

fn default_dbo_schema() -> String {
    "dbo".to_string()
}

fn default_with_data_tables() -> Vec<String> {
    [
        "TB_COM_CODE",
        "TB_COM_CODE_GRP",
        "TB_MENU",
        "TB_ROLE",
        "TB_ROLE_MENU",
        "TB_CONFIG",
        "TB_ACCT_CD",
        "TB_DEPT",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_schema_only_tables() -> Vec<String> {
    [
        "TB_USER",
        "TB_TAX_INVOICE",
        "TB_TAX_INVOICE_ITEM",
        "TB_JOURNAL",
        "TB_VOUCHER",
        "TB_BIZPARTNER",
        "TB_SYS_LOG",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_admin_table() -> String {
    "TB_USER".to_string()
}

fn default_admin_user() -> String {
    "admin".to_string()
}

fn default_admin_user_name() -> String {
    "System Administrator".to_string()
}

fn default_admin_role() -> String {
    "ADMIN".to_string()
}

fn default_admin_password() -> String {
    "Admin@1234".to_string()
}

fn default_login_timeout_secs() -> u64 {
    10
}

fn default_command_timeout_secs() -> u64 {
    300
}

fn default_bcp_batch_size() -> usize {
    50_000
}

fn default_bcp_timeout_secs() -> u64 {
    3600
}

fn default_fallback_batch_size() -> usize {
    5000
}
