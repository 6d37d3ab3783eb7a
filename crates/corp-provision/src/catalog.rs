//! Server Catalog: managed server records and registered tenants.
//!
//! The catalog is owned by the host application. The engine only reads
//! server records and, at the end of a successful provisioning run, writes
//! one tenant record. [`MemoryCatalog`] backs the CLI and the tests.

use crate::error::{ProvisionError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

/// SQL engine behind a managed server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EngineType {
    #[default]
    Mssql,
    #[serde(alias = "postgres")]
    Postgresql,
    Mysql,
    Oracle,
}

impl EngineType {
    pub fn default_port(self) -> u16 {
        match self {
            EngineType::Mssql => 1433,
            EngineType::Postgresql => 5432,
            EngineType::Mysql => 3306,
            EngineType::Oracle => 1521,
        }
    }
}

impl fmt::Display for EngineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineType::Mssql => "mssql",
            EngineType::Postgresql => "postgresql",
            EngineType::Mysql => "mysql",
            EngineType::Oracle => "oracle",
        };
        f.write_str(name)
    }
}

/// Connection record for one managed server.
///
/// Immutable for the duration of a provisioning run or sync job.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerRecord {
    pub id: i64,

    /// Display name.
    pub name: String,

    pub host: String,

    /// Port (default: the engine's standard port).
    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default, rename = "type")]
    pub engine: EngineType,

    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Database used when none is given (default: engine system database).
    #[serde(default)]
    pub default_db: Option<String>,

    /// Directory for data files of newly created databases.
    #[serde(default)]
    pub data_path: Option<String>,

    /// Directory for log files of newly created databases.
    #[serde(default)]
    pub log_path: Option<String>,

    /// Require TLS on the wire (default: false).
    #[serde(default)]
    pub encrypt: bool,

    /// Trust self-signed server certificates (default: true).
    #[serde(default = "default_true")]
    pub trust_server_cert: bool,

    #[serde(default = "default_true")]
    pub is_active: bool,

    #[serde(default)]
    pub description: Option<String>,
}

impl ServerRecord {
    /// Minimal SQL Server record, mostly for tests and ad-hoc CLI use.
    pub fn mssql(id: i64, host: &str, username: &str, password: &str) -> Self {
        Self {
            id,
            name: format!("{}-{}", host, id),
            host: host.to_string(),
            port: None,
            engine: EngineType::Mssql,
            username: username.to_string(),
            password: password.to_string(),
            default_db: None,
            data_path: None,
            log_path: None,
            encrypt: false,
            trust_server_cert: true,
            is_active: true,
            description: None,
        }
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.engine.default_port())
    }

    /// The database a connection opens when the caller names none.
    pub fn system_db(&self) -> &str {
        if let Some(db) = self.default_db.as_deref().filter(|d| !d.is_empty()) {
            return db;
        }
        match self.engine {
            EngineType::Postgresql => "postgres",
            EngineType::Mysql => "mysql",
            EngineType::Mssql | EngineType::Oracle => "master",
        }
    }

    /// `host,port` as accepted by SQL Server client tools.
    pub fn address(&self) -> String {
        format!("{},{}", self.host, self.port())
    }
}

impl fmt::Debug for ServerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerRecord")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port())
            .field("engine", &self.engine)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("default_db", &self.default_db)
            .field("data_path", &self.data_path)
            .field("log_path", &self.log_path)
            .field("is_active", &self.is_active)
            .finish()
    }
}

/// Tenant written to the catalog after a successful provisioning run.
///
/// Never carries the generated password.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TenantRecord {
    pub code: String,
    pub name: String,
    pub tax_id: Option<String>,
    pub server_id: i64,
    pub db_name: String,
    pub login_name: String,
    pub created_at: DateTime<Utc>,
}

/// Catalog capability consumed by the engine.
#[async_trait]
pub trait ServerCatalog: Send + Sync {
    /// Look up an active server by id.
    async fn get_server(&self, id: i64) -> Result<ServerRecord>;

    /// Whether a tenant code is already registered.
    async fn tenant_exists(&self, code: &str) -> Result<bool>;

    /// Persist a newly provisioned tenant.
    async fn register_tenant(&self, tenant: TenantRecord) -> Result<()>;
}

/// In-process catalog.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    servers: RwLock<HashMap<i64, ServerRecord>>,
    tenants: RwLock<HashMap<String, TenantRecord>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog pre-loaded with server records.
    pub fn with_servers(servers: impl IntoIterator<Item = ServerRecord>) -> Self {
        let catalog = Self::new();
        for server in servers {
            catalog.add_server(server);
        }
        catalog
    }

    pub fn add_server(&self, server: ServerRecord) {
        let mut servers = self.servers.write().unwrap_or_else(|e| e.into_inner());
        servers.insert(server.id, server);
    }

    pub fn servers(&self) -> Vec<ServerRecord> {
        let servers = self.servers.read().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<_> = servers.values().cloned().collect();
        list.sort_by_key(|s| s.id);
        list
    }

    pub fn tenant(&self, code: &str) -> Option<TenantRecord> {
        let tenants = self.tenants.read().unwrap_or_else(|e| e.into_inner());
        tenants.get(&code.to_uppercase()).cloned()
    }

    pub fn tenants(&self) -> Vec<TenantRecord> {
        let tenants = self.tenants.read().unwrap_or_else(|e| e.into_inner());
        tenants.values().cloned().collect()
    }
}

#[async_trait]
impl ServerCatalog for MemoryCatalog {
    async fn get_server(&self, id: i64) -> Result<ServerRecord> {
        let servers = self.servers.read().unwrap_or_else(|e| e.into_inner());
        servers
            .get(&id)
            .filter(|s| s.is_active)
            .cloned()
            .ok_or_else(|| ProvisionError::not_found(format!("server {}", id)))
    }

    async fn tenant_exists(&self, code: &str) -> Result<bool> {
        let tenants = self.tenants.read().unwrap_or_else(|e| e.into_inner());
        Ok(tenants.contains_key(&code.to_uppercase()))
    }

    async fn register_tenant(&self, tenant: TenantRecord) -> Result<()> {
        let mut tenants = self.tenants.write().unwrap_or_else(|e| e.into_inner());
        let key = tenant.code.to_uppercase();
        if tenants.contains_key(&key) {
            return Err(ProvisionError::Validation(format!(
                "tenant code {} is already registered",
                tenant.code
            )));
        }
        tenants.insert(key, tenant);
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(code: &str) -> TenantRecord {
        TenantRecord {
            code: code.to_string(),
            name: "Acme".to_string(),
            tax_id: None,
            server_id: 1,
            db_name: code.to_string(),
            login_name: format!("{}_user", code),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_get_server_skips_inactive() {
        let mut inactive = ServerRecord::mssql(2, "db2", "sa", "pw");
        inactive.is_active = false;
        let catalog = MemoryCatalog::with_servers([ServerRecord::mssql(1, "db1", "sa", "pw"), inactive]);

        assert_eq!(catalog.get_server(1).await.unwrap().host, "db1");
        assert!(matches!(
            catalog.get_server(2).await,
            Err(ProvisionError::NotFound(_))
        ));
        assert!(catalog.get_server(3).await.is_err());
    }

    #[tokio::test]
    async fn test_tenant_codes_are_unique_case_insensitively() {
        let catalog = MemoryCatalog::new();
        catalog.register_tenant(tenant("ACME01")).await.unwrap();

        assert!(catalog.tenant_exists("acme01").await.unwrap());
        assert!(catalog.register_tenant(tenant("acme01")).await.is_err());
        assert_eq!(catalog.tenants().len(), 1);
    }

    #[test]
    fn test_server_defaults() {
        let server = ServerRecord::mssql(1, "sql01", "sa", "secret");
        assert_eq!(server.port(), 1433);
        assert_eq!(server.system_db(), "master");
        assert_eq!(server.address(), "sql01,1433");
    }

    #[test]
    fn test_server_debug_redacts_password() {
        let server = ServerRecord::mssql(1, "sql01", "sa", "super_secret_password_123");
        let debug_output = format!("{:?}", server);
        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("super_secret_password_123"));
    }

    #[test]
    fn test_engine_type_from_yaml() {
        let server: ServerRecord = serde_yaml::from_str(
            "id: 3\nname: pg\nhost: localhost\ntype: postgres\nusername: app\n",
        )
        .unwrap();
        assert_eq!(server.engine, EngineType::Postgresql);
        assert_eq!(server.port(), 5432);
        assert_eq!(server.system_db(), "postgres");
    }
}
