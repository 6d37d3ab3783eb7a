//! # corp-provision
//!
//! Tenant database provisioning and cross-server table replication for
//! SQL Server.
//!
//! - **Provisioning**: create a tenant database from a template script,
//!   apply the standard option set, clone schema and reference data from a
//!   template database, create the tenant login and admin account, and roll
//!   everything back on a critical failure
//! - **Sync**: copy tables between databases on different servers through a
//!   server link or a `bcp` pipeline, tracked as cancellable jobs and
//!   verified by row counts
//!
//! ## Example
//!
//! ```rust,no_run
//! use corp_provision::{Config, Provisioner, ProvisioningRequest};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> corp_provision::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let provisioner = Provisioner::new(
//!         Arc::new(config.catalog()),
//!         config.provisioning.clone(),
//!         config.connection,
//!     );
//!     let result = provisioner
//!         .provision(ProvisioningRequest {
//!             source_server_id: 1,
//!             source_db: "ACC_TEMPLATE".into(),
//!             target_server_id: 2,
//!             tenant_code: "C0042".into(),
//!             tenant_name: "Acme Trading".into(),
//!             tax_id: None,
//!         })
//!         .await?;
//!     println!("{} ready: {}", result.db_name, result.success);
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod cloner;
pub mod config;
pub mod core;
pub mod driver;
pub mod error;
pub mod provision;
pub mod sync;
pub mod template;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenient access
pub use catalog::{EngineType, MemoryCatalog, ServerCatalog, ServerRecord, TenantRecord};
pub use config::{Config, ConnectionConfig, ProvisioningConfig, SyncConfig};
pub use driver::{connect_driver, Connection, Driver};
pub use error::{ProvisionError, Result};
pub use provision::{Provisioner, ProvisioningRequest, ProvisioningResult, ProvisioningStep};
pub use sync::{
    Endpoint, JobRegistry, JobStatus, SyncEngine, SyncJob, SyncOptions, SyncRequest, SyncStrategy,
    TableDeleteRequest, TableInitRequest, TableInitializer, TableRef,
};
pub use template::{configure_database, ConfigureResult, CreateDatabaseParams};
