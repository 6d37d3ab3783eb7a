//! Provisioning orchestrator: the step-wise tenant database pipeline.
//!
//! Steps run strictly in order:
//!
//! ```text
//! CreateDatabase -> ConfigureOptions -> CreateLoginAndUser -> CopySchema
//!   -> CopyExtendedProperties -> CopyIndexes -> CopyData
//!   -> CreateAdminAccount -> RegisterMetadata -> Done
//! ```
//!
//! `CreateDatabase`, `CreateLoginAndUser` and `CopySchema` are critical: a
//! failure ends the run with `success = false` and drops the half-created
//! database (and the login) only when this run created it. A database name
//! that already exists on the target is rejected before the first step.
//! Every other step downgrades its failure to a [`Warning`].

pub mod credentials;
pub mod request;
pub mod result;
pub mod steps;

pub use credentials::generate_password;
pub use request::ProvisioningRequest;
pub use result::{connection_string, ProvisioningResult, Warning};
pub use steps::{ProgressLog, ProvisioningStep, StepName, StepStatus};

use crate::catalog::{ServerCatalog, ServerRecord, TenantRecord};
use crate::cloner::SchemaCloner;
use crate::config::{ConnectionConfig, ProvisioningConfig};
use crate::core::identifier::{qualify_mssql, quote_literal, quote_mssql, validate_identifier};
use crate::core::SqlValue;
use crate::driver::{driver_factory, Driver, DriverFactory};
use crate::error::{ProvisionError, Result};
use crate::template::{
    configure_database, extract_database_name, fallback_database_name,
    generate_create_database_sql, parse_statements, CreateDatabaseParams, Verification,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Database name prefix used when a custom script names no database.
const SCRIPT_FALLBACK_PREFIX: &str = "ACC";

const READINESS_SQL: &str = "SELECT state_desc AS db_state FROM sys.databases WHERE name = @P1";

const DATABASE_EXISTS_SQL: &str = "SELECT database_id FROM sys.databases WHERE name = @P1";

/// Everything a run needs, resolved before the first step.
struct Plan {
    request: ProvisioningRequest,
    target_server: ServerRecord,
    source: Arc<dyn Driver>,
    target: Arc<dyn Driver>,
    db_name: String,
    login_name: String,
    password: String,
    create_statements: Vec<String>,
    /// Grant `db_owner` instead of reader/writer/execute.
    owner: bool,
}

/// Mutable state of one run.
#[derive(Default)]
struct RunState {
    /// Set once this run's `CREATE DATABASE` statements succeeded.
    db_created: bool,
    login_created: bool,
    verification: Option<Verification>,
    tables: Vec<String>,
    warnings: Vec<Warning>,
}

type StepFailure = (StepName, ProvisionError);

/// Runs provisioning requests against a server catalog.
#[derive(Clone)]
pub struct Provisioner {
    catalog: Arc<dyn ServerCatalog>,
    drivers: DriverFactory,
    config: ProvisioningConfig,
}

impl Provisioner {
    pub fn new(
        catalog: Arc<dyn ServerCatalog>,
        config: ProvisioningConfig,
        connection: ConnectionConfig,
    ) -> Self {
        Self {
            catalog,
            drivers: driver_factory(connection),
            config,
        }
    }

    /// Replace how drivers are built for server records.
    pub fn with_driver_factory(mut self, drivers: DriverFactory) -> Self {
        self.drivers = drivers;
        self
    }

    pub fn config(&self) -> &ProvisioningConfig {
        &self.config
    }

    /// Provision a tenant database from the rendered template script.
    ///
    /// Returns `Err` only when the request is rejected before any step runs
    /// (invalid input, duplicate tenant, unknown server, database name
    /// already taken). Step failures are reported inside the
    /// [`ProvisioningResult`].
    pub async fn provision(&self, request: ProvisioningRequest) -> Result<ProvisioningResult> {
        self.provision_observed(request, None, ProgressLog::new()).await
    }

    /// Provision using an operator-supplied `CREATE DATABASE` script.
    pub async fn provision_with_script(
        &self,
        request: ProvisioningRequest,
        script: &str,
    ) -> Result<ProvisioningResult> {
        self.provision_observed(request, Some(script), ProgressLog::new())
            .await
    }

    /// Run on a separate task, streaming step transitions as they happen.
    pub fn spawn(
        &self,
        request: ProvisioningRequest,
        script: Option<String>,
    ) -> (
        JoinHandle<Result<ProvisioningResult>>,
        mpsc::UnboundedReceiver<ProvisioningStep>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let this = self.clone();
        let handle = tokio::spawn(async move {
            this.provision_observed(request, script.as_deref(), ProgressLog::observed(tx))
                .await
        });
        (handle, rx)
    }

    /// Validate, resolve and run the pipeline, recording into `log`.
    pub async fn provision_observed(
        &self,
        request: ProvisioningRequest,
        script: Option<&str>,
        log: ProgressLog,
    ) -> Result<ProvisioningResult> {
        let plan = self.prepare(request, script).await?;
        Ok(self.execute(plan, log).await)
    }

    async fn prepare(&self, request: ProvisioningRequest, script: Option<&str>) -> Result<Plan> {
        request.validate()?;
        if self.catalog.tenant_exists(&request.tenant_code).await? {
            return Err(ProvisionError::Validation(format!(
                "tenant code already registered: {}",
                request.tenant_code
            )));
        }

        let source_server = self.catalog.get_server(request.source_server_id).await?;
        let target_server = self.catalog.get_server(request.target_server_id).await?;
        let source = (self.drivers)(&source_server)?;
        let target = (self.drivers)(&target_server)?;

        let (db_name, login_name, create_statements, owner) = match script {
            Some(script) => {
                let db_name = extract_database_name(script).unwrap_or_else(|| {
                    fallback_database_name(SCRIPT_FALLBACK_PREFIX, &request.tenant_code)
                });
                let statements = parse_statements(script);
                if statements.is_empty() {
                    return Err(ProvisionError::Validation(
                        "script contains no executable statements".into(),
                    ));
                }
                let login = format!("{}_user", db_name);
                (db_name, login, statements, true)
            }
            None => {
                let db_name = format!("{}{}", self.config.db_prefix, request.tenant_code);
                let params = CreateDatabaseParams::from_config(db_name.as_str(), &self.config)
                    .with_paths(
                        target_server.data_path.as_deref(),
                        target_server.log_path.as_deref(),
                    )
                    .with_tenant(
                        request.tenant_code.as_str(),
                        request.tenant_name.as_str(),
                        request.source_db.as_str(),
                    );
                let statements = parse_statements(&generate_create_database_sql(&params));
                let login = format!("{}_user", request.tenant_code);
                (db_name, login, statements, false)
            }
        };
        validate_identifier(&db_name)?;
        validate_identifier(&login_name)?;
        if database_exists(target.as_ref(), &db_name).await? {
            return Err(ProvisionError::Validation(format!(
                "database already exists on server {}: {}",
                target_server.id, db_name
            )));
        }

        Ok(Plan {
            password: generate_password(self.config.password_length),
            request,
            target_server,
            source,
            target,
            db_name,
            login_name,
            create_statements,
            owner,
        })
    }

    async fn execute(&self, plan: Plan, mut log: ProgressLog) -> ProvisioningResult {
        let started = Instant::now();
        let mut state = RunState::default();
        info!(
            "Provisioning {} as {} on server {}",
            plan.request.tenant_code, plan.db_name, plan.target_server.id
        );

        let outcome = self.run_steps(&plan, &mut log, &mut state).await;

        let error = match outcome {
            Ok(()) => {
                log.done(StepName::Done, format!("{} ready", plan.db_name));
                info!(
                    "Provisioned {} in {:.1}s ({} warning(s))",
                    plan.db_name,
                    started.elapsed().as_secs_f64(),
                    state.warnings.len()
                );
                None
            }
            Err((step, e)) => {
                error!("Provisioning {} failed at {}: {}", plan.db_name, step, e);
                log.failed(step, e.to_string());
                if state.db_created {
                    let login = state.login_created.then_some(plan.login_name.as_str());
                    rollback_database(plan.target.as_ref(), &plan.db_name, login).await;
                    log.done(StepName::RolledBack, format!("{} dropped", plan.db_name));
                }
                Some(format!("{}: {}", step, e))
            }
        };

        let success = error.is_none();
        ProvisioningResult {
            success,
            tenant_code: plan.request.tenant_code.clone(),
            db_name: plan.db_name.clone(),
            login_name: plan.login_name.clone(),
            password: success.then(|| plan.password.clone()),
            server_id: plan.target_server.id,
            host: plan.target_server.host.clone(),
            port: plan.target_server.port(),
            connection_string: if success {
                connection_string(
                    &plan.target_server.host,
                    plan.target_server.port(),
                    &plan.db_name,
                    &plan.login_name,
                    &plan.password,
                )
            } else {
                String::new()
            },
            elapsed_seconds: started.elapsed().as_secs_f64(),
            warnings: state.warnings,
            error,
            steps: log.into_steps(),
            verification: state.verification,
            tables: state.tables,
        }
    }

    async fn run_steps(
        &self,
        plan: &Plan,
        log: &mut ProgressLog,
        state: &mut RunState,
    ) -> std::result::Result<(), StepFailure> {
        let target = plan.target.as_ref();
        let db = plan.db_name.as_str();

        // CreateDatabase
        log.running(StepName::CreateDatabase, format!("creating {}", db));
        critical(StepName::CreateDatabase, self.create_database(plan, state).await)?;
        log.done(StepName::CreateDatabase, format!("{} online", db));

        // ConfigureOptions
        log.running(StepName::ConfigureOptions, "applying database options");
        match configure_database(target, db).await {
            Ok(configured) => {
                let count = configured.warnings.len();
                state.warnings.extend(
                    configured
                        .warnings
                        .into_iter()
                        .map(|w| Warning::new(StepName::ConfigureOptions, w)),
                );
                state.verification = configured.verification;
                log.done(
                    StepName::ConfigureOptions,
                    format!("options applied ({} warning(s))", count),
                );
            }
            Err(e) => soft_fail(log, state, StepName::ConfigureOptions, e),
        }

        // CreateLoginAndUser
        log.running(
            StepName::CreateLoginAndUser,
            format!("creating {}", plan.login_name),
        );
        critical(
            StepName::CreateLoginAndUser,
            self.create_login_and_user(plan, state).await,
        )?;
        log.done(
            StepName::CreateLoginAndUser,
            format!("{} created", plan.login_name),
        );

        let cloner = SchemaCloner::new(
            plan.source.clone(),
            plan.request.source_db.as_str(),
            plan.target.clone(),
            db,
            self.config.clone.clone(),
        )
        .with_schema(self.config.schema.as_str());

        // CopySchema
        log.running(StepName::CopySchema, "copying table structures");
        let copied = match cloner.plan_tables().await {
            Ok(planned) => cloner.copy_schema(&planned).await,
            Err(e) => Err(e),
        };
        let tables = critical(StepName::CopySchema, copied)?;
        log.done(
            StepName::CopySchema,
            format!("{} table(s) created", tables.len()),
        );
        state.tables = tables;

        // CopyExtendedProperties
        log.running(StepName::CopyExtendedProperties, "copying descriptions");
        match cloner.copy_extended_properties(&state.tables).await {
            Ok(report) => {
                let applied = report.applied;
                absorb(state, StepName::CopyExtendedProperties, report.warnings);
                log.done(
                    StepName::CopyExtendedProperties,
                    format!("{} description(s) copied", applied),
                );
            }
            Err(e) => soft_fail(log, state, StepName::CopyExtendedProperties, e),
        }

        // CopyIndexes
        log.running(StepName::CopyIndexes, "creating primary keys");
        match cloner.copy_primary_keys(&state.tables).await {
            Ok(report) => {
                let applied = report.applied;
                absorb(state, StepName::CopyIndexes, report.warnings);
                log.done(
                    StepName::CopyIndexes,
                    format!("{} primary key(s) created", applied),
                );
            }
            Err(e) => soft_fail(log, state, StepName::CopyIndexes, e),
        }

        // CopyData
        log.running(StepName::CopyData, "copying reference data");
        match cloner.copy_data(&state.tables).await {
            Ok(report) => {
                let rows: u64 = report.rows.values().sum();
                let applied = report.applied;
                absorb(state, StepName::CopyData, report.warnings);
                log.done(
                    StepName::CopyData,
                    format!("{} row(s) in {} table(s)", rows, applied),
                );
            }
            Err(e) => soft_fail(log, state, StepName::CopyData, e),
        }

        // CreateAdminAccount
        log.running(StepName::CreateAdminAccount, "creating administrator");
        match self.create_admin_account(target, db).await {
            Ok(message) => log.done(StepName::CreateAdminAccount, message),
            Err(e) => soft_fail(log, state, StepName::CreateAdminAccount, e),
        }

        // RegisterMetadata
        log.running(StepName::RegisterMetadata, "registering tenant");
        let tenant = TenantRecord {
            code: plan.request.tenant_code.clone(),
            name: plan.request.tenant_name.clone(),
            tax_id: plan.request.tax_id.clone(),
            server_id: plan.target_server.id,
            db_name: plan.db_name.clone(),
            login_name: plan.login_name.clone(),
            created_at: Utc::now(),
        };
        match self.catalog.register_tenant(tenant).await {
            Ok(()) => log.done(StepName::RegisterMetadata, "tenant registered"),
            Err(e) => soft_fail(log, state, StepName::RegisterMetadata, e),
        }

        Ok(())
    }

    async fn create_database(&self, plan: &Plan, state: &mut RunState) -> Result<()> {
        let target = plan.target.as_ref();
        let mut conn = target.connect(target.server().system_db()).await?;
        for statement in &plan.create_statements {
            conn.execute(statement, &[]).await?;
        }
        state.db_created = true;
        conn.close().await?;
        self.wait_for_ready(target, &plan.db_name).await
    }

    /// Poll `sys.databases` until the database is `ONLINE`.
    async fn wait_for_ready(&self, driver: &dyn Driver, db_name: &str) -> Result<()> {
        let timeout = self.config.readiness_timeout();
        let poll = self.config.readiness_poll();
        let started = tokio::time::Instant::now();

        loop {
            match driver
                .execute_query(
                    driver.server().system_db(),
                    READINESS_SQL,
                    &[SqlValue::from(db_name)],
                )
                .await
            {
                Ok(rows) => {
                    let state = rows.first().map(|r| r.get_string("db_state"));
                    if state.as_deref() == Some("ONLINE") {
                        debug!("{} online after {:?}", db_name, started.elapsed());
                        return Ok(());
                    }
                    debug!("{} state: {:?}", db_name, state);
                }
                Err(e) => debug!("Readiness check for {} failed: {}", db_name, e),
            }

            if started.elapsed() + poll > timeout {
                return Err(ProvisionError::ReadinessTimeout {
                    database: db_name.to_string(),
                    waited_secs: timeout.as_secs(),
                });
            }
            tokio::time::sleep(poll).await;
        }
    }

    async fn create_login_and_user(&self, plan: &Plan, state: &mut RunState) -> Result<()> {
        let target = plan.target.as_ref();
        let login = quote_mssql(&plan.login_name)?;
        let login_literal = quote_literal(&plan.login_name);

        let mut master = target.connect(target.server().system_db()).await?;
        let existing = master
            .query(
                "SELECT 1 AS found FROM sys.server_principals WHERE name = @P1",
                &[SqlValue::from(plan.login_name.as_str())],
            )
            .await?;
        let create_login = format!(
            "IF NOT EXISTS (SELECT 1 FROM sys.server_principals WHERE name = {lit})\n\
             \x20   CREATE LOGIN {login} WITH PASSWORD = {pw}, DEFAULT_DATABASE = {db}, CHECK_POLICY = ON",
            lit = login_literal,
            login = login,
            pw = quote_literal(&plan.password),
            db = quote_mssql(&plan.db_name)?,
        );
        master.execute(&create_login, &[]).await?;
        state.login_created = existing.is_empty();
        master.close().await?;

        let mut conn = target.connect(&plan.db_name).await?;
        conn.execute(
            &format!(
                "IF NOT EXISTS (SELECT 1 FROM sys.database_principals WHERE name = {})\n\
                 \x20   CREATE USER {} FOR LOGIN {}",
                login_literal, login, login
            ),
            &[],
        )
        .await?;

        let grants = if plan.owner {
            vec![format!(
                "IF IS_ROLEMEMBER('db_owner', {}) = 0 ALTER ROLE db_owner ADD MEMBER {}",
                login_literal, login
            )]
        } else {
            vec![
                format!("ALTER ROLE db_datareader ADD MEMBER {}", login),
                format!("ALTER ROLE db_datawriter ADD MEMBER {}", login),
                format!("GRANT EXECUTE TO {}", login),
            ]
        };
        for grant in &grants {
            conn.execute(grant, &[]).await?;
        }
        conn.close().await?;
        Ok(())
    }

    /// Insert the configured administrator row if the user table exists.
    async fn create_admin_account(&self, target: &dyn Driver, db_name: &str) -> Result<String> {
        let admin = &self.config.admin_account;
        if !admin.enabled {
            return Ok("disabled".to_string());
        }
        let table = qualify_mssql(&self.config.schema, &admin.table)?;
        let sql = format!(
            "IF OBJECT_ID(@P1, N'U') IS NOT NULL\n\
             BEGIN\n\
             \x20   IF NOT EXISTS (SELECT 1 FROM {t} WHERE USER_ID = @P2)\n\
             \x20       INSERT INTO {t} (USER_ID, USER_NM, USER_PWD, ROLE_CD, USE_YN, REG_DT)\n\
             \x20       VALUES (@P2, @P3, CONVERT(VARCHAR(256), HASHBYTES('SHA2_256', CAST(@P4 AS VARCHAR(256))), 2), @P5, 'Y', GETDATE())\n\
             END",
            t = table
        );
        let inserted = target
            .execute_non_query(
                db_name,
                &sql,
                &[
                    SqlValue::from(table.as_str()),
                    SqlValue::from(admin.user_id.as_str()),
                    SqlValue::from(admin.user_name.as_str()),
                    SqlValue::from(admin.initial_password.as_str()),
                    SqlValue::from(admin.role_code.as_str()),
                ],
            )
            .await?;
        Ok(if inserted > 0 {
            format!("administrator {} created", admin.user_id)
        } else {
            format!("administrator {} already present or {} missing", admin.user_id, admin.table)
        })
    }
}

async fn database_exists(driver: &dyn Driver, db_name: &str) -> Result<bool> {
    let rows = driver
        .execute_query(
            driver.server().system_db(),
            DATABASE_EXISTS_SQL,
            &[SqlValue::from(db_name)],
        )
        .await?;
    Ok(!rows.is_empty())
}

fn critical<T>(step: StepName, result: Result<T>) -> std::result::Result<T, StepFailure> {
    result.map_err(|e| (step, e))
}

fn soft_fail(log: &mut ProgressLog, state: &mut RunState, step: StepName, e: ProvisionError) {
    warn!("{} failed, continuing: {}", step, e);
    log.failed(step, e.to_string());
    state.warnings.push(Warning::new(step, e.to_string()));
}

fn absorb(state: &mut RunState, step: StepName, warnings: Vec<String>) {
    state
        .warnings
        .extend(warnings.into_iter().map(|w| Warning::new(step, w)));
}

/// Force-disconnect and drop `db_name`, and drop `login` when given.
///
/// Safe to repeat: every statement is guarded by an existence check.
/// Failures are logged and swallowed; the return value reports whether
/// everything succeeded.
pub async fn rollback_database(driver: &dyn Driver, db_name: &str, login: Option<&str>) -> bool {
    let mut statements = Vec::new();
    match quote_mssql(db_name) {
        Ok(db) => statements.push(format!(
            "IF DB_ID({lit}) IS NOT NULL\n\
             BEGIN\n\
             \x20   ALTER DATABASE {db} SET SINGLE_USER WITH ROLLBACK IMMEDIATE;\n\
             \x20   DROP DATABASE {db};\n\
             END",
            lit = quote_literal(db_name),
            db = db
        )),
        Err(e) => {
            error!("Rollback of {} skipped: {}", db_name, e);
            return false;
        }
    }
    if let Some(login) = login {
        if let Ok(quoted) = quote_mssql(login) {
            statements.push(format!(
                "IF EXISTS (SELECT 1 FROM sys.server_principals WHERE name = {})\n\
                 \x20   DROP LOGIN {}",
                quote_literal(login),
                quoted
            ));
        }
    }

    let mut conn = match driver.connect(driver.server().system_db()).await {
        Ok(conn) => conn,
        Err(e) => {
            error!("Rollback of {} failed: {}", db_name, e);
            return false;
        }
    };
    let mut clean = true;
    for statement in &statements {
        if let Err(e) = conn.execute(statement, &[]).await {
            error!("Rollback statement for {} failed: {}", db_name, e);
            clean = false;
        }
    }
    if clean {
        info!("Rolled back {}", db_name);
    }
    clean
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::core::Row;
    use crate::testing::{scalar, MockDriver};
    use std::collections::HashMap;

    fn request(code: &str, source: i64, target: i64) -> ProvisioningRequest {
        ProvisioningRequest {
            source_server_id: source,
            source_db: "TEMPLATE".into(),
            target_server_id: target,
            tenant_code: code.into(),
            tenant_name: "Acme Corp".into(),
            tax_id: Some("123-45-67890".into()),
        }
    }

    /// A healthy server: databases come online, template has two tables.
    fn healthy(id: i64) -> MockDriver {
        let driver = MockDriver::new(id);
        driver.on_query(READINESS_SQL, vec![online("ONLINE")]);
        driver.on_query("DB_ID(@P1)", vec![scalar("db_id", 9)]);
        driver.on_query(
            "INFORMATION_SCHEMA.TABLES",
            vec![scalar("table_name", "TB_COM_CODE"), scalar("table_name", "TB_USER")],
        );
        driver.on_query(
            "is_computed",
            vec![Row::from_pairs([
                ("column_name", SqlValue::from("CODE")),
                ("is_identity", SqlValue::Bool(false)),
            ])],
        );
        driver.on_execute("INSERT INTO", 3);
        driver
    }

    fn online(state: &str) -> Row {
        scalar("db_state", state)
    }

    fn column(table: &str, name: &str, data_type: &str) -> Row {
        Row::from_pairs([
            ("table_name", SqlValue::from(table)),
            ("column_name", SqlValue::from(name)),
            ("data_type", SqlValue::from(data_type)),
            ("max_length", SqlValue::I32(40)),
            ("precision", SqlValue::I32(0)),
            ("scale", SqlValue::I32(0)),
            ("is_nullable", SqlValue::Bool(false)),
            ("is_identity", SqlValue::Bool(false)),
        ])
    }

    fn provisioner(catalog: Arc<MemoryCatalog>, drivers: Vec<MockDriver>) -> Provisioner {
        let by_id: HashMap<i64, MockDriver> =
            drivers.into_iter().map(|d| (d.server().id, d)).collect();
        let factory: DriverFactory = Arc::new(move |server: &ServerRecord| {
            by_id
                .get(&server.id)
                .cloned()
                .map(MockDriver::into_driver)
                .ok_or_else(|| ProvisionError::not_found(format!("server {}", server.id)))
        });
        let config = ProvisioningConfig {
            readiness_timeout_secs: 3,
            readiness_poll_ms: 1000,
            ..Default::default()
        };
        Provisioner::new(catalog, config, ConnectionConfig::default()).with_driver_factory(factory)
    }

    fn catalog() -> Arc<MemoryCatalog> {
        Arc::new(MemoryCatalog::with_servers([
            ServerRecord::mssql(1, "sql01", "sa", "pw"),
            ServerRecord::mssql(2, "sql02", "sa", "pw"),
        ]))
    }

    #[tokio::test]
    async fn test_successful_run_reports_every_step_done() {
        let catalog = catalog();
        let server = healthy(1);
        let p = provisioner(catalog.clone(), vec![server.clone()]);

        let result = p.provision(request("ACME01", 1, 1)).await.unwrap();
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.db_name, "ACME01");
        assert_eq!(result.login_name, "ACME01_user");
        assert!(result.password.as_deref().is_some_and(|p| p.len() == 16));
        assert!(result.connection_string.starts_with("Server=sql01,1433;Database=ACME01;"));
        assert_eq!(result.tables, vec!["TB_COM_CODE", "TB_USER"]);

        let mut log = ProgressLog::new();
        for step in &result.steps {
            log.record(step.name, step.status, step.message.clone());
        }
        let finals = log.final_statuses();
        let names: Vec<_> = finals.iter().map(|(n, _)| *n).collect();
        assert_eq!(names, StepName::PIPELINE.to_vec());
        assert!(finals.iter().all(|(_, s)| *s == StepStatus::Done));

        let tenant = catalog.tenant("ACME01").unwrap();
        assert_eq!(tenant.db_name, "ACME01");
        assert_eq!(tenant.login_name, "ACME01_user");
        assert_eq!(server.count_matching("DROP DATABASE"), 0);

        // reader/writer/execute grants for the standard path
        assert_eq!(server.count_matching("ALTER ROLE db_datawriter ADD MEMBER [ACME01_user]"), 1);
        assert_eq!(server.count_matching("db_owner"), 0);
    }

    #[tokio::test]
    async fn test_prefix_applies_to_database_name() {
        let mut p = provisioner(catalog(), vec![healthy(1)]);
        p.config.db_prefix = "ACC_".into();
        let result = p.provision(request("ACME01", 1, 1)).await.unwrap();
        assert_eq!(result.db_name, "ACC_ACME01");
        assert_eq!(result.login_name, "ACME01_user");
    }

    #[tokio::test]
    async fn test_duplicate_tenant_rejected_before_any_step() {
        let catalog = catalog();
        let server = healthy(1);
        let p = provisioner(catalog.clone(), vec![server.clone()]);
        p.provision(request("ACME01", 1, 1)).await.unwrap();
        let statements_before = server.statements().len();

        let err = p.provision(request("acme01", 1, 1)).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Validation(_)));
        assert_eq!(server.statements().len(), statements_before);
    }

    #[tokio::test]
    async fn test_invalid_request_runs_nothing() {
        let server = healthy(1);
        let p = provisioner(catalog(), vec![server.clone()]);
        let err = p.provision(request("A-1", 1, 1)).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Validation(_)));
        assert_eq!(server.connects(), 0);
    }

    #[tokio::test]
    async fn test_schema_failure_rolls_back() {
        let catalog = catalog();
        let server = healthy(1);
        server.fail_on("SELECT * INTO", "permission denied");
        let p = provisioner(catalog.clone(), vec![server.clone()]);

        let result = p.provision(request("ACME01", 1, 1)).await.unwrap();
        assert!(!result.success);
        assert!(result.password.is_none());
        assert!(result.connection_string.is_empty());
        assert!(result.error.as_deref().unwrap().starts_with("CopySchema:"));

        let last = result.steps.last().unwrap();
        assert_eq!(last.name, StepName::RolledBack);
        assert!(server.count_matching("DROP DATABASE [ACME01]") == 1);
        // login was new, so it is dropped too
        assert_eq!(server.count_matching("DROP LOGIN [ACME01_user]"), 1);
        assert!(catalog.tenant("ACME01").is_none());
        assert_eq!(server.count_matching("sp_addextendedproperty"), 0);
    }

    #[tokio::test]
    async fn test_existing_login_is_kept_on_rollback() {
        let server = healthy(1);
        server.on_query("sys.server_principals WHERE name = @P1", vec![scalar("found", 1)]);
        server.fail_on("CREATE USER", "user exists with different login");
        let p = provisioner(catalog(), vec![server.clone()]);

        let result = p.provision(request("ACME01", 1, 1)).await.unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().starts_with("CreateLoginAndUser:"));
        assert_eq!(server.count_matching("DROP DATABASE"), 1);
        assert_eq!(server.count_matching("DROP LOGIN"), 0);
    }

    #[tokio::test]
    async fn test_non_critical_failures_become_warnings() {
        let catalog = catalog();
        let server = healthy(1);
        server.fail_on("sys.key_constraints", "VIEW DEFINITION denied");
        server.fail_on("HASHBYTES", "invalid column name USER_NM");
        server.fail_on("QUERY_STORE = ON", "not supported");
        let p = provisioner(catalog.clone(), vec![server.clone()]);

        let result = p.provision(request("ACME01", 1, 1)).await.unwrap();
        assert!(result.success);
        let steps: Vec<_> = result.warnings.iter().map(|w| w.step).collect();
        assert!(steps.contains(&StepName::ConfigureOptions));
        assert!(steps.contains(&StepName::CopyIndexes));
        assert!(steps.contains(&StepName::CreateAdminAccount));
        assert!(catalog.tenant("ACME01").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_readiness_timeout_rolls_back() {
        let server = healthy(1);
        server.on_query(READINESS_SQL, vec![online("RESTORING")]);
        let p = provisioner(catalog(), vec![server.clone()]);

        let result = p.provision(request("ACME01", 1, 1)).await.unwrap();
        assert!(!result.success);
        let error = result.error.unwrap();
        assert!(error.starts_with("CreateDatabase:"), "{}", error);
        assert!(error.contains("not online after 3s"));
        assert_eq!(server.count_matching("DROP DATABASE"), 1);
        // no login was attempted, nothing to drop
        assert_eq!(server.count_matching("DROP LOGIN"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_readiness_waits_for_online() {
        let server = healthy(1);
        server.on_query_times(READINESS_SQL, vec![online("RECOVERING")], 2);
        let p = provisioner(catalog(), vec![server.clone()]);

        let result = p.provision(request("ACME01", 1, 1)).await.unwrap();
        assert!(result.success);
        assert_eq!(server.count_matching(READINESS_SQL), 3);
    }

    #[tokio::test]
    async fn test_cross_server_uses_both_drivers() {
        let source = healthy(1);
        source.on_query(
            "sys.types",
            vec![
                column("TB_COM_CODE", "CODE", "varchar"),
                column("TB_USER", "USER_ID", "varchar"),
            ],
        );
        let target = healthy(2);
        let p = provisioner(catalog(), vec![source.clone(), target.clone()]);

        let result = p.provision(request("ACME01", 1, 2)).await.unwrap();
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.server_id, 2);
        assert_eq!(target.count_matching("CREATE DATABASE [ACME01]"), 1);
        assert_eq!(source.count_matching("CREATE DATABASE"), 0);
        assert!(source.count_matching("sys.types") > 0);
        assert_eq!(target.count_matching("SELECT * INTO"), 0);
    }

    #[tokio::test]
    async fn test_script_variant_names_and_grants() {
        let server = healthy(1);
        let p = provisioner(catalog(), vec![server.clone()]);
        let script = "USE master\nGO\nCREATE DATABASE [ACC_ACME]\nCOLLATE Korean_Wansung_CI_AS;\nGO\n";

        let result = p
            .provision_with_script(request("ACME01", 1, 1), script)
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.db_name, "ACC_ACME");
        assert_eq!(result.login_name, "ACC_ACME_user");
        assert_eq!(server.count_matching("USE master"), 0);
        assert_eq!(server.count_matching("ALTER ROLE db_owner ADD MEMBER [ACC_ACME_user]"), 1);
    }

    #[tokio::test]
    async fn test_script_without_name_uses_fallback() {
        let p = provisioner(catalog(), vec![healthy(1)]);
        let result = p
            .provision_with_script(request("ACME01", 1, 1), "CREATE DATABASE Acme")
            .await
            .unwrap();
        assert_eq!(result.db_name, "ACC_ACME01");
    }

    #[tokio::test]
    async fn test_spawn_streams_steps() {
        let p = provisioner(catalog(), vec![healthy(1)]);
        let (handle, mut rx) = p.spawn(request("ACME01", 1, 1), None);
        let result = handle.await.unwrap().unwrap();
        assert!(result.success);

        let mut streamed = Vec::new();
        while let Ok(step) = rx.try_recv() {
            streamed.push(step);
        }
        assert_eq!(streamed, result.steps);
        assert_eq!(streamed[0].status, StepStatus::Running);
    }

    #[tokio::test]
    async fn test_create_failure_leaves_database_alone() {
        let catalog = catalog();
        let server = healthy(1);
        server.fail_on("CREATE DATABASE", "Database 'ACME01' already exists");
        let p = provisioner(catalog.clone(), vec![server.clone()]);

        let result = p.provision(request("ACME01", 1, 1)).await.unwrap();
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().starts_with("CreateDatabase:"));
        assert_eq!(server.count_matching("DROP DATABASE"), 0);
        assert_eq!(server.count_matching("DROP LOGIN"), 0);

        let last = result.steps.last().unwrap();
        assert_eq!(last.name, StepName::CreateDatabase);
        assert_eq!(last.status, StepStatus::Failed);
        assert!(catalog.tenant("ACME01").is_none());
    }

    #[tokio::test]
    async fn test_failed_script_never_drops_named_database() {
        let server = healthy(1);
        server.fail_on("CREATE DATABASE", "Database 'TEMPLATE' already exists");
        let p = provisioner(catalog(), vec![server.clone()]);

        let result = p
            .provision_with_script(request("ACME01", 1, 1), "CREATE DATABASE [TEMPLATE]\nGO\n")
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().starts_with("CreateDatabase:"));
        assert_eq!(server.count_matching("DROP DATABASE [TEMPLATE]"), 0);
        assert!(result.steps.iter().all(|s| s.name != StepName::RolledBack));
    }

    #[tokio::test]
    async fn test_existing_database_rejected_before_any_step() {
        let server = healthy(1);
        server.on_query(DATABASE_EXISTS_SQL, vec![scalar("database_id", 7)]);
        let p = provisioner(catalog(), vec![server.clone()]);

        let err = p.provision(request("ACME01", 1, 1)).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Validation(ref m) if m.contains("ACME01")));
        assert_eq!(server.count_matching("CREATE DATABASE"), 0);
        assert_eq!(server.count_matching("DROP DATABASE"), 0);

        let err = p
            .provision_with_script(request("ACME01", 1, 1), "CREATE DATABASE [TEMPLATE]\nGO\n")
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Validation(ref m) if m.contains("TEMPLATE")));
        assert_eq!(server.count_matching("DROP DATABASE"), 0);
    }

    #[tokio::test]
    async fn test_rollback_is_idempotent() {
        let server = MockDriver::new(1);
        assert!(rollback_database(&server, "ACME01", Some("ACME01_user")).await);
        assert!(rollback_database(&server, "ACME01", Some("ACME01_user")).await);
        let first = &server.statements()[0];
        assert!(first.starts_with("IF DB_ID(N'ACME01') IS NOT NULL"));
        assert!(first.contains("SET SINGLE_USER WITH ROLLBACK IMMEDIATE"));
    }

    #[tokio::test]
    async fn test_rollback_failure_is_swallowed() {
        let server = MockDriver::new(1);
        server.fail_connect("master");
        assert!(!rollback_database(&server, "ACME01", None).await);
    }
}
