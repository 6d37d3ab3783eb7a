//! corp-provision CLI - tenant database provisioning and table sync.

use clap::{Parser, Subcommand};
use corp_provision::driver::{connect_driver, HealthStatus};
use corp_provision::sync::{list_linked_databases, list_linked_servers, test_linked_server};
use corp_provision::template::generate_create_database_sql;
use corp_provision::{
    configure_database, Config, CreateDatabaseParams, Driver, Endpoint, JobRegistry, JobStatus,
    ProvisionError, Provisioner, ProvisioningRequest, SyncEngine, SyncJob, SyncOptions,
    SyncRequest, SyncStrategy, TableDeleteRequest, TableInitRequest, TableInitializer, TableRef,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use uuid::Uuid;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

const JOB_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "corp-provision")]
#[command(about = "Tenant database provisioning and cross-server table sync")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision a tenant database from a template database
    Provision {
        /// Server holding the template database (id or name)
        #[arg(long)]
        source_server: String,

        /// Template database to clone
        #[arg(long)]
        source_db: String,

        /// Server to create the tenant database on (id or name)
        #[arg(long)]
        target_server: String,

        /// Tenant code (3-20 letters, digits or underscores)
        #[arg(long)]
        tenant_code: String,

        /// Tenant display name
        #[arg(long)]
        tenant_name: String,

        /// Tenant tax id
        #[arg(long)]
        tax_id: Option<String>,

        /// Use this CREATE DATABASE script instead of the generated one
        #[arg(long)]
        script: Option<PathBuf>,

        /// Include the generated password and connection string in the output
        #[arg(long)]
        show_credentials: bool,
    },

    /// Copy tables from one database to another
    Sync {
        /// Source server (id or name)
        #[arg(long)]
        source_server: String,

        #[arg(long)]
        source_db: String,

        /// Target server (id or name)
        #[arg(long)]
        target_server: String,

        #[arg(long)]
        target_db: String,

        /// Tables to copy, in order (schema.table or table)
        #[arg(long, value_delimiter = ',', required = true)]
        tables: Vec<String>,

        /// Copy through this linked server on the target instead of bcp
        #[arg(long)]
        link: Option<String>,

        /// Keep existing target rows
        #[arg(long)]
        no_truncate: bool,

        /// Let the target generate identity values
        #[arg(long)]
        no_keep_identity: bool,
    },

    /// Copy one table into a tenant database, rewriting the tenant code column
    InitTable {
        /// Source server (id or name)
        #[arg(long)]
        source_server: String,

        #[arg(long)]
        source_db: String,

        /// Target server (id or name)
        #[arg(long)]
        target_server: String,

        #[arg(long)]
        target_db: String,

        /// Table to copy (schema.table or table)
        #[arg(long)]
        table: String,

        /// Tenant code stored in the source rows
        #[arg(long)]
        source_code: String,

        /// Tenant code to write into the target rows
        #[arg(long)]
        target_code: String,

        /// Tenant code column (detected when omitted)
        #[arg(long)]
        code_column: Option<String>,

        /// Copy the code column unchanged
        #[arg(long)]
        no_replace: bool,

        /// Keep existing target rows
        #[arg(long)]
        no_truncate: bool,

        /// Copy identity values as-is
        #[arg(long)]
        keep_identity: bool,
    },

    /// Delete one tenant's rows from a table, or empty it
    DeleteTableData {
        /// Server (id or name)
        #[arg(long)]
        server: String,

        #[arg(long)]
        database: String,

        /// Table (schema.table or table)
        #[arg(long)]
        table: String,

        /// Only rows with this tenant code; the whole table otherwise
        #[arg(long)]
        tenant_code: Option<String>,

        /// Tenant code column (detected when omitted)
        #[arg(long, requires = "tenant_code")]
        code_column: Option<String>,
    },

    /// Apply the standard database option set to an existing database
    Configure {
        /// Server (id or name)
        #[arg(long)]
        server: String,

        #[arg(long)]
        database: String,
    },

    /// Print the CREATE DATABASE script for a tenant
    RenderScript {
        #[arg(long)]
        tenant_code: String,

        #[arg(long)]
        tenant_name: Option<String>,

        /// Template database named in the script header
        #[arg(long)]
        source_db: Option<String>,

        /// Take data and log directories from this server (id or name)
        #[arg(long)]
        server: Option<String>,
    },

    /// Test server connections and report health
    HealthCheck {
        /// Only this server (id or name); all servers otherwise
        #[arg(long)]
        server: Option<String>,

        /// Also check this database
        #[arg(long, requires = "server")]
        database: Option<String>,
    },

    /// List linked servers registered on a server
    LinkedServers {
        /// Server (id or name)
        #[arg(long)]
        server: String,

        /// Test this link
        #[arg(long)]
        test: Option<String>,

        /// List databases visible through this link
        #[arg(long)]
        databases: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), ProvisionError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format)
        .map_err(|e| ProvisionError::Config(e.to_string()))?;

    let config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    match cli.command {
        Commands::Provision {
            source_server,
            source_db,
            target_server,
            tenant_code,
            tenant_name,
            tax_id,
            script,
            show_credentials,
        } => {
            let request = ProvisioningRequest {
                source_server_id: config.server(&source_server)?.id,
                source_db,
                target_server_id: config.server(&target_server)?.id,
                tenant_code,
                tenant_name,
                tax_id,
            };
            let script = match script {
                Some(path) => Some(std::fs::read_to_string(path)?),
                None => None,
            };

            let provisioner = Provisioner::new(
                Arc::new(config.catalog()),
                config.provisioning.clone(),
                config.connection,
            );
            let (handle, mut steps) = provisioner.spawn(request, script);
            while let Some(step) = steps.recv().await {
                eprintln!("  [{:?}] {} {}", step.status, step.name, step.message);
            }
            let result = handle
                .await
                .map_err(|e| ProvisionError::execution("provision task", e))??;

            if cli.output_json {
                println!("{}", result.to_json(show_credentials)?);
            } else {
                println!(
                    "\nProvisioning {}!",
                    if result.success { "completed" } else { "failed" }
                );
                println!("  Database: {}", result.db_name);
                println!("  Login: {}", result.login_name);
                println!("  Server: {},{}", result.host, result.port);
                println!("  Tables: {}", result.tables.len());
                println!("  Duration: {:.2}s", result.elapsed_seconds);
                if show_credentials && result.success {
                    println!("  Connection string: {}", result.connection_string);
                }
                for warning in &result.warnings {
                    println!("  Warning: {}", warning);
                }
                if let Some(ref err) = result.error {
                    println!("  Error: {}", err);
                }
            }

            if !result.success {
                return Err(ProvisionError::execution(
                    "provision",
                    result.error.unwrap_or_else(|| "provisioning failed".into()),
                ));
            }
        }

        Commands::Sync {
            source_server,
            source_db,
            target_server,
            target_db,
            tables,
            link,
            no_truncate,
            no_keep_identity,
        } => {
            let request = SyncRequest {
                source: Endpoint::new(config.server(&source_server)?.clone(), source_db),
                target: Endpoint::new(config.server(&target_server)?.clone(), target_db),
                tables: tables
                    .iter()
                    .map(|t| TableRef::parse(t))
                    .collect::<Result<Vec<_>, _>>()?,
                options: SyncOptions {
                    strategy: match link {
                        Some(link_name) => SyncStrategy::Linked { link_name },
                        None => SyncStrategy::BulkPipeline,
                    },
                    truncate_before: !no_truncate,
                    keep_identity: !no_keep_identity,
                },
            };

            let cancel_token = setup_signal_handler().await?;
            let engine = SyncEngine::new(config.sync.clone(), config.connection, JobRegistry::new());
            let id = engine.start(request)?;
            info!("Started sync job {}", id);
            let job = wait_for_job(&engine, id, &cancel_token).await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&job)?);
            } else {
                print_job(&job);
            }

            match job.status {
                JobStatus::Completed => {}
                JobStatus::Cancelled => return Err(ProvisionError::Cancelled),
                _ => {
                    return Err(ProvisionError::execution(
                        "sync",
                        job.error.clone().unwrap_or_else(|| {
                            format!("{} table(s) did not sync", job.total_tables - job.success_count())
                        }),
                    ))
                }
            }
        }

        Commands::InitTable {
            source_server,
            source_db,
            target_server,
            target_db,
            table,
            source_code,
            target_code,
            code_column,
            no_replace,
            no_truncate,
            keep_identity,
        } => {
            let mut request = TableInitRequest::new(
                Endpoint::new(config.server(&source_server)?.clone(), source_db),
                Endpoint::new(config.server(&target_server)?.clone(), target_db),
                TableRef::parse(&table)?,
                source_code,
                target_code,
            );
            request.code_column = code_column;
            request.replace_code = !no_replace;
            request.truncate_before = !no_truncate;
            request.keep_identity = keep_identity;

            let initializer = TableInitializer::new(config.sync.clone(), config.connection);
            let result = initializer.init_table(&request).await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!(
                    "{} {} -> {}: {} row(s) copied, {} rewritten ({:.2}s)",
                    result.table,
                    result.source_db,
                    result.target_db,
                    result.rows_copied,
                    result.rows_replaced,
                    result.elapsed_seconds
                );
                if let Some(ref column) = result.code_column {
                    println!("  Code column: {}", column);
                }
                if let Some(ref err) = result.error {
                    println!("  Error: {}", err);
                }
            }

            if !result.success {
                return Err(ProvisionError::execution(
                    "init-table",
                    result.error.unwrap_or_else(|| "initialization failed".into()),
                ));
            }
        }

        Commands::DeleteTableData {
            server,
            database,
            table,
            tenant_code,
            code_column,
        } => {
            let request = TableDeleteRequest {
                target: Endpoint::new(config.server(&server)?.clone(), database),
                table: TableRef::parse(&table)?,
                tenant_code,
                code_column,
            };

            let initializer = TableInitializer::new(config.sync.clone(), config.connection);
            let result = initializer.delete_table_data(&request).await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!(
                    "{} in {}: {} row(s) deleted ({:.2}s)",
                    result.table, result.target_db, result.rows_deleted, result.elapsed_seconds
                );
                if let Some(ref err) = result.error {
                    println!("  Error: {}", err);
                }
            }

            if !result.success {
                return Err(ProvisionError::execution(
                    "delete-table-data",
                    result.error.unwrap_or_else(|| "delete failed".into()),
                ));
            }
        }

        Commands::Configure { server, database } => {
            let driver = connect_driver(config.server(&server)?, &config.connection)?;
            let result = configure_database(driver.as_ref(), &database).await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!(
                    "Configured {} ({} statement(s) refused)",
                    result.db_name, result.failed_statements
                );
                for warning in &result.warnings {
                    println!("  Warning: {}", warning);
                }
                if let Some(ref v) = result.verification {
                    println!("  Recovery model: {}", v.recovery_model);
                    println!("  Page verify: {}", v.page_verify);
                    println!("  Query store: {}", v.query_store);
                    println!("  Broker enabled: {}", v.broker_enabled);
                }
            }
        }

        Commands::RenderScript {
            tenant_code,
            tenant_name,
            source_db,
            server,
        } => {
            let db_name = format!("{}{}", config.provisioning.db_prefix, tenant_code);
            let mut params = CreateDatabaseParams::from_config(db_name, &config.provisioning);
            if let Some(key) = server {
                let server = config.server(&key)?;
                params = params.with_paths(server.data_path.as_deref(), server.log_path.as_deref());
            }
            if let Some(name) = tenant_name {
                params = params.with_tenant(tenant_code, name, source_db.unwrap_or_default());
            }
            println!("{}", generate_create_database_sql(&params));
        }

        Commands::HealthCheck { server, database } => {
            let servers = match server {
                Some(ref key) => vec![config.server(key)?.clone()],
                None => config.servers.clone(),
            };

            let mut healthy = true;
            let mut reports = Vec::new();
            for record in &servers {
                let driver = connect_driver(record, &config.connection)?;
                let health = driver.check_server_health().await;
                healthy &= health.report.status != HealthStatus::Error;
                if !cli.output_json {
                    println!(
                        "{} ({}): {:?}",
                        health.server_name,
                        record.address(),
                        health.report.status
                    );
                    for check in &health.report.checks {
                        println!("  {:<16} {:?} {}", check.name, check.status, check.value);
                    }
                    for issue in &health.report.issues {
                        println!("  Issue: {}", issue);
                    }
                }
                reports.push(serde_json::to_value(&health)?);

                if let Some(ref db) = database {
                    let db_health = driver.check_database_health(db).await;
                    healthy &= db_health.report.status != HealthStatus::Error;
                    if !cli.output_json {
                        println!("  Database {}: {:?}", db_health.db_name, db_health.report.status);
                        for issue in &db_health.report.issues {
                            println!("    Issue: {}", issue);
                        }
                    }
                    reports.push(serde_json::to_value(&db_health)?);
                }
            }

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            } else {
                println!("\n  Overall: {}", if healthy { "HEALTHY" } else { "UNHEALTHY" });
            }

            if !healthy {
                return Err(ProvisionError::connection("health check failed", "health-check"));
            }
        }

        Commands::LinkedServers {
            server,
            test,
            databases,
        } => {
            let driver = connect_driver(config.server(&server)?, &config.connection)?;

            if let Some(name) = test {
                test_linked_server(driver.as_ref(), &name).await?;
                println!("Linked server {}: OK", name);
            } else if let Some(name) = databases {
                let names = list_linked_databases(driver.as_ref(), &name).await?;
                if cli.output_json {
                    println!("{}", serde_json::to_string_pretty(&names)?);
                } else {
                    for db in names {
                        println!("{}", db);
                    }
                }
            } else {
                let links = list_linked_servers(driver.as_ref()).await?;
                if cli.output_json {
                    println!("{}", serde_json::to_string_pretty(&links)?);
                } else {
                    for link in &links {
                        println!("{:<24} {:<32} {}", link.name, link.data_source, link.provider);
                    }
                }
            }
        }
    }

    Ok(())
}

/// Poll a sync job until it finishes, forwarding a shutdown signal as a
/// cancellation request.
async fn wait_for_job(
    engine: &SyncEngine,
    id: Uuid,
    cancel_token: &CancellationToken,
) -> Result<SyncJob, ProvisionError> {
    let mut last_table = None;
    let mut cancel_sent = false;
    loop {
        let job = engine
            .snapshot(id)
            .ok_or_else(|| ProvisionError::not_found(format!("sync job {}", id)))?;
        if job.status.is_terminal() {
            return Ok(job);
        }
        if job.current_table != last_table {
            if let Some(ref table) = job.current_table {
                eprintln!(
                    "  [{:>3}%] {} ({}/{})",
                    job.progress_percent(),
                    table,
                    job.completed_tables + 1,
                    job.total_tables
                );
            }
            last_table = job.current_table;
        }

        tokio::select! {
            _ = cancel_token.cancelled(), if !cancel_sent => {
                cancel_sent = true;
                engine.cancel(id);
            }
            _ = tokio::time::sleep(JOB_POLL_INTERVAL) => {}
        }
    }
}

fn print_job(job: &SyncJob) {
    println!("\nSync job {:?}", job.status);
    println!("  Job ID: {}", job.job_id);
    println!("  {} -> {}", job.source, job.target);
    println!(
        "  Tables: {}/{} ok",
        job.success_count(),
        job.total_tables
    );
    for result in &job.results {
        println!(
            "  {:<8} {}.{} ({} / {}) {:.2}s{}",
            result.status.to_string(),
            result.schema,
            result.table,
            result.source_row_count.map_or("-".into(), |n| n.to_string()),
            result.target_row_count.map_or("-".into(), |n| n.to_string()),
            result.elapsed_seconds,
            result
                .error
                .as_deref()
                .map(|e| format!(": {}", e))
                .unwrap_or_default()
        );
    }
    for warning in &job.warnings {
        println!("  Warning: {}", warning);
    }
    if let Some(ref err) = job.error {
        println!("  Error: {}", err);
    }
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // stdout carries results and rendered scripts
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Setup signal handlers that cancel a running sync job.
/// Handles both SIGINT (Ctrl-C) and SIGTERM.
#[cfg(unix)]
async fn setup_signal_handler() -> Result<CancellationToken, ProvisionError> {
    let cancel_token = CancellationToken::new();

    let token_int = cancel_token.clone();
    let token_term = cancel_token.clone();
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::spawn(async move {
        sigint.recv().await;
        eprintln!("\nReceived SIGINT. Stopping after the current table...");
        token_int.cancel();
    });

    tokio::spawn(async move {
        sigterm.recv().await;
        eprintln!("\nReceived SIGTERM. Stopping after the current table...");
        token_term.cancel();
    });

    Ok(cancel_token)
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
async fn setup_signal_handler() -> Result<CancellationToken, ProvisionError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Stopping after the current table...");
            token.cancel();
        }
    });

    Ok(cancel_token)
}
