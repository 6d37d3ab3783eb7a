//! CLI integration tests for corp-provision.
//!
//! These tests verify command-line argument parsing, help output,
//! exit codes for configuration errors, and commands that need no
//! database connection.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

/// Get a command for the corp-provision binary.
fn cmd() -> Command {
    Command::cargo_bin("corp-provision").unwrap()
}

/// Write a minimal valid configuration to a temp file.
fn config_file(extra: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"servers:
  - id: 1
    name: prod
    host: 10.0.0.5
    username: sa
    password: secret
  - id: 2
    name: linux
    host: 10.0.0.6
    username: sa
    password: secret
    data_path: /var/opt/mssql/data/
    log_path: /var/opt/mssql/log
{}"#,
        extra
    )
    .unwrap();
    file
}

// =============================================================================
// Help and Version Tests
// =============================================================================

#[test]
fn test_help_shows_all_commands() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("provision"))
        .stdout(predicate::str::contains("sync"))
        .stdout(predicate::str::contains("configure"))
        .stdout(predicate::str::contains("render-script"))
        .stdout(predicate::str::contains("health-check"))
        .stdout(predicate::str::contains("linked-servers"))
        .stdout(predicate::str::contains("init-table"))
        .stdout(predicate::str::contains("delete-table-data"));
}

#[test]
fn test_init_table_subcommand_help() {
    cmd()
        .args(["init-table", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--source-code"))
        .stdout(predicate::str::contains("--target-code"))
        .stdout(predicate::str::contains("--code-column"))
        .stdout(predicate::str::contains("--no-replace"))
        .stdout(predicate::str::contains("--keep-identity"));
}

#[test]
fn test_delete_code_column_requires_tenant_code() {
    cmd()
        .args([
            "delete-table-data",
            "--server",
            "linux",
            "--database",
            "ACC_C0042",
            "--table",
            "TB_ACCT_CD",
            "--code-column",
            "CORP_CD",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--tenant-code"));
}

#[test]
fn test_provision_subcommand_help() {
    cmd()
        .args(["provision", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--tenant-code"))
        .stdout(predicate::str::contains("--source-db"))
        .stdout(predicate::str::contains("--script"))
        .stdout(predicate::str::contains("--show-credentials"));
}

#[test]
fn test_sync_subcommand_help() {
    cmd()
        .args(["sync", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--tables"))
        .stdout(predicate::str::contains("--link"))
        .stdout(predicate::str::contains("--no-truncate"))
        .stdout(predicate::str::contains("--no-keep-identity"));
}

#[test]
fn test_version_flag() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("corp-provision"));
}

// =============================================================================
// Global Flags Tests
// =============================================================================

#[test]
fn test_global_flags_and_defaults() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--output-json"))
        .stdout(predicate::str::contains("--log-format"))
        .stdout(predicate::str::contains("[default: text]"))
        .stdout(predicate::str::contains("--verbosity"))
        .stdout(predicate::str::contains("[default: info]"))
        .stdout(predicate::str::contains("[default: config.yaml]"));
}

#[test]
fn test_short_config_flag() {
    cmd()
        .args(["-c", "some_config.yaml", "--help"])
        .assert()
        .success();
}

#[test]
fn test_no_subcommand_shows_help() {
    cmd()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage:"));
}

#[test]
fn test_sync_requires_tables() {
    cmd()
        .args([
            "sync",
            "--source-server",
            "prod",
            "--source-db",
            "ERP",
            "--target-server",
            "linux",
            "--target-db",
            "ERP_DEV",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--tables"));
}

// =============================================================================
// Exit Code Tests - Config Errors
// =============================================================================

#[test]
fn test_missing_config_exits_with_code_7() {
    // Missing file is an IO error (code 7), not config error (code 1)
    cmd()
        .args(["--config", "nonexistent_config_file.yaml", "health-check"])
        .assert()
        .code(7);
}

#[test]
fn test_invalid_yaml_exits_with_code_1() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "invalid: yaml: content: [").unwrap();

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "health-check"])
        .assert()
        .code(1);
}

#[test]
fn test_empty_config_exits_with_code_1() {
    let file = tempfile::NamedTempFile::new().unwrap();

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "health-check"])
        .assert()
        .code(1);
}

#[test]
fn test_no_servers_exits_with_code_1() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "servers: []").unwrap();

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "health-check"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("servers"));
}

#[test]
fn test_zero_timeout_exits_with_code_1() {
    let file = config_file("connection:\n  login_timeout_secs: 0\n");

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "health-check"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("connection timeouts"));
}

#[test]
fn test_unknown_server_exits_with_code_1() {
    let file = config_file("");

    cmd()
        .args([
            "--config",
            file.path().to_str().unwrap(),
            "configure",
            "--server",
            "staging",
            "--database",
            "ACC_C0042",
        ])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("staging"));
}

#[test]
fn test_init_table_empty_table_exits_with_code_3() {
    let file = config_file("");

    cmd()
        .args([
            "--config",
            file.path().to_str().unwrap(),
            "init-table",
            "--source-server",
            "prod",
            "--source-db",
            "ACC_TEMPLATE",
            "--target-server",
            "linux",
            "--target-db",
            "ACC_C0042",
            "--table",
            "dbo.",
            "--source-code",
            "C0001",
            "--target-code",
            "C0042",
        ])
        .assert()
        .code(3);
}

#[test]
fn test_empty_table_name_exits_with_code_3() {
    let file = config_file("");

    cmd()
        .args([
            "--config",
            file.path().to_str().unwrap(),
            "sync",
            "--source-server",
            "prod",
            "--source-db",
            "ERP",
            "--target-server",
            "linux",
            "--target-db",
            "ERP_DEV",
            "--tables",
            "dbo.TB_DEPT,dbo.",
        ])
        .assert()
        .code(3);
}

// =============================================================================
// render-script
// =============================================================================

#[test]
fn test_render_script_uses_prefix_and_config_paths() {
    let file = config_file("provisioning:\n  db_prefix: ACC_\n");

    cmd()
        .args([
            "--config",
            file.path().to_str().unwrap(),
            "render-script",
            "--tenant-code",
            "C0042",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("CREATE DATABASE [ACC_C0042]"))
        .stdout(predicate::str::contains(r"FILENAME   = N'C:\Data\ACC_C0042.mdf'"))
        .stdout(predicate::str::contains(r"FILENAME   = N'C:\Log\ACC_C0042_log.ldf'"))
        .stdout(predicate::str::contains("COLLATE Korean_Wansung_CI_AS;"))
        .stdout(predicate::str::contains("GO"));
}

#[test]
fn test_render_script_uses_server_paths() {
    let file = config_file("");

    cmd()
        .args([
            "--config",
            file.path().to_str().unwrap(),
            "render-script",
            "--tenant-code",
            "C0042",
            "--tenant-name",
            "Acme Trading",
            "--source-db",
            "ACC_TEMPLATE",
            "--server",
            "linux",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("CREATE DATABASE [C0042]"))
        .stdout(predicate::str::contains("/var/opt/mssql/data/C0042.mdf"))
        .stdout(predicate::str::contains("/var/opt/mssql/log/C0042_log.ldf"))
        .stdout(predicate::str::contains("Tenant name    : Acme Trading"))
        .stdout(predicate::str::contains("Source db      : ACC_TEMPLATE"));
}

#[test]
fn test_render_script_keeps_logs_off_stdout() {
    let file = config_file("");

    cmd()
        .args([
            "--config",
            file.path().to_str().unwrap(),
            "--verbosity",
            "debug",
            "render-script",
            "--tenant-code",
            "C0042",
        ])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("-- "))
        .stderr(predicate::str::contains("Loaded configuration"));
}
