//! Configuration validation.

use super::Config;
use crate::error::{ProvisionError, Result};
use std::collections::HashSet;

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Servers
    if config.servers.is_empty() {
        return Err(ProvisionError::Config(
            "at least one entry in servers is required".into(),
        ));
    }
    let mut ids = HashSet::new();
    for (idx, server) in config.servers.iter().enumerate() {
        if server.host.is_empty() {
            return Err(ProvisionError::Config(format!(
                "servers[{}].host is required",
                idx
            )));
        }
        if server.username.is_empty() {
            return Err(ProvisionError::Config(format!(
                "servers[{}].username is required",
                idx
            )));
        }
        if !ids.insert(server.id) {
            return Err(ProvisionError::Config(format!(
                "servers[{}].id {} is used more than once",
                idx, server.id
            )));
        }
    }

    // Provisioning
    let prov = &config.provisioning;
    if prov.initial_size_mb == 0 || prov.log_size_mb == 0 {
        return Err(ProvisionError::Config(
            "provisioning.initial_size_mb and provisioning.log_size_mb must be at least 1".into(),
        ));
    }
    if prov.file_growth_mb == 0 || prov.log_growth_mb == 0 {
        return Err(ProvisionError::Config(
            "provisioning.file_growth_mb and provisioning.log_growth_mb must be at least 1".into(),
        ));
    }
    if prov.collation.trim().is_empty() {
        return Err(ProvisionError::Config(
            "provisioning.collation is required".into(),
        ));
    }
    if prov.readiness_timeout_secs == 0 {
        return Err(ProvisionError::Config(
            "provisioning.readiness_timeout_secs must be at least 1".into(),
        ));
    }
    if prov.readiness_poll_ms == 0 {
        return Err(ProvisionError::Config(
            "provisioning.readiness_poll_ms must be at least 1".into(),
        ));
    }
    if prov.password_length < 12 {
        return Err(ProvisionError::Config(format!(
            "provisioning.password_length must be at least 12, got {}",
            prov.password_length
        )));
    }
    if prov.db_prefix.contains(['[', ']', '\'', '\0']) {
        return Err(ProvisionError::Config(
            "provisioning.db_prefix contains characters not allowed in database names".into(),
        ));
    }
    let mut seen = HashSet::new();
    for table in prov.clone.all_tables() {
        if table.trim().is_empty() {
            return Err(ProvisionError::Config(
                "provisioning.clone contains an empty table name".into(),
            ));
        }
        if !seen.insert(table.to_uppercase()) {
            return Err(ProvisionError::Config(format!(
                "provisioning.clone lists table {} more than once",
                table
            )));
        }
    }

    // Connection
    if config.connection.login_timeout_secs == 0 || config.connection.command_timeout_secs == 0 {
        return Err(ProvisionError::Config(
            "connection timeouts must be at least 1 second".into(),
        ));
    }

    // Sync
    if config.sync.bcp_batch_size == 0 {
        return Err(ProvisionError::Config(
            "sync.bcp_batch_size must be at least 1".into(),
        ));
    }
    if config.sync.fallback_batch_size == 0 {
        return Err(ProvisionError::Config(
            "sync.fallback_batch_size must be at least 1".into(),
        ));
    }
    if config.sync.bcp_timeout_secs == 0 {
        return Err(ProvisionError::Config(
            "sync.bcp_timeout_secs must be at least 1".into(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ServerRecord;
    use crate::config::{ConnectionConfig, ProvisioningConfig, SyncConfig};

    fn valid_config() -> Config {
        Config {
            servers: vec![
                ServerRecord::mssql(1, "prod-sql", "sa", "password"),
                ServerRecord::mssql(2, "dev-sql", "sa", "password"),
            ],
            provisioning: ProvisioningConfig::default(),
            connection: ConnectionConfig::default(),
            sync: SyncConfig::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        let config = valid_config();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_no_servers() {
        let mut config = valid_config();
        config.servers.clear();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_missing_server_host() {
        let mut config = valid_config();
        config.servers[0].host = "".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_duplicate_server_id() {
        let mut config = valid_config();
        config.servers[1].id = 1;
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_zero_sizes_rejected() {
        let mut config = valid_config();
        config.provisioning.initial_size_mb = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_short_password_rejected() {
        let mut config = valid_config();
        config.provisioning.password_length = 8;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_empty_with_data_list_is_allowed() {
        let mut config = valid_config();
        config.provisioning.clone.with_data.clear();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_table_listed_twice_rejected() {
        let mut config = valid_config();
        config.provisioning.clone.schema_only.push("tb_dept".to_string());
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        let mut config = valid_config();
        config.connection.login_timeout_secs = 0;
        assert!(validate(&config).is_err());

        let mut config = valid_config();
        config.sync.bcp_timeout_secs = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_from_yaml_applies_defaults() {
        let yaml = r#"
servers:
  - id: 1
    name: prod
    host: 10.0.0.5
    username: sa
    password: secret
provisioning:
  db_prefix: "ACC_"
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.provisioning.db_prefix, "ACC_");
        assert_eq!(config.provisioning.collation, "Korean_Wansung_CI_AS");
        assert_eq!(config.provisioning.clone.with_data.len(), 8);
        assert_eq!(config.connection.login_timeout_secs, 10);
        assert_eq!(config.sync.fallback_batch_size, 5000);
        assert_eq!(config.server("prod").unwrap().id, 1);
        assert_eq!(config.server("1").unwrap().name, "prod");
        assert!(config.server("dev").is_err());
    }

    #[test]
    fn test_admin_debug_redacts_password() {
        let config = valid_config();
        let debug_output = format!("{:?}", config.provisioning.admin_account);
        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("Admin@1234"));
    }
}
