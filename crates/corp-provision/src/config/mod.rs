//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::catalog::{MemoryCatalog, ServerRecord};
use crate::error::{ProvisionError, Result};
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// Look up a configured server by id or name.
    pub fn server(&self, key: &str) -> Result<&ServerRecord> {
        let by_id = key.parse::<i64>().ok();
        self.servers
            .iter()
            .find(|s| Some(s.id) == by_id || s.name.eq_ignore_ascii_case(key))
            .ok_or_else(|| ProvisionError::Config(format!("no server named or numbered '{}'", key)))
    }

    /// Build an in-memory catalog holding the configured servers.
    pub fn catalog(&self) -> MemoryCatalog {
        MemoryCatalog::with_servers(self.servers.iter().cloned())
    }
}
