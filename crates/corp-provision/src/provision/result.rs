//! Provisioning outcome.

use super::steps::{ProvisioningStep, StepName};
use crate::error::Result;
use crate::template::Verification;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A non-critical failure, tagged with the step it happened in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Warning {
    pub step: StepName,
    pub message: String,
}

impl Warning {
    pub fn new(step: StepName, message: impl Into<String>) -> Self {
        Self {
            step,
            message: message.into(),
        }
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.step, self.message)
    }
}

/// Result of one provisioning run. Built once when the run ends.
///
/// The generated password is carried exactly once, here. It is left out of
/// serialized output unless [`ProvisioningResult::to_json`] is asked to
/// include it, and `Debug` redacts it.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProvisioningResult {
    pub success: bool,
    pub tenant_code: String,
    pub db_name: String,
    pub login_name: String,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    pub server_id: i64,
    pub host: String,
    pub port: u16,
    /// Empty unless the run succeeded.
    #[serde(default, skip_serializing)]
    pub connection_string: String,
    pub elapsed_seconds: f64,
    pub warnings: Vec<Warning>,
    /// First critical error, when the run failed.
    pub error: Option<String>,
    pub steps: Vec<ProvisioningStep>,
    /// Database options read back after configuration.
    pub verification: Option<Verification>,
    /// Tables created from the template.
    pub tables: Vec<String>,
}

impl ProvisioningResult {
    /// Serialize as pretty JSON, optionally including the credentials.
    pub fn to_json(&self, include_credentials: bool) -> Result<String> {
        let mut value = serde_json::to_value(self)?;
        if include_credentials {
            if let Some(obj) = value.as_object_mut() {
                obj.insert(
                    "password".into(),
                    serde_json::to_value(&self.password)?,
                );
                obj.insert(
                    "connection_string".into(),
                    serde_json::Value::String(self.connection_string.clone()),
                );
            }
        }
        Ok(serde_json::to_string_pretty(&value)?)
    }
}

impl fmt::Debug for ProvisioningResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisioningResult")
            .field("success", &self.success)
            .field("tenant_code", &self.tenant_code)
            .field("db_name", &self.db_name)
            .field("login_name", &self.login_name)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("server_id", &self.server_id)
            .field("elapsed_seconds", &self.elapsed_seconds)
            .field("warnings", &self.warnings)
            .field("error", &self.error)
            .field("steps", &self.steps.len())
            .finish()
    }
}

/// `Server=host,port;Database=db;User Id=login;Password=...;`
pub fn connection_string(host: &str, port: u16, db: &str, login: &str, password: &str) -> String {
    format!(
        "Server={},{};Database={};User Id={};Password={};",
        host, port, db, login, password
    )
}
