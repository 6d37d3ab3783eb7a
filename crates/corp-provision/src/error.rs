//! Error types for the provisioning engine.

use thiserror::Error;

/// Exit code for configuration errors.
pub const EXIT_CONFIG_ERROR: u8 = 1;
/// Exit code for connection failures.
pub const EXIT_CONNECTION_ERROR: u8 = 2;
/// Exit code for rejected input.
pub const EXIT_VALIDATION_ERROR: u8 = 3;
/// Exit code for failed statements or external tools.
pub const EXIT_EXECUTION_ERROR: u8 = 4;
/// Exit code for a database that never came online.
pub const EXIT_READINESS_ERROR: u8 = 5;
/// Exit code for a cancelled operation.
pub const EXIT_CANCELLED: u8 = 6;
/// Exit code for file system errors.
pub const EXIT_IO_ERROR: u8 = 7;

/// Main error type for provisioning and sync operations.
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network, TLS or login failure while opening a connection
    #[error("Connection error: {message}\n  Context: {context}")]
    Connection { message: String, context: String },

    /// Referenced server, database or table does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Input rejected before any side effect
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A single SQL statement failed
    #[error("Execution failed ({context}): {message}")]
    Execution { context: String, message: String },

    /// Database did not reach ONLINE state in time
    #[error("Database {database} was not online after {waited_secs}s")]
    ReadinessTimeout { database: String, waited_secs: u64 },

    /// External bulk utility failed
    #[error("Bulk utility failed: {0}")]
    Process(String),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Operation was cancelled
    #[error("Operation cancelled")]
    Cancelled,
}

impl ProvisionError {
    /// Create a Connection error with context about where it occurred
    pub fn connection(message: impl ToString, context: impl Into<String>) -> Self {
        ProvisionError::Connection {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create an Execution error
    pub fn execution(context: impl Into<String>, message: impl ToString) -> Self {
        ProvisionError::Execution {
            context: context.into(),
            message: message.to_string(),
        }
    }

    /// Create a NotFound error
    pub fn not_found(what: impl Into<String>) -> Self {
        ProvisionError::NotFound(what.into())
    }

    /// Map a tiberius error into the engine taxonomy.
    ///
    /// Server-reported errors are statement failures, everything else
    /// (IO, TLS, routing, protocol) is treated as a connection failure.
    pub fn from_tiberius(err: tiberius::error::Error, context: impl Into<String>) -> Self {
        match err {
            tiberius::error::Error::Server(token) => ProvisionError::Execution {
                context: context.into(),
                message: format!("{} (code {})", token.message(), token.code()),
            },
            other => ProvisionError::connection(other, context),
        }
    }

    /// Map a tokio-postgres error into the engine taxonomy.
    pub fn from_postgres(err: tokio_postgres::Error, context: impl Into<String>) -> Self {
        if err.as_db_error().is_some() {
            ProvisionError::execution(context, err)
        } else {
            ProvisionError::connection(err, context)
        }
    }

    /// Whether this failure came from opening a connection.
    pub fn is_connection(&self) -> bool {
        matches!(self, ProvisionError::Connection { .. })
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            ProvisionError::Config(_) | ProvisionError::Yaml(_) | ProvisionError::Json(_) => {
                EXIT_CONFIG_ERROR
            }
            ProvisionError::Connection { .. } => EXIT_CONNECTION_ERROR,
            ProvisionError::NotFound(_) | ProvisionError::Validation(_) => EXIT_VALIDATION_ERROR,
            ProvisionError::Execution { .. } | ProvisionError::Process(_) => EXIT_EXECUTION_ERROR,
            ProvisionError::ReadinessTimeout { .. } => EXIT_READINESS_ERROR,
            ProvisionError::Cancelled => EXIT_CANCELLED,
            ProvisionError::Io(_) => EXIT_IO_ERROR,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for provisioning operations.
pub type Result<T> = std::result::Result<T, ProvisionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(ProvisionError::Config("x".into()).exit_code(), EXIT_CONFIG_ERROR);
        assert_eq!(
            ProvisionError::connection("refused", "master").exit_code(),
            EXIT_CONNECTION_ERROR
        );
        assert_eq!(ProvisionError::Cancelled.exit_code(), EXIT_CANCELLED);
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        assert_eq!(ProvisionError::from(io).exit_code(), EXIT_IO_ERROR);
    }

    #[test]
    fn test_format_detailed_includes_message() {
        let err = ProvisionError::execution("CREATE DATABASE", "permission denied");
        let text = err.format_detailed();
        assert!(text.starts_with("Error: Execution failed (CREATE DATABASE)"));
        assert!(text.contains("permission denied"));
    }

    #[test]
    fn test_is_connection() {
        assert!(ProvisionError::connection("timeout", "login").is_connection());
        assert!(!ProvisionError::not_found("db").is_connection());
    }
}
