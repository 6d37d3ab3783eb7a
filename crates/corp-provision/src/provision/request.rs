//! Provisioning request and its validation.

use crate::core::identifier::validate_identifier;
use crate::error::{ProvisionError, Result};
use serde::{Deserialize, Serialize};

const TENANT_CODE_MIN: usize = 3;
const TENANT_CODE_MAX: usize = 20;

/// A request to provision one tenant database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningRequest {
    pub source_server_id: i64,
    /// Template database cloned into the new database.
    pub source_db: String,
    pub target_server_id: i64,
    pub tenant_code: String,
    pub tenant_name: String,
    #[serde(default)]
    pub tax_id: Option<String>,
}

impl ProvisioningRequest {
    /// Validate the request shape. Uniqueness of the tenant code is
    /// checked separately against the catalog.
    pub fn validate(&self) -> Result<()> {
        let code = self.tenant_code.as_str();
        if code.is_empty() {
            return Err(ProvisionError::Validation("tenant code is required".into()));
        }
        let len = code.chars().count();
        if !(TENANT_CODE_MIN..=TENANT_CODE_MAX).contains(&len) {
            return Err(ProvisionError::Validation(format!(
                "tenant code must be {} to {} characters: {}",
                TENANT_CODE_MIN, TENANT_CODE_MAX, code
            )));
        }
        if !code.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(ProvisionError::Validation(format!(
                "tenant code may only contain letters, digits and '_': {}",
                code
            )));
        }
        if self.tenant_name.trim().is_empty() {
            return Err(ProvisionError::Validation("tenant name is required".into()));
        }
        validate_identifier(&self.source_db)?;
        Ok(())
    }

    pub fn same_server(&self) -> bool {
        self.source_server_id == self.target_server_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(code: &str) -> ProvisioningRequest {
        ProvisioningRequest {
            source_server_id: 1,
            source_db: "TEMPLATE".into(),
            target_server_id: 2,
            tenant_code: code.into(),
            tenant_name: "Acme Corp".into(),
            tax_id: None,
        }
    }

    #[test]
    fn test_valid_codes() {
        for code in ["ACME01", "abc", "A_B_C", "X".repeat(20).as_str()] {
            assert!(request(code).validate().is_ok(), "{} should be valid", code);
        }
    }

    #[test]
    fn test_invalid_codes() {
        for code in ["", "AB", "ACME-01", "ACME 01", "ACME;DROP", "X".repeat(21).as_str()] {
            let err = request(code).validate().unwrap_err();
            assert!(matches!(err, ProvisionError::Validation(_)), "{:?}", code);
        }
    }

    #[test]
    fn test_name_and_source_required() {
        let mut r = request("ACME01");
        r.tenant_name = "  ".into();
        assert!(r.validate().is_err());

        let mut r = request("ACME01");
        r.source_db = String::new();
        assert!(r.validate().is_err());
    }

    #[test]
    fn test_same_server() {
        let mut r = request("ACME01");
        assert!(!r.same_server());
        r.target_server_id = 1;
        assert!(r.same_server());
    }
}
