//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (delays > 0, bind address parseable)
//!
//! # Design Decisions
//! - Returns all validation errors, not just the first
//! - Validation is a pure function: GatewayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use crate::config::schema::GatewayConfig;

/// A single semantic validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    MissingSocketPath,
    InvalidBindAddress(String),
    ZeroBaseDelay,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::MissingSocketPath => {
                write!(f, "backend.socket_path must not be empty")
            }
            ValidationError::InvalidBindAddress(addr) => {
                write!(f, "listener.bind_address is not a valid socket address: {}", addr)
            }
            ValidationError::ZeroBaseDelay => {
                write!(f, "backend.connect.base_delay_ms must be greater than 0")
            }
        }
    }
}

/// Validate a configuration, collecting every error.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.backend.socket_path.is_empty() {
        errors.push(ValidationError::MissingSocketPath);
    }

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidBindAddress(
            config.listener.bind_address.clone(),
        ));
    }

    if config.backend.connect.base_delay_ms == 0 {
        errors.push(ValidationError::ZeroBaseDelay);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_config_passes() {
        let mut config = GatewayConfig::default();
        config.backend.socket_path = "/tmp/app.sock".into();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn all_errors_are_collected() {
        let mut config = GatewayConfig::default();
        config.listener.bind_address = "not-an-address".into();
        config.backend.connect.base_delay_ms = 0;
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors.contains(&ValidationError::MissingSocketPath));
        assert!(errors.contains(&ValidationError::ZeroBaseDelay));
    }
}
