//! Protolab Error - Unified Error Types
//!
//! Error handling for everything that surrounds the simulation engines:
//! configuration loading, scenario parsing and command-line I/O. The engines
//! themselves never fail; protocol-level failures are recorded as events.
//!
//! Key Features:
//! - Domain-specific error variants for precise reporting
//! - User vs system error classification
//! - Seamless integration with std::io::Error and serde_json::Error
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use thiserror::Error;

// =============================================================================
// Error Types
// =============================================================================

/// Unified error type for all Protolab operations outside the engines.
#[derive(Error, Debug)]
pub enum ProtolabError {
    // Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    // Scenario errors
    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),

    #[error("scenario error: {0}")]
    Scenario(String),

    #[error("malformed instruction at step {step}: {reason}")]
    Instruction { step: usize, reason: String },

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("serialization error: {0}")]
    Serialization(String),

    // Internal errors
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for ProtolabError {
    fn from(err: serde_json::Error) -> Self {
        ProtolabError::Serialization(err.to_string())
    }
}

// =============================================================================
// Type Aliases
// =============================================================================

/// Result type alias for Protolab operations.
pub type Result<T> = std::result::Result<T, ProtolabError>;

// =============================================================================
// Error Classification
// =============================================================================

impl ProtolabError {
    /// Returns true if this is a user error (vs system error).
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            ProtolabError::Configuration(_)
                | ProtolabError::InvalidValue { .. }
                | ProtolabError::UnknownProtocol(_)
                | ProtolabError::Scenario(_)
                | ProtolabError::Instruction { .. }
        )
    }

    /// Returns true if the error came from reading a scenario script.
    pub fn is_scenario_error(&self) -> bool {
        matches!(
            self,
            ProtolabError::Scenario(_) | ProtolabError::Instruction { .. }
        )
    }

    /// Process exit code the command-line runner reports for this error.
    pub fn exit_code(&self) -> i32 {
        if self.is_user_error() {
            2
        } else {
            1
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let err = ProtolabError::Instruction {
            step: 3,
            reason: "missing field".to_string(),
        };
        assert!(err.is_user_error());
        assert!(err.is_scenario_error());
        assert_eq!(err.exit_code(), 2);
        assert_eq!(err.to_string(), "malformed instruction at step 3: missing field");

        let io: ProtolabError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(!io.is_user_error());
        assert_eq!(io.exit_code(), 1);
    }

    #[test]
    fn test_from_json_error() {
        let parse: std::result::Result<u32, _> = serde_json::from_str("not json");
        let err: ProtolabError = parse.unwrap_err().into();
        assert!(matches!(err, ProtolabError::Serialization(_)));
    }
}
