use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while acquiring or renewing link authorization
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Invalid connection string: {0}")]
    InvalidConnectionString(String),

    #[error("Invalid shared access key: {0}")]
    InvalidKey(String),

    #[error("Token acquisition failed: {reason}")]
    TokenAcquisition { reason: String, transient: bool },

    #[error("Token acquisition timed out after {0:?}")]
    Timeout(Duration),

    #[error("Token renewal failed after {attempts} attempts: {reason}")]
    RenewalFailed { attempts: u32, reason: String },
}

impl AuthError {
    pub fn is_transient(&self) -> bool {
        match self {
            AuthError::TokenAcquisition { transient, .. } => *transient,
            AuthError::Timeout(_) => true,
            _ => false,
        }
    }
}
