// src/error.rs
use thiserror::Error;

/// Failure taxonomy shared by every ledger operation.
///
/// Only [`LedgerError::Transient`] is safe to retry blindly, and the retry
/// must reuse the original idempotency key.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Insufficient funds")]
    InsufficientFunds,

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Storage temporarily unavailable: {0}")]
    Transient(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, LedgerError>;

impl LedgerError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Text safe to hand back to an end user. Storage and invariant failures
    /// never expose amounts or internals.
    pub fn public_message(&self) -> String {
        match self {
            Self::NotFound(_) => "balance not found".to_string(),
            Self::InvalidInput(msg) => msg.clone(),
            Self::InsufficientFunds => "insufficient funds".to_string(),
            Self::Conflict(msg) => msg.clone(),
            Self::Transient(_) | Self::Internal(_) => {
                "request could not be processed, please try again later".to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_is_retryable() {
        assert!(LedgerError::Transient("pool timed out".into()).is_retryable());
        assert!(!LedgerError::InsufficientFunds.is_retryable());
        assert!(!LedgerError::Conflict("key reused".into()).is_retryable());
        assert!(!LedgerError::Internal("drift".into()).is_retryable());
    }

    #[test]
    fn public_message_hides_internals() {
        let err = LedgerError::Internal("subunits 3001 != floor(30.00 * 100)".into());
        assert!(!err.public_message().contains("3001"));

        let err = LedgerError::Transient("connection reset".into());
        assert!(!err.public_message().contains("connection"));

        let err = LedgerError::invalid("delta must not be zero");
        assert_eq!(err.public_message(), "delta must not be zero");
    }
}
