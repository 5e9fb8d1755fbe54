//! Error types for the WAL core.
//!
//! All failures are returned, never thrown out of band. Dedup and flow
//! control outcomes (ignored, merged, pending) are *not* errors; they live in
//! [`crate::AppendOutcome`].

use thiserror::Error;

/// Result type alias for WAL operations
pub type WalResult<T> = Result<T, WalError>;

/// Error conditions surfaced by the WAL core and the replication layer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WalError {
    /// The instance, its callback table or its configuration is unusable
    #[error("instance is not initialized: {reason}")]
    Initialization { reason: String },

    /// No handler is registered for the requested operation or action case
    #[error("no callback is registered for this operation")]
    ActionNotSet,

    /// Bad argument from the caller; never retried by the core
    #[error("invalid parameter: {message}")]
    InvalidParam { message: String },

    /// A log key that violates the container ordering contract
    #[error("bad log key")]
    BadLogKey,

    /// A user callback failed or returned no usable value
    #[error("callback failed: {message}")]
    Callback { message: String },

    /// The requested subscriber is unknown to the publisher
    #[error("subscriber not found")]
    SubscriberNotFound,
}

impl WalError {
    /// Create a new Initialization error
    pub fn initialization<S: Into<String>>(reason: S) -> Self {
        WalError::Initialization {
            reason: reason.into(),
        }
    }

    /// Create a new InvalidParam error
    pub fn invalid_param<S: Into<String>>(message: S) -> Self {
        WalError::InvalidParam {
            message: message.into(),
        }
    }

    /// Create a new Callback error
    pub fn callback<S: Into<String>>(message: S) -> Self {
        WalError::Callback {
            message: message.into(),
        }
    }

    /// Check if this error should be surfaced at startup
    pub fn is_initialization_error(&self) -> bool {
        matches!(
            self,
            WalError::Initialization { .. } | WalError::ActionNotSet
        )
    }

    /// Check if this error was caused by a bad argument
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            WalError::InvalidParam { .. } | WalError::BadLogKey
        )
    }
}

/// Convert from anyhow::Error so user callbacks can bubble arbitrary failures
impl From<anyhow::Error> for WalError {
    fn from(err: anyhow::Error) -> Self {
        WalError::Callback {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(WalError::initialization("missing callback").is_initialization_error());
        assert!(WalError::ActionNotSet.is_initialization_error());
        assert!(WalError::invalid_param("zero max_events").is_input_error());
        assert!(!WalError::callback("boom").is_input_error());
    }

    #[test]
    fn test_anyhow_bridge() {
        let err: WalError = anyhow::anyhow!("storage unavailable").into();
        assert_eq!(
            err,
            WalError::Callback {
                message: "storage unavailable".to_string()
            }
        );
    }
}
