use std::sync::Arc;

use thiserror::Error;

use crate::transaction::TransactionId;

/// Whether a failure should be retried by the task service.
///
/// Carried explicitly by application and participant errors instead of being
/// inferred from the error's shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    /// Running the same task again may succeed.
    Retryable,
    /// Running the same task again will fail the same way.
    NonRetryable,
}

#[derive(Error, Debug, Clone)]
pub enum ThothError {
    /// The transaction lost a conflict and must be aborted.
    #[error("Transaction {txn} aborted by conflict: {reason}")]
    TransactionConflict { txn: TransactionId, reason: String },

    /// The transaction was aborted for some other reason.
    #[error("Transaction {txn} aborted: {cause}")]
    TransactionAborted {
        txn: TransactionId,
        cause: Arc<ThothError>,
    },

    #[error("No active transaction")]
    NoActiveTransaction,

    /// Operation on a transaction that is no longer active.
    #[error("Transaction {0} is not active")]
    TransactionNotActive(TransactionId),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Task rejected: {0}")]
    TaskRejected(String),

    #[error("Participant {participant} failed: {message}")]
    Participant {
        participant: String,
        message: String,
        retry: Retry,
    },

    #[error("Task failed: {message}")]
    Application { message: String, retry: Retry },

    #[error("Task gave up after {attempts} attempts: {last}")]
    RetryLimitExceeded { attempts: u32, last: Arc<ThothError> },

    #[error("Task store error: {0}")]
    TaskStore(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Task panicked: {0}")]
    Panicked(String),
}

impl ThothError {
    /// Builds an application failure that should be retried.
    pub fn retryable(message: impl Into<String>) -> Self {
        ThothError::Application {
            message: message.into(),
            retry: Retry::Retryable,
        }
    }

    /// Builds an application failure that should surface to the owner.
    pub fn fatal(message: impl Into<String>) -> Self {
        ThothError::Application {
            message: message.into(),
            retry: Retry::NonRetryable,
        }
    }

    /// Returns `true` if the task that produced this error should run again.
    pub fn should_retry(&self) -> bool {
        match self {
            ThothError::TransactionConflict { .. } => true,
            ThothError::TransactionAborted { cause, .. } => cause.should_retry(),
            ThothError::Participant { retry, .. } | ThothError::Application { retry, .. } => {
                *retry == Retry::Retryable
            }
            ThothError::NoActiveTransaction
            | ThothError::TransactionNotActive(_)
            | ThothError::InvalidState(_)
            | ThothError::TaskRejected(_)
            | ThothError::RetryLimitExceeded { .. }
            | ThothError::TaskStore(_)
            | ThothError::Config(_)
            | ThothError::Panicked(_) => false,
        }
    }

    /// Returns `true` for failures produced by conflict detection.
    pub fn is_conflict(&self) -> bool {
        match self {
            ThothError::TransactionConflict { .. } => true,
            ThothError::TransactionAborted { cause, .. } => cause.is_conflict(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ThothError>;
