//! Error types for nonce allocation and transaction submission

use crate::tx::classify::{classify_failure, FailureKind};

use thiserror::Error;

/// Main error type for the coordination layer.
///
/// Cloneable so that a single coalesced chain read can hand the same failure
/// to every waiting caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error("No account connected: {0}")]
    NotReady(String),

    #[error("Nonce conflict: {0}")]
    NonceConflict(String),

    #[error("User rejected the request: {0}")]
    UserRejected(String),

    #[error("Transaction {tx_hash} reverted")]
    TransactionReverted { tx_hash: String },

    #[error("Receipt error for {tx_hash}: {message}")]
    ReceiptError { tx_hash: String, message: String },

    #[error("A submission is already outstanding on this submitter")]
    Busy,

    #[error("Chain read failed for {address} on chain {chain_id}: {message}")]
    ChainRead {
        chain_id: u64,
        address: String,
        message: String,
    },

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Contract {0} not configured")]
    ContractNotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SubmitError {
    /// Map a raw send failure from the chain client onto the taxonomy
    pub fn from_send_failure(message: impl Into<String>) -> Self {
        let message = message.into();
        match classify_failure(&message) {
            FailureKind::NonceConflict => SubmitError::NonceConflict(message),
            FailureKind::UserRejected => SubmitError::UserRejected(message),
            FailureKind::Other => SubmitError::Transaction(message),
        }
    }

    /// Classification of this error's text, as used for nonce feedback
    pub fn failure_kind(&self) -> FailureKind {
        classify_failure(&self.to_string())
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SubmitError::ChainRead { .. }
                | SubmitError::Timeout { .. }
                | SubmitError::NonceConflict(_)
        )
    }

    /// Whether a consuming UI should present this as a failure.
    ///
    /// Nonce conflicts recover silently and user rejections are a choice,
    /// not an error.
    pub fn is_user_visible(&self) -> bool {
        !matches!(
            self.failure_kind(),
            FailureKind::NonceConflict | FailureKind::UserRejected
        )
    }
}

/// Result type for coordination operations
pub type SubmitResult<T> = Result<T, SubmitError>;
