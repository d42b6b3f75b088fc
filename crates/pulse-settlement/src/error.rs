//! Error types for the ledger, transfers and payouts

use pulse_core::{Amount, ValidatorId};
use thiserror::Error;

/// Ledger and journal errors
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Validator not found: {0}")]
    NotFound(ValidatorId),

    #[error("Journal I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Journal serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt journal at line {line}: {detail}")]
    Corrupt { line: usize, detail: String },
}

/// Errors from the external transfer system
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("Insufficient funds. Payer has {available}, but {required} are needed.")]
    InsufficientFunds { available: Amount, required: Amount },

    #[error("Invalid payout address: {0}")]
    InvalidAddress(String),

    #[error("Transfer timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Transfer rejected: {0}")]
    Rejected(String),

    /// The service answered a transfer but the reply could not be read,
    /// so the funds may or may not have moved
    #[error("Transfer outcome unknown: {0}")]
    Unconfirmed(String),

    #[error("Transfer circuit is open, retry in {retry_in_ms}ms")]
    CircuitOpen { retry_in_ms: u64 },
}

impl TransferError {
    /// Whether the same request may succeed if retried
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Network(_) | Self::Unconfirmed(_)
        )
    }
}

/// Errors surfaced to the caller of `payout`
///
/// By the time one of these is returned the ledger has already been
/// reconciled, except for `LedgerInconsistency`, which needs an operator.
#[derive(Error, Debug)]
pub enum PayoutError {
    #[error("Validator not found: {0}")]
    NotFound(ValidatorId),

    #[error("No pending payouts for validator {0}")]
    NoPendingAmount(ValidatorId),

    #[error("Transfer of {amount} to validator {validator_id} failed: {reason}")]
    TransferFailed {
        validator_id: ValidatorId,
        amount: Amount,
        reason: String,
        /// Whether the external transfer call was actually made
        attempted: bool,
    },

    #[error("Ledger inconsistency for payout {idempotency_key}: {detail}")]
    LedgerInconsistency {
        idempotency_key: String,
        detail: String,
    },

    #[error("Ledger storage error: {0}")]
    Storage(String),
}

impl PayoutError {
    /// Machine-readable error kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NotFound",
            Self::NoPendingAmount(_) => "NoPendingAmount",
            Self::TransferFailed { .. } => "TransferFailed",
            Self::LedgerInconsistency { .. } => "LedgerInconsistency",
            Self::Storage(_) => "Storage",
        }
    }

    /// `false` means nothing happened; `true` means a real transfer attempt was made
    pub fn money_may_have_moved(&self) -> bool {
        match self {
            Self::TransferFailed { attempted, .. } => *attempted,
            Self::LedgerInconsistency { .. } => true,
            Self::NotFound(_) | Self::NoPendingAmount(_) | Self::Storage(_) => false,
        }
    }
}

impl From<LedgerError> for PayoutError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::NotFound(id) => Self::NotFound(id),
            other => Self::Storage(other.to_string()),
        }
    }
}
