//! # pulse-settlement
//!
//! Reward ledger and payout settlement for the Pulse network.
//!
//! A payout is a saga across two systems of record: the internal ledger and
//! an irreversible external transfer.
//!
//! 1. Under the validator's account lock: check the balance, journal a
//!    `PayoutStarted` intent with a fresh idempotency key, zero the balance.
//! 2. Outside any lock: check the payer balance, attempt the transfer.
//! 3. Success journals `PayoutCompleted` with the receipt. Failure journals
//!    `PayoutReverted` and restores the amount (`+=`, never overwrite).
//!
//! Intents left open by a crash are settled at startup by
//! [`SettlementEngine::reconcile`], which asks the transfer backend whether
//! the idempotency key was ever paid.

mod circuit_breaker;
mod engine;
mod error;
mod journal;
mod ledger;
mod transfer;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use engine::{ReconcileReport, SettlementEngine, TransferPolicy};
pub use error::{LedgerError, PayoutError, TransferError};
pub use journal::{Journal, JournalEntry};
pub use ledger::{Account, Ledger, PayoutIntent};
pub use transfer::{
    backend_from_config, HttpTransfer, SimulatedTransfer, TransferBackend, TransferRequest,
};
