//! # pulse-core
//!
//! Shared building blocks for the Pulse validator network.
//!
//! Pulse coordinates a fleet of untrusted validator agents that probe
//! websites for liveness. Agents authenticate with Ed25519 keys instead of
//! passwords, the hub dispatches probe assignments over a persistent
//! connection, and accepted reports accrue rewards that are later settled
//! through an external transfer.
//!
//! ## Contents
//!
//! - Identity and ledger records ([`Validator`], [`Assignment`], [`SignedReport`], [`PayoutReceipt`])
//! - The JSON wire protocol spoken between agent and hub ([`protocol`])
//! - Detached signatures over human-auditable messages ([`signer`])
//! - Configuration loaded from `pulse.toml` ([`config`])

pub mod config;
mod error;
pub mod protocol;
pub mod signer;
mod types;

pub use config::PulseConfig;
pub use error::{PulseError, Result};
pub use signer::Signer;
pub use types::*;
