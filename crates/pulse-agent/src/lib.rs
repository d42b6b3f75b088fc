//! # pulse-agent
//!
//! Validator agent for the Pulse network.
//!
//! An agent holds one persistent connection to the hub, proves ownership of
//! its Ed25519 key during signup, then loops receiving probe assignments and
//! returning signed reports. Failed probes are reported too: a `Bad` result
//! is a valid answer.
//!
//! ## Pieces
//!
//! - [`Prober`]: one bounded HTTP GET per assignment
//! - [`transition`]: pure session state machine, testable without a socket
//! - [`PendingCallbacks`]: correlation table with TTL eviction
//! - [`Backoff`]: bounded exponential reconnect delay
//! - [`ValidatorAgent`]: the receive loop tying them together

mod backoff;
mod pending;
mod probe;
mod session;
mod state_machine;

pub use backoff::Backoff;
pub use pending::PendingCallbacks;
pub use probe::{classify_status, ProbeOutcome, Prober};
pub use session::ValidatorAgent;
pub use state_machine::{transition, Action, Event, State};
