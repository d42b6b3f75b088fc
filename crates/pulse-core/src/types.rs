//! Core type definitions for Pulse

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Validator identifier issued by the hub on first signup
pub type ValidatorId = String;

/// Opaque token binding a request to its eventual asynchronous reply
pub type CorrelationId = String;

/// Identifier of a monitored website
pub type WebsiteId = String;

/// Reward and transfer amounts, in minor units
pub type Amount = u64;

/// Generate a fresh correlation id
///
/// Ids are never reused: every assignment and every signup attempt gets its own.
pub fn new_correlation_id() -> CorrelationId {
    Uuid::new_v4().to_string()
}

/// Outcome of a single liveness probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProbeStatus {
    Good,
    Bad,
}

impl std::fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Good => write!(f, "Good"),
            Self::Bad => write!(f, "Bad"),
        }
    }
}

impl std::str::FromStr for ProbeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "good" => Ok(Self::Good),
            "bad" => Ok(Self::Bad),
            _ => Err(format!("Invalid probe status: {}", s)),
        }
    }
}

/// Identity record for a validator, joined with its ledger balance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Validator {
    pub id: ValidatorId,
    /// Hex-encoded Ed25519 public key; also the payout address
    pub public_key: String,
    pub ip: String,
    pub location: Option<String>,
    pub pending_reward_amount: Amount,
}

/// A monitored website the hub dispatches probes for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Website {
    pub id: WebsiteId,
    pub url: String,
}

/// A probe assignment handed to one validator
///
/// Lives only until the matching report arrives or the deadline elapses.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub correlation_id: CorrelationId,
    pub target_url: String,
    pub website_id: WebsiteId,
    pub validator_id: ValidatorId,
    pub issued_at: Instant,
    pub deadline: Instant,
}

impl Assignment {
    pub fn new(
        target_url: impl Into<String>,
        website_id: impl Into<String>,
        validator_id: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let issued_at = Instant::now();
        Self {
            correlation_id: new_correlation_id(),
            target_url: target_url.into(),
            website_id: website_id.into(),
            validator_id: validator_id.into(),
            issued_at,
            deadline: issued_at + timeout,
        }
    }

    /// Whether the deadline has passed at `now`
    pub fn is_overdue(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

/// A probe result returned by an agent, signed over its correlation id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedReport {
    pub correlation_id: CorrelationId,
    pub status: ProbeStatus,
    pub latency_ms: u64,
    pub website_id: WebsiteId,
    pub validator_id: ValidatorId,
    /// Hex-encoded detached signature
    pub signature: String,
}

/// Proof of a successful external transfer. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayoutReceipt {
    pub validator_id: ValidatorId,
    pub amount: Amount,
    pub transfer_reference: String,
    pub timestamp: DateTime<Utc>,
}

/// How a tick came to be recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TickSource {
    /// A verified report from the assigned validator
    Report,
    /// No valid report arrived before the deadline
    Timeout,
}

/// One monitoring data point for a website
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tick {
    pub website_id: WebsiteId,
    pub validator_id: ValidatorId,
    pub status: ProbeStatus,
    pub latency_ms: Option<u64>,
    pub source: TickSource,
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_status_parse() {
        assert_eq!("Good".parse::<ProbeStatus>().unwrap(), ProbeStatus::Good);
        assert_eq!("bad".parse::<ProbeStatus>().unwrap(), ProbeStatus::Bad);
        assert!("unknown".parse::<ProbeStatus>().is_err());
    }

    #[test]
    fn test_probe_status_wire_format() {
        assert_eq!(serde_json::to_string(&ProbeStatus::Good).unwrap(), "\"Good\"");
        assert_eq!(serde_json::to_string(&ProbeStatus::Bad).unwrap(), "\"Bad\"");
    }

    #[test]
    fn test_correlation_ids_are_unique() {
        let a = new_correlation_id();
        let b = new_correlation_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_assignment_deadline() {
        let assignment = Assignment::new(
            "https://example.com",
            "site-1",
            "validator-1",
            Duration::from_secs(5),
        );
        assert!(!assignment.is_overdue(assignment.issued_at));
        assert!(assignment.is_overdue(assignment.issued_at + Duration::from_secs(5)));
    }
}
