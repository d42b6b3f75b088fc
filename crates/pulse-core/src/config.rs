//! Configuration management for Pulse
//!
//! One TOML file (`pulse.toml` by default) configures the hub, the agent and
//! the settlement engine. Every field has a default, so a missing file or a
//! partial file is valid. Secrets never live here: the agent's private key is
//! read from the environment variable named by `agent.private_key_env`.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::{Amount, PulseError, Result, Website};

/// Top-level Pulse configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PulseConfig {
    #[serde(default)]
    pub hub: HubConfig,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub settlement: SettlementConfig,
}

/// Coordinator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Address the hub listens on
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Reward credited for each accepted report
    #[serde(default = "default_reward_per_report")]
    pub reward_per_report: Amount,

    /// How long a validator has to answer an assignment
    #[serde(default = "default_assignment_timeout_ms")]
    pub assignment_timeout_ms: u64,

    /// Seconds between dispatch rounds over `websites`
    #[serde(default = "default_dispatch_interval_secs")]
    pub dispatch_interval_secs: u64,

    /// Number of distinct validators probing each website per round
    #[serde(default = "default_replicas")]
    pub replicas: usize,

    /// How often overdue assignments are swept
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Recent ticks kept in memory
    #[serde(default = "default_max_ticks")]
    pub max_ticks: usize,

    /// Ledger journal location
    #[serde(default = "default_journal_path")]
    pub journal_path: String,

    /// Websites to monitor
    #[serde(default)]
    pub websites: Vec<Website>,
}

/// Validator agent settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// WebSocket endpoint of the hub
    #[serde(default = "default_hub_url")]
    pub hub_url: String,

    /// Address reported at signup
    #[serde(default = "default_ip")]
    pub ip: String,

    #[serde(default)]
    pub location: Option<String>,

    /// Ceiling for a single probe; also the latency reported for failed probes
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    /// Lifetime of a pending signup callback before eviction
    #[serde(default = "default_pending_ttl_ms")]
    pub pending_ttl_ms: u64,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Environment variable holding the hex private key
    #[serde(default = "default_private_key_env")]
    pub private_key_env: String,
}

/// Payout settlement settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementConfig {
    /// Ceiling for one external transfer call
    #[serde(default = "default_transfer_timeout_ms")]
    pub transfer_timeout_ms: u64,

    /// Attempts per payout, all sharing one idempotency key
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Consecutive transport failures before the transfer circuit opens
    #[serde(default = "default_circuit_threshold")]
    pub circuit_threshold: u32,

    #[serde(default = "default_circuit_timeout_secs")]
    pub circuit_timeout_secs: u64,

    #[serde(default)]
    pub backend: TransferBackendConfig,
}

/// Which external transfer system settles payouts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransferBackendConfig {
    /// In-process payer account, for development and tests
    Simulated { balance: Amount },
    /// External transfer service spoken to over HTTP
    Http { url: String },
}

// Default value providers
fn default_bind() -> String {
    "0.0.0.0:8081".to_string()
}

fn default_reward_per_report() -> Amount {
    100
}

fn default_assignment_timeout_ms() -> u64 {
    10_000
}

fn default_dispatch_interval_secs() -> u64 {
    60
}

fn default_replicas() -> usize {
    1
}

fn default_sweep_interval_ms() -> u64 {
    1_000
}

fn default_max_ticks() -> usize {
    1_000
}

fn default_journal_path() -> String {
    ".pulse/ledger.jsonl".to_string()
}

fn default_hub_url() -> String {
    "ws://localhost:8081/ws".to_string()
}

fn default_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_probe_timeout_ms() -> u64 {
    1_000
}

fn default_heartbeat_secs() -> u64 {
    10
}

fn default_pending_ttl_ms() -> u64 {
    10_000
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_private_key_env() -> String {
    "PULSE_PRIVATE_KEY".to_string()
}

fn default_transfer_timeout_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    1
}

fn default_retry_backoff_ms() -> u64 {
    1_000
}

fn default_circuit_threshold() -> u32 {
    3
}

fn default_circuit_timeout_secs() -> u64 {
    60
}

impl PulseConfig {
    /// Load configuration from `path`, or defaults if the file does not exist
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)
                .map_err(|e| PulseError::Config(format!("Failed to parse config file: {}", e)))?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Write the default configuration to `path`
    pub fn write_default(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let content = toml::to_string_pretty(&Self::default())
            .map_err(|e| PulseError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values that would make timeouts unbounded or dispatch impossible
    pub fn validate(&self) -> Result<()> {
        if self.agent.probe_timeout_ms == 0 {
            return Err(PulseError::Config(
                "agent.probe_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.hub.assignment_timeout_ms == 0 {
            return Err(PulseError::Config(
                "hub.assignment_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.hub.replicas == 0 {
            return Err(PulseError::Config(
                "hub.replicas must be at least 1".to_string(),
            ));
        }
        if self.settlement.transfer_timeout_ms == 0 {
            return Err(PulseError::Config(
                "settlement.transfer_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.settlement.max_attempts == 0 {
            return Err(PulseError::Config(
                "settlement.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl HubConfig {
    pub fn assignment_timeout(&self) -> Duration {
        Duration::from_millis(self.assignment_timeout_ms)
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_secs(self.dispatch_interval_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl AgentConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn pending_ttl(&self) -> Duration {
        Duration::from_millis(self.pending_ttl_ms)
    }
}

impl SettlementConfig {
    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            reward_per_report: default_reward_per_report(),
            assignment_timeout_ms: default_assignment_timeout_ms(),
            dispatch_interval_secs: default_dispatch_interval_secs(),
            replicas: default_replicas(),
            sweep_interval_ms: default_sweep_interval_ms(),
            max_ticks: default_max_ticks(),
            journal_path: default_journal_path(),
            websites: vec![],
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            hub_url: default_hub_url(),
            ip: default_ip(),
            location: None,
            probe_timeout_ms: default_probe_timeout_ms(),
            heartbeat_secs: default_heartbeat_secs(),
            pending_ttl_ms: default_pending_ttl_ms(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            private_key_env: default_private_key_env(),
        }
    }
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            transfer_timeout_ms: default_transfer_timeout_ms(),
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            circuit_threshold: default_circuit_threshold(),
            circuit_timeout_secs: default_circuit_timeout_secs(),
            backend: TransferBackendConfig::default(),
        }
    }
}

impl Default for TransferBackendConfig {
    fn default() -> Self {
        Self::Simulated { balance: 0 }
    }
}
