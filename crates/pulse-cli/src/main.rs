//! Pulse CLI - validator network for website liveness
//!
//! Usage:
//!   pulse init                  Write a default pulse.toml
//!   pulse keygen                Generate a validator keypair
//!   pulse hub                   Run the coordinator
//!   pulse agent                 Run a validator agent
//!   pulse payout <validator>    Settle a validator's pending rewards
//!   pulse balance               Show the payer balance
//!   pulse reconcile             Settle payouts a crash left open

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pulse_agent::ValidatorAgent;
use pulse_core::{PulseConfig, Signer};
use pulse_settlement::{Ledger, SettlementEngine};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "pulse")]
#[command(author, version, about = "Decentralized website liveness validation")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file
    #[arg(short, long, default_value = "pulse.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Generate an Ed25519 keypair for a validator
    Keygen,

    /// Run the coordinator hub
    Hub,

    /// Run a validator agent (private key read from the configured env var)
    Agent,

    /// Pay out a validator's pending rewards through a running hub
    Payout {
        /// Validator ID
        validator_id: String,

        /// Hub HTTP base URL (defaults to the configured bind address)
        #[arg(long)]
        hub: Option<String>,
    },

    /// Show the payer balance of a running hub
    Balance {
        /// Hub HTTP base URL (defaults to the configured bind address)
        #[arg(long)]
        hub: Option<String>,
    },

    /// Settle payout intents left open by a crash (hub must be stopped)
    Reconcile,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Init { force } => cmd_init(&cli.config, force),
        Commands::Keygen => cmd_keygen(&cli.config),
        Commands::Hub => cmd_hub(&cli.config).await,
        Commands::Agent => cmd_agent(&cli.config).await,
        Commands::Payout { validator_id, hub } => cmd_payout(&cli.config, validator_id, hub).await,
        Commands::Balance { hub } => cmd_balance(&cli.config, hub).await,
        Commands::Reconcile => cmd_reconcile(&cli.config).await,
    }
}

fn load_config(path: &Path) -> Result<PulseConfig> {
    PulseConfig::load_or_default(path)
        .with_context(|| format!("Failed to load configuration from {:?}", path))
}

fn cmd_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{:?} already exists (use --force to overwrite)", path);
    }
    PulseConfig::write_default(path).context("Failed to write configuration")?;

    println!("Wrote {:?}", path);
    println!("\nNext steps:");
    println!("  1. Add websites under [hub] and pick a settlement backend");
    println!("  2. Run 'pulse keygen' for each validator");
    println!("  3. Start 'pulse hub', then 'pulse agent'");
    Ok(())
}

fn cmd_keygen(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let signer = Signer::generate();

    println!("Public key (payout address): {}", signer.public_key());
    println!("\nKeep the private key secret. To run an agent with it:");
    println!(
        "  export {}={}",
        config.agent.private_key_env,
        signer.secret_hex()
    );
    Ok(())
}

async fn cmd_hub(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    info!(
        "Starting hub ({} websites, reward {} per report)",
        config.hub.websites.len(),
        config.hub.reward_per_report
    );

    pulse_hub::serve(config, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received shutdown signal");
    })
    .await
}

async fn cmd_agent(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let env_var = &config.agent.private_key_env;
    let secret = std::env::var(env_var)
        .with_context(|| format!("Set {} to the agent's hex private key", env_var))?;
    let signer = Signer::from_hex(secret.trim()).context("Invalid private key")?;

    let agent = ValidatorAgent::new(config.agent.clone(), signer)?;
    info!("Validator agent {} starting", agent.public_key());

    tokio::select! {
        result = agent.run() => result.context("Agent stopped"),
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            Ok(())
        }
    }
}

/// HTTP base of the hub, from `--hub` or the configured bind address
fn hub_base_url(config: &PulseConfig, hub: Option<String>) -> String {
    match hub {
        Some(url) => url.trim_end_matches('/').to_string(),
        None => {
            let bind = config.hub.bind.replace("0.0.0.0", "127.0.0.1");
            format!("http://{}", bind)
        }
    }
}

async fn cmd_payout(config_path: &Path, validator_id: String, hub: Option<String>) -> Result<()> {
    let config = load_config(config_path)?;
    let url = format!(
        "{}/api/v1/payout/{}",
        hub_base_url(&config, hub),
        validator_id
    );

    let response = reqwest::Client::new()
        .post(&url)
        .send()
        .await
        .with_context(|| format!("Failed to reach hub at {}", url))?;
    let status = response.status();
    let body: Value = response.json().await.context("Malformed hub response")?;

    if status.is_success() {
        println!("Paid {} to validator {}", body["amount"], body["validatorId"]);
        println!("Transfer reference: {}", body["transferReference"]);
        Ok(())
    } else {
        let kind = body["kind"].as_str().unwrap_or("Unknown");
        let message = body["message"].as_str().unwrap_or("");
        if body["moneyMayHaveMoved"].as_bool().unwrap_or(false) {
            println!("A transfer was attempted; check the hub log before retrying.");
        }
        bail!("Payout failed ({}): {}", kind, message)
    }
}

async fn cmd_balance(config_path: &Path, hub: Option<String>) -> Result<()> {
    let config = load_config(config_path)?;
    let url = format!("{}/api/v1/admin/balance", hub_base_url(&config, hub));

    let response = reqwest::get(&url)
        .await
        .with_context(|| format!("Failed to reach hub at {}", url))?;
    let status = response.status();
    let body: Value = response.json().await.context("Malformed hub response")?;

    if !status.is_success() {
        bail!(
            "Balance unavailable: {}",
            body["message"].as_str().unwrap_or("unknown error")
        );
    }
    println!("Payer balance: {}", body["lamports"]);
    Ok(())
}

async fn cmd_reconcile(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let ledger = Arc::new(
        Ledger::open(&config.hub.journal_path)
            .await
            .with_context(|| format!("Failed to open ledger at {}", config.hub.journal_path))?,
    );

    let orphaned = ledger.orphaned_intents().await;
    if orphaned.is_empty() {
        println!("Nothing to reconcile");
        return Ok(());
    }
    println!("Reconciling {} open payout(s)...", orphaned.len());

    let engine = SettlementEngine::from_config(&config.settlement, ledger)
        .context("Failed to configure transfer backend")?;
    let report = engine.reconcile().await;

    for receipt in &report.completed {
        println!(
            "  completed  {} -> {} ({})",
            receipt.amount, receipt.validator_id, receipt.transfer_reference
        );
    }
    for intent in &report.reverted {
        println!(
            "  reverted   {} -> {} (restored to pending)",
            intent.amount, intent.validator_id
        );
    }
    for (intent, reason) in &report.unresolved {
        println!(
            "  UNRESOLVED {} -> {} [{}]: {}",
            intent.amount, intent.validator_id, intent.idempotency_key, reason
        );
    }

    if !report.is_clean() {
        bail!(
            "{} payout(s) could not be reconciled",
            report.unresolved.len()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hub_base_url_from_bind() {
        let config = PulseConfig::default();
        assert_eq!(hub_base_url(&config, None), "http://127.0.0.1:8081");
        assert_eq!(
            hub_base_url(&config, Some("http://hub.example:9000/".to_string())),
            "http://hub.example:9000"
        );
    }

    #[test]
    fn test_cli_parses_payout() {
        let cli = Cli::try_parse_from(["pulse", "--config", "x.toml", "payout", "v-1"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("x.toml"));
        match cli.command {
            Commands::Payout { validator_id, hub } => {
                assert_eq!(validator_id, "v-1");
                assert!(hub.is_none());
            }
            _ => panic!("expected payout"),
        }
    }

    #[test]
    fn test_init_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pulse.toml");
        cmd_init(&path, false).unwrap();
        assert!(cmd_init(&path, false).is_err());
        cmd_init(&path, true).unwrap();
        assert!(PulseConfig::load_or_default(&path).is_ok());
    }
}
