use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use horizon_consensus::{Node, NodeConfig};
use horizon_core::KeyPair;

#[derive(Parser)]
#[command(author, version, about = "Horizon proof-of-stake node")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a node from a configuration file
    Start {
        #[arg(short, long, default_value = "horizon.toml")]
        config: PathBuf,
        /// Secret phrase of an account to forge with
        #[arg(long, env = "HORIZON_SECRET_PHRASE", hide_env_values = true)]
        forge: Option<String>,
    },
    /// Write the default configuration file
    GenerateConfig {
        #[arg(short, long, default_value = "horizon.toml")]
        path: PathBuf,
    },
    /// Print the account id and public key of a secret phrase
    Account {
        #[arg(env = "HORIZON_SECRET_PHRASE", hide_env_values = true)]
        phrase: String,
    },
    /// Print the chain tip stored under the configured data directory
    Status {
        #[arg(short, long, default_value = "horizon.toml")]
        config: PathBuf,
    },
}

fn load_config(path: &Path) -> Result<NodeConfig> {
    if path.exists() {
        NodeConfig::from_toml_file(path).with_context(|| format!("Failed to load {}", path.display()))
    } else {
        Ok(NodeConfig::default())
    }
}

fn init_logging(default_level: &str) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { config, forge } => start_node(config, forge).await?,
        Commands::GenerateConfig { path } => generate_config(path)?,
        Commands::Account { phrase } => print_account(&phrase)?,
        Commands::Status { config } => print_status(config)?,
    }

    Ok(())
}

async fn start_node(config_path: PathBuf, forge: Option<String>) -> Result<()> {
    let config = load_config(&config_path)?;
    init_logging(&config.log_level);

    let node = Node::open_default(config).context("Failed to open node")?;
    if let Some(phrase) = forge {
        let account = node.start_forging(&phrase)?;
        match node.next_block_eta(account)? {
            Some(eta) => log::info!("Account {} may forge in about {} seconds", account, eta),
            None => log::warn!("Account {} has no effective stake yet", account),
        }
    }

    node.run_until(async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for shutdown signal: {}", err);
        }
    })
    .await?;
    Ok(())
}

fn generate_config(path: PathBuf) -> Result<()> {
    let config = NodeConfig::default();
    std::fs::write(&path, config.to_toml_string()?).with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

fn print_account(phrase: &str) -> Result<()> {
    let keys = KeyPair::from_secret_phrase(phrase)?;
    println!("account:    {}", keys.account_id());
    println!("public key: {}", keys.public_key().to_hex());
    Ok(())
}

fn print_status(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    init_logging("warn");
    let node = Node::open_default(config)?;
    println!("{}", serde_json::to_string_pretty(&node.snapshot()?)?);
    Ok(())
}
