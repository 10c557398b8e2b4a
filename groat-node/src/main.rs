use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use groat_config::NodeConfig;
use groat_node::{init_logging, run_node};
use groat_wallet::WalletStore;
use tokio::runtime::Runtime;

#[derive(Parser)]
#[command(name = "groat", version, about = "groat proof-of-work full node")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write an example config
    Init {
        #[arg(long, default_value = "config/groat.toml")]
        config: PathBuf,
    },
    /// Start the full node
    Start {
        #[arg(long, default_value = "config/groat.toml")]
        config: PathBuf,
        /// Mine blocks to user.public_key
        #[arg(long)]
        mine: bool,
    },
    /// Wallet operations
    Wallet {
        #[command(subcommand)]
        cmd: WalletCmd,
    },
}

#[derive(Subcommand)]
enum WalletCmd {
    New {
        #[arg(long, default_value = "default")]
        name: String,
        #[arg(long)]
        passphrase: String,
    },
    List,
}

fn main() -> Result<()> {
    init_logging();
    match Cli::parse().command {
        Commands::Init { config } => init_config(config)?,
        Commands::Start { config, mine } => {
            let cfg = NodeConfig::load(&config)?;
            let rt = Runtime::new()?;
            rt.block_on(run_node(cfg, mine))?;
        }
        Commands::Wallet { cmd } => match cmd {
            WalletCmd::New { name, passphrase } => {
                let store = WalletStore::new(wallet_dir()?)?;
                let wallet = store.create(&name, &passphrase)?;
                println!("Created wallet {} address {}", wallet.name, wallet.public_key);
            }
            WalletCmd::List => {
                let store = WalletStore::new(wallet_dir()?)?;
                for wallet in store.list()? {
                    println!("{} -> {}", wallet.name, wallet.public_key);
                }
            }
        },
    }
    Ok(())
}

fn init_config(path: PathBuf) -> Result<()> {
    if path.exists() {
        println!("Config already exists at {:?}", path);
        return Ok(());
    }
    let cfg = NodeConfig::example();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, toml::to_string_pretty(&cfg)?)?;
    println!("Wrote config to {:?}", path);
    Ok(())
}

fn wallet_dir() -> Result<PathBuf> {
    let dir = dirs::home_dir()
        .unwrap_or(std::env::temp_dir())
        .join(".groat")
        .join("wallets");
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
