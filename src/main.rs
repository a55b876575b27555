//! POUV ledger node CLI
//!
//! A command-line interface for initializing, mining and inspecting a ledger.

use clap::{Parser, Subcommand};
use pouv_chain::cli::{self, AppState, ConfigOverrides};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "pouv-node")]
#[command(author = "Darshan")]
#[command(version = "0.1.0")]
#[command(about = "Proof-of-work ledger node with universal transaction validation", long_about = None)]
struct Cli {
    /// Data directory for the ledger store
    #[arg(short, long, default_value = ".pouv_data", global = true)]
    data_dir: PathBuf,

    /// Initial mining difficulty in leading zero hex digits (new chains only)
    #[arg(long, global = true)]
    difficulty: Option<u32>,

    /// Address receiving the genesis allocation (new chains only)
    #[arg(long, global = true)]
    genesis_address: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new ledger with its genesis block
    Init,

    /// Mine new blocks
    Mine {
        /// Miner's address for receiving subsidy and fees
        #[arg(short, long)]
        address: String,

        /// Number of blocks to mine
        #[arg(short, long, default_value = "1")]
        count: u32,
    },

    /// Display chain, protection and mempool status
    Status,

    /// Show the confirmed balance of an address
    Balance {
        #[arg(short, long)]
        address: String,
    },

    /// Re-verify the whole stored chain
    Verify,

    /// Generate a new key pair
    Keygen,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let overrides = ConfigOverrides {
        difficulty: cli.difficulty,
        genesis_address: cli.genesis_address.clone(),
    };

    // Commands that don't need an open ledger
    match &cli.command {
        Commands::Init => return cli::cmd_init(&cli.data_dir, &overrides).await,
        Commands::Keygen => return cli::cmd_keygen(),
        _ => {}
    }

    if !cli::is_initialized(&cli.data_dir) {
        println!("📭 No ledger at {:?}. Create one with: pouv-node init", cli.data_dir);
        return Ok(());
    }
    let state = AppState::open(&cli.data_dir, &overrides)?;

    match cli.command {
        Commands::Init | Commands::Keygen => unreachable!(),

        Commands::Mine { address, count } => {
            cli::cmd_mine(&state, &address, count).await?;
        }

        Commands::Status => {
            cli::cmd_status(&state).await?;
        }

        Commands::Balance { address } => {
            cli::cmd_balance(&state, &address).await?;
        }

        Commands::Verify => {
            cli::cmd_verify(&state).await?;
        }
    }

    Ok(())
}
