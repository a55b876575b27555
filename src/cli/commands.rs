//! CLI commands for the ledger node
//!
//! Implements all command handlers for the CLI interface.

use crate::config::{ChainConfig, CONFIG_FILE};
use crate::core::{Amount, COIN};
use crate::crypto::KeyPair;
use crate::network::NullBroadcaster;
use crate::node::{Engine, SystemClock};
use crate::storage::SledLedger;
use log::warn;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Result type for CLI operations
pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Directory of the sled store inside the data directory
const LEDGER_DIR: &str = "ledger";

/// Parameters given on the command line; they only shape a new chain
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub difficulty: Option<u32>,
    pub genesis_address: Option<String>,
}

impl ConfigOverrides {
    fn is_empty(&self) -> bool {
        self.difficulty.is_none() && self.genesis_address.is_none()
    }

    fn apply(&self, config: &mut ChainConfig) {
        if let Some(d) = self.difficulty {
            config.initial_difficulty = d;
        }
        if let Some(address) = &self.genesis_address {
            config.genesis_address = address.clone();
        }
    }
}

/// Format base units as a decimal coin amount
pub fn format_amount(amount: Amount) -> String {
    format!("{}.{:08}", amount / COIN, amount % COIN)
}

/// Config of an existing chain, or defaults + environment + flags for a
/// new one
fn resolve_config(data_dir: &Path, overrides: &ConfigOverrides) -> CliResult<ChainConfig> {
    let path = data_dir.join(CONFIG_FILE);
    if path.exists() {
        if !overrides.is_empty() {
            warn!("Chain already initialized; ignoring --difficulty/--genesis-address");
        }
        return Ok(ChainConfig::load(&path)?);
    }

    let mut config = ChainConfig::from_env()?;
    overrides.apply(&mut config);
    config.validate()?;
    Ok(config)
}

/// Application state
pub struct AppState {
    pub engine: Engine,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Open the ledger in `data_dir`, creating it if needed
    pub fn open(data_dir: &Path, overrides: &ConfigOverrides) -> CliResult<Self> {
        fs::create_dir_all(data_dir)?;
        let config = resolve_config(data_dir, overrides)?;
        let config_path = data_dir.join(CONFIG_FILE);
        if !config_path.exists() {
            config.save(&config_path)?;
        }

        let store = SledLedger::open(data_dir.join(LEDGER_DIR))?;
        let engine = Engine::open(
            config,
            Arc::new(store),
            Arc::new(NullBroadcaster),
            Arc::new(SystemClock),
        )?;

        Ok(Self {
            engine,
            data_dir: data_dir.to_path_buf(),
        })
    }
}

/// Whether `data_dir` already holds a chain
pub fn is_initialized(data_dir: &Path) -> bool {
    data_dir.join(CONFIG_FILE).exists() && data_dir.join(LEDGER_DIR).exists()
}

/// Initialize a new chain
pub async fn cmd_init(data_dir: &Path, overrides: &ConfigOverrides) -> CliResult<()> {
    if is_initialized(data_dir) {
        println!("⚠️  Ledger already exists at {:?}", data_dir);
        return Ok(());
    }

    let state = AppState::open(data_dir, overrides)?;
    state.engine.flush().await?;
    let stats = state.engine.chain_stats().await;
    let params = state.engine.get_mining_parameters().await;

    println!("✅ Ledger initialized!");
    println!("   📁 Data directory: {:?}", data_dir);
    println!("   🔧 Difficulty: {}", params.difficulty);
    println!("   🧱 Genesis block hash: {}", stats.latest_hash);
    println!("   💰 Genesis supply: {} coins", format_amount(stats.total_supply));

    Ok(())
}

/// Mine `count` blocks from the mempool
pub async fn cmd_mine(state: &AppState, address: &str, count: u32) -> CliResult<()> {
    println!("⛏️  Mining {} block(s) for address: {}", count, address);

    for _ in 0..count {
        let params = state.engine.get_mining_parameters().await;
        let Some((block, stats)) = state.engine.mine_block(address, usize::MAX).await? else {
            println!("   Mining interrupted, tip changed");
            continue;
        };

        println!("\n   Block {} mined!", block.index);
        println!("   ├─ Hash: {}", block.hash);
        println!("   ├─ Difficulty: {}", params.difficulty);
        println!("   ├─ Transactions: {}", block.tx_count());
        println!("   ├─ Subsidy: {} coins", format_amount(params.subsidy));
        println!("   ├─ Time: {}ms", stats.time_ms);
        println!("   ├─ Attempts: {}", stats.hash_attempts);
        println!("   └─ Hash rate: {:.2} H/s", stats.hash_rate);
    }
    state.engine.flush().await?;

    let balance = state.engine.get_balance(address).await;
    println!("\n💰 New balance for miner: {} coins", format_amount(balance));

    Ok(())
}

/// Display chain, mining, protection and mempool status
pub async fn cmd_status(state: &AppState) -> CliResult<()> {
    let stats = state.engine.chain_stats().await;
    let params = state.engine.get_mining_parameters().await;
    let security = state.engine.security_stats().await;
    let mempool = state.engine.mempool_stats().await;

    println!("⛓️  Ledger Info");
    println!("   ├─ Height: {}", stats.height);
    println!("   ├─ Total transactions: {}", stats.total_transactions);
    println!("   ├─ Total supply: {} coins", format_amount(stats.total_supply));
    println!("   ├─ Next difficulty: {}", params.difficulty);
    println!("   ├─ Next subsidy: {} coins", format_amount(params.subsidy));
    println!(
        "   ├─ Avg block time: {:.1}s (target {}s)",
        stats.block_times.average_block_time, stats.block_times.target_block_time
    );
    println!("   └─ Latest hash: {}", stats.latest_hash);

    println!("\n🛡️  Chain Protection");
    println!("   ├─ Checkpoints: {}", security.total_checkpoints);
    println!("   ├─ Last checkpoint: #{}", security.last_checkpoint_height);
    println!("   ├─ Max reorg depth: {}", security.max_reorg_depth);
    println!("   └─ Reorgs blocked: {}", security.reorg_attempts_blocked);

    println!("\n📝 Mempool");
    println!("   ├─ Pending: {}/{}", mempool.tx_count, mempool.capacity);
    println!("   └─ Total fees: {} coins", format_amount(mempool.total_fees));

    Ok(())
}

/// Show the confirmed balance of an address
pub async fn cmd_balance(state: &AppState, address: &str) -> CliResult<()> {
    let balance = state.engine.get_balance(address).await;
    println!("💰 Balance for {}", address);
    println!("   Total: {} coins", format_amount(balance));
    Ok(())
}

/// Re-verify the stored chain from genesis
pub async fn cmd_verify(state: &AppState) -> CliResult<()> {
    println!("🔍 Validating ledger...");
    match state.engine.verify_chain().await {
        Ok(()) => {
            println!("✅ Ledger is valid! ({} blocks)", state.engine.height().await + 1);
            Ok(())
        }
        Err(e) => {
            println!("❌ Ledger is INVALID: {}", e);
            Err(e.into())
        }
    }
}

/// Print a fresh key pair
pub fn cmd_keygen() -> CliResult<()> {
    let key_pair = KeyPair::generate();
    println!("🔐 New key pair");
    println!("   📍 Address: {}", key_pair.address());
    println!("   🔑 Public key: {}", key_pair.public_key_hex());
    println!("   🗝️  Private key: {}", key_pair.private_key_hex());
    println!("\n   ⚠️  Keep the private key secret; it controls the address.");
    Ok(())
}
