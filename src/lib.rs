//! POUV chain: a proof-of-work ledger core with universal validation
//!
//! Every node re-validates every transaction ("proof of universal
//! validation"). This crate provides:
//! - Account-model transactions signed with ECDSA (secp256k1)
//! - A fee-ordered mempool with capacity, expiry and pending-debit tracking
//! - Block validation: linkage, proof of work, transactions, reward/fee payouts
//! - Interval-based difficulty adjustment and a halving subsidy schedule
//! - Checkpoints and a bounded-depth, most-work reorganization rule
//! - A sled-backed ledger store with atomic block commits
//!
//! # Example
//!
//! ```rust
//! use pouv_chain::config::ChainConfig;
//! use pouv_chain::core::Blockchain;
//! use pouv_chain::mining::Miner;
//!
//! let config = ChainConfig {
//!     initial_difficulty: 1,
//!     ..Default::default()
//! };
//! let now = 1_700_000_000;
//! let mut chain = Blockchain::in_memory(config, now).unwrap();
//!
//! let miner = Miner::new("1miner");
//! let (block, stats) = miner.mine_block(&mut chain, vec![], now + 60).unwrap();
//! println!("Mined block {} in {}ms", block.index, stats.time_ms);
//! assert_eq!(chain.height(), 1);
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod crypto;
pub mod mining;
pub mod network;
pub mod node;
pub mod storage;

// Re-export commonly used types
pub use config::{ChainConfig, ConfigError, PastCapPolicy};
pub use core::{
    Amount, Block, BlockAccepted, BlockError, Blockchain, MiningParameters, ReorgSummary, Sender,
    Transaction, TransactionBuilder, TransactionError, COIN,
};
pub use crypto::KeyPair;
pub use mining::{Mempool, MempoolError, Miner};
pub use network::{BlockBroadcaster, ChannelBroadcaster, NullBroadcaster};
pub use node::{Clock, Engine, ManualClock, PendingOrder, SystemClock};
pub use storage::{ChainProtection, LedgerStore, MemoryLedger, SledLedger, StorageError};
