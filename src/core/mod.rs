//! Core ledger components
//!
//! This module contains the fundamental building blocks:
//! - Transactions (account model, signed, replay-protected by txid)
//! - Transaction validation (structure, timestamp, signature, fee, balance)
//! - Blocks (with proof of work and merkle commitment)
//! - Difficulty adjustment and the reward/fee schedule
//! - Blockchain (validation pipeline, commits, reorganization)
//! - Chain state (side branches and cumulative work)

pub mod block;
pub mod blockchain;
pub mod chain_state;
pub mod difficulty;
pub mod reward;
pub mod transaction;
pub mod validation;

pub use block::{Block, BlockError, BlockHeader, GENESIS_PREVIOUS_HASH};
pub use blockchain::{
    BlockAccepted, BlockState, Blockchain, ChainStats, MiningParameters, ReorgSummary,
    VerifiedBlock,
};
pub use chain_state::{calculate_work, cumulative_work, Branch, SideBranchPool};
pub use difficulty::{BlockTimeStats, DifficultyAdjuster};
pub use reward::RewardSchedule;
pub use transaction::{
    make_txid, Amount, Sender, Transaction, TransactionBuilder, TransactionError, COIN,
    COINBASE_SENDER, GENESIS_SIGNATURE, MINERS_POOL_SENDER,
};
pub use validation::{
    check_structure, verify_signatures_parallel, LedgerView, ScratchView, TransactionValidator,
    ValidationRules,
};
