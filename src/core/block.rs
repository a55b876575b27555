//! Block implementation for the ledger
//!
//! A block contains a header with metadata and a list of transactions.
//! The header commits to the transactions through the merkle root, and the
//! block hash covers the index and every header field.

use crate::core::transaction::{
    Amount, Sender, Transaction, TransactionError, GENESIS_SIGNATURE,
};
use crate::crypto::{calculate_merkle_root, meets_difficulty, sha256_hex};
use crate::storage::StorageError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Previous-hash value of the genesis block
pub const GENESIS_PREVIOUS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Nonces tried between cancellation checks
const CANCEL_CHECK_INTERVAL: u64 = 4096;

// =============================================================================
// Block Errors
// =============================================================================

/// Reasons a block or chain is rejected
#[derive(Error, Debug)]
pub enum BlockError {
    #[error("Block {got_index} does not extend tip {tip_index} ({tip_hash})")]
    ChainLinkageMismatch {
        tip_index: u64,
        tip_hash: String,
        got_index: u64,
        got_previous: String,
    },
    #[error("Invalid proof of work: {0}")]
    ProofOfWorkInvalid(String),
    #[error("Invalid transaction {txid}: {source}")]
    InvalidTransaction {
        txid: String,
        #[source]
        source: TransactionError,
    },
    #[error("Reward mismatch: {0}")]
    RewardMismatch(String),
    #[error("Checkpoint violation at height {height}: expected {expected}, got {got}")]
    CheckpointViolation {
        height: u64,
        expected: String,
        got: String,
    },
    #[error("Reorganization too deep: {depth} blocks (max {max_depth})")]
    ReorgTooDeep { depth: u64, max_depth: u64 },
    #[error("Insufficient cumulative work: candidate {candidate}, current {current}")]
    InsufficientWork { current: u128, candidate: u128 },
    #[error("Malformed block: {0}")]
    Malformed(String),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

// =============================================================================
// Header
// =============================================================================

/// Block header containing metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Hash of the previous block
    pub previous_hash: String,
    /// Merkle root over txids and signatures
    pub merkle_root: String,
    /// Unix seconds
    pub timestamp: i64,
    /// Required leading zero hex digits
    pub difficulty: u32,
    /// Nonce used for proof of work
    pub nonce: u64,
}

impl BlockHeader {
    /// Hash of the header at the given height
    pub fn hash(&self, index: u64) -> String {
        let fields = (
            index,
            &self.previous_hash,
            &self.merkle_root,
            self.timestamp,
            self.difficulty,
            self.nonce,
        );
        // Hashed as a JSON array so field boundaries are unambiguous
        sha256_hex(&serde_json::to_vec(&fields).unwrap_or_default())
    }
}

// =============================================================================
// Block
// =============================================================================

/// A block in the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Block index/height
    pub index: u64,
    pub header: BlockHeader,
    /// Block hash (cached)
    pub hash: String,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Create a new block (unmined)
    pub fn new(
        index: u64,
        previous_hash: String,
        transactions: Vec<Transaction>,
        difficulty: u32,
        timestamp: i64,
    ) -> Self {
        let header = BlockHeader {
            previous_hash,
            merkle_root: Self::calculate_merkle_root(&transactions),
            timestamp,
            difficulty,
            nonce: 0,
        };
        let hash = header.hash(index);

        Self {
            index,
            header,
            hash,
            transactions,
        }
    }

    /// Create and mine the genesis block carrying the initial allocation.
    /// Deterministic: the same parameters always give the same block.
    pub fn genesis(recipient: &str, allocation: Amount, difficulty: u32, timestamp: i64) -> Self {
        let mut allocation_tx =
            Transaction::with_nonce(Sender::Coinbase, recipient, allocation, 0, timestamp, 0);
        allocation_tx.signature = GENESIS_SIGNATURE.to_string();
        let mut block = Self::new(
            0,
            GENESIS_PREVIOUS_HASH.to_string(),
            vec![allocation_tx],
            difficulty,
            timestamp,
        );
        block.mine();
        block
    }

    /// Merkle root over every transaction's txid and signature
    pub fn calculate_merkle_root(transactions: &[Transaction]) -> String {
        let leaves: Vec<Vec<u8>> = transactions.iter().map(Transaction::leaf_hash).collect();
        hex::encode(calculate_merkle_root(&leaves))
    }

    /// Recompute the hash from the header
    pub fn calculate_hash(&self) -> String {
        self.header.hash(self.index)
    }

    /// Mine the block (find a valid nonce). Returns attempts made.
    pub fn mine(&mut self) -> u64 {
        let never = CancellationToken::new();
        self.mine_cancellable(&never).unwrap_or(u64::MAX)
    }

    /// Mine until a valid nonce is found or `cancel` fires.
    /// Returns the number of attempts, or `None` when cancelled.
    pub fn mine_cancellable(&mut self, cancel: &CancellationToken) -> Option<u64> {
        let mut attempts = 0u64;

        loop {
            if attempts % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
                return None;
            }

            self.header.nonce = attempts;
            self.hash = self.calculate_hash();

            if self.is_valid_pow() {
                return Some(attempts);
            }

            attempts = attempts.wrapping_add(1);
            if attempts == 0 {
                // Nonce space exhausted; bump the timestamp and start over
                self.header.timestamp += 1;
            }
        }
    }

    /// Check if the proof of work is valid
    pub fn is_valid_pow(&self) -> bool {
        meets_difficulty(&self.hash, self.header.difficulty)
    }

    /// Verify the block's merkle root
    pub fn verify_merkle_root(&self) -> bool {
        Self::calculate_merkle_root(&self.transactions) == self.header.merkle_root
    }

    /// Verify the block hash
    pub fn verify_hash(&self) -> bool {
        self.hash == self.calculate_hash()
    }

    /// Hash, merkle root and difficulty checks
    pub fn verify_proof_of_work(&self, expected_difficulty: u32) -> Result<(), BlockError> {
        if !self.verify_hash() {
            return Err(BlockError::ProofOfWorkInvalid(format!(
                "block {} hash does not match header",
                self.index
            )));
        }
        if !self.verify_merkle_root() {
            return Err(BlockError::ProofOfWorkInvalid(format!(
                "block {} merkle root does not match transactions",
                self.index
            )));
        }
        if self.header.difficulty != expected_difficulty {
            return Err(BlockError::ProofOfWorkInvalid(format!(
                "block {} declares difficulty {}, expected {}",
                self.index, self.header.difficulty, expected_difficulty
            )));
        }
        if !self.is_valid_pow() {
            return Err(BlockError::ProofOfWorkInvalid(format!(
                "block {} hash does not meet difficulty {}",
                self.index, self.header.difficulty
            )));
        }
        Ok(())
    }

    /// First txid that appears more than once in the block
    pub fn duplicate_txid(&self) -> Option<&str> {
        let mut seen = HashSet::with_capacity(self.transactions.len());
        self.transactions
            .iter()
            .map(|tx| tx.txid.as_str())
            .find(|txid| !seen.insert(*txid))
    }

    /// User transactions in block order
    pub fn user_transactions(&self) -> impl Iterator<Item = &Transaction> {
        self.transactions.iter().filter(|tx| !tx.is_system())
    }

    /// Sum of user fees, `None` on overflow
    pub fn total_fees(&self) -> Option<Amount> {
        self.user_transactions()
            .try_fold(0 as Amount, |acc, tx| acc.checked_add(tx.fee))
    }

    /// Get the coinbase transactions
    pub fn coinbase_txs(&self) -> Vec<&Transaction> {
        self.transactions.iter().filter(|tx| tx.is_coinbase()).collect()
    }

    /// Get the fee payout transactions
    pub fn fee_payout_txs(&self) -> Vec<&Transaction> {
        self.transactions
            .iter()
            .filter(|tx| tx.is_fee_payout())
            .collect()
    }

    /// Recipient of the block subsidy
    pub fn miner(&self) -> Option<&str> {
        self.transactions
            .iter()
            .find(|tx| tx.is_coinbase())
            .map(|tx| tx.recipient.as_str())
    }

    /// Get number of transactions in this block
    pub fn tx_count(&self) -> usize {
        self.transactions.len()
    }
}
