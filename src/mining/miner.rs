//! Mining engine for the ledger
//!
//! Assembles candidate blocks from mempool transactions plus the payout
//! transactions of the reward schedule, and searches for proof of work.
//! The search can be cancelled when a peer block changes the tip.

use crate::core::{
    Block, BlockError, Blockchain, LedgerView, MiningParameters, ScratchView, Transaction,
};
use log::{debug, info};
use std::time::Instant;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

/// Mining statistics
#[derive(Debug, Clone)]
pub struct MiningStats {
    /// Number of hash attempts
    pub hash_attempts: u64,
    /// Time taken in milliseconds
    pub time_ms: u128,
    /// Hash rate (hashes per second)
    pub hash_rate: f64,
}

/// An unmined block plus the pooled transactions left out of it
#[derive(Debug, Clone)]
pub struct Candidate {
    pub block: Block,
    /// Pending transactions that no longer validate against the tip
    pub rejected: Vec<String>,
}

/// Miner for creating new blocks
#[derive(Debug, Clone)]
pub struct Miner {
    /// Miner's address for receiving subsidy and fees
    pub address: String,
}

impl Miner {
    /// Create a new miner
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
        }
    }

    /// Build the next block on `chain`'s tip: coinbase first, then every
    /// pending transaction that still validates, then the fee payout
    pub fn assemble(&self, chain: &Blockchain, pending: Vec<Transaction>, now: i64) -> Candidate {
        let MiningParameters {
            difficulty,
            height,
            prev_hash,
            ..
        } = chain.mining_parameters();
        let timestamp = now.max(chain.tip().header.timestamp);

        let known = |txid: &str| chain.contains_txid(txid);
        let mut scratch = ScratchView::new(chain.balances(), &known);
        let mut included = Vec::with_capacity(pending.len());
        let mut rejected = Vec::new();
        let mut fees: u64 = 0;

        for tx in pending {
            if tx.is_system() || scratch.contains_txid(&tx.txid) {
                rejected.push(tx.txid);
                continue;
            }
            let outcome = chain
                .validator()
                .validate(&tx, timestamp, &scratch)
                .and_then(|_| scratch.apply(&tx));
            match outcome {
                Ok(()) => {
                    fees = fees.saturating_add(tx.fee);
                    included.push(tx);
                }
                Err(e) => {
                    debug!("Leaving tx {} out of block {}: {}", tx.short_id(), height, e);
                    rejected.push(tx.txid);
                }
            }
        }

        let (coinbase, payout) =
            chain
                .rewards()
                .payout_transactions(&self.address, height, fees, timestamp);
        let mut transactions = Vec::with_capacity(included.len() + 2);
        transactions.push(coinbase);
        transactions.extend(included);
        transactions.extend(payout);

        Candidate {
            block: Block::new(height, prev_hash, transactions, difficulty, timestamp),
            rejected,
        }
    }

    /// Search for proof of work. Returns `None` if cancelled.
    pub fn mine(&self, mut block: Block, cancel: &CancellationToken) -> Option<(Block, MiningStats)> {
        let start = Instant::now();
        info!(
            "Mining block {} with difficulty {}...",
            block.index, block.header.difficulty
        );

        let Some(attempts) = block.mine_cancellable(cancel) else {
            info!("Mining of block {} cancelled", block.index);
            return None;
        };

        let elapsed = start.elapsed().as_millis();
        let hash_rate = if elapsed > 0 {
            (attempts as f64) / (elapsed as f64 / 1000.0)
        } else {
            attempts as f64
        };

        info!(
            "Block {} mined in {}ms ({} attempts, {:.2} H/s)",
            block.index, elapsed, attempts, hash_rate
        );

        Some((
            block,
            MiningStats {
                hash_attempts: attempts,
                time_ms: elapsed,
                hash_rate,
            },
        ))
    }

    /// Run [`mine`](Self::mine) on the blocking thread pool so the search
    /// does not hold any lock or stall the runtime
    pub async fn mine_detached(
        &self,
        block: Block,
        cancel: CancellationToken,
    ) -> Result<Option<(Block, MiningStats)>, JoinError> {
        let miner = self.clone();
        tokio::task::spawn_blocking(move || miner.mine(block, &cancel)).await
    }

    /// Assemble, mine and commit one block synchronously
    pub fn mine_block(
        &self,
        chain: &mut Blockchain,
        pending: Vec<Transaction>,
        now: i64,
    ) -> Result<(Block, MiningStats), BlockError> {
        let candidate = self.assemble(chain, pending, now);
        let never = CancellationToken::new();
        let (block, stats) = self.mine(candidate.block, &never).ok_or_else(|| {
            BlockError::ProofOfWorkInvalid("mining stopped without a solution".to_string())
        })?;
        chain.add_block(block.clone(), now)?;
        Ok((block, stats))
    }
}
