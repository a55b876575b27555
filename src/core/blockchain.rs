//! Blockchain implementation
//!
//! Owns the active chain, the derived balance state and the txid index, and
//! moves blocks through `Candidate → Verified → Committed | Rejected`.
//! Validation never mutates state; a [`VerifiedBlock`] is the only way to
//! reach [`Blockchain::commit`], and a commit lands in the ledger store as a
//! single atomic write.

use crate::config::ChainConfig;
use crate::core::block::{Block, BlockError, GENESIS_PREVIOUS_HASH};
use crate::core::chain_state::{calculate_work, cumulative_work, Branch, SideBranchPool};
use crate::core::difficulty::{BlockTimeStats, DifficultyAdjuster};
use crate::core::reward::RewardSchedule;
use crate::core::transaction::{Amount, TransactionError};
use crate::core::validation::{verify_signatures_parallel, ScratchView, TransactionValidator};
use crate::storage::{
    BalanceDelta, ChainProtection, LedgerStore, SecurityAlert, SecurityStats, TipRef,
    ValidationRecord, Verdict,
};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Lifecycle of a block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockState {
    /// Received, not yet checked (includes side-branch blocks)
    Candidate,
    /// Passed every check against its parent state
    Verified,
    /// Part of the active chain
    Committed,
    /// Failed validation
    Rejected,
}

/// A block that passed validation on top of a specific parent
#[derive(Debug, Clone)]
pub struct VerifiedBlock {
    block: Block,
    delta: BalanceDelta,
    parent_hash: String,
}

impl VerifiedBlock {
    pub fn block(&self) -> &Block {
        &self.block
    }

    pub fn state(&self) -> BlockState {
        BlockState::Verified
    }
}

/// Outcome of submitting a block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockAccepted {
    /// Appended to the active chain
    Extended { height: u64 },
    /// Stored on a side branch that does not (yet) outweigh the active chain
    SideBranch { height: u64 },
    /// Triggered a reorganization onto a heavier branch
    Reorganized(ReorgSummary),
}

/// What a reorganization changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorgSummary {
    pub ancestor_height: u64,
    /// Blocks unwound from the old chain
    pub depth: u64,
    pub old_tip_hash: String,
    pub new_tip_hash: String,
    pub new_height: u64,
    /// Blocks removed from the active chain, in height order
    pub disconnected: Vec<Block>,
}

/// Inputs a miner needs for the next block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MiningParameters {
    pub difficulty: u32,
    /// Height of the block to be mined
    pub height: u64,
    pub prev_hash: String,
    pub subsidy: Amount,
}

/// Chain statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainStats {
    pub height: u64,
    pub total_blocks: u64,
    pub total_transactions: u64,
    pub total_supply: Amount,
    pub next_difficulty: u32,
    pub latest_hash: String,
    pub chain_work: u128,
    pub block_times: BlockTimeStats,
}

/// Balances, txids and work derived by replaying blocks
struct ReplayState {
    balances: HashMap<String, Amount>,
    tx_index: HashMap<String, u64>,
    work: u128,
}

/// The active chain and everything derived from it
pub struct Blockchain {
    config: ChainConfig,
    blocks: Vec<Block>,
    balances: HashMap<String, Amount>,
    /// txid → committing height
    tx_index: HashMap<String, u64>,
    chain_work: u128,
    validator: TransactionValidator,
    adjuster: DifficultyAdjuster,
    rewards: RewardSchedule,
    protection: ChainProtection,
    side_branches: SideBranchPool,
    rejected: HashSet<String>,
    store: Arc<dyn LedgerStore>,
}

impl Blockchain {
    /// Open the chain held by `store`, creating the genesis block when the
    /// store is empty. A non-empty store is fully re-verified.
    pub fn open(
        config: ChainConfig,
        store: Arc<dyn LedgerStore>,
        now: i64,
    ) -> Result<Self, BlockError> {
        let mut chain = Self {
            validator: TransactionValidator::new((&config).into()),
            adjuster: DifficultyAdjuster::from(&config),
            rewards: RewardSchedule::from(&config),
            protection: ChainProtection::from_config(&config),
            config,
            blocks: Vec::new(),
            balances: HashMap::new(),
            tx_index: HashMap::new(),
            chain_work: 0,
            side_branches: SideBranchPool::new(),
            rejected: HashSet::new(),
            store,
        };

        let stored = chain.store.load_blocks()?;
        if stored.is_empty() {
            let genesis = Block::genesis(
                &chain.config.genesis_address,
                chain.config.genesis_allocation,
                chain.adjuster.difficulty_for_height(&[], 0),
                chain.config.genesis_timestamp.unwrap_or(now),
            );
            info!("Creating genesis block {}", genesis.hash);
            let verified = chain.validate_next(&genesis, now)?;
            chain.commit(verified)?;
            return Ok(chain);
        }

        let replay = chain.replay(&stored, now)?;
        if replay.balances != chain.store.balances()? {
            warn!("Stored balances disagree with chain replay; using replayed balances");
        }
        chain.balances = replay.balances;
        chain.tx_index = replay.tx_index;
        chain.chain_work = replay.work;
        chain.blocks = stored;

        chain.protection.load_from(chain.store.as_ref())?;
        for block in &chain.blocks {
            chain
                .protection
                .record(block.index, &block.hash, chain.store.as_ref())?;
        }

        info!(
            "Loaded chain: height {}, tip {}",
            chain.height(),
            chain.tip().hash
        );
        Ok(chain)
    }

    /// Fresh chain on an in-memory store
    pub fn in_memory(config: ChainConfig, now: i64) -> Result<Self, BlockError> {
        Self::open(config, Arc::new(crate::storage::MemoryLedger::new()), now)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn validator(&self) -> &TransactionValidator {
        &self.validator
    }

    pub fn rewards(&self) -> &RewardSchedule {
        &self.rewards
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    /// Get the latest block
    pub fn tip(&self) -> &Block {
        // `open` always leaves at least the genesis block in place
        &self.blocks[self.blocks.len() - 1]
    }

    /// Get blockchain height
    pub fn height(&self) -> u64 {
        self.tip().index
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Get a block by index
    pub fn get_block(&self, index: u64) -> Option<&Block> {
        self.blocks.get(index as usize)
    }

    /// Confirmed balance of an address
    pub fn balance(&self, address: &str) -> Amount {
        self.balances.get(address).copied().unwrap_or(0)
    }

    pub fn balances(&self) -> &HashMap<String, Amount> {
        &self.balances
    }

    /// Whether a txid is in committed history
    pub fn contains_txid(&self, txid: &str) -> bool {
        self.tx_index.contains_key(txid)
    }

    /// Height of the block that committed `txid`
    pub fn transaction_height(&self, txid: &str) -> Option<u64> {
        self.tx_index.get(txid).copied()
    }

    pub fn chain_work(&self) -> u128 {
        self.chain_work
    }

    /// Difficulty required for the next block
    pub fn next_difficulty(&self) -> u32 {
        self.adjuster
            .difficulty_for_height(&self.blocks, self.height() + 1)
    }

    pub fn mining_parameters(&self) -> MiningParameters {
        let height = self.height() + 1;
        MiningParameters {
            difficulty: self.next_difficulty(),
            height,
            prev_hash: self.tip().hash.clone(),
            subsidy: self.rewards.subsidy(height),
        }
    }

    /// Where a block currently stands, `None` if never seen
    pub fn block_state(&self, block: &Block) -> Option<BlockState> {
        if self.get_block(block.index).is_some_and(|b| b.hash == block.hash) {
            Some(BlockState::Committed)
        } else if self.rejected.contains(&block.hash) {
            Some(BlockState::Rejected)
        } else if self.side_branches.get(&block.hash).is_some() {
            Some(BlockState::Candidate)
        } else {
            None
        }
    }

    pub fn security_stats(&self) -> SecurityStats {
        self.protection.security_stats()
    }

    pub fn security_alerts(&self) -> &[SecurityAlert] {
        self.protection.alerts()
    }

    pub fn stats(&self) -> ChainStats {
        let total_transactions = self.blocks.iter().map(|b| b.transactions.len() as u64).sum();
        ChainStats {
            height: self.height(),
            total_blocks: self.blocks.len() as u64,
            total_transactions,
            total_supply: self.balances.values().fold(0, |acc: Amount, b| acc.saturating_add(*b)),
            next_difficulty: self.next_difficulty(),
            latest_hash: self.tip().hash.clone(),
            chain_work: self.chain_work,
            block_times: self.adjuster.block_time_stats(&self.blocks, 100),
        }
    }

    // =========================================================================
    // Validation
    // =========================================================================

    /// Candidate → Verified against the current tip
    pub fn validate_next(&self, block: &Block, now: i64) -> Result<VerifiedBlock, BlockError> {
        let known = |txid: &str| self.tx_index.contains_key(txid);
        let delta = self.validate_on(&self.blocks, &self.balances, &known, block, now)?;
        Ok(VerifiedBlock {
            block: block.clone(),
            delta,
            parent_hash: block.header.previous_hash.clone(),
        })
    }

    /// Validate `block` as the successor of `ancestors` whose derived state is
    /// `balances` and `known`
    fn validate_on(
        &self,
        ancestors: &[Block],
        balances: &HashMap<String, Amount>,
        known: &dyn Fn(&str) -> bool,
        block: &Block,
        now: i64,
    ) -> Result<BalanceDelta, BlockError> {
        // 1. Linkage
        match ancestors.last() {
            Some(parent) => {
                if block.index != parent.index + 1 || block.header.previous_hash != parent.hash {
                    return Err(BlockError::ChainLinkageMismatch {
                        tip_index: parent.index,
                        tip_hash: parent.hash.clone(),
                        got_index: block.index,
                        got_previous: block.header.previous_hash.clone(),
                    });
                }
                if block.header.timestamp < parent.header.timestamp {
                    return Err(BlockError::ProofOfWorkInvalid(format!(
                        "block {} timestamp {} precedes parent {}",
                        block.index, block.header.timestamp, parent.header.timestamp
                    )));
                }
            }
            None => {
                if block.index != 0 || block.header.previous_hash != GENESIS_PREVIOUS_HASH {
                    return Err(BlockError::ChainLinkageMismatch {
                        tip_index: 0,
                        tip_hash: GENESIS_PREVIOUS_HASH.to_string(),
                        got_index: block.index,
                        got_previous: block.header.previous_hash.clone(),
                    });
                }
            }
        }

        // 2. Proof of work
        if block.header.timestamp > now.saturating_add(self.config.max_future_block_time) {
            return Err(BlockError::ProofOfWorkInvalid(format!(
                "block {} timestamp {} too far in the future",
                block.index, block.header.timestamp
            )));
        }
        let expected_difficulty = self.adjuster.difficulty_for_height(ancestors, block.index);
        block.verify_proof_of_work(expected_difficulty)?;

        // 3. Transactions
        let user_count = block.user_transactions().count();
        if user_count > self.config.max_block_transactions {
            return Err(BlockError::Malformed(format!(
                "block {} carries {} user transactions, limit {}",
                block.index, user_count, self.config.max_block_transactions
            )));
        }
        if let Some(txid) = block.duplicate_txid() {
            return Err(BlockError::InvalidTransaction {
                txid: txid.to_string(),
                source: TransactionError::Replay(txid.to_string()),
            });
        }

        let signatures = verify_signatures_parallel(&block.transactions);
        let mut scratch = ScratchView::new(balances, known);
        for (tx, signature) in block.transactions.iter().zip(signatures) {
            let reject = |source: TransactionError| BlockError::InvalidTransaction {
                txid: tx.txid.clone(),
                source,
            };
            self.validator
                .validate_presigned(tx, block.header.timestamp, &scratch, signature)
                .map_err(reject)?;
            scratch.apply(tx).map_err(reject)?;
        }

        // 4. Rewards
        if block.index == 0 {
            if block.transactions.len() != 1 || !block.transactions[0].is_coinbase() {
                return Err(BlockError::Malformed(
                    "genesis must hold exactly one allocation transaction".to_string(),
                ));
            }
        } else {
            self.rewards.verify_block_rewards(block)?;
        }

        Ok(scratch.into_delta())
    }

    // =========================================================================
    // Commit
    // =========================================================================

    /// Verified → Committed
    pub fn commit(&mut self, verified: VerifiedBlock) -> Result<u64, BlockError> {
        let VerifiedBlock {
            block,
            delta,
            parent_hash,
        } = verified;

        let expected_parent = match self.blocks.last() {
            Some(tip) => tip.hash.as_str(),
            None => GENESIS_PREVIOUS_HASH,
        };
        if parent_hash != expected_parent {
            return Err(BlockError::ChainLinkageMismatch {
                tip_index: self.blocks.last().map(|b| b.index).unwrap_or(0),
                tip_hash: expected_parent.to_string(),
                got_index: block.index,
                got_previous: parent_hash,
            });
        }

        self.store.append_block(&block, &delta)?;

        for (address, balance) in delta.balances {
            self.balances.insert(address, balance);
        }
        for tx in &block.transactions {
            self.tx_index.insert(tx.txid.clone(), block.index);
        }
        self.chain_work = self
            .chain_work
            .saturating_add(calculate_work(block.header.difficulty));
        self.record_validations(&block);
        self.protection
            .record(block.index, &block.hash, self.store.as_ref())?;

        info!(
            "Block #{} committed: {} txs, difficulty {}, hash {}",
            block.index,
            block.transactions.len(),
            block.header.difficulty,
            block.hash
        );

        let height = block.index;
        self.side_branches.remove(&block.hash);
        self.blocks.push(block);
        self.prune_unreachable_side_blocks();
        Ok(height)
    }

    /// Validate and commit a block extending the tip
    pub fn add_block(&mut self, block: Block, now: i64) -> Result<u64, BlockError> {
        match self.validate_next(&block, now) {
            Ok(verified) => self.commit(verified),
            Err(e) => {
                self.mark_rejected(&block, &e);
                Err(e)
            }
        }
    }

    /// Side blocks this far below the tip could only win through a reorg
    /// deeper than the protection allows
    fn prune_unreachable_side_blocks(&mut self) {
        let floor = self.height().saturating_sub(self.config.max_reorg_depth);
        if floor > 0 {
            self.side_branches.prune_below(floor);
        }
    }

    fn mark_rejected(&mut self, block: &Block, error: &BlockError) {
        // Linkage problems say nothing about the block itself
        if !matches!(error, BlockError::ChainLinkageMismatch { .. } | BlockError::Storage(_)) {
            warn!("Block #{} {} rejected: {}", block.index, block.hash, error);
            self.rejected.insert(block.hash.clone());
        }
    }

    fn record_validations(&self, block: &Block) {
        let validated_at = block.header.timestamp;
        for tx in block.user_transactions() {
            let record = ValidationRecord {
                txid: tx.txid.clone(),
                verdict: Verdict::Valid,
                reason: None,
                block_height: Some(block.index),
                validated_at,
            };
            if let Err(e) = self.store.put_validation_record(&record) {
                warn!("Failed to persist validation record {}: {}", tx.short_id(), e);
            }
        }
    }

    // =========================================================================
    // Forks and reorganization
    // =========================================================================

    /// Accept a block from a peer: extend the tip, park it on a side branch,
    /// or reorganize when its branch outweighs the active chain
    pub fn submit_block(&mut self, block: Block, now: i64) -> Result<BlockAccepted, BlockError> {
        if self.rejected.contains(&block.hash) {
            return Err(BlockError::Malformed(format!(
                "block {} was already rejected",
                block.hash
            )));
        }
        if self.block_state(&block) == Some(BlockState::Committed) {
            return Err(BlockError::Malformed(format!(
                "block {} is already committed",
                block.hash
            )));
        }

        match self.validate_next(&block, now) {
            Ok(verified) => {
                let height = self.commit(verified)?;
                Ok(BlockAccepted::Extended { height })
            }
            Err(BlockError::ChainLinkageMismatch { .. }) if block.index > 0 => {
                debug!("Block #{} {} does not extend tip", block.index, block.hash);
                self.accept_side_block(block, now)
            }
            Err(e) => {
                self.mark_rejected(&block, &e);
                Err(e)
            }
        }
    }

    fn accept_side_block(&mut self, block: Block, now: i64) -> Result<BlockAccepted, BlockError> {
        if !block.verify_hash() || !block.verify_merkle_root() || !block.is_valid_pow() {
            let err = BlockError::ProofOfWorkInvalid(format!(
                "side block {} fails its own proof of work",
                block.hash
            ));
            self.mark_rejected(&block, &err);
            return Err(err);
        }

        let parent_height = block.index - 1;
        let parent_on_chain = self
            .get_block(parent_height)
            .is_some_and(|b| b.hash == block.header.previous_hash);
        if !parent_on_chain && self.side_branches.get(&block.header.previous_hash).is_none() {
            let tip = self.tip();
            return Err(BlockError::ChainLinkageMismatch {
                tip_index: tip.index,
                tip_hash: tip.hash.clone(),
                got_index: block.index,
                got_previous: block.header.previous_hash.clone(),
            });
        }

        // Off a committed parent the difficulty is known exactly; deeper in a
        // side branch it is checked in full before any reorg
        let declared = block.header.difficulty;
        let difficulty_ok = if parent_on_chain {
            let expected = self
                .adjuster
                .difficulty_for_height(&self.blocks[..block.index as usize], block.index);
            declared == expected
        } else {
            declared >= self.config.min_difficulty
        };
        if !difficulty_ok {
            let err = BlockError::ProofOfWorkInvalid(format!(
                "side block {} declares difficulty {} below what its parent requires",
                block.hash, declared
            ));
            self.mark_rejected(&block, &err);
            return Err(err);
        }

        let height = block.index;
        let hash = block.hash.clone();
        self.side_branches.prune(now);
        self.side_branches.insert(block, now);

        let Some(branch) = self.side_branches.assemble_branch(&hash, &self.blocks) else {
            return Ok(BlockAccepted::SideBranch { height });
        };

        let prefix_end = branch.ancestor_height as usize + 1;
        let branch_work = cumulative_work(&self.blocks[..prefix_end])
            .saturating_add(cumulative_work(&branch.blocks));
        if branch_work <= self.chain_work {
            debug!(
                "Side branch at #{} has work {} vs active {}",
                height, branch_work, self.chain_work
            );
            return Ok(BlockAccepted::SideBranch { height });
        }

        let branch_hashes: Vec<String> = branch.blocks.iter().map(|b| b.hash.clone()).collect();
        let result = self.reorganize(branch, now);
        for hash in &branch_hashes {
            self.side_branches.remove(hash);
        }
        result.map(BlockAccepted::Reorganized)
    }

    /// Replace the active chain with a heavier alternate chain. `blocks`
    /// must be contiguous; any prefix identical to the active chain is
    /// skipped.
    pub fn submit_chain(&mut self, blocks: Vec<Block>, now: i64) -> Result<ReorgSummary, BlockError> {
        for pair in blocks.windows(2) {
            if pair[1].index != pair[0].index + 1 || pair[1].header.previous_hash != pair[0].hash {
                return Err(BlockError::Malformed(format!(
                    "alternate chain breaks between #{} and #{}",
                    pair[0].index, pair[1].index
                )));
            }
        }

        let fork_at = blocks
            .iter()
            .position(|b| self.get_block(b.index).map(|ours| &ours.hash) != Some(&b.hash));
        let Some(fork_at) = fork_at else {
            return Err(BlockError::InsufficientWork {
                current: self.chain_work,
                candidate: self.chain_work,
            });
        };

        let new_blocks = blocks[fork_at..].to_vec();
        let first = &new_blocks[0];
        if first.index == 0 {
            return Err(BlockError::Malformed(
                "alternate chain has a different genesis block".to_string(),
            ));
        }
        let ancestor_height = first.index - 1;
        if self
            .get_block(ancestor_height)
            .map_or(true, |b| b.hash != first.header.previous_hash)
        {
            let tip = self.tip();
            return Err(BlockError::ChainLinkageMismatch {
                tip_index: tip.index,
                tip_hash: tip.hash.clone(),
                got_index: first.index,
                got_previous: first.header.previous_hash.clone(),
            });
        }

        self.reorganize(
            Branch {
                ancestor_height,
                blocks: new_blocks,
            },
            now,
        )
    }

    fn reorganize(&mut self, branch: Branch, now: i64) -> Result<ReorgSummary, BlockError> {
        let Branch {
            ancestor_height,
            blocks: new_blocks,
        } = branch;
        let Some(new_tip) = new_blocks.last().cloned() else {
            return Err(BlockError::Malformed("empty branch".to_string()));
        };
        let old_tip = self.tip().clone();

        self.protection
            .validate_against_checkpoints(TipRef::from(&old_tip), &new_blocks, now)?;
        self.protection.check_reorg(
            TipRef::from(&old_tip),
            TipRef::from(&new_tip),
            ancestor_height,
            now,
        )?;

        let prefix_end = ancestor_height as usize + 1;
        let new_work = cumulative_work(&self.blocks[..prefix_end])
            .saturating_add(cumulative_work(&new_blocks));
        if new_work <= self.chain_work {
            return Err(BlockError::InsufficientWork {
                current: self.chain_work,
                candidate: new_work,
            });
        }

        // Rebuild state at the fork point, then validate the branch on it
        let mut state = self.replay(&self.blocks[..prefix_end], now)?;
        let mut working: Vec<Block> = self.blocks[..prefix_end].to_vec();
        for block in &new_blocks {
            let delta = {
                let known = |txid: &str| state.tx_index.contains_key(txid);
                self.validate_on(&working, &state.balances, &known, block, now)
            };
            let delta = match delta {
                Ok(delta) => delta,
                Err(e) => {
                    self.mark_rejected(block, &e);
                    return Err(e);
                }
            };
            state.balances.extend(delta.balances);
            for tx in &block.transactions {
                state.tx_index.insert(tx.txid.clone(), block.index);
            }
            working.push(block.clone());
        }

        self.store
            .replace_suffix(ancestor_height + 1, &new_blocks, &state.balances)?;

        let disconnected = self.blocks.split_off(prefix_end);
        for block in &new_blocks {
            self.record_validations(block);
        }
        self.blocks.extend(new_blocks);
        self.balances = state.balances;
        self.tx_index = state.tx_index;
        self.chain_work = new_work;
        for block in &self.blocks[prefix_end..] {
            self.protection
                .record(block.index, &block.hash, self.store.as_ref())?;
        }
        self.prune_unreachable_side_blocks();

        let summary = ReorgSummary {
            ancestor_height,
            depth: old_tip.index - ancestor_height,
            old_tip_hash: old_tip.hash,
            new_tip_hash: new_tip.hash,
            new_height: new_tip.index,
            disconnected,
        };
        warn!(
            "Chain reorganized at #{}: unwound {} blocks, new tip #{} {}",
            summary.ancestor_height, summary.depth, summary.new_height, summary.new_tip_hash
        );
        Ok(summary)
    }

    // =========================================================================
    // Full verification
    // =========================================================================

    /// Validate `blocks` from genesis and derive their state
    fn replay(&self, blocks: &[Block], now: i64) -> Result<ReplayState, BlockError> {
        let mut state = ReplayState {
            balances: HashMap::new(),
            tx_index: HashMap::new(),
            work: 0,
        };

        for (i, block) in blocks.iter().enumerate() {
            let delta = {
                let known = |txid: &str| state.tx_index.contains_key(txid);
                self.validate_on(&blocks[..i], &state.balances, &known, block, now)?
            };
            state.balances.extend(delta.balances);
            for tx in &block.transactions {
                state.tx_index.insert(tx.txid.clone(), block.index);
            }
            state.work = state
                .work
                .saturating_add(calculate_work(block.header.difficulty));
        }

        Ok(state)
    }

    /// Re-verify the whole active chain from genesis
    pub fn verify_chain(&self, now: i64) -> Result<(), BlockError> {
        let state = self.replay(&self.blocks, now)?;
        if state.balances != self.balances {
            return Err(BlockError::Malformed(
                "replayed balances differ from current state".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transaction::{Transaction, TransactionBuilder, COIN};
    use crate::crypto::KeyPair;

    const T0: i64 = 1_700_000_000;

    fn test_config(genesis_address: &str) -> ChainConfig {
        ChainConfig {
            initial_difficulty: 1,
            genesis_address: genesis_address.to_string(),
            genesis_allocation: 1_000 * COIN,
            genesis_timestamp: Some(T0),
            ..Default::default()
        }
    }

    /// Mine a block on `chain`'s tip carrying `txs`
    fn next_block(chain: &Blockchain, miner: &str, txs: Vec<Transaction>, timestamp: i64) -> Block {
        let params = chain.mining_parameters();
        let fees: Amount = txs.iter().map(|tx| tx.fee).sum();
        let (coinbase, payout) =
            chain
                .rewards()
                .payout_transactions(miner, params.height, fees, timestamp);

        let mut all = vec![coinbase];
        all.extend(txs);
        all.extend(payout);

        let mut block = Block::new(params.height, params.prev_hash, all, params.difficulty, timestamp);
        block.mine();
        block
    }

    #[test]
    fn test_new_blockchain() {
        let chain = Blockchain::in_memory(test_config("1founder"), T0).unwrap();
        assert_eq!(chain.height(), 0);
        assert_eq!(chain.balance("1founder"), 1_000 * COIN);
        assert!(chain.verify_chain(T0).is_ok());
    }

    #[test]
    fn test_mine_block() {
        let mut chain = Blockchain::in_memory(test_config("1founder"), T0).unwrap();
        let block = next_block(&chain, "1miner", vec![], T0 + 60);

        assert_eq!(chain.add_block(block.clone(), T0 + 60).unwrap(), 1);
        assert_eq!(chain.balance("1miner"), 50 * COIN);
        assert_eq!(chain.block_state(&block), Some(BlockState::Committed));
    }

    #[test]
    fn test_transfer_with_fee_payout() {
        let alice = KeyPair::generate();
        let mut chain = Blockchain::in_memory(test_config(&alice.address()), T0).unwrap();

        let tx = TransactionBuilder::new(&alice)
            .to("1bob")
            .amount(10 * COIN)
            .fee(2 * COIN / 100)
            .timestamp(T0 + 30)
            .build_and_sign()
            .unwrap();
        let block = next_block(&chain, "1miner", vec![tx.clone()], T0 + 60);
        chain.add_block(block, T0 + 60).unwrap();

        assert_eq!(chain.balance(&alice.address()), 990 * COIN - 2 * COIN / 100);
        assert_eq!(chain.balance("1bob"), 10 * COIN);
        assert_eq!(chain.balance("1miner"), 50 * COIN + 2 * COIN / 100);
        assert_eq!(chain.transaction_height(&tx.txid), Some(1));
        assert_eq!(
            chain
                .store()
                .get_validation_record(&tx.txid)
                .unwrap()
                .map(|r| r.verdict),
            Some(Verdict::Valid)
        );
    }

    #[test]
    fn test_invalid_block_rejected() {
        let mut chain = Blockchain::in_memory(test_config("1founder"), T0).unwrap();

        let mut block = Block::new(
            1,
            "wrong_hash".to_string(),
            vec![Transaction::coinbase("1miner", 50 * COIN, T0)],
            1,
            T0 + 60,
        );
        block.mine();

        assert!(matches!(
            chain.add_block(block, T0 + 60),
            Err(BlockError::ChainLinkageMismatch { .. })
        ));
        assert_eq!(chain.height(), 0);
    }

    #[test]
    fn test_overspend_inside_block_rejected() {
        let alice = KeyPair::generate();
        let mut chain = Blockchain::in_memory(test_config(&alice.address()), T0).unwrap();

        let spend = |to: &str| {
            TransactionBuilder::new(&alice)
                .to(to)
                .amount(600 * COIN)
                .fee(COIN / 10)
                .timestamp(T0 + 10)
                .build_and_sign()
                .unwrap()
        };
        let block = next_block(&chain, "1miner", vec![spend("1bob"), spend("1carol")], T0 + 60);

        let err = chain.add_block(block.clone(), T0 + 60).unwrap_err();
        assert!(matches!(
            err,
            BlockError::InvalidTransaction {
                source: TransactionError::InsufficientBalance { .. },
                ..
            }
        ));
        assert_eq!(chain.balance(&alice.address()), 1_000 * COIN);
        assert_eq!(chain.block_state(&block), Some(BlockState::Rejected));
    }

    #[test]
    fn test_block_timestamp_before_parent_rejected() {
        let mut chain = Blockchain::in_memory(test_config("1founder"), T0).unwrap();
        let block = next_block(&chain, "1miner", vec![], T0 - 1);
        assert!(matches!(
            chain.add_block(block, T0),
            Err(BlockError::ProofOfWorkInvalid(_))
        ));
    }

    #[test]
    fn test_heavier_side_branch_reorganizes() {
        let mut chain = Blockchain::in_memory(test_config("1founder"), T0).unwrap();
        let mut fork = Blockchain::in_memory(test_config("1founder"), T0).unwrap();

        let ours = next_block(&chain, "1us", vec![], T0 + 60);
        chain.add_block(ours, T0 + 60).unwrap();

        let theirs_1 = next_block(&fork, "1them", vec![], T0 + 61);
        fork.add_block(theirs_1.clone(), T0 + 61).unwrap();
        let theirs_2 = next_block(&fork, "1them", vec![], T0 + 62);

        assert_eq!(
            chain.submit_block(theirs_1, T0 + 70).unwrap(),
            BlockAccepted::SideBranch { height: 1 }
        );
        let accepted = chain.submit_block(theirs_2.clone(), T0 + 70).unwrap();

        match accepted {
            BlockAccepted::Reorganized(summary) => {
                assert_eq!(summary.ancestor_height, 0);
                assert_eq!(summary.depth, 1);
                assert_eq!(summary.disconnected.len(), 1);
            }
            other => panic!("expected reorg, got {:?}", other),
        }
        assert_eq!(chain.tip().hash, theirs_2.hash);
        assert_eq!(chain.balance("1us"), 0);
        assert_eq!(chain.balance("1them"), 100 * COIN);
        assert!(chain.verify_chain(T0 + 70).is_ok());
    }

    #[test]
    fn test_block_transaction_limit() {
        let alice = KeyPair::generate();
        let config = ChainConfig {
            max_block_transactions: 1,
            ..test_config(&alice.address())
        };
        let mut chain = Blockchain::in_memory(config, T0).unwrap();

        let spend = || {
            TransactionBuilder::new(&alice)
                .to("1bob")
                .amount(COIN)
                .fee(COIN / 10)
                .timestamp(T0 + 10)
                .build_and_sign()
                .unwrap()
        };
        let block = next_block(&chain, "1miner", vec![spend(), spend()], T0 + 60);
        assert!(matches!(
            chain.add_block(block, T0 + 60),
            Err(BlockError::Malformed(_))
        ));

        let block = next_block(&chain, "1miner", vec![spend()], T0 + 60);
        assert!(chain.add_block(block, T0 + 60).is_ok());
    }

    #[test]
    fn test_side_block_below_required_difficulty_rejected() {
        let config = ChainConfig {
            initial_difficulty: 2,
            ..test_config("1founder")
        };
        let mut chain = Blockchain::in_memory(config, T0).unwrap();
        let genesis_hash = chain.tip().hash.clone();
        let ours = next_block(&chain, "1us", vec![], T0 + 60);
        chain.add_block(ours, T0 + 60).unwrap();

        let mut cheap = Block::new(
            1,
            genesis_hash,
            vec![Transaction::coinbase("1them", 50 * COIN, T0 + 61)],
            1,
            T0 + 61,
        );
        cheap.mine();

        assert!(matches!(
            chain.submit_block(cheap.clone(), T0 + 70),
            Err(BlockError::ProofOfWorkInvalid(_))
        ));
        assert_eq!(chain.block_state(&cheap), Some(BlockState::Rejected));
    }

    #[test]
    fn test_side_blocks_beyond_reorg_depth_are_dropped() {
        let config = ChainConfig {
            max_reorg_depth: 2,
            ..test_config("1founder")
        };
        let mut chain = Blockchain::in_memory(config.clone(), T0).unwrap();
        let fork = Blockchain::in_memory(config, T0).unwrap();

        let ours = next_block(&chain, "1us", vec![], T0 + 60);
        chain.add_block(ours, T0 + 60).unwrap();
        let theirs = next_block(&fork, "1them", vec![], T0 + 61);
        chain.submit_block(theirs.clone(), T0 + 61).unwrap();
        assert_eq!(chain.block_state(&theirs), Some(BlockState::Candidate));

        for i in 2..=3 {
            let block = next_block(&chain, "1us", vec![], T0 + 60 * i);
            chain.add_block(block, T0 + 60 * i).unwrap();
        }
        assert_eq!(chain.block_state(&theirs), None);
    }

    #[test]
    fn test_reopen_from_store() {
        let store: Arc<dyn LedgerStore> = Arc::new(crate::storage::MemoryLedger::new());
        let config = test_config("1founder");
        {
            let mut chain = Blockchain::open(config.clone(), store.clone(), T0).unwrap();
            let block = next_block(&chain, "1miner", vec![], T0 + 60);
            chain.add_block(block, T0 + 60).unwrap();
        }

        let chain = Blockchain::open(config, store, T0 + 120).unwrap();
        assert_eq!(chain.height(), 1);
        assert_eq!(chain.balance("1miner"), 50 * COIN);
    }
}
