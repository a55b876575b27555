//! Chain state management
//!
//! Holds blocks that do not extend the active tip (side branches), measures
//! cumulative proof-of-work and assembles candidate branches back to the
//! point where they fork from the active chain.

use crate::core::block::Block;
use std::collections::HashMap;

/// Maximum number of side-branch blocks kept in memory
pub const MAX_SIDE_BLOCKS: usize = 100;

/// Seconds a side-branch block may wait before it is dropped
pub const SIDE_BLOCK_EXPIRE_TIME: i64 = 3600;

/// Work represented by one block: 16^difficulty, since each required zero
/// hex digit multiplies the expected search by 16
pub fn calculate_work(difficulty: u32) -> u128 {
    1u128 << (4 * difficulty.min(31))
}

/// Total work of a sequence of blocks
pub fn cumulative_work(blocks: &[Block]) -> u128 {
    blocks
        .iter()
        .map(|b| calculate_work(b.header.difficulty))
        .fold(0u128, u128::saturating_add)
}

/// A block waiting on a side branch
#[derive(Debug, Clone)]
pub struct SideBlock {
    pub block: Block,
    /// Unix seconds when the block arrived
    pub received_at: i64,
}

impl SideBlock {
    pub fn is_expired(&self, now: i64) -> bool {
        now - self.received_at > SIDE_BLOCK_EXPIRE_TIME
    }
}

/// A side branch that forks from the active chain
#[derive(Debug, Clone)]
pub struct Branch {
    /// Height of the last block shared with the active chain
    pub ancestor_height: u64,
    /// Branch blocks in height order, starting at `ancestor_height + 1`
    pub blocks: Vec<Block>,
}

/// Pool of blocks that do not extend the active tip
#[derive(Debug, Clone, Default)]
pub struct SideBranchPool {
    blocks: HashMap<String, SideBlock>,
}

impl SideBranchPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a block; returns false when it was already present
    pub fn insert(&mut self, block: Block, now: i64) -> bool {
        if self.blocks.contains_key(&block.hash) {
            return false;
        }
        if self.blocks.len() >= MAX_SIDE_BLOCKS {
            self.prune(now);
        }
        if self.blocks.len() >= MAX_SIDE_BLOCKS {
            // Still full: drop the lowest block, it is least likely to win
            if let Some(lowest) = self
                .blocks
                .values()
                .min_by_key(|s| s.block.index)
                .map(|s| s.block.hash.clone())
            {
                self.blocks.remove(&lowest);
            }
        }
        self.blocks.insert(
            block.hash.clone(),
            SideBlock {
                block,
                received_at: now,
            },
        );
        true
    }

    pub fn get(&self, hash: &str) -> Option<&Block> {
        self.blocks.get(hash).map(|s| &s.block)
    }

    pub fn remove(&mut self, hash: &str) -> Option<Block> {
        self.blocks.remove(hash).map(|s| s.block)
    }

    /// Remove expired blocks
    pub fn prune(&mut self, now: i64) -> usize {
        let before = self.blocks.len();
        self.blocks.retain(|_, side| !side.is_expired(now));
        before - self.blocks.len()
    }

    /// Drop side blocks at or below `height`; any branch through them
    /// forks too deep to be accepted
    pub fn prune_below(&mut self, height: u64) {
        self.blocks.retain(|_, side| side.block.index > height);
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Walk back from `tip_hash` through pooled blocks until reaching a
    /// block of `active`. Returns `None` when the branch is incomplete.
    pub fn assemble_branch(&self, tip_hash: &str, active: &[Block]) -> Option<Branch> {
        let mut blocks = Vec::new();
        let mut cursor = self.get(tip_hash)?;

        loop {
            blocks.push(cursor.clone());
            let parent_height = cursor.index.checked_sub(1)?;
            let on_active = active
                .get(parent_height as usize)
                .is_some_and(|b| b.hash == cursor.header.previous_hash);
            if on_active {
                blocks.reverse();
                return Some(Branch {
                    ancestor_height: parent_height,
                    blocks,
                });
            }
            let parent = self.get(&cursor.header.previous_hash)?;
            if parent.index != parent_height {
                return None;
            }
            cursor = parent;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(len: u64, salt: u64) -> Vec<Block> {
        let mut blocks: Vec<Block> = Vec::new();
        for i in 0..len {
            let prev = blocks
                .last()
                .map(|b| b.hash.clone())
                .unwrap_or_else(|| "0".repeat(64));
            let mut block = Block::new(i, prev, vec![], 1, 100 + i as i64);
            block.header.nonce = salt;
            block.hash = block.calculate_hash();
            blocks.push(block);
        }
        blocks
    }

    fn extend(parent: &Block, salt: u64) -> Block {
        let mut block = Block::new(
            parent.index + 1,
            parent.hash.clone(),
            vec![],
            1,
            parent.header.timestamp + 1,
        );
        block.header.nonce = salt;
        block.hash = block.calculate_hash();
        block
    }

    #[test]
    fn test_calculate_work() {
        assert_eq!(calculate_work(1), 16);
        assert_eq!(calculate_work(2), 256);
        assert!(calculate_work(10) > calculate_work(9));
        // Saturates instead of overflowing
        assert_eq!(calculate_work(64), calculate_work(31));
    }

    #[test]
    fn test_cumulative_work() {
        let blocks = chain(3, 0);
        assert_eq!(cumulative_work(&blocks), 48);
    }

    #[test]
    fn test_assemble_branch() {
        let active = chain(5, 0);
        let mut pool = SideBranchPool::new();

        let fork_a = extend(&active[2], 7);
        let fork_b = extend(&fork_a, 7);
        pool.insert(fork_a.clone(), 0);
        pool.insert(fork_b.clone(), 0);

        let branch = pool.assemble_branch(&fork_b.hash, &active).unwrap();
        assert_eq!(branch.ancestor_height, 2);
        assert_eq!(branch.blocks, vec![fork_a, fork_b]);
    }

    #[test]
    fn test_incomplete_branch() {
        let active = chain(5, 0);
        let mut pool = SideBranchPool::new();
        let missing_parent = extend(&active[2], 9);
        let orphan = extend(&missing_parent, 9);
        pool.insert(orphan.clone(), 0);

        assert!(pool.assemble_branch(&orphan.hash, &active).is_none());
    }

    #[test]
    fn test_prune_expired() {
        let active = chain(2, 0);
        let mut pool = SideBranchPool::new();
        pool.insert(extend(&active[1], 1), 0);
        pool.insert(extend(&active[1], 2), 5000);

        assert_eq!(pool.prune(SIDE_BLOCK_EXPIRE_TIME + 10), 1);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_prune_below() {
        let active = chain(5, 0);
        let mut pool = SideBranchPool::new();
        let low = extend(&active[1], 3);
        let high = extend(&active[3], 3);
        pool.insert(low.clone(), 0);
        pool.insert(high.clone(), 0);

        pool.prune_below(2);
        assert!(pool.get(&low.hash).is_none());
        assert!(pool.get(&high.hash).is_some());
    }
}
