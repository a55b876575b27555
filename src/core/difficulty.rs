//! Difficulty adjustment
//!
//! Difficulty is a count of leading zero hex digits. It is recomputed every
//! `interval` blocks from the elapsed time across the whole previous window,
//! never from a single block, and moves by at most one step per retarget.

use crate::config::ChainConfig;
use crate::core::block::Block;
use log::info;
use serde::{Deserialize, Serialize};

/// Pure difficulty schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DifficultyAdjuster {
    pub initial: u32,
    pub min: u32,
    pub max: u32,
    /// Target seconds between blocks
    pub target_block_time: i64,
    /// Blocks per retarget window
    pub interval: u64,
}

impl From<&ChainConfig> for DifficultyAdjuster {
    fn from(config: &ChainConfig) -> Self {
        Self {
            initial: config.initial_difficulty,
            min: config.min_difficulty,
            max: config.max_difficulty,
            target_block_time: config.target_block_time,
            interval: config.difficulty_interval,
        }
    }
}

/// Block-time statistics over a recent window
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockTimeStats {
    pub average_block_time: f64,
    pub min_block_time: i64,
    pub max_block_time: i64,
    /// Number of block intervals measured
    pub samples: usize,
    pub target_block_time: i64,
}

impl DifficultyAdjuster {
    /// Whether the block at `height` starts a new window
    pub fn should_adjust(&self, height: u64) -> bool {
        height > 0 && height % self.interval == 0
    }

    /// Blocks left before the next retarget, counted from `height`
    pub fn blocks_until_adjustment(&self, height: u64) -> u64 {
        self.interval - (height % self.interval)
    }

    /// Difficulty required for a block at `height` whose ancestors are
    /// `chain[..height]` (indexed by height).
    pub fn difficulty_for_height(&self, chain: &[Block], height: u64) -> u32 {
        let height_idx = height as usize;
        if height == 0 || chain.is_empty() || height_idx > chain.len() {
            return self.clamp(self.initial);
        }

        let parent_difficulty = chain[height_idx - 1].header.difficulty;
        if !self.should_adjust(height) || height < self.interval {
            return self.clamp(parent_difficulty);
        }

        let window = &chain[height_idx - self.interval as usize..height_idx];
        let first = window[0].header.timestamp;
        let last = window[window.len() - 1].header.timestamp;
        self.retarget(parent_difficulty, last.saturating_sub(first), height)
    }

    /// Step the difficulty given the elapsed seconds across one window
    pub fn retarget(&self, current: u32, elapsed: i64, height: u64) -> u32 {
        // The window holds `interval` blocks, so `interval - 1` gaps
        let expected = self.target_block_time * (self.interval as i64 - 1);

        let next = if elapsed.saturating_mul(3) < expected.saturating_mul(2) {
            current.saturating_add(1)
        } else if elapsed.saturating_mul(2) > expected.saturating_mul(3) {
            current.saturating_sub(1)
        } else {
            current
        };
        let next = self.clamp(next);

        if next != current {
            info!(
                "Difficulty adjusted at height {}: {} -> {} (window {}s, expected {}s)",
                height, current, next, elapsed, expected
            );
        }
        next
    }

    fn clamp(&self, difficulty: u32) -> u32 {
        difficulty.clamp(self.min, self.max)
    }

    /// Average, min and max spacing over the last `last_n` blocks
    pub fn block_time_stats(&self, chain: &[Block], last_n: usize) -> BlockTimeStats {
        let start = chain.len().saturating_sub(last_n.max(2));
        let times: Vec<i64> = chain[start..]
            .windows(2)
            .map(|pair| pair[1].header.timestamp - pair[0].header.timestamp)
            .collect();

        if times.is_empty() {
            return BlockTimeStats {
                target_block_time: self.target_block_time,
                ..Default::default()
            };
        }

        BlockTimeStats {
            average_block_time: times.iter().sum::<i64>() as f64 / times.len() as f64,
            min_block_time: times.iter().copied().min().unwrap_or(0),
            max_block_time: times.iter().copied().max().unwrap_or(0),
            samples: times.len(),
            target_block_time: self.target_block_time,
        }
    }
}

impl Default for DifficultyAdjuster {
    fn default() -> Self {
        Self::from(&ChainConfig::default())
    }
}
