//! Chain protection: checkpoints and reorganization defense
//!
//! - Every committed block at a checkpoint height is recorded permanently
//! - A candidate chain that rewrites a checkpointed height is rejected
//! - A reorganization deeper than the configured bound is rejected and
//!   raises a security alert

use super::ledger::LedgerStore;
use super::persistence::StorageError;
use crate::config::ChainConfig;
use crate::core::block::{Block, BlockError};
use log::{error, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Checkpoint Entry
// =============================================================================

/// A checkpoint representing a known-good block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub height: u64,
    pub hash: String,
}

impl Checkpoint {
    pub fn new(height: u64, hash: &str) -> Self {
        Self {
            height,
            hash: hash.to_string(),
        }
    }
}

/// Result of checkpoint verification
#[derive(Debug, Clone, PartialEq)]
pub enum CheckpointResult {
    /// Block matches the checkpoint
    Match,
    /// Block doesn't match the checkpoint
    Mismatch { expected: String, got: String },
    /// No checkpoint at this height
    NoCheckpoint,
}

// =============================================================================
// Security Alerts
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    DeepReorg,
    CheckpointViolation,
}

/// Record of a blocked chain replacement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityAlert {
    pub kind: AlertKind,
    pub old_tip_height: u64,
    pub old_tip_hash: String,
    pub new_tip_height: u64,
    pub new_tip_hash: String,
    pub depth: u64,
    pub ancestor_height: u64,
    /// Unix seconds
    pub detected_at: i64,
}

/// Tip of a chain as seen by the protection checks
#[derive(Debug, Clone, Copy)]
pub struct TipRef<'a> {
    pub height: u64,
    pub hash: &'a str,
}

impl<'a> From<&'a Block> for TipRef<'a> {
    fn from(block: &'a Block) -> Self {
        Self {
            height: block.index,
            hash: &block.hash,
        }
    }
}

/// Counters reported by [`ChainProtection::security_stats`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityStats {
    pub total_checkpoints: usize,
    pub checkpoint_interval: u64,
    pub max_reorg_depth: u64,
    pub reorg_attempts_blocked: u64,
    pub last_checkpoint_height: u64,
}

// =============================================================================
// Chain Protection
// =============================================================================

/// Checkpoint registry plus reorg depth guard
#[derive(Debug)]
pub struct ChainProtection {
    checkpoint_interval: u64,
    max_reorg_depth: u64,
    checkpoints: BTreeMap<u64, Checkpoint>,
    alerts: Vec<SecurityAlert>,
    attempts_blocked: u64,
}

impl ChainProtection {
    pub fn new(checkpoint_interval: u64, max_reorg_depth: u64) -> Self {
        Self {
            checkpoint_interval,
            max_reorg_depth,
            checkpoints: BTreeMap::new(),
            alerts: Vec::new(),
            attempts_blocked: 0,
        }
    }

    pub fn from_config(config: &ChainConfig) -> Self {
        Self::new(config.checkpoint_interval, config.max_reorg_depth)
    }

    /// Restore checkpoints persisted in the store
    pub fn load_from(&mut self, store: &dyn LedgerStore) -> Result<usize, StorageError> {
        for (height, hash) in store.checkpoints()? {
            self.checkpoints
                .entry(height)
                .or_insert_with(|| Checkpoint::new(height, &hash));
        }
        Ok(self.checkpoints.len())
    }

    /// Whether a block at `height` gets a checkpoint
    pub fn is_checkpoint_height(&self, height: u64) -> bool {
        height > 0 && height % self.checkpoint_interval == 0
    }

    /// Record a checkpoint for a newly committed block. Existing checkpoints
    /// are never changed. Returns whether a new checkpoint was written.
    pub fn record(
        &mut self,
        height: u64,
        hash: &str,
        store: &dyn LedgerStore,
    ) -> Result<bool, StorageError> {
        if !self.is_checkpoint_height(height) || self.checkpoints.contains_key(&height) {
            return Ok(false);
        }
        store.put_checkpoint(height, hash)?;
        self.checkpoints.insert(height, Checkpoint::new(height, hash));
        info!(
            "Checkpoint recorded at block #{} - {}",
            height,
            hash.get(..16).unwrap_or(hash)
        );
        Ok(true)
    }

    /// Check if a block matches the checkpoint at its height
    pub fn verify_checkpoint(&self, height: u64, hash: &str) -> CheckpointResult {
        match self.checkpoints.get(&height) {
            Some(cp) if cp.hash == hash => CheckpointResult::Match,
            Some(cp) => CheckpointResult::Mismatch {
                expected: cp.hash.clone(),
                got: hash.to_string(),
            },
            None => CheckpointResult::NoCheckpoint,
        }
    }

    /// Reject any block whose hash disagrees with a recorded checkpoint
    pub fn validate_against_checkpoints(
        &mut self,
        old_tip: TipRef<'_>,
        blocks: &[Block],
        now: i64,
    ) -> Result<(), BlockError> {
        for block in blocks {
            if let CheckpointResult::Mismatch { expected, got } =
                self.verify_checkpoint(block.index, &block.hash)
            {
                let new_tip = blocks.last().map(TipRef::from).unwrap_or(old_tip);
                let ancestor_height = blocks.first().map(|b| b.index.saturating_sub(1)).unwrap_or(0);
                self.raise_alert(
                    AlertKind::CheckpointViolation,
                    old_tip,
                    new_tip,
                    ancestor_height,
                    now,
                );
                return Err(BlockError::CheckpointViolation {
                    height: block.index,
                    expected,
                    got,
                });
            }
        }
        Ok(())
    }

    /// Reject reorganizations that unwind more than the allowed depth
    pub fn check_reorg(
        &mut self,
        old_tip: TipRef<'_>,
        new_tip: TipRef<'_>,
        ancestor_height: u64,
        now: i64,
    ) -> Result<(), BlockError> {
        let depth = old_tip.height.saturating_sub(ancestor_height);
        if depth > self.max_reorg_depth {
            self.raise_alert(AlertKind::DeepReorg, old_tip, new_tip, ancestor_height, now);
            return Err(BlockError::ReorgTooDeep {
                depth,
                max_depth: self.max_reorg_depth,
            });
        }
        Ok(())
    }

    fn raise_alert(
        &mut self,
        kind: AlertKind,
        old_tip: TipRef<'_>,
        new_tip: TipRef<'_>,
        ancestor_height: u64,
        now: i64,
    ) {
        let alert = SecurityAlert {
            kind,
            old_tip_height: old_tip.height,
            old_tip_hash: old_tip.hash.to_string(),
            new_tip_height: new_tip.height,
            new_tip_hash: new_tip.hash.to_string(),
            depth: old_tip.height.saturating_sub(ancestor_height),
            ancestor_height,
            detected_at: now,
        };
        error!(
            "SECURITY ALERT {:?}: old tip #{} {} -> new tip #{} {}, depth {}, ancestor #{}",
            alert.kind,
            alert.old_tip_height,
            alert.old_tip_hash,
            alert.new_tip_height,
            alert.new_tip_hash,
            alert.depth,
            alert.ancestor_height
        );
        self.alerts.push(alert);
        self.attempts_blocked += 1;
    }

    pub fn alerts(&self) -> &[SecurityAlert] {
        &self.alerts
    }

    pub fn get_checkpoint(&self, height: u64) -> Option<&Checkpoint> {
        self.checkpoints.get(&height)
    }

    /// Highest recorded checkpoint height, 0 when none
    pub fn highest_height(&self) -> u64 {
        self.checkpoints.keys().next_back().copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }

    pub fn security_stats(&self) -> SecurityStats {
        SecurityStats {
            total_checkpoints: self.checkpoints.len(),
            checkpoint_interval: self.checkpoint_interval,
            max_reorg_depth: self.max_reorg_depth,
            reorg_attempts_blocked: self.attempts_blocked,
            last_checkpoint_height: self.highest_height(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryLedger;

    fn tip(height: u64, hash: &str) -> TipRef<'_> {
        TipRef { height, hash }
    }

    #[test]
    fn test_record_only_at_interval() {
        let store = MemoryLedger::new();
        let mut protection = ChainProtection::new(5, 3);

        assert!(!protection.record(0, "genesis", &store).unwrap());
        assert!(!protection.record(4, "h4", &store).unwrap());
        assert!(protection.record(5, "h5", &store).unwrap());
        // Never altered once written
        assert!(!protection.record(5, "other", &store).unwrap());

        assert_eq!(protection.verify_checkpoint(5, "h5"), CheckpointResult::Match);
        assert!(matches!(
            protection.verify_checkpoint(5, "other"),
            CheckpointResult::Mismatch { .. }
        ));
        assert_eq!(
            protection.verify_checkpoint(7, "x"),
            CheckpointResult::NoCheckpoint
        );
        assert_eq!(store.get_checkpoint(5).unwrap().as_deref(), Some("h5"));
    }

    #[test]
    fn test_shallow_reorg_allowed() {
        let mut protection = ChainProtection::new(5, 3);
        assert!(protection
            .check_reorg(tip(15, "a"), tip(16, "b"), 13, 0)
            .is_ok());
        assert!(protection.alerts().is_empty());
    }

    #[test]
    fn test_deep_reorg_raises_alert() {
        let mut protection = ChainProtection::new(5, 3);
        let result = protection.check_reorg(tip(15, "a"), tip(20, "b"), 5, 1_700_000_000);

        assert!(matches!(
            result,
            Err(BlockError::ReorgTooDeep {
                depth: 10,
                max_depth: 3
            })
        ));
        assert_eq!(protection.alerts().len(), 1);
        assert_eq!(protection.alerts()[0].kind, AlertKind::DeepReorg);
        assert_eq!(protection.security_stats().reorg_attempts_blocked, 1);
    }

    #[test]
    fn test_checkpoint_violation() {
        let store = MemoryLedger::new();
        let mut protection = ChainProtection::new(1, 100);
        let block = Block::new(1, "0".repeat(64), vec![], 1, 100);
        protection.record(1, "recorded", &store).unwrap();

        let result = protection.validate_against_checkpoints(tip(1, "recorded"), &[block], 0);
        assert!(matches!(
            result,
            Err(BlockError::CheckpointViolation { height: 1, .. })
        ));
        assert_eq!(protection.alerts()[0].kind, AlertKind::CheckpointViolation);
    }

    #[test]
    fn test_load_from_store() {
        let store = MemoryLedger::new();
        store.put_checkpoint(100, "h100").unwrap();
        store.put_checkpoint(200, "h200").unwrap();

        let mut protection = ChainProtection::new(100, 10);
        assert_eq!(protection.load_from(&store).unwrap(), 2);
        assert_eq!(protection.highest_height(), 200);
    }
}
