//! Ledger store interface
//!
//! The chain engine persists through [`LedgerStore`]. Every mutating call is
//! a single atomic unit: either the whole block (or reorg suffix) and its
//! balances land, or nothing does.

use super::persistence::StorageError;
use crate::core::block::Block;
use crate::core::transaction::Amount;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

/// Post-block balances of every address a block touched
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceDelta {
    pub balances: BTreeMap<String, Amount>,
}

impl BalanceDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, address: &str, balance: Amount) {
        self.balances.insert(address.to_string(), balance);
    }

    pub fn is_empty(&self) -> bool {
        self.balances.is_empty()
    }
}

/// Outcome of validating one transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Valid,
    Invalid,
}

/// Entry of the universal-validation log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationRecord {
    pub txid: String,
    pub verdict: Verdict,
    /// Rejection reason for invalid transactions
    pub reason: Option<String>,
    /// Height of the block that committed the transaction, if any
    pub block_height: Option<u64>,
    /// Unix seconds
    pub validated_at: i64,
}

/// Durable state behind the chain
pub trait LedgerStore: Send + Sync {
    fn get_balance(&self, address: &str) -> Result<Amount, StorageError>;

    /// Every stored balance
    fn balances(&self) -> Result<HashMap<String, Amount>, StorageError>;

    /// Append the next block and its balance changes in one atomic write
    fn append_block(&self, block: &Block, delta: &BalanceDelta) -> Result<(), StorageError>;

    /// Drop every block from `from_height` upwards, append `blocks` and
    /// replace the whole balance set, atomically
    fn replace_suffix(
        &self,
        from_height: u64,
        blocks: &[Block],
        balances: &HashMap<String, Amount>,
    ) -> Result<(), StorageError>;

    fn get_block(&self, height: u64) -> Result<Option<Block>, StorageError>;

    /// Height of the stored tip, `None` when empty
    fn height(&self) -> Result<Option<u64>, StorageError>;

    /// All blocks in height order
    fn load_blocks(&self) -> Result<Vec<Block>, StorageError>;

    fn get_checkpoint(&self, height: u64) -> Result<Option<String>, StorageError>;

    fn put_checkpoint(&self, height: u64, hash: &str) -> Result<(), StorageError>;

    fn checkpoints(&self) -> Result<BTreeMap<u64, String>, StorageError>;

    fn put_validation_record(&self, record: &ValidationRecord) -> Result<(), StorageError>;

    fn get_validation_record(&self, txid: &str) -> Result<Option<ValidationRecord>, StorageError>;

    /// Make previous writes durable
    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

// =============================================================================
// In-memory store
// =============================================================================

#[derive(Default)]
struct MemoryState {
    blocks: Vec<Block>,
    balances: HashMap<String, Amount>,
    checkpoints: BTreeMap<u64, String>,
    records: HashMap<String, ValidationRecord>,
}

/// Volatile store used by tests and throwaway nodes
#[derive(Default)]
pub struct MemoryLedger {
    state: RwLock<MemoryState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, MemoryState>, StorageError> {
        self.state.read().map_err(|_| StorageError::LockPoisoned)
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, MemoryState>, StorageError> {
        self.state.write().map_err(|_| StorageError::LockPoisoned)
    }
}

impl LedgerStore for MemoryLedger {
    fn get_balance(&self, address: &str) -> Result<Amount, StorageError> {
        Ok(self.read()?.balances.get(address).copied().unwrap_or(0))
    }

    fn balances(&self) -> Result<HashMap<String, Amount>, StorageError> {
        Ok(self.read()?.balances.clone())
    }

    fn append_block(&self, block: &Block, delta: &BalanceDelta) -> Result<(), StorageError> {
        let mut state = self.write()?;
        if block.index != state.blocks.len() as u64 {
            return Err(StorageError::Corrupt(format!(
                "append of block {} onto store of height {}",
                block.index,
                state.blocks.len()
            )));
        }
        state.blocks.push(block.clone());
        for (address, balance) in &delta.balances {
            state.balances.insert(address.clone(), *balance);
        }
        Ok(())
    }

    fn replace_suffix(
        &self,
        from_height: u64,
        blocks: &[Block],
        balances: &HashMap<String, Amount>,
    ) -> Result<(), StorageError> {
        let mut state = self.write()?;
        if from_height as usize > state.blocks.len() {
            return Err(StorageError::Corrupt(format!(
                "suffix starts at {} beyond stored height {}",
                from_height,
                state.blocks.len()
            )));
        }
        state.blocks.truncate(from_height as usize);
        state.blocks.extend_from_slice(blocks);
        state.balances = balances.clone();
        Ok(())
    }

    fn get_block(&self, height: u64) -> Result<Option<Block>, StorageError> {
        Ok(self.read()?.blocks.get(height as usize).cloned())
    }

    fn height(&self) -> Result<Option<u64>, StorageError> {
        Ok(self.read()?.blocks.last().map(|b| b.index))
    }

    fn load_blocks(&self) -> Result<Vec<Block>, StorageError> {
        Ok(self.read()?.blocks.clone())
    }

    fn get_checkpoint(&self, height: u64) -> Result<Option<String>, StorageError> {
        Ok(self.read()?.checkpoints.get(&height).cloned())
    }

    fn put_checkpoint(&self, height: u64, hash: &str) -> Result<(), StorageError> {
        self.write()?
            .checkpoints
            .entry(height)
            .or_insert_with(|| hash.to_string());
        Ok(())
    }

    fn checkpoints(&self) -> Result<BTreeMap<u64, String>, StorageError> {
        Ok(self.read()?.checkpoints.clone())
    }

    fn put_validation_record(&self, record: &ValidationRecord) -> Result<(), StorageError> {
        self.write()?
            .records
            .insert(record.txid.clone(), record.clone());
        Ok(())
    }

    fn get_validation_record(&self, txid: &str) -> Result<Option<ValidationRecord>, StorageError> {
        Ok(self.read()?.records.get(txid).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(index: u64) -> Block {
        Block::new(index, "0".repeat(64), vec![], 1, 100 + index as i64)
    }

    #[test]
    fn test_append_and_read() {
        let store = MemoryLedger::new();
        let mut delta = BalanceDelta::new();
        delta.set("1alice", 500);

        store.append_block(&block(0), &delta).unwrap();

        assert_eq!(store.height().unwrap(), Some(0));
        assert_eq!(store.get_balance("1alice").unwrap(), 500);
        assert_eq!(store.get_balance("1nobody").unwrap(), 0);
        assert!(store.get_block(0).unwrap().is_some());
    }

    #[test]
    fn test_out_of_order_append_rejected() {
        let store = MemoryLedger::new();
        assert!(store.append_block(&block(3), &BalanceDelta::new()).is_err());
        assert_eq!(store.height().unwrap(), None);
    }

    #[test]
    fn test_replace_suffix() {
        let store = MemoryLedger::new();
        for i in 0..4 {
            store.append_block(&block(i), &BalanceDelta::new()).unwrap();
        }
        let mut replacement = block(2);
        replacement.header.nonce = 99;
        let balances: HashMap<String, Amount> = [("1bob".to_string(), 7)].into_iter().collect();

        store.replace_suffix(2, &[replacement.clone()], &balances).unwrap();

        assert_eq!(store.height().unwrap(), Some(2));
        assert_eq!(store.get_block(2).unwrap(), Some(replacement));
        assert_eq!(store.balances().unwrap(), balances);
    }

    #[test]
    fn test_checkpoints_are_write_once() {
        let store = MemoryLedger::new();
        store.put_checkpoint(100, "aaa").unwrap();
        store.put_checkpoint(100, "bbb").unwrap();
        assert_eq!(store.get_checkpoint(100).unwrap().as_deref(), Some("aaa"));
    }
}
