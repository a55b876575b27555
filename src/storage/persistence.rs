//! Durable ledger store backed by sled
//!
//! Everything lives in the default tree under key prefixes so that a block
//! and its balance updates go through a single `apply_batch`:
//!
//! - `block:{height:020}` → block JSON
//! - `balance:{address}` → balance, big-endian u64
//! - `checkpoint:{height:020}` → block hash
//! - `pouv:{txid}` → validation record JSON
//! - `meta:height` → tip height, big-endian u64

use super::ledger::{BalanceDelta, LedgerStore, ValidationRecord};
use crate::core::block::Block;
use crate::core::transaction::Amount;
use sled::{Batch, Db};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use thiserror::Error;

const BLOCK_PREFIX: &str = "block:";
const BALANCE_PREFIX: &str = "balance:";
const CHECKPOINT_PREFIX: &str = "checkpoint:";
const RECORD_PREFIX: &str = "pouv:";
const HEIGHT_KEY: &str = "meta:height";

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Sled(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Corrupt store: {0}")]
    Corrupt(String),
    #[error("Store lock poisoned")]
    LockPoisoned,
}

fn block_key(height: u64) -> String {
    format!("{}{:020}", BLOCK_PREFIX, height)
}

fn balance_key(address: &str) -> String {
    format!("{}{}", BALANCE_PREFIX, address)
}

fn checkpoint_key(height: u64) -> String {
    format!("{}{:020}", CHECKPOINT_PREFIX, height)
}

fn decode_u64(bytes: &[u8]) -> Result<u64, StorageError> {
    let array: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StorageError::Corrupt(format!("expected 8 bytes, got {}", bytes.len())))?;
    Ok(u64::from_be_bytes(array))
}

fn parse_height(key: &[u8], prefix: &str) -> Result<u64, StorageError> {
    std::str::from_utf8(&key[prefix.len()..])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| StorageError::Corrupt("unreadable height key".to_string()))
}

/// sled-backed [`LedgerStore`]
#[derive(Clone)]
pub struct SledLedger {
    db: Db,
}

impl SledLedger {
    /// Open or create the store at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        Ok(Self {
            db: sled::open(path)?,
        })
    }

    /// Temporary store removed on drop
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    /// Whether the store holds any block
    pub fn is_initialized(&self) -> Result<bool, StorageError> {
        Ok(self.db.contains_key(HEIGHT_KEY)?)
    }

    fn stage_block(batch: &mut Batch, block: &Block) -> Result<(), StorageError> {
        batch.insert(block_key(block.index).as_bytes(), serde_json::to_vec(block)?);
        batch.insert(HEIGHT_KEY, block.index.to_be_bytes().to_vec());
        Ok(())
    }
}

impl LedgerStore for SledLedger {
    fn get_balance(&self, address: &str) -> Result<Amount, StorageError> {
        match self.db.get(balance_key(address))? {
            Some(bytes) => decode_u64(&bytes),
            None => Ok(0),
        }
    }

    fn balances(&self) -> Result<HashMap<String, Amount>, StorageError> {
        let mut balances = HashMap::new();
        for item in self.db.scan_prefix(BALANCE_PREFIX) {
            let (key, value) = item?;
            let address = String::from_utf8_lossy(&key[BALANCE_PREFIX.len()..]).into_owned();
            balances.insert(address, decode_u64(&value)?);
        }
        Ok(balances)
    }

    fn append_block(&self, block: &Block, delta: &BalanceDelta) -> Result<(), StorageError> {
        let expected = match self.height()? {
            Some(height) => height + 1,
            None => 0,
        };
        if block.index != expected {
            return Err(StorageError::Corrupt(format!(
                "append of block {} onto store expecting {}",
                block.index, expected
            )));
        }

        let mut batch = Batch::default();
        Self::stage_block(&mut batch, block)?;
        for (address, balance) in &delta.balances {
            batch.insert(balance_key(address).as_bytes(), balance.to_be_bytes().to_vec());
        }
        self.db.apply_batch(batch)?;
        Ok(())
    }

    fn replace_suffix(
        &self,
        from_height: u64,
        blocks: &[Block],
        balances: &HashMap<String, Amount>,
    ) -> Result<(), StorageError> {
        let tip = self.height()?;
        let mut batch = Batch::default();

        if let Some(tip) = tip {
            for height in from_height..=tip {
                batch.remove(block_key(height).as_bytes());
            }
        }
        for block in blocks {
            Self::stage_block(&mut batch, block)?;
        }
        if blocks.is_empty() {
            match from_height.checked_sub(1) {
                Some(height) => batch.insert(HEIGHT_KEY, height.to_be_bytes().to_vec()),
                None => batch.remove(HEIGHT_KEY),
            }
        }

        for item in self.db.scan_prefix(BALANCE_PREFIX) {
            let (key, _) = item?;
            batch.remove(key);
        }
        for (address, balance) in balances {
            batch.insert(balance_key(address).as_bytes(), balance.to_be_bytes().to_vec());
        }

        self.db.apply_batch(batch)?;
        Ok(())
    }

    fn get_block(&self, height: u64) -> Result<Option<Block>, StorageError> {
        match self.db.get(block_key(height))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn height(&self) -> Result<Option<u64>, StorageError> {
        match self.db.get(HEIGHT_KEY)? {
            Some(bytes) => Ok(Some(decode_u64(&bytes)?)),
            None => Ok(None),
        }
    }

    fn load_blocks(&self) -> Result<Vec<Block>, StorageError> {
        let mut blocks = Vec::new();
        for item in self.db.scan_prefix(BLOCK_PREFIX) {
            let (key, value) = item?;
            let block: Block = serde_json::from_slice(&value)?;
            if parse_height(&key, BLOCK_PREFIX)? != block.index
                || block.index != blocks.len() as u64
            {
                return Err(StorageError::Corrupt(format!(
                    "block {} stored out of sequence",
                    block.index
                )));
            }
            blocks.push(block);
        }
        Ok(blocks)
    }

    fn get_checkpoint(&self, height: u64) -> Result<Option<String>, StorageError> {
        Ok(self
            .db
            .get(checkpoint_key(height))?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    fn put_checkpoint(&self, height: u64, hash: &str) -> Result<(), StorageError> {
        // Write-once: an existing checkpoint is never replaced
        let _ = self.db.compare_and_swap(
            checkpoint_key(height),
            None as Option<&[u8]>,
            Some(hash.as_bytes()),
        )?;
        Ok(())
    }

    fn checkpoints(&self) -> Result<BTreeMap<u64, String>, StorageError> {
        let mut checkpoints = BTreeMap::new();
        for item in self.db.scan_prefix(CHECKPOINT_PREFIX) {
            let (key, value) = item?;
            checkpoints.insert(
                parse_height(&key, CHECKPOINT_PREFIX)?,
                String::from_utf8_lossy(&value).into_owned(),
            );
        }
        Ok(checkpoints)
    }

    fn put_validation_record(&self, record: &ValidationRecord) -> Result<(), StorageError> {
        let key = format!("{}{}", RECORD_PREFIX, record.txid);
        self.db.insert(key, serde_json::to_vec(record)?)?;
        Ok(())
    }

    fn get_validation_record(&self, txid: &str) -> Result<Option<ValidationRecord>, StorageError> {
        match self.db.get(format!("{}{}", RECORD_PREFIX, txid))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}
