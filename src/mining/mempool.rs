//! Transaction pool (mempool) for pending transactions
//!
//! Holds validated, unconfirmed transactions waiting to be included in
//! blocks:
//! - Fee-based prioritization (ties by earliest timestamp, then txid)
//! - Capacity limit with lowest-fee eviction
//! - Expiry of transactions older than the maximum age
//! - Per-sender pending debits, so admission can see funds already promised

use crate::config::ChainConfig;
use crate::core::{Amount, Transaction};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;

/// Default maximum mempool transaction count
pub const DEFAULT_MEMPOOL_SIZE: usize = 10_000;

/// Default maximum transaction age in seconds
pub const DEFAULT_MAX_TX_AGE: i64 = 3600;

// =============================================================================
// Error Types
// =============================================================================

/// Mempool errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MempoolError {
    #[error("Transaction already exists: {0}")]
    DuplicateTransaction(String),
    #[error("Transaction expired: age {age}s exceeds {max_age}s")]
    Expired { age: i64, max_age: i64 },
    #[error("Mempool full: fee {fee} does not beat lowest pooled fee {lowest_fee}")]
    Full { fee: Amount, lowest_fee: Amount },
}

// =============================================================================
// Mempool Entry
// =============================================================================

/// Priority key: highest fee first, then earliest timestamp, then txid
type PriorityKey = (Reverse<Amount>, i64, String);

/// Entry in the mempool with metadata
#[derive(Debug, Clone)]
pub struct MempoolEntry {
    pub tx: Transaction,
    /// When the transaction was admitted (Unix seconds)
    pub added_time: i64,
    /// Debited address and `amount + fee`, for user transactions
    pub debit: Option<(String, Amount)>,
}

impl MempoolEntry {
    fn key(&self) -> PriorityKey {
        (Reverse(self.tx.fee), self.tx.timestamp, self.tx.txid.clone())
    }
}

/// Mempool statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MempoolStats {
    pub tx_count: usize,
    pub capacity: usize,
    /// Percentage of capacity in use
    pub utilization: f64,
    pub total_fees: Amount,
    pub min_fee: Amount,
    pub max_fee: Amount,
    pub average_fee: Amount,
    pub total_received: u64,
    pub total_rejected: u64,
    pub total_expired: u64,
    pub total_evicted: u64,
}

// =============================================================================
// Mempool
// =============================================================================

/// Memory pool for pending transactions
#[derive(Debug)]
pub struct Mempool {
    /// Transactions indexed by ID
    entries: HashMap<String, MempoolEntry>,
    /// Transaction IDs in priority order
    by_fee: BTreeSet<PriorityKey>,
    /// Pending `amount + fee` per debited address
    pending: HashMap<String, Amount>,
    max_size: usize,
    max_tx_age: i64,
    total_received: u64,
    total_rejected: u64,
    total_expired: u64,
    total_evicted: u64,
}

impl Default for Mempool {
    fn default() -> Self {
        Self::new()
    }
}

impl Mempool {
    /// Create a new mempool
    pub fn new() -> Self {
        Self::with_config(DEFAULT_MEMPOOL_SIZE, DEFAULT_MAX_TX_AGE)
    }

    /// Create a mempool with custom settings
    pub fn with_config(max_size: usize, max_tx_age: i64) -> Self {
        info!(
            "Mempool initialized: max size {}, max age {}s",
            max_size, max_tx_age
        );
        Self {
            entries: HashMap::new(),
            by_fee: BTreeSet::new(),
            pending: HashMap::new(),
            max_size,
            max_tx_age,
            total_received: 0,
            total_rejected: 0,
            total_expired: 0,
            total_evicted: 0,
        }
    }

    pub fn from_config(config: &ChainConfig) -> Self {
        Self::with_config(config.mempool_capacity, config.max_tx_age)
    }

    /// Add a validated transaction. When the pool is full, the lowest-fee
    /// entry makes room only for a strictly higher fee; the evicted
    /// transaction is returned.
    pub fn admit(&mut self, tx: Transaction, now: i64) -> Result<Option<Transaction>, MempoolError> {
        self.total_received += 1;

        if self.entries.contains_key(&tx.txid) {
            self.total_rejected += 1;
            return Err(MempoolError::DuplicateTransaction(tx.txid));
        }

        let age = now.saturating_sub(tx.timestamp);
        if age > self.max_tx_age {
            self.total_rejected += 1;
            return Err(MempoolError::Expired {
                age,
                max_age: self.max_tx_age,
            });
        }

        let mut evicted = None;
        if self.entries.len() >= self.max_size {
            let lowest = self.by_fee.iter().next_back().cloned();
            match lowest {
                Some((Reverse(lowest_fee), _, lowest_id)) if tx.fee > lowest_fee => {
                    evicted = self.remove_one(&lowest_id);
                    self.total_evicted += 1;
                    info!(
                        "Evicted low-fee tx {} (fee {})",
                        lowest_id.get(..16).unwrap_or(&lowest_id),
                        lowest_fee
                    );
                }
                Some((Reverse(lowest_fee), _, _)) => {
                    self.total_rejected += 1;
                    return Err(MempoolError::Full {
                        fee: tx.fee,
                        lowest_fee,
                    });
                }
                // Zero capacity
                None => {
                    self.total_rejected += 1;
                    return Err(MempoolError::Full {
                        fee: tx.fee,
                        lowest_fee: 0,
                    });
                }
            }
        }

        let debit = match tx.sender.debit_address() {
            Ok(Some(address)) => Some((address, tx.total_debit().unwrap_or(Amount::MAX))),
            _ => None,
        };
        if let Some((address, total)) = &debit {
            let pending = self.pending.entry(address.clone()).or_insert(0);
            *pending = pending.saturating_add(*total);
        }

        let entry = MempoolEntry {
            tx,
            added_time: now,
            debit,
        };
        debug!(
            "Admitted tx {} (fee {}, pool size {})",
            entry.tx.short_id(),
            entry.tx.fee,
            self.entries.len() + 1
        );
        self.by_fee.insert(entry.key());
        self.entries.insert(entry.tx.txid.clone(), entry);
        Ok(evicted)
    }

    fn remove_one(&mut self, txid: &str) -> Option<Transaction> {
        let entry = self.entries.remove(txid)?;
        self.by_fee.remove(&entry.key());
        if let Some((address, total)) = &entry.debit {
            if let Some(pending) = self.pending.get_mut(address) {
                *pending = pending.saturating_sub(*total);
                if *pending == 0 {
                    self.pending.remove(address);
                }
            }
        }
        Some(entry.tx)
    }

    /// Transactions for mining, highest fee first (non-destructive)
    pub fn select(&self, max_count: usize) -> Vec<Transaction> {
        self.by_fee
            .iter()
            .take(max_count)
            .filter_map(|(_, _, id)| self.entries.get(id).map(|e| e.tx.clone()))
            .collect()
    }

    /// Transactions in timestamp order, oldest first (non-destructive)
    pub fn select_by_time(&self, max_count: usize) -> Vec<Transaction> {
        let mut entries: Vec<&MempoolEntry> = self.entries.values().collect();
        entries.sort_by(|a, b| {
            (a.tx.timestamp, &a.tx.txid).cmp(&(b.tx.timestamp, &b.tx.txid))
        });
        entries
            .into_iter()
            .take(max_count)
            .map(|e| e.tx.clone())
            .collect()
    }

    /// Remove transactions that are now in a block
    pub fn remove<S: AsRef<str>>(&mut self, txids: &[S]) -> usize {
        let removed = txids
            .iter()
            .filter(|id| self.remove_one(id.as_ref()).is_some())
            .count();
        if removed > 0 {
            debug!("Removed {} committed transactions from mempool", removed);
        }
        removed
    }

    /// Remove every transaction older than the maximum age
    pub fn sweep(&mut self, now: i64) -> usize {
        let expired: Vec<String> = self
            .entries
            .values()
            .filter(|e| now.saturating_sub(e.tx.timestamp) > self.max_tx_age)
            .map(|e| e.tx.txid.clone())
            .collect();
        for txid in &expired {
            self.remove_one(txid);
        }
        if !expired.is_empty() {
            self.total_expired += expired.len() as u64;
            info!("Removed {} expired transactions from mempool", expired.len());
        }
        expired.len()
    }

    /// Sum of `amount + fee` of pooled transactions debiting `address`
    pub fn pending_debits(&self, address: &str) -> Amount {
        self.pending.get(address).copied().unwrap_or(0)
    }

    /// Check if a transaction is in the pool
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Get the number of pending transactions
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the pool is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }

    /// Get mempool statistics
    pub fn stats(&self) -> MempoolStats {
        let total_fees = self
            .entries
            .values()
            .fold(0, |acc: Amount, e| acc.saturating_add(e.tx.fee));
        let tx_count = self.entries.len();
        let utilization = if self.max_size == 0 {
            100.0
        } else {
            tx_count as f64 / self.max_size as f64 * 100.0
        };

        MempoolStats {
            tx_count,
            capacity: self.max_size,
            utilization,
            total_fees,
            max_fee: self.by_fee.iter().next().map(|k| k.0 .0).unwrap_or(0),
            min_fee: self.by_fee.iter().next_back().map(|k| k.0 .0).unwrap_or(0),
            average_fee: total_fees.checked_div(tx_count as u64).unwrap_or(0),
            total_received: self.total_received,
            total_rejected: self.total_rejected,
            total_expired: self.total_expired,
            total_evicted: self.total_evicted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{TransactionBuilder, COIN};
    use crate::crypto::KeyPair;

    const NOW: i64 = 1_700_000_000;

    fn tx(key: &KeyPair, fee: Amount, timestamp: i64) -> Transaction {
        TransactionBuilder::new(key)
            .to("1recipient")
            .amount(COIN)
            .fee(fee)
            .timestamp(timestamp)
            .build_and_sign()
            .unwrap()
    }

    #[test]
    fn test_mempool_add_remove() {
        let key = KeyPair::generate();
        let mut mempool = Mempool::new();
        let t = tx(&key, 100, NOW);

        assert!(mempool.admit(t.clone(), NOW).unwrap().is_none());
        assert!(mempool.contains(&t.txid));
        assert_eq!(mempool.pending_debits(&key.address()), COIN + 100);

        assert_eq!(mempool.remove(&[t.txid.clone()]), 1);
        assert!(mempool.is_empty());
        assert_eq!(mempool.pending_debits(&key.address()), 0);
    }

    #[test]
    fn test_mempool_duplicate() {
        let key = KeyPair::generate();
        let mut mempool = Mempool::new();
        let t = tx(&key, 100, NOW);

        mempool.admit(t.clone(), NOW).unwrap();
        assert!(matches!(
            mempool.admit(t, NOW),
            Err(MempoolError::DuplicateTransaction(_))
        ));
        assert_eq!(mempool.len(), 1);
    }

    #[test]
    fn test_mempool_rejects_expired() {
        let key = KeyPair::generate();
        let mut mempool = Mempool::new();
        let old = tx(&key, 100, NOW - DEFAULT_MAX_TX_AGE - 1);

        assert!(matches!(
            mempool.admit(old, NOW),
            Err(MempoolError::Expired { .. })
        ));
    }

    #[test]
    fn test_select_orders_by_fee_then_time() {
        let key = KeyPair::generate();
        let mut mempool = Mempool::new();
        let low = tx(&key, 10, NOW - 30);
        let high_late = tx(&key, 50, NOW - 10);
        let high_early = tx(&key, 50, NOW - 20);
        for t in [&low, &high_late, &high_early] {
            mempool.admit(t.clone(), NOW).unwrap();
        }

        let ids: Vec<String> = mempool.select(10).into_iter().map(|t| t.txid).collect();
        assert_eq!(ids, vec![high_early.txid.clone(), high_late.txid.clone(), low.txid.clone()]);
        assert_eq!(mempool.select(1).len(), 1);
        // Non-destructive
        assert_eq!(mempool.len(), 3);

        let by_time: Vec<String> = mempool
            .select_by_time(10)
            .into_iter()
            .map(|t| t.txid)
            .collect();
        assert_eq!(by_time, vec![low.txid, high_early.txid, high_late.txid]);
    }

    #[test]
    fn test_mempool_max_size_evicts_lowest_fee() {
        let key = KeyPair::generate();
        let mut mempool = Mempool::with_config(2, DEFAULT_MAX_TX_AGE);
        let a = tx(&key, 10, NOW);
        let b = tx(&key, 20, NOW);
        mempool.admit(a.clone(), NOW).unwrap();
        mempool.admit(b.clone(), NOW).unwrap();

        // Not better than the lowest entry
        assert!(matches!(
            mempool.admit(tx(&key, 10, NOW), NOW),
            Err(MempoolError::Full { .. })
        ));

        let c = tx(&key, 30, NOW);
        let evicted = mempool.admit(c.clone(), NOW).unwrap();
        assert_eq!(evicted.map(|t| t.txid), Some(a.txid.clone()));
        assert_eq!(mempool.len(), 2);
        assert!(mempool.contains(&b.txid) && mempool.contains(&c.txid));
        assert_eq!(mempool.stats().total_evicted, 1);
    }

    #[test]
    fn test_sweep_removes_expired() {
        let key = KeyPair::generate();
        let mut mempool = Mempool::new();
        mempool.admit(tx(&key, 10, NOW - 3000), NOW).unwrap();
        mempool.admit(tx(&key, 10, NOW), NOW).unwrap();

        assert_eq!(mempool.sweep(NOW + 1000), 1);
        assert_eq!(mempool.len(), 1);
        assert_eq!(mempool.stats().total_expired, 1);
    }

    #[test]
    fn test_mempool_stats() {
        let key = KeyPair::generate();
        let mut mempool = Mempool::with_config(4, DEFAULT_MAX_TX_AGE);
        assert_eq!(mempool.stats().tx_count, 0);

        mempool.admit(tx(&key, 10, NOW), NOW).unwrap();
        mempool.admit(tx(&key, 30, NOW), NOW).unwrap();

        let stats = mempool.stats();
        assert_eq!(stats.tx_count, 2);
        assert_eq!(stats.total_fees, 40);
        assert_eq!(stats.min_fee, 10);
        assert_eq!(stats.max_fee, 30);
        assert_eq!(stats.average_fee, 20);
        assert!((stats.utilization - 50.0).abs() < f64::EPSILON);
    }
}
