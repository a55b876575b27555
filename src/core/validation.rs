//! Transaction validation
//!
//! Every node re-validates every transaction, at admission and again when
//! the transaction is committed in a block. Checks run in a fixed order and
//! the first failure is reported:
//!
//! 1. structure (txid, recipient, amounts)
//! 2. timestamp window
//! 3. replay against known txids
//! 4. signature
//! 5. fee floor
//! 6. spendable balance

use super::transaction::{Amount, Transaction, TransactionError};
use crate::config::ChainConfig;
use crate::crypto::is_hex_digest;
use crate::storage::BalanceDelta;
use log::warn;
use std::collections::{HashMap, HashSet};
use std::thread;

/// State the validator reads: known txids and spendable balances
pub trait LedgerView {
    /// Whether the txid is already committed (or pending, at admission)
    fn contains_txid(&self, txid: &str) -> bool;

    /// Confirmed balance minus whatever is already reserved
    fn spendable(&self, address: &str) -> Amount;
}

/// Thresholds applied by the validator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationRules {
    pub min_fee: Amount,
    pub max_age: i64,
    pub max_clock_skew: i64,
}

impl From<&ChainConfig> for ValidationRules {
    fn from(config: &ChainConfig) -> Self {
        Self {
            min_fee: config.min_tx_fee,
            max_age: config.max_tx_age,
            max_clock_skew: config.max_clock_skew,
        }
    }
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self::from(&ChainConfig::default())
    }
}

/// Stateless and stateful transaction checks
#[derive(Debug, Clone, Copy)]
pub struct TransactionValidator {
    rules: ValidationRules,
}

impl TransactionValidator {
    pub fn new(rules: ValidationRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &ValidationRules {
        &self.rules
    }

    /// Run every check against `reference_time` and `view`
    pub fn validate<V: LedgerView + ?Sized>(
        &self,
        tx: &Transaction,
        reference_time: i64,
        view: &V,
    ) -> Result<(), TransactionError> {
        self.validate_with(tx, reference_time, view, |tx| tx.verify_signature())
    }

    /// Admission of a client-submitted transaction. System payouts only
    /// exist inside blocks and are never pooled.
    pub fn validate_submission<V: LedgerView + ?Sized>(
        &self,
        tx: &Transaction,
        reference_time: i64,
        view: &V,
    ) -> Result<(), TransactionError> {
        if tx.is_system() {
            warn!(
                "Rejected submitted {} transaction {}",
                tx.sender.as_str(),
                tx.short_id()
            );
            return Err(TransactionError::MalformedInput(format!(
                "{} transactions are only valid inside blocks",
                tx.sender.as_str()
            )));
        }
        self.validate(tx, reference_time, view)
    }

    /// Like [`validate`](Self::validate), with the signature outcome supplied
    /// by the caller (used after a parallel verification pass)
    pub fn validate_presigned<V: LedgerView + ?Sized>(
        &self,
        tx: &Transaction,
        reference_time: i64,
        view: &V,
        signature: Result<(), TransactionError>,
    ) -> Result<(), TransactionError> {
        self.validate_with(tx, reference_time, view, move |_| signature)
    }

    fn validate_with<V, F>(
        &self,
        tx: &Transaction,
        reference_time: i64,
        view: &V,
        verify: F,
    ) -> Result<(), TransactionError>
    where
        V: LedgerView + ?Sized,
        F: FnOnce(&Transaction) -> Result<(), TransactionError>,
    {
        let debit = check_structure(tx)?;
        self.check_timestamp(tx, reference_time)?;

        if view.contains_txid(&tx.txid) {
            warn!("Replay rejected: txid {}", tx.short_id());
            return Err(TransactionError::Replay(tx.txid.clone()));
        }

        if let Err(e) = verify(tx) {
            warn!(
                "Signature rejected: sender {} txid {}: {}",
                tx.sender.as_str().chars().take(16).collect::<String>(),
                tx.short_id(),
                e
            );
            return Err(e);
        }

        if tx.is_system() {
            return Ok(());
        }

        if tx.fee < self.rules.min_fee {
            return Err(TransactionError::FeeTooLow {
                fee: tx.fee,
                min_fee: self.rules.min_fee,
            });
        }

        if let Some((address, needed)) = debit {
            let available = view.spendable(&address);
            if available < needed {
                return Err(TransactionError::InsufficientBalance { needed, available });
            }
        }

        Ok(())
    }

    /// Timestamp must lie in `[reference - max_age, reference + skew]`
    pub fn check_timestamp(
        &self,
        tx: &Transaction,
        reference_time: i64,
    ) -> Result<(), TransactionError> {
        if tx.timestamp > reference_time.saturating_add(self.rules.max_clock_skew) {
            return Err(TransactionError::FutureTimestamp {
                timestamp: tx.timestamp,
                reference: reference_time,
            });
        }
        let age = reference_time.saturating_sub(tx.timestamp);
        if age > self.rules.max_age {
            return Err(TransactionError::Expired {
                age,
                max_age: self.rules.max_age,
            });
        }
        Ok(())
    }
}

impl Default for TransactionValidator {
    fn default() -> Self {
        Self::new(ValidationRules::default())
    }
}

/// Structural checks. Returns the debited address and total debit for user
/// transactions.
pub fn check_structure(tx: &Transaction) -> Result<Option<(String, Amount)>, TransactionError> {
    if tx.recipient.trim().is_empty() {
        return Err(TransactionError::MalformedInput("empty recipient".to_string()));
    }
    if !is_hex_digest(&tx.txid, 32) {
        return Err(TransactionError::MalformedInput(
            "txid is not a 32-byte hex digest".to_string(),
        ));
    }
    if !tx.txid_matches() {
        return Err(TransactionError::MalformedInput(
            "txid does not match transaction data".to_string(),
        ));
    }

    let total = tx
        .total_debit()
        .ok_or_else(|| TransactionError::MalformedInput("amount + fee overflows".to_string()))?;

    match tx.sender.debit_address()? {
        Some(address) => {
            if tx.amount == 0 {
                return Err(TransactionError::MalformedInput(
                    "amount must be positive".to_string(),
                ));
            }
            Ok(Some((address, total)))
        }
        None => {
            if tx.fee != 0 {
                return Err(TransactionError::MalformedInput(
                    "system transactions carry no fee".to_string(),
                ));
            }
            Ok(None)
        }
    }
}

// =============================================================================
// Scratch balance view
// =============================================================================

/// Balances overlaid with the effects of transactions applied so far, so
/// that transactions in one block cannot jointly overspend
pub struct ScratchView<'a> {
    base: &'a HashMap<String, Amount>,
    known: &'a dyn Fn(&str) -> bool,
    overlay: HashMap<String, Amount>,
    applied: HashSet<String>,
}

impl<'a> ScratchView<'a> {
    /// `known` reports txids already committed below this view
    pub fn new(base: &'a HashMap<String, Amount>, known: &'a dyn Fn(&str) -> bool) -> Self {
        Self {
            base,
            known,
            overlay: HashMap::new(),
            applied: HashSet::new(),
        }
    }

    pub fn balance(&self, address: &str) -> Amount {
        self.overlay
            .get(address)
            .or_else(|| self.base.get(address))
            .copied()
            .unwrap_or(0)
    }

    /// Debit the sender and credit the recipient
    pub fn apply(&mut self, tx: &Transaction) -> Result<(), TransactionError> {
        if let Some(address) = tx.sender.debit_address()? {
            let needed = tx.total_debit().ok_or_else(|| {
                TransactionError::MalformedInput("amount + fee overflows".to_string())
            })?;
            let available = self.balance(&address);
            let remaining = available
                .checked_sub(needed)
                .ok_or(TransactionError::InsufficientBalance { needed, available })?;
            self.overlay.insert(address, remaining);
        }

        let credited = self
            .balance(&tx.recipient)
            .checked_add(tx.amount)
            .ok_or_else(|| TransactionError::MalformedInput("balance overflows".to_string()))?;
        self.overlay.insert(tx.recipient.clone(), credited);
        self.applied.insert(tx.txid.clone());
        Ok(())
    }

    /// Post-block balances of every touched address
    pub fn into_delta(self) -> BalanceDelta {
        BalanceDelta {
            balances: self.overlay.into_iter().collect(),
        }
    }
}

impl LedgerView for ScratchView<'_> {
    fn contains_txid(&self, txid: &str) -> bool {
        self.applied.contains(txid) || (self.known)(txid)
    }

    fn spendable(&self, address: &str) -> Amount {
        self.balance(address)
    }
}

/// Verify signatures of many transactions across scoped worker threads.
/// Results are returned in input order.
pub fn verify_signatures_parallel(txs: &[Transaction]) -> Vec<Result<(), TransactionError>> {
    let workers = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(txs.len().max(1));

    if workers <= 1 || txs.len() < 8 {
        return txs.iter().map(Transaction::verify_signature).collect();
    }

    let chunk_size = txs.len().div_ceil(workers);
    thread::scope(|scope| {
        let handles: Vec<_> = txs
            .chunks(chunk_size)
            .map(|chunk| {
                let handle = scope.spawn(move || {
                    chunk
                        .iter()
                        .map(Transaction::verify_signature)
                        .collect::<Vec<_>>()
                });
                (chunk.len(), handle)
            })
            .collect();

        handles
            .into_iter()
            .flat_map(|(len, handle)| {
                handle.join().unwrap_or_else(|_| {
                    let failed = TransactionError::SignatureInvalid(
                        "verification worker panicked".to_string(),
                    );
                    vec![Err(failed); len]
                })
            })
            .collect()
    })
}
