//! Transaction handling for the ledger
//!
//! Account-model transfers between addresses. A user transaction carries
//! the sender's compressed public key and an ECDSA signature over its
//! signing payload; the two system senders (`coinbase` and `miners_pool`)
//! issue block payouts and carry the literal `genesis` signature.

use crate::crypto::{address_from_public_key_hex, public_key_from_hex, sha256, sha256_hex};
use crate::crypto::{verify_signature as verify_ecdsa, KeyPair};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Amounts are integer base units
pub type Amount = u64;

/// Base units per coin (8 decimal places)
pub const COIN: Amount = 100_000_000;

/// Signature marker reserved for system senders
pub const GENESIS_SIGNATURE: &str = "genesis";

/// Reserved sender string for block subsidies
pub const COINBASE_SENDER: &str = "coinbase";

/// Reserved sender string for fee payouts
pub const MINERS_POOL_SENDER: &str = "miners_pool";

// =============================================================================
// Error Types
// =============================================================================

/// Reasons a transaction is rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("Malformed transaction: {0}")]
    MalformedInput(String),
    #[error("Transaction expired: {age}s old, limit {max_age}s")]
    Expired { age: i64, max_age: i64 },
    #[error("Transaction timestamp {timestamp} is ahead of reference time {reference}")]
    FutureTimestamp { timestamp: i64, reference: i64 },
    #[error("Transaction {0} already seen (replay)")]
    Replay(String),
    #[error("Invalid signature: {0}")]
    SignatureInvalid(String),
    #[error("Fee too low: {fee} < minimum {min_fee}")]
    FeeTooLow { fee: Amount, min_fee: Amount },
    #[error("Insufficient balance: need {needed}, have {available}")]
    InsufficientBalance { needed: Amount, available: Amount },
}

// =============================================================================
// Sender
// =============================================================================

/// Originator of a transaction
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Sender {
    /// A user, identified by the hex-encoded compressed public key
    User(String),
    /// Block subsidy issuer
    Coinbase,
    /// Fee payout issuer
    MinersPool,
}

impl Sender {
    /// Whether this is one of the reserved system senders
    pub fn is_system(&self) -> bool {
        !matches!(self, Sender::User(_))
    }

    /// Address debited by this sender, `None` for system senders
    pub fn debit_address(&self) -> Result<Option<String>, TransactionError> {
        match self {
            Sender::User(public_key) => address_from_public_key_hex(public_key)
                .map(Some)
                .map_err(|e| TransactionError::MalformedInput(format!("sender key: {}", e))),
            _ => Ok(None),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Sender::User(public_key) => public_key,
            Sender::Coinbase => COINBASE_SENDER,
            Sender::MinersPool => MINERS_POOL_SENDER,
        }
    }
}

impl fmt::Display for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for Sender {
    type Error = TransactionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            COINBASE_SENDER => Ok(Sender::Coinbase),
            MINERS_POOL_SENDER => Ok(Sender::MinersPool),
            "" => Err(TransactionError::MalformedInput("empty sender".to_string())),
            _ => Ok(Sender::User(value)),
        }
    }
}

impl From<Sender> for String {
    fn from(sender: Sender) -> Self {
        match sender {
            Sender::User(public_key) => public_key,
            other => other.as_str().to_string(),
        }
    }
}

// =============================================================================
// Transaction
// =============================================================================

/// A ledger transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub sender: Sender,
    /// Recipient address
    pub recipient: String,
    pub amount: Amount,
    pub fee: Amount,
    /// Unix seconds
    pub timestamp: i64,
    /// Random value that keeps otherwise identical transfers distinct
    pub nonce: u64,
    /// Hex SHA-256 over the economic fields
    pub txid: String,
    /// Hex compact ECDSA signature, or `genesis` for system senders
    pub signature: String,
}

/// Every field but the signature, in declaration order
#[derive(Serialize)]
struct SigningPayload<'a> {
    sender: &'a str,
    recipient: &'a str,
    amount: Amount,
    fee: Amount,
    timestamp: i64,
    nonce: u64,
    txid: &'a str,
}

/// Transaction ID over `[sender, recipient, amount, fee, timestamp, nonce]`.
/// The fields are hashed as a JSON array so no two field sets share a
/// preimage.
pub fn make_txid(
    sender: &Sender,
    recipient: &str,
    amount: Amount,
    fee: Amount,
    timestamp: i64,
    nonce: u64,
) -> String {
    let fields = (sender.as_str(), recipient, amount, fee, timestamp, nonce);
    // A tuple of strings and integers always serializes
    sha256_hex(&serde_json::to_vec(&fields).unwrap_or_default())
}

impl Transaction {
    /// Create an unsigned transaction with a random nonce
    pub fn new(
        sender: Sender,
        recipient: &str,
        amount: Amount,
        fee: Amount,
        timestamp: i64,
    ) -> Self {
        let nonce = rand::thread_rng().gen();
        Self::with_nonce(sender, recipient, amount, fee, timestamp, nonce)
    }

    /// Create an unsigned transaction with an explicit nonce
    pub fn with_nonce(
        sender: Sender,
        recipient: &str,
        amount: Amount,
        fee: Amount,
        timestamp: i64,
        nonce: u64,
    ) -> Self {
        let mut tx = Self {
            sender,
            recipient: recipient.to_string(),
            amount,
            fee,
            timestamp,
            nonce,
            txid: String::new(),
            signature: String::new(),
        };
        tx.txid = tx.compute_txid();
        tx
    }

    /// Block subsidy payout
    pub fn coinbase(recipient: &str, amount: Amount, timestamp: i64) -> Self {
        Self::system(Sender::Coinbase, recipient, amount, timestamp)
    }

    /// Fee payout to the block's miner
    pub fn miners_pool(recipient: &str, amount: Amount, timestamp: i64) -> Self {
        Self::system(Sender::MinersPool, recipient, amount, timestamp)
    }

    fn system(sender: Sender, recipient: &str, amount: Amount, timestamp: i64) -> Self {
        let mut tx = Self::new(sender, recipient, amount, 0, timestamp);
        tx.signature = GENESIS_SIGNATURE.to_string();
        tx
    }

    pub fn is_system(&self) -> bool {
        self.sender.is_system()
    }

    pub fn is_coinbase(&self) -> bool {
        self.sender == Sender::Coinbase
    }

    pub fn is_fee_payout(&self) -> bool {
        self.sender == Sender::MinersPool
    }

    /// Recompute the transaction ID from the economic fields
    pub fn compute_txid(&self) -> String {
        make_txid(
            &self.sender,
            &self.recipient,
            self.amount,
            self.fee,
            self.timestamp,
            self.nonce,
        )
    }

    /// Whether the stored txid matches the fields
    pub fn txid_matches(&self) -> bool {
        self.txid == self.compute_txid()
    }

    /// `amount + fee`, or `None` on overflow
    pub fn total_debit(&self) -> Option<Amount> {
        self.amount.checked_add(self.fee)
    }

    /// Canonical JSON bytes covered by the signature
    pub fn signing_payload(&self) -> Vec<u8> {
        let payload = SigningPayload {
            sender: self.sender.as_str(),
            recipient: &self.recipient,
            amount: self.amount,
            fee: self.fee,
            timestamp: self.timestamp,
            nonce: self.nonce,
            txid: &self.txid,
        };
        // A struct of strings and integers always serializes
        serde_json::to_vec(&payload).unwrap_or_default()
    }

    /// Merkle leaf: commits to every field, signature and stored txid
    /// included
    pub fn leaf_hash(&self) -> Vec<u8> {
        sha256(&serde_json::to_vec(self).unwrap_or_default())
    }

    /// SHA-256 of the signing payload; the message actually signed
    pub fn signing_digest(&self) -> Vec<u8> {
        sha256(&self.signing_payload())
    }

    /// Sign with the key pair whose public key is the sender
    pub fn sign(&mut self, key_pair: &KeyPair) -> Result<(), TransactionError> {
        match &self.sender {
            Sender::User(public_key) if *public_key == key_pair.public_key_hex() => {}
            Sender::User(_) => {
                return Err(TransactionError::SignatureInvalid(
                    "signing key does not match sender".to_string(),
                ))
            }
            _ => {
                return Err(TransactionError::SignatureInvalid(
                    "system transactions are not signed".to_string(),
                ))
            }
        }

        let signature = key_pair
            .sign(&self.signing_digest())
            .map_err(|e| TransactionError::SignatureInvalid(e.to_string()))?;
        self.signature = hex::encode(signature);
        Ok(())
    }

    /// Check the signature rules for this sender kind
    pub fn verify_signature(&self) -> Result<(), TransactionError> {
        let public_key_hex = match &self.sender {
            Sender::User(public_key) => public_key,
            _ if self.signature == GENESIS_SIGNATURE => return Ok(()),
            _ => {
                return Err(TransactionError::SignatureInvalid(
                    "system transaction without genesis marker".to_string(),
                ))
            }
        };

        if self.signature.is_empty() || self.signature == GENESIS_SIGNATURE {
            return Err(TransactionError::SignatureInvalid(
                "user transaction missing signature".to_string(),
            ));
        }

        let public_key = public_key_from_hex(public_key_hex)
            .map_err(|e| TransactionError::SignatureInvalid(e.to_string()))?;
        let signature = hex::decode(&self.signature)
            .map_err(|_| TransactionError::SignatureInvalid("signature is not hex".to_string()))?;

        match verify_ecdsa(&public_key, &self.signing_digest(), &signature) {
            Ok(true) => Ok(()),
            Ok(false) => Err(TransactionError::SignatureInvalid(
                "signature does not match payload".to_string(),
            )),
            Err(e) => Err(TransactionError::SignatureInvalid(e.to_string())),
        }
    }

    /// Short txid prefix for log lines
    pub fn short_id(&self) -> &str {
        self.txid.get(..16).unwrap_or(&self.txid)
    }
}

// =============================================================================
// Transaction Builder
// =============================================================================

/// Builder for signed user transfers
pub struct TransactionBuilder<'a> {
    key_pair: &'a KeyPair,
    recipient: String,
    amount: Amount,
    fee: Amount,
    timestamp: i64,
    nonce: Option<u64>,
}

impl<'a> TransactionBuilder<'a> {
    pub fn new(key_pair: &'a KeyPair) -> Self {
        Self {
            key_pair,
            recipient: String::new(),
            amount: 0,
            fee: 0,
            timestamp: chrono::Utc::now().timestamp(),
            nonce: None,
        }
    }

    pub fn to(mut self, recipient: &str) -> Self {
        self.recipient = recipient.to_string();
        self
    }

    pub fn amount(mut self, amount: Amount) -> Self {
        self.amount = amount;
        self
    }

    pub fn fee(mut self, fee: Amount) -> Self {
        self.fee = fee;
        self
    }

    pub fn timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn nonce(mut self, nonce: u64) -> Self {
        self.nonce = Some(nonce);
        self
    }

    /// Build and sign the transaction
    pub fn build_and_sign(self) -> Result<Transaction, TransactionError> {
        let sender = Sender::User(self.key_pair.public_key_hex());
        let mut tx = match self.nonce {
            Some(nonce) => Transaction::with_nonce(
                sender,
                &self.recipient,
                self.amount,
                self.fee,
                self.timestamp,
                nonce,
            ),
            None => Transaction::new(sender, &self.recipient, self.amount, self.fee, self.timestamp),
        };
        tx.sign(self.key_pair)?;
        Ok(tx)
    }
}
