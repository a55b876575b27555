//! Storage module: ledger store, sled persistence and chain protection

pub mod checkpoint;
pub mod ledger;
pub mod persistence;

pub use checkpoint::{
    AlertKind, ChainProtection, Checkpoint, CheckpointResult, SecurityAlert, SecurityStats,
    TipRef,
};
pub use ledger::{BalanceDelta, LedgerStore, MemoryLedger, ValidationRecord, Verdict};
pub use persistence::{SledLedger, StorageError};
