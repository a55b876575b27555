//! Ledger engine
//!
//! The single top-level context that owns the chain and the mempool and
//! serializes every mutation of them. Lock order is always chain, then
//! mempool: admission holds the chain read lock while it writes the pool,
//! commits hold both write locks so that validation, commit and mempool
//! cleanup happen as one step.

use super::clock::Clock;
use crate::config::ChainConfig;
use crate::core::{
    Amount, Block, BlockAccepted, BlockError, Blockchain, ChainStats, LedgerView,
    MiningParameters, ReorgSummary, Transaction, TransactionError,
};
use crate::mining::{Mempool, MempoolError, MempoolStats, Miner, MiningStats};
use crate::network::BlockBroadcaster;
use crate::storage::{LedgerStore, SecurityStats, ValidationRecord, Verdict};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Ordering for [`Engine::get_pending`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PendingOrder {
    /// Highest fee first
    #[default]
    Fee,
    /// Oldest timestamp first
    Time,
}

/// Admission view: committed state minus what the pool already promised
struct PoolView<'a> {
    chain: &'a Blockchain,
    mempool: &'a Mempool,
}

impl LedgerView for PoolView<'_> {
    fn contains_txid(&self, txid: &str) -> bool {
        self.chain.contains_txid(txid) || self.mempool.contains(txid)
    }

    fn spendable(&self, address: &str) -> Amount {
        self.chain
            .balance(address)
            .saturating_sub(self.mempool.pending_debits(address))
    }
}

impl From<MempoolError> for TransactionError {
    fn from(e: MempoolError) -> Self {
        match e {
            MempoolError::DuplicateTransaction(txid) => TransactionError::Replay(txid),
            MempoolError::Expired { age, max_age } => TransactionError::Expired { age, max_age },
            MempoolError::Full { fee, lowest_fee } => TransactionError::FeeTooLow {
                fee,
                min_fee: lowest_fee.saturating_add(1),
            },
        }
    }
}

/// Owns chain + mempool and exposes the inbound interface
pub struct Engine {
    chain: Arc<RwLock<Blockchain>>,
    mempool: Arc<RwLock<Mempool>>,
    broadcaster: Arc<dyn BlockBroadcaster>,
    clock: Arc<dyn Clock>,
    /// Parent of every running mining search; replaced on each tip change
    mining: Mutex<CancellationToken>,
}

impl Engine {
    pub fn new(
        chain: Blockchain,
        broadcaster: Arc<dyn BlockBroadcaster>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mempool = Mempool::from_config(chain.config());
        Self {
            chain: Arc::new(RwLock::new(chain)),
            mempool: Arc::new(RwLock::new(mempool)),
            broadcaster,
            clock,
            mining: Mutex::new(CancellationToken::new()),
        }
    }

    /// Open (or initialize) the chain in `store` and wrap it in an engine
    pub fn open(
        config: ChainConfig,
        store: Arc<dyn LedgerStore>,
        broadcaster: Arc<dyn BlockBroadcaster>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, BlockError> {
        let chain = Blockchain::open(config, store, clock.now())?;
        Ok(Self::new(chain, broadcaster, clock))
    }

    /// Shared chain handle (read access for queries and tooling)
    pub fn chain(&self) -> Arc<RwLock<Blockchain>> {
        self.chain.clone()
    }

    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Validate and admit a transaction. Returns its txid.
    pub async fn submit_transaction(&self, tx: Transaction) -> Result<String, TransactionError> {
        let now = self.clock.now();
        let chain = self.chain.read().await;
        let mut mempool = self.mempool.write().await;

        let checked = {
            let view = PoolView {
                chain: &chain,
                mempool: &mempool,
            };
            chain.validator().validate_submission(&tx, now, &view)
        };
        let txid = tx.txid.clone();
        let result = checked
            .and_then(|_| mempool.admit(tx, now).map_err(TransactionError::from))
            .map(|evicted| {
                if let Some(evicted) = evicted {
                    debug!("Tx {} evicted to admit {}", evicted.short_id(), txid);
                }
                txid.clone()
            });

        if let Err(e) = &result {
            let record = ValidationRecord {
                txid: txid.clone(),
                verdict: Verdict::Invalid,
                reason: Some(e.to_string()),
                block_height: None,
                validated_at: now,
            };
            if let Err(store_err) = chain.store().put_validation_record(&record) {
                warn!("Failed to persist validation record: {}", store_err);
            }
            let short = txid.get(..16).unwrap_or(&txid);
            match e {
                TransactionError::Replay(_) | TransactionError::SignatureInvalid(_) => {
                    warn!("Rejected tx {}: {}", short, e)
                }
                _ => debug!("Rejected tx {}: {}", short, e),
            }
        }
        result
    }

    /// Pending transactions without removing them
    pub async fn get_pending(&self, limit: usize, order: PendingOrder) -> Vec<Transaction> {
        let mempool = self.mempool.read().await;
        match order {
            PendingOrder::Fee => mempool.select(limit),
            PendingOrder::Time => mempool.select_by_time(limit),
        }
    }

    /// Drop expired transactions from the pool
    pub async fn sweep_mempool(&self) -> usize {
        let now = self.clock.now();
        self.mempool.write().await.sweep(now)
    }

    /// Sweep the mempool every `period` until `shutdown` fires
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        period: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        engine.sweep_mempool().await;
                    }
                }
            }
            debug!("Mempool sweeper stopped");
        })
    }

    // =========================================================================
    // Blocks
    // =========================================================================

    /// Validate and commit a block from a peer or a local miner
    pub async fn submit_block(&self, block: Block) -> Result<BlockAccepted, BlockError> {
        let now = self.clock.now();
        let (accepted, announce) = {
            let mut chain = self.chain.write().await;
            let mut mempool = self.mempool.write().await;

            let accepted = chain.submit_block(block, now)?;
            let announce = match &accepted {
                BlockAccepted::Extended { height } => {
                    let committed = chain.get_block(*height).cloned();
                    if let Some(block) = &committed {
                        Self::drop_committed(&mut mempool, std::slice::from_ref(block));
                    }
                    committed
                }
                BlockAccepted::Reorganized(summary) => {
                    Self::after_reorg(&chain, &mut mempool, summary, now);
                    chain.get_block(summary.new_height).cloned()
                }
                BlockAccepted::SideBranch { .. } => None,
            };
            (accepted, announce)
        };

        if let Some(block) = announce {
            self.tip_changed().await;
            self.broadcaster.broadcast(&block);
        }
        Ok(accepted)
    }

    /// Replace the active chain with a heavier alternate chain
    pub async fn submit_chain(&self, blocks: Vec<Block>) -> Result<ReorgSummary, BlockError> {
        let now = self.clock.now();
        let (summary, tip) = {
            let mut chain = self.chain.write().await;
            let mut mempool = self.mempool.write().await;

            let summary = chain.submit_chain(blocks, now)?;
            Self::after_reorg(&chain, &mut mempool, &summary, now);
            (summary, chain.tip().clone())
        };

        self.tip_changed().await;
        self.broadcaster.broadcast(&tip);
        Ok(summary)
    }

    fn drop_committed(mempool: &mut Mempool, blocks: &[Block]) {
        let txids: Vec<&str> = blocks
            .iter()
            .flat_map(|b| b.user_transactions())
            .map(|tx| tx.txid.as_str())
            .collect();
        mempool.remove(&txids);
    }

    /// Clean the pool of the new branch's transactions and return the
    /// unwound blocks' transactions that still validate
    fn after_reorg(chain: &Blockchain, mempool: &mut Mempool, summary: &ReorgSummary, now: i64) {
        let start = summary.ancestor_height as usize + 1;
        Self::drop_committed(mempool, chain.blocks().get(start..).unwrap_or(&[]));

        let mut restored = 0usize;
        for tx in summary.disconnected.iter().flat_map(|b| b.user_transactions()) {
            let checked = {
                let view = PoolView {
                    chain,
                    mempool: &*mempool,
                };
                chain.validator().validate_submission(tx, now, &view)
            };
            match checked.and_then(|_| mempool.admit(tx.clone(), now).map_err(Into::into)) {
                Ok(_) => restored += 1,
                Err(e) => debug!("Dropping unwound tx {}: {}", tx.short_id(), e),
            }
        }
        if restored > 0 {
            info!("Returned {} unwound transactions to the mempool", restored);
        }
    }

    /// Cancel running searches; their candidates no longer extend the tip
    async fn tip_changed(&self) {
        let mut token = self.mining.lock().await;
        token.cancel();
        *token = CancellationToken::new();
    }

    /// Mine one block from the pool and submit it. Returns `None` when the
    /// search was cancelled by a tip change.
    pub async fn mine_block(
        &self,
        miner_address: &str,
        max_txs: usize,
    ) -> Result<Option<(Block, MiningStats)>, BlockError> {
        let miner = Miner::new(miner_address);
        let cancel = self.mining.lock().await.child_token();

        let candidate = {
            let chain = self.chain.read().await;
            let mut mempool = self.mempool.write().await;
            let max_txs = max_txs.min(chain.config().max_block_transactions);
            let candidate = miner.assemble(&chain, mempool.select(max_txs), self.clock.now());
            if !candidate.rejected.is_empty() {
                debug!(
                    "Dropping {} stale transactions from the mempool",
                    candidate.rejected.len()
                );
                mempool.remove(&candidate.rejected);
            }
            candidate
        };

        let mined = miner
            .mine_detached(candidate.block, cancel)
            .await
            .map_err(|e| BlockError::Malformed(format!("mining task failed: {}", e)))?;
        let Some((block, stats)) = mined else {
            return Ok(None);
        };

        match self.submit_block(block.clone()).await? {
            BlockAccepted::Extended { .. } | BlockAccepted::Reorganized(_) => Ok(Some((block, stats))),
            BlockAccepted::SideBranch { .. } => {
                info!("Mined block #{} landed on a side branch", block.index);
                Ok(None)
            }
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn get_mining_parameters(&self) -> MiningParameters {
        self.chain.read().await.mining_parameters()
    }

    pub async fn get_balance(&self, address: &str) -> Amount {
        self.chain.read().await.balance(address)
    }

    pub async fn height(&self) -> u64 {
        self.chain.read().await.height()
    }

    pub async fn chain_stats(&self) -> ChainStats {
        self.chain.read().await.stats()
    }

    pub async fn security_stats(&self) -> SecurityStats {
        self.chain.read().await.security_stats()
    }

    pub async fn mempool_stats(&self) -> MempoolStats {
        self.mempool.read().await.stats()
    }

    /// Re-verify the whole active chain
    pub async fn verify_chain(&self) -> Result<(), BlockError> {
        let now = self.clock.now();
        self.chain.read().await.verify_chain(now)
    }

    /// Flush the ledger store
    pub async fn flush(&self) -> Result<(), BlockError> {
        self.chain.read().await.store().flush()?;
        Ok(())
    }
}
