//! End-to-end ledger scenarios through the engine
//!
//! Each test drives a full node context (chain + mempool + protection) with a
//! manual clock, mining at the lowest difficulty.

use pouv_chain::config::ChainConfig;
use pouv_chain::core::{
    Block, BlockAccepted, BlockError, Blockchain, Transaction, TransactionBuilder,
    TransactionError, COIN,
};
use pouv_chain::crypto::KeyPair;
use pouv_chain::mining::Miner;
use pouv_chain::network::NullBroadcaster;
use pouv_chain::node::{Clock, Engine, ManualClock, PendingOrder};
use pouv_chain::storage::{AlertKind, SledLedger};
use std::sync::Arc;
use tempfile::tempdir;

const T0: i64 = 1_700_000_000;
const FEE: u64 = 2 * COIN / 100;

fn config(genesis_address: &str) -> ChainConfig {
    ChainConfig {
        initial_difficulty: 1,
        genesis_address: genesis_address.to_string(),
        genesis_allocation: 100 * COIN,
        genesis_timestamp: Some(T0),
        ..Default::default()
    }
}

fn engine(config: ChainConfig, clock: &ManualClock) -> Engine {
    let chain = Blockchain::in_memory(config, clock.now()).unwrap();
    Engine::new(chain, Arc::new(NullBroadcaster), Arc::new(clock.clone()))
}

fn transfer(from: &KeyPair, to: &str, amount: u64, fee: u64, timestamp: i64) -> Transaction {
    TransactionBuilder::new(from)
        .to(to)
        .amount(amount)
        .fee(fee)
        .timestamp(timestamp)
        .build_and_sign()
        .unwrap()
}

/// Mine `count` empty blocks on `chain`, one minute apart after `start`
fn extend(chain: &mut Blockchain, miner: &str, count: u64, start: i64) -> Vec<Block> {
    let miner = Miner::new(miner);
    (1..=count)
        .map(|i| miner.mine_block(chain, vec![], start + 60 * i as i64).unwrap().0)
        .collect()
}

async fn mine(engine: &Engine, clock: &ManualClock, miner: &str) -> Block {
    clock.advance(60);
    engine.mine_block(miner, 1000).await.unwrap().unwrap().0
}

// ============================================================================
// Transactions
// ============================================================================

#[tokio::test]
async fn transfer_moves_amount_fee_and_subsidy() {
    let clock = ManualClock::new(T0 + 30);
    let alice = KeyPair::generate();
    let engine = engine(config(&alice.address()), &clock);
    let subsidy = engine.get_mining_parameters().await.subsidy;

    let tx = transfer(&alice, "1bob", 10 * COIN, FEE, clock.now());
    engine.submit_transaction(tx).await.unwrap();
    mine(&engine, &clock, "1miner").await;

    assert_eq!(engine.get_balance(&alice.address()).await, 90 * COIN - FEE);
    assert_eq!(engine.get_balance("1bob").await, 10 * COIN);
    assert_eq!(engine.get_balance("1miner").await, subsidy + FEE);
}

#[tokio::test]
async fn second_full_balance_spend_is_rejected() {
    let clock = ManualClock::new(T0 + 30);
    let alice = KeyPair::generate();
    let engine = engine(config(&alice.address()), &clock);
    let everything = 100 * COIN - FEE;

    let first = transfer(&alice, "1bob", everything, FEE, clock.now());
    let second = transfer(&alice, "1carol", everything, FEE, clock.now());

    assert!(engine.submit_transaction(first).await.is_ok());
    assert!(matches!(
        engine.submit_transaction(second).await,
        Err(TransactionError::InsufficientBalance { .. })
    ));
}

#[tokio::test]
async fn resubmission_is_a_replay_pending_or_committed() {
    let clock = ManualClock::new(T0 + 30);
    let alice = KeyPair::generate();
    let engine = engine(config(&alice.address()), &clock);
    let tx = transfer(&alice, "1bob", COIN, FEE, clock.now());

    engine.submit_transaction(tx.clone()).await.unwrap();
    assert!(matches!(
        engine.submit_transaction(tx.clone()).await,
        Err(TransactionError::Replay(_))
    ));

    mine(&engine, &clock, "1miner").await;
    assert!(matches!(
        engine.submit_transaction(tx).await,
        Err(TransactionError::Replay(_))
    ));
}

#[tokio::test]
async fn genesis_marker_from_user_is_rejected() {
    let clock = ManualClock::new(T0 + 30);
    let alice = KeyPair::generate();
    let engine = engine(config(&alice.address()), &clock);

    let mut tx = transfer(&alice, "1bob", COIN, FEE, clock.now());
    tx.signature = "genesis".to_string();

    assert!(matches!(
        engine.submit_transaction(tx).await,
        Err(TransactionError::SignatureInvalid(_))
    ));
}

#[tokio::test]
async fn stale_and_future_transactions_are_rejected() {
    let clock = ManualClock::new(T0 + 10_000);
    let alice = KeyPair::generate();
    let engine = engine(config(&alice.address()), &clock);

    let stale = transfer(&alice, "1bob", COIN, FEE, clock.now() - 3601);
    let future = transfer(&alice, "1bob", COIN, FEE, clock.now() + 61);

    assert!(matches!(
        engine.submit_transaction(stale).await,
        Err(TransactionError::Expired { .. })
    ));
    assert!(matches!(
        engine.submit_transaction(future).await,
        Err(TransactionError::FutureTimestamp { .. })
    ));
}

#[tokio::test]
async fn full_mempool_evicts_lowest_fee() {
    let clock = ManualClock::new(T0 + 30);
    let alice = KeyPair::generate();
    let engine = engine(
        ChainConfig {
            mempool_capacity: 2,
            ..config(&alice.address())
        },
        &clock,
    );
    let now = clock.now();

    let low = transfer(&alice, "1bob", COIN, FEE, now);
    let mid = transfer(&alice, "1bob", COIN, FEE + 1, now);
    let high = transfer(&alice, "1bob", COIN, FEE + 2, now);
    for tx in [&low, &mid, &high] {
        engine.submit_transaction(tx.clone()).await.unwrap();
    }

    let pending = engine.get_pending(10, PendingOrder::Fee).await;
    let ids: Vec<&str> = pending.iter().map(|t| t.txid.as_str()).collect();
    assert_eq!(ids, vec![high.txid.as_str(), mid.txid.as_str()]);

    // Not better than the lowest pooled fee
    assert!(matches!(
        engine
            .submit_transaction(transfer(&alice, "1bob", COIN, FEE, now))
            .await,
        Err(TransactionError::FeeTooLow { .. })
    ));
    assert_eq!(engine.mempool_stats().await.tx_count, 2);
}

// ============================================================================
// Blocks and rewards
// ============================================================================

#[test]
fn fee_payout_off_by_one_is_rejected() {
    let alice = KeyPair::generate();
    let mut chain = Blockchain::in_memory(config(&alice.address()), T0).unwrap();
    let params = chain.mining_parameters();
    let ts = T0 + 60;

    let tx = transfer(&alice, "1bob", COIN, FEE, ts - 10);
    let build = |payout: u64, recipient: &str| {
        let mut block = Block::new(
            params.height,
            params.prev_hash.clone(),
            vec![
                Transaction::coinbase("1miner", params.subsidy, ts),
                tx.clone(),
                Transaction::miners_pool(recipient, payout, ts),
            ],
            params.difficulty,
            ts,
        );
        block.mine();
        block
    };

    for bad in [build(FEE + 1, "1miner"), build(FEE - 1, "1miner"), build(FEE, "1thief")] {
        assert!(matches!(
            chain.add_block(bad, ts),
            Err(BlockError::RewardMismatch(_))
        ));
    }
    assert!(chain.add_block(build(FEE, "1miner"), ts).is_ok());
}

#[test]
fn wrong_subsidy_is_rejected() {
    let mut chain = Blockchain::in_memory(config("1founder"), T0).unwrap();
    let params = chain.mining_parameters();
    let mut block = Block::new(
        params.height,
        params.prev_hash,
        vec![Transaction::coinbase("1miner", params.subsidy * 2, T0 + 60)],
        params.difficulty,
        T0 + 60,
    );
    block.mine();

    assert!(matches!(
        chain.add_block(block, T0 + 60),
        Err(BlockError::RewardMismatch(_))
    ));
}

#[test]
fn tampered_block_fails_proof_of_work() {
    let mut chain = Blockchain::in_memory(config("1founder"), T0).unwrap();
    let mut other = Blockchain::in_memory(config("1founder"), T0).unwrap();
    let mut block = extend(&mut other, "1miner", 1, T0).remove(0);

    block.transactions[0].recipient = "1thief".to_string();
    assert!(matches!(
        chain.add_block(block, T0 + 60),
        Err(BlockError::ProofOfWorkInvalid(_))
    ));
}

// ============================================================================
// Reorganizations and checkpoints
// ============================================================================

#[tokio::test]
async fn shallow_heavier_chain_replaces_tip() {
    let clock = ManualClock::new(T0 + 30);
    let alice = KeyPair::generate();
    let cfg = config(&alice.address());
    let engine = engine(cfg.clone(), &clock);

    let tx = transfer(&alice, "1bob", COIN, FEE, clock.now());
    engine.submit_transaction(tx.clone()).await.unwrap();
    mine(&engine, &clock, "1miner").await;
    assert_eq!(engine.get_balance("1bob").await, COIN);

    let mut rival = Blockchain::in_memory(cfg, T0).unwrap();
    let alternate = extend(&mut rival, "1rival", 2, T0);
    clock.advance(120);

    let summary = engine.submit_chain(alternate).await.unwrap();
    assert_eq!(summary.ancestor_height, 0);
    assert_eq!(summary.depth, 1);
    assert_eq!(engine.height().await, 2);
    assert_eq!(engine.get_balance("1bob").await, 0);
    assert_eq!(engine.get_balance("1miner").await, 0);

    // The unwound transfer is pending again
    let pending = engine.get_pending(10, PendingOrder::Time).await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].txid, tx.txid);
    assert!(engine.verify_chain().await.is_ok());
}

#[tokio::test]
async fn equal_work_chain_does_not_replace_tip() {
    let clock = ManualClock::new(T0);
    let cfg = config("1founder");
    let engine = engine(cfg.clone(), &clock);
    mine(&engine, &clock, "1miner").await;

    let mut rival = Blockchain::in_memory(cfg, T0).unwrap();
    let alternate = extend(&mut rival, "1rival", 1, T0);

    assert!(matches!(
        engine.submit_chain(alternate).await,
        Err(BlockError::InsufficientWork { .. })
    ));
    assert_eq!(engine.get_balance("1miner").await, 50 * COIN);
}

#[tokio::test]
async fn deep_reorg_is_rejected_even_with_more_work() {
    let clock = ManualClock::new(T0);
    let cfg = ChainConfig {
        max_reorg_depth: 2,
        ..config("1founder")
    };
    let engine = engine(cfg.clone(), &clock);
    for _ in 0..3 {
        mine(&engine, &clock, "1miner").await;
    }

    let mut rival = Blockchain::in_memory(cfg, T0).unwrap();
    let alternate = extend(&mut rival, "1rival", 6, T0);

    assert!(matches!(
        engine.submit_chain(alternate).await,
        Err(BlockError::ReorgTooDeep { depth: 3, max_depth: 2 })
    ));
    assert_eq!(engine.height().await, 3);

    let chain = engine.chain();
    let chain = chain.read().await;
    assert_eq!(chain.security_alerts()[0].kind, AlertKind::DeepReorg);
    assert_eq!(chain.security_stats().reorg_attempts_blocked, 1);
}

#[tokio::test]
async fn checkpoint_rewrite_is_rejected() {
    let clock = ManualClock::new(T0);
    let cfg = ChainConfig {
        checkpoint_interval: 2,
        ..config("1founder")
    };
    let engine = engine(cfg.clone(), &clock);
    for _ in 0..3 {
        mine(&engine, &clock, "1miner").await;
    }
    let first = engine.chain().read().await.get_block(1).cloned().unwrap();

    // Shares block 1, rewrites the checkpointed block 2
    let mut rival = Blockchain::in_memory(cfg, T0).unwrap();
    rival.add_block(first.clone(), clock.now()).unwrap();
    let mut alternate = vec![first];
    alternate.extend(extend(&mut rival, "1rival", 4, clock.now()));

    assert!(matches!(
        engine.submit_chain(alternate).await,
        Err(BlockError::CheckpointViolation { height: 2, .. })
    ));
    assert_eq!(engine.height().await, 3);
    assert_eq!(engine.security_stats().await.total_checkpoints, 1);
}

#[tokio::test]
async fn peer_blocks_build_side_branch_then_reorganize() {
    let clock = ManualClock::new(T0);
    let cfg = config("1founder");
    let engine = engine(cfg.clone(), &clock);
    mine(&engine, &clock, "1miner").await;

    let mut rival = Blockchain::in_memory(cfg, T0).unwrap();
    let alternate = extend(&mut rival, "1rival", 2, T0);
    clock.advance(120);

    assert_eq!(
        engine.submit_block(alternate[0].clone()).await.unwrap(),
        BlockAccepted::SideBranch { height: 1 }
    );
    assert!(matches!(
        engine.submit_block(alternate[1].clone()).await.unwrap(),
        BlockAccepted::Reorganized(_)
    ));
    assert_eq!(engine.get_balance("1rival").await, 100 * COIN);
}

// ============================================================================
// Persistence
// ============================================================================

#[tokio::test]
async fn sled_ledger_survives_restart() {
    let dir = tempdir().unwrap();
    let clock = ManualClock::new(T0);
    let cfg = config("1founder");

    let tip = {
        let store = SledLedger::open(dir.path()).unwrap();
        let engine = Engine::open(
            cfg.clone(),
            Arc::new(store),
            Arc::new(NullBroadcaster),
            Arc::new(clock.clone()),
        )
        .unwrap();
        mine(&engine, &clock, "1miner").await;
        let block = mine(&engine, &clock, "1miner").await;
        engine.flush().await.unwrap();
        block.hash
    };

    let store = SledLedger::open(dir.path()).unwrap();
    let engine = Engine::open(
        cfg,
        Arc::new(store),
        Arc::new(NullBroadcaster),
        Arc::new(clock.clone()),
    )
    .unwrap();

    assert_eq!(engine.height().await, 2);
    assert_eq!(engine.chain_stats().await.latest_hash, tip);
    assert_eq!(engine.get_balance("1miner").await, 100 * COIN);
    assert!(engine.verify_chain().await.is_ok());
}
