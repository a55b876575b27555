//! Block reward and fee accounting
//!
//! The subsidy halves every `halving_interval` blocks. Halvings are counted
//! up to a fixed cap before shifting, so the computation never overflows.
//! Fees are paid on top of the subsidy through a separate `miners_pool`
//! transaction that must equal the exact sum of user fees in the block.
//!
//! Block layout: the coinbase comes first, user transactions follow in
//! mempool order, and the fee payout (when fees are non-zero) comes last.

use crate::config::{ChainConfig, PastCapPolicy};
use crate::core::block::{Block, BlockError};
use crate::core::transaction::{Amount, Transaction};

/// Deterministic subsidy schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RewardSchedule {
    pub initial_reward: Amount,
    pub halving_interval: u64,
    pub halving_cap: u32,
    pub min_subsidy: Amount,
    pub past_cap_policy: PastCapPolicy,
}

impl From<&ChainConfig> for RewardSchedule {
    fn from(config: &ChainConfig) -> Self {
        Self {
            initial_reward: config.initial_reward,
            halving_interval: config.halving_interval,
            halving_cap: config.halving_cap,
            min_subsidy: config.min_subsidy,
            past_cap_policy: config.past_cap_policy,
        }
    }
}

impl Default for RewardSchedule {
    fn default() -> Self {
        Self::from(&ChainConfig::default())
    }
}

impl RewardSchedule {
    /// Number of halvings that have happened by `height`
    pub fn halvings(&self, height: u64) -> u64 {
        height / self.halving_interval
    }

    /// Subsidy paid by the coinbase of the block at `height`
    pub fn subsidy(&self, height: u64) -> Amount {
        let halvings = self.halvings(height);
        let cap = u64::from(self.halving_cap);

        if halvings > cap && self.past_cap_policy == PastCapPolicy::Zero {
            return 0;
        }

        let shift = halvings.min(cap) as u32;
        let halved = self.initial_reward.checked_shr(shift).unwrap_or(0);
        halved.max(self.min_subsidy)
    }

    /// Coinbase and (optional) fee payout for a new block
    pub fn payout_transactions(
        &self,
        miner_address: &str,
        height: u64,
        total_fees: Amount,
        timestamp: i64,
    ) -> (Transaction, Option<Transaction>) {
        let coinbase = Transaction::coinbase(miner_address, self.subsidy(height), timestamp);
        let fee_payout = (total_fees > 0)
            .then(|| Transaction::miners_pool(miner_address, total_fees, timestamp));
        (coinbase, fee_payout)
    }

    /// Check the block's payout transactions against its height and fees
    pub fn verify_block_rewards(&self, block: &Block) -> Result<(), BlockError> {
        let coinbases = block.coinbase_txs();
        if coinbases.len() != 1 {
            return Err(BlockError::RewardMismatch(format!(
                "block {} has {} coinbase transactions, expected exactly one",
                block.index,
                coinbases.len()
            )));
        }
        let coinbase = coinbases[0];
        if block.transactions.first().map(|tx| &tx.txid) != Some(&coinbase.txid) {
            return Err(BlockError::RewardMismatch(
                "coinbase must be the first transaction".to_string(),
            ));
        }

        let expected_subsidy = self.subsidy(block.index);
        if coinbase.amount != expected_subsidy {
            return Err(BlockError::RewardMismatch(format!(
                "coinbase pays {}, subsidy at height {} is {}",
                coinbase.amount, block.index, expected_subsidy
            )));
        }

        let fees = block
            .total_fees()
            .ok_or_else(|| BlockError::RewardMismatch("fee sum overflows".to_string()))?;
        let payouts = block.fee_payout_txs();

        if fees == 0 {
            if !payouts.is_empty() {
                return Err(BlockError::RewardMismatch(
                    "fee payout present in a block without fees".to_string(),
                ));
            }
            return Ok(());
        }

        if payouts.len() != 1 {
            return Err(BlockError::RewardMismatch(format!(
                "block {} has {} fee payouts, expected exactly one",
                block.index,
                payouts.len()
            )));
        }
        let payout = payouts[0];
        if block.transactions.last().map(|tx| &tx.txid) != Some(&payout.txid) {
            return Err(BlockError::RewardMismatch(
                "fee payout must be the last transaction".to_string(),
            ));
        }
        if payout.recipient != coinbase.recipient {
            return Err(BlockError::RewardMismatch(format!(
                "fee payout goes to {}, miner is {}",
                payout.recipient, coinbase.recipient
            )));
        }
        if payout.amount != fees {
            return Err(BlockError::RewardMismatch(format!(
                "fee payout {} does not equal fee sum {}",
                payout.amount, fees
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transaction::{Sender, COIN};

    fn schedule() -> RewardSchedule {
        RewardSchedule {
            halving_interval: 100,
            ..Default::default()
        }
    }

    fn block_with(index: u64, txs: Vec<Transaction>) -> Block {
        Block::new(index, "0".repeat(64), txs, 1, 1_700_000_000)
    }

    fn user_tx(fee: Amount) -> Transaction {
        Transaction::new(Sender::User("02ab".to_string()), "1bob", COIN, fee, 1_700_000_000)
    }

    #[test]
    fn test_halving_schedule() {
        let schedule = schedule();
        assert_eq!(schedule.subsidy(0), 50 * COIN);
        assert_eq!(schedule.subsidy(99), 50 * COIN);
        assert_eq!(schedule.subsidy(100), 25 * COIN);
        assert_eq!(schedule.subsidy(300), 50 * COIN / 8);
    }

    #[test]
    fn test_subsidy_floor_and_cap() {
        let schedule = schedule();
        // Far past the cap the shift saturates and the floor applies
        assert_eq!(schedule.subsidy(u64::MAX), schedule.min_subsidy);
        assert_eq!(schedule.subsidy(100 * 100), schedule.min_subsidy);

        let zero = RewardSchedule {
            past_cap_policy: PastCapPolicy::Zero,
            ..schedule
        };
        assert_eq!(zero.subsidy(100 * 100), zero.min_subsidy);
        assert_eq!(zero.subsidy(100 * 101), 0);
    }

    #[test]
    fn test_exact_payout_accepted() {
        let schedule = schedule();
        let fees = 3 * COIN / 100;
        let (coinbase, payout) = schedule.payout_transactions("1miner", 5, fees, 1);
        let block = block_with(5, vec![coinbase, user_tx(fees), payout.unwrap()]);
        assert!(schedule.verify_block_rewards(&block).is_ok());
    }

    #[test]
    fn test_fee_payout_off_by_one_unit() {
        let schedule = schedule();
        let fees = 3 * COIN / 100;
        let (coinbase, _) = schedule.payout_transactions("1miner", 5, fees, 1);
        for wrong in [fees - 1, fees + 1] {
            let payout = Transaction::miners_pool("1miner", wrong, 1);
            let block = block_with(5, vec![coinbase.clone(), user_tx(fees), payout]);
            assert!(matches!(
                schedule.verify_block_rewards(&block),
                Err(BlockError::RewardMismatch(_))
            ));
        }
    }

    #[test]
    fn test_wrong_subsidy_rejected() {
        let schedule = schedule();
        let coinbase = Transaction::coinbase("1miner", 51 * COIN, 1);
        let block = block_with(5, vec![coinbase]);
        assert!(schedule.verify_block_rewards(&block).is_err());
    }

    #[test]
    fn test_payout_without_fees_rejected() {
        let schedule = schedule();
        let (coinbase, _) = schedule.payout_transactions("1miner", 5, 0, 1);
        let stray = Transaction::miners_pool("1miner", 1, 1);
        let block = block_with(5, vec![coinbase, stray]);
        assert!(schedule.verify_block_rewards(&block).is_err());
    }

    #[test]
    fn test_fee_payout_to_other_address_rejected() {
        let schedule = schedule();
        let fees = COIN / 10;
        let (coinbase, _) = schedule.payout_transactions("1miner", 5, fees, 1);
        let payout = Transaction::miners_pool("1owner", fees, 1);
        let block = block_with(5, vec![coinbase, user_tx(fees), payout]);
        assert!(schedule.verify_block_rewards(&block).is_err());
    }

    #[test]
    fn test_two_coinbases_rejected() {
        let schedule = schedule();
        let (a, _) = schedule.payout_transactions("1miner", 5, 0, 1);
        let (b, _) = schedule.payout_transactions("1miner", 5, 0, 2);
        let block = block_with(5, vec![a, b]);
        assert!(schedule.verify_block_rewards(&block).is_err());
    }
}
