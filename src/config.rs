//! Chain configuration
//!
//! Consensus parameters with the reference defaults, overridable from
//! `POUV_*` environment variables, a JSON file in the data directory, or
//! command-line flags (in increasing order of precedence).

use crate::core::{Amount, COIN};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Name of the config file written next to the ledger store
pub const CONFIG_FILE: &str = "chain.json";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
    #[error("Inconsistent configuration: {0}")]
    Inconsistent(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// What the subsidy does once the halving count reaches the cap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PastCapPolicy {
    /// Keep paying the subsidy reached at the cap (never below `min_subsidy`)
    Freeze,
    /// Stop issuance entirely past the cap
    Zero,
}

impl FromStr for PastCapPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "freeze" => Ok(Self::Freeze),
            "zero" => Ok(Self::Zero),
            other => Err(ConfigError::InvalidValue {
                key: "past_cap_policy".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// Consensus and node parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Difficulty of the genesis block and the first retarget window
    pub initial_difficulty: u32,
    pub min_difficulty: u32,
    pub max_difficulty: u32,
    /// Target seconds between blocks
    pub target_block_time: i64,
    /// Blocks between difficulty adjustments
    pub difficulty_interval: u64,

    /// Subsidy paid at height 1 before any halving
    pub initial_reward: Amount,
    /// Blocks between subsidy halvings
    pub halving_interval: u64,
    /// Halvings are counted up to this ceiling
    pub halving_cap: u32,
    /// Lowest subsidy paid while issuance continues
    pub min_subsidy: Amount,
    pub past_cap_policy: PastCapPolicy,

    /// Minimum fee for user transactions
    pub min_tx_fee: Amount,
    /// Maximum transaction age in seconds
    pub max_tx_age: i64,
    /// Allowed clock skew for transaction timestamps in seconds
    pub max_clock_skew: i64,
    /// Maximum block timestamp drift into the future
    pub max_future_block_time: i64,

    pub mempool_capacity: usize,
    /// Upper bound on user transactions pulled into one candidate block
    pub max_block_transactions: usize,

    pub checkpoint_interval: u64,
    pub max_reorg_depth: u64,

    /// Recipient of the genesis allocation
    pub genesis_address: String,
    pub genesis_allocation: Amount,
    /// Fixed genesis timestamp; `None` stamps genesis at creation time
    pub genesis_timestamp: Option<i64>,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            initial_difficulty: 3,
            min_difficulty: 1,
            max_difficulty: 10,
            target_block_time: 60,
            difficulty_interval: 10,
            initial_reward: 50 * COIN,
            halving_interval: 1_800_000,
            halving_cap: 100,
            min_subsidy: COIN / 100_000,
            past_cap_policy: PastCapPolicy::Freeze,
            min_tx_fee: 2 * COIN / 100,
            max_tx_age: 3600,
            max_clock_skew: 60,
            max_future_block_time: 7200,
            mempool_capacity: 10_000,
            max_block_transactions: 1000,
            checkpoint_interval: 100,
            max_reorg_depth: 10,
            genesis_address: "genesis".to_string(),
            genesis_allocation: 100_000_000 * COIN,
            genesis_timestamp: None,
        }
    }
}

impl ChainConfig {
    /// Defaults overridden by any `POUV_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a key lookup (environment or test map)
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: FromStr>(key: &str, raw: String) -> Result<T, ConfigError> {
            raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw,
            })
        }

        macro_rules! env_override {
            ($field:ident, $key:literal) => {
                if let Some(raw) = lookup($key) {
                    self.$field = parse($key, raw)?;
                }
            };
        }

        env_override!(initial_difficulty, "POUV_DIFFICULTY");
        env_override!(min_difficulty, "POUV_MIN_DIFFICULTY");
        env_override!(max_difficulty, "POUV_MAX_DIFFICULTY");
        env_override!(target_block_time, "POUV_TARGET_BLOCK_TIME");
        env_override!(difficulty_interval, "POUV_DIFFICULTY_INTERVAL");
        env_override!(initial_reward, "POUV_STARTING_BLOCK_REWARD");
        env_override!(halving_interval, "POUV_HALVING_INTERVAL");
        env_override!(halving_cap, "POUV_HALVING_CAP");
        env_override!(min_subsidy, "POUV_MIN_SUBSIDY");
        env_override!(past_cap_policy, "POUV_PAST_CAP_POLICY");
        env_override!(min_tx_fee, "POUV_MIN_TX_FEE");
        env_override!(max_tx_age, "POUV_MAX_TX_AGE");
        env_override!(max_clock_skew, "POUV_MAX_CLOCK_SKEW");
        env_override!(mempool_capacity, "POUV_MEMPOOL_CAPACITY");
        env_override!(max_block_transactions, "POUV_MAX_BLOCK_TXS");
        env_override!(checkpoint_interval, "POUV_CHECKPOINT_INTERVAL");
        env_override!(max_reorg_depth, "POUV_MAX_REORG_DEPTH");
        env_override!(genesis_address, "POUV_GENESIS_ADDRESS");
        env_override!(genesis_allocation, "POUV_GENESIS_ALLOCATION");

        Ok(())
    }

    /// Reject parameter combinations the consensus code cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_difficulty > self.max_difficulty {
            return Err(ConfigError::Inconsistent(format!(
                "min_difficulty {} exceeds max_difficulty {}",
                self.min_difficulty, self.max_difficulty
            )));
        }
        if !(self.min_difficulty..=self.max_difficulty).contains(&self.initial_difficulty) {
            return Err(ConfigError::Inconsistent(format!(
                "initial_difficulty {} outside [{}, {}]",
                self.initial_difficulty, self.min_difficulty, self.max_difficulty
            )));
        }
        // Digests are 64 hex digits
        if self.max_difficulty > 64 {
            return Err(ConfigError::Inconsistent(
                "max_difficulty cannot exceed 64 hex digits".to_string(),
            ));
        }
        if self.difficulty_interval < 2 {
            return Err(ConfigError::Inconsistent(
                "difficulty_interval must be at least 2 blocks".to_string(),
            ));
        }
        if self.target_block_time <= 0 {
            return Err(ConfigError::Inconsistent(
                "target_block_time must be positive".to_string(),
            ));
        }
        if self.halving_interval == 0 || self.checkpoint_interval == 0 {
            return Err(ConfigError::Inconsistent(
                "halving_interval and checkpoint_interval must be non-zero".to_string(),
            ));
        }
        if self.mempool_capacity == 0 {
            return Err(ConfigError::Inconsistent(
                "mempool_capacity must be non-zero".to_string(),
            ));
        }
        if self.max_tx_age <= 0 || self.max_clock_skew < 0 {
            return Err(ConfigError::Inconsistent(
                "transaction time window must be positive".to_string(),
            ));
        }
        if self.genesis_address.is_empty() {
            return Err(ConfigError::Inconsistent(
                "genesis_address must be set".to_string(),
            ));
        }
        Ok(())
    }

    /// Load a config file written by [`ChainConfig::save`]
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Persist the config as pretty JSON
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}
