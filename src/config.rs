//! Configuration management for EpochChain

use crate::crypto::address_from_hex;
use crate::protocol::Account;
use crate::error::{ChainError, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub consensus: ConsensusConfig,
    #[serde(default)]
    pub sharding: ShardingConfig,
    #[serde(default)]
    pub genesis: GenesisConfig,
    #[serde(default)]
    pub miner: MinerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeSection {
    /// The bootstrap node creates genesis and computes the shard mapping.
    #[serde(default)]
    pub bootstrap: bool,
    #[serde(default = "default_db_path")]
    pub database_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsensusConfig {
    /// Number of leading zero bits the adjusted PoS digest must have.
    #[serde(default = "default_difficulty")]
    pub difficulty: u8,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_num_included_prev_proofs")]
    pub num_included_prev_proofs: usize,
    #[serde(default = "default_block_reward")]
    pub block_reward: u64,
    #[serde(default = "default_staking_minimum")]
    pub staking_minimum: u64,
    #[serde(default = "default_max_block_transactions")]
    pub max_block_transactions: usize,
    #[serde(default = "default_zero_balance_backoff_ms")]
    pub zero_balance_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShardingConfig {
    #[serde(default = "default_epoch_length")]
    pub epoch_length: u32,
    #[serde(default = "default_validators_per_shard")]
    pub validators_per_shard: usize,
    #[serde(default = "default_mapping_timeout_secs")]
    pub mapping_timeout_secs: u64,
    /// Embed the full account state in epoch blocks so joiners can start from it.
    #[serde(default = "default_true")]
    pub state_snapshot: bool,
    #[serde(default = "default_max_pending_transitions")]
    pub max_pending_transitions: usize,
    #[serde(default = "default_max_orphans")]
    pub max_orphans: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenesisConfig {
    #[serde(default = "default_root_balance")]
    pub root_balance: u64,
    #[serde(default)]
    pub allocations: Vec<Allocation>,
}

/// Extra account credited at genesis. Keys are hex encoded; an account with
/// a commitment key starts out staking.
#[derive(Debug, Clone, Deserialize)]
pub struct Allocation {
    pub address: String,
    pub balance: u64,
    #[serde(default)]
    pub commitment_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MinerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            bootstrap: false,
            database_path: default_db_path(),
        }
    }
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            difficulty: default_difficulty(),
            tick_interval_ms: default_tick_interval_ms(),
            num_included_prev_proofs: default_num_included_prev_proofs(),
            block_reward: default_block_reward(),
            staking_minimum: default_staking_minimum(),
            max_block_transactions: default_max_block_transactions(),
            zero_balance_backoff_ms: default_zero_balance_backoff_ms(),
        }
    }
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            epoch_length: default_epoch_length(),
            validators_per_shard: default_validators_per_shard(),
            mapping_timeout_secs: default_mapping_timeout_secs(),
            state_snapshot: default_true(),
            max_pending_transitions: default_max_pending_transitions(),
            max_orphans: default_max_orphans(),
        }
    }
}

impl Default for GenesisConfig {
    fn default() -> Self {
        Self {
            root_balance: default_root_balance(),
            allocations: Vec::new(),
        }
    }
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node: NodeSection::default(),
            consensus: ConsensusConfig::default(),
            sharding: ShardingConfig::default(),
            genesis: GenesisConfig::default(),
            miner: MinerConfig::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_db_path() -> String {
    "./data/epochchain.db".to_string()
}

fn default_difficulty() -> u8 {
    8
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_num_included_prev_proofs() -> usize {
    5
}

fn default_block_reward() -> u64 {
    50
}

fn default_staking_minimum() -> u64 {
    1000
}

fn default_max_block_transactions() -> usize {
    500
}

fn default_zero_balance_backoff_ms() -> u64 {
    5000
}

fn default_epoch_length() -> u32 {
    100
}

fn default_validators_per_shard() -> usize {
    4
}

fn default_mapping_timeout_secs() -> u64 {
    30
}

fn default_max_pending_transitions() -> usize {
    256
}

fn default_max_orphans() -> usize {
    128
}

fn default_root_balance() -> u64 {
    1_000_000
}

impl NodeConfig {
    /// Parses a TOML document and validates it.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: NodeConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node.database_path.is_empty() {
            return Err(ChainError::Config(
                "node.database_path must not be empty".to_string(),
            ));
        }
        if self.consensus.difficulty > 64 {
            return Err(ChainError::Config(format!(
                "consensus.difficulty must be at most 64, got {}",
                self.consensus.difficulty
            )));
        }
        if self.consensus.tick_interval_ms == 0 {
            return Err(ChainError::Config(
                "consensus.tick_interval_ms must be positive".to_string(),
            ));
        }
        if self.sharding.epoch_length < 2 {
            return Err(ChainError::Config(format!(
                "sharding.epoch_length must be at least 2, got {}",
                self.sharding.epoch_length
            )));
        }
        if self.sharding.validators_per_shard == 0 {
            return Err(ChainError::Config(
                "sharding.validators_per_shard must be positive".to_string(),
            ));
        }
        if self.genesis.root_balance == 0 {
            return Err(ChainError::Config(
                "genesis.root_balance must be positive".to_string(),
            ));
        }
        self.genesis_accounts(&[0u8; 32])?;
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.consensus.tick_interval_ms)
    }

    pub fn zero_balance_backoff(&self) -> Duration {
        Duration::from_millis(self.consensus.zero_balance_backoff_ms)
    }

    pub fn mapping_timeout(&self) -> Duration {
        Duration::from_secs(self.sharding.mapping_timeout_secs)
    }

    /// Accounts created by the genesis allocations, issued by `root`.
    pub fn genesis_accounts(&self, root: &[u8; 32]) -> Result<Vec<Account>> {
        self.genesis
            .allocations
            .iter()
            .map(|allocation| -> Result<Account> {
                let invalid = |e: ChainError| {
                    ChainError::Config(format!("genesis allocation {}: {}", allocation.address, e))
                };
                let address = address_from_hex(&allocation.address).map_err(invalid)?;
                let mut account = Account::new(address, *root, allocation.balance);
                if let Some(key) = &allocation.commitment_key {
                    account.commitment_key = address_from_hex(key).map_err(invalid)?;
                    account.is_staking = true;
                }
                Ok(account)
            })
            .collect()
    }
}

/// Loads the configuration from `path`, falling back to defaults when the
/// file does not exist.
pub fn load_config(path: impl AsRef<Path>) -> Result<NodeConfig> {
    let path = path.as_ref();
    if !path.exists() {
        let config = NodeConfig::default();
        config.validate()?;
        return Ok(config);
    }
    let contents = fs::read_to_string(path)?;
    NodeConfig::from_toml_str(&contents)
}
