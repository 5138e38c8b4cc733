//! Node configuration with TOML file support.
//!
//! A user file is layered over the built-in defaults: every field the file
//! omits keeps its default value.

use crate::error::NodeError;
use horizon_core::time::{Clock, EpochClock, FasterClock};
use horizon_core::{GenesisConfig, PublicKey};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Configuration of a Horizon node
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Data directory for the ledger store
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Log level filter: "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub testnet: bool,

    /// Run without peers
    #[serde(default)]
    pub offline: bool,

    /// Clock acceleration, honoured only on an offline testnet
    #[serde(default = "default_time_multiplier")]
    pub time_multiplier: u32,

    /// Deepest common ancestor a reorganization may reach
    #[serde(default = "default_max_reorg_depth")]
    pub max_reorg_depth: u32,

    /// Capacity of the pending (orphan) block set
    #[serde(default = "default_max_pending_blocks")]
    pub max_pending_blocks: usize,

    #[serde(default = "default_max_pool_transactions")]
    pub max_pool_transactions: usize,

    /// Seconds a transaction timestamp may run ahead of the reference time
    #[serde(default = "default_allowed_clock_skew_secs")]
    pub allowed_clock_skew_secs: u32,

    /// Seconds a block timestamp may run ahead of local time
    #[serde(default = "default_max_future_drift_secs")]
    pub max_future_drift_secs: u32,

    /// Effective-stake window in blocks
    #[serde(default = "default_stake_confirmations")]
    pub stake_confirmations: u32,

    /// Budget for validating one peer block
    #[serde(default = "default_validation_timeout_ms")]
    pub validation_timeout_ms: u64,

    #[serde(default = "default_forging_poll_interval_ms")]
    pub forging_poll_interval_ms: u64,

    #[serde(default = "default_pool_expiry_interval_ms")]
    pub pool_expiry_interval_ms: u64,

    #[serde(default)]
    pub genesis: GenesisSection,
}

/// Genesis parameters as written in the config file
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisSection {
    #[serde(default)]
    pub timestamp: u32,
    #[serde(default)]
    pub allocations: Vec<AllocationEntry>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationEntry {
    /// Hex-encoded compressed public key
    pub public_key: String,
    /// Amount in base units
    pub amount: u64,
}

// ── Serde default helpers ──────────────────────────────────────────────

fn default_data_dir() -> PathBuf {
    PathBuf::from("./horizon_data")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_time_multiplier() -> u32 {
    1
}

fn default_max_reorg_depth() -> u32 {
    720
}

fn default_max_pending_blocks() -> usize {
    512
}

fn default_max_pool_transactions() -> usize {
    8192
}

fn default_allowed_clock_skew_secs() -> u32 {
    15
}

fn default_max_future_drift_secs() -> u32 {
    15
}

fn default_stake_confirmations() -> u32 {
    1440
}

fn default_validation_timeout_ms() -> u64 {
    5000
}

fn default_forging_poll_interval_ms() -> u64 {
    1000
}

fn default_pool_expiry_interval_ms() -> u64 {
    10_000
}

// ── Impl ───────────────────────────────────────────────────────────────

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: default_log_level(),
            testnet: false,
            offline: false,
            time_multiplier: default_time_multiplier(),
            max_reorg_depth: default_max_reorg_depth(),
            max_pending_blocks: default_max_pending_blocks(),
            max_pool_transactions: default_max_pool_transactions(),
            allowed_clock_skew_secs: default_allowed_clock_skew_secs(),
            max_future_drift_secs: default_max_future_drift_secs(),
            stake_confirmations: default_stake_confirmations(),
            validation_timeout_ms: default_validation_timeout_ms(),
            forging_poll_interval_ms: default_forging_poll_interval_ms(),
            pool_expiry_interval_ms: default_pool_expiry_interval_ms(),
            genesis: GenesisSection::default(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from a TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self, NodeError> {
        let content = std::fs::read_to_string(path).map_err(|e| NodeError::Config(e.to_string()))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml_str(s: &str) -> Result<Self, NodeError> {
        let config: Self = toml::from_str(s).map_err(|e| NodeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, NodeError> {
        toml::to_string_pretty(self).map_err(|e| NodeError::Config(e.to_string()))
    }

    /// Rejects values the engine cannot run with
    pub fn validate(&self) -> Result<(), NodeError> {
        if self.max_reorg_depth == 0 {
            return Err(NodeError::Config("max_reorg_depth must be positive".to_string()));
        }
        if self.max_pool_transactions == 0 {
            return Err(NodeError::Config("max_pool_transactions must be positive".to_string()));
        }
        if self.time_multiplier == 0 {
            return Err(NodeError::Config("time_multiplier must be positive".to_string()));
        }
        if self.forging_poll_interval_ms == 0 || self.pool_expiry_interval_ms == 0 {
            return Err(NodeError::Config("timer intervals must be positive".to_string()));
        }
        Ok(())
    }

    /// Clock multiplier actually in effect
    pub fn effective_time_multiplier(&self) -> u32 {
        if self.testnet && self.offline {
            self.time_multiplier.max(1)
        } else {
            1
        }
    }

    /// Epoch clock for this configuration
    pub fn clock(&self) -> Arc<dyn Clock> {
        match self.effective_time_multiplier() {
            1 => Arc::new(EpochClock),
            multiplier => Arc::new(FasterClock::new(EpochClock.now(), multiplier)),
        }
    }

    /// Genesis allocations with decoded keys
    pub fn genesis_config(&self) -> Result<GenesisConfig, NodeError> {
        let mut genesis = GenesisConfig::new(self.genesis.timestamp);
        for entry in &self.genesis.allocations {
            genesis = genesis.allocate(PublicKey::from_hex(&entry.public_key)?, entry.amount);
        }
        if genesis.total_supply().is_none() {
            return Err(NodeError::Config("genesis allocations exceed the total supply".to_string()));
        }
        Ok(genesis)
    }

    pub fn validation_timeout(&self) -> Duration {
        Duration::from_millis(self.validation_timeout_ms)
    }

    pub fn forging_poll_interval(&self) -> Duration {
        Duration::from_millis(self.forging_poll_interval_ms)
    }

    pub fn pool_expiry_interval(&self) -> Duration {
        Duration::from_millis(self.pool_expiry_interval_ms)
    }
}

/// Builder for node configuration
pub struct NodeConfigBuilder {
    config: NodeConfig,
}

impl NodeConfigBuilder {
    /// Create new builder with default config
    pub fn new() -> Self {
        Self {
            config: NodeConfig::default(),
        }
    }

    pub fn data_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config.data_dir = path.into();
        self
    }

    pub fn testnet(mut self, testnet: bool) -> Self {
        self.config.testnet = testnet;
        self
    }

    pub fn offline(mut self, offline: bool) -> Self {
        self.config.offline = offline;
        self
    }

    pub fn time_multiplier(mut self, multiplier: u32) -> Self {
        self.config.time_multiplier = multiplier;
        self
    }

    pub fn max_reorg_depth(mut self, depth: u32) -> Self {
        self.config.max_reorg_depth = depth;
        self
    }

    pub fn max_pending_blocks(mut self, max: usize) -> Self {
        self.config.max_pending_blocks = max;
        self
    }

    pub fn max_pool_transactions(mut self, max: usize) -> Self {
        self.config.max_pool_transactions = max;
        self
    }

    pub fn stake_confirmations(mut self, confirmations: u32) -> Self {
        self.config.stake_confirmations = confirmations;
        self
    }

    pub fn validation_timeout_ms(mut self, timeout: u64) -> Self {
        self.config.validation_timeout_ms = timeout;
        self
    }

    pub fn genesis_allocation(mut self, public_key: &PublicKey, amount: u64) -> Self {
        self.config.genesis.allocations.push(AllocationEntry {
            public_key: public_key.to_hex(),
            amount,
        });
        self
    }

    pub fn genesis_timestamp(mut self, timestamp: u32) -> Self {
        self.config.genesis.timestamp = timestamp;
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<NodeConfig, NodeError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for NodeConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
