//! Horizon Consensus - chain engine of a Horizon node
//!
//! Unconfirmed pool, block processing, fork resolution and forging on top
//! of the rules in `horizon-core`, driven by a single-writer [`Node`].

pub mod chain;
pub mod config;
pub mod error;
pub mod fork;
pub mod generator;
pub mod node;
pub mod orphans;
pub mod pool;
pub mod state;

pub use chain::{BlockOutcome, Blockchain, ChainParams};
pub use config::{AllocationEntry, GenesisSection, NodeConfig, NodeConfigBuilder};
pub use error::{BlockError, NodeError};
pub use fork::{ForkResolver, ReorgPlan, ReorgSummary};
pub use generator::{ForgedBlock, Generator};
pub use node::{Node, OfflinePeers, PeerNetwork, MAX_BLOCKS_PER_REQUEST};
pub use orphans::PendingBlocks;
pub use pool::{ReinstateReport, SubmitOutcome, UnconfirmedPool};
pub use state::{ChainSnapshot, StateError, StateManager};
