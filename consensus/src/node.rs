//! Node service
//!
//! [`Node`] wraps the chain state in a single-writer lock. Block and
//! transaction arrivals, forging and pool expiry all take the write lock;
//! readers that only need the tip summary use the last published
//! [`ChainSnapshot`] and never wait for a reorganization to finish.

use crate::chain::{BlockOutcome, Blockchain, ChainParams};
use crate::config::NodeConfig;
use crate::error::NodeError;
use crate::generator::Generator;
use crate::pool::SubmitOutcome;
use crate::state::{ChainSnapshot, StateManager};
use horizon_core::{
    AccountId, AttachmentRegistry, Block, BlockId, Clock, ErrorCategory, LedgerStore, RocksStore, Transaction,
};
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

/// Most blocks handed out for one `request_blocks_after`
pub const MAX_BLOCKS_PER_REQUEST: usize = 720;

/// Request rounds one sync may take before yielding
const MAX_SYNC_ROUNDS: usize = 64;

/// What the node needs from the peer-to-peer layer
pub trait PeerNetwork: Send + Sync {
    fn announce_block(&self, block: &Block);

    fn announce_transaction(&self, tx: &Transaction);

    /// Canonical blocks following `id` on the peer's chain, empty when the
    /// peer does not have `id` on its canonical chain
    fn request_blocks_after(&self, id: BlockId) -> Result<Vec<Block>, NodeError>;

    /// Cumulative difficulty of the peer's canonical tip
    fn cumulative_difficulty(&self) -> u128;
}

/// Peer layer of a node running without network
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflinePeers;

impl PeerNetwork for OfflinePeers {
    fn announce_block(&self, _block: &Block) {}

    fn announce_transaction(&self, _tx: &Transaction) {}

    fn request_blocks_after(&self, _id: BlockId) -> Result<Vec<Block>, NodeError> {
        Ok(Vec::new())
    }

    fn cumulative_difficulty(&self) -> u128 {
        0
    }
}

/// A running node: chain state, forging accounts and the peer boundary
pub struct Node {
    config: NodeConfig,
    chain: RwLock<Blockchain>,
    generator: Mutex<Generator>,
    state: StateManager,
    clock: Arc<dyn Clock>,
    peers: Arc<dyn PeerNetwork>,
}

impl Node {
    pub fn open(
        config: NodeConfig,
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
        peers: Arc<dyn PeerNetwork>,
    ) -> Result<Self, NodeError> {
        config.validate()?;
        let genesis = config.genesis_config()?;
        let chain = Blockchain::open(ChainParams::from(&config), store, AttachmentRegistry::standard(), &genesis)?;
        let state = StateManager::new(chain.snapshot(), config.max_reorg_depth as usize);
        log::info!(
            "Node opened at height {} (tip {}), testnet: {}, offline: {}",
            chain.height(),
            chain.tip_id(),
            config.testnet,
            config.offline
        );

        Ok(Self {
            config,
            chain: RwLock::new(chain),
            generator: Mutex::new(Generator::new()),
            state,
            clock,
            peers,
        })
    }

    /// Opens the RocksDB store under `data_dir` with the configured clock
    /// and no peers
    pub fn open_default(config: NodeConfig) -> Result<Self, NodeError> {
        let store = RocksStore::open(&config.data_dir)?;
        let clock = config.clock();
        Self::open(config, Arc::new(store), clock, Arc::new(OfflinePeers))
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn now(&self) -> u32 {
        self.clock.now()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Blockchain>, NodeError> {
        self.chain.read().map_err(|_| NodeError::LockPoisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Blockchain>, NodeError> {
        self.chain.write().map_err(|_| NodeError::LockPoisoned)
    }

    fn publish(&self, chain: &Blockchain) -> Result<(), NodeError> {
        self.state.publish(chain.snapshot()).map_err(|_| NodeError::LockPoisoned)
    }

    /// Runs `f` against the chain state under the read lock
    pub fn with_chain<R>(&self, f: impl FnOnce(&Blockchain) -> R) -> Result<R, NodeError> {
        Ok(f(&*self.read()?))
    }

    /// Last published tip summary
    pub fn snapshot(&self) -> Result<ChainSnapshot, NodeError> {
        self.state.get_state().map_err(|_| NodeError::LockPoisoned)
    }

    /// Snapshot recorded when the canonical tip was at `height`
    pub fn snapshot_at(&self, height: u32) -> Option<ChainSnapshot> {
        self.state.get_state_at_height(height)
    }

    pub fn current_height(&self) -> Result<u32, NodeError> {
        Ok(self.snapshot()?.height)
    }

    pub fn current_cumulative_difficulty(&self) -> Result<u128, NodeError> {
        Ok(self.snapshot()?.cumulative_difficulty)
    }

    pub fn balance(&self, id: AccountId) -> Result<u64, NodeError> {
        Ok(self.read()?.balance(id))
    }

    pub fn unconfirmed_balance(&self, id: AccountId) -> Result<u64, NodeError> {
        Ok(self.read()?.unconfirmed_balance(id))
    }

    /// Admits a transaction to the pool and announces it to peers
    pub fn submit_transaction(&self, tx: Transaction) -> Result<SubmitOutcome, NodeError> {
        let now = self.now();
        let outcome = {
            let mut chain = self.write()?;
            let outcome = chain.submit_transaction(tx.clone(), now)?;
            self.publish(&chain)?;
            outcome
        };
        if matches!(outcome, SubmitOutcome::Added { .. }) {
            self.peers.announce_transaction(&tx);
        }
        Ok(outcome)
    }

    /// Processes a block from a peer within the validation timeout. If it
    /// became the tip it is relayed and the generator gets a chance to
    /// build on it.
    pub fn process_block(&self, block: Block) -> Result<BlockOutcome, NodeError> {
        let now = self.now();
        let deadline = Instant::now() + self.config.validation_timeout();
        let outcome = {
            let mut chain = self.write()?;
            let outcome = chain.process_block(block.clone(), now, Some(deadline));
            self.publish(&chain)?;
            outcome?
        };
        if matches!(outcome, BlockOutcome::Accepted { .. }) {
            self.peers.announce_block(&block);
            if let Err(err) = self.forge_tick() {
                log::warn!("Forging after block {} failed: {}", block.id(), err);
            }
        }
        Ok(outcome)
    }

    /// Catches up with `peer` while it reports a heavier chain. Returns the
    /// number of blocks accepted or stored on a side branch.
    pub fn sync_with(&self, peer: &dyn PeerNetwork) -> Result<usize, NodeError> {
        let mut imported = 0;
        for _ in 0..MAX_SYNC_ROUNDS {
            if peer.cumulative_difficulty() <= self.current_cumulative_difficulty()? {
                break;
            }
            let blocks = self.request_from_common_block(peer)?;
            let mut progressed = false;
            for block in blocks {
                if self.read()?.block(block.id())?.is_some() {
                    continue;
                }
                let id = block.id();
                match self.process_block(block) {
                    Ok(BlockOutcome::Queued { .. }) => {}
                    Ok(_) => {
                        imported += 1;
                        progressed = true;
                    }
                    Err(err) => {
                        log::warn!("Sync stopped at block {}: {}", id, err);
                        return Err(err);
                    }
                }
            }
            if !progressed {
                break;
            }
        }
        if imported > 0 {
            log::info!("Imported {} blocks from peer, height now {}", imported, self.current_height()?);
        }
        Ok(imported)
    }

    /// Asks for blocks after the tip, stepping back exponentially (within
    /// reorganization reach) while the peer does not know our block
    fn request_from_common_block(&self, peer: &dyn PeerNetwork) -> Result<Vec<Block>, NodeError> {
        let tip_height = self.current_height()?;
        let max_depth = self.config.max_reorg_depth;
        let mut step = 0u32;
        loop {
            let height = tip_height.saturating_sub(step);
            let Some(id) = self.read()?.canonical_id(height) else {
                return Ok(Vec::new());
            };
            let blocks = peer.request_blocks_after(id)?;
            if !blocks.is_empty() || height == 0 || step >= max_depth {
                return Ok(blocks);
            }
            step = step.saturating_mul(2).max(1).min(max_depth);
        }
    }

    pub fn start_forging(&self, secret_phrase: &str) -> Result<AccountId, NodeError> {
        let mut generator = self.generator.lock().map_err(|_| NodeError::LockPoisoned)?;
        Ok(generator.start_forging(secret_phrase)?)
    }

    pub fn stop_forging(&self, id: AccountId) -> Result<bool, NodeError> {
        let mut generator = self.generator.lock().map_err(|_| NodeError::LockPoisoned)?;
        Ok(generator.stop_forging(id))
    }

    /// Seconds until `id` may forge the next block
    pub fn next_block_eta(&self, id: AccountId) -> Result<Option<u32>, NodeError> {
        let generator = self.generator.lock().map_err(|_| NodeError::LockPoisoned)?;
        let chain = self.read()?;
        Ok(generator.next_block_eta(&chain, id, self.now()))
    }

    /// One forging attempt at the current time
    pub fn forge_tick(&self) -> Result<Option<Block>, NodeError> {
        let now = self.now();
        let forged = {
            let generator = self.generator.lock().map_err(|_| NodeError::LockPoisoned)?;
            let mut chain = self.write()?;
            let forged = generator.forge(&mut chain, now);
            self.publish(&chain)?;
            forged?
        };
        let Some(forged) = forged else {
            return Ok(None);
        };
        if matches!(forged.outcome, BlockOutcome::Accepted { .. }) {
            self.peers.announce_block(&forged.block);
        }
        Ok(Some(forged.block))
    }

    /// Drops expired pool transactions, returning how many
    pub fn expire_pool(&self) -> Result<usize, NodeError> {
        let now = self.now();
        let mut chain = self.write()?;
        let expired = chain.expire_transactions(now)?;
        self.publish(&chain)?;
        Ok(expired.len())
    }

    /// Drives forging and pool expiry until `shutdown` resolves. Failures
    /// are logged and retried on the next tick, except broken invariants.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), NodeError>
    where
        F: Future<Output = ()>,
    {
        let mut forging = tokio::time::interval(self.config.forging_poll_interval());
        let mut expiry = tokio::time::interval(self.config.pool_expiry_interval());
        tokio::pin!(shutdown);

        loop {
            let result = tokio::select! {
                _ = &mut shutdown => {
                    log::info!("Node shutting down at height {}", self.current_height()?);
                    return Ok(());
                }
                _ = forging.tick() => self.forge_tick().map(|_| ()),
                _ = expiry.tick() => self.expire_pool().map(|_| ()),
            };
            if let Err(err) = result {
                if err.category() == ErrorCategory::InternalInvariant {
                    log::error!("Node halted: {}", err);
                    return Err(err);
                }
                log::warn!("Periodic task failed: {}", err);
            }
        }
    }
}

/// A local node serves as a peer of another, as in tests and tooling
impl PeerNetwork for Node {
    fn announce_block(&self, block: &Block) {
        if let Err(err) = self.process_block(block.clone()) {
            log::debug!("Ignored announced block {}: {}", block.id(), err);
        }
    }

    fn announce_transaction(&self, tx: &Transaction) {
        if let Err(err) = self.submit_transaction(tx.clone()) {
            log::debug!("Ignored announced transaction {}: {}", tx.id(), err);
        }
    }

    fn request_blocks_after(&self, id: BlockId) -> Result<Vec<Block>, NodeError> {
        Ok(self.read()?.blocks_after(id, MAX_BLOCKS_PER_REQUEST)?)
    }

    fn cumulative_difficulty(&self) -> u128 {
        self.current_cumulative_difficulty().unwrap_or(0)
    }
}
