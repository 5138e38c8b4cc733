//! Block validation and the chain store
//!
//! [`Blockchain`] owns everything consensus mutates: the account ledger, the
//! unconfirmed pool, the tree of known blocks and the pending (orphan)
//! blocks. It is driven by a single writer; see [`crate::node::Node`].
//!
//! Header checks (structure, parent, timestamp, signature, generation
//! signature, difficulty) run when a block arrives. The stake check and the
//! transaction checks need the ledger as of the parent, so they run when the
//! block is connected to the canonical chain, which for side branches means
//! during reorganization.

use crate::config::NodeConfig;
use crate::error::{BlockError, NodeError};
use crate::fork::ReorgSummary;
use crate::orphans::PendingBlocks;
use crate::pool::{SubmitOutcome, UnconfirmedPool};
use crate::state::ChainSnapshot;
use horizon_core::forging::{self, generation_signature};
use horizon_core::{
    Account, AccountId, AttachmentRegistry, Block, BlockCommit, BlockId, DifficultyAdjuster, ErrorCategory,
    GenesisConfig, Ledger, LedgerError, LedgerStore, StorageError, Transaction, TransactionError, TransactionId,
    TransactionValidator, ValidationContext, MAX_PAYLOAD_LENGTH, MAX_TRANSACTIONS_PER_BLOCK,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

/// Chain engine parameters taken from the node configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainParams {
    pub max_reorg_depth: u32,
    pub max_pending_blocks: usize,
    pub max_pool_transactions: usize,
    /// Seconds a transaction timestamp may lead its reference time
    pub allowed_clock_skew: u32,
    /// Seconds a block timestamp may lead local time
    pub max_future_drift: u32,
    pub stake_confirmations: u32,
}

impl From<&NodeConfig> for ChainParams {
    fn from(config: &NodeConfig) -> Self {
        Self {
            max_reorg_depth: config.max_reorg_depth,
            max_pending_blocks: config.max_pending_blocks,
            max_pool_transactions: config.max_pool_transactions,
            allowed_clock_skew: config.allowed_clock_skew_secs,
            max_future_drift: config.max_future_drift_secs,
            stake_confirmations: config.stake_confirmations,
        }
    }
}

impl Default for ChainParams {
    fn default() -> Self {
        Self::from(&NodeConfig::default())
    }
}

/// Result of processing a block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutcome {
    /// The block is the new canonical tip
    Accepted {
        height: u32,
        /// Set when accepting the block switched branches
        reorganized: Option<ReorgSummary>,
    },
    /// Stored on a branch that does not outweigh the canonical chain
    SideBranch { height: u32 },
    /// Parent unknown, held until it arrives
    Queued { missing_parent: BlockId },
}

/// Canonical chain, side branches, ledger and pool
pub struct Blockchain {
    pub(crate) params: ChainParams,
    pub(crate) registry: AttachmentRegistry,
    pub(crate) adjuster: DifficultyAdjuster,
    pub(crate) ledger: Ledger,
    pub(crate) pool: UnconfirmedPool,
    pub(crate) pending: PendingBlocks,
    /// Known blocks within reorganization reach, canonical and side
    pub(crate) blocks: HashMap<BlockId, Block>,
    /// Canonical block id per height
    pub(crate) canonical: Vec<BlockId>,
    /// Blocks that failed full validation, never retried
    pub(crate) invalid: HashSet<BlockId>,
    pub(crate) tip: Block,
    pub(crate) tip_id: BlockId,
    pub(crate) store: Arc<dyn LedgerStore>,
    /// Set when a failed reorganization could not be rolled back
    pub(crate) halted: Option<String>,
}

impl Blockchain {
    /// Opens the chain on `store`: initializes it with the genesis block
    /// when empty, otherwise replays every committed block into the ledger.
    pub fn open(
        params: ChainParams,
        store: Arc<dyn LedgerStore>,
        registry: AttachmentRegistry,
        genesis: &GenesisConfig,
    ) -> Result<Self, NodeError> {
        let genesis_block = genesis.block();
        let genesis_id = genesis_block.id();

        let mut chain = Self {
            ledger: Ledger::new(params.stake_confirmations, params.max_reorg_depth),
            pool: UnconfirmedPool::new(params.max_pool_transactions),
            pending: PendingBlocks::new(params.max_pending_blocks),
            params,
            registry,
            adjuster: DifficultyAdjuster::new(),
            blocks: HashMap::from([(genesis_id, genesis_block.clone())]),
            canonical: vec![genesis_id],
            invalid: HashSet::new(),
            tip: genesis_block.clone(),
            tip_id: genesis_id,
            store,
            halted: None,
        };
        genesis.apply(&mut chain.ledger).map_err(BlockError::from)?;
        chain.drain_changes();

        match chain.store.height()? {
            None => {
                let commit = chain.commit_record(&genesis_block);
                chain.store.commit_block(&commit)?;
                log::info!("Initialized chain with genesis block {}", genesis_id);
            }
            Some(tip_height) => {
                let stored = chain
                    .store
                    .get_block_by_height(0)?
                    .ok_or_else(|| StorageError::InvalidData("no genesis block in store".to_string()))?;
                if stored.id() != genesis_id {
                    return Err(NodeError::Config(
                        "stored genesis block does not match the configured genesis".to_string(),
                    ));
                }
                for height in 1..=tip_height {
                    let block = chain.store.get_block_by_height(height)?.ok_or_else(|| {
                        StorageError::InvalidData(format!("no block indexed at height {}", height))
                    })?;
                    chain.connect(&block, None, false)?;
                }
                chain.verify_against_store()?;
                log::info!("Replayed {} blocks from the ledger store", tip_height);
            }
        }
        chain.prune();
        Ok(chain)
    }

    /// Persisted accounts must match the replayed ledger
    fn verify_against_store(&self) -> Result<(), StorageError> {
        for account in self.ledger.accounts() {
            let stored = self.store.get_account(account.id)?;
            if stored.as_ref().map(|a| a.balance) != Some(account.balance) {
                return Err(StorageError::InvalidData(format!(
                    "stored account {} diverges from the replayed ledger",
                    account.id
                )));
            }
        }
        Ok(())
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn registry(&self) -> &AttachmentRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn pool(&self) -> &UnconfirmedPool {
        &self.pool
    }

    pub fn pending_blocks(&self) -> &PendingBlocks {
        &self.pending
    }

    pub fn tip(&self) -> &Block {
        &self.tip
    }

    pub fn tip_id(&self) -> BlockId {
        self.tip_id
    }

    pub fn height(&self) -> u32 {
        self.tip.height
    }

    pub fn cumulative_difficulty(&self) -> u128 {
        self.tip.cumulative_difficulty
    }

    pub fn account(&self, id: AccountId) -> Option<&Account> {
        self.ledger.account(id)
    }

    pub fn balance(&self, id: AccountId) -> u64 {
        self.ledger.balance(id)
    }

    pub fn unconfirmed_balance(&self, id: AccountId) -> u64 {
        self.ledger.unconfirmed_balance(id)
    }

    /// Stake `id` would forge the next block with
    pub fn effective_stake(&self, id: AccountId) -> u64 {
        self.ledger.effective_stake(id, self.tip.height)
    }

    pub fn is_invalid(&self, id: BlockId) -> bool {
        self.invalid.contains(&id)
    }

    /// True once a reorganization failed and could not be rolled back.
    /// A halted chain refuses every block.
    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    /// Canonical block id at `height`
    pub fn canonical_id(&self, height: u32) -> Option<BlockId> {
        self.canonical.get(height as usize).copied()
    }

    pub(crate) fn is_canonical(&self, block: &Block) -> bool {
        self.canonical_id(block.height) == Some(block.id())
    }

    /// Any known block, side branches included
    pub fn block(&self, id: BlockId) -> Result<Option<Block>, StorageError> {
        match self.blocks.get(&id) {
            Some(block) => Ok(Some(block.clone())),
            None => self.store.get_block(id),
        }
    }

    /// Canonical block at `height`
    pub fn block_at_height(&self, height: u32) -> Result<Option<Block>, StorageError> {
        match self.canonical_id(height).and_then(|id| self.blocks.get(&id)) {
            Some(block) => Ok(Some(block.clone())),
            None if height <= self.tip.height => self.store.get_block_by_height(height),
            None => Ok(None),
        }
    }

    /// Up to `limit` canonical blocks following `id`, empty when `id` is not
    /// on the canonical chain
    pub fn blocks_after(&self, id: BlockId, limit: usize) -> Result<Vec<Block>, StorageError> {
        let Some(start) = self.canonical.iter().rposition(|canonical| *canonical == id) else {
            return Ok(Vec::new());
        };
        let mut blocks = Vec::new();
        for height in (start + 1..self.canonical.len()).take(limit) {
            match self.block_at_height(height as u32)? {
                Some(block) => blocks.push(block),
                None => break,
            }
        }
        Ok(blocks)
    }

    pub fn snapshot(&self) -> ChainSnapshot {
        ChainSnapshot {
            height: self.tip.height,
            tip_id: self.tip_id,
            tip_timestamp: self.tip.timestamp,
            base_target: self.tip.base_target,
            cumulative_difficulty: self.tip.cumulative_difficulty,
            unconfirmed_transactions: self.pool.len(),
            pending_blocks: self.pending.len(),
        }
    }

    fn pool_context(&self, now: u32) -> ValidationContext {
        ValidationContext::for_pool(now, self.tip.height + 1, self.params.allowed_clock_skew)
    }

    /// Admits a transaction to the unconfirmed pool
    pub fn submit_transaction(&mut self, tx: Transaction, now: u32) -> Result<SubmitOutcome, TransactionError> {
        let ctx = self.pool_context(now);
        let validator = TransactionValidator::new(&self.registry);
        self.pool.submit(tx, &mut self.ledger, &validator, &ctx)
    }

    /// Drops pooled transactions whose deadline passed
    pub fn expire_transactions(&mut self, now: u32) -> Result<Vec<Transaction>, BlockError> {
        Ok(self.pool.expire(now, &mut self.ledger)?)
    }

    pub(crate) fn suspend_pool(&mut self) -> Result<(), BlockError> {
        Ok(self.pool.suspend(&mut self.ledger)?)
    }

    /// Re-admits suspended pool entries; expired and no longer valid ones
    /// are dropped here
    pub(crate) fn resume_pool(&mut self, now: u32) {
        let ctx = self.pool_context(now);
        let validator = TransactionValidator::new(&self.registry);
        let dropped = self.pool.resume(&mut self.ledger, &validator, &ctx);
        if !dropped.is_empty() {
            log::debug!("Dropped {} unconfirmed transactions after the chain moved", dropped.len());
        }
    }

    /// Validates and integrates a block, then any pending blocks waiting
    /// for it
    pub fn process_block(
        &mut self,
        block: Block,
        now: u32,
        deadline: Option<Instant>,
    ) -> Result<BlockOutcome, BlockError> {
        let id = block.id();
        if let Some(reason) = &self.halted {
            return Err(BlockError::InvariantViolation(format!("chain halted: {}", reason)));
        }
        let outcome = self.process_one(block, now, deadline).map_err(|err| {
            report(id, &err);
            err
        })?;
        if !matches!(outcome, BlockOutcome::Queued { .. }) {
            self.process_pending(id, now, deadline);
        }
        Ok(outcome)
    }

    fn process_pending(&mut self, parent: BlockId, now: u32, deadline: Option<Instant>) {
        let mut parents = VecDeque::from([parent]);
        while let Some(parent) = parents.pop_front() {
            for child in self.pending.take_children(parent) {
                let id = child.id();
                match self.process_one(child, now, deadline) {
                    Ok(BlockOutcome::Queued { .. }) => {}
                    Ok(_) => parents.push_back(id),
                    Err(err) => report(id, &err),
                }
            }
        }
    }

    fn process_one(&mut self, block: Block, now: u32, deadline: Option<Instant>) -> Result<BlockOutcome, BlockError> {
        let id = block.id();
        if self.invalid.contains(&id) {
            return Err(BlockError::InvalidBranch(id));
        }
        if let Some(parent) = block.previous_block_id.filter(|_| self.pending.contains(id)) {
            return Ok(BlockOutcome::Queued { missing_parent: parent });
        }
        if self.blocks.contains_key(&id) || self.store.get_block(id)?.is_some() {
            return Err(BlockError::DuplicateBlock(id));
        }
        block.check_structure()?;

        let parent_id = block.previous_block_id.ok_or(BlockError::UnexpectedGenesis(id))?;
        if self.invalid.contains(&parent_id) {
            self.invalid.insert(id);
            return Err(BlockError::InvalidBranch(parent_id));
        }
        let Some(parent) = self.block(parent_id)? else {
            if self.pending.insert(parent_id, block) {
                log::debug!("Queued block {} waiting for parent {}", id, parent_id);
                return Ok(BlockOutcome::Queued {
                    missing_parent: parent_id,
                });
            }
            return Err(BlockError::UnknownParent(parent_id));
        };

        self.check_header(&block, &parent, now)?;
        check_deadline(deadline)?;

        let height = block.height;
        if parent_id == self.tip_id {
            return match self.extend(&block, now, deadline) {
                Ok(()) => Ok(BlockOutcome::Accepted {
                    height,
                    reorganized: None,
                }),
                Err(err) => {
                    if err.is_permanent() {
                        self.invalid.insert(id);
                    }
                    Err(err)
                }
            };
        }

        let depth = self.tip.height.saturating_sub(parent.height);
        if depth > self.params.max_reorg_depth {
            return Err(BlockError::ReorgTooDeep {
                depth,
                max: self.params.max_reorg_depth,
            });
        }
        self.check_stake(&block, &parent)?;
        self.store.put_block(&block)?;
        let heavier = block.cumulative_difficulty > self.tip.cumulative_difficulty;
        self.blocks.insert(id, block);
        if !heavier {
            log::debug!("Stored side-branch block {} at height {}", id, height);
            return Ok(BlockOutcome::SideBranch { height });
        }

        let summary = self.reorganize(id, now, deadline)?;
        self.prune();
        Ok(BlockOutcome::Accepted {
            height,
            reorganized: Some(summary),
        })
    }

    /// Checks that need only the parent block
    fn check_header(&self, block: &Block, parent: &Block, now: u32) -> Result<(), BlockError> {
        if block.height != parent.height + 1 {
            return Err(BlockError::WrongHeight {
                parent: parent.height,
                got: block.height,
            });
        }
        let max = now.saturating_add(self.params.max_future_drift);
        if block.timestamp < parent.timestamp || block.timestamp > max {
            return Err(BlockError::TimestampOutOfRange {
                timestamp: block.timestamp,
                min: parent.timestamp,
                max,
            });
        }
        if !block.verify_signature() {
            return Err(BlockError::InvalidSignature);
        }
        let expected = generation_signature(&parent.generation_signature, &block.generator_public_key);
        if expected != block.generation_signature {
            return Err(BlockError::InvalidGenerator(
                "generation signature does not derive from the parent".to_string(),
            ));
        }
        self.adjuster.verify(parent, block)?;
        Ok(())
    }

    /// The generator must have won on `parent` with its effective stake as
    /// of the parent height. For a parent off the canonical chain this is the
    /// canonical ledger's view, and the branch is checked again on connect.
    fn check_stake(&self, block: &Block, parent: &Block) -> Result<(), BlockError> {
        let generator = block.generator_public_key.account_id();
        let stake = self.ledger.effective_stake(generator, parent.height);
        let elapsed = block.timestamp.saturating_sub(parent.timestamp);
        let hit = forging::hit(&block.generation_signature);
        if !forging::verify_hit(hit, stake, parent.base_target, elapsed) {
            return Err(BlockError::InvalidGenerator(format!(
                "account {} with stake {} has not won after {} seconds",
                generator, stake, elapsed
            )));
        }
        Ok(())
    }

    /// Appends a block whose parent is the tip
    fn extend(&mut self, block: &Block, now: u32, deadline: Option<Instant>) -> Result<(), BlockError> {
        self.suspend_pool()?;
        let connected = self.connect(block, deadline, true);
        if connected.is_ok() {
            self.pool.remove_confirmed(&block.transaction_ids());
        }
        self.resume_pool(now);
        connected?;

        log::info!(
            "Accepted block {} at height {} with {} transactions",
            self.tip_id,
            block.height,
            block.transactions.len()
        );
        self.prune();
        Ok(())
    }

    /// Applies `block` on top of the tip: stake check, every transaction in
    /// order, fees to the generator, then the store commit when `persist`.
    /// Any failure leaves ledger, store and tip untouched.
    ///
    /// The pool must be suspended.
    pub(crate) fn connect(&mut self, block: &Block, deadline: Option<Instant>, persist: bool) -> Result<(), BlockError> {
        let connected = self.attach(block, deadline, persist);
        self.drain_changes();
        connected
    }

    fn attach(&mut self, block: &Block, deadline: Option<Instant>, persist: bool) -> Result<(), BlockError> {
        if block.previous_block_id != Some(self.tip_id) {
            return Err(BlockError::InvariantViolation(format!(
                "block {} does not extend the tip {}",
                block.id(),
                self.tip_id
            )));
        }
        self.ledger.begin_block(block.height)?;
        if let Err(err) = self.apply_body(block, deadline) {
            self.ledger.abort_block(&self.registry)?;
            return Err(err);
        }
        self.ledger.end_block()?;

        if persist {
            let commit = self.commit_record(block);
            if let Err(err) = self.store.commit_block(&commit) {
                log::error!("Failed to commit block at height {}: {}", block.height, err);
                self.ledger.undo(block.height, &self.registry)?;
                return Err(err.into());
            }
        }

        let id = block.id();
        self.canonical.push(id);
        self.blocks.insert(id, block.clone());
        self.tip = block.clone();
        self.tip_id = id;
        Ok(())
    }

    fn apply_body(&mut self, block: &Block, deadline: Option<Instant>) -> Result<(), BlockError> {
        self.check_stake(block, &self.tip)?;

        let validator = TransactionValidator::new(&self.registry);
        let ctx = ValidationContext::for_block(block.timestamp, block.height, self.params.allowed_clock_skew);
        for tx in &block.transactions {
            check_deadline(deadline)?;
            let id = tx.id();
            validator
                .validate(tx, &self.ledger, &ctx)
                .map_err(|source| BlockError::TransactionValidationFailed { id, source })?;
            self.ledger
                .apply_transaction(tx, &self.registry)
                .map_err(|err| ledger_failure(id, err))?;
        }

        self.ledger.register_public_key(&block.generator_public_key)?;
        self.ledger.credit(block.generator_public_key.account_id(), block.total_fee)?;
        Ok(())
    }

    /// Removes the tip from the ledger and the canonical index. The store is
    /// rolled back separately.
    pub(crate) fn disconnect(&mut self) -> Result<Block, BlockError> {
        let parent_id = self
            .tip
            .previous_block_id
            .ok_or_else(|| BlockError::InvariantViolation("cannot disconnect the genesis block".to_string()))?;
        let parent = self
            .block(parent_id)?
            .ok_or_else(|| BlockError::InvariantViolation(format!("parent {} of the tip is unknown", parent_id)))?;

        let undone = self.ledger.undo(self.tip.height, &self.registry);
        self.drain_changes();
        undone?;
        self.canonical.pop();
        self.tip_id = parent_id;
        Ok(std::mem::replace(&mut self.tip, parent))
    }

    fn commit_record(&self, block: &Block) -> BlockCommit {
        let deltas = self.ledger.deltas(block.height);
        let accounts = deltas
            .iter()
            .filter_map(|delta| self.ledger.account(delta.account).cloned())
            .collect();
        BlockCommit {
            block: block.clone(),
            deltas,
            accounts,
        }
    }

    /// Highest-priority pooled transactions that apply cleanly on top of the
    /// tip at `timestamp`, within the block limits
    pub(crate) fn select_transactions(&mut self, timestamp: u32) -> Result<Vec<Transaction>, BlockError> {
        let candidates: Vec<Transaction> = self.pool.by_priority().cloned().collect();
        if candidates.is_empty() {
            return Ok(candidates);
        }
        let height = self.tip.height + 1;

        self.suspend_pool()?;
        if let Err(err) = self.ledger.begin_block(height) {
            self.resume_pool(timestamp);
            return Err(err.into());
        }

        let validator = TransactionValidator::new(&self.registry);
        let ctx = ValidationContext::for_block(timestamp, height, self.params.allowed_clock_skew);
        let mut selected = Vec::new();
        let mut payload_length: u32 = 0;
        for tx in candidates {
            if selected.len() >= MAX_TRANSACTIONS_PER_BLOCK {
                break;
            }
            let size = tx.size() as u32;
            if payload_length.saturating_add(size) > MAX_PAYLOAD_LENGTH {
                continue;
            }
            if validator.revalidate(&tx, &self.ledger, &ctx).is_err() {
                continue;
            }
            if let Err(err) = self.ledger.apply_transaction(&tx, &self.registry) {
                log::warn!("Transaction {} validated but failed to apply: {}", tx.id(), err);
                break;
            }
            payload_length += size;
            selected.push(tx);
        }

        let aborted = self.ledger.abort_block(&self.registry);
        // trial application, every change was reverted
        self.ledger.take_changes();
        self.resume_pool(timestamp);
        aborted?;
        Ok(selected)
    }

    /// Hands the ledger's ordered balance changes to the log
    fn drain_changes(&mut self) {
        for change in self.ledger.take_changes() {
            log::trace!(
                "Balance of {} changed by {} at height {}",
                change.account,
                change.balance_delta,
                change.height
            );
        }
    }

    /// Forgets blocks, pending blocks and expired confirmed ids below
    /// reorganization reach
    pub(crate) fn prune(&mut self) {
        let cutoff = self.tip.height.saturating_sub(self.params.max_reorg_depth);
        if cutoff == 0 {
            return;
        }
        // no block can be applied earlier than the oldest possible fork point
        let floor = self
            .canonical
            .get(cutoff as usize)
            .and_then(|id| self.blocks.get(id))
            .map(|block| block.timestamp);
        if let Some(floor) = floor {
            let forgotten = self.ledger.forget_confirmed(cutoff, floor);
            if forgotten > 0 {
                log::debug!("Forgot {} expired transaction ids below height {}", forgotten, cutoff);
            }
        }
        self.blocks.retain(|_, block| block.height >= cutoff);
        let pruned = self.pending.prune_at_or_below(cutoff);
        if pruned > 0 {
            log::debug!("Pruned {} pending blocks below height {}", pruned, cutoff);
        }
    }
}

fn check_deadline(deadline: Option<Instant>) -> Result<(), BlockError> {
    match deadline {
        Some(deadline) if Instant::now() >= deadline => Err(BlockError::Timeout),
        _ => Ok(()),
    }
}

/// A validated transaction that still fails to apply is either a plain
/// rejection or a broken ledger invariant
fn ledger_failure(id: TransactionId, err: LedgerError) -> BlockError {
    if err.is_invariant_violation() {
        BlockError::from(err)
    } else {
        BlockError::TransactionValidationFailed { id, source: err.into() }
    }
}

fn report(id: BlockId, err: &BlockError) {
    match err.category() {
        ErrorCategory::InternalInvariant => log::error!("Invariant violated while processing block {}: {}", id, err),
        ErrorCategory::Storage => log::warn!("Storage failure while processing block {}: {}", id, err),
        _ => log::debug!("Rejected block {}: {}", id, err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use horizon_core::forging::LotteryTicket;
    use horizon_core::{Attachment, KeyPair, MemoryStore, TransactionBuilder, MAX_BALANCE};

    struct Fixture {
        chain: Blockchain,
        store: MemoryStore,
        genesis: GenesisConfig,
        forger: KeyPair,
        alice: KeyPair,
        bob: KeyPair,
    }

    fn fixture() -> Fixture {
        let forger = KeyPair::from_secret_phrase("chain-forger").unwrap();
        let alice = KeyPair::from_secret_phrase("chain-alice").unwrap();
        let bob = KeyPair::from_secret_phrase("chain-bob").unwrap();
        let genesis = GenesisConfig::new(0)
            .allocate(forger.public_key(), MAX_BALANCE - 10_000)
            .allocate(alice.public_key(), 10_000);
        let store = MemoryStore::new();
        let chain = Blockchain::open(
            ChainParams::default(),
            Arc::new(store.clone()),
            AttachmentRegistry::standard(),
            &genesis,
        )
        .unwrap();
        Fixture {
            chain,
            store,
            genesis,
            forger,
            alice,
            bob,
        }
    }

    fn payment(from: &KeyPair, to: &KeyPair, amount: u64, timestamp: u32) -> Transaction {
        TransactionBuilder::new(from.public_key(), amount, 1, 60, Attachment::OrdinaryPayment)
            .recipient(to.account_id())
            .timestamp(timestamp)
            .sign(from)
    }

    /// Block by `keys` on top of `parent`, stamped `extra` seconds after the
    /// earliest winning second
    fn forge_on(chain: &Blockchain, parent: &Block, keys: &KeyPair, extra: u32, txs: Vec<Transaction>) -> Block {
        let stake = chain.ledger.effective_stake(keys.account_id(), parent.height);
        let ticket = LotteryTicket::draw(parent, &keys.public_key(), stake);
        let timestamp = ticket.hit_time.unwrap() + extra;
        let base_target = chain.adjuster.next_base_target(parent, timestamp).unwrap().new;
        Block::unsigned(parent, timestamp, txs, keys.public_key(), ticket.generation_signature, base_target).sign(keys)
    }

    #[test]
    fn test_open_commits_genesis() {
        let f = fixture();
        assert_eq!(f.chain.height(), 0);
        assert_eq!(f.store.height().unwrap(), Some(0));
        assert_eq!(f.chain.tip_id(), f.genesis.block().id());
        assert_eq!(f.chain.balance(f.alice.account_id()), 10_000);
    }

    #[test]
    fn test_accept_block_with_transaction() {
        let mut f = fixture();
        let tx = payment(&f.alice, &f.bob, 100, 1);
        f.chain.submit_transaction(tx.clone(), 1).unwrap();
        assert_eq!(f.chain.unconfirmed_balance(f.alice.account_id()), 9_899);

        let tip = f.chain.tip().clone();
        let block = forge_on(&f.chain, &tip, &f.forger, 0, vec![tx.clone()]);
        let now = block.timestamp;
        let outcome = f.chain.process_block(block, now, None).unwrap();

        assert_eq!(outcome, BlockOutcome::Accepted { height: 1, reorganized: None });
        assert_eq!(f.chain.balance(f.alice.account_id()), 9_899);
        assert_eq!(f.chain.unconfirmed_balance(f.alice.account_id()), 9_899);
        assert_eq!(f.chain.balance(f.bob.account_id()), 100);
        assert_eq!(f.chain.balance(f.forger.account_id()), MAX_BALANCE - 10_000 + 1);
        assert!(f.chain.pool().is_empty());
        assert_eq!(f.store.height().unwrap(), Some(1));
        assert_eq!(f.store.get_account(f.bob.account_id()).unwrap().unwrap().balance, 100);
    }

    #[test]
    fn test_duplicate_and_tampered_blocks() {
        let mut f = fixture();
        let tip = f.chain.tip().clone();
        let block = forge_on(&f.chain, &tip, &f.forger, 0, Vec::new());
        let now = block.timestamp;
        f.chain.process_block(block.clone(), now, None).unwrap();
        assert_eq!(
            f.chain.process_block(block.clone(), now, None),
            Err(BlockError::DuplicateBlock(block.id()))
        );

        let mut tampered = forge_on(&f.chain, &block, &f.forger, 0, Vec::new());
        tampered.timestamp += 1;
        let now = tampered.timestamp;
        assert_eq!(f.chain.process_block(tampered, now, None), Err(BlockError::InvalidSignature));
    }

    #[test]
    fn test_future_timestamp_rejected() {
        let mut f = fixture();
        let tip = f.chain.tip().clone();
        let block = forge_on(&f.chain, &tip, &f.forger, 100, Vec::new());
        let now = block.timestamp - 16;
        assert!(matches!(
            f.chain.process_block(block, now, None),
            Err(BlockError::TimestampOutOfRange { .. })
        ));
    }

    #[test]
    fn test_generator_without_stake_rejected() {
        let mut f = fixture();
        let tip = f.chain.tip().clone();
        // bob holds nothing, so the hit never wins
        let ticket = LotteryTicket::draw(&tip, &f.bob.public_key(), 0);
        let timestamp = 100;
        let base_target = f.chain.adjuster.next_base_target(&tip, timestamp).unwrap().new;
        let block = Block::unsigned(
            &tip,
            timestamp,
            Vec::new(),
            f.bob.public_key(),
            ticket.generation_signature,
            base_target,
        )
        .sign(&f.bob);
        let id = block.id();
        assert!(matches!(
            f.chain.process_block(block, timestamp, None),
            Err(BlockError::InvalidGenerator(_))
        ));
        assert!(f.chain.is_invalid(id));
        assert_eq!(f.chain.height(), 0);
    }

    #[test]
    fn test_invalid_transaction_rejects_whole_block() {
        let mut f = fixture();
        let good = payment(&f.alice, &f.bob, 100, 1);
        let overspend = payment(&f.alice, &f.bob, 20_000, 1);
        let tip = f.chain.tip().clone();
        let block = forge_on(&f.chain, &tip, &f.forger, 0, vec![good, overspend.clone()]);
        let now = block.timestamp;

        let err = f.chain.process_block(block, now, None).unwrap_err();
        assert!(matches!(err, BlockError::TransactionValidationFailed { id, .. } if id == overspend.id()));
        assert_eq!(f.chain.height(), 0);
        assert_eq!(f.chain.balance(f.alice.account_id()), 10_000);
        assert_eq!(f.chain.balance(f.bob.account_id()), 0);
        assert_eq!(f.store.height().unwrap(), Some(0));
    }

    #[test]
    fn test_orphan_queued_then_connected() {
        let mut f = fixture();
        let tip = f.chain.tip().clone();
        let first = forge_on(&f.chain, &tip, &f.forger, 0, Vec::new());
        // stake at height 1 equals stake at height 0
        let second = forge_on(&f.chain, &first, &f.forger, 0, Vec::new());
        let now = second.timestamp;

        let outcome = f.chain.process_block(second.clone(), now, None).unwrap();
        assert_eq!(outcome, BlockOutcome::Queued { missing_parent: first.id() });
        assert_eq!(f.chain.pending_blocks().len(), 1);

        f.chain.process_block(first, now, None).unwrap();
        assert_eq!(f.chain.height(), 2);
        assert_eq!(f.chain.tip_id(), second.id());
        assert!(f.chain.pending_blocks().is_empty());
    }

    #[test]
    fn test_orphan_window_bounded() {
        let mut f = fixture();
        f.chain.pending = PendingBlocks::new(0);
        let tip = f.chain.tip().clone();
        let first = forge_on(&f.chain, &tip, &f.forger, 0, Vec::new());
        let second = forge_on(&f.chain, &first, &f.forger, 0, Vec::new());
        let now = second.timestamp;
        assert_eq!(
            f.chain.process_block(second, now, None),
            Err(BlockError::UnknownParent(first.id()))
        );
    }

    #[test]
    fn test_failed_commit_does_not_advance() {
        let mut f = fixture();
        let tx = payment(&f.alice, &f.bob, 100, 1);
        f.chain.submit_transaction(tx.clone(), 1).unwrap();
        let tip = f.chain.tip().clone();
        let block = forge_on(&f.chain, &tip, &f.forger, 0, vec![tx.clone()]);
        let now = block.timestamp;

        f.store.set_fail_writes(true);
        let err = f.chain.process_block(block.clone(), now, None).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Storage);
        assert_eq!(f.chain.height(), 0);
        assert_eq!(f.chain.balance(f.alice.account_id()), 10_000);
        assert!(f.chain.pool().contains(tx.id()));
        assert_eq!(f.chain.unconfirmed_balance(f.alice.account_id()), 9_899);
        assert!(!f.chain.is_invalid(block.id()));

        // retried once the store recovers
        f.store.set_fail_writes(false);
        f.chain.process_block(block, now, None).unwrap();
        assert_eq!(f.chain.height(), 1);
    }

    #[test]
    fn test_reopen_replays_store() {
        let mut f = fixture();
        let tx = payment(&f.alice, &f.bob, 250, 1);
        let tip = f.chain.tip().clone();
        let block = forge_on(&f.chain, &tip, &f.forger, 0, vec![tx]);
        let now = block.timestamp;
        f.chain.process_block(block.clone(), now, None).unwrap();

        let reopened = Blockchain::open(
            ChainParams::default(),
            Arc::new(f.store.clone()),
            AttachmentRegistry::standard(),
            &f.genesis,
        )
        .unwrap();
        assert_eq!(reopened.height(), 1);
        assert_eq!(reopened.tip_id(), block.id());
        assert_eq!(reopened.balance(f.bob.account_id()), 250);
        assert!(reopened.ledger().is_confirmed(block.transactions[0].id()));
    }

    #[test]
    fn test_reopen_with_other_genesis_fails() {
        let f = fixture();
        let other = GenesisConfig::new(5).allocate(f.bob.public_key(), 1);
        let reopened = Blockchain::open(
            ChainParams::default(),
            Arc::new(f.store.clone()),
            AttachmentRegistry::standard(),
            &other,
        );
        assert!(matches!(reopened, Err(NodeError::Config(_))));
    }

    #[test]
    fn test_change_record_drained_by_chain() {
        let mut f = fixture();
        assert!(f.chain.ledger().pending_changes().is_empty());

        let tx = payment(&f.alice, &f.bob, 100, 1);
        f.chain.submit_transaction(tx.clone(), 1).unwrap();
        f.chain.select_transactions(10).unwrap();
        assert!(f.chain.ledger().pending_changes().is_empty());

        let tip = f.chain.tip().clone();
        let block = forge_on(&f.chain, &tip, &f.forger, 0, vec![tx]);
        let now = block.timestamp;
        f.chain.process_block(block, now, None).unwrap();
        assert_eq!(f.chain.balance(f.bob.account_id()), 100);
        assert!(f.chain.ledger().pending_changes().is_empty());
    }

    #[test]
    fn test_prune_forgets_expired_confirmed_ids() {
        let mut f = fixture();
        let params = ChainParams {
            max_reorg_depth: 2,
            ..ChainParams::default()
        };
        f.chain = Blockchain::open(
            params,
            Arc::new(MemoryStore::new()),
            AttachmentRegistry::standard(),
            &f.genesis,
        )
        .unwrap();

        let genesis = f.chain.tip().clone();
        let stamp = forge_on(&f.chain, &genesis, &f.forger, 0, Vec::new()).timestamp;
        // one minute deadline, expires 59 seconds after the block
        let tx = TransactionBuilder::new(f.alice.public_key(), 100, 1, 1, Attachment::OrdinaryPayment)
            .recipient(f.bob.account_id())
            .timestamp(stamp - 1)
            .sign(&f.alice);
        let first = forge_on(&f.chain, &genesis, &f.forger, 0, vec![tx.clone()]);
        f.chain.process_block(first.clone(), first.timestamp, None).unwrap();

        let mut parent = first;
        for height in 2..=4 {
            let block = forge_on(&f.chain, &parent, &f.forger, 100, Vec::new());
            f.chain.process_block(block.clone(), block.timestamp, None).unwrap();
            if height == 3 {
                // height 1 can still be undone
                assert!(f.chain.ledger().is_confirmed(tx.id()));
            }
            parent = block;
        }

        assert_eq!(f.chain.height(), 4);
        assert!(!f.chain.ledger().is_confirmed(tx.id()));
        let now = parent.timestamp;
        assert!(matches!(
            f.chain.submit_transaction(tx, now),
            Err(TransactionError::Expired { .. })
        ));
    }

    #[test]
    fn test_select_transactions_leaves_state() {
        let mut f = fixture();
        let a = payment(&f.alice, &f.bob, 6_000, 1);
        let b = payment(&f.alice, &f.bob, 3_000, 1);
        f.chain.submit_transaction(a.clone(), 1).unwrap();
        f.chain.submit_transaction(b.clone(), 1).unwrap();

        let selected = f.chain.select_transactions(10).unwrap();
        assert_eq!(selected.len(), 2);
        assert_eq!(f.chain.pool().len(), 2);
        assert_eq!(f.chain.balance(f.alice.account_id()), 10_000);
        assert_eq!(f.chain.unconfirmed_balance(f.alice.account_id()), 10_000 - 9_002);
        assert!(f.chain.pool().reservations_consistent(f.chain.ledger()));
    }

    #[test]
    fn test_blocks_after() {
        let mut f = fixture();
        let genesis_id = f.chain.tip_id();
        let tip = f.chain.tip().clone();
        let first = forge_on(&f.chain, &tip, &f.forger, 0, Vec::new());
        let now = first.timestamp;
        f.chain.process_block(first.clone(), now, None).unwrap();

        assert_eq!(f.chain.blocks_after(genesis_id, 10).unwrap(), vec![first.clone()]);
        assert!(f.chain.blocks_after(first.id(), 10).unwrap().is_empty());
        assert!(f.chain.blocks_after(BlockId(1), 10).unwrap().is_empty());
    }
}
