//! Ledger store: durable blocks, height-indexed account deltas and the
//! account table, with rollback to a height.
//!
//! Every block application is committed as one atomic batch. A failed
//! commit leaves the store exactly at the previous height.

use crate::account::{Account, AccountDelta};
use crate::block::{Block, BlockId};
use crate::crypto::AccountId;
use crate::ErrorCategory;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Options, WriteBatch, DB};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Column families
const CF_BLOCKS: &str = "blocks"; // block id -> Block
const CF_BLOCK_INDEX: &str = "block_index"; // height -> block id
const CF_ACCOUNT_DELTAS: &str = "account_deltas"; // height -> Vec<AccountDelta>
const CF_ACCOUNTS: &str = "accounts"; // account id -> Account
const CF_METADATA: &str = "metadata";

/// Metadata keys
const META_HEIGHT: &str = "chain_height";
const META_TIP: &str = "tip_block_id";

/// Everything persisted when a block joins the canonical chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockCommit {
    pub block: Block,
    /// Net per-account effect of the block, kept for undo
    pub deltas: Vec<AccountDelta>,
    /// State of every touched account after the block
    pub accounts: Vec<Account>,
}

/// Durable storage the chain engine commits to
pub trait LedgerStore: Send + Sync {
    /// Persisted state of an account at the committed height
    fn get_account(&self, id: AccountId) -> Result<Option<Account>, StorageError>;

    /// Stores a block by id without making it canonical (side branches)
    fn put_block(&self, block: &Block) -> Result<(), StorageError>;

    /// Atomically stores the block, indexes it by height, records its
    /// account deltas, updates touched accounts and advances the tip
    fn commit_block(&self, commit: &BlockCommit) -> Result<(), StorageError>;

    /// Reverses every committed height above `height` using the recorded
    /// deltas. Blocks stay retrievable by id.
    fn undo_to_height(&self, height: u32) -> Result<(), StorageError>;

    fn get_block(&self, id: BlockId) -> Result<Option<Block>, StorageError>;

    /// Canonical block at `height`
    fn get_block_by_height(&self, height: u32) -> Result<Option<Block>, StorageError>;

    fn get_account_deltas(&self, height: u32) -> Result<Vec<AccountDelta>, StorageError>;

    /// Committed tip height, `None` for an empty store
    fn height(&self) -> Result<Option<u32>, StorageError>;
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    bincode::serialize(value).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    bincode::deserialize(bytes).map_err(|e| StorageError::Deserialization(e.to_string()))
}

/// Applies a delta in reverse to a stored account. Returns `None` when the
/// account did not exist before the delta.
fn reverse_delta(account: Option<Account>, delta: &AccountDelta) -> Result<Option<Account>, StorageError> {
    if delta.created {
        return Ok(None);
    }
    let mut account = account.ok_or_else(|| {
        StorageError::InvalidData(format!("delta for missing account {}", delta.account))
    })?;
    let balance = i128::from(account.balance) - i128::from(delta.balance);
    account.balance = u64::try_from(balance)
        .map_err(|_| StorageError::InvalidData(format!("negative balance undoing {}", delta.account)))?;
    account.unconfirmed_balance = account.balance;
    if delta.public_key.is_some() {
        account.public_key = None;
    }
    Ok(Some(account))
}

/// RocksDB-backed ledger store
pub struct RocksStore {
    db: Arc<DB>,
}

impl RocksStore {
    /// Opens or creates a store
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_write_buffer_size(64 * 1024 * 1024);
        opts.set_max_write_buffer_number(3);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let cfs = vec![
            ColumnFamilyDescriptor::new(CF_BLOCKS, Options::default()),
            ColumnFamilyDescriptor::new(CF_BLOCK_INDEX, Options::default()),
            ColumnFamilyDescriptor::new(CF_ACCOUNT_DELTAS, Options::default()),
            ColumnFamilyDescriptor::new(CF_ACCOUNTS, Options::default()),
            ColumnFamilyDescriptor::new(CF_METADATA, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&opts, path, cfs).map_err(|e| StorageError::DatabaseOpen(e.to_string()))?;
        log::info!("Ledger store opened");

        Ok(Self { db: Arc::new(db) })
    }

    fn get_cf(&self, name: &str) -> Result<&ColumnFamily, StorageError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::ColumnFamilyNotFound(name.to_string()))
    }

    fn read<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>, StorageError> {
        let cf = self.get_cf(cf)?;
        match self.db.get_cf(cf, key) {
            Ok(Some(bytes)) => decode(&bytes).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(StorageError::Read(e.to_string())),
        }
    }
}

impl LedgerStore for RocksStore {
    fn get_account(&self, id: AccountId) -> Result<Option<Account>, StorageError> {
        self.read(CF_ACCOUNTS, &id.0.to_be_bytes())
    }

    fn put_block(&self, block: &Block) -> Result<(), StorageError> {
        let cf = self.get_cf(CF_BLOCKS)?;
        self.db
            .put_cf(cf, block.id().0.to_be_bytes(), encode(block)?)
            .map_err(|e| StorageError::Write(e.to_string()))
    }

    fn commit_block(&self, commit: &BlockCommit) -> Result<(), StorageError> {
        let block = &commit.block;
        let expected = self.height()?.map_or(0, |h| h + 1);
        if block.height != expected {
            return Err(StorageError::HeightMismatch {
                expected,
                got: block.height,
            });
        }

        let mut batch = WriteBatch::default();
        let id = block.id();
        let height_key = block.height.to_be_bytes();

        batch.put_cf(self.get_cf(CF_BLOCKS)?, id.0.to_be_bytes(), encode(block)?);
        batch.put_cf(self.get_cf(CF_BLOCK_INDEX)?, height_key, id.0.to_be_bytes());
        batch.put_cf(self.get_cf(CF_ACCOUNT_DELTAS)?, height_key, encode(&commit.deltas)?);

        let accounts_cf = self.get_cf(CF_ACCOUNTS)?;
        for account in &commit.accounts {
            batch.put_cf(accounts_cf, account.id.0.to_be_bytes(), encode(account)?);
        }

        let metadata_cf = self.get_cf(CF_METADATA)?;
        batch.put_cf(metadata_cf, META_HEIGHT, height_key);
        batch.put_cf(metadata_cf, META_TIP, id.0.to_be_bytes());

        self.db.write(batch).map_err(|e| StorageError::Write(e.to_string()))
    }

    fn undo_to_height(&self, height: u32) -> Result<(), StorageError> {
        let Some(tip) = self.height()? else {
            return Ok(());
        };
        if tip <= height {
            return Ok(());
        }

        let mut batch = WriteBatch::default();
        let accounts_cf = self.get_cf(CF_ACCOUNTS)?;
        let mut touched: HashMap<AccountId, Option<Account>> = HashMap::new();

        for h in (height + 1..=tip).rev() {
            for delta in self.get_account_deltas(h)?.iter() {
                let current = match touched.remove(&delta.account) {
                    Some(state) => state,
                    None => self.get_account(delta.account)?,
                };
                touched.insert(delta.account, reverse_delta(current, delta)?);
            }
            batch.delete_cf(self.get_cf(CF_BLOCK_INDEX)?, h.to_be_bytes());
            batch.delete_cf(self.get_cf(CF_ACCOUNT_DELTAS)?, h.to_be_bytes());
        }
        for (id, state) in &touched {
            match state {
                Some(account) => batch.put_cf(accounts_cf, id.0.to_be_bytes(), encode(account)?),
                None => batch.delete_cf(accounts_cf, id.0.to_be_bytes()),
            }
        }

        let index_cf = self.get_cf(CF_BLOCK_INDEX)?;
        let tip_id = self
            .db
            .get_cf(index_cf, height.to_be_bytes())
            .map_err(|e| StorageError::Read(e.to_string()))?
            .ok_or_else(|| StorageError::InvalidData(format!("no block indexed at height {}", height)))?;

        let metadata_cf = self.get_cf(CF_METADATA)?;
        batch.put_cf(metadata_cf, META_HEIGHT, height.to_be_bytes());
        batch.put_cf(metadata_cf, META_TIP, tip_id);

        self.db.write(batch).map_err(|e| StorageError::Write(e.to_string()))
    }

    fn get_block(&self, id: BlockId) -> Result<Option<Block>, StorageError> {
        self.read(CF_BLOCKS, &id.0.to_be_bytes())
    }

    fn get_block_by_height(&self, height: u32) -> Result<Option<Block>, StorageError> {
        let index_cf = self.get_cf(CF_BLOCK_INDEX)?;
        match self.db.get_cf(index_cf, height.to_be_bytes()) {
            Ok(Some(id_bytes)) => {
                let id: [u8; 8] = id_bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StorageError::InvalidData("Invalid block id length".to_string()))?;
                self.get_block(BlockId(u64::from_be_bytes(id)))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(StorageError::Read(e.to_string())),
        }
    }

    fn get_account_deltas(&self, height: u32) -> Result<Vec<AccountDelta>, StorageError> {
        Ok(self
            .read(CF_ACCOUNT_DELTAS, &height.to_be_bytes())?
            .unwrap_or_default())
    }

    fn height(&self) -> Result<Option<u32>, StorageError> {
        let metadata_cf = self.get_cf(CF_METADATA)?;
        let bytes = self
            .db
            .get_cf(metadata_cf, META_HEIGHT)
            .map_err(|e| StorageError::Read(e.to_string()))?;
        bytes
            .map(|bytes| {
                let raw: [u8; 4] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StorageError::InvalidData("Invalid height length".to_string()))?;
                Ok(u32::from_be_bytes(raw))
            })
            .transpose()
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    blocks: HashMap<BlockId, Block>,
    index: BTreeMap<u32, BlockId>,
    deltas: BTreeMap<u32, Vec<AccountDelta>>,
    accounts: HashMap<AccountId, Account>,
}

/// In-memory ledger store with the same semantics as [`RocksStore`].
///
/// Clones share state. Commits can be made to fail on demand.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
    fail_writes: Arc<AtomicBool>,
    fail_commits: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail with `StorageError::Write`
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Makes block commits fail while other writes still succeed
    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>, StorageError> {
        self.inner
            .lock()
            .map_err(|_| StorageError::Unavailable("memory store lock poisoned".to_string()))
    }

    fn check_writable(&self) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Write("injected write failure".to_string()));
        }
        Ok(())
    }
}

impl LedgerStore for MemoryStore {
    fn get_account(&self, id: AccountId) -> Result<Option<Account>, StorageError> {
        Ok(self.lock()?.accounts.get(&id).cloned())
    }

    fn put_block(&self, block: &Block) -> Result<(), StorageError> {
        self.check_writable()?;
        self.lock()?.blocks.insert(block.id(), block.clone());
        Ok(())
    }

    fn commit_block(&self, commit: &BlockCommit) -> Result<(), StorageError> {
        self.check_writable()?;
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(StorageError::Write("injected commit failure".to_string()));
        }
        let mut inner = self.lock()?;
        let expected = inner.index.keys().next_back().map_or(0, |h| h + 1);
        let block = &commit.block;
        if block.height != expected {
            return Err(StorageError::HeightMismatch {
                expected,
                got: block.height,
            });
        }

        let id = block.id();
        inner.blocks.insert(id, block.clone());
        inner.index.insert(block.height, id);
        inner.deltas.insert(block.height, commit.deltas.clone());
        for account in &commit.accounts {
            inner.accounts.insert(account.id, account.clone());
        }
        Ok(())
    }

    fn undo_to_height(&self, height: u32) -> Result<(), StorageError> {
        self.check_writable()?;
        let mut inner = self.lock()?;
        // stage every change first so a bad delta leaves the store untouched
        let mut accounts = inner.accounts.clone();
        let undone: Vec<u32> = inner.deltas.range(height + 1..).map(|(h, _)| *h).rev().collect();
        for h in &undone {
            for delta in inner.deltas.get(h).into_iter().flatten() {
                if let Some(account) = reverse_delta(accounts.remove(&delta.account), delta)? {
                    accounts.insert(delta.account, account);
                }
            }
        }
        inner.accounts = accounts;
        for h in undone {
            inner.deltas.remove(&h);
            inner.index.remove(&h);
        }
        Ok(())
    }

    fn get_block(&self, id: BlockId) -> Result<Option<Block>, StorageError> {
        Ok(self.lock()?.blocks.get(&id).cloned())
    }

    fn get_block_by_height(&self, height: u32) -> Result<Option<Block>, StorageError> {
        let inner = self.lock()?;
        Ok(inner.index.get(&height).and_then(|id| inner.blocks.get(id)).cloned())
    }

    fn get_account_deltas(&self, height: u32) -> Result<Vec<AccountDelta>, StorageError> {
        Ok(self.lock()?.deltas.get(&height).cloned().unwrap_or_default())
    }

    fn height(&self) -> Result<Option<u32>, StorageError> {
        Ok(self.lock()?.index.keys().next_back().copied())
    }
}

/// Storage errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("Database open error: {0}")]
    DatabaseOpen(String),

    #[error("Column family not found: {0}")]
    ColumnFamilyNotFound(String),

    #[error("Read error: {0}")]
    Read(String),

    #[error("Write error: {0}")]
    Write(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Commit out of order: expected height {expected}, got {got}")]
    HeightMismatch { expected: u32, got: u32 },

    #[error("Block not found: {0}")]
    BlockNotFound(BlockId),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::Storage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::Ledger;
    use crate::attachment::{Attachment, AttachmentRegistry};
    use crate::crypto::KeyPair;
    use crate::genesis::GenesisConfig;
    use crate::transaction::TransactionBuilder;
    use tempfile::TempDir;

    fn create_test_db() -> (RocksStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = RocksStore::open(temp_dir.path()).unwrap();
        (db, temp_dir)
    }

    /// Genesis plus one block moving 100 units from alice to bob, with the
    /// commits a chain would produce for them
    fn two_commits() -> (BlockCommit, BlockCommit, KeyPair, KeyPair) {
        let alice = KeyPair::from_secret_phrase("alice").unwrap();
        let bob = KeyPair::from_secret_phrase("bob").unwrap();
        let registry = AttachmentRegistry::standard();
        let config = GenesisConfig::new(0).allocate(alice.public_key(), 1_000);
        let genesis = config.block();

        let mut ledger = Ledger::new(10, 10);
        config.apply(&mut ledger).unwrap();
        let genesis_commit = BlockCommit {
            block: genesis.clone(),
            deltas: ledger.deltas(0),
            accounts: ledger.accounts().cloned().collect(),
        };

        let tx = TransactionBuilder::new(alice.public_key(), 100, 1, 60, Attachment::OrdinaryPayment)
            .recipient(bob.account_id())
            .timestamp(10)
            .sign(&alice);
        let block = Block::unsigned(&genesis, 60, vec![tx.clone()], alice.public_key(), [1; 32], 1).sign(&alice);
        ledger.begin_block(1).unwrap();
        ledger.apply_transaction(&tx, &registry).unwrap();
        ledger.credit(alice.account_id(), tx.fee).unwrap();
        let deltas = ledger.deltas(1);
        ledger.end_block().unwrap();
        let accounts = deltas
            .iter()
            .filter_map(|d| ledger.account(d.account).cloned())
            .collect();

        (genesis_commit, BlockCommit { block, deltas, accounts }, alice, bob)
    }

    fn exercise_store(store: &dyn LedgerStore) {
        let (genesis, first, alice, bob) = two_commits();
        assert_eq!(store.height().unwrap(), None);

        store.commit_block(&genesis).unwrap();
        store.commit_block(&first).unwrap();
        assert_eq!(store.height().unwrap(), Some(1));
        assert_eq!(store.get_account(alice.account_id()).unwrap().unwrap().balance, 900);
        assert_eq!(store.get_account(bob.account_id()).unwrap().unwrap().balance, 100);
        assert_eq!(
            store.get_block_by_height(1).unwrap().map(|b| b.id()),
            Some(first.block.id())
        );

        // commits must be contiguous
        assert!(matches!(
            store.commit_block(&first),
            Err(StorageError::HeightMismatch { expected: 2, got: 1 })
        ));

        store.undo_to_height(0).unwrap();
        assert_eq!(store.height().unwrap(), Some(0));
        assert_eq!(store.get_account(alice.account_id()).unwrap().unwrap().balance, 1_000);
        assert_eq!(store.get_account(bob.account_id()).unwrap(), None);
        assert_eq!(store.get_block_by_height(1).unwrap(), None);
        // undone blocks stay retrievable by id
        assert!(store.get_block(first.block.id()).unwrap().is_some());
        assert!(store.get_account_deltas(1).unwrap().is_empty());
    }

    #[test]
    fn test_rocks_store_commit_and_undo() {
        let (db, _temp) = create_test_db();
        exercise_store(&db);
    }

    #[test]
    fn test_memory_store_commit_and_undo() {
        exercise_store(&MemoryStore::new());
    }

    #[test]
    fn test_rocks_store_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let (genesis, first, alice, _) = two_commits();
        {
            let db = RocksStore::open(temp.path()).unwrap();
            db.commit_block(&genesis).unwrap();
            db.commit_block(&first).unwrap();
        }
        let db = RocksStore::open(temp.path()).unwrap();
        assert_eq!(db.height().unwrap(), Some(1));
        assert_eq!(db.get_account(alice.account_id()).unwrap().unwrap().balance, 900);
        assert_eq!(db.get_account_deltas(1).unwrap(), first.deltas);
    }

    #[test]
    fn test_side_block_is_not_canonical() {
        let store = MemoryStore::new();
        let (genesis, first, _, _) = two_commits();
        store.commit_block(&genesis).unwrap();
        store.put_block(&first.block).unwrap();

        assert_eq!(store.height().unwrap(), Some(0));
        assert!(store.get_block(first.block.id()).unwrap().is_some());
        assert_eq!(store.get_block_by_height(1).unwrap(), None);
    }

    #[test]
    fn test_injected_failure_leaves_height() {
        let store = MemoryStore::new();
        let (genesis, first, _, _) = two_commits();
        store.commit_block(&genesis).unwrap();

        store.set_fail_writes(true);
        assert!(matches!(store.commit_block(&first), Err(StorageError::Write(_))));
        assert_eq!(store.height().unwrap(), Some(0));

        store.set_fail_writes(false);
        store.commit_block(&first).unwrap();
        assert_eq!(store.height().unwrap(), Some(1));
    }
}
