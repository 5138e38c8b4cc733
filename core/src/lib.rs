//! Horizon Core - data model and consensus rules of the Horizon chain
//!
//! Everything in this crate is deterministic: given the same inputs every
//! node must reach the same accept/reject decision, bit for bit.

pub mod account;
pub mod attachment;
pub mod block;
pub mod crypto;
pub mod difficulty;
pub mod forging;
pub mod genesis;
pub mod storage;
pub mod time;
pub mod transaction;
pub mod validation;

pub use account::{Account, AccountDelta, Ledger, LedgerChange, LedgerError};
pub use attachment::{Attachment, AttachmentHandler, AttachmentRegistry, TransactionType};
pub use block::{Block, BlockId, MalformedBlock};
pub use crypto::{AccountId, CryptoError, KeyPair, PublicKey, Signature};
pub use difficulty::{DifficultyAdjuster, DifficultyError};
pub use forging::LotteryTicket;
pub use genesis::{GenesisAllocation, GenesisConfig};
pub use storage::{BlockCommit, LedgerStore, MemoryStore, RocksStore, StorageError};
pub use time::{Clock, EpochClock, FasterClock, ManualClock};
pub use transaction::{Transaction, TransactionBuilder, TransactionId};
pub use validation::{BalanceView, TransactionError, TransactionValidator, ValidationContext};

/// How a failure must be handled by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Bad input: reported and discarded, never retried automatically
    Validation,
    /// Input that contradicts chain context: discarded, the sender may be penalized
    Consistency,
    /// Persistence failure: the operation must be retried once the store recovers
    Storage,
    /// A consensus rule was broken locally; fatal for the affected chain segment
    InternalInvariant,
}

/// Current protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Base units per coin
pub const ONE_COIN: u64 = 100_000_000;

/// Total supply in coins; no balance can ever exceed it
pub const MAX_BALANCE_COINS: u64 = 1_000_000_000;

/// Total supply in base units
pub const MAX_BALANCE: u64 = MAX_BALANCE_COINS * ONE_COIN;

/// Target time per block in seconds
pub const TARGET_BLOCK_TIME: u64 = 60;

/// Base target of the genesis block: 2^63 / (TARGET_BLOCK_TIME * MAX_BALANCE_COINS)
pub const INITIAL_BASE_TARGET: u64 = 153_722_867;

/// Upper bound of the base target
pub const MAX_BASE_TARGET: u64 = MAX_BALANCE_COINS * INITIAL_BASE_TARGET;

/// Maximum number of transactions in a block
pub const MAX_TRANSACTIONS_PER_BLOCK: usize = 255;

/// Maximum encoded size of the transactions carried by a block
pub const MAX_PAYLOAD_LENGTH: u32 = MAX_TRANSACTIONS_PER_BLOCK as u32 * 320;

/// Maximum transaction lifetime in minutes
pub const MAX_DEADLINE_MINUTES: u16 = 1440;

/// Minimum fee of every transaction, in base units
pub const MIN_FEE: u64 = 1;

/// Extra fee charged per started chunk of attachment bytes
pub const FEE_PER_ATTACHMENT_CHUNK: u64 = 1;

/// Attachment chunk size used by the fee schedule
pub const ATTACHMENT_FEE_CHUNK_BYTES: usize = 32;

/// Maximum length of an arbitrary message
pub const MAX_MESSAGE_LENGTH: usize = 1000;

/// Poll limits
pub const MAX_POLL_NAME_LENGTH: usize = 100;
pub const MAX_POLL_DESCRIPTION_LENGTH: usize = 1000;
pub const MAX_POLL_OPTION_LENGTH: usize = 100;
pub const MAX_POLL_OPTION_COUNT: usize = 100;
pub const MIN_VOTE_DURATION: u32 = 1440;
pub const MAX_VOTE_DURATION: u32 = 14 * 1440;
pub const MIN_VOTE_RANGE_VALUE: i8 = 0;
pub const MAX_VOTE_RANGE_VALUE: i8 = 100;
