//! Chain engine errors

use horizon_core::{
    BlockId, CryptoError, DifficultyError, ErrorCategory, LedgerError, MalformedBlock, StorageError, TransactionError,
    TransactionId,
};

/// Why a block was refused
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlockError {
    #[error("Invalid block signature")]
    InvalidSignature,

    #[error("Invalid generator: {0}")]
    InvalidGenerator(String),

    #[error("Timestamp {timestamp} outside [{min}, {max}]")]
    TimestampOutOfRange { timestamp: u32, min: u32, max: u32 },

    #[error("Bad difficulty: {0}")]
    BadDifficulty(#[from] DifficultyError),

    #[error("Transaction {id} failed validation: {source}")]
    TransactionValidationFailed {
        id: TransactionId,
        #[source]
        source: TransactionError,
    },

    #[error("Duplicate block {0}")]
    DuplicateBlock(BlockId),

    #[error("Block height {got} does not follow parent height {parent}")]
    WrongHeight { parent: u32, got: u32 },

    #[error("Block {0} has no parent and is not the genesis block")]
    UnexpectedGenesis(BlockId),

    #[error("Malformed block: {0}")]
    Malformed(#[from] MalformedBlock),

    #[error("Unknown parent {0} and the pending-block set is full")]
    UnknownParent(BlockId),

    #[error("Reorganization depth {depth} exceeds maximum {max}")]
    ReorgTooDeep { depth: u32, max: u32 },

    #[error("Block {0} belongs to a branch marked invalid")]
    InvalidBranch(BlockId),

    #[error("Validation timed out")]
    Timeout,

    #[error("Internal invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl BlockError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            BlockError::InvalidSignature
            | BlockError::InvalidGenerator(_)
            | BlockError::TimestampOutOfRange { .. }
            | BlockError::DuplicateBlock(_)
            | BlockError::WrongHeight { .. }
            | BlockError::UnexpectedGenesis(_)
            | BlockError::Malformed(_)
            | BlockError::Timeout => ErrorCategory::Validation,
            BlockError::TransactionValidationFailed { source, .. } => source.category(),
            BlockError::BadDifficulty(err) => err.category(),
            BlockError::UnknownParent(_) | BlockError::ReorgTooDeep { .. } | BlockError::InvalidBranch(_) => {
                ErrorCategory::Consistency
            }
            BlockError::InvariantViolation(_) => ErrorCategory::InternalInvariant,
            BlockError::Storage(_) => ErrorCategory::Storage,
        }
    }

    /// Whether the block must never be retried even if resent
    pub fn is_permanent(&self) -> bool {
        !matches!(self.category(), ErrorCategory::Storage) && !matches!(self, BlockError::Timeout)
    }
}

impl From<LedgerError> for BlockError {
    fn from(err: LedgerError) -> Self {
        BlockError::InvariantViolation(err.to_string())
    }
}

/// Errors surfaced by the node service
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Key error: {0}")]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Block(#[from] BlockError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Peer error: {0}")]
    Peer(String),

    #[error("Chain lock poisoned")]
    LockPoisoned,
}

impl NodeError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            NodeError::Block(err) => err.category(),
            NodeError::Transaction(err) => err.category(),
            NodeError::Storage(_) => ErrorCategory::Storage,
            NodeError::LockPoisoned => ErrorCategory::InternalInvariant,
            NodeError::Config(_) | NodeError::Crypto(_) | NodeError::Peer(_) => ErrorCategory::Validation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(BlockError::InvalidSignature.category(), ErrorCategory::Validation);
        assert_eq!(
            BlockError::ReorgTooDeep { depth: 800, max: 720 }.category(),
            ErrorCategory::Consistency
        );
        assert_eq!(
            BlockError::BadDifficulty(DifficultyError::NotIncreasing).category(),
            ErrorCategory::InternalInvariant
        );
        assert_eq!(
            BlockError::Storage(StorageError::Write("disk full".to_string())).category(),
            ErrorCategory::Storage
        );
        let failed = BlockError::TransactionValidationFailed {
            id: TransactionId(7),
            source: TransactionError::InvalidSignature,
        };
        assert_eq!(failed.category(), ErrorCategory::Validation);
        assert!(failed.is_permanent());
        assert!(!BlockError::Timeout.is_permanent());
    }

    #[test]
    fn test_ledger_errors_are_invariant_violations() {
        let err: BlockError = LedgerError::NoOpenBlock.into();
        assert_eq!(err.category(), ErrorCategory::InternalInvariant);
    }
}
