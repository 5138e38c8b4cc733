//! Block structure for the Horizon chain

use crate::crypto::{self, KeyPair, PublicKey, Signature};
use crate::transaction::{Transaction, TransactionId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// 64-bit block identifier derived from the signed header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub u64);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Block: signed header plus the ordered transactions it commits to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Block format version
    pub version: u8,
    /// Height in the chain, 0 at genesis
    pub height: u32,
    /// Epoch seconds
    pub timestamp: u32,
    /// Parent block, `None` only for genesis
    pub previous_block_id: Option<BlockId>,
    pub transaction_count: u32,
    /// Sum of transaction amounts
    pub total_amount: u64,
    /// Sum of transaction fees, credited to the generator
    pub total_fee: u64,
    /// Sum of encoded transaction sizes
    pub payload_length: u32,
    /// SHA-256 over the encoded transactions, in order
    pub payload_hash: [u8; 32],
    pub generator_public_key: PublicKey,
    /// Stake-lottery proof: SHA-256(parent generation signature || generator key)
    pub generation_signature: [u8; 32],
    /// Difficulty parameter of this block
    pub base_target: u64,
    /// Fork-choice weight of the chain ending at this block
    pub cumulative_difficulty: u128,
    pub transactions: Vec<Transaction>,
    pub block_signature: Signature,
}

/// The part of a block covered by the block signature
#[derive(Serialize)]
struct BlockHeader<'a> {
    version: u8,
    height: u32,
    timestamp: u32,
    previous_block_id: Option<BlockId>,
    transaction_count: u32,
    total_amount: u64,
    total_fee: u64,
    payload_length: u32,
    payload_hash: &'a [u8; 32],
    generator_public_key: &'a PublicKey,
    generation_signature: &'a [u8; 32],
    base_target: u64,
    cumulative_difficulty: u128,
}

impl Block {
    /// Unsigned child of `parent` carrying `transactions` in the given order
    pub fn unsigned(
        parent: &Block,
        timestamp: u32,
        transactions: Vec<Transaction>,
        generator_public_key: PublicKey,
        generation_signature: [u8; 32],
        base_target: u64,
    ) -> Self {
        let cumulative_difficulty =
            crate::difficulty::cumulative_difficulty(parent.cumulative_difficulty, base_target);
        // an overflowing total saturates and fails `check_structure`
        let total_amount = checked_total(transactions.iter().map(|tx| tx.amount));
        let total_fee = checked_total(transactions.iter().map(|tx| tx.fee));

        Self {
            version: crate::PROTOCOL_VERSION,
            height: parent.height + 1,
            timestamp,
            previous_block_id: Some(parent.id()),
            transaction_count: transactions.len() as u32,
            total_amount,
            total_fee,
            payload_length: Self::payload_length_of(&transactions),
            payload_hash: Self::payload_hash_of(&transactions),
            generator_public_key,
            generation_signature,
            base_target,
            cumulative_difficulty,
            transactions,
            block_signature: Signature::empty(),
        }
    }

    /// Canonical encoding of the header (signature excluded)
    pub fn unsigned_bytes(&self) -> Vec<u8> {
        let header = BlockHeader {
            version: self.version,
            height: self.height,
            timestamp: self.timestamp,
            previous_block_id: self.previous_block_id,
            transaction_count: self.transaction_count,
            total_amount: self.total_amount,
            total_fee: self.total_fee,
            payload_length: self.payload_length,
            payload_hash: &self.payload_hash,
            generator_public_key: &self.generator_public_key,
            generation_signature: &self.generation_signature,
            base_target: self.base_target,
            cumulative_difficulty: self.cumulative_difficulty,
        };
        bincode::serialize(&header).expect("Failed to serialize block header")
    }

    /// Full encoding with transactions and signature
    pub fn bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("Failed to serialize block")
    }

    pub fn id(&self) -> BlockId {
        let digest = crypto::sha256_concat(&[&self.unsigned_bytes(), &self.block_signature.0]);
        BlockId(crypto::le_u64_prefix(&digest))
    }

    pub fn sign(mut self, keys: &KeyPair) -> Self {
        self.block_signature = keys.sign(&self.unsigned_bytes());
        self
    }

    pub fn verify_signature(&self) -> bool {
        crypto::verify(&self.unsigned_bytes(), &self.block_signature, &self.generator_public_key)
    }

    pub fn is_genesis(&self) -> bool {
        self.previous_block_id.is_none()
    }

    pub fn transaction_ids(&self) -> Vec<TransactionId> {
        self.transactions.iter().map(Transaction::id).collect()
    }

    /// SHA-256 over the concatenated transaction encodings
    pub fn payload_hash_of(transactions: &[Transaction]) -> [u8; 32] {
        let encoded: Vec<Vec<u8>> = transactions.iter().map(Transaction::bytes).collect();
        let parts: Vec<&[u8]> = encoded.iter().map(Vec::as_slice).collect();
        crypto::sha256_concat(&parts)
    }

    pub fn payload_length_of(transactions: &[Transaction]) -> u32 {
        transactions.iter().map(|tx| tx.size() as u32).sum()
    }

    /// Checks the header totals against the carried transactions.
    ///
    /// Needs no chain context: a block failing here is rejected before its
    /// parent is even looked up.
    pub fn check_structure(&self) -> Result<(), MalformedBlock> {
        if self.version != crate::PROTOCOL_VERSION {
            return Err(MalformedBlock::UnknownVersion(self.version));
        }
        if self.transactions.len() > crate::MAX_TRANSACTIONS_PER_BLOCK {
            return Err(MalformedBlock::TooManyTransactions(self.transactions.len()));
        }
        if self.transaction_count as usize != self.transactions.len() {
            return Err(MalformedBlock::CountMismatch {
                declared: self.transaction_count,
                actual: self.transactions.len(),
            });
        }

        let mut seen = HashSet::with_capacity(self.transactions.len());
        let mut total_amount: u64 = 0;
        let mut total_fee: u64 = 0;
        let mut payload_length: u32 = 0;
        for tx in &self.transactions {
            let id = tx.id();
            if !seen.insert(id) {
                return Err(MalformedBlock::DuplicateTransaction(id));
            }
            total_amount = total_amount.checked_add(tx.amount).ok_or(MalformedBlock::TotalsMismatch)?;
            total_fee = total_fee.checked_add(tx.fee).ok_or(MalformedBlock::TotalsMismatch)?;
            payload_length = payload_length.saturating_add(tx.size() as u32);
        }

        if payload_length > crate::MAX_PAYLOAD_LENGTH {
            return Err(MalformedBlock::PayloadTooLarge(payload_length));
        }
        if payload_length != self.payload_length {
            return Err(MalformedBlock::PayloadLengthMismatch {
                declared: self.payload_length,
                actual: payload_length,
            });
        }
        if total_amount != self.total_amount || total_fee != self.total_fee {
            return Err(MalformedBlock::TotalsMismatch);
        }
        if Self::payload_hash_of(&self.transactions) != self.payload_hash {
            return Err(MalformedBlock::PayloadHashMismatch);
        }
        Ok(())
    }

    /// Encoded size in bytes
    pub fn size(&self) -> usize {
        bincode::serialized_size(self).map(|len| len as usize).unwrap_or(0)
    }
}

/// Context-free block defects
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedBlock {
    #[error("Unknown block version {0}")]
    UnknownVersion(u8),

    #[error("Too many transactions: {0}")]
    TooManyTransactions(usize),

    #[error("Declared {declared} transactions, carries {actual}")]
    CountMismatch { declared: u32, actual: usize },

    #[error("Duplicate transaction {0}")]
    DuplicateTransaction(TransactionId),

    #[error("Payload of {0} bytes exceeds the block limit")]
    PayloadTooLarge(u32),

    #[error("Declared payload length {declared}, actual {actual}")]
    PayloadLengthMismatch { declared: u32, actual: u32 },

    #[error("Declared amount or fee totals do not match the transactions")]
    TotalsMismatch,

    #[error("Payload hash does not match the transactions")]
    PayloadHashMismatch,
}

fn checked_total(mut values: impl Iterator<Item = u64>) -> u64 {
    values
        .try_fold(0u64, |sum, value| sum.checked_add(value))
        .unwrap_or(u64::MAX)
}
