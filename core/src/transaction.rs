//! Signed account-model transactions

use crate::attachment::{Attachment, TransactionType};
use crate::crypto::{self, AccountId, KeyPair, PublicKey, Signature};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 64-bit transaction identifier derived from the signed encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(pub u64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction, immutable once signed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction format version
    pub version: u8,
    pub tx_type: TransactionType,
    /// Epoch seconds at creation
    pub timestamp: u32,
    /// Lifetime in minutes from `timestamp`
    pub deadline: u16,
    pub sender_public_key: PublicKey,
    pub recipient: Option<AccountId>,
    /// Amount in base units
    pub amount: u64,
    /// Fee in base units, paid to the block generator
    pub fee: u64,
    pub attachment: Attachment,
    pub signature: Signature,
}

/// Everything the signature covers
#[derive(Serialize)]
struct SignedContent<'a> {
    version: u8,
    tx_type: TransactionType,
    timestamp: u32,
    deadline: u16,
    sender_public_key: &'a PublicKey,
    recipient: Option<AccountId>,
    amount: u64,
    fee: u64,
    attachment: &'a Attachment,
}

impl Transaction {
    /// Canonical encoding of the signed content (signature excluded)
    pub fn unsigned_bytes(&self) -> Vec<u8> {
        let content = SignedContent {
            version: self.version,
            tx_type: self.tx_type,
            timestamp: self.timestamp,
            deadline: self.deadline,
            sender_public_key: &self.sender_public_key,
            recipient: self.recipient,
            amount: self.amount,
            fee: self.fee,
            attachment: &self.attachment,
        };
        bincode::serialize(&content).expect("Failed to serialize transaction")
    }

    /// Complete canonical encoding, signature included
    pub fn bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("Failed to serialize transaction")
    }

    /// SHA-256 of the unsigned encoding followed by the signature
    pub fn full_hash(&self) -> [u8; 32] {
        crypto::sha256_concat(&[&self.unsigned_bytes(), &self.signature.0])
    }

    pub fn id(&self) -> TransactionId {
        TransactionId(crypto::le_u64_prefix(&self.full_hash()))
    }

    pub fn sender_id(&self) -> AccountId {
        self.sender_public_key.account_id()
    }

    /// Epoch second at which the transaction stops being valid
    pub fn expiration(&self) -> u32 {
        self.timestamp.saturating_add(u32::from(self.deadline) * 60)
    }

    pub fn is_expired(&self, now: u32) -> bool {
        self.expiration() <= now
    }

    /// Amount plus fee, the sum reserved from the sender
    pub fn total_cost(&self) -> Option<u64> {
        self.amount.checked_add(self.fee)
    }

    pub fn verify_signature(&self) -> bool {
        crypto::verify(&self.unsigned_bytes(), &self.signature, &self.sender_public_key)
    }

    /// Encoded size in bytes
    pub fn size(&self) -> usize {
        bincode::serialized_size(self).map(|len| len as usize).unwrap_or(0)
    }
}

/// Builds and signs a transaction
#[derive(Debug, Clone)]
pub struct TransactionBuilder {
    sender_public_key: PublicKey,
    recipient: Option<AccountId>,
    amount: u64,
    fee: u64,
    deadline: u16,
    timestamp: u32,
    attachment: Attachment,
}

impl TransactionBuilder {
    pub fn new(sender_public_key: PublicKey, amount: u64, fee: u64, deadline: u16, attachment: Attachment) -> Self {
        Self {
            sender_public_key,
            recipient: None,
            amount,
            fee,
            deadline,
            timestamp: 0,
            attachment,
        }
    }

    pub fn recipient(mut self, recipient: AccountId) -> Self {
        self.recipient = Some(recipient);
        self
    }

    pub fn timestamp(mut self, timestamp: u32) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Transaction with an empty signature, for callers signing elsewhere
    pub fn build_unsigned(self) -> Transaction {
        Transaction {
            version: crate::PROTOCOL_VERSION,
            tx_type: self.attachment.transaction_type(),
            timestamp: self.timestamp,
            deadline: self.deadline,
            sender_public_key: self.sender_public_key,
            recipient: self.recipient,
            amount: self.amount,
            fee: self.fee,
            attachment: self.attachment,
            signature: Signature::empty(),
        }
    }

    pub fn sign(self, keys: &KeyPair) -> Transaction {
        let mut tx = self.build_unsigned();
        tx.signature = keys.sign(&tx.unsigned_bytes());
        tx
    }
}
