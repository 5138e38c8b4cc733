//! Transaction attachments and the handler registry
//!
//! Each (type, subtype) tag maps to one [`AttachmentHandler`]. The validator
//! and the ledger only talk to handlers through the registry, so a new
//! transaction type is added by registering a handler.

use crate::account::{Ledger, LedgerError, Poll};
use crate::transaction::Transaction;
use crate::validation::TransactionError;
use crate::{
    ATTACHMENT_FEE_CHUNK_BYTES, FEE_PER_ATTACHMENT_CHUNK, MAX_MESSAGE_LENGTH, MAX_POLL_DESCRIPTION_LENGTH,
    MAX_POLL_NAME_LENGTH, MAX_POLL_OPTION_COUNT, MAX_POLL_OPTION_LENGTH, MAX_VOTE_DURATION,
    MAX_VOTE_RANGE_VALUE, MIN_FEE, MIN_VOTE_DURATION, MIN_VOTE_RANGE_VALUE,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Discriminator of the attachment semantics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionType {
    pub kind: u8,
    pub subtype: u8,
}

impl TransactionType {
    pub const ORDINARY_PAYMENT: TransactionType = TransactionType { kind: 0, subtype: 0 };
    pub const ARBITRARY_MESSAGE: TransactionType = TransactionType { kind: 1, subtype: 0 };
    pub const POLL_CREATION: TransactionType = TransactionType { kind: 1, subtype: 2 };
    pub const VOTE_CASTING: TransactionType = TransactionType { kind: 1, subtype: 3 };
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.subtype)
    }
}

/// Type-specific payload of a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Attachment {
    OrdinaryPayment,
    ArbitraryMessage { message: Vec<u8> },
    PollCreation(PollCreation),
    VoteCasting(VoteCasting),
}

impl Attachment {
    /// Tag this payload must be carried under
    pub fn transaction_type(&self) -> TransactionType {
        match self {
            Attachment::OrdinaryPayment => TransactionType::ORDINARY_PAYMENT,
            Attachment::ArbitraryMessage { .. } => TransactionType::ARBITRARY_MESSAGE,
            Attachment::PollCreation(_) => TransactionType::POLL_CREATION,
            Attachment::VoteCasting(_) => TransactionType::VOTE_CASTING,
        }
    }

    /// Encoded size of the payload, used by the fee schedule
    pub fn size(&self) -> usize {
        bincode::serialized_size(self).map(|len| len as usize).unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollCreation {
    pub name: String,
    pub description: String,
    pub options: Vec<String>,
    pub finish_height: u32,
    pub min_number_of_options: u8,
    pub max_number_of_options: u8,
    pub min_range_value: i8,
    pub max_range_value: i8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteCasting {
    pub poll: crate::transaction::TransactionId,
    /// One value per poll option, zero meaning "no vote"
    pub votes: Vec<i8>,
}

/// Validation and ledger effects of one transaction type.
///
/// `apply_attachment` runs after the generic balance transfer of the
/// transaction, `undo_attachment` before its reversal.
pub trait AttachmentHandler: Send + Sync {
    fn transaction_type(&self) -> TransactionType;

    fn name(&self) -> &'static str;

    /// Minimum fee for this transaction, in base units
    fn minimum_fee(&self, tx: &Transaction) -> u64 {
        let _ = tx;
        MIN_FEE
    }

    /// Whether this type may transfer a non-zero amount
    fn allows_amount(&self) -> bool {
        false
    }

    fn validate_attachment(&self, tx: &Transaction, ledger: &Ledger, height: u32) -> Result<(), TransactionError>;

    fn apply_attachment(&self, tx: &Transaction, ledger: &mut Ledger, height: u32) -> Result<(), LedgerError>;

    fn undo_attachment(&self, tx: &Transaction, ledger: &mut Ledger) -> Result<(), LedgerError>;
}

fn chunked_fee(tx: &Transaction) -> u64 {
    let chunks = tx.attachment.size().div_ceil(ATTACHMENT_FEE_CHUNK_BYTES) as u64;
    MIN_FEE + chunks * FEE_PER_ATTACHMENT_CHUNK
}

fn invalid(reason: impl Into<String>) -> TransactionError {
    TransactionError::InvalidAttachment(reason.into())
}

struct OrdinaryPaymentHandler;

impl AttachmentHandler for OrdinaryPaymentHandler {
    fn transaction_type(&self) -> TransactionType {
        TransactionType::ORDINARY_PAYMENT
    }

    fn name(&self) -> &'static str {
        "OrdinaryPayment"
    }

    fn allows_amount(&self) -> bool {
        true
    }

    fn validate_attachment(&self, tx: &Transaction, _ledger: &Ledger, _height: u32) -> Result<(), TransactionError> {
        if tx.amount == 0 {
            return Err(invalid("payment amount must be positive"));
        }
        if tx.recipient.is_none() {
            return Err(invalid("payment without recipient"));
        }
        Ok(())
    }

    fn apply_attachment(&self, _tx: &Transaction, _ledger: &mut Ledger, _height: u32) -> Result<(), LedgerError> {
        Ok(())
    }

    fn undo_attachment(&self, _tx: &Transaction, _ledger: &mut Ledger) -> Result<(), LedgerError> {
        Ok(())
    }
}

struct ArbitraryMessageHandler;

impl AttachmentHandler for ArbitraryMessageHandler {
    fn transaction_type(&self) -> TransactionType {
        TransactionType::ARBITRARY_MESSAGE
    }

    fn name(&self) -> &'static str {
        "ArbitraryMessage"
    }

    fn minimum_fee(&self, tx: &Transaction) -> u64 {
        chunked_fee(tx)
    }

    fn validate_attachment(&self, tx: &Transaction, _ledger: &Ledger, _height: u32) -> Result<(), TransactionError> {
        let Attachment::ArbitraryMessage { message } = &tx.attachment else {
            return Err(invalid("expected a message attachment"));
        };
        if message.len() > MAX_MESSAGE_LENGTH {
            return Err(invalid(format!("message of {} bytes exceeds {}", message.len(), MAX_MESSAGE_LENGTH)));
        }
        if tx.recipient.is_none() {
            return Err(invalid("message without recipient"));
        }
        Ok(())
    }

    fn apply_attachment(&self, _tx: &Transaction, _ledger: &mut Ledger, _height: u32) -> Result<(), LedgerError> {
        Ok(())
    }

    fn undo_attachment(&self, _tx: &Transaction, _ledger: &mut Ledger) -> Result<(), LedgerError> {
        Ok(())
    }
}

struct PollCreationHandler;

impl AttachmentHandler for PollCreationHandler {
    fn transaction_type(&self) -> TransactionType {
        TransactionType::POLL_CREATION
    }

    fn name(&self) -> &'static str {
        "PollCreation"
    }

    fn minimum_fee(&self, tx: &Transaction) -> u64 {
        chunked_fee(tx)
    }

    fn validate_attachment(&self, tx: &Transaction, _ledger: &Ledger, height: u32) -> Result<(), TransactionError> {
        let Attachment::PollCreation(poll) = &tx.attachment else {
            return Err(invalid("expected a poll creation attachment"));
        };

        let name = poll.name.trim();
        if name.is_empty() || name.len() != poll.name.len() || poll.name.chars().count() > MAX_POLL_NAME_LENGTH {
            return Err(invalid("poll name must be 1..=100 trimmed characters"));
        }
        if poll.description.chars().count() > MAX_POLL_DESCRIPTION_LENGTH {
            return Err(invalid("poll description too long"));
        }
        if poll.options.is_empty() || poll.options.len() > MAX_POLL_OPTION_COUNT {
            return Err(invalid(format!("poll must have 1..={} options", MAX_POLL_OPTION_COUNT)));
        }
        for option in &poll.options {
            let trimmed = option.trim();
            if trimmed.is_empty() || trimmed.len() != option.len() || option.chars().count() > MAX_POLL_OPTION_LENGTH {
                return Err(invalid("poll option must be 1..=100 trimmed characters"));
            }
        }

        let earliest = height.saturating_add(MIN_VOTE_DURATION);
        let latest = height.saturating_add(MAX_VOTE_DURATION);
        if poll.finish_height < earliest || poll.finish_height > latest {
            return Err(invalid(format!(
                "finish height {} outside [{}, {}]",
                poll.finish_height, earliest, latest
            )));
        }

        let option_count = poll.options.len();
        if poll.min_number_of_options < 1
            || poll.min_number_of_options > poll.max_number_of_options
            || poll.max_number_of_options as usize > option_count
        {
            return Err(invalid("inconsistent number of options"));
        }
        if poll.min_range_value < MIN_VOTE_RANGE_VALUE
            || poll.min_range_value > poll.max_range_value
            || poll.max_range_value > MAX_VOTE_RANGE_VALUE
        {
            return Err(invalid("inconsistent range values"));
        }
        Ok(())
    }

    fn apply_attachment(&self, tx: &Transaction, ledger: &mut Ledger, _height: u32) -> Result<(), LedgerError> {
        let Attachment::PollCreation(poll) = &tx.attachment else {
            return Err(LedgerError::AttachmentMismatch(tx.id()));
        };
        ledger.insert_poll(Poll {
            id: tx.id(),
            creator: tx.sender_id(),
            name: poll.name.clone(),
            description: poll.description.clone(),
            options: poll.options.clone(),
            finish_height: poll.finish_height,
            min_number_of_options: poll.min_number_of_options,
            max_number_of_options: poll.max_number_of_options,
            min_range_value: poll.min_range_value,
            max_range_value: poll.max_range_value,
            tallies: vec![0; poll.options.len()],
            voters: 0,
        });
        Ok(())
    }

    fn undo_attachment(&self, tx: &Transaction, ledger: &mut Ledger) -> Result<(), LedgerError> {
        ledger.remove_poll(tx.id());
        Ok(())
    }
}

struct VoteCastingHandler;

impl AttachmentHandler for VoteCastingHandler {
    fn transaction_type(&self) -> TransactionType {
        TransactionType::VOTE_CASTING
    }

    fn name(&self) -> &'static str {
        "VoteCasting"
    }

    fn minimum_fee(&self, tx: &Transaction) -> u64 {
        chunked_fee(tx)
    }

    fn validate_attachment(&self, tx: &Transaction, ledger: &Ledger, height: u32) -> Result<(), TransactionError> {
        let Attachment::VoteCasting(vote) = &tx.attachment else {
            return Err(invalid("expected a vote attachment"));
        };
        let poll = ledger
            .poll(vote.poll)
            .ok_or_else(|| invalid(format!("unknown poll {}", vote.poll)))?;

        if height >= poll.finish_height {
            return Err(invalid(format!("poll {} finished at height {}", poll.id, poll.finish_height)));
        }
        if ledger.has_voted(vote.poll, tx.sender_id()) {
            return Err(invalid("account already voted in this poll"));
        }
        if vote.votes.len() != poll.options.len() {
            return Err(invalid("one value per option required"));
        }

        let mut chosen = 0usize;
        for &value in &vote.votes {
            if value == 0 {
                continue;
            }
            if value < poll.min_range_value || value > poll.max_range_value {
                return Err(invalid(format!("vote value {} out of range", value)));
            }
            chosen += 1;
        }
        if chosen < poll.min_number_of_options as usize || chosen > poll.max_number_of_options as usize {
            return Err(invalid(format!("{} options chosen", chosen)));
        }
        Ok(())
    }

    fn apply_attachment(&self, tx: &Transaction, ledger: &mut Ledger, _height: u32) -> Result<(), LedgerError> {
        let Attachment::VoteCasting(vote) = &tx.attachment else {
            return Err(LedgerError::AttachmentMismatch(tx.id()));
        };
        ledger.record_vote(vote.poll, tx.sender_id(), &vote.votes, 1)
    }

    fn undo_attachment(&self, tx: &Transaction, ledger: &mut Ledger) -> Result<(), LedgerError> {
        let Attachment::VoteCasting(vote) = &tx.attachment else {
            return Err(LedgerError::AttachmentMismatch(tx.id()));
        };
        ledger.record_vote(vote.poll, tx.sender_id(), &vote.votes, -1)
    }
}

/// Maps transaction type tags to their handlers
pub struct AttachmentRegistry {
    handlers: HashMap<TransactionType, Box<dyn AttachmentHandler>>,
}

impl AttachmentRegistry {
    /// Empty registry
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registry with every built-in transaction type
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(OrdinaryPaymentHandler));
        registry.register(Box::new(ArbitraryMessageHandler));
        registry.register(Box::new(PollCreationHandler));
        registry.register(Box::new(VoteCastingHandler));
        registry
    }

    /// Registers a handler, replacing any previous handler for its tag
    pub fn register(&mut self, handler: Box<dyn AttachmentHandler>) {
        self.handlers.insert(handler.transaction_type(), handler);
    }

    pub fn get(&self, tx_type: TransactionType) -> Option<&dyn AttachmentHandler> {
        self.handlers.get(&tx_type).map(|handler| handler.as_ref())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for AttachmentRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl fmt::Debug for AttachmentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.handlers.values().map(|h| h.name()).collect();
        names.sort_unstable();
        f.debug_struct("AttachmentRegistry").field("handlers", &names).finish()
    }
}
