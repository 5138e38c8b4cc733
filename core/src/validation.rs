//! Transaction validation rules
//!
//! Checks run in a fixed order and the first failure wins, so every node
//! reports the same error for the same transaction. Validation never
//! mutates state.

use crate::account::{Ledger, LedgerError};
use crate::attachment::{AttachmentRegistry, TransactionType};
use crate::transaction::{Transaction, TransactionId};
use crate::{ErrorCategory, MAX_BALANCE, MAX_DEADLINE_MINUTES, PROTOCOL_VERSION};

/// Which balance a transaction must be covered by
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceView {
    /// Pool admission: confirmed balance minus pending reservations
    Unconfirmed,
    /// Block application: confirmed balance at application time
    Confirmed,
}

/// Chain context a transaction is validated against
#[derive(Debug, Clone, Copy)]
pub struct ValidationContext {
    /// Epoch seconds the deadline is measured against (block timestamp or now)
    pub reference_time: u32,
    /// Height of the block that would include the transaction
    pub height: u32,
    /// Accepted clock skew for transaction timestamps, in seconds
    pub allowed_clock_skew: u32,
    pub balance_view: BalanceView,
}

impl ValidationContext {
    pub fn for_pool(now: u32, next_height: u32, allowed_clock_skew: u32) -> Self {
        Self {
            reference_time: now,
            height: next_height,
            allowed_clock_skew,
            balance_view: BalanceView::Unconfirmed,
        }
    }

    pub fn for_block(block_timestamp: u32, height: u32, allowed_clock_skew: u32) -> Self {
        Self {
            reference_time: block_timestamp,
            height,
            allowed_clock_skew,
            balance_view: BalanceView::Confirmed,
        }
    }
}

/// Validates transactions through the attachment registry
#[derive(Debug, Clone, Copy)]
pub struct TransactionValidator<'a> {
    registry: &'a AttachmentRegistry,
}

impl<'a> TransactionValidator<'a> {
    pub fn new(registry: &'a AttachmentRegistry) -> Self {
        Self { registry }
    }

    /// Checks, in order: version and shape, signature, expiry, duplicate id,
    /// fee, attachment, balance.
    pub fn validate(&self, tx: &Transaction, ledger: &Ledger, ctx: &ValidationContext) -> Result<(), TransactionError> {
        self.check(tx, ledger, ctx, true)
    }

    /// Same as [`TransactionValidator::validate`] for a transaction whose
    /// signature was already verified, e.g. when re-admitting pooled
    /// transactions after the ledger moved.
    pub fn revalidate(&self, tx: &Transaction, ledger: &Ledger, ctx: &ValidationContext) -> Result<(), TransactionError> {
        self.check(tx, ledger, ctx, false)
    }

    fn check(
        &self,
        tx: &Transaction,
        ledger: &Ledger,
        ctx: &ValidationContext,
        verify_signature: bool,
    ) -> Result<(), TransactionError> {
        // 1. signature
        if verify_signature && !tx.verify_signature() {
            return Err(TransactionError::InvalidSignature);
        }

        if tx.version != PROTOCOL_VERSION {
            return Err(TransactionError::UnknownVersion(tx.version));
        }
        let handler = self
            .registry
            .get(tx.tx_type)
            .ok_or(TransactionError::UnknownType(tx.tx_type))?;
        if tx.attachment.transaction_type() != tx.tx_type {
            return Err(TransactionError::InvalidAttachment(format!(
                "attachment does not match type {}",
                tx.tx_type
            )));
        }
        if tx.deadline == 0 || tx.deadline > MAX_DEADLINE_MINUTES {
            return Err(TransactionError::Malformed(format!("deadline {} minutes", tx.deadline)));
        }
        if tx.amount > MAX_BALANCE || tx.fee > MAX_BALANCE {
            return Err(TransactionError::Malformed("amount or fee above total supply".to_string()));
        }
        let total = tx
            .total_cost()
            .filter(|total| *total <= MAX_BALANCE)
            .ok_or_else(|| TransactionError::Malformed("amount plus fee overflows".to_string()))?;
        if tx.amount > 0 && !handler.allows_amount() {
            return Err(TransactionError::Malformed(format!("{} cannot transfer an amount", handler.name())));
        }
        if tx.amount > 0 && tx.recipient.is_none() {
            return Err(TransactionError::Malformed("amount without recipient".to_string()));
        }

        // 2. expiry and clock skew
        if tx.expiration() <= ctx.reference_time {
            return Err(TransactionError::Expired {
                expiration: tx.expiration(),
                reference_time: ctx.reference_time,
            });
        }
        if tx.timestamp > ctx.reference_time.saturating_add(ctx.allowed_clock_skew) {
            return Err(TransactionError::FutureTimestamp {
                timestamp: tx.timestamp,
                reference_time: ctx.reference_time,
            });
        }

        let id = tx.id();
        if ledger.is_confirmed(id) {
            return Err(TransactionError::DuplicateId(id));
        }

        // 3. fee
        let minimum = handler.minimum_fee(tx);
        if tx.fee < minimum {
            return Err(TransactionError::FeeBelowMinimum { fee: tx.fee, minimum });
        }

        // 4. type-specific payload
        handler.validate_attachment(tx, ledger, ctx.height)?;

        // 5. funds
        let sender = tx.sender_id();
        let available = match ctx.balance_view {
            BalanceView::Unconfirmed => ledger.unconfirmed_balance(sender),
            BalanceView::Confirmed => ledger.balance(sender),
        };
        if available < total {
            return Err(TransactionError::InsufficientFunds {
                available,
                required: total,
            });
        }
        if let Some(known) = ledger.account(sender).and_then(|a| a.public_key) {
            if known != tx.sender_public_key {
                return Err(TransactionError::InvalidSignature);
            }
        }

        Ok(())
    }
}

/// Transaction validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransactionError {
    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Expired at {expiration}, reference time {reference_time}")]
    Expired { expiration: u32, reference_time: u32 },

    #[error("Timestamp {timestamp} is ahead of reference time {reference_time}")]
    FutureTimestamp { timestamp: u32, reference_time: u32 },

    #[error("Duplicate transaction {0}")]
    DuplicateId(TransactionId),

    #[error("Insufficient funds: {available} available, {required} required")]
    InsufficientFunds { available: u64, required: u64 },

    #[error("Invalid attachment: {0}")]
    InvalidAttachment(String),

    #[error("Fee {fee} below minimum {minimum}")]
    FeeBelowMinimum { fee: u64, minimum: u64 },

    #[error("Unknown transaction version {0}")]
    UnknownVersion(u8),

    #[error("Unknown transaction type {0}")]
    UnknownType(TransactionType),

    #[error("Malformed transaction: {0}")]
    Malformed(String),

    #[error("Unconfirmed pool is full")]
    PoolFull,

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

impl TransactionError {
    /// Whether the failure comes from a broken ledger invariant rather than the transaction
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, TransactionError::Ledger(err) if err.is_invariant_violation())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            TransactionError::Ledger(err) => err.category(),
            _ => ErrorCategory::Validation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachment::Attachment;
    use crate::crypto::{AccountId, KeyPair};
    use crate::transaction::TransactionBuilder;

    const NOW: u32 = 10_000;

    struct Fixture {
        registry: AttachmentRegistry,
        ledger: Ledger,
        alice: KeyPair,
        bob: AccountId,
    }

    fn fixture() -> Fixture {
        let alice = KeyPair::from_secret_phrase("alice").unwrap();
        let bob = KeyPair::from_secret_phrase("bob").unwrap().account_id();
        let mut ledger = Ledger::new(1440, 720);
        ledger.begin_block(0).unwrap();
        ledger.credit(alice.account_id(), 1_000_000).unwrap();
        ledger.end_block().unwrap();
        Fixture {
            registry: AttachmentRegistry::standard(),
            ledger,
            alice,
            bob,
        }
    }

    fn payment(f: &Fixture, amount: u64, fee: u64, timestamp: u32, deadline: u16) -> Transaction {
        TransactionBuilder::new(f.alice.public_key(), amount, fee, deadline, Attachment::OrdinaryPayment)
            .recipient(f.bob)
            .timestamp(timestamp)
            .sign(&f.alice)
    }

    fn pool_ctx() -> ValidationContext {
        ValidationContext::for_pool(NOW, 1, 15)
    }

    #[test]
    fn test_valid_payment() {
        let f = fixture();
        let tx = payment(&f, 100, 1, NOW, 60);
        let validator = TransactionValidator::new(&f.registry);
        assert_eq!(validator.validate(&tx, &f.ledger, &pool_ctx()), Ok(()));
    }

    #[test]
    fn test_invalid_signature() {
        let f = fixture();
        let mut tx = payment(&f, 100, 1, NOW, 60);
        tx.fee = 2;
        let validator = TransactionValidator::new(&f.registry);
        assert_eq!(
            validator.validate(&tx, &f.ledger, &pool_ctx()),
            Err(TransactionError::InvalidSignature)
        );
    }

    #[test]
    fn test_revalidate_skips_signature_only() {
        let f = fixture();
        let mut tx = payment(&f, 100, 1, NOW, 60);
        tx.signature.0[5] ^= 0xff;
        let validator = TransactionValidator::new(&f.registry);
        assert_eq!(validator.revalidate(&tx, &f.ledger, &pool_ctx()), Ok(()));

        let ctx = ValidationContext::for_pool(NOW + 3_600, 1, 15);
        assert!(matches!(
            validator.revalidate(&tx, &f.ledger, &ctx),
            Err(TransactionError::Expired { .. })
        ));
    }

    #[test]
    fn test_expired_and_future() {
        let f = fixture();
        let validator = TransactionValidator::new(&f.registry);

        let old = payment(&f, 100, 1, NOW - 3_600, 60);
        assert!(matches!(
            validator.validate(&old, &f.ledger, &pool_ctx()),
            Err(TransactionError::Expired { .. })
        ));

        let skewed = payment(&f, 100, 1, NOW + 15, 60);
        assert_eq!(validator.validate(&skewed, &f.ledger, &pool_ctx()), Ok(()));

        let future = payment(&f, 100, 1, NOW + 16, 60);
        assert!(matches!(
            validator.validate(&future, &f.ledger, &pool_ctx()),
            Err(TransactionError::FutureTimestamp { .. })
        ));
    }

    #[test]
    fn test_fee_below_minimum() {
        let f = fixture();
        let tx = payment(&f, 100, 0, NOW, 60);
        let validator = TransactionValidator::new(&f.registry);
        assert_eq!(
            validator.validate(&tx, &f.ledger, &pool_ctx()),
            Err(TransactionError::FeeBelowMinimum { fee: 0, minimum: 1 })
        );
    }

    #[test]
    fn test_balance_views_differ() {
        let mut f = fixture();
        f.ledger.reserve_unconfirmed(f.alice.account_id(), 999_950).unwrap();
        let tx = payment(&f, 100, 1, NOW, 60);
        let validator = TransactionValidator::new(&f.registry);

        assert_eq!(
            validator.validate(&tx, &f.ledger, &pool_ctx()),
            Err(TransactionError::InsufficientFunds {
                available: 50,
                required: 101
            })
        );
        let block_ctx = ValidationContext::for_block(NOW, 1, 15);
        assert_eq!(validator.validate(&tx, &f.ledger, &block_ctx), Ok(()));
    }

    #[test]
    fn test_duplicate_of_confirmed() {
        let mut f = fixture();
        let tx = payment(&f, 100, 1, NOW, 60);
        f.ledger.begin_block(1).unwrap();
        f.ledger.apply_transaction(&tx, &f.registry).unwrap();
        f.ledger.end_block().unwrap();

        let validator = TransactionValidator::new(&f.registry);
        assert_eq!(
            validator.validate(&tx, &f.ledger, &pool_ctx()),
            Err(TransactionError::DuplicateId(tx.id()))
        );
    }

    #[test]
    fn test_unknown_version_and_type() {
        let f = fixture();
        let validator = TransactionValidator::new(&f.registry);

        let mut tx = payment(&f, 100, 1, NOW, 60);
        tx.version = 9;
        assert_eq!(
            validator.revalidate(&tx, &f.ledger, &pool_ctx()),
            Err(TransactionError::UnknownVersion(9))
        );

        let mut tx = payment(&f, 100, 1, NOW, 60);
        tx.tx_type = TransactionType { kind: 7, subtype: 1 };
        assert!(matches!(
            validator.revalidate(&tx, &f.ledger, &pool_ctx()),
            Err(TransactionError::UnknownType(_))
        ));
    }

    #[test]
    fn test_forged_bounds_report_signature() {
        let f = fixture();
        let validator = TransactionValidator::new(&f.registry);
        let mut tx = payment(&f, 100, 1, NOW, 60);
        tx.deadline = MAX_DEADLINE_MINUTES + 1;

        assert_eq!(
            validator.validate(&tx, &f.ledger, &pool_ctx()),
            Err(TransactionError::InvalidSignature)
        );
        assert!(matches!(
            validator.revalidate(&tx, &f.ledger, &pool_ctx()),
            Err(TransactionError::Malformed(_))
        ));
    }

    #[test]
    fn test_message_cannot_carry_amount() {
        let f = fixture();
        let tx = TransactionBuilder::new(
            f.alice.public_key(),
            5,
            10,
            60,
            Attachment::ArbitraryMessage { message: b"hi".to_vec() },
        )
        .recipient(f.bob)
        .timestamp(NOW)
        .sign(&f.alice);

        let validator = TransactionValidator::new(&f.registry);
        assert!(matches!(
            validator.validate(&tx, &f.ledger, &pool_ctx()),
            Err(TransactionError::Malformed(_))
        ));
    }
}
