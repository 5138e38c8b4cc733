//! Account ledger: confirmed and unconfirmed balances, effective stake and
//! the per-height journal that lets a block be undone exactly.
//!
//! Confirmed mutations happen only inside an open block (`begin_block` ..
//! `end_block`) and are journaled under that height. Unconfirmed
//! reservations made by the pool are not journaled: the pool releases them
//! before any block is applied or undone.

use crate::attachment::{AttachmentRegistry, TransactionType};
use crate::crypto::{AccountId, PublicKey};
use crate::transaction::{Transaction, TransactionId};
use crate::{ErrorCategory, MAX_BALANCE, ONE_COIN};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Account state as seen by queries and persisted by the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    /// Known once the account has sent a transaction or received a genesis allocation
    pub public_key: Option<PublicKey>,
    /// Confirmed balance in base units
    pub balance: u64,
    /// Confirmed balance minus everything reserved by pooled transactions
    pub unconfirmed_balance: u64,
}

impl Account {
    fn new(id: AccountId) -> Self {
        Self {
            id,
            public_key: None,
            balance: 0,
            unconfirmed_balance: 0,
        }
    }
}

/// Net effect of one block on one account, persisted keyed by height
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountDelta {
    pub account: AccountId,
    /// Public key first announced at this height
    pub public_key: Option<PublicKey>,
    /// Signed change of the confirmed balance
    pub balance: i64,
    /// The account did not exist before this height
    pub created: bool,
}

/// Ordered record of confirmed balance changes, drained by observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerChange {
    pub height: u32,
    pub account: AccountId,
    pub balance_delta: i64,
}

/// State of a poll created by a poll-creation transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Poll {
    pub id: TransactionId,
    pub creator: AccountId,
    pub name: String,
    pub description: String,
    pub options: Vec<String>,
    pub finish_height: u32,
    pub min_number_of_options: u8,
    pub max_number_of_options: u8,
    pub min_range_value: i8,
    pub max_range_value: i8,
    /// Sum of the values cast for each option
    pub tallies: Vec<i64>,
    pub voters: u32,
}

#[derive(Debug, Clone)]
enum JournalEntry {
    Created(AccountId),
    Balance { account: AccountId, delta: i64 },
    PublicKey(AccountId),
    Attachment(Box<Transaction>),
    Confirmed(TransactionId),
}

#[derive(Debug, Clone)]
struct AccountState {
    account: Account,
    /// (height, confirmed balance at the end of that height), ascending
    history: Vec<(u32, u64)>,
}

impl AccountState {
    fn balance_at(&self, height: u32) -> u64 {
        match self.history.partition_point(|&(h, _)| h <= height) {
            0 => 0,
            idx => self.history[idx - 1].1,
        }
    }

    fn record(&mut self, height: u32) {
        let balance = self.account.balance;
        match self.history.last_mut() {
            Some(last) if last.0 == height => last.1 = balance,
            _ => self.history.push((height, balance)),
        }
    }

    fn trim(&mut self, cutoff: u32) {
        // keep the newest entry below the cutoff, it defines the balance at the cutoff
        let below = self.history.partition_point(|&(h, _)| h < cutoff);
        if below > 1 {
            self.history.drain(..below - 1);
        }
    }
}

/// The account table plus every other piece of state transactions mutate
#[derive(Debug, Clone)]
pub struct Ledger {
    accounts: HashMap<AccountId, AccountState>,
    polls: HashMap<TransactionId, Poll>,
    votes: HashSet<(TransactionId, AccountId)>,
    /// confirming height and expiration of each included transaction
    confirmed: HashMap<TransactionId, (u32, u32)>,
    journal: BTreeMap<u32, Vec<JournalEntry>>,
    open_height: Option<u32>,
    last_height: Option<u32>,
    changes: Vec<LedgerChange>,
    stake_confirmations: u32,
    history_retention: u32,
}

impl Ledger {
    /// Empty ledger.
    ///
    /// `stake_confirmations` is the effective-stake window, `history_retention`
    /// how many heights of journal and balance history beyond that window are
    /// kept for undo (the maximum reorganization depth).
    pub fn new(stake_confirmations: u32, history_retention: u32) -> Self {
        Self {
            accounts: HashMap::new(),
            polls: HashMap::new(),
            votes: HashSet::new(),
            confirmed: HashMap::new(),
            journal: BTreeMap::new(),
            open_height: None,
            last_height: None,
            changes: Vec::new(),
            stake_confirmations,
            history_retention,
        }
    }

    /// Last fully applied height
    pub fn height(&self) -> Option<u32> {
        self.last_height
    }

    pub fn account(&self, id: AccountId) -> Option<&Account> {
        self.accounts.get(&id).map(|state| &state.account)
    }

    pub fn accounts(&self) -> impl Iterator<Item = &Account> {
        self.accounts.values().map(|state| &state.account)
    }

    pub fn balance(&self, id: AccountId) -> u64 {
        self.account(id).map(|a| a.balance).unwrap_or(0)
    }

    pub fn unconfirmed_balance(&self, id: AccountId) -> u64 {
        self.account(id).map(|a| a.unconfirmed_balance).unwrap_or(0)
    }

    /// Opens the block at `height`, which must directly follow the last applied one
    pub fn begin_block(&mut self, height: u32) -> Result<(), LedgerError> {
        let expected = self.last_height.map_or(0, |h| h + 1);
        if self.open_height.is_some() || height != expected {
            return Err(LedgerError::HeightOutOfOrder { expected, got: height });
        }
        self.open_height = Some(height);
        self.journal.insert(height, Vec::new());
        Ok(())
    }

    /// Seals the open block
    pub fn end_block(&mut self) -> Result<(), LedgerError> {
        let height = self.open_height.take().ok_or(LedgerError::NoOpenBlock)?;
        self.last_height = Some(height);

        let cutoff = height.saturating_sub(self.stake_confirmations.saturating_add(self.history_retention));
        if cutoff > 0 {
            let touched: Vec<AccountId> = self.journal_accounts(height);
            for id in touched {
                if let Some(state) = self.accounts.get_mut(&id) {
                    state.trim(cutoff);
                }
            }
        }
        let journal_cutoff = height.saturating_sub(self.history_retention);
        self.journal = self.journal.split_off(&journal_cutoff);
        Ok(())
    }

    fn journal_accounts(&self, height: u32) -> Vec<AccountId> {
        let mut ids: Vec<AccountId> = self
            .journal
            .get(&height)
            .into_iter()
            .flatten()
            .filter_map(|entry| match entry {
                JournalEntry::Balance { account, .. } => Some(*account),
                _ => None,
            })
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    fn journal_push(&mut self, entry: JournalEntry) -> Result<u32, LedgerError> {
        let height = self.open_height.ok_or(LedgerError::NoOpenBlock)?;
        self.journal.entry(height).or_default().push(entry);
        Ok(height)
    }

    fn ensure_account(&mut self, id: AccountId) -> Result<(), LedgerError> {
        if !self.accounts.contains_key(&id) {
            self.journal_push(JournalEntry::Created(id))?;
            self.accounts.insert(
                id,
                AccountState {
                    account: Account::new(id),
                    history: Vec::new(),
                },
            );
        }
        Ok(())
    }

    /// Adds to both confirmed and unconfirmed balance
    pub fn credit(&mut self, id: AccountId, amount: u64) -> Result<(), LedgerError> {
        if amount == 0 {
            return Ok(());
        }
        let delta = i64::try_from(amount).map_err(|_| LedgerError::Overflow(id))?;
        self.ensure_account(id)?;
        self.adjust(id, delta)
    }

    /// Removes from both confirmed and unconfirmed balance.
    ///
    /// Fails with `InsufficientFunds` when the confirmed balance is short.
    pub fn debit(&mut self, id: AccountId, amount: u64) -> Result<(), LedgerError> {
        if amount == 0 {
            return Ok(());
        }
        let available = self.balance(id);
        if available < amount {
            return Err(LedgerError::InsufficientFunds {
                account: id,
                available,
                required: amount,
            });
        }
        let delta = i64::try_from(amount).map_err(|_| LedgerError::Overflow(id))?;
        self.adjust(id, -delta)
    }

    fn adjust(&mut self, id: AccountId, delta: i64) -> Result<(), LedgerError> {
        let height = self.open_height.ok_or(LedgerError::NoOpenBlock)?;
        self.apply_delta(id, delta)?;
        if let Some(state) = self.accounts.get_mut(&id) {
            state.record(height);
        }
        self.journal_push(JournalEntry::Balance { account: id, delta })?;
        self.changes.push(LedgerChange {
            height,
            account: id,
            balance_delta: delta,
        });
        Ok(())
    }

    fn apply_delta(&mut self, id: AccountId, delta: i64) -> Result<(), LedgerError> {
        let state = self.accounts.get_mut(&id).ok_or(LedgerError::UnknownAccount(id))?;
        let account = &mut state.account;
        let magnitude = delta.unsigned_abs();
        if delta >= 0 {
            let balance = account.balance.checked_add(magnitude).filter(|b| *b <= MAX_BALANCE);
            let unconfirmed = account.unconfirmed_balance.checked_add(magnitude);
            match (balance, unconfirmed) {
                (Some(b), Some(u)) => {
                    account.balance = b;
                    account.unconfirmed_balance = u;
                }
                _ => return Err(LedgerError::Overflow(id)),
            }
        } else {
            let balance = account.balance.checked_sub(magnitude);
            let unconfirmed = account.unconfirmed_balance.checked_sub(magnitude);
            match (balance, unconfirmed) {
                (Some(b), Some(u)) => {
                    account.balance = b;
                    account.unconfirmed_balance = u;
                }
                _ => return Err(LedgerError::NegativeBalance(id)),
            }
        }
        Ok(())
    }

    /// Reserves `amount` of the unconfirmed balance for a pooled transaction
    pub fn reserve_unconfirmed(&mut self, id: AccountId, amount: u64) -> Result<(), LedgerError> {
        let available = self.unconfirmed_balance(id);
        if available < amount {
            return Err(LedgerError::InsufficientFunds {
                account: id,
                available,
                required: amount,
            });
        }
        if let Some(state) = self.accounts.get_mut(&id) {
            state.account.unconfirmed_balance -= amount;
        }
        Ok(())
    }

    /// Returns a reservation made by [`Ledger::reserve_unconfirmed`]
    pub fn release_unconfirmed(&mut self, id: AccountId, amount: u64) -> Result<(), LedgerError> {
        let state = self.accounts.get_mut(&id).ok_or(LedgerError::UnknownAccount(id))?;
        let released = state
            .account
            .unconfirmed_balance
            .checked_add(amount)
            .filter(|u| *u <= state.account.balance)
            .ok_or(LedgerError::UnconfirmedExceedsConfirmed(id))?;
        state.account.unconfirmed_balance = released;
        Ok(())
    }

    /// Records the public key of an account the first time it is seen
    pub fn register_public_key(&mut self, key: &PublicKey) -> Result<(), LedgerError> {
        let id = key.account_id();
        self.ensure_account(id)?;
        let state = self.accounts.get_mut(&id).ok_or(LedgerError::UnknownAccount(id))?;
        match state.account.public_key {
            Some(existing) if existing == *key => Ok(()),
            Some(_) => Err(LedgerError::PublicKeyMismatch(id)),
            None => {
                state.account.public_key = Some(*key);
                self.journal_push(JournalEntry::PublicKey(id))?;
                Ok(())
            }
        }
    }

    /// Stake eligible for forging: the smallest confirmed balance held at the
    /// end of every height in `[at_height - stake_confirmations, at_height]`,
    /// in whole coins.
    pub fn effective_stake(&self, id: AccountId, at_height: u32) -> u64 {
        let Some(state) = self.accounts.get(&id) else {
            return 0;
        };
        let window_start = at_height.saturating_sub(self.stake_confirmations);
        let mut minimum = state.balance_at(window_start);
        for &(height, balance) in &state.history {
            if height > window_start && height <= at_height {
                minimum = minimum.min(balance);
            }
        }
        minimum / ONE_COIN
    }

    /// Marks a transaction as included in the open block
    fn mark_confirmed(&mut self, id: TransactionId, expiration: u32) -> Result<(), LedgerError> {
        let height = self.journal_push(JournalEntry::Confirmed(id))?;
        self.confirmed.insert(id, (height, expiration));
        Ok(())
    }

    pub fn is_confirmed(&self, id: TransactionId) -> bool {
        self.confirmed.contains_key(&id)
    }

    /// Height of the block that confirmed the transaction
    pub fn confirmation_height(&self, id: TransactionId) -> Option<u32> {
        self.confirmed.get(&id).map(|&(height, _)| height)
    }

    /// Drops confirmed ids below `height` that expired at or before
    /// `timestamp`. Once no block can be applied earlier than `timestamp`,
    /// such a transaction fails the expiry rule before the duplicate one.
    pub fn forget_confirmed(&mut self, height: u32, timestamp: u32) -> usize {
        let before = self.confirmed.len();
        self.confirmed
            .retain(|_, &mut (confirmed_at, expiration)| confirmed_at >= height || expiration > timestamp);
        before - self.confirmed.len()
    }

    /// Applies a validated transaction to the open block: the sender pays
    /// amount and fee, the recipient receives the amount, then the
    /// attachment handler runs. The fee is credited to the generator by the
    /// caller once per block.
    pub fn apply_transaction(&mut self, tx: &Transaction, registry: &AttachmentRegistry) -> Result<(), LedgerError> {
        let height = self.open_height.ok_or(LedgerError::NoOpenBlock)?;
        let handler = registry
            .get(tx.tx_type)
            .ok_or(LedgerError::UnknownTransactionType(tx.tx_type))?;
        let sender = tx.sender_id();
        let total = tx.amount.checked_add(tx.fee).ok_or(LedgerError::Overflow(sender))?;

        self.register_public_key(&tx.sender_public_key)?;
        self.debit(sender, total)?;
        if let Some(recipient) = tx.recipient {
            self.credit(recipient, tx.amount)?;
        }
        handler.apply_attachment(tx, self, height)?;
        self.journal_push(JournalEntry::Attachment(Box::new(tx.clone())))?;
        self.mark_confirmed(tx.id(), tx.expiration())
    }

    pub fn poll(&self, id: TransactionId) -> Option<&Poll> {
        self.polls.get(&id)
    }

    pub fn insert_poll(&mut self, poll: Poll) {
        self.polls.insert(poll.id, poll);
    }

    pub fn remove_poll(&mut self, id: TransactionId) -> Option<Poll> {
        self.polls.remove(&id)
    }

    pub fn has_voted(&self, poll: TransactionId, voter: AccountId) -> bool {
        self.votes.contains(&(poll, voter))
    }

    /// Adds (`sign = 1`) or removes (`sign = -1`) a vote
    pub fn record_vote(
        &mut self,
        poll_id: TransactionId,
        voter: AccountId,
        votes: &[i8],
        sign: i64,
    ) -> Result<(), LedgerError> {
        let poll = self.polls.get_mut(&poll_id).ok_or(LedgerError::UnknownPoll(poll_id))?;
        for (tally, &value) in poll.tallies.iter_mut().zip(votes) {
            *tally += sign * i64::from(value);
        }
        if sign > 0 {
            poll.voters += 1;
            self.votes.insert((poll_id, voter));
        } else {
            poll.voters = poll.voters.saturating_sub(1);
            self.votes.remove(&(poll_id, voter));
        }
        Ok(())
    }

    /// Reverses every effect of the last applied block
    pub fn undo(&mut self, height: u32, registry: &AttachmentRegistry) -> Result<(), LedgerError> {
        if self.open_height.is_some() || self.last_height != Some(height) {
            return Err(LedgerError::UndoOutOfOrder {
                requested: height,
                last: self.last_height,
            });
        }
        let entries = self
            .journal
            .remove(&height)
            .ok_or(LedgerError::UndoOutOfOrder {
                requested: height,
                last: self.last_height,
            })?;
        self.revert(height, entries, registry)?;
        self.last_height = height.checked_sub(1);
        Ok(())
    }

    /// Reverses a block that failed halfway through application
    pub fn abort_block(&mut self, registry: &AttachmentRegistry) -> Result<(), LedgerError> {
        let height = self.open_height.take().ok_or(LedgerError::NoOpenBlock)?;
        let entries = self.journal.remove(&height).unwrap_or_default();
        self.revert(height, entries, registry)
    }

    fn revert(&mut self, height: u32, entries: Vec<JournalEntry>, registry: &AttachmentRegistry) -> Result<(), LedgerError> {
        for entry in entries.into_iter().rev() {
            match entry {
                JournalEntry::Created(id) => {
                    self.accounts.remove(&id);
                }
                JournalEntry::Balance { account, delta } => {
                    let reverse = delta.checked_neg().ok_or(LedgerError::Overflow(account))?;
                    self.apply_delta(account, reverse)?;
                    if let Some(state) = self.accounts.get_mut(&account) {
                        let keep = state.history.partition_point(|&(h, _)| h < height);
                        state.history.truncate(keep);
                    }
                    self.changes.push(LedgerChange {
                        height,
                        account,
                        balance_delta: reverse,
                    });
                }
                JournalEntry::PublicKey(id) => {
                    if let Some(state) = self.accounts.get_mut(&id) {
                        state.account.public_key = None;
                    }
                }
                JournalEntry::Attachment(tx) => {
                    let handler = registry
                        .get(tx.tx_type)
                        .ok_or(LedgerError::UnknownTransactionType(tx.tx_type))?;
                    handler.undo_attachment(&tx, self)?;
                }
                JournalEntry::Confirmed(id) => {
                    self.confirmed.remove(&id);
                }
            }
        }
        Ok(())
    }

    /// Per-account net effect of the block at `height`, for persistence
    pub fn deltas(&self, height: u32) -> Vec<AccountDelta> {
        let mut deltas: BTreeMap<AccountId, AccountDelta> = BTreeMap::new();
        let blank = |account| AccountDelta {
            account,
            public_key: None,
            balance: 0,
            created: false,
        };
        for entry in self.journal.get(&height).into_iter().flatten() {
            match entry {
                JournalEntry::Created(id) => deltas.entry(*id).or_insert_with(|| blank(*id)).created = true,
                JournalEntry::Balance { account, delta } => {
                    deltas.entry(*account).or_insert_with(|| blank(*account)).balance += delta
                }
                JournalEntry::PublicKey(id) => {
                    let key = self.account(*id).and_then(|a| a.public_key);
                    deltas.entry(*id).or_insert_with(|| blank(*id)).public_key = key;
                }
                JournalEntry::Attachment(_) | JournalEntry::Confirmed(_) => {}
            }
        }
        deltas.into_values().collect()
    }

    /// Drains the ordered record of balance changes
    pub fn take_changes(&mut self) -> Vec<LedgerChange> {
        std::mem::take(&mut self.changes)
    }

    /// Balance changes recorded since the last drain
    pub fn pending_changes(&self) -> &[LedgerChange] {
        &self.changes
    }

    /// Sum of all confirmed balances
    pub fn total_balance(&self) -> u128 {
        self.accounts.values().map(|s| u128::from(s.account.balance)).sum()
    }
}

/// Account ledger errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("Insufficient funds in {account}: {available} available, {required} required")]
    InsufficientFunds { account: AccountId, available: u64, required: u64 },

    #[error("Balance overflow in {0}")]
    Overflow(AccountId),

    #[error("Unknown account {0}")]
    UnknownAccount(AccountId),

    #[error("Block height out of order: expected {expected}, got {got}")]
    HeightOutOfOrder { expected: u32, got: u32 },

    #[error("No block is open")]
    NoOpenBlock,

    #[error("Cannot undo height {requested}, last applied is {last:?}")]
    UndoOutOfOrder { requested: u32, last: Option<u32> },

    #[error("Balance of {0} would become negative")]
    NegativeBalance(AccountId),

    #[error("Unconfirmed balance of {0} would exceed its confirmed balance")]
    UnconfirmedExceedsConfirmed(AccountId),

    #[error("Public key does not match account {0}")]
    PublicKeyMismatch(AccountId),

    #[error("Unknown poll {0}")]
    UnknownPoll(TransactionId),

    #[error("Attachment does not match type of transaction {0}")]
    AttachmentMismatch(TransactionId),

    #[error("No handler for transaction type {0}")]
    UnknownTransactionType(TransactionType),
}

impl LedgerError {
    /// Errors that can only come from a bug in the consensus rules
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            LedgerError::NegativeBalance(_)
                | LedgerError::UnconfirmedExceedsConfirmed(_)
                | LedgerError::Overflow(_)
                | LedgerError::UndoOutOfOrder { .. }
                | LedgerError::HeightOutOfOrder { .. }
                | LedgerError::NoOpenBlock
        )
    }

    pub fn category(&self) -> ErrorCategory {
        if self.is_invariant_violation() {
            ErrorCategory::InternalInvariant
        } else {
            ErrorCategory::Validation
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(n: u64) -> AccountId {
        AccountId(n)
    }

    fn funded_ledger() -> Ledger {
        let mut ledger = Ledger::new(10, 5);
        ledger.begin_block(0).unwrap();
        ledger.credit(account(1), 1_000_000).unwrap();
        ledger.end_block().unwrap();
        ledger
    }

    #[test]
    fn test_credit_and_debit() {
        let mut ledger = funded_ledger();
        ledger.begin_block(1).unwrap();
        ledger.debit(account(1), 101).unwrap();
        ledger.credit(account(2), 100).unwrap();
        ledger.end_block().unwrap();

        assert_eq!(ledger.balance(account(1)), 999_899);
        assert_eq!(ledger.balance(account(2)), 100);
        assert_eq!(ledger.unconfirmed_balance(account(2)), 100);
    }

    #[test]
    fn test_debit_insufficient_funds() {
        let mut ledger = funded_ledger();
        ledger.begin_block(1).unwrap();
        let err = ledger.debit(account(1), 1_000_001).unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds { required: 1_000_001, .. }));
        assert!(!err.is_invariant_violation());
    }

    #[test]
    fn test_mutation_outside_block_rejected() {
        let mut ledger = funded_ledger();
        assert_eq!(ledger.credit(account(1), 5), Err(LedgerError::NoOpenBlock));
    }

    #[test]
    fn test_reserve_and_release() {
        let mut ledger = funded_ledger();
        ledger.reserve_unconfirmed(account(1), 600_000).unwrap();
        assert_eq!(ledger.unconfirmed_balance(account(1)), 400_000);
        assert!(ledger.reserve_unconfirmed(account(1), 400_001).is_err());

        ledger.release_unconfirmed(account(1), 600_000).unwrap();
        assert_eq!(ledger.unconfirmed_balance(account(1)), 1_000_000);
        assert_eq!(
            ledger.release_unconfirmed(account(1), 1),
            Err(LedgerError::UnconfirmedExceedsConfirmed(account(1)))
        );
    }

    #[test]
    fn test_undo_restores_previous_state() {
        let mut ledger = funded_ledger();
        let before: Vec<Account> = {
            let mut v: Vec<Account> = ledger.accounts().cloned().collect();
            v.sort_by_key(|a| a.id);
            v
        };

        ledger.begin_block(1).unwrap();
        ledger.debit(account(1), 500).unwrap();
        ledger.credit(account(3), 499).unwrap();
        ledger.credit(account(4), 1).unwrap();
        ledger.mark_confirmed(TransactionId(9), 3_600).unwrap();
        ledger.end_block().unwrap();
        assert!(ledger.is_confirmed(TransactionId(9)));
        assert_eq!(ledger.confirmation_height(TransactionId(9)), Some(1));

        let registry = AttachmentRegistry::standard();
        ledger.undo(1, &registry).unwrap();

        let mut after: Vec<Account> = ledger.accounts().cloned().collect();
        after.sort_by_key(|a| a.id);
        assert_eq!(before, after);
        assert!(!ledger.is_confirmed(TransactionId(9)));
        assert_eq!(ledger.height(), Some(0));
    }

    #[test]
    fn test_undo_must_target_last_height() {
        let mut ledger = funded_ledger();
        ledger.begin_block(1).unwrap();
        ledger.end_block().unwrap();

        let registry = AttachmentRegistry::standard();
        assert!(matches!(
            ledger.undo(0, &registry),
            Err(LedgerError::UndoOutOfOrder { requested: 0, last: Some(1) })
        ));
    }

    #[test]
    fn test_abort_block_discards_partial_application() {
        let mut ledger = funded_ledger();
        ledger.begin_block(1).unwrap();
        ledger.debit(account(1), 10).unwrap();
        ledger.credit(account(5), 10).unwrap();

        let registry = AttachmentRegistry::standard();
        ledger.abort_block(&registry).unwrap();

        assert_eq!(ledger.balance(account(1)), 1_000_000);
        assert!(ledger.account(account(5)).is_none());
        assert_eq!(ledger.height(), Some(0));
        ledger.begin_block(1).unwrap();
    }

    #[test]
    fn test_effective_stake_lags_balance_increases() {
        let mut ledger = Ledger::new(3, 10);
        ledger.begin_block(0).unwrap();
        ledger.credit(account(1), 10 * ONE_COIN).unwrap();
        ledger.end_block().unwrap();

        ledger.begin_block(1).unwrap();
        ledger.credit(account(1), 90 * ONE_COIN).unwrap();
        ledger.end_block().unwrap();

        for height in 2..=5 {
            ledger.begin_block(height).unwrap();
            ledger.end_block().unwrap();
        }

        // window [0, 3] still contains height 0 with 10 coins
        assert_eq!(ledger.effective_stake(account(1), 3), 10);
        // window [1, 4] only sees the full balance
        assert_eq!(ledger.effective_stake(account(1), 4), 100);
    }

    #[test]
    fn test_effective_stake_drops_immediately_on_spend() {
        let mut ledger = Ledger::new(3, 10);
        ledger.begin_block(0).unwrap();
        ledger.credit(account(1), 100 * ONE_COIN).unwrap();
        ledger.end_block().unwrap();

        ledger.begin_block(1).unwrap();
        ledger.debit(account(1), 60 * ONE_COIN).unwrap();
        ledger.end_block().unwrap();

        assert_eq!(ledger.effective_stake(account(1), 1), 40);
        assert_eq!(ledger.effective_stake(account(9), 1), 0);
    }

    #[test]
    fn test_deltas_are_aggregated_per_account() {
        let mut ledger = funded_ledger();
        ledger.begin_block(1).unwrap();
        ledger.debit(account(1), 10).unwrap();
        ledger.debit(account(1), 5).unwrap();
        ledger.credit(account(2), 15).unwrap();
        ledger.end_block().unwrap();

        let deltas = ledger.deltas(1);
        assert_eq!(deltas.len(), 2);
        assert_eq!(deltas[0].account, account(1));
        assert_eq!(deltas[0].balance, -15);
        assert!(!deltas[0].created);
        assert_eq!(deltas[1].balance, 15);
        assert!(deltas[1].created);
    }

    #[test]
    fn test_change_record_is_ordered() {
        let mut ledger = funded_ledger();
        let genesis_changes = ledger.take_changes();
        assert_eq!(genesis_changes.len(), 1);

        ledger.begin_block(1).unwrap();
        ledger.debit(account(1), 7).unwrap();
        ledger.credit(account(2), 7).unwrap();
        ledger.end_block().unwrap();

        let changes = ledger.take_changes();
        assert_eq!(changes[0].balance_delta, -7);
        assert_eq!(changes[1].account, account(2));
        assert!(ledger.take_changes().is_empty());
        assert!(ledger.pending_changes().is_empty());
    }

    #[test]
    fn test_forget_confirmed_keeps_recent_and_live_ids() {
        let mut ledger = funded_ledger();
        ledger.begin_block(1).unwrap();
        ledger.mark_confirmed(TransactionId(1), 100).unwrap();
        ledger.mark_confirmed(TransactionId(2), 900).unwrap();
        ledger.end_block().unwrap();
        ledger.begin_block(2).unwrap();
        ledger.mark_confirmed(TransactionId(3), 100).unwrap();
        ledger.end_block().unwrap();

        assert_eq!(ledger.forget_confirmed(2, 500), 1);
        assert!(!ledger.is_confirmed(TransactionId(1)));
        // not expired yet
        assert!(ledger.is_confirmed(TransactionId(2)));
        // still within undo reach
        assert!(ledger.is_confirmed(TransactionId(3)));
        assert_eq!(ledger.forget_confirmed(2, 500), 0);
    }
}
