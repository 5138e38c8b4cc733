//! Unconfirmed transaction pool
//!
//! Every pooled transaction holds a reservation of `amount + fee` against
//! its sender's unconfirmed balance, so for each account
//! `unconfirmed = confirmed - reserved`. Before a block is applied or undone
//! the pool is suspended (all reservations returned to the ledger) and
//! resumed afterwards, re-admitting whatever is still valid.
//!
//! The pool has no lock of its own: it lives inside the chain state and
//! every mutation runs under the chain write lock, which serializes
//! admission for all accounts.

use horizon_core::{
    AccountId, Ledger, LedgerError, Transaction, TransactionError, TransactionId, TransactionValidator,
    ValidationContext,
};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

/// Forging preference: fee per byte descending, then arrival order
#[derive(Debug, Clone, Copy)]
struct Priority {
    fee: u64,
    size: u64,
    arrival: u64,
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> Ordering {
        // fee/size compared by cross multiplication, exact for any u64 pair
        let lhs = u128::from(other.fee) * u128::from(self.size);
        let rhs = u128::from(self.fee) * u128::from(other.size);
        lhs.cmp(&rhs).then(self.arrival.cmp(&other.arrival))
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Priority {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Priority {}

#[derive(Debug, Clone)]
struct PooledTransaction {
    tx: Transaction,
    sender: AccountId,
    /// Amount plus fee, reserved from the sender
    cost: u64,
    priority: Priority,
}

/// Result of a successful submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Admitted; a lower-priority transaction may have been evicted to make room
    Added { evicted: Option<TransactionId> },
    /// The identical transaction was already pooled, nothing changed
    AlreadyPooled,
}

/// What happened to transactions popped off the canonical chain
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReinstateReport {
    pub reinstated: Vec<TransactionId>,
    pub discarded: Vec<(TransactionId, TransactionError)>,
}

/// Pool of transactions waiting for a block
#[derive(Debug)]
pub struct UnconfirmedPool {
    entries: HashMap<TransactionId, PooledTransaction>,
    order: BTreeMap<Priority, TransactionId>,
    reserved: HashMap<AccountId, u64>,
    next_arrival: u64,
    max_transactions: usize,
    suspended: bool,
}

impl UnconfirmedPool {
    pub fn new(max_transactions: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            reserved: HashMap::new(),
            next_arrival: 0,
            max_transactions,
            suspended: false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: TransactionId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn get(&self, id: TransactionId) -> Option<&Transaction> {
        self.entries.get(&id).map(|entry| &entry.tx)
    }

    /// Sum of `amount + fee` over the pooled transactions sent by `account`
    pub fn reserved_by(&self, account: AccountId) -> u64 {
        self.reserved.get(&account).copied().unwrap_or(0)
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Pooled transactions, highest forging priority first
    pub fn by_priority(&self) -> impl Iterator<Item = &Transaction> {
        self.order
            .values()
            .filter_map(|id| self.entries.get(id))
            .map(|entry| &entry.tx)
    }

    /// Validates `tx` against the unconfirmed balance view, reserves its
    /// cost and inserts it
    pub fn submit(
        &mut self,
        tx: Transaction,
        ledger: &mut Ledger,
        validator: &TransactionValidator<'_>,
        ctx: &ValidationContext,
    ) -> Result<SubmitOutcome, TransactionError> {
        let id = tx.id();
        if self.entries.contains_key(&id) {
            return Ok(SubmitOutcome::AlreadyPooled);
        }
        validator.validate(&tx, ledger, ctx)?;
        let evicted = self.admit(id, tx, ledger)?;
        Ok(SubmitOutcome::Added { evicted })
    }

    /// Inserts an already validated transaction, evicting the lowest
    /// priority entry if the pool is full and `tx` outranks it
    fn admit(
        &mut self,
        id: TransactionId,
        tx: Transaction,
        ledger: &mut Ledger,
    ) -> Result<Option<TransactionId>, TransactionError> {
        let priority = Priority {
            fee: tx.fee,
            size: tx.size().max(1) as u64,
            arrival: self.next_arrival,
        };

        let mut victim = None;
        if self.entries.len() >= self.max_transactions {
            match self.order.iter().next_back() {
                Some((lowest, lowest_id)) if priority < *lowest => victim = Some(*lowest_id),
                _ => return Err(TransactionError::PoolFull),
            }
        }

        let sender = tx.sender_id();
        let cost = tx
            .total_cost()
            .ok_or_else(|| TransactionError::Malformed("amount plus fee overflows".to_string()))?;
        ledger.reserve_unconfirmed(sender, cost)?;

        if let Some(victim) = victim {
            self.remove(victim, ledger)?;
            log::debug!("Evicted transaction {} to admit {}", victim, id);
        }

        self.next_arrival += 1;
        *self.reserved.entry(sender).or_insert(0) += cost;
        self.order.insert(priority, id);
        self.entries.insert(
            id,
            PooledTransaction {
                tx,
                sender,
                cost,
                priority,
            },
        );
        Ok(victim)
    }

    /// Removes an entry and returns its reservation to the ledger
    fn remove(&mut self, id: TransactionId, ledger: &mut Ledger) -> Result<Option<Transaction>, LedgerError> {
        let Some(entry) = self.detach(id) else {
            return Ok(None);
        };
        if !self.suspended {
            ledger.release_unconfirmed(entry.sender, entry.cost)?;
        }
        Ok(Some(entry.tx))
    }

    /// Removes an entry and its bookkeeping without touching the ledger
    fn detach(&mut self, id: TransactionId) -> Option<PooledTransaction> {
        let entry = self.entries.remove(&id)?;
        self.order.remove(&entry.priority);
        if !self.suspended {
            if let Some(reserved) = self.reserved.get_mut(&entry.sender) {
                *reserved -= entry.cost;
                if *reserved == 0 {
                    self.reserved.remove(&entry.sender);
                }
            }
        }
        Some(entry)
    }

    /// Drops every transaction whose deadline has passed at `now` and
    /// releases its reservation
    pub fn expire(&mut self, now: u32, ledger: &mut Ledger) -> Result<Vec<Transaction>, LedgerError> {
        let expired: Vec<TransactionId> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.tx.is_expired(now))
            .map(|(id, _)| *id)
            .collect();

        let mut removed = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some(tx) = self.remove(id, ledger)? {
                removed.push(tx);
            }
        }
        if !removed.is_empty() {
            log::debug!("Expired {} unconfirmed transactions", removed.len());
        }
        Ok(removed)
    }

    /// Forgets transactions a block just confirmed. Their reservation is not
    /// released: the pool is suspended while blocks are applied, so the
    /// confirmed debit already covers them.
    pub fn remove_confirmed(&mut self, ids: &[TransactionId]) -> usize {
        ids.iter().filter(|id| self.detach(**id).is_some()).count()
    }

    /// Returns every reservation to the ledger, leaving
    /// `unconfirmed == confirmed` for all senders
    pub fn suspend(&mut self, ledger: &mut Ledger) -> Result<(), LedgerError> {
        if self.suspended {
            return Ok(());
        }
        for (account, amount) in self.reserved.drain() {
            ledger.release_unconfirmed(account, amount)?;
        }
        self.suspended = true;
        Ok(())
    }

    /// Re-admits the suspended entries in arrival order against the current
    /// ledger. Entries that no longer validate are dropped and returned.
    pub fn resume(
        &mut self,
        ledger: &mut Ledger,
        validator: &TransactionValidator<'_>,
        ctx: &ValidationContext,
    ) -> Vec<(Transaction, TransactionError)> {
        if !self.suspended {
            return Vec::new();
        }
        self.suspended = false;

        let mut pending: Vec<PooledTransaction> = self.entries.drain().map(|(_, entry)| entry).collect();
        pending.sort_by_key(|entry| entry.priority.arrival);
        self.order.clear();
        self.reserved.clear();

        let mut dropped = Vec::new();
        for entry in pending {
            let admitted = validator
                .revalidate(&entry.tx, ledger, ctx)
                .and_then(|()| ledger.reserve_unconfirmed(entry.sender, entry.cost).map_err(Into::into));
            match admitted {
                Ok(()) => {
                    *self.reserved.entry(entry.sender).or_insert(0) += entry.cost;
                    self.order.insert(entry.priority, entry.tx.id());
                    self.entries.insert(entry.tx.id(), entry);
                }
                Err(err) => dropped.push((entry.tx, err)),
            }
        }
        for (tx, err) in &dropped {
            log::debug!("Dropped pooled transaction {}: {}", tx.id(), err);
        }
        dropped
    }

    /// Re-validates transactions popped off the canonical chain and
    /// re-admits those still valid. The rest are reported, never silently
    /// resurrected.
    pub fn reinstate_after_reorg(
        &mut self,
        transactions: Vec<Transaction>,
        ledger: &mut Ledger,
        validator: &TransactionValidator<'_>,
        ctx: &ValidationContext,
    ) -> ReinstateReport {
        let mut report = ReinstateReport::default();
        for tx in transactions {
            let id = tx.id();
            if self.entries.contains_key(&id) {
                continue;
            }
            let admitted = validator
                .revalidate(&tx, ledger, ctx)
                .and_then(|()| self.admit(id, tx, ledger).map(|_| ()));
            match admitted {
                Ok(()) => report.reinstated.push(id),
                Err(err) => {
                    log::info!("Discarded transaction {} after reorganization: {}", id, err);
                    report.discarded.push((id, err));
                }
            }
        }
        report
    }

    /// Whether every sender's unconfirmed balance equals its confirmed
    /// balance minus its pooled reservations
    pub fn reservations_consistent(&self, ledger: &Ledger) -> bool {
        if self.suspended {
            return ledger.accounts().all(|a| a.unconfirmed_balance == a.balance);
        }
        ledger.accounts().all(|account| {
            account.balance.checked_sub(self.reserved_by(account.id)) == Some(account.unconfirmed_balance)
        })
    }
}
