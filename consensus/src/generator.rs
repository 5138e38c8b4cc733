//! Block forging for locally controlled accounts
//!
//! Each forging account holds a lottery ticket for the block after the
//! current tip. Once the earliest ticket wins, the generator assembles a
//! block from the pool and hands it to [`Blockchain::process_block`], the
//! same path peer blocks take.

use crate::chain::{BlockOutcome, Blockchain};
use crate::error::BlockError;
use horizon_core::forging::LotteryTicket;
use horizon_core::{AccountId, Block, CryptoError, KeyPair};
use std::collections::BTreeMap;

/// A block produced by this node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForgedBlock {
    pub block: Block,
    pub generator: AccountId,
    pub outcome: BlockOutcome,
}

/// Forging accounts and their signing keys
#[derive(Debug, Default)]
pub struct Generator {
    accounts: BTreeMap<AccountId, KeyPair>,
}

impl Generator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts forging for the account controlled by `secret_phrase`
    pub fn start_forging(&mut self, secret_phrase: &str) -> Result<AccountId, CryptoError> {
        let keys = KeyPair::from_secret_phrase(secret_phrase)?;
        let id = keys.account_id();
        if self.accounts.insert(id, keys).is_none() {
            log::info!("Started forging for account {}", id);
        }
        Ok(id)
    }

    /// Returns `false` if the account was not forging
    pub fn stop_forging(&mut self, id: AccountId) -> bool {
        let removed = self.accounts.remove(&id).is_some();
        if removed {
            log::info!("Stopped forging for account {}", id);
        }
        removed
    }

    pub fn is_forging(&self, id: AccountId) -> bool {
        self.accounts.contains_key(&id)
    }

    pub fn accounts(&self) -> impl Iterator<Item = AccountId> + '_ {
        self.accounts.keys().copied()
    }

    /// Ticket of a forging account for the block after the tip
    pub fn ticket(&self, chain: &Blockchain, id: AccountId) -> Option<LotteryTicket> {
        let keys = self.accounts.get(&id)?;
        Some(LotteryTicket::draw(chain.tip(), &keys.public_key(), chain.effective_stake(id)))
    }

    /// Seconds from `now` until `id` may forge the next block, 0 if it
    /// already may. `None` when the account does not forge or has no stake.
    pub fn next_block_eta(&self, chain: &Blockchain, id: AccountId, now: u32) -> Option<u32> {
        let hit_time = self.ticket(chain, id)?.hit_time?;
        Some(hit_time.saturating_sub(now))
    }

    /// Earliest winning forging account at `now`
    fn winner(&self, chain: &Blockchain, now: u32) -> Option<(&KeyPair, LotteryTicket)> {
        self.accounts
            .iter()
            .filter_map(|(id, keys)| {
                let ticket = LotteryTicket::draw(chain.tip(), &keys.public_key(), chain.effective_stake(*id));
                ticket.wins_at(now).then_some((keys, ticket))
            })
            .min_by_key(|(keys, ticket)| (ticket.hit_time, keys.account_id()))
    }

    /// Forges a block on top of the tip if a forging account has won by
    /// `now`. The block is validated and connected like any peer block.
    pub fn forge(&self, chain: &mut Blockchain, now: u32) -> Result<Option<ForgedBlock>, BlockError> {
        let Some((keys, ticket)) = self.winner(chain, now) else {
            return Ok(None);
        };
        let tip = chain.tip().clone();
        let base_target = chain.adjuster.next_base_target(&tip, now)?.new;
        let transactions = chain.select_transactions(now)?;

        let block = Block::unsigned(
            &tip,
            now,
            transactions,
            keys.public_key(),
            ticket.generation_signature,
            base_target,
        )
        .sign(keys);
        let outcome = chain.process_block(block.clone(), now, None)?;

        let generator = keys.account_id();
        log::info!(
            "Account {} forged block {} at height {} with {} transactions",
            generator,
            block.id(),
            block.height,
            block.transactions.len()
        );
        Ok(Some(ForgedBlock {
            block,
            generator,
            outcome,
        }))
    }
}
