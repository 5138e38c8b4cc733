//! Stake-weighted forging lottery
//!
//! Every account draws a deterministic hit from the parent block. The
//! account may forge once `hit < base_target * stake * elapsed`, so the
//! threshold grows with time and somebody always wins eventually.

use crate::block::Block;
use crate::crypto::{self, PublicKey};

/// Generation signature of a child forged by `generator` on top of a
/// parent carrying `parent_generation_signature`
pub fn generation_signature(parent_generation_signature: &[u8; 32], generator: &PublicKey) -> [u8; 32] {
    crypto::sha256_concat(&[parent_generation_signature, generator.as_bytes()])
}

/// Lottery draw encoded in a generation signature
pub fn hit(generation_signature: &[u8; 32]) -> u64 {
    crypto::le_u64_prefix(generation_signature)
}

/// Whether `hit` wins after `elapsed` seconds with `effective_stake` coins
pub fn verify_hit(hit: u64, effective_stake: u64, parent_base_target: u64, elapsed: u32) -> bool {
    let target = u128::from(parent_base_target)
        .saturating_mul(u128::from(effective_stake))
        .saturating_mul(u128::from(elapsed));
    u128::from(hit) < target
}

/// Earliest timestamp at which `hit` wins, `None` without stake
pub fn hit_time(hit: u64, effective_stake: u64, parent: &Block) -> Option<u32> {
    let effective_base_target = u128::from(parent.base_target) * u128::from(effective_stake);
    if effective_base_target == 0 {
        return None;
    }
    let wait = u128::from(hit) / effective_base_target + 1;
    let wait = u32::try_from(wait).ok()?;
    parent.timestamp.checked_add(wait)
}

/// One account's lottery ticket for the block after `parent`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LotteryTicket {
    pub generation_signature: [u8; 32],
    pub hit: u64,
    /// Earliest winning timestamp, `None` without stake
    pub hit_time: Option<u32>,
}

impl LotteryTicket {
    pub fn draw(parent: &Block, generator: &PublicKey, effective_stake: u64) -> Self {
        let generation_signature = generation_signature(&parent.generation_signature, generator);
        let hit = hit(&generation_signature);
        Self {
            generation_signature,
            hit,
            hit_time: hit_time(hit, effective_stake, parent),
        }
    }

    /// Whether the ticket wins at `timestamp`
    pub fn wins_at(&self, timestamp: u32) -> bool {
        self.hit_time.is_some_and(|t| timestamp >= t)
    }
}
