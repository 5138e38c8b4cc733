//! Genesis block and initial coin allocation

use crate::account::{Ledger, LedgerError};
use crate::block::Block;
use crate::crypto::{self, PublicKey, Signature};
use serde::{Deserialize, Serialize};

/// Coins assigned to one account at height 0
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisAllocation {
    pub public_key: PublicKey,
    /// Amount in base units
    pub amount: u64,
}

/// Parameters of the genesis block. All supply is allocated here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisConfig {
    /// Epoch seconds of the genesis block
    pub timestamp: u32,
    pub allocations: Vec<GenesisAllocation>,
}

impl GenesisConfig {
    pub fn new(timestamp: u32) -> Self {
        Self {
            timestamp,
            allocations: Vec::new(),
        }
    }

    pub fn allocate(mut self, public_key: PublicKey, amount: u64) -> Self {
        self.allocations.push(GenesisAllocation { public_key, amount });
        self
    }

    /// Sum of all allocations, `None` when it exceeds the total supply
    pub fn total_supply(&self) -> Option<u64> {
        self.allocations
            .iter()
            .try_fold(0u64, |sum, a| sum.checked_add(a.amount))
            .filter(|total| *total <= crate::MAX_BALANCE)
    }

    /// SHA-256 of the encoded allocations
    pub fn payload_hash(&self) -> [u8; 32] {
        let encoded = bincode::serialize(&self.allocations).expect("Failed to serialize genesis allocations");
        crypto::sha256(&encoded)
    }

    /// The genesis block. It carries no transactions and no signature; its
    /// payload hash commits to the allocations.
    pub fn block(&self) -> Block {
        Block {
            version: crate::PROTOCOL_VERSION,
            height: 0,
            timestamp: self.timestamp,
            previous_block_id: None,
            transaction_count: 0,
            total_amount: self.total_supply().unwrap_or(0),
            total_fee: 0,
            payload_length: 0,
            payload_hash: self.payload_hash(),
            generator_public_key: PublicKey::zero(),
            generation_signature: [0; 32],
            base_target: crate::INITIAL_BASE_TARGET,
            cumulative_difficulty: 0,
            transactions: Vec::new(),
            block_signature: Signature::empty(),
        }
    }

    /// Credits every allocation inside the height-0 block of `ledger`
    pub fn apply(&self, ledger: &mut Ledger) -> Result<(), LedgerError> {
        ledger.begin_block(0)?;
        for allocation in &self.allocations {
            ledger.register_public_key(&allocation.public_key)?;
            ledger.credit(allocation.public_key.account_id(), allocation.amount)?;
        }
        ledger.end_block()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    #[test]
    fn test_genesis_block() {
        let alice = KeyPair::from_secret_phrase("alice").unwrap();
        let config = GenesisConfig::new(0).allocate(alice.public_key(), 1_000_000);
        let genesis = config.block();

        assert_eq!(genesis.height, 0);
        assert!(genesis.is_genesis());
        assert_eq!(genesis.total_amount, 1_000_000);
        assert_eq!(genesis.base_target, crate::INITIAL_BASE_TARGET);
        assert_eq!(genesis.id(), config.block().id());
        assert_ne!(genesis.id(), GenesisConfig::new(0).block().id());
    }

    #[test]
    fn test_apply_allocations() {
        let alice = KeyPair::from_secret_phrase("alice").unwrap();
        let config = GenesisConfig::new(0).allocate(alice.public_key(), 1_000_000);
        let mut ledger = Ledger::new(1440, 720);
        config.apply(&mut ledger).unwrap();

        assert_eq!(ledger.height(), Some(0));
        assert_eq!(ledger.balance(alice.account_id()), 1_000_000);
        assert_eq!(ledger.unconfirmed_balance(alice.account_id()), 1_000_000);
        let account = ledger.account(alice.account_id()).unwrap();
        assert_eq!(account.public_key, Some(alice.public_key()));
    }

    #[test]
    fn test_total_supply_bound() {
        let alice = KeyPair::from_secret_phrase("alice").unwrap();
        let config = GenesisConfig::new(0)
            .allocate(alice.public_key(), crate::MAX_BALANCE)
            .allocate(alice.public_key(), 1);
        assert_eq!(config.total_supply(), None);
    }
}
