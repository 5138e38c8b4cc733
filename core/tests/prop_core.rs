use proptest::prelude::*;

use horizon_core::crypto::{self, KeyPair};
use horizon_core::difficulty::{cumulative_difficulty, DifficultyAdjuster};
use horizon_core::forging::{hit_time, verify_hit};
use horizon_core::{Attachment, GenesisConfig, Ledger, TransactionBuilder, MAX_BASE_TARGET};

fn proptest_config() -> ProptestConfig {
    let cases = std::env::var("PROPTEST_CASES")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(64);
    ProptestConfig {
        cases,
        ..ProptestConfig::default()
    }
}

proptest! {
    #![proptest_config(proptest_config())]

    #[test]
    fn flipping_any_signed_byte_breaks_the_signature(
        amount in 1u64..1_000_000,
        fee in 1u64..1_000,
        index in any::<prop::sample::Index>(),
        mask in 1u8..=255,
    ) {
        let alice = KeyPair::from_secret_phrase("alice").unwrap();
        let bob = KeyPair::from_secret_phrase("bob").unwrap();
        let tx = TransactionBuilder::new(alice.public_key(), amount, fee, 60, Attachment::OrdinaryPayment)
            .recipient(bob.account_id())
            .timestamp(1_000)
            .sign(&alice);
        prop_assert!(tx.verify_signature());

        let mut signed = tx.unsigned_bytes();
        let i = index.index(signed.len());
        signed[i] ^= mask;
        prop_assert!(!crypto::verify(&signed, &tx.signature, &tx.sender_public_key));

        let mut signature = tx.signature;
        let j = index.index(signature.0.len());
        signature.0[j] ^= mask;
        prop_assert!(!crypto::verify(&tx.unsigned_bytes(), &signature, &tx.sender_public_key));
    }
}

proptest! {
    #![proptest_config(proptest_config())]

    #[test]
    fn base_target_stays_within_bounds(current in 1u64..=MAX_BASE_TARGET, elapsed in 0u32..100_000) {
        let mut parent = GenesisConfig::new(1_000).block();
        parent.base_target = current;
        let adjustment = DifficultyAdjuster::new().next_base_target(&parent, 1_000 + elapsed).unwrap();

        prop_assert!(adjustment.new >= 1);
        prop_assert!(adjustment.new <= MAX_BASE_TARGET.max(current.saturating_mul(2)));
        prop_assert!(adjustment.new >= current / 2);
        prop_assert!(adjustment.new <= current.saturating_mul(2));
        prop_assert!(cumulative_difficulty(7, adjustment.new) > 7);
    }
}

proptest! {
    #![proptest_config(proptest_config())]

    #[test]
    fn hit_time_is_the_first_winning_second(
        hit in any::<u64>(),
        stake in 1u64..1_000_000_000,
        base_target in 1u64..=MAX_BASE_TARGET,
    ) {
        let mut parent = GenesisConfig::new(0).block();
        parent.base_target = base_target;
        if let Some(t) = hit_time(hit, stake, &parent) {
            prop_assert!(verify_hit(hit, stake, base_target, t));
            prop_assert!(!verify_hit(hit, stake, base_target, t - 1));
        }
    }
}

proptest! {
    #![proptest_config(proptest_config())]

    #[test]
    fn undo_restores_balances(moves in prop::collection::vec((0usize..4, 0usize..4, 1u64..500), 1..40)) {
        let keys: Vec<KeyPair> = (0..4)
            .map(|i| KeyPair::from_secret_phrase(&format!("account-{}", i)).unwrap())
            .collect();
        let mut genesis = GenesisConfig::new(0);
        for k in &keys {
            genesis = genesis.allocate(k.public_key(), 1_000);
        }
        let mut ledger = Ledger::new(10, 10);
        genesis.apply(&mut ledger).unwrap();
        let before: Vec<u64> = keys.iter().map(|k| ledger.balance(k.account_id())).collect();

        ledger.begin_block(1).unwrap();
        for (from, to, amount) in moves {
            let from = keys[from].account_id();
            if ledger.debit(from, amount).is_ok() {
                ledger.credit(keys[to].account_id(), amount).unwrap();
            }
        }
        prop_assert_eq!(ledger.total_balance(), 4_000);
        ledger.end_block().unwrap();

        ledger.undo(1, &Default::default()).unwrap();
        let after: Vec<u64> = keys.iter().map(|k| ledger.balance(k.account_id())).collect();
        prop_assert_eq!(before, after);
        prop_assert_eq!(ledger.height(), Some(0));
    }
}
