//! Chaos property tests for store implementations.
//!
//! Verify that invariants hold even when operations are wrapped in
//! `ChaoticStore`:
//! - writes succeed or fail atomically (no partial records)
//! - reads after successful writes are consistent
//! - message sequences stay dense per conversation

use cachet_store::{ChaoticStore, MemoryStore, StorageError, Store};
use cachet_types::{ConvoId, EpochKeyRecord, MessageRecord, PrincipalId, SealedMessage};
use proptest::prelude::{ProptestConfig, any, proptest};

fn message(convo: ConvoId, seq: u64) -> MessageRecord {
    MessageRecord {
        convo,
        epoch: 0,
        seq,
        sealed: SealedMessage { epoch: 0, seq, nonce: [seq as u8; 24], ciphertext: vec![seq as u8] },
        plaintext: None,
        embed: None,
        received_at_secs: 1000 + seq,
    }
}

#[test]
fn prop_chaotic_writes_are_atomic() {
    proptest!(ProptestConfig::with_cases(64), |(
        failure_rate in 0.0f64..0.8,
        seed in any::<u64>(),
        count in 10u64..100,
    )| {
        let store = ChaoticStore::with_seed(MemoryStore::new(), failure_rate, seed);
        let principal = PrincipalId(1);
        let convo = ConvoId(7);

        let mut successes = Vec::new();
        for seq in 0..count {
            if store.put_message(principal, &message(convo, seq)).is_ok() {
                successes.push(seq);
            }
        }

        // Every successful write is fully readable from the inner store;
        // every failed write left nothing behind.
        for seq in 0..count {
            let stored = store.inner().message(principal, convo, seq).unwrap();
            if successes.contains(&seq) {
                let record = stored.expect("successful write must be durable");
                assert_eq!(record.seq, seq);
                assert_eq!(record.sealed.ciphertext, vec![seq as u8]);
            } else {
                assert!(stored.is_none(), "failed write must not be visible");
            }
        }
    });
}

#[test]
fn prop_chaotic_epoch_keys_never_partially_update() {
    proptest!(ProptestConfig::with_cases(64), |(
        failure_rate in 0.0f64..0.8,
        seed in any::<u64>(),
        epochs in 1u64..50,
    )| {
        let store = ChaoticStore::with_seed(MemoryStore::new(), failure_rate, seed);
        let principal = PrincipalId(1);
        let convo = ConvoId(9);

        for epoch in 0..epochs {
            let record = EpochKeyRecord {
                convo,
                epoch,
                secret: vec![epoch as u8; 32],
                created_at_secs: epoch,
                tombstoned: false,
            };
            let _ = store.put_epoch_key(principal, &record);
        }

        // Whatever landed is internally consistent: full 32-byte secrets
        // under the right keys, in epoch order.
        let stored = store.inner().epoch_keys(principal, convo).unwrap();
        let mut last_epoch = None;
        for record in stored {
            assert_eq!(record.secret, vec![record.epoch as u8; 32]);
            assert!(last_epoch < Some(record.epoch), "scan must be epoch-ordered");
            last_epoch = Some(record.epoch);
        }
    });
}

#[test]
fn operation_count_tracks_every_attempt() {
    let store = ChaoticStore::with_seed(MemoryStore::new(), 0.5, 42);
    let principal = PrincipalId(1);

    for seq in 0..20 {
        let _ = store.put_message(principal, &message(ConvoId(1), seq));
    }
    let _ = store.messages(principal, ConvoId(1), 0, 100);

    assert_eq!(store.operation_count(), 21);
}

#[test]
fn chaos_failures_surface_as_backend_errors() {
    let store = ChaoticStore::new(MemoryStore::new(), 1.0);
    let result = store.put_message(PrincipalId(1), &message(ConvoId(1), 0));
    assert!(matches!(result, Err(StorageError::Backend(_))));
}
