//! Chaotic store wrapper for fault injection testing.
//!
//! Delegates to an underlying store but randomly fails operations based on a
//! configured failure rate. Used to verify that orchestration code handles
//! storage failures without violating its ordering invariants. Deterministic
//! given the same seed.

use std::sync::{Arc, Mutex};

use cachet_types::{
    ConversationRecord, ConvoId, EpochKeyRecord, KeyPackageRecord, MemberRecord, MessageRecord,
    PrincipalId, RecoveryRecord, WelcomeRecord,
};

use crate::{error::StorageError, store::Store};

/// Simple deterministic RNG for chaos injection.
///
/// Linear congruential generator; reproducible chaos with the same seed.
struct ChaoticRng {
    state: u64,
}

impl ChaoticRng {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    /// Next value in `[0.0, 1.0)`.
    fn next(&mut self) -> f64 {
        // LCG constants from Numerical Recipes
        const A: u64 = 1_664_525;
        const C: u64 = 1_013_904_223;
        const M: u64 = 1u64 << 32;

        self.state = (A.wrapping_mul(self.state).wrapping_add(C)) % M;
        (self.state as f64) / (M as f64)
    }

    fn should_fail(&mut self, failure_rate: f64) -> bool {
        self.next() < failure_rate
    }
}

/// Store wrapper that randomly injects backend failures.
#[derive(Clone)]
pub struct ChaoticStore<S: Store> {
    inner: S,
    /// Failure rate (0.0 = never fail, 1.0 = always fail).
    failure_rate: f64,
    rng: Arc<Mutex<ChaoticRng>>,
    operation_count: Arc<Mutex<usize>>,
}

impl<S: Store> ChaoticStore<S> {
    /// Wrap `inner` with the given failure rate and a fixed default seed.
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in `[0.0, 1.0]`.
    pub fn new(inner: S, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, 0x1234_5678_9ABC_DEF0)
    }

    /// Wrap `inner` with an explicit seed for reproducible chaos.
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in `[0.0, 1.0]`.
    pub fn with_seed(inner: S, failure_rate: f64, seed: u64) -> Self {
        assert!(
            (0.0..=1.0).contains(&failure_rate),
            "failure_rate must be between 0.0 and 1.0, got {failure_rate}"
        );

        Self {
            inner,
            failure_rate,
            rng: Arc::new(Mutex::new(ChaoticRng::new(seed))),
            operation_count: Arc::new(Mutex::new(0)),
        }
    }

    /// Underlying store (for checking invariants after chaos).
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Total number of operations attempted, including failed ones.
    pub fn operation_count(&self) -> usize {
        #[allow(clippy::expect_used)]
        *self.operation_count.lock().expect("operation_count mutex poisoned")
    }

    /// Count the operation and roll for failure.
    fn attempt(&self) -> Result<(), StorageError> {
        #[allow(clippy::expect_used)]
        {
            *self.operation_count.lock().expect("operation_count mutex poisoned") += 1;
        }

        #[allow(clippy::expect_used)]
        let fail =
            self.rng.lock().expect("ChaoticRng mutex poisoned").should_fail(self.failure_rate);

        if fail {
            Err(StorageError::Backend("chaos: injected failure".to_string()))
        } else {
            Ok(())
        }
    }
}

impl<S: Store> Store for ChaoticStore<S> {
    fn put_conversation(
        &self,
        principal: PrincipalId,
        record: &ConversationRecord,
    ) -> Result<(), StorageError> {
        self.attempt()?;
        self.inner.put_conversation(principal, record)
    }

    fn conversation(
        &self,
        principal: PrincipalId,
        convo: ConvoId,
    ) -> Result<Option<ConversationRecord>, StorageError> {
        self.attempt()?;
        self.inner.conversation(principal, convo)
    }

    fn delete_conversation(
        &self,
        principal: PrincipalId,
        convo: ConvoId,
    ) -> Result<(), StorageError> {
        self.attempt()?;
        self.inner.delete_conversation(principal, convo)
    }

    fn conversations(
        &self,
        principal: PrincipalId,
    ) -> Result<Vec<ConversationRecord>, StorageError> {
        self.attempt()?;
        self.inner.conversations(principal)
    }

    fn put_member(
        &self,
        principal: PrincipalId,
        record: &MemberRecord,
    ) -> Result<(), StorageError> {
        self.attempt()?;
        self.inner.put_member(principal, record)
    }

    fn members(
        &self,
        principal: PrincipalId,
        convo: ConvoId,
    ) -> Result<Vec<MemberRecord>, StorageError> {
        self.attempt()?;
        self.inner.members(principal, convo)
    }

    fn put_key_package(
        &self,
        principal: PrincipalId,
        record: &KeyPackageRecord,
    ) -> Result<(), StorageError> {
        self.attempt()?;
        self.inner.put_key_package(principal, record)
    }

    fn key_package(
        &self,
        principal: PrincipalId,
        hash_ref: &[u8],
    ) -> Result<Option<KeyPackageRecord>, StorageError> {
        self.attempt()?;
        self.inner.key_package(principal, hash_ref)
    }

    fn put_message(
        &self,
        principal: PrincipalId,
        record: &MessageRecord,
    ) -> Result<(), StorageError> {
        self.attempt()?;
        self.inner.put_message(principal, record)
    }

    fn message(
        &self,
        principal: PrincipalId,
        convo: ConvoId,
        seq: u64,
    ) -> Result<Option<MessageRecord>, StorageError> {
        self.attempt()?;
        self.inner.message(principal, convo, seq)
    }

    fn messages(
        &self,
        principal: PrincipalId,
        convo: ConvoId,
        from_seq: u64,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StorageError> {
        self.attempt()?;
        self.inner.messages(principal, convo, from_seq, limit)
    }

    fn delete_messages_older_than(
        &self,
        principal: PrincipalId,
        cutoff_secs: u64,
    ) -> Result<u64, StorageError> {
        self.attempt()?;
        self.inner.delete_messages_older_than(principal, cutoff_secs)
    }

    fn put_epoch_key(
        &self,
        principal: PrincipalId,
        record: &EpochKeyRecord,
    ) -> Result<(), StorageError> {
        self.attempt()?;
        self.inner.put_epoch_key(principal, record)
    }

    fn epoch_key(
        &self,
        principal: PrincipalId,
        convo: ConvoId,
        epoch: u64,
    ) -> Result<Option<EpochKeyRecord>, StorageError> {
        self.attempt()?;
        self.inner.epoch_key(principal, convo, epoch)
    }

    fn epoch_keys(
        &self,
        principal: PrincipalId,
        convo: ConvoId,
    ) -> Result<Vec<EpochKeyRecord>, StorageError> {
        self.attempt()?;
        self.inner.epoch_keys(principal, convo)
    }

    fn delete_epoch_key(
        &self,
        principal: PrincipalId,
        convo: ConvoId,
        epoch: u64,
    ) -> Result<(), StorageError> {
        self.attempt()?;
        self.inner.delete_epoch_key(principal, convo, epoch)
    }

    fn put_blob(
        &self,
        principal: PrincipalId,
        name: &str,
        bytes: &[u8],
    ) -> Result<(), StorageError> {
        self.attempt()?;
        self.inner.put_blob(principal, name, bytes)
    }

    fn blob(&self, principal: PrincipalId, name: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.attempt()?;
        self.inner.blob(principal, name)
    }

    fn put_welcome(
        &self,
        principal: PrincipalId,
        record: &WelcomeRecord,
    ) -> Result<(), StorageError> {
        self.attempt()?;
        self.inner.put_welcome(principal, record)
    }

    fn welcome(
        &self,
        principal: PrincipalId,
        convo: ConvoId,
    ) -> Result<Option<WelcomeRecord>, StorageError> {
        self.attempt()?;
        self.inner.welcome(principal, convo)
    }

    fn delete_welcome(&self, principal: PrincipalId, convo: ConvoId) -> Result<(), StorageError> {
        self.attempt()?;
        self.inner.delete_welcome(principal, convo)
    }

    fn welcomes(&self, principal: PrincipalId) -> Result<Vec<WelcomeRecord>, StorageError> {
        self.attempt()?;
        self.inner.welcomes(principal)
    }

    fn put_recovery(
        &self,
        principal: PrincipalId,
        record: &RecoveryRecord,
    ) -> Result<(), StorageError> {
        self.attempt()?;
        self.inner.put_recovery(principal, record)
    }

    fn recovery(
        &self,
        principal: PrincipalId,
        convo: ConvoId,
    ) -> Result<Option<RecoveryRecord>, StorageError> {
        self.attempt()?;
        self.inner.recovery(principal, convo)
    }

    fn delete_recovery(&self, principal: PrincipalId, convo: ConvoId) -> Result<(), StorageError> {
        self.attempt()?;
        self.inner.delete_recovery(principal, convo)
    }

    fn recoveries(&self, principal: PrincipalId) -> Result<Vec<RecoveryRecord>, StorageError> {
        self.attempt()?;
        self.inner.recoveries(principal)
    }
}

#[cfg(test)]
mod tests {
    use cachet_types::ConversationPhase;

    use super::*;
    use crate::memory::MemoryStore;

    fn sample(convo: ConvoId) -> ConversationRecord {
        ConversationRecord {
            convo,
            epoch: 0,
            cipher_suite: 1,
            phase: ConversationPhase::Active,
            next_seq: 0,
            created_at_secs: 0,
        }
    }

    #[test]
    fn zero_rate_never_fails() {
        let store = ChaoticStore::new(MemoryStore::new(), 0.0);
        for i in 0..100 {
            store.put_conversation(PrincipalId(1), &sample(ConvoId(i))).unwrap();
        }
        assert_eq!(store.operation_count(), 100);
    }

    #[test]
    fn full_rate_always_fails() {
        let store = ChaoticStore::new(MemoryStore::new(), 1.0);
        for i in 0..20 {
            let result = store.put_conversation(PrincipalId(1), &sample(ConvoId(i)));
            assert!(matches!(result, Err(StorageError::Backend(_))));
        }
        // Nothing reached the inner store.
        assert!(store.inner().conversations(PrincipalId(1)).unwrap().is_empty());
    }

    #[test]
    fn same_seed_is_deterministic() {
        let a = ChaoticStore::with_seed(MemoryStore::new(), 0.5, 42);
        let b = ChaoticStore::with_seed(MemoryStore::new(), 0.5, 42);

        let outcomes_a: Vec<bool> = (0..50)
            .map(|i| a.put_conversation(PrincipalId(1), &sample(ConvoId(i))).is_ok())
            .collect();
        let outcomes_b: Vec<bool> = (0..50)
            .map(|i| b.put_conversation(PrincipalId(1), &sample(ConvoId(i))).is_ok())
            .collect();

        assert_eq!(outcomes_a, outcomes_b);
    }
}
