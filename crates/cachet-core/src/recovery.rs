//! Key package recovery flow.
//!
//! Triggered when required key material for the local device is absent —
//! after local storage loss, a reinstall, or an undecryptable Welcome. The
//! flow generates a fresh single-use key package, submits a rejoin request
//! through the idempotent layer, and on the server's grant reloads group
//! state from the returned Welcome.
//!
//! State is a typed, persisted machine
//! (`DesyncDetected → InProgress → {complete | Failed}`), not a set of
//! retry flags: every transition is written through the store, so a crash
//! mid-recovery resumes where it left off, and retries of a failed attempt
//! reuse the persisted rejoin token.
//!
//! A failed attempt surfaces [`CoreError::RecoveryFailed`], which is
//! retryable — unlike [`CoreError::EpochSecretMissing`], which means the
//! historical data is gone and must be treated as permanent.

use std::sync::Arc;

use cachet_store::Store;
use cachet_types::{
    ConversationPhase, ConversationRecord, ConvoId, CoreConfig, IdempotencyKey, KeyPackageRecord,
    MemberRecord, MemberRef, PrincipalId, RecoveryPhase, RecoveryRecord,
};
use tracing::{info, warn};

use crate::{
    env::Environment,
    error::CoreError,
    idempotency::{IdempotentClient, OperationKey},
    ledger::EpochSecretLedger,
    net::{NetworkClient, RejoinReason},
    orchestrator::{ENGINE_STATE_BLOB, SharedEngine},
};

/// Drives a desynchronized conversation back to working membership.
pub struct KeyPackageRecoveryFlow<S: Store, N: NetworkClient, E: Environment> {
    local: MemberRef,
    principal: PrincipalId,
    store: S,
    ledger: EpochSecretLedger<S>,
    engine: SharedEngine,
    client: Arc<IdempotentClient<N, E>>,
    env: E,
    config: CoreConfig,
}

impl<S: Store, N: NetworkClient, E: Environment> KeyPackageRecoveryFlow<S, N, E> {
    /// Build the flow over shared component handles.
    pub fn new(
        local: MemberRef,
        store: S,
        engine: SharedEngine,
        client: Arc<IdempotentClient<N, E>>,
        env: E,
        config: CoreConfig,
    ) -> Self {
        let principal = local.principal;
        let ledger = EpochSecretLedger::new(principal, store.clone());
        Self { local, principal, store, ledger, engine, client, env, config }
    }

    /// Record that desync was detected for `convo`.
    ///
    /// Idempotent: an already-tracked recovery keeps its state and, most
    /// importantly, its rejoin token.
    pub fn detect(&self, convo: ConvoId, reason: &str) -> Result<(), CoreError> {
        if self.store.recovery(self.principal, convo)?.is_some() {
            return Ok(());
        }

        let record = RecoveryRecord {
            convo,
            phase: RecoveryPhase::DesyncDetected,
            rejoin_token: IdempotencyKey(self.env.random_u128()),
            attempts: 0,
            detected_at_secs: self.env.wall_clock_secs(),
        };
        self.store.put_recovery(self.principal, &record)?;
        warn!(%convo, reason, "key package desync detected");
        Ok(())
    }

    /// Current recovery phase for `convo`, if a recovery is tracked.
    pub fn status(&self, convo: ConvoId) -> Result<Option<RecoveryPhase>, CoreError> {
        Ok(self.store.recovery(self.principal, convo)?.map(|r| r.phase))
    }

    /// Run one recovery attempt to completion.
    ///
    /// On success the recovery record is discarded and the conversation is
    /// active again. On failure the record persists in `Failed`, and the
    /// returned [`CoreError::RecoveryFailed`] may be retried — the next
    /// attempt reuses the same rejoin token.
    pub async fn run(&self, convo: ConvoId) -> Result<(), CoreError> {
        let mut record = self
            .store
            .recovery(self.principal, convo)?
            .ok_or(CoreError::UnknownConversation(convo))?;

        record.phase = RecoveryPhase::InProgress;
        record.attempts += 1;
        self.store.put_recovery(self.principal, &record)?;
        info!(%convo, attempt = record.attempts, "recovery attempt started");

        match self.attempt(convo, record.rejoin_token).await {
            Ok(epoch) => {
                self.store.delete_recovery(self.principal, convo)?;
                info!(%convo, epoch, "recovery complete");
                Ok(())
            },
            Err(err) => {
                record.phase = RecoveryPhase::Failed { reason: err.to_string() };
                self.store.put_recovery(self.principal, &record)?;
                Err(CoreError::RecoveryFailed { convo, reason: err.to_string() })
            },
        }
    }

    async fn attempt(&self, convo: ConvoId, token: IdempotencyKey) -> Result<u64, CoreError> {
        let now = self.env.wall_clock_secs();

        // Fresh single-use key package for the rejoin.
        let created = {
            let mut engine = self.engine.lock().await;
            engine.create_key_package().map_err(CoreError::DeviceKeyMaterial)?
        };
        self.store.put_key_package(self.principal, &KeyPackageRecord {
            principal: self.local.principal,
            device: self.local.device,
            cipher_suite: created.cipher_suite,
            hash_ref: created.hash_ref.clone(),
            expires_at_secs: now + 24 * 60 * 60,
            consumed: false,
        })?;

        // Bundle durable before the request leaves, or the grant's welcome
        // could be undecryptable after a crash.
        let blob = {
            let engine = self.engine.lock().await;
            engine.snapshot().map_err(CoreError::DeviceKeyMaterial)?
        };
        self.store.put_blob(self.principal, ENGINE_STATE_BLOB, &blob)?;

        let op = OperationKey::Rejoin { convo };
        self.client.assign_token(op.clone(), token);
        let grant = self
            .client
            .run(op, |t| {
                self.client.inner().request_rejoin(
                    convo,
                    created.bytes.clone(),
                    RejoinReason::LocalStateLost,
                    t,
                )
            })
            .await?;

        // Reload group state from the granted welcome.
        let joined = {
            let mut engine = self.engine.lock().await;
            engine
                .process_welcome(&grant.welcome, &self.config.group)
                .map_err(|source| CoreError::Engine { convo, source })?
        };

        self.store.put_conversation(self.principal, &ConversationRecord {
            convo: joined.convo,
            epoch: joined.epoch,
            cipher_suite: 0,
            phase: ConversationPhase::Active,
            next_seq: self.next_seq_after_reload(joined.convo)?,
            created_at_secs: now,
        })?;

        let secret = {
            let mut engine = self.engine.lock().await;
            engine
                .export_epoch_secret(joined.convo)
                .map_err(|source| CoreError::Engine { convo: joined.convo, source })?
        };
        self.ledger.record(joined.convo, joined.epoch, &secret, now)?;

        for member in &joined.members {
            self.store.put_member(self.principal, &MemberRecord {
                convo: joined.convo,
                principal: member.principal,
                device: member.device,
                key_package_ref: vec![],
                joined_at_secs: now,
                left_at_secs: None,
            })?;
        }

        // The rejoin consumed our package.
        let mut package = self
            .store
            .key_package(self.principal, &created.hash_ref)?
            .ok_or_else(|| CoreError::Storage(cachet_store::StorageError::Serialization(
                "key package record vanished during recovery".to_string(),
            )))?;
        package.consumed = true;
        self.store.put_key_package(self.principal, &package)?;

        let blob = {
            let engine = self.engine.lock().await;
            engine.snapshot().map_err(CoreError::DeviceKeyMaterial)?
        };
        self.store.put_blob(self.principal, ENGINE_STATE_BLOB, &blob)?;

        Ok(joined.epoch)
    }

    /// Keep the outbound sequence counter monotonic across a reload.
    fn next_seq_after_reload(&self, convo: ConvoId) -> Result<u64, CoreError> {
        Ok(self
            .store
            .conversation(self.principal, convo)?
            .map(|record| record.next_seq)
            .unwrap_or(0))
    }

    /// In-flight recoveries, for restart resume.
    pub fn pending(&self) -> Result<Vec<RecoveryRecord>, CoreError> {
        Ok(self.store.recoveries(self.principal)?)
    }
}
