//! Welcome admission protocol.
//!
//! A two-phase commit over invitation processing. Phase 1 processes the
//! invitation against the cryptographic engine, creating local group state.
//! Phase 2 reports the outcome (`success` or `failure + reason`) to the
//! server; membership is not server-visible-final until that confirmation
//! lands.
//!
//! Every transition is persisted. The Phase 1 outcome (`Joined` or
//! `Failed`) is durable *before* Phase 2 starts, so a crash between the
//! phases re-attempts Phase 2 only, with the recorded outcome and the
//! recorded idempotency token — it never silently redoes Phase 1, which
//! would consume a second single-use key package. A crash *during* Phase 1
//! is also safe to re-run: the engine snapshot is only persisted on
//! success, so a restarted engine still holds the unconsumed bundle.
//!
//! On a reported failure, the local state Phase 1 created is rolled back
//! (group discarded, records deleted) so retries start clean.

use std::sync::Arc;

use cachet_store::Store;
use cachet_types::{
    ConversationPhase, ConversationRecord, ConvoId, CoreConfig, IdempotencyKey, MemberRecord,
    PrincipalId, WelcomePhase, WelcomeRecord,
};
use tracing::{info, warn};

use crate::{
    engine::EngineError,
    env::Environment,
    error::CoreError,
    idempotency::{IdempotentClient, OperationKey},
    ledger::EpochSecretLedger,
    net::{NetworkClient, WelcomeOutcome},
    orchestrator::{ENGINE_STATE_BLOB, SharedEngine},
};

/// Drives invitations from receipt to a server-confirmed terminal state.
pub struct WelcomeAdmissionProtocol<S: Store, N: NetworkClient, E: Environment> {
    principal: PrincipalId,
    store: S,
    ledger: EpochSecretLedger<S>,
    engine: SharedEngine,
    client: Arc<IdempotentClient<N, E>>,
    env: E,
    config: CoreConfig,
}

impl<S: Store, N: NetworkClient, E: Environment> WelcomeAdmissionProtocol<S, N, E> {
    /// Build the protocol over shared component handles.
    pub fn new(
        principal: PrincipalId,
        store: S,
        engine: SharedEngine,
        client: Arc<IdempotentClient<N, E>>,
        env: E,
        config: CoreConfig,
    ) -> Self {
        let ledger = EpochSecretLedger::new(principal, store.clone());
        Self { principal, store, ledger, engine, client, env, config }
    }

    /// Record an arriving invitation. Idempotent: a redelivered welcome for
    /// a conversation with admission already in progress is ignored.
    pub fn on_received(&self, convo: ConvoId, payload: Vec<u8>) -> Result<(), CoreError> {
        if self.store.welcome(self.principal, convo)?.is_some() {
            return Ok(());
        }

        let record = WelcomeRecord {
            convo,
            payload,
            arrived_at_secs: self.env.wall_clock_secs(),
            phase: WelcomePhase::Received,
            confirm_token: IdempotencyKey(self.env.random_u128()),
        };
        self.store.put_welcome(self.principal, &record)?;
        info!(%convo, "welcome received");
        Ok(())
    }

    /// Drive the admission for `convo` to a terminal state.
    ///
    /// Returns `Ok(())` once the server confirmed successful admission.
    /// A reported failure returns [`CoreError::KeyPackageDesync`] when the
    /// welcome was undecryptable for lack of local key material (run the
    /// recovery flow), or [`CoreError::WelcomeProcessingFailed`] otherwise.
    pub async fn run(&self, convo: ConvoId) -> Result<(), CoreError> {
        let mut record = self
            .store
            .welcome(self.principal, convo)?
            .ok_or(CoreError::UnknownConversation(convo))?;

        if matches!(record.phase, WelcomePhase::Received | WelcomePhase::Processing) {
            self.phase_one(&mut record).await?;
        }
        self.phase_two(record).await
    }

    /// Phase 1: process the invitation locally and persist the outcome.
    async fn phase_one(&self, record: &mut WelcomeRecord) -> Result<(), CoreError> {
        let convo = record.convo;
        record.phase = WelcomePhase::Processing;
        self.store.put_welcome(self.principal, record)?;

        let joined = {
            let mut engine = self.engine.lock().await;
            engine.process_welcome(&record.payload, &self.config.group)
        };

        match joined {
            Ok(joined) if joined.convo != convo => {
                // The invitation admitted us to a different group than the
                // server claimed. Refuse it rather than mis-file state.
                let reason = format!(
                    "welcome admitted to conversation {} instead of {convo}",
                    joined.convo
                );
                warn!(%convo, "welcome conversation mismatch");
                {
                    let mut engine = self.engine.lock().await;
                    let _ = engine.delete_group(joined.convo);
                }
                record.phase = WelcomePhase::Failed { reason, desync: false };
                self.store.put_welcome(self.principal, record)?;
            },
            Ok(joined) => {
                let now = self.env.wall_clock_secs();

                // Conversation row before anything that references it.
                self.store.put_conversation(self.principal, &ConversationRecord {
                    convo: joined.convo,
                    epoch: joined.epoch,
                    cipher_suite: 0,
                    phase: ConversationPhase::Active,
                    next_seq: 0,
                    created_at_secs: now,
                })?;

                // The group may already be past epoch 0 when we join;
                // export immediately so messages from the join epoch stay
                // decryptable after later advances.
                let secret = {
                    let mut engine = self.engine.lock().await;
                    engine.export_epoch_secret(joined.convo).map_err(|source| {
                        CoreError::Engine { convo: joined.convo, source }
                    })?
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

                let blob = {
                    let engine = self.engine.lock().await;
                    engine.snapshot().map_err(CoreError::DeviceKeyMaterial)?
                };
                self.store.put_blob(self.principal, ENGINE_STATE_BLOB, &blob)?;

                record.phase = WelcomePhase::Joined;
                self.store.put_welcome(self.principal, record)?;
                info!(%convo, epoch = joined.epoch, "welcome processed, awaiting confirmation");
            },
            Err(err) => {
                let desync = matches!(err, EngineError::NoMatchingKeyPackage(_));
                warn!(%convo, error = %err, desync, "welcome processing failed");
                record.phase = WelcomePhase::Failed { reason: err.to_string(), desync };
                self.store.put_welcome(self.principal, record)?;
            },
        }
        Ok(())
    }

    /// Phase 2: report the durable Phase 1 outcome to the server.
    async fn phase_two(&self, record: WelcomeRecord) -> Result<(), CoreError> {
        let convo = record.convo;
        let op = OperationKey::ConfirmWelcome { convo };
        self.client.assign_token(op.clone(), record.confirm_token);

        match record.phase {
            WelcomePhase::Joined => {
                self.client
                    .run(op, |token| {
                        self.client.inner().confirm_welcome(convo, WelcomeOutcome::Success, token)
                    })
                    .await?;

                // Terminal: the pending record's job is done.
                self.store.delete_welcome(self.principal, convo)?;
                info!(%convo, "welcome confirmed");
                Ok(())
            },
            WelcomePhase::Failed { reason, desync } => {
                self.client
                    .run(op, |token| {
                        self.client.inner().confirm_welcome(
                            convo,
                            WelcomeOutcome::Failure { reason: reason.clone() },
                            token,
                        )
                    })
                    .await?;

                self.rollback(convo).await?;
                self.store.delete_welcome(self.principal, convo)?;
                info!(%convo, "welcome failure reported, local state rolled back");

                if desync {
                    Err(CoreError::KeyPackageDesync { convo, reason })
                } else {
                    Err(CoreError::WelcomeProcessingFailed { convo, reason })
                }
            },
            WelcomePhase::Received | WelcomePhase::Processing => {
                // Unreachable after phase_one; treat as a logic error
                // without panicking.
                Err(CoreError::WelcomeProcessingFailed {
                    convo,
                    reason: "admission did not reach a phase-1 outcome".to_string(),
                })
            },
            WelcomePhase::Confirmed | WelcomePhase::ReportedFailed => Ok(()),
        }
    }

    /// Discard everything Phase 1 created.
    async fn rollback(&self, convo: ConvoId) -> Result<(), CoreError> {
        {
            let mut engine = self.engine.lock().await;
            if engine.has_group(convo) {
                engine
                    .delete_group(convo)
                    .map_err(|source| CoreError::Engine { convo, source })?;
            }
        }
        self.store.delete_conversation(self.principal, convo)?;
        self.ledger.purge_conversation(convo)?;
        self.ledger.sweep(convo)?;
        Ok(())
    }

    /// Pending admissions, for restart resume. `Received`/`Processing`
    /// entries re-run Phase 1 (safe: the engine snapshot is only persisted
    /// after a successful join, so the bundle was not durably consumed);
    /// `Joined`/`Failed` entries re-attempt Phase 2 only.
    pub fn pending(&self) -> Result<Vec<WelcomeRecord>, CoreError> {
        Ok(self.store.welcomes(self.principal)?)
    }
}
