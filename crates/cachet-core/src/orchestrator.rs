//! Group lifecycle orchestration.
//!
//! Drives group creation, membership changes, message send/receive, and
//! epoch advancement against the cryptographic engine, enforcing the
//! persist-before-advance ordering invariant: **the secret for the
//! pre-advance epoch is durably recorded before the engine is told to
//! finalize any commit that advances the epoch.** Once the engine advances,
//! the old secret may be unrecoverable from the engine itself, so violating
//! this order is how historical messages become permanently undecryptable.
//!
//! The invariant is structural, not a convention: every advance re-checks
//! the ledger immediately before the merge and aborts with
//! [`CoreError::CommitOrderingViolation`] if the record is missing.
//!
//! Operations on the same conversation are serialized (one epoch transition
//! in flight per group); different conversations proceed in parallel. The
//! engine lock is never held across a network await.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex, PoisonError},
};

use cachet_store::Store;
use cachet_types::{
    ConversationPhase, ConversationRecord, ConvoId, CoreConfig, KeyPackageRecord, MemberRecord,
    MemberRef, MessageRecord, PrincipalId, SealedMessage,
};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::{
    cipher,
    engine::{EngineError, GroupEngine},
    env::Environment,
    error::CoreError,
    idempotency::{IdempotentClient, OperationKey},
    ledger::EpochSecretLedger,
    net::{ConversationInit, KeyPackageAd, MembershipChange, NetworkClient, OutboundMessage},
};

/// Store key for the persisted engine snapshot.
pub const ENGINE_STATE_BLOB: &str = "engine";

/// How long a published key package stays valid.
const KEY_PACKAGE_LIFETIME_SECS: u64 = 30 * 24 * 60 * 60;

/// Shared, serialized handle to the cryptographic engine.
pub type SharedEngine = Arc<AsyncMutex<Box<dyn GroupEngine>>>;

/// A member to add, with the key package fetched for them.
#[derive(Debug, Clone)]
pub struct Invitee {
    /// The member device being added.
    pub member: MemberRef,
    /// Their published key package.
    pub key_package: Vec<u8>,
    /// Hash reference of that package.
    pub hash_ref: Vec<u8>,
}

/// Result of processing one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Message decrypted (or served from the plaintext cache).
    Delivered {
        /// Sequence number of the message.
        seq: u64,
        /// Decrypted payload.
        plaintext: Vec<u8>,
    },
    /// Message is from a future epoch and was queued, not dropped.
    Queued {
        /// Sequence number of the queued message.
        seq: u64,
    },
}

/// A message released from the future-epoch queue by an epoch advance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredMessage {
    /// Sequence number of the message.
    pub seq: u64,
    /// Decrypted payload.
    pub plaintext: Vec<u8>,
}

/// Result of an epoch-advancing operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochAdvance {
    /// Epoch after the operation.
    pub epoch: u64,
    /// Queued future-epoch messages that became decryptable.
    pub released: Vec<DeliveredMessage>,
}

/// Map an engine error, treating a missing group as key-material desync.
///
/// Used on paths where a conversation record exists, so the engine *should*
/// have the group: its absence means local key material was lost.
fn engine_or_desync(convo: ConvoId) -> impl FnOnce(EngineError) -> CoreError {
    move |source| match source {
        EngineError::GroupNotFound(_) | EngineError::NoMatchingKeyPackage(_) => {
            CoreError::KeyPackageDesync { convo, reason: source.to_string() }
        },
        other => CoreError::Engine { convo, source: other },
    }
}

fn engine_err(convo: ConvoId) -> impl FnOnce(EngineError) -> CoreError {
    move |source| CoreError::Engine { convo, source }
}

/// Orchestrates all lifecycle operations for one principal's conversations.
pub struct GroupLifecycleOrchestrator<S: Store, N: NetworkClient, E: Environment> {
    /// The local (principal, device) this orchestrator acts as.
    local: MemberRef,
    principal: PrincipalId,
    store: S,
    ledger: EpochSecretLedger<S>,
    engine: SharedEngine,
    client: Arc<IdempotentClient<N, E>>,
    env: E,
    config: CoreConfig,
    /// Per-conversation serialization of epoch transitions.
    locks: StdMutex<HashMap<ConvoId, Arc<AsyncMutex<()>>>>,
    /// Messages from epochs we have not reached yet.
    future_queue: StdMutex<HashMap<ConvoId, Vec<SealedMessage>>>,
}

impl<S: Store, N: NetworkClient, E: Environment> GroupLifecycleOrchestrator<S, N, E> {
    /// Build an orchestrator over shared component handles.
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
        Self {
            local,
            principal,
            store,
            ledger,
            engine,
            client,
            env,
            config,
            locks: StdMutex::new(HashMap::new()),
            future_queue: StdMutex::new(HashMap::new()),
        }
    }

    /// The ledger this orchestrator records secrets through.
    pub fn ledger(&self) -> &EpochSecretLedger<S> {
        &self.ledger
    }

    fn convo_lock(&self, convo: ConvoId) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(convo).or_default().clone()
    }

    fn active_conversation(&self, convo: ConvoId) -> Result<ConversationRecord, CoreError> {
        let record = self
            .store
            .conversation(self.principal, convo)?
            .ok_or(CoreError::UnknownConversation(convo))?;
        match record.phase {
            ConversationPhase::Left | ConversationPhase::Removed => {
                Err(CoreError::ConversationClosed(convo))
            },
            ConversationPhase::Created | ConversationPhase::Active => Ok(record),
        }
    }

    /// Reject key packages a previous commit already consumed.
    fn check_unconsumed(&self, invitees: &[Invitee]) -> Result<(), CoreError> {
        for invitee in invitees {
            if let Some(record) = self.store.key_package(self.principal, &invitee.hash_ref)? {
                if record.consumed {
                    return Err(CoreError::KeyPackageConsumed {
                        hash_ref_hex: to_hex(&invitee.hash_ref),
                    });
                }
            }
        }
        Ok(())
    }

    /// Persist membership rows and mark the consumed key packages.
    fn record_added_members(
        &self,
        convo: ConvoId,
        invitees: &[Invitee],
        now_secs: u64,
    ) -> Result<(), CoreError> {
        for invitee in invitees {
            self.store.put_member(self.principal, &MemberRecord {
                convo,
                principal: invitee.member.principal,
                device: invitee.member.device,
                key_package_ref: invitee.hash_ref.clone(),
                joined_at_secs: now_secs,
                left_at_secs: None,
            })?;

            // A package is single-use against a commit: marking it consumed
            // is what turns a second use into a hard error.
            let mut package = self
                .store
                .key_package(self.principal, &invitee.hash_ref)?
                .unwrap_or(KeyPackageRecord {
                    principal: invitee.member.principal,
                    device: invitee.member.device,
                    cipher_suite: 0,
                    hash_ref: invitee.hash_ref.clone(),
                    expires_at_secs: 0,
                    consumed: false,
                });
            package.consumed = true;
            self.store.put_key_package(self.principal, &package)?;
        }
        Ok(())
    }

    async fn persist_engine(&self, convo: ConvoId) -> Result<(), CoreError> {
        let blob = {
            let engine = self.engine.lock().await;
            engine.snapshot().map_err(engine_err(convo))?
        };
        self.store.put_blob(self.principal, ENGINE_STATE_BLOB, &blob)?;
        Ok(())
    }

    /// Create a conversation, optionally with initial members.
    ///
    /// The conversation record is persisted *before* the engine call, so a
    /// secret-storage callback or crash mid-creation never observes a child
    /// row without its parent. On failure all local creation state is
    /// rolled back, so a retry starts clean. Returns the epoch the group
    /// settles at.
    pub async fn create(&self, convo: ConvoId, invitees: Vec<Invitee>) -> Result<u64, CoreError> {
        let lock = self.convo_lock(convo);
        let _guard = lock.lock().await;

        if self.store.conversation(self.principal, convo)?.is_some() {
            return Err(CoreError::ConversationExists(convo));
        }
        self.check_unconsumed(&invitees)?;

        match self.create_locked(convo, &invitees).await {
            Ok(epoch) => Ok(epoch),
            Err(err) => {
                // Best-effort rollback; the retry will recreate everything.
                {
                    let mut engine = self.engine.lock().await;
                    let _ = engine.delete_group(convo);
                }
                let _ = self.store.delete_conversation(self.principal, convo);
                let _ = self.ledger.purge_conversation(convo);
                let _ = self.ledger.sweep(convo);
                Err(err)
            },
        }
    }

    async fn create_locked(&self, convo: ConvoId, invitees: &[Invitee]) -> Result<u64, CoreError> {
        let now = self.env.wall_clock_secs();
        self.store.put_conversation(self.principal, &ConversationRecord {
            convo,
            epoch: 0,
            cipher_suite: 0,
            phase: ConversationPhase::Created,
            next_seq: 0,
            created_at_secs: now,
        })?;

        let (epoch, secret) = {
            let mut engine = self.engine.lock().await;
            let epoch = engine.create_group(convo, &self.config.group).map_err(engine_err(convo))?;
            let secret = engine.export_epoch_secret(convo).map_err(engine_err(convo))?;
            (epoch, secret)
        };
        self.ledger.record(convo, epoch, &secret, now)?;

        self.store.put_member(self.principal, &MemberRecord {
            convo,
            principal: self.local.principal,
            device: self.local.device,
            key_package_ref: vec![],
            joined_at_secs: now,
            left_at_secs: None,
        })?;

        let mut final_epoch = epoch;
        if invitees.is_empty() {
            self.client
                .run(OperationKey::CreateConversation { convo }, |token| {
                    self.client.inner().create_conversation(
                        ConversationInit { convo, members: vec![], commit: vec![], welcome: None },
                        token,
                    )
                })
                .await?;
        } else {
            let key_packages: Vec<Vec<u8>> =
                invitees.iter().map(|i| i.key_package.clone()).collect();
            let bundle = {
                let mut engine = self.engine.lock().await;
                engine.add_members(convo, &key_packages).map_err(engine_err(convo))?
            };

            let members: Vec<MemberRef> = invitees.iter().map(|i| i.member).collect();
            let sent = self
                .client
                .run(OperationKey::CreateConversation { convo }, |token| {
                    self.client.inner().create_conversation(
                        ConversationInit {
                            convo,
                            members: members.clone(),
                            commit: bundle.commit.clone(),
                            welcome: bundle.welcome.clone(),
                        },
                        token,
                    )
                })
                .await;
            if let Err(err) = sent {
                let mut engine = self.engine.lock().await;
                engine.clear_pending_commit(convo).map_err(engine_err(convo))?;
                return Err(err);
            }

            final_epoch = self.advance_own_commit(convo, epoch, bundle.target_epoch).await?;
            self.record_added_members(convo, invitees, now)?;
        }

        self.store.put_conversation(self.principal, &ConversationRecord {
            convo,
            epoch: final_epoch,
            cipher_suite: 0,
            phase: ConversationPhase::Active,
            next_seq: 0,
            created_at_secs: now,
        })?;
        self.persist_engine(convo).await?;

        info!(%convo, epoch = final_epoch, "conversation created");
        Ok(final_epoch)
    }

    /// Merge our own pending commit with the ordering guard.
    ///
    /// `pre_epoch` is the epoch whose secret must already be in the ledger.
    async fn advance_own_commit(
        &self,
        convo: ConvoId,
        pre_epoch: u64,
        target_epoch: u64,
    ) -> Result<u64, CoreError> {
        if !self.ledger.has(convo, pre_epoch)? {
            // Abort before the epoch-changing engine call executes.
            let mut engine = self.engine.lock().await;
            engine.clear_pending_commit(convo).map_err(engine_err(convo))?;
            return Err(CoreError::CommitOrderingViolation {
                convo,
                detail: format!("secret for epoch {pre_epoch} not recorded before advance"),
            });
        }

        let now = self.env.wall_clock_secs();
        let (new_epoch, secret) = {
            let mut engine = self.engine.lock().await;
            let new_epoch = engine.merge_pending_commit(convo).map_err(engine_err(convo))?;
            let secret = engine.export_epoch_secret(convo).map_err(engine_err(convo))?;
            (new_epoch, secret)
        };
        debug_assert_eq!(new_epoch, target_epoch, "merge must land on the pending target");
        self.ledger.record(convo, new_epoch, &secret, now)?;
        Ok(new_epoch)
    }

    /// Add members to an active conversation.
    ///
    /// Ordering: (1) record the current epoch's secret durably, (2) have
    /// the engine build the commit, (3) announce it, (4) merge — guarded —
    /// and persist the new epoch metadata. A step-1 failure aborts before
    /// any epoch-changing side effect.
    pub async fn add_members(
        &self,
        convo: ConvoId,
        invitees: Vec<Invitee>,
    ) -> Result<EpochAdvance, CoreError> {
        let lock = self.convo_lock(convo);
        let _guard = lock.lock().await;

        let mut record = self.active_conversation(convo)?;
        self.check_unconsumed(&invitees)?;
        let now = self.env.wall_clock_secs();

        // (1) Current epoch's secret, durably, before anything else.
        let (current, secret) = {
            let mut engine = self.engine.lock().await;
            let current = engine.current_epoch(convo).map_err(engine_or_desync(convo))?;
            let secret = engine.export_epoch_secret(convo).map_err(engine_or_desync(convo))?;
            (current, secret)
        };
        self.ledger.record(convo, current, &secret, now)?;

        // (2) Build the commit.
        let key_packages: Vec<Vec<u8>> = invitees.iter().map(|i| i.key_package.clone()).collect();
        let bundle = {
            let mut engine = self.engine.lock().await;
            engine.add_members(convo, &key_packages).map_err(engine_err(convo))?
        };

        // (3) Announce.
        let members: Vec<MemberRef> = invitees.iter().map(|i| i.member).collect();
        let sent = self
            .client
            .run(
                OperationKey::Membership { convo, target_epoch: bundle.target_epoch },
                |token| {
                    self.client.inner().add_members(
                        MembershipChange {
                            convo,
                            added: members.clone(),
                            removed: vec![],
                            commit: bundle.commit.clone(),
                            welcome: bundle.welcome.clone(),
                        },
                        token,
                    )
                },
            )
            .await;
        if let Err(err) = sent {
            let mut engine = self.engine.lock().await;
            engine.clear_pending_commit(convo).map_err(engine_err(convo))?;
            return Err(err);
        }

        // (4) Merge behind the structural guard, persist metadata.
        let new_epoch = self.advance_own_commit(convo, current, bundle.target_epoch).await?;
        record.epoch = new_epoch;
        self.store.put_conversation(self.principal, &record)?;
        self.record_added_members(convo, &invitees, now)?;
        self.persist_engine(convo).await?;

        self.ledger.prune(convo, new_epoch, &self.config.retention, now)?;

        let released = self.drain_future_queue(convo, new_epoch)?;
        info!(%convo, epoch = new_epoch, added = invitees.len(), "members added");
        Ok(EpochAdvance { epoch: new_epoch, released })
    }

    /// Remove members from an active conversation. Same ordering rules as
    /// [`Self::add_members`].
    pub async fn remove_members(
        &self,
        convo: ConvoId,
        members: &[MemberRef],
    ) -> Result<EpochAdvance, CoreError> {
        let lock = self.convo_lock(convo);
        let _guard = lock.lock().await;

        let mut record = self.active_conversation(convo)?;
        let now = self.env.wall_clock_secs();

        let (current, secret) = {
            let mut engine = self.engine.lock().await;
            let current = engine.current_epoch(convo).map_err(engine_or_desync(convo))?;
            let secret = engine.export_epoch_secret(convo).map_err(engine_or_desync(convo))?;
            (current, secret)
        };
        self.ledger.record(convo, current, &secret, now)?;

        let bundle = {
            let mut engine = self.engine.lock().await;
            engine.remove_members(convo, members).map_err(engine_err(convo))?
        };

        let sent = self
            .client
            .run(
                OperationKey::Membership { convo, target_epoch: bundle.target_epoch },
                |token| {
                    self.client.inner().remove_members(
                        MembershipChange {
                            convo,
                            added: vec![],
                            removed: members.to_vec(),
                            commit: bundle.commit.clone(),
                            welcome: None,
                        },
                        token,
                    )
                },
            )
            .await;
        if let Err(err) = sent {
            let mut engine = self.engine.lock().await;
            engine.clear_pending_commit(convo).map_err(engine_err(convo))?;
            return Err(err);
        }

        let new_epoch = self.advance_own_commit(convo, current, bundle.target_epoch).await?;
        record.epoch = new_epoch;
        self.store.put_conversation(self.principal, &record)?;

        for member in members {
            for mut row in self.store.members(self.principal, convo)? {
                if row.principal == member.principal && row.device == member.device {
                    row.left_at_secs = Some(now);
                    self.store.put_member(self.principal, &row)?;
                }
            }
        }
        self.persist_engine(convo).await?;
        self.ledger.prune(convo, new_epoch, &self.config.retention, now)?;

        let released = self.drain_future_queue(convo, new_epoch)?;
        info!(%convo, epoch = new_epoch, removed = members.len(), "members removed");
        Ok(EpochAdvance { epoch: new_epoch, released })
    }

    /// Seal and send a message at the current epoch. Returns the sequence
    /// number assigned to it.
    pub async fn send_message(
        &self,
        convo: ConvoId,
        plaintext: &[u8],
        embed: Option<Vec<u8>>,
    ) -> Result<u64, CoreError> {
        let lock = self.convo_lock(convo);
        let _guard = lock.lock().await;

        let mut record = self.active_conversation(convo)?;
        let seq = record.next_seq;
        let now = self.env.wall_clock_secs();

        let secret = self.current_secret(convo, record.epoch, now).await?;

        let mut suffix = [0u8; 8];
        self.env.random_bytes(&mut suffix);
        let sealed = cipher::seal_message(&secret, convo, record.epoch, seq, plaintext, suffix)?;

        let outbound =
            OutboundMessage { convo, epoch: record.epoch, seq, sealed: sealed.clone() };
        self.client
            .run(OperationKey::SendMessage { convo, seq }, |token| {
                self.client.inner().send_message(outbound.clone(), token)
            })
            .await?;

        self.store.put_message(self.principal, &MessageRecord {
            convo,
            epoch: record.epoch,
            seq,
            sealed,
            plaintext: Some(plaintext.to_vec()),
            embed,
            received_at_secs: now,
        })?;

        record.next_seq = seq + 1;
        self.store.put_conversation(self.principal, &record)?;
        Ok(seq)
    }

    /// The current epoch's secret: from the ledger, or exported live from
    /// the engine and recorded on first use.
    async fn current_secret(
        &self,
        convo: ConvoId,
        epoch: u64,
        now_secs: u64,
    ) -> Result<Vec<u8>, CoreError> {
        if let Some(secret) = self.ledger.lookup(convo, epoch)? {
            return Ok(secret);
        }
        let secret = {
            let mut engine = self.engine.lock().await;
            engine.export_epoch_secret(convo).map_err(engine_or_desync(convo))?
        };
        self.ledger.record(convo, epoch, &secret, now_secs)?;
        Ok(secret)
    }

    /// Process one inbound sealed message.
    ///
    /// - current epoch: decrypt with the live epoch secret;
    /// - older epoch: decrypt with the retained ledger secret — its absence
    ///   is a **permanent** [`CoreError::EpochSecretMissing`] for this
    ///   message;
    /// - future epoch: queue until an epoch advance catches us up.
    pub async fn process_message(
        &self,
        convo: ConvoId,
        sealed: SealedMessage,
    ) -> Result<ProcessOutcome, CoreError> {
        let lock = self.convo_lock(convo);
        let _guard = lock.lock().await;

        let record = self.active_conversation(convo)?;
        let current = record.epoch;

        // Plaintext cache: the ciphertext stays authoritative, the cache
        // only saves the redundant decrypt.
        if let Some(existing) = self.store.message(self.principal, convo, sealed.seq)? {
            if let Some(plaintext) = existing.plaintext {
                return Ok(ProcessOutcome::Delivered { seq: sealed.seq, plaintext });
            }
        }

        if sealed.epoch > current {
            let seq = sealed.seq;
            self.queue_future_message(convo, sealed);
            return Ok(ProcessOutcome::Queued { seq });
        }

        let delivered = self.decrypt_and_store(convo, current, sealed).await?;
        Ok(ProcessOutcome::Delivered { seq: delivered.seq, plaintext: delivered.plaintext })
    }

    async fn decrypt_and_store(
        &self,
        convo: ConvoId,
        current_epoch: u64,
        sealed: SealedMessage,
    ) -> Result<DeliveredMessage, CoreError> {
        let now = self.env.wall_clock_secs();

        let secret = if sealed.epoch == current_epoch {
            self.current_secret(convo, current_epoch, now).await?
        } else {
            // Historical epoch: the ledger is the only source. A missing
            // secret is permanent for this message, never retried.
            self.ledger.lookup(convo, sealed.epoch)?.ok_or(CoreError::EpochSecretMissing {
                convo,
                epoch: sealed.epoch,
                seq: Some(sealed.seq),
            })?
        };

        let plaintext = cipher::open_message(&secret, convo, &sealed)?;

        let seq = sealed.seq;
        self.store.put_message(self.principal, &MessageRecord {
            convo,
            epoch: sealed.epoch,
            seq,
            sealed,
            plaintext: Some(plaintext.clone()),
            embed: None,
            received_at_secs: now,
        })?;

        Ok(DeliveredMessage { seq, plaintext })
    }

    fn queue_future_message(&self, convo: ConvoId, sealed: SealedMessage) {
        let mut queues = self.future_queue.lock().unwrap_or_else(PoisonError::into_inner);
        let queue = queues.entry(convo).or_default();
        if queue.len() >= self.config.future_queue_limit {
            warn!(%convo, "future-epoch queue full, dropping oldest");
            queue.remove(0);
        }
        debug!(%convo, epoch = sealed.epoch, seq = sealed.seq, "queued future-epoch message");
        queue.push(sealed);
    }

    /// Decrypt queued messages whose epoch we have now reached.
    fn drain_future_queue(
        &self,
        convo: ConvoId,
        up_to_epoch: u64,
    ) -> Result<Vec<DeliveredMessage>, CoreError> {
        let ready: Vec<SealedMessage> = {
            let mut queues = self.future_queue.lock().unwrap_or_else(PoisonError::into_inner);
            match queues.get_mut(&convo) {
                Some(queue) => {
                    let (ready, rest): (Vec<_>, Vec<_>) =
                        queue.drain(..).partition(|m| m.epoch <= up_to_epoch);
                    *queue = rest;
                    ready
                },
                None => Vec::new(),
            }
        };

        let now = self.env.wall_clock_secs();
        let mut released = Vec::with_capacity(ready.len());
        for sealed in ready {
            let seq = sealed.seq;
            let secret = match self.ledger.lookup(convo, sealed.epoch)? {
                Some(secret) => secret,
                None => {
                    warn!(%convo, epoch = sealed.epoch, seq, "released message has no secret");
                    continue;
                },
            };
            match cipher::open_message(&secret, convo, &sealed) {
                Ok(plaintext) => {
                    self.store.put_message(self.principal, &MessageRecord {
                        convo,
                        epoch: sealed.epoch,
                        seq,
                        sealed,
                        plaintext: Some(plaintext.clone()),
                        embed: None,
                        received_at_secs: now,
                    })?;
                    released.push(DeliveredMessage { seq, plaintext });
                },
                Err(err) => warn!(%convo, seq, error = %err, "queued message failed to decrypt"),
            }
        }
        Ok(released)
    }

    /// Handle an inbound protocol message (a remote commit or proposal).
    ///
    /// For a commit: the pre-merge epoch's secret is recorded durably
    /// *before* the merge — a storage failure leaves the commit staged and
    /// the epoch unadvanced.
    pub async fn handle_protocol_message(
        &self,
        convo: ConvoId,
        message: &[u8],
    ) -> Result<EpochAdvance, CoreError> {
        use crate::engine::ProtocolOutcome;

        let lock = self.convo_lock(convo);
        let _guard = lock.lock().await;

        let mut record = self.active_conversation(convo)?;
        let now = self.env.wall_clock_secs();

        let outcome = {
            let mut engine = self.engine.lock().await;
            engine.process_protocol_message(convo, message).map_err(engine_or_desync(convo))?
        };

        let current_epoch = match outcome {
            ProtocolOutcome::StagedCommit { current_epoch } => current_epoch,
            ProtocolOutcome::Proposal => {
                return Ok(EpochAdvance { epoch: record.epoch, released: vec![] });
            },
            ProtocolOutcome::Application { .. } => {
                warn!(%convo, "application message on the protocol path, ignoring");
                return Ok(EpochAdvance { epoch: record.epoch, released: vec![] });
            },
        };

        // Persist-before-advance: export and record the pre-merge secret.
        // If this fails the commit stays staged and nothing advanced.
        let secret = {
            let mut engine = self.engine.lock().await;
            engine.export_epoch_secret(convo).map_err(engine_or_desync(convo))?
        };
        self.ledger.record(convo, current_epoch, &secret, now)?;

        let merged = {
            let mut engine = self.engine.lock().await;
            engine.merge_staged_commit(convo).map_err(engine_err(convo))?
        };

        if !merged.active {
            // The commit removed us. Terminal.
            record.phase = ConversationPhase::Removed;
            record.epoch = merged.epoch;
            self.store.put_conversation(self.principal, &record)?;
            {
                let mut engine = self.engine.lock().await;
                engine.delete_group(convo).map_err(engine_err(convo))?;
            }
            self.persist_engine(convo).await?;
            self.ledger.purge_conversation(convo)?;
            info!(%convo, "removed from conversation by commit");
            return Ok(EpochAdvance { epoch: merged.epoch, released: vec![] });
        }

        let new_secret = {
            let mut engine = self.engine.lock().await;
            engine.export_epoch_secret(convo).map_err(engine_err(convo))?
        };
        self.ledger.record(convo, merged.epoch, &new_secret, now)?;

        record.epoch = merged.epoch;
        self.store.put_conversation(self.principal, &record)?;
        self.persist_engine(convo).await?;
        self.ledger.prune(convo, merged.epoch, &self.config.retention, now)?;

        let released = self.drain_future_queue(convo, merged.epoch)?;
        debug!(%convo, epoch = merged.epoch, "advanced by remote commit");
        Ok(EpochAdvance { epoch: merged.epoch, released })
    }

    /// Leave a conversation. Local state is destroyed; peers observe the
    /// departure through the membership commit another member lands.
    pub async fn leave(&self, convo: ConvoId) -> Result<(), CoreError> {
        let lock = self.convo_lock(convo);
        let _guard = lock.lock().await;

        let mut record = self.active_conversation(convo)?;
        record.phase = ConversationPhase::Left;
        self.store.put_conversation(self.principal, &record)?;

        {
            let mut engine = self.engine.lock().await;
            engine.delete_group(convo).map_err(engine_err(convo))?;
        }
        self.persist_engine(convo).await?;
        self.ledger.purge_conversation(convo)?;

        let mut queues = self.future_queue.lock().unwrap_or_else(PoisonError::into_inner);
        queues.remove(&convo);

        info!(%convo, "left conversation");
        Ok(())
    }

    /// Create and publish a fresh single-use key package for this device.
    /// Returns its hash reference.
    pub async fn publish_key_package(&self) -> Result<Vec<u8>, CoreError> {
        let now = self.env.wall_clock_secs();
        let created = {
            let mut engine = self.engine.lock().await;
            engine.create_key_package().map_err(CoreError::DeviceKeyMaterial)?
        };

        let expires_at_secs = now + KEY_PACKAGE_LIFETIME_SECS;
        self.store.put_key_package(self.principal, &KeyPackageRecord {
            principal: self.local.principal,
            device: self.local.device,
            cipher_suite: created.cipher_suite,
            hash_ref: created.hash_ref.clone(),
            expires_at_secs,
            consumed: false,
        })?;

        // The bundle must be durable before the package is offered: a
        // Welcome against a bundle we lost is undecryptable.
        let blob = {
            let engine = self.engine.lock().await;
            engine.snapshot().map_err(CoreError::DeviceKeyMaterial)?
        };
        self.store.put_blob(self.principal, ENGINE_STATE_BLOB, &blob)?;

        self.client
            .run(OperationKey::PublishKeyPackage { hash_ref: created.hash_ref.clone() }, |token| {
                self.client.inner().publish_key_package(
                    KeyPackageAd {
                        bytes: created.bytes.clone(),
                        hash_ref: created.hash_ref.clone(),
                        expires_at_secs,
                    },
                    token,
                )
            })
            .await?;

        Ok(created.hash_ref)
    }

    /// Delete cached messages received before the cutoff.
    pub fn expire_messages(&self, cutoff_secs: u64) -> Result<u64, CoreError> {
        Ok(self.store.delete_messages_older_than(self.principal, cutoff_secs)?)
    }
}

fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}
