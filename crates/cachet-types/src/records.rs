//! Persisted entity records.
//!
//! One struct per stored collection. The ciphertext of a message is the
//! authoritative artifact; cached plaintext is derived state that can be
//! recomputed at any time. Protocol state enums (`WelcomePhase`,
//! `RecoveryPhase`) are persisted on every transition so both protocols
//! survive a process restart mid-flight.

use serde::{Deserialize, Serialize};

use crate::ids::{ConvoId, DeviceId, IdempotencyKey, PrincipalId};

/// Lifecycle phase of a conversation.
///
/// `Left` and `Removed` are terminal: the local group state has been
/// destroyed and only the conversation record (and retained messages)
/// remain until retention cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversationPhase {
    /// Record exists but the engine group has not finished initializing.
    Created,
    /// Group is live; messages can be sent and received.
    Active,
    /// We left the conversation voluntarily.
    Left,
    /// We were removed by another member's commit.
    Removed,
}

/// A conversation and its current cryptographic position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRecord {
    /// Conversation identifier.
    pub convo: ConvoId,
    /// Current epoch. Monotonically increasing; advances on every commit.
    pub epoch: u64,
    /// Cipher suite identifier the group was created with.
    pub cipher_suite: u16,
    /// Lifecycle phase.
    pub phase: ConversationPhase,
    /// Next outbound message sequence number.
    pub next_seq: u64,
    /// Unix seconds when the conversation record was created.
    pub created_at_secs: u64,
}

/// One member device of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRecord {
    /// Conversation this membership belongs to.
    pub convo: ConvoId,
    /// Member's principal.
    pub principal: PrincipalId,
    /// Member's device.
    pub device: DeviceId,
    /// Hash reference of the key package the member joined with.
    pub key_package_ref: Vec<u8>,
    /// Unix seconds when the member joined.
    pub joined_at_secs: u64,
    /// Unix seconds when the member left. `None` while still a member.
    pub left_at_secs: Option<u64>,
}

/// A published, single-use key package.
///
/// A key package may be consumed by exactly one commit. Attempting to reuse
/// a consumed package is an error, never a silent no-op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPackageRecord {
    /// Principal the package belongs to.
    pub principal: PrincipalId,
    /// Device the package belongs to.
    pub device: DeviceId,
    /// Cipher suite of the package.
    pub cipher_suite: u16,
    /// Hash reference identifying the package.
    pub hash_ref: Vec<u8>,
    /// Unix seconds after which the package must not be used.
    pub expires_at_secs: u64,
    /// Whether a commit has consumed this package.
    pub consumed: bool,
}

/// An application message sealed under an epoch-derived key.
///
/// The wire representation of message content. `epoch` selects the secret,
/// `seq` and the random suffix make the nonce unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedMessage {
    /// Epoch whose secret sealed this message.
    pub epoch: u64,
    /// Sequence number within the conversation.
    pub seq: u64,
    /// 24-byte XChaCha20 nonce.
    pub nonce: [u8; 24],
    /// Ciphertext including the 16-byte Poly1305 tag.
    pub ciphertext: Vec<u8>,
}

/// A stored message: authoritative ciphertext plus derived caches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Conversation the message belongs to.
    pub convo: ConvoId,
    /// Epoch the message was sealed under.
    pub epoch: u64,
    /// Sequence number within the conversation.
    pub seq: u64,
    /// Sealed wire form. Authoritative; never discarded while retained.
    pub sealed: SealedMessage,
    /// Cached plaintext. Recomputable from `sealed` while the epoch secret
    /// is retained; absent means decrypt-on-read.
    pub plaintext: Option<Vec<u8>>,
    /// Cached structured-embed payload, if the message carried one.
    pub embed: Option<Vec<u8>>,
    /// Unix seconds when the message was stored.
    pub received_at_secs: u64,
}

/// Retained secret material for one (conversation, epoch) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochKeyRecord {
    /// Conversation the secret belongs to.
    pub convo: ConvoId,
    /// Epoch the secret was exported at.
    pub epoch: u64,
    /// 32 bytes of exported secret material.
    pub secret: Vec<u8>,
    /// Unix seconds when the secret was recorded.
    pub created_at_secs: u64,
    /// Marked by the first pruning step. Tombstoned secrets still serve
    /// in-flight reads until the second step deletes them.
    pub tombstoned: bool,
}

/// Admission state of a received Welcome.
///
/// `Joined` and `Failed` record the durable Phase 1 outcome; a crash after
/// either only re-attempts Phase 2 with that recorded outcome, never
/// Phase 1 (which would consume another single-use key package).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WelcomePhase {
    /// Invitation stored, not yet processed.
    Received,
    /// Phase 1 in progress against the engine.
    Processing,
    /// Phase 1 succeeded; local group state exists. Awaiting Phase 2.
    Joined,
    /// Phase 1 failed. Awaiting Phase 2 failure report.
    Failed {
        /// Why local processing failed.
        reason: String,
        /// Whether the failure was missing local key material, which should
        /// trigger the recovery flow after the failure is reported.
        desync: bool,
    },
    /// Terminal: server acknowledged successful admission.
    Confirmed,
    /// Terminal: server was told processing failed; local state rolled back.
    ReportedFailed,
}

impl WelcomePhase {
    /// Whether this phase is terminal (record can be discarded).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed | Self::ReportedFailed)
    }
}

/// A pending invitation and its admission progress.
///
/// Lives only until the admission protocol reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WelcomeRecord {
    /// Conversation the invitation admits us to.
    pub convo: ConvoId,
    /// Serialized invitation payload.
    pub payload: Vec<u8>,
    /// Unix seconds when the invitation arrived.
    pub arrived_at_secs: u64,
    /// Current admission phase.
    pub phase: WelcomePhase,
    /// Idempotency token for the Phase 2 confirmation call. Persisted so a
    /// post-restart retry reuses the original token.
    pub confirm_token: IdempotencyKey,
}

/// Progress of a key-package recovery (guided rejoin).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryPhase {
    /// Missing local key material detected; recovery not yet started.
    DesyncDetected,
    /// Rejoin request in flight.
    InProgress,
    /// Terminal failure of this attempt. Retryable: a new run reuses the
    /// same rejoin token.
    Failed {
        /// Why the attempt did not complete.
        reason: String,
    },
}

/// Persisted state of one conversation's recovery flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryRecord {
    /// Conversation being recovered.
    pub convo: ConvoId,
    /// Current phase.
    pub phase: RecoveryPhase,
    /// Idempotency token for the rejoin request.
    pub rejoin_token: IdempotencyKey,
    /// How many times recovery has been attempted.
    pub attempts: u32,
    /// Unix seconds when desync was first detected.
    pub detected_at_secs: u64,
}
