//! Wire-level network operations.
//!
//! The core does not implement a transport. It consumes [`NetworkClient`],
//! an async trait covering every server call the orchestration layer makes.
//! All state-mutating calls carry a client-generated idempotency token; the
//! server treats a replayed token as a no-op, and
//! [`crate::idempotency::IdempotentClient`] guarantees the same token is
//! reused across retries of the same logical operation.

use std::time::Duration;

use async_trait::async_trait;
use cachet_types::{ConvoId, IdempotencyKey, MemberRef, SealedMessage};
use thiserror::Error;

/// Network-layer errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetError {
    /// The request did not complete in time. Not a failure for idempotency
    /// purposes: the next attempt reuses the same token.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Transport-level failure (connection refused, reset, DNS).
    #[error("transport failure: {0}")]
    Transport(String),

    /// The server understood and refused the request. Permanent.
    #[error("server rejected request: {0}")]
    Rejected(String),
}

impl NetError {
    /// Whether retrying the same request (same token) can succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }
}

/// Payload for `create_conversation`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationInit {
    /// Conversation being created.
    pub convo: ConvoId,
    /// Members added by the initial commit.
    pub members: Vec<MemberRef>,
    /// Serialized commit.
    pub commit: Vec<u8>,
    /// Serialized welcome for the initial members. Empty when the group
    /// starts with only the creator.
    pub welcome: Option<Vec<u8>>,
}

/// Payload for membership-changing calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipChange {
    /// Conversation being changed.
    pub convo: ConvoId,
    /// Members added by the commit.
    pub added: Vec<MemberRef>,
    /// Members removed by the commit.
    pub removed: Vec<MemberRef>,
    /// Serialized commit.
    pub commit: Vec<u8>,
    /// Serialized welcome for added members, when the commit adds any.
    pub welcome: Option<Vec<u8>>,
}

/// Payload for `send_message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Destination conversation.
    pub convo: ConvoId,
    /// Epoch the payload was sealed under.
    pub epoch: u64,
    /// Sequence number assigned by the sender.
    pub seq: u64,
    /// Sealed payload.
    pub sealed: SealedMessage,
}

/// Payload for `publish_key_package`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPackageAd {
    /// Serialized key package.
    pub bytes: Vec<u8>,
    /// Hash reference of the package.
    pub hash_ref: Vec<u8>,
    /// Unix seconds after which the server should stop offering it.
    pub expires_at_secs: u64,
}

/// Phase 2 outcome reported by the welcome admission protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WelcomeOutcome {
    /// Local processing succeeded; membership is final.
    Success,
    /// Local processing failed; the server should release the slot.
    Failure {
        /// Why processing failed.
        reason: String,
    },
}

/// Why a device is asking to rejoin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejoinReason {
    /// Local group state was lost (reinstall, storage wipe).
    LocalStateLost,
    /// The welcome for this conversation could not be decrypted.
    WelcomeUndecryptable,
    /// Any other cause, described.
    Other(String),
}

/// Server response to a rejoin request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejoinGrant {
    /// Fresh welcome admitting the device back into the conversation.
    pub welcome: Vec<u8>,
}

/// The server calls the orchestration layer makes.
///
/// Implementations may time requests out; a timeout is reported as
/// [`NetError::Timeout`] and the caller retries with the same token.
#[async_trait]
pub trait NetworkClient: Send + Sync {
    /// Create a conversation with its initial commit and welcome.
    async fn create_conversation(
        &self,
        init: ConversationInit,
        token: IdempotencyKey,
    ) -> Result<(), NetError>;

    /// Announce a member-adding commit.
    async fn add_members(
        &self,
        change: MembershipChange,
        token: IdempotencyKey,
    ) -> Result<(), NetError>;

    /// Announce a member-removing commit.
    async fn remove_members(
        &self,
        change: MembershipChange,
        token: IdempotencyKey,
    ) -> Result<(), NetError>;

    /// Send a sealed application message.
    async fn send_message(
        &self,
        message: OutboundMessage,
        token: IdempotencyKey,
    ) -> Result<(), NetError>;

    /// Publish a single-use key package.
    async fn publish_key_package(
        &self,
        ad: KeyPackageAd,
        token: IdempotencyKey,
    ) -> Result<(), NetError>;

    /// Report the outcome of processing a welcome (Phase 2 of admission).
    async fn confirm_welcome(
        &self,
        convo: ConvoId,
        outcome: WelcomeOutcome,
        token: IdempotencyKey,
    ) -> Result<(), NetError>;

    /// Request readmission to a conversation with a fresh key package.
    async fn request_rejoin(
        &self,
        convo: ConvoId,
        key_package: Vec<u8>,
        reason: RejoinReason,
        token: IdempotencyKey,
    ) -> Result<RejoinGrant, NetError>;
}
