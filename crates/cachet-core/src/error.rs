//! Error taxonomy for the messaging core.
//!
//! Strongly-typed errors carrying enough context (conversation, epoch,
//! sequence) to drive recovery decisions. Engine errors are never swallowed:
//! they propagate inside [`CoreError::Engine`] with the conversation that
//! triggered them.
//!
//! Two classification helpers drive caller policy: [`CoreError::is_permanent`]
//! marks errors that must not be retried (the data is gone), and
//! [`CoreError::is_retryable`] marks errors where the same logical operation
//! may be attempted again.

use cachet_store::StorageError;
use cachet_types::ConvoId;
use thiserror::Error;

use crate::{engine::EngineError, net::NetError};

/// Errors surfaced by the orchestration core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// The epoch secret needed to decrypt a historical message is gone.
    ///
    /// Permanent for that specific message: the secret was pruned or never
    /// recorded, and no amount of retrying brings it back.
    #[error("epoch secret missing for conversation {convo} epoch {epoch}")]
    EpochSecretMissing {
        /// Conversation the message belongs to.
        convo: ConvoId,
        /// Epoch whose secret is missing.
        epoch: u64,
        /// Sequence number of the affected message, when known.
        seq: Option<u64>,
    },

    /// Required local key material is absent (storage loss, reinstall).
    ///
    /// Retryable through [`crate::recovery::KeyPackageRecoveryFlow`].
    #[error("key material desynchronized for conversation {convo}: {reason}")]
    KeyPackageDesync {
        /// Conversation that detected the desync.
        convo: ConvoId,
        /// What was missing.
        reason: String,
    },

    /// A single-use key package was offered to a second commit.
    #[error("key package already consumed: {hash_ref_hex}")]
    KeyPackageConsumed {
        /// Hex hash reference of the consumed package.
        hash_ref_hex: String,
    },

    /// Phase 1 of welcome admission failed; the failure was (or will be)
    /// reported to the server and local state rolled back.
    #[error("welcome processing failed for conversation {convo}: {reason}")]
    WelcomeProcessingFailed {
        /// Conversation the invitation was for.
        convo: ConvoId,
        /// Why local processing failed.
        reason: String,
    },

    /// Storage failed and the one-shot repair path was exhausted.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Other storage failure (serialization, sealed-value authentication).
    #[error(transparent)]
    Storage(StorageError),

    /// A state-mutating network call failed after bounded retries.
    ///
    /// The idempotency token for the operation is retained, so a later
    /// retry of the same logical operation reuses it.
    #[error("network failure: {0}")]
    Network(#[from] NetError),

    /// The persist-before-advance ordering invariant would have been
    /// violated. The triggering operation was aborted before any
    /// epoch-changing engine call executed.
    #[error("commit ordering violation for conversation {convo}: {detail}")]
    CommitOrderingViolation {
        /// Conversation whose transition was aborted.
        convo: ConvoId,
        /// Which precondition failed.
        detail: String,
    },

    /// A rejoin attempt did not complete. Distinct from
    /// [`CoreError::EpochSecretMissing`]: the data may still exist, only the
    /// attempt to re-establish membership failed. Retryable.
    #[error("recovery failed for conversation {convo}: {reason}")]
    RecoveryFailed {
        /// Conversation being recovered.
        convo: ConvoId,
        /// Why the attempt did not complete.
        reason: String,
    },

    /// Cryptographic engine error, with the conversation for context.
    #[error("engine error for conversation {convo}: {source}")]
    Engine {
        /// Conversation the engine call was about.
        convo: ConvoId,
        /// The underlying engine error.
        source: EngineError,
    },

    /// Engine failure while creating or restoring device-level state
    /// (key packages, snapshots) outside any conversation scope.
    #[error("device key material error: {0}")]
    DeviceKeyMaterial(EngineError),

    /// The conversation is unknown to this principal.
    #[error("unknown conversation {0}")]
    UnknownConversation(ConvoId),

    /// A conversation with this identifier already exists locally.
    #[error("conversation {0} already exists")]
    ConversationExists(ConvoId),

    /// The conversation is in a terminal phase and cannot be operated on.
    #[error("conversation {0} has been left or removed")]
    ConversationClosed(ConvoId),
}

impl CoreError {
    /// Errors that must never be retried: the outcome will not change.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::EpochSecretMissing { .. }
                | Self::KeyPackageConsumed { .. }
                | Self::CommitOrderingViolation { .. }
                | Self::WelcomeProcessingFailed { .. }
                | Self::ConversationClosed(_)
        )
    }

    /// Errors where retrying the same logical operation can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::RecoveryFailed { .. } | Self::KeyPackageDesync { .. }
        )
    }
}

impl From<StorageError> for CoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Unavailable(msg) => Self::StorageUnavailable(msg),
            other => Self::Storage(other),
        }
    }
}
