//! The external cryptographic engine interface.
//!
//! The core does not implement the group-key ratchet. It consumes an engine
//! through [`GroupEngine`]: a narrow, synchronous trait covering group
//! creation, commit staging and merging, welcome processing, key package
//! creation, and epoch secret export. The production implementation is
//! [`MlsEngine`], an adapter over OpenMLS.
//!
//! Commit handling is deliberately two-step (stage, then merge) so the
//! orchestrator can durably record the pre-advance epoch secret between the
//! steps. The ordering invariant lives in the orchestrator; the engine only
//! provides the seam.

mod mls;

use cachet_types::{ConvoId, MemberRef};
use thiserror::Error;

pub use mls::MlsEngine;

/// Errors produced by the cryptographic engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The engine has no state for this group.
    #[error("group not found: {0}")]
    GroupNotFound(ConvoId),

    /// `merge_pending_commit` without a staged own commit.
    #[error("no pending commit for group {0}")]
    NoPendingCommit(ConvoId),

    /// `merge_staged_commit` without a staged remote commit.
    #[error("no staged commit for group {0}")]
    NoStagedCommit(ConvoId),

    /// A key package failed deserialization or signature validation.
    #[error("invalid key package: {0}")]
    InvalidKeyPackage(String),

    /// No local key package bundle matches the Welcome.
    ///
    /// The signature of local state loss (reinstall, storage wipe): the
    /// welcome admission protocol maps this to a key-package desync and
    /// triggers recovery.
    #[error("no matching key package for welcome: {0}")]
    NoMatchingKeyPackage(String),

    /// Cryptographic operation failed.
    #[error("crypto failure: {0}")]
    Crypto(String),

    /// Wire or state (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Snapshot or restore of engine state failed.
    #[error("state snapshot error: {0}")]
    Snapshot(String),
}

/// A commit built by the engine but not yet merged.
///
/// The epoch does not advance until [`GroupEngine::merge_pending_commit`] is
/// called; until then the commit can be abandoned with
/// [`GroupEngine::clear_pending_commit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitBundle {
    /// Serialized commit message for the server.
    pub commit: Vec<u8>,
    /// Serialized welcome for newly added members, when the commit adds any.
    pub welcome: Option<Vec<u8>>,
    /// Epoch the group will be at once the commit is merged.
    pub target_epoch: u64,
}

/// A freshly created single-use key package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedKeyPackage {
    /// Serialized key package for publication.
    pub bytes: Vec<u8>,
    /// Hash reference identifying the package.
    pub hash_ref: Vec<u8>,
    /// Cipher suite the package was built for.
    pub cipher_suite: u16,
}

/// Result of processing a Welcome: the group we just joined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinedGroup {
    /// Conversation the welcome admitted us to.
    pub convo: ConvoId,
    /// Epoch at the time of joining.
    pub epoch: u64,
    /// Member devices visible in the ratchet tree.
    pub members: Vec<MemberRef>,
}

/// What a protocol message turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolOutcome {
    /// A remote commit was staged. The caller records the current epoch's
    /// secret, then calls [`GroupEngine::merge_staged_commit`].
    StagedCommit {
        /// Epoch the group is at before the staged commit merges.
        current_epoch: u64,
    },
    /// A proposal was received and queued inside the engine.
    Proposal,
    /// An application message surfaced through the engine's own ratchet.
    Application {
        /// Sending member.
        sender: MemberRef,
        /// Decrypted payload.
        plaintext: Vec<u8>,
    },
}

/// Result of merging a staged remote commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Epoch after the merge.
    pub epoch: u64,
    /// Whether we are still a member. `false` means the commit removed us.
    pub active: bool,
}

/// The cryptographic engine consumed by the orchestration core.
///
/// One engine instance per local (principal, device). Synchronous: callers
/// run engine work on worker tasks and serialize per-group access.
pub trait GroupEngine: Send {
    /// Create a new group for `convo` at epoch 0.
    fn create_group(
        &mut self,
        convo: ConvoId,
        config: &cachet_types::GroupConfig,
    ) -> Result<u64, EngineError>;

    /// Create a fresh single-use key package for the local device.
    fn create_key_package(&mut self) -> Result<CreatedKeyPackage, EngineError>;

    /// Build (but do not merge) a commit adding the given key packages.
    fn add_members(
        &mut self,
        convo: ConvoId,
        key_packages: &[Vec<u8>],
    ) -> Result<CommitBundle, EngineError>;

    /// Build (but do not merge) a commit removing the given members.
    fn remove_members(
        &mut self,
        convo: ConvoId,
        members: &[MemberRef],
    ) -> Result<CommitBundle, EngineError>;

    /// Merge our own pending commit, advancing the epoch.
    fn merge_pending_commit(&mut self, convo: ConvoId) -> Result<u64, EngineError>;

    /// Abandon our own pending commit without advancing.
    fn clear_pending_commit(&mut self, convo: ConvoId) -> Result<(), EngineError>;

    /// Process an incoming protocol message (commit or proposal).
    fn process_protocol_message(
        &mut self,
        convo: ConvoId,
        message: &[u8],
    ) -> Result<ProtocolOutcome, EngineError>;

    /// Merge a previously staged remote commit, advancing the epoch.
    fn merge_staged_commit(&mut self, convo: ConvoId) -> Result<MergeOutcome, EngineError>;

    /// Process a Welcome, creating local state for the joined group.
    fn process_welcome(
        &mut self,
        welcome: &[u8],
        config: &cachet_types::GroupConfig,
    ) -> Result<JoinedGroup, EngineError>;

    /// Export the current epoch's 32-byte secret for `convo`.
    fn export_epoch_secret(&mut self, convo: ConvoId) -> Result<Vec<u8>, EngineError>;

    /// Current epoch of `convo`.
    fn current_epoch(&self, convo: ConvoId) -> Result<u64, EngineError>;

    /// Member devices currently in the group.
    fn group_members(&self, convo: ConvoId) -> Result<Vec<MemberRef>, EngineError>;

    /// Whether the engine holds state for `convo`.
    fn has_group(&self, convo: ConvoId) -> bool;

    /// Destroy local state for `convo`. Missing groups are a no-op.
    fn delete_group(&mut self, convo: ConvoId) -> Result<(), EngineError>;

    /// Serialize all engine state into an opaque blob for the store.
    fn snapshot(&self) -> Result<Vec<u8>, EngineError>;

    /// Restore engine state from a blob produced by [`Self::snapshot`].
    fn restore(&mut self, blob: &[u8]) -> Result<(), EngineError>;
}
