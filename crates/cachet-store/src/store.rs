//! Storage abstraction for the messaging core.
//!
//! Typed per-collection operations instead of a generic key-value surface,
//! so callers cannot mix record types or forget the principal scope. Must be
//! `Clone` (handles are shared across state machines), `Send + Sync`, and
//! synchronous. Implementations share internal state via `Arc`, so clones
//! access the same underlying storage.

use cachet_types::{
    ConversationRecord, ConvoId, EpochKeyRecord, KeyPackageRecord, MemberRecord, MessageRecord,
    PrincipalId, RecoveryRecord, WelcomeRecord,
};
use serde::{Serialize, de::DeserializeOwned};

use crate::error::StorageError;

/// CBOR-encode a record for storage.
pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(value, &mut bytes)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(bytes)
}

/// Decode a CBOR record read back from storage.
pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    ciborium::de::from_reader(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}

/// Storage abstraction for all persisted collections.
///
/// Every write is atomic from a reader's point of view: an operation either
/// fully replaces the record or leaves the previous value intact. There is
/// no partial write visible to readers.
pub trait Store: Clone + Send + Sync + 'static {
    // --- conversations -----------------------------------------------------

    /// Insert or replace a conversation record.
    fn put_conversation(
        &self,
        principal: PrincipalId,
        record: &ConversationRecord,
    ) -> Result<(), StorageError>;

    /// Load a conversation record. `None` if it does not exist.
    fn conversation(
        &self,
        principal: PrincipalId,
        convo: ConvoId,
    ) -> Result<Option<ConversationRecord>, StorageError>;

    /// Delete a conversation record. Deleting a missing record is a no-op.
    fn delete_conversation(
        &self,
        principal: PrincipalId,
        convo: ConvoId,
    ) -> Result<(), StorageError>;

    /// List every conversation owned by the principal.
    fn conversations(
        &self,
        principal: PrincipalId,
    ) -> Result<Vec<ConversationRecord>, StorageError>;

    // --- members -----------------------------------------------------------

    /// Insert or replace a member record.
    fn put_member(&self, principal: PrincipalId, record: &MemberRecord)
    -> Result<(), StorageError>;

    /// All member records of a conversation, in key order.
    fn members(
        &self,
        principal: PrincipalId,
        convo: ConvoId,
    ) -> Result<Vec<MemberRecord>, StorageError>;

    // --- key packages ------------------------------------------------------

    /// Insert or replace a key package record, keyed by its hash reference.
    fn put_key_package(
        &self,
        principal: PrincipalId,
        record: &KeyPackageRecord,
    ) -> Result<(), StorageError>;

    /// Load a key package record by hash reference.
    fn key_package(
        &self,
        principal: PrincipalId,
        hash_ref: &[u8],
    ) -> Result<Option<KeyPackageRecord>, StorageError>;

    // --- messages ----------------------------------------------------------

    /// Insert or replace a message record.
    fn put_message(
        &self,
        principal: PrincipalId,
        record: &MessageRecord,
    ) -> Result<(), StorageError>;

    /// Load one message by sequence number.
    fn message(
        &self,
        principal: PrincipalId,
        convo: ConvoId,
        seq: u64,
    ) -> Result<Option<MessageRecord>, StorageError>;

    /// Load messages in range `[from_seq, from_seq + limit)` sequence order.
    fn messages(
        &self,
        principal: PrincipalId,
        convo: ConvoId,
        from_seq: u64,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StorageError>;

    /// Delete messages received before `cutoff_secs`, across all of the
    /// principal's conversations. Returns how many were removed.
    fn delete_messages_older_than(
        &self,
        principal: PrincipalId,
        cutoff_secs: u64,
    ) -> Result<u64, StorageError>;

    // --- epoch secrets -----------------------------------------------------

    /// Insert or replace an epoch secret record.
    fn put_epoch_key(
        &self,
        principal: PrincipalId,
        record: &EpochKeyRecord,
    ) -> Result<(), StorageError>;

    /// Load one epoch secret record.
    fn epoch_key(
        &self,
        principal: PrincipalId,
        convo: ConvoId,
        epoch: u64,
    ) -> Result<Option<EpochKeyRecord>, StorageError>;

    /// All epoch secret records for a conversation, epoch order.
    fn epoch_keys(
        &self,
        principal: PrincipalId,
        convo: ConvoId,
    ) -> Result<Vec<EpochKeyRecord>, StorageError>;

    /// Delete one epoch secret record. Missing records are a no-op.
    fn delete_epoch_key(
        &self,
        principal: PrincipalId,
        convo: ConvoId,
        epoch: u64,
    ) -> Result<(), StorageError>;

    // --- opaque blobs ------------------------------------------------------

    /// Insert or replace a named opaque blob (engine state snapshots).
    fn put_blob(
        &self,
        principal: PrincipalId,
        name: &str,
        bytes: &[u8],
    ) -> Result<(), StorageError>;

    /// Load a named blob. `None` if absent.
    fn blob(&self, principal: PrincipalId, name: &str) -> Result<Option<Vec<u8>>, StorageError>;

    // --- pending welcomes --------------------------------------------------

    /// Insert or replace the pending welcome for a conversation.
    fn put_welcome(
        &self,
        principal: PrincipalId,
        record: &WelcomeRecord,
    ) -> Result<(), StorageError>;

    /// Load the pending welcome for a conversation.
    fn welcome(
        &self,
        principal: PrincipalId,
        convo: ConvoId,
    ) -> Result<Option<WelcomeRecord>, StorageError>;

    /// Remove the pending welcome for a conversation.
    fn delete_welcome(&self, principal: PrincipalId, convo: ConvoId) -> Result<(), StorageError>;

    /// All pending welcomes for the principal (restart resume).
    fn welcomes(&self, principal: PrincipalId) -> Result<Vec<WelcomeRecord>, StorageError>;

    // --- recovery states ---------------------------------------------------

    /// Insert or replace the recovery record for a conversation.
    fn put_recovery(
        &self,
        principal: PrincipalId,
        record: &RecoveryRecord,
    ) -> Result<(), StorageError>;

    /// Load the recovery record for a conversation.
    fn recovery(
        &self,
        principal: PrincipalId,
        convo: ConvoId,
    ) -> Result<Option<RecoveryRecord>, StorageError>;

    /// Remove the recovery record for a conversation.
    fn delete_recovery(&self, principal: PrincipalId, convo: ConvoId) -> Result<(), StorageError>;

    /// All in-flight recovery records for the principal (restart resume).
    fn recoveries(&self, principal: PrincipalId) -> Result<Vec<RecoveryRecord>, StorageError>;
}
