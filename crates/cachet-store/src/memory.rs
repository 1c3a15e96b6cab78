//! In-memory storage implementation for tests.
//!
//! Same key layout as the durable store but no value sealing — this is a
//! test double for orchestration logic, not a place secrets should live.

use std::{
    collections::BTreeMap,
    ops::Bound,
    sync::{Arc, RwLock},
};

use cachet_types::{
    ConversationRecord, ConvoId, EpochKeyRecord, KeyPackageRecord, MemberRecord, MessageRecord,
    PrincipalId, RecoveryRecord, WelcomeRecord,
};
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    error::StorageError,
    keys,
    store::{Store, decode, encode},
};

type Table = BTreeMap<Vec<u8>, Vec<u8>>;

#[derive(Default)]
struct Tables {
    conversations: Table,
    members: Table,
    key_packages: Table,
    messages: Table,
    epoch_keys: Table,
    blobs: Table,
    welcomes: Table,
    recoveries: Table,
}

/// In-memory storage. Clones share the same underlying maps.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> Result<T, StorageError> {
        let guard = self
            .tables
            .read()
            .map_err(|_| StorageError::Unavailable("memory store lock poisoned".to_string()))?;
        Ok(f(&guard))
    }

    fn write<T>(&self, f: impl FnOnce(&mut Tables) -> T) -> Result<T, StorageError> {
        let mut guard = self
            .tables
            .write()
            .map_err(|_| StorageError::Unavailable("memory store lock poisoned".to_string()))?;
        Ok(f(&mut guard))
    }
}

fn put<T: Serialize>(table: &mut Table, key: Vec<u8>, record: &T) -> Result<(), StorageError> {
    let bytes = encode(record)?;
    table.insert(key, bytes);
    Ok(())
}

fn get<T: DeserializeOwned>(table: &Table, key: &[u8]) -> Result<Option<T>, StorageError> {
    table.get(key).map(|bytes| decode(bytes)).transpose()
}

fn scan<T: DeserializeOwned>(
    table: &Table,
    start: &[u8],
    end: Option<&[u8]>,
    limit: usize,
) -> Result<Vec<T>, StorageError> {
    let upper = match end {
        Some(end) => Bound::Excluded(end.to_vec()),
        None => Bound::Unbounded,
    };
    table
        .range((Bound::Included(start.to_vec()), upper))
        .take(limit)
        .map(|(_, bytes)| decode(bytes))
        .collect()
}

impl Store for MemoryStore {
    fn put_conversation(
        &self,
        principal: PrincipalId,
        record: &ConversationRecord,
    ) -> Result<(), StorageError> {
        let key = keys::convo_key(principal, record.convo).to_vec();
        self.write(|t| put(&mut t.conversations, key, record))?
    }

    fn conversation(
        &self,
        principal: PrincipalId,
        convo: ConvoId,
    ) -> Result<Option<ConversationRecord>, StorageError> {
        let key = keys::convo_key(principal, convo);
        self.read(|t| get(&t.conversations, &key))?
    }

    fn delete_conversation(
        &self,
        principal: PrincipalId,
        convo: ConvoId,
    ) -> Result<(), StorageError> {
        let key = keys::convo_key(principal, convo);
        self.write(|t| {
            t.conversations.remove(key.as_slice());
        })
    }

    fn conversations(
        &self,
        principal: PrincipalId,
    ) -> Result<Vec<ConversationRecord>, StorageError> {
        let (start, end) = keys::principal_scan(principal);
        self.read(|t| scan(&t.conversations, &start, end.as_deref(), usize::MAX))?
    }

    fn put_member(
        &self,
        principal: PrincipalId,
        record: &MemberRecord,
    ) -> Result<(), StorageError> {
        let member = cachet_types::MemberRef { principal: record.principal, device: record.device };
        let key = keys::member_key(principal, record.convo, member).to_vec();
        self.write(|t| put(&mut t.members, key, record))?
    }

    fn members(
        &self,
        principal: PrincipalId,
        convo: ConvoId,
    ) -> Result<Vec<MemberRecord>, StorageError> {
        let (start, end) = keys::convo_scan(principal, convo);
        self.read(|t| scan(&t.members, &start, end.as_deref(), usize::MAX))?
    }

    fn put_key_package(
        &self,
        principal: PrincipalId,
        record: &KeyPackageRecord,
    ) -> Result<(), StorageError> {
        let key = keys::hash_ref_key(principal, &record.hash_ref);
        self.write(|t| put(&mut t.key_packages, key, record))?
    }

    fn key_package(
        &self,
        principal: PrincipalId,
        hash_ref: &[u8],
    ) -> Result<Option<KeyPackageRecord>, StorageError> {
        let key = keys::hash_ref_key(principal, hash_ref);
        self.read(|t| get(&t.key_packages, &key))?
    }

    fn put_message(
        &self,
        principal: PrincipalId,
        record: &MessageRecord,
    ) -> Result<(), StorageError> {
        let key = keys::message_key(principal, record.convo, record.seq).to_vec();
        self.write(|t| put(&mut t.messages, key, record))?
    }

    fn message(
        &self,
        principal: PrincipalId,
        convo: ConvoId,
        seq: u64,
    ) -> Result<Option<MessageRecord>, StorageError> {
        let key = keys::message_key(principal, convo, seq);
        self.read(|t| get(&t.messages, &key))?
    }

    fn messages(
        &self,
        principal: PrincipalId,
        convo: ConvoId,
        from_seq: u64,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StorageError> {
        let start = keys::message_key(principal, convo, from_seq);
        let (_, end) = keys::convo_scan(principal, convo);
        self.read(|t| scan(&t.messages, &start, end.as_deref(), limit))?
    }

    fn delete_messages_older_than(
        &self,
        principal: PrincipalId,
        cutoff_secs: u64,
    ) -> Result<u64, StorageError> {
        let (start, end) = keys::principal_scan(principal);
        let candidates: Vec<MessageRecord> =
            self.read(|t| scan(&t.messages, &start, end.as_deref(), usize::MAX))??;

        let expired: Vec<Vec<u8>> = candidates
            .iter()
            .filter(|m| m.received_at_secs < cutoff_secs)
            .map(|m| keys::message_key(principal, m.convo, m.seq).to_vec())
            .collect();
        let removed = expired.len() as u64;

        self.write(|t| {
            for key in &expired {
                t.messages.remove(key);
            }
        })?;

        Ok(removed)
    }

    fn put_epoch_key(
        &self,
        principal: PrincipalId,
        record: &EpochKeyRecord,
    ) -> Result<(), StorageError> {
        let key = keys::epoch_key(principal, record.convo, record.epoch).to_vec();
        self.write(|t| put(&mut t.epoch_keys, key, record))?
    }

    fn epoch_key(
        &self,
        principal: PrincipalId,
        convo: ConvoId,
        epoch: u64,
    ) -> Result<Option<EpochKeyRecord>, StorageError> {
        let key = keys::epoch_key(principal, convo, epoch);
        self.read(|t| get(&t.epoch_keys, &key))?
    }

    fn epoch_keys(
        &self,
        principal: PrincipalId,
        convo: ConvoId,
    ) -> Result<Vec<EpochKeyRecord>, StorageError> {
        let (start, end) = keys::convo_scan(principal, convo);
        self.read(|t| scan(&t.epoch_keys, &start, end.as_deref(), usize::MAX))?
    }

    fn delete_epoch_key(
        &self,
        principal: PrincipalId,
        convo: ConvoId,
        epoch: u64,
    ) -> Result<(), StorageError> {
        let key = keys::epoch_key(principal, convo, epoch);
        self.write(|t| {
            t.epoch_keys.remove(key.as_slice());
        })
    }

    fn put_blob(
        &self,
        principal: PrincipalId,
        name: &str,
        bytes: &[u8],
    ) -> Result<(), StorageError> {
        let key = keys::blob_key(principal, name);
        self.write(|t| {
            t.blobs.insert(key, bytes.to_vec());
        })
    }

    fn blob(&self, principal: PrincipalId, name: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let key = keys::blob_key(principal, name);
        self.read(|t| t.blobs.get(&key).cloned())
    }

    fn put_welcome(
        &self,
        principal: PrincipalId,
        record: &WelcomeRecord,
    ) -> Result<(), StorageError> {
        let key = keys::convo_key(principal, record.convo).to_vec();
        self.write(|t| put(&mut t.welcomes, key, record))?
    }

    fn welcome(
        &self,
        principal: PrincipalId,
        convo: ConvoId,
    ) -> Result<Option<WelcomeRecord>, StorageError> {
        let key = keys::convo_key(principal, convo);
        self.read(|t| get(&t.welcomes, &key))?
    }

    fn delete_welcome(&self, principal: PrincipalId, convo: ConvoId) -> Result<(), StorageError> {
        let key = keys::convo_key(principal, convo);
        self.write(|t| {
            t.welcomes.remove(key.as_slice());
        })
    }

    fn welcomes(&self, principal: PrincipalId) -> Result<Vec<WelcomeRecord>, StorageError> {
        let (start, end) = keys::principal_scan(principal);
        self.read(|t| scan(&t.welcomes, &start, end.as_deref(), usize::MAX))?
    }

    fn put_recovery(
        &self,
        principal: PrincipalId,
        record: &RecoveryRecord,
    ) -> Result<(), StorageError> {
        let key = keys::convo_key(principal, record.convo).to_vec();
        self.write(|t| put(&mut t.recoveries, key, record))?
    }

    fn recovery(
        &self,
        principal: PrincipalId,
        convo: ConvoId,
    ) -> Result<Option<RecoveryRecord>, StorageError> {
        let key = keys::convo_key(principal, convo);
        self.read(|t| get(&t.recoveries, &key))?
    }

    fn delete_recovery(&self, principal: PrincipalId, convo: ConvoId) -> Result<(), StorageError> {
        let key = keys::convo_key(principal, convo);
        self.write(|t| {
            t.recoveries.remove(key.as_slice());
        })
    }

    fn recoveries(&self, principal: PrincipalId) -> Result<Vec<RecoveryRecord>, StorageError> {
        let (start, end) = keys::principal_scan(principal);
        self.read(|t| scan(&t.recoveries, &start, end.as_deref(), usize::MAX))?
    }
}

#[cfg(test)]
mod tests {
    use cachet_types::ConversationPhase;

    use super::*;

    fn sample_conversation(convo: ConvoId) -> ConversationRecord {
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
    fn clones_share_state() {
        let store = MemoryStore::new();
        let clone = store.clone();

        store.put_conversation(PrincipalId(1), &sample_conversation(ConvoId(7))).unwrap();

        assert!(clone.conversation(PrincipalId(1), ConvoId(7)).unwrap().is_some());
    }

    #[test]
    fn delete_is_idempotent() {
        let store = MemoryStore::new();
        store.delete_conversation(PrincipalId(1), ConvoId(7)).unwrap();
        store.delete_welcome(PrincipalId(1), ConvoId(7)).unwrap();
        store.delete_recovery(PrincipalId(1), ConvoId(7)).unwrap();
    }

    #[test]
    fn principal_scans_are_isolated() {
        let store = MemoryStore::new();
        store.put_conversation(PrincipalId(1), &sample_conversation(ConvoId(1))).unwrap();
        store.put_conversation(PrincipalId(2), &sample_conversation(ConvoId(2))).unwrap();

        let one = store.conversations(PrincipalId(1)).unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].convo, ConvoId(1));
    }
}
