//! Redb-backed durable storage implementation.
//!
//! Uses redb's ACID transactions with copy-on-write for crash safety. All
//! state survives process restarts. Values are sealed with the principal's
//! at-rest key before insertion, so the database file never contains
//! plaintext records.
//!
//! # Repair
//!
//! Lock contention or corruption in the storage engine triggers an automatic
//! repair: the handle is closed (releasing the file lock and discarding any
//! partially-written commit, which redb recovers on reopen), the database is
//! reopened, and the failing operation is retried exactly once. A second
//! failure surfaces [`StorageError::Unavailable`] instead of retrying
//! forever.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

use cachet_types::{
    ConversationRecord, ConvoId, EpochKeyRecord, KeyPackageRecord, MemberRecord, MessageRecord,
    PrincipalId, RecoveryRecord, WelcomeRecord,
};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Serialize, de::DeserializeOwned};
use tracing::{info, warn};

use crate::{
    cipher::StoreCipher,
    custody::KeyCustody,
    error::StorageError,
    keys,
    store::{Store, decode, encode},
};

const CONVERSATIONS_NAME: &str = "conversations";
const MEMBERS_NAME: &str = "members";
const KEY_PACKAGES_NAME: &str = "key_packages";
const MESSAGES_NAME: &str = "messages";
const EPOCH_KEYS_NAME: &str = "epoch_keys";
const STORAGE_BLOBS_NAME: &str = "storage_blobs";
const PENDING_WELCOMES_NAME: &str = "pending_welcomes";
const RECOVERY_STATES_NAME: &str = "recovery_states";

const CONVERSATIONS: TableDefinition<&[u8], &[u8]> = TableDefinition::new(CONVERSATIONS_NAME);
const MEMBERS: TableDefinition<&[u8], &[u8]> = TableDefinition::new(MEMBERS_NAME);
const KEY_PACKAGES: TableDefinition<&[u8], &[u8]> = TableDefinition::new(KEY_PACKAGES_NAME);
const MESSAGES: TableDefinition<&[u8], &[u8]> = TableDefinition::new(MESSAGES_NAME);
const EPOCH_KEYS: TableDefinition<&[u8], &[u8]> = TableDefinition::new(EPOCH_KEYS_NAME);
const STORAGE_BLOBS: TableDefinition<&[u8], &[u8]> = TableDefinition::new(STORAGE_BLOBS_NAME);
const PENDING_WELCOMES: TableDefinition<&[u8], &[u8]> =
    TableDefinition::new(PENDING_WELCOMES_NAME);
const RECOVERY_STATES: TableDefinition<&[u8], &[u8]> = TableDefinition::new(RECOVERY_STATES_NAME);

/// Map a redb error into the repairable backend class.
fn backend<E: std::fmt::Display>(err: E) -> StorageError {
    StorageError::Backend(err.to_string())
}

/// Durable, encrypted storage backed by redb.
///
/// Thread-safe; clone is cheap (`Arc`). One live handle per principal — the
/// context manager enforces this, and redb serializes writers internally
/// while readers proceed concurrently.
#[derive(Clone)]
pub struct RedbStore {
    inner: Arc<Inner>,
}

struct Inner {
    /// `None` only transiently, while a repair has closed the old handle.
    db: RwLock<Option<Database>>,
    path: PathBuf,
    cipher: StoreCipher,
}

impl RedbStore {
    /// Open or create the database at `path`, sealing values under the
    /// at-rest key that `custody` supplies for `principal`.
    pub fn open(
        path: impl AsRef<Path>,
        custody: &dyn KeyCustody,
        principal: PrincipalId,
    ) -> Result<Self, StorageError> {
        let key = custody.storage_key(principal)?;
        let db = Database::create(path.as_ref()).map_err(backend)?;
        ensure_tables(&db)?;

        Ok(Self {
            inner: Arc::new(Inner {
                db: RwLock::new(Some(db)),
                path: path.as_ref().to_path_buf(),
                cipher: StoreCipher::new(key),
            }),
        })
    }

    /// Run `op`, repairing and retrying exactly once on a backend error.
    fn with_db<T>(
        &self,
        op: impl Fn(&Database, &StoreCipher) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        match self.run(&op) {
            Err(e) if e.is_repairable() => {
                warn!(error = %e, "storage backend error, attempting repair");
                self.repair()?;
                self.run(&op).map_err(|retry_err| {
                    if retry_err.is_repairable() {
                        StorageError::Unavailable(retry_err.to_string())
                    } else {
                        retry_err
                    }
                })
            },
            other => other,
        }
    }

    fn run<T>(
        &self,
        op: &impl Fn(&Database, &StoreCipher) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let guard = self
            .inner
            .db
            .read()
            .map_err(|_| StorageError::Unavailable("storage lock poisoned".to_string()))?;
        let db = guard
            .as_ref()
            .ok_or_else(|| StorageError::Unavailable("storage handle closed".to_string()))?;
        op(db, &self.inner.cipher)
    }

    /// Close the handle, reopen the database, and restore the table set.
    ///
    /// Dropping the old handle releases the file lock; reopening runs redb's
    /// own recovery, discarding any partially-written commit.
    fn repair(&self) -> Result<(), StorageError> {
        let mut guard = self
            .inner
            .db
            .write()
            .map_err(|_| StorageError::Unavailable("storage lock poisoned".to_string()))?;

        guard.take();

        let db = Database::create(&self.inner.path)
            .map_err(|e| StorageError::Unavailable(format!("reopen failed: {e}")))?;
        ensure_tables(&db).map_err(|e| StorageError::Unavailable(e.to_string()))?;

        *guard = Some(db);
        info!(path = %self.inner.path.display(), "storage handle repaired");
        Ok(())
    }

    fn put_record<T: Serialize>(
        &self,
        table: TableDefinition<&[u8], &[u8]>,
        table_name: &str,
        key: &[u8],
        record: &T,
    ) -> Result<(), StorageError> {
        let plain = encode(record)?;
        self.with_db(|db, cipher| {
            let sealed = cipher.seal(table_name, key, &plain)?;
            let txn = db.begin_write().map_err(backend)?;
            {
                let mut t = txn.open_table(table).map_err(backend)?;
                t.insert(key, sealed.as_slice()).map_err(backend)?;
            }
            txn.commit().map_err(backend)?;
            Ok(())
        })
    }

    fn get_record<T: DeserializeOwned>(
        &self,
        table: TableDefinition<&[u8], &[u8]>,
        table_name: &str,
        key: &[u8],
    ) -> Result<Option<T>, StorageError> {
        let sealed = self.with_db(|db, _| {
            let txn = db.begin_read().map_err(backend)?;
            let t = txn.open_table(table).map_err(backend)?;
            Ok(t.get(key).map_err(backend)?.map(|v| v.value().to_vec()))
        })?;

        match sealed {
            Some(bytes) => {
                let plain = self.inner.cipher.open(table_name, key, &bytes)?;
                Ok(Some(decode(&plain)?))
            },
            None => Ok(None),
        }
    }

    fn delete_record(
        &self,
        table: TableDefinition<&[u8], &[u8]>,
        key: &[u8],
    ) -> Result<(), StorageError> {
        self.with_db(|db, _| {
            let txn = db.begin_write().map_err(backend)?;
            {
                let mut t = txn.open_table(table).map_err(backend)?;
                t.remove(key).map_err(backend)?;
            }
            txn.commit().map_err(backend)?;
            Ok(())
        })
    }

    /// Collect and decode every record in `[start, end)`, up to `limit`.
    fn scan_records<T: DeserializeOwned>(
        &self,
        table: TableDefinition<&[u8], &[u8]>,
        table_name: &str,
        start: &[u8],
        end: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<T>, StorageError> {
        let pairs = self.with_db(|db, _| {
            let txn = db.begin_read().map_err(backend)?;
            let t = txn.open_table(table).map_err(backend)?;

            let mut out: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
            match end {
                Some(end) => {
                    for item in t.range(start..end).map_err(backend)? {
                        let (k, v) = item.map_err(backend)?;
                        out.push((k.value().to_vec(), v.value().to_vec()));
                        if out.len() >= limit {
                            break;
                        }
                    }
                },
                None => {
                    for item in t.range(start..).map_err(backend)? {
                        let (k, v) = item.map_err(backend)?;
                        out.push((k.value().to_vec(), v.value().to_vec()));
                        if out.len() >= limit {
                            break;
                        }
                    }
                },
            }
            Ok(out)
        })?;

        pairs
            .into_iter()
            .map(|(key, sealed)| {
                let plain = self.inner.cipher.open(table_name, &key, &sealed)?;
                decode(&plain)
            })
            .collect()
    }
}

/// Create the full table set so later transactions never race on table
/// creation.
fn ensure_tables(db: &Database) -> Result<(), StorageError> {
    let txn = db.begin_write().map_err(backend)?;
    {
        let _ = txn.open_table(CONVERSATIONS).map_err(backend)?;
        let _ = txn.open_table(MEMBERS).map_err(backend)?;
        let _ = txn.open_table(KEY_PACKAGES).map_err(backend)?;
        let _ = txn.open_table(MESSAGES).map_err(backend)?;
        let _ = txn.open_table(EPOCH_KEYS).map_err(backend)?;
        let _ = txn.open_table(STORAGE_BLOBS).map_err(backend)?;
        let _ = txn.open_table(PENDING_WELCOMES).map_err(backend)?;
        let _ = txn.open_table(RECOVERY_STATES).map_err(backend)?;
    }
    txn.commit().map_err(backend)?;
    Ok(())
}

impl Store for RedbStore {
    fn put_conversation(
        &self,
        principal: PrincipalId,
        record: &ConversationRecord,
    ) -> Result<(), StorageError> {
        let key = keys::convo_key(principal, record.convo);
        self.put_record(CONVERSATIONS, CONVERSATIONS_NAME, &key, record)
    }

    fn conversation(
        &self,
        principal: PrincipalId,
        convo: ConvoId,
    ) -> Result<Option<ConversationRecord>, StorageError> {
        let key = keys::convo_key(principal, convo);
        self.get_record(CONVERSATIONS, CONVERSATIONS_NAME, &key)
    }

    fn delete_conversation(
        &self,
        principal: PrincipalId,
        convo: ConvoId,
    ) -> Result<(), StorageError> {
        let key = keys::convo_key(principal, convo);
        self.delete_record(CONVERSATIONS, &key)
    }

    fn conversations(
        &self,
        principal: PrincipalId,
    ) -> Result<Vec<ConversationRecord>, StorageError> {
        let (start, end) = keys::principal_scan(principal);
        self.scan_records(CONVERSATIONS, CONVERSATIONS_NAME, &start, end.as_deref(), usize::MAX)
    }

    fn put_member(
        &self,
        principal: PrincipalId,
        record: &MemberRecord,
    ) -> Result<(), StorageError> {
        let member = cachet_types::MemberRef { principal: record.principal, device: record.device };
        let key = keys::member_key(principal, record.convo, member);
        self.put_record(MEMBERS, MEMBERS_NAME, &key, record)
    }

    fn members(
        &self,
        principal: PrincipalId,
        convo: ConvoId,
    ) -> Result<Vec<MemberRecord>, StorageError> {
        let (start, end) = keys::convo_scan(principal, convo);
        self.scan_records(MEMBERS, MEMBERS_NAME, &start, end.as_deref(), usize::MAX)
    }

    fn put_key_package(
        &self,
        principal: PrincipalId,
        record: &KeyPackageRecord,
    ) -> Result<(), StorageError> {
        let key = keys::hash_ref_key(principal, &record.hash_ref);
        self.put_record(KEY_PACKAGES, KEY_PACKAGES_NAME, &key, record)
    }

    fn key_package(
        &self,
        principal: PrincipalId,
        hash_ref: &[u8],
    ) -> Result<Option<KeyPackageRecord>, StorageError> {
        let key = keys::hash_ref_key(principal, hash_ref);
        self.get_record(KEY_PACKAGES, KEY_PACKAGES_NAME, &key)
    }

    fn put_message(
        &self,
        principal: PrincipalId,
        record: &MessageRecord,
    ) -> Result<(), StorageError> {
        let key = keys::message_key(principal, record.convo, record.seq);
        self.put_record(MESSAGES, MESSAGES_NAME, &key, record)
    }

    fn message(
        &self,
        principal: PrincipalId,
        convo: ConvoId,
        seq: u64,
    ) -> Result<Option<MessageRecord>, StorageError> {
        let key = keys::message_key(principal, convo, seq);
        self.get_record(MESSAGES, MESSAGES_NAME, &key)
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
        self.scan_records(MESSAGES, MESSAGES_NAME, &start, end.as_deref(), limit)
    }

    fn delete_messages_older_than(
        &self,
        principal: PrincipalId,
        cutoff_secs: u64,
    ) -> Result<u64, StorageError> {
        let candidates: Vec<MessageRecord> = {
            let (start, end) = keys::principal_scan(principal);
            self.scan_records(MESSAGES, MESSAGES_NAME, &start, end.as_deref(), usize::MAX)?
        };

        let expired: Vec<[u8; 32]> = candidates
            .iter()
            .filter(|m| m.received_at_secs < cutoff_secs)
            .map(|m| keys::message_key(principal, m.convo, m.seq))
            .collect();
        let removed = expired.len() as u64;

        if !expired.is_empty() {
            self.with_db(|db, _| {
                let txn = db.begin_write().map_err(backend)?;
                {
                    let mut t = txn.open_table(MESSAGES).map_err(backend)?;
                    for key in &expired {
                        t.remove(key.as_slice()).map_err(backend)?;
                    }
                }
                txn.commit().map_err(backend)?;
                Ok(())
            })?;
        }

        Ok(removed)
    }

    fn put_epoch_key(
        &self,
        principal: PrincipalId,
        record: &EpochKeyRecord,
    ) -> Result<(), StorageError> {
        let key = keys::epoch_key(principal, record.convo, record.epoch);
        self.put_record(EPOCH_KEYS, EPOCH_KEYS_NAME, &key, record)
    }

    fn epoch_key(
        &self,
        principal: PrincipalId,
        convo: ConvoId,
        epoch: u64,
    ) -> Result<Option<EpochKeyRecord>, StorageError> {
        let key = keys::epoch_key(principal, convo, epoch);
        self.get_record(EPOCH_KEYS, EPOCH_KEYS_NAME, &key)
    }

    fn epoch_keys(
        &self,
        principal: PrincipalId,
        convo: ConvoId,
    ) -> Result<Vec<EpochKeyRecord>, StorageError> {
        let (start, end) = keys::convo_scan(principal, convo);
        self.scan_records(EPOCH_KEYS, EPOCH_KEYS_NAME, &start, end.as_deref(), usize::MAX)
    }

    fn delete_epoch_key(
        &self,
        principal: PrincipalId,
        convo: ConvoId,
        epoch: u64,
    ) -> Result<(), StorageError> {
        let key = keys::epoch_key(principal, convo, epoch);
        self.delete_record(EPOCH_KEYS, &key)
    }

    fn put_blob(
        &self,
        principal: PrincipalId,
        name: &str,
        bytes: &[u8],
    ) -> Result<(), StorageError> {
        let key = keys::blob_key(principal, name);
        self.with_db(|db, cipher| {
            let sealed = cipher.seal(STORAGE_BLOBS_NAME, &key, bytes)?;
            let txn = db.begin_write().map_err(backend)?;
            {
                let mut t = txn.open_table(STORAGE_BLOBS).map_err(backend)?;
                t.insert(key.as_slice(), sealed.as_slice()).map_err(backend)?;
            }
            txn.commit().map_err(backend)?;
            Ok(())
        })
    }

    fn blob(&self, principal: PrincipalId, name: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let key = keys::blob_key(principal, name);
        let sealed = self.with_db(|db, _| {
            let txn = db.begin_read().map_err(backend)?;
            let t = txn.open_table(STORAGE_BLOBS).map_err(backend)?;
            Ok(t.get(key.as_slice()).map_err(backend)?.map(|v| v.value().to_vec()))
        })?;

        match sealed {
            Some(bytes) => Ok(Some(self.inner.cipher.open(STORAGE_BLOBS_NAME, &key, &bytes)?)),
            None => Ok(None),
        }
    }

    fn put_welcome(
        &self,
        principal: PrincipalId,
        record: &WelcomeRecord,
    ) -> Result<(), StorageError> {
        let key = keys::convo_key(principal, record.convo);
        self.put_record(PENDING_WELCOMES, PENDING_WELCOMES_NAME, &key, record)
    }

    fn welcome(
        &self,
        principal: PrincipalId,
        convo: ConvoId,
    ) -> Result<Option<WelcomeRecord>, StorageError> {
        let key = keys::convo_key(principal, convo);
        self.get_record(PENDING_WELCOMES, PENDING_WELCOMES_NAME, &key)
    }

    fn delete_welcome(&self, principal: PrincipalId, convo: ConvoId) -> Result<(), StorageError> {
        let key = keys::convo_key(principal, convo);
        self.delete_record(PENDING_WELCOMES, &key)
    }

    fn welcomes(&self, principal: PrincipalId) -> Result<Vec<WelcomeRecord>, StorageError> {
        let (start, end) = keys::principal_scan(principal);
        self.scan_records(PENDING_WELCOMES, PENDING_WELCOMES_NAME, &start, end.as_deref(), usize::MAX)
    }

    fn put_recovery(
        &self,
        principal: PrincipalId,
        record: &RecoveryRecord,
    ) -> Result<(), StorageError> {
        let key = keys::convo_key(principal, record.convo);
        self.put_record(RECOVERY_STATES, RECOVERY_STATES_NAME, &key, record)
    }

    fn recovery(
        &self,
        principal: PrincipalId,
        convo: ConvoId,
    ) -> Result<Option<RecoveryRecord>, StorageError> {
        let key = keys::convo_key(principal, convo);
        self.get_record(RECOVERY_STATES, RECOVERY_STATES_NAME, &key)
    }

    fn delete_recovery(&self, principal: PrincipalId, convo: ConvoId) -> Result<(), StorageError> {
        let key = keys::convo_key(principal, convo);
        self.delete_record(RECOVERY_STATES, &key)
    }

    fn recoveries(&self, principal: PrincipalId) -> Result<Vec<RecoveryRecord>, StorageError> {
        let (start, end) = keys::principal_scan(principal);
        self.scan_records(RECOVERY_STATES, RECOVERY_STATES_NAME, &start, end.as_deref(), usize::MAX)
    }
}
