//! Epoch secret ledger.
//!
//! Tracks, retains, and prunes per-epoch secret material keyed by
//! (conversation, epoch). `record` is a durable write-through: it returns
//! only once the secret is in the store, which is what lets the
//! orchestrator's persist-before-advance ordering be checked structurally
//! rather than by convention.
//!
//! Pruning is a two-step tombstone-then-delete. The first step marks a
//! record; a tombstoned secret still serves reads, so an in-flight decrypt
//! that looked the epoch up just before pruning does not lose its material.
//! The second step ([`EpochSecretLedger::sweep`]) deletes marked records,
//! typically on the next context open.

use cachet_store::Store;
use cachet_types::{ConvoId, EpochKeyRecord, PrincipalId, RetentionPolicy};
use tracing::debug;

use crate::error::CoreError;

/// Per-principal ledger of exported epoch secrets.
#[derive(Clone)]
pub struct EpochSecretLedger<S: Store> {
    principal: PrincipalId,
    store: S,
}

impl<S: Store> EpochSecretLedger<S> {
    /// Create a ledger over the principal's store.
    pub fn new(principal: PrincipalId, store: S) -> Self {
        Self { principal, store }
    }

    /// Durably record the secret for (`convo`, `epoch`).
    ///
    /// Overwrites an existing record for the same epoch (the secret is
    /// deterministic per epoch, so this is idempotent). Returns only after
    /// the store write succeeded.
    pub fn record(
        &self,
        convo: ConvoId,
        epoch: u64,
        secret: &[u8],
        now_secs: u64,
    ) -> Result<(), CoreError> {
        let record = EpochKeyRecord {
            convo,
            epoch,
            secret: secret.to_vec(),
            created_at_secs: now_secs,
            tombstoned: false,
        };
        self.store.put_epoch_key(self.principal, &record)?;
        debug!(%convo, epoch, "recorded epoch secret");
        Ok(())
    }

    /// Look up the secret for (`convo`, `epoch`).
    ///
    /// Tombstoned records still resolve: the tombstone only bars new
    /// retention cycles, not reads that race the prune.
    pub fn lookup(&self, convo: ConvoId, epoch: u64) -> Result<Option<Vec<u8>>, CoreError> {
        Ok(self.store.epoch_key(self.principal, convo, epoch)?.map(|r| r.secret))
    }

    /// Whether a secret is recorded for (`convo`, `epoch`).
    pub fn has(&self, convo: ConvoId, epoch: u64) -> Result<bool, CoreError> {
        Ok(self.store.epoch_key(self.principal, convo, epoch)?.is_some())
    }

    /// First pruning step: tombstone secrets outside the retention window.
    ///
    /// Never touches the secret for `current_epoch` or for any epoch newer
    /// than `current_epoch - keep_last_n`. With an age bound configured, a
    /// secret must also be older than the bound to be marked. Returns how
    /// many records were newly tombstoned.
    pub fn prune(
        &self,
        convo: ConvoId,
        current_epoch: u64,
        policy: &RetentionPolicy,
        now_secs: u64,
    ) -> Result<u64, CoreError> {
        let floor = current_epoch.saturating_sub(policy.keep_last_n);
        let mut marked = 0u64;

        for mut record in self.store.epoch_keys(self.principal, convo)? {
            if record.epoch >= floor || record.tombstoned {
                continue;
            }
            if let Some(max_age) = policy.max_age_secs {
                if now_secs.saturating_sub(record.created_at_secs) < max_age {
                    continue;
                }
            }

            record.tombstoned = true;
            self.store.put_epoch_key(self.principal, &record)?;
            marked += 1;
        }

        if marked > 0 {
            debug!(%convo, current_epoch, marked, "tombstoned epoch secrets");
        }
        Ok(marked)
    }

    /// Second pruning step: delete tombstoned records. Returns how many
    /// were removed.
    pub fn sweep(&self, convo: ConvoId) -> Result<u64, CoreError> {
        let mut removed = 0u64;
        for record in self.store.epoch_keys(self.principal, convo)? {
            if record.tombstoned {
                self.store.delete_epoch_key(self.principal, convo, record.epoch)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Tombstone every secret of a conversation (leave/removal teardown).
    /// The regular sweep completes the deletion.
    pub fn purge_conversation(&self, convo: ConvoId) -> Result<(), CoreError> {
        for mut record in self.store.epoch_keys(self.principal, convo)? {
            if !record.tombstoned {
                record.tombstoned = true;
                self.store.put_epoch_key(self.principal, &record)?;
            }
        }
        Ok(())
    }
}
