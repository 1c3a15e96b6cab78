//! External key custody.
//!
//! The at-rest encryption key is derived and held outside the store — the
//! store never persists a secret it could use to decrypt itself. Production
//! embeddings implement [`KeyCustody`] against the platform keystore.

use cachet_types::PrincipalId;
use zeroize::Zeroize;

use crate::error::StorageError;

/// Supplies the 32-byte at-rest encryption key for a principal's store.
pub trait KeyCustody: Send + Sync {
    /// The AEAD key for this principal's values.
    ///
    /// Called once when a store handle is opened. Implementations may
    /// derive the key per principal; returning the same key for two
    /// principals weakens tenancy isolation but not correctness.
    fn storage_key(&self, principal: PrincipalId) -> Result<[u8; 32], StorageError>;
}

/// Custody backed by a fixed in-memory key.
///
/// For tests and development only: a real deployment keeps the key in a
/// platform keystore, not in process memory for the process lifetime.
pub struct StaticCustody {
    key: [u8; 32],
}

impl StaticCustody {
    /// Wrap a fixed key.
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }
}

impl KeyCustody for StaticCustody {
    fn storage_key(&self, _principal: PrincipalId) -> Result<[u8; 32], StorageError> {
        Ok(self.key)
    }
}

impl Drop for StaticCustody {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}
