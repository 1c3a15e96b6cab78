//! Value sealing with XChaCha20-Poly1305.
//!
//! Every record is sealed before it reaches the storage engine and opened on
//! the way back. The table name and storage key are bound in as associated
//! data, so a sealed value cannot be replayed at a different location in the
//! database.

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};
use zeroize::Zeroize;

use crate::error::StorageError;

/// 24-byte XChaCha20 nonce prepended to each sealed value.
const NONCE_SIZE: usize = 24;

/// Seals and opens stored values under a principal's at-rest key.
pub struct StoreCipher {
    key: [u8; 32],
}

impl StoreCipher {
    /// Wrap a 32-byte AEAD key obtained from key custody.
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Seal a plaintext value for storage at (`table`, `key_bytes`).
    ///
    /// Output layout: `[nonce: 24 bytes][ciphertext + 16-byte tag]`.
    pub fn seal(
        &self,
        table: &str,
        key_bytes: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, StorageError> {
        let mut nonce = [0u8; NONCE_SIZE];
        getrandom::fill(&mut nonce)
            .map_err(|e| StorageError::Crypto(format!("nonce generation failed: {e}")))?;

        let aad = location_aad(table, key_bytes);
        let cipher = XChaCha20Poly1305::new((&self.key).into());
        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), Payload { msg: plaintext, aad: &aad })
            .map_err(|_| StorageError::Crypto("sealing failed".to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Open a sealed value read back from (`table`, `key_bytes`).
    ///
    /// # Errors
    ///
    /// `Crypto` if the value is truncated, was tampered with, was sealed
    /// under a different key, or was moved to a different location.
    pub fn open(
        &self,
        table: &str,
        key_bytes: &[u8],
        sealed: &[u8],
    ) -> Result<Vec<u8>, StorageError> {
        if sealed.len() < NONCE_SIZE {
            return Err(StorageError::Crypto("sealed value too short".to_string()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);

        let aad = location_aad(table, key_bytes);
        let cipher = XChaCha20Poly1305::new((&self.key).into());
        cipher
            .decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad: &aad })
            .map_err(|_| StorageError::Crypto("authentication failed".to_string()))
    }
}

impl Drop for StoreCipher {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Associated data binding a value to its table and key.
fn location_aad(table: &str, key_bytes: &[u8]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(table.len() + 1 + key_bytes.len());
    aad.extend_from_slice(table.as_bytes());
    aad.push(0);
    aad.extend_from_slice(key_bytes);
    aad
}
