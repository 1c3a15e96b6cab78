//! Message sealing under epoch-derived keys.
//!
//! Application payloads are never handed to the MLS engine. Instead, a
//! per-epoch message key is derived from the exported epoch secret with
//! HKDF-SHA256 and used with XChaCha20-Poly1305. This is what makes the
//! secret-scoped decrypt path uniform: decrypting a message at any epoch —
//! current or historical — requires exactly the ledger entry for that epoch,
//! so "a recorded secret exists for every decryptable message" holds by
//! construction.

use cachet_types::{ConvoId, SealedMessage};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::{engine::EngineError, error::CoreError};

/// Domain separation label for message key derivation.
const MESSAGE_KEY_LABEL: &[u8] = b"cachetMessageV1";

/// Derive the 32-byte message key for (`convo`, `epoch`) from the epoch
/// secret.
///
/// Deterministic: both ends of a conversation derive the same key from the
/// same exported secret. Different conversations and different epochs yield
/// unrelated keys.
fn derive_message_key(epoch_secret: &[u8], convo: ConvoId, epoch: u64) -> [u8; 32] {
    let hkdf = Hkdf::<Sha256>::new(None, epoch_secret);

    // info = label || convo || epoch
    let mut info = Vec::with_capacity(MESSAGE_KEY_LABEL.len() + 16 + 8);
    info.extend_from_slice(MESSAGE_KEY_LABEL);
    info.extend_from_slice(&convo.to_be_bytes());
    info.extend_from_slice(&epoch.to_be_bytes());

    let mut key = [0u8; 32];
    #[allow(clippy::expect_used)]
    hkdf.expand(&info, &mut key).expect("32 bytes is a valid HKDF-SHA256 output length");
    key
}

/// Build the 24-byte nonce: `epoch (8) || seq (8) || random suffix (8)`.
///
/// The (epoch, seq) prefix makes nonces structurally unique per message;
/// the random suffix protects against sequence reuse across a restart that
/// lost the counter.
fn build_nonce(epoch: u64, seq: u64, random_suffix: [u8; 8]) -> [u8; 24] {
    let mut nonce = [0u8; 24];
    nonce[0..8].copy_from_slice(&epoch.to_be_bytes());
    nonce[8..16].copy_from_slice(&seq.to_be_bytes());
    nonce[16..24].copy_from_slice(&random_suffix);
    nonce
}

/// Seal a plaintext under the epoch secret for (`convo`, `epoch`).
///
/// Caller supplies the random suffix so sealing stays deterministic in
/// simulation.
pub fn seal_message(
    epoch_secret: &[u8],
    convo: ConvoId,
    epoch: u64,
    seq: u64,
    plaintext: &[u8],
    random_suffix: [u8; 8],
) -> Result<SealedMessage, CoreError> {
    use chacha20poly1305::{
        XChaCha20Poly1305, XNonce,
        aead::{Aead, KeyInit},
    };

    let mut key = derive_message_key(epoch_secret, convo, epoch);
    let nonce = build_nonce(epoch, seq, random_suffix);

    let cipher = XChaCha20Poly1305::new((&key).into());
    let result = cipher.encrypt(XNonce::from_slice(&nonce), plaintext);
    key.zeroize();

    let ciphertext = result.map_err(|_| CoreError::Engine {
        convo,
        source: EngineError::Crypto("message sealing failed".to_string()),
    })?;

    Ok(SealedMessage { epoch, seq, nonce, ciphertext })
}

/// Open a sealed message with the epoch secret recorded for its epoch.
///
/// # Errors
///
/// Engine `Crypto` error if authentication fails: wrong secret, tampered
/// ciphertext, or a message resealed under a different conversation.
pub fn open_message(
    epoch_secret: &[u8],
    convo: ConvoId,
    sealed: &SealedMessage,
) -> Result<Vec<u8>, CoreError> {
    use chacha20poly1305::{
        XChaCha20Poly1305, XNonce,
        aead::{Aead, KeyInit},
    };

    let mut key = derive_message_key(epoch_secret, convo, sealed.epoch);
    let cipher = XChaCha20Poly1305::new((&key).into());
    let result = cipher.decrypt(XNonce::from_slice(&sealed.nonce), sealed.ciphertext.as_slice());
    key.zeroize();

    result.map_err(|_| CoreError::Engine {
        convo,
        source: EngineError::Crypto("message authentication failed".to_string()),
    })
}
