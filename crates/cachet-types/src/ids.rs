//! Identifier newtypes.
//!
//! Fixed-width integer identifiers keep storage keys fixed-offset so
//! lexicographic ordering of encoded keys matches numeric ordering.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Local account identifier. The tenancy boundary for all persisted state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PrincipalId(pub u64);

impl PrincipalId {
    /// Big-endian encoding used as the leading component of storage keys.
    pub fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "principal:{}", self.0)
    }
}

/// Device identifier within a principal's account.
///
/// Multiple devices of the same principal are distinct group members and are
/// never conflated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub u64);

/// Conversation identifier (128-bit).
///
/// Doubles as the cryptographic group identifier: the engine binds the MLS
/// group id to the big-endian encoding of this value, so both sides of a
/// Welcome agree on the conversation without a separate mapping table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConvoId(pub u128);

impl ConvoId {
    /// Big-endian encoding used in storage keys and as the MLS group id.
    pub fn to_be_bytes(self) -> [u8; 16] {
        self.0.to_be_bytes()
    }

    /// Decode from the 16-byte big-endian form. `None` if the slice has the
    /// wrong length.
    pub fn from_be_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 16] = bytes.try_into().ok()?;
        Some(Self(u128::from_be_bytes(arr)))
    }
}

impl fmt::Display for ConvoId {
    // Zero-padded hex, matching how conversation ids appear in server logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// A (principal, device) pair identifying one group member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemberRef {
    /// Owning principal.
    pub principal: PrincipalId,
    /// Device of that principal.
    pub device: DeviceId,
}

impl MemberRef {
    /// Pack into the 16-byte credential payload carried in key packages.
    pub fn to_credential_bytes(self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&self.principal.0.to_be_bytes());
        bytes[8..].copy_from_slice(&self.device.0.to_be_bytes());
        bytes
    }

    /// Unpack from a credential payload. `None` if shorter than 16 bytes.
    pub fn from_credential_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 16 {
            return None;
        }
        let principal = u64::from_be_bytes(bytes[..8].try_into().ok()?);
        let device = u64::from_be_bytes(bytes[8..16].try_into().ok()?);
        Some(Self { principal: PrincipalId(principal), device: DeviceId(device) })
    }
}

/// Client-generated idempotency token attached to state-mutating requests.
///
/// Retries of the same logical operation must reuse the same token; a fresh
/// token is generated only for a genuinely new logical operation. Tokens are
/// persisted alongside in-flight protocol state so a retry after restart
/// still carries the original token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey(pub u128);

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}
