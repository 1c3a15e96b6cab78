//! Storage key encoding.
//!
//! Composite big-endian keys so lexicographic ordering matches numeric
//! ordering. The principal is always the leading component: tenancy
//! isolation falls out of the key layout.

use cachet_types::{ConvoId, MemberRef, PrincipalId};

/// Key for a conversation record: `[principal: 8][convo: 16]`.
pub fn convo_key(principal: PrincipalId, convo: ConvoId) -> [u8; 24] {
    let mut key = [0u8; 24];
    key[..8].copy_from_slice(&principal.to_be_bytes());
    key[8..].copy_from_slice(&convo.to_be_bytes());
    key
}

/// Key for a message: `[principal: 8][convo: 16][seq: 8]`.
pub fn message_key(principal: PrincipalId, convo: ConvoId, seq: u64) -> [u8; 32] {
    let mut key = [0u8; 32];
    key[..8].copy_from_slice(&principal.to_be_bytes());
    key[8..24].copy_from_slice(&convo.to_be_bytes());
    key[24..].copy_from_slice(&seq.to_be_bytes());
    key
}

/// Key for an epoch secret: `[principal: 8][convo: 16][epoch: 8]`.
pub fn epoch_key(principal: PrincipalId, convo: ConvoId, epoch: u64) -> [u8; 32] {
    let mut key = [0u8; 32];
    key[..8].copy_from_slice(&principal.to_be_bytes());
    key[8..24].copy_from_slice(&convo.to_be_bytes());
    key[24..].copy_from_slice(&epoch.to_be_bytes());
    key
}

/// Key for a member record:
/// `[principal: 8][convo: 16][member principal: 8][member device: 8]`.
pub fn member_key(principal: PrincipalId, convo: ConvoId, member: MemberRef) -> [u8; 40] {
    let mut key = [0u8; 40];
    key[..8].copy_from_slice(&principal.to_be_bytes());
    key[8..24].copy_from_slice(&convo.to_be_bytes());
    key[24..40].copy_from_slice(&member.to_credential_bytes());
    key
}

/// Key for a key package: `[principal: 8][hash_ref: variable]`.
pub fn hash_ref_key(principal: PrincipalId, hash_ref: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + hash_ref.len());
    key.extend_from_slice(&principal.to_be_bytes());
    key.extend_from_slice(hash_ref);
    key
}

/// Key for a named blob: `[principal: 8][name: variable]`.
pub fn blob_key(principal: PrincipalId, name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + name.len());
    key.extend_from_slice(&principal.to_be_bytes());
    key.extend_from_slice(name.as_bytes());
    key
}

/// Exclusive upper bound for a prefix scan: the prefix incremented as a
/// big-endian integer. `None` if the prefix is all `0xFF` (scan to the end
/// of the table instead).
pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut succ = prefix.to_vec();
    for byte in succ.iter_mut().rev() {
        if *byte < 0xFF {
            *byte += 1;
            return Some(succ);
        }
        *byte = 0;
    }
    None
}

/// Scan bounds covering every key owned by `principal`.
pub fn principal_scan(principal: PrincipalId) -> (Vec<u8>, Option<Vec<u8>>) {
    let start = principal.to_be_bytes().to_vec();
    let end = prefix_successor(&start);
    (start, end)
}

/// Scan bounds covering every key under (`principal`, `convo`).
pub fn convo_scan(principal: PrincipalId, convo: ConvoId) -> (Vec<u8>, Option<Vec<u8>>) {
    let start = convo_key(principal, convo).to_vec();
    let end = prefix_successor(&start);
    (start, end)
}
