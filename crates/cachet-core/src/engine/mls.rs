//! OpenMLS-backed implementation of [`GroupEngine`].
//!
//! One engine instance per local (principal, device). The MLS group id is
//! bound to the big-endian conversation id, so both the inviter and the
//! invited device agree on the conversation a Welcome belongs to without a
//! side-channel mapping.
//!
//! Key package bundles are cached by hash reference and written through to
//! the provider's storage before every snapshot: losing a bundle means a
//! pending Welcome can never be decrypted, which is exactly the desync
//! signature the recovery flow exists for.

use std::collections::HashMap;

use cachet_types::{ConvoId, GroupConfig, MemberRef};
#[allow(clippy::wildcard_imports)]
use openmls::{
    ciphersuite::hash_ref::HashReference,
    key_packages::KeyPackageIn,
    prelude::{MlsMessageIn, *},
};
use openmls_basic_credential::SignatureKeyPair;
use openmls_rust_crypto::OpenMlsRustCrypto;
use openmls_traits::{OpenMlsProvider, storage::StorageProvider};
use serde::{Deserialize, Serialize};
use tls_codec::{Deserialize as TlsDeserialize, Serialize as TlsSerialize};
use tracing::{debug, warn};

use super::{
    CommitBundle, CreatedKeyPackage, EngineError, GroupEngine, JoinedGroup, MergeOutcome,
    ProtocolOutcome,
};

const CIPHERSUITE: Ciphersuite = Ciphersuite::MLS_128_DHKEMX25519_AES128GCM_SHA256_Ed25519;

/// Exporter label for epoch secrets.
const EPOCH_SECRET_LABEL: &str = "cachet-epoch";

/// Extract the (principal, device) pair from an MLS credential.
///
/// Our credentials carry the member reference as 16 big-endian bytes.
fn member_from_credential(credential: &Credential) -> Result<MemberRef, EngineError> {
    MemberRef::from_credential_bytes(credential.serialized_content()).ok_or_else(|| {
        EngineError::Serialization(format!(
            "invalid credential: expected 16 bytes, got {}",
            credential.serialized_content().len()
        ))
    })
}

struct GroupState {
    group: MlsGroup,
}

/// Serialized engine state: the provider's key-value storage plus the
/// metadata needed to rebuild the in-memory maps.
#[derive(Serialize, Deserialize)]
struct EngineSnapshot {
    storage: Vec<(Vec<u8>, Vec<u8>)>,
    groups: Vec<u128>,
    signer_public: Option<Vec<u8>>,
    key_package_refs: Vec<Vec<u8>>,
}

/// OpenMLS adapter.
pub struct MlsEngine {
    local: MemberRef,
    provider: OpenMlsRustCrypto,
    groups: HashMap<u128, GroupState>,
    /// Hash reference -> bundle, for Welcome processing.
    bundles: HashMap<Vec<u8>, KeyPackageBundle>,
    /// Staged remote commits awaiting merge.
    staged: HashMap<u128, Box<StagedCommit>>,
    /// Our own pending commits: convo -> target epoch.
    pending: HashMap<u128, u64>,
    /// Public key of the device signature keypair, once generated.
    signer_public: Option<Vec<u8>>,
}

impl MlsEngine {
    /// Create an engine for the local (principal, device).
    pub fn new(local: MemberRef) -> Self {
        Self {
            local,
            provider: OpenMlsRustCrypto::default(),
            groups: HashMap::new(),
            bundles: HashMap::new(),
            staged: HashMap::new(),
            pending: HashMap::new(),
            signer_public: None,
        }
    }

    /// The local member this engine signs as.
    pub fn local_member(&self) -> MemberRef {
        self.local
    }

    /// Load or lazily create the device signature keypair.
    ///
    /// One keypair per device, reused across groups and key packages, so a
    /// Welcome consumed after a restart still finds its signer in restored
    /// storage.
    fn device_signer(&mut self) -> Result<SignatureKeyPair, EngineError> {
        if let Some(public) = &self.signer_public {
            return SignatureKeyPair::read(
                self.provider.storage(),
                public,
                CIPHERSUITE.signature_algorithm(),
            )
            .ok_or_else(|| EngineError::Crypto("device signer missing from storage".to_string()));
        }

        let signer = SignatureKeyPair::new(CIPHERSUITE.signature_algorithm())
            .map_err(|e| EngineError::Crypto(format!("failed to generate signature keys: {e}")))?;
        signer
            .store(self.provider.storage())
            .map_err(|e| EngineError::Crypto(format!("failed to store signature keys: {e:?}")))?;

        self.signer_public = Some(signer.public().to_vec());
        Ok(signer)
    }

    fn credential_with_key(&self, signer: &SignatureKeyPair) -> CredentialWithKey {
        let credential = BasicCredential::new(self.local.to_credential_bytes().to_vec());
        CredentialWithKey { credential: credential.into(), signature_key: signer.public().into() }
    }

    fn group_state(&self, convo: ConvoId) -> Result<&GroupState, EngineError> {
        self.groups.get(&convo.0).ok_or(EngineError::GroupNotFound(convo))
    }
}

impl GroupEngine for MlsEngine {
    fn create_group(&mut self, convo: ConvoId, config: &GroupConfig) -> Result<u64, EngineError> {
        let signer = self.device_signer()?;
        let credential_with_key = self.credential_with_key(&signer);

        let group_config = MlsGroupCreateConfig::builder()
            .ciphersuite(CIPHERSUITE)
            .max_past_epochs(config.max_past_epochs as usize)
            .sender_ratchet_configuration(SenderRatchetConfiguration::new(
                config.out_of_order_tolerance,
                config.maximum_forward_distance,
            ))
            .use_ratchet_tree_extension(true)
            .build();

        let group_id = GroupId::from_slice(&convo.to_be_bytes());
        let group = MlsGroup::new_with_group_id(
            &self.provider,
            &signer,
            &group_config,
            group_id,
            credential_with_key,
        )
        .map_err(|e| EngineError::Crypto(format!("failed to create group: {e}")))?;

        let epoch = group.epoch().as_u64();
        self.groups.insert(convo.0, GroupState { group });
        debug!(%convo, epoch, "created group");
        Ok(epoch)
    }

    fn create_key_package(&mut self) -> Result<CreatedKeyPackage, EngineError> {
        let signer = self.device_signer()?;
        let credential_with_key = self.credential_with_key(&signer);

        let bundle = KeyPackage::builder()
            .build(CIPHERSUITE, &self.provider, &signer, credential_with_key)
            .map_err(|e| EngineError::Crypto(format!("failed to build key package: {e}")))?;

        let key_package = bundle.key_package();
        let bytes = key_package
            .tls_serialize_detached()
            .map_err(|e| EngineError::Serialization(format!("key package: {e}")))?;
        let hash_ref = key_package
            .hash_ref(self.provider.crypto())
            .map_err(|e| EngineError::Crypto(format!("key package hash: {e}")))?
            .as_slice()
            .to_vec();

        // Write-through immediately: a bundle that exists only in this map
        // cannot survive a snapshot/restore cycle, and a lost bundle makes
        // the matching Welcome undecryptable.
        let hash_ref_value = HashReference::from_slice(&hash_ref);
        self.provider
            .storage()
            .write_key_package(&hash_ref_value, &bundle)
            .map_err(|e| EngineError::Snapshot(format!("bundle storage failed: {e:?}")))?;

        self.bundles.insert(hash_ref.clone(), bundle);

        Ok(CreatedKeyPackage { bytes, hash_ref, cipher_suite: CIPHERSUITE as u16 })
    }

    fn add_members(
        &mut self,
        convo: ConvoId,
        key_packages: &[Vec<u8>],
    ) -> Result<CommitBundle, EngineError> {
        if key_packages.is_empty() {
            return Err(EngineError::InvalidKeyPackage("no key packages supplied".to_string()));
        }

        let signer = self.device_signer()?;

        let kps: Vec<KeyPackage> = key_packages
            .iter()
            .map(|bytes| {
                let kp_in = KeyPackageIn::tls_deserialize(&mut bytes.as_slice())
                    .map_err(|e| EngineError::InvalidKeyPackage(format!("deserialize: {e}")))?;
                kp_in
                    .validate(self.provider.crypto(), ProtocolVersion::Mls10)
                    .map_err(|e| EngineError::InvalidKeyPackage(format!("validate: {e:?}")))
            })
            .collect::<Result<Vec<_>, EngineError>>()?;

        let state = self.groups.get_mut(&convo.0).ok_or(EngineError::GroupNotFound(convo))?;
        let target_epoch = state.group.epoch().as_u64() + 1;

        let (commit_out, welcome_out, _group_info) = state
            .group
            .add_members(&self.provider, &signer, &kps)
            .map_err(|e| EngineError::Crypto(format!("failed to add members: {e}")))?;

        let commit = commit_out
            .tls_serialize_detached()
            .map_err(|e| EngineError::Serialization(format!("commit: {e}")))?;
        let welcome = welcome_out
            .tls_serialize_detached()
            .map_err(|e| EngineError::Serialization(format!("welcome: {e}")))?;

        self.pending.insert(convo.0, target_epoch);

        Ok(CommitBundle { commit, welcome: Some(welcome), target_epoch })
    }

    fn remove_members(
        &mut self,
        convo: ConvoId,
        members: &[MemberRef],
    ) -> Result<CommitBundle, EngineError> {
        if members.is_empty() {
            return Err(EngineError::Crypto("no members specified for removal".to_string()));
        }

        let signer = self.device_signer()?;
        let state = self.groups.get_mut(&convo.0).ok_or(EngineError::GroupNotFound(convo))?;
        let target_epoch = state.group.epoch().as_u64() + 1;

        let mut leaf_indices = Vec::with_capacity(members.len());
        for target in members {
            let index = state
                .group
                .members()
                .find(|m| {
                    MemberRef::from_credential_bytes(m.credential.serialized_content())
                        .is_some_and(|r| r == *target)
                })
                .map(|m| m.index)
                .ok_or_else(|| {
                    EngineError::Crypto(format!(
                        "member {}:{} not in group",
                        target.principal.0, target.device.0
                    ))
                })?;
            leaf_indices.push(index);
        }

        let (commit_out, _welcome_option, _group_info) = state
            .group
            .remove_members(&self.provider, &signer, &leaf_indices)
            .map_err(|e| EngineError::Crypto(format!("failed to remove members: {e}")))?;

        let commit = commit_out
            .tls_serialize_detached()
            .map_err(|e| EngineError::Serialization(format!("commit: {e}")))?;

        self.pending.insert(convo.0, target_epoch);

        Ok(CommitBundle { commit, welcome: None, target_epoch })
    }

    fn merge_pending_commit(&mut self, convo: ConvoId) -> Result<u64, EngineError> {
        let target = *self.pending.get(&convo.0).ok_or(EngineError::NoPendingCommit(convo))?;

        let state = self.groups.get_mut(&convo.0).ok_or(EngineError::GroupNotFound(convo))?;
        state
            .group
            .merge_pending_commit(&self.provider)
            .map_err(|e| EngineError::Crypto(format!("failed to merge pending commit: {e}")))?;

        let epoch = state.group.epoch().as_u64();
        debug_assert_eq!(epoch, target, "epoch after merge does not match pending target");

        self.pending.remove(&convo.0);
        Ok(epoch)
    }

    fn clear_pending_commit(&mut self, convo: ConvoId) -> Result<(), EngineError> {
        self.pending.remove(&convo.0);
        if let Some(state) = self.groups.get_mut(&convo.0) {
            // Best-effort cleanup of the engine-internal pending state.
            let _ = state.group.clear_pending_commit(self.provider.storage());
        }
        Ok(())
    }

    fn process_protocol_message(
        &mut self,
        convo: ConvoId,
        message: &[u8],
    ) -> Result<ProtocolOutcome, EngineError> {
        let state = self.groups.get_mut(&convo.0).ok_or(EngineError::GroupNotFound(convo))?;

        let mls_message = MlsMessageIn::tls_deserialize_exact(message)
            .map_err(|e| EngineError::Serialization(format!("protocol message: {e}")))?;
        let protocol_message: ProtocolMessage = mls_message
            .try_into()
            .map_err(|e| EngineError::Serialization(format!("not a protocol message: {e:?}")))?;

        let processed = state
            .group
            .process_message(&self.provider, protocol_message)
            .map_err(|e| EngineError::Crypto(format!("failed to process message: {e}")))?;

        let sender = member_from_credential(processed.credential())?;

        match processed.into_content() {
            ProcessedMessageContent::ApplicationMessage(app_msg) => {
                Ok(ProtocolOutcome::Application { sender, plaintext: app_msg.into_bytes() })
            },
            ProcessedMessageContent::ProposalMessage(_)
            | ProcessedMessageContent::ExternalJoinProposalMessage(_) => {
                Ok(ProtocolOutcome::Proposal)
            },
            ProcessedMessageContent::StagedCommitMessage(staged_commit) => {
                let current_epoch = state.group.epoch().as_u64();
                self.staged.insert(convo.0, staged_commit);
                Ok(ProtocolOutcome::StagedCommit { current_epoch })
            },
        }
    }

    fn merge_staged_commit(&mut self, convo: ConvoId) -> Result<MergeOutcome, EngineError> {
        let staged = self.staged.remove(&convo.0).ok_or(EngineError::NoStagedCommit(convo))?;
        let state = self.groups.get_mut(&convo.0).ok_or(EngineError::GroupNotFound(convo))?;

        state
            .group
            .merge_staged_commit(&self.provider, *staged)
            .map_err(|e| EngineError::Crypto(format!("failed to merge staged commit: {e}")))?;

        let epoch = state.group.epoch().as_u64();
        let active = state.group.is_active();
        Ok(MergeOutcome { epoch, active })
    }

    fn process_welcome(
        &mut self,
        welcome: &[u8],
        config: &GroupConfig,
    ) -> Result<JoinedGroup, EngineError> {
        // The signature of local state loss: no bundles means no Welcome
        // addressed to this device can be decrypted.
        if self.bundles.is_empty() {
            return Err(EngineError::NoMatchingKeyPackage(
                "no key package bundles available".to_string(),
            ));
        }

        let mls_message = MlsMessageIn::tls_deserialize(&mut welcome.as_ref())
            .map_err(|e| EngineError::Serialization(format!("welcome: {e}")))?;
        let welcome = match mls_message.extract() {
            MlsMessageBodyIn::Welcome(w) => w,
            _ => return Err(EngineError::Serialization("message is not a welcome".to_string())),
        };

        let join_config = MlsGroupJoinConfig::builder()
            .max_past_epochs(config.max_past_epochs as usize)
            .sender_ratchet_configuration(SenderRatchetConfiguration::new(
                config.out_of_order_tolerance,
                config.maximum_forward_distance,
            ))
            .use_ratchet_tree_extension(true)
            .build();

        let group = StagedWelcome::new_from_welcome(&self.provider, &join_config, welcome, None)
            .map_err(|e| EngineError::Crypto(format!("failed to stage welcome: {e}")))?
            .into_group(&self.provider)
            .map_err(|e| EngineError::Crypto(format!("failed to join from welcome: {e}")))?;

        let convo = ConvoId::from_be_slice(group.group_id().as_slice()).ok_or_else(|| {
            EngineError::Serialization("group id is not a conversation id".to_string())
        })?;
        let epoch = group.epoch().as_u64();

        let members = group
            .members()
            .map(|m| member_from_credential(&m.credential))
            .collect::<Result<Vec<_>, _>>()?;

        self.groups.insert(convo.0, GroupState { group });
        debug!(%convo, epoch, "joined group from welcome");

        Ok(JoinedGroup { convo, epoch, members })
    }

    fn export_epoch_secret(&mut self, convo: ConvoId) -> Result<Vec<u8>, EngineError> {
        let state = self.group_state(convo)?;
        let context = state.group.group_id().as_slice().to_vec();

        state
            .group
            .export_secret(self.provider.crypto(), EPOCH_SECRET_LABEL, &context, 32)
            .map_err(|e| EngineError::Crypto(format!("failed to export epoch secret: {e}")))
    }

    fn current_epoch(&self, convo: ConvoId) -> Result<u64, EngineError> {
        Ok(self.group_state(convo)?.group.epoch().as_u64())
    }

    fn group_members(&self, convo: ConvoId) -> Result<Vec<MemberRef>, EngineError> {
        self.group_state(convo)?
            .group
            .members()
            .map(|m| member_from_credential(&m.credential))
            .collect()
    }

    fn has_group(&self, convo: ConvoId) -> bool {
        self.groups.contains_key(&convo.0)
    }

    fn delete_group(&mut self, convo: ConvoId) -> Result<(), EngineError> {
        self.groups.remove(&convo.0);
        self.staged.remove(&convo.0);
        self.pending.remove(&convo.0);
        Ok(())
    }

    fn snapshot(&self) -> Result<Vec<u8>, EngineError> {
        // Bundles must be in provider storage before the storage map is
        // dumped, or pending Welcomes become undecryptable after a restore.
        for (hash_ref, bundle) in &self.bundles {
            let hash_ref_value = HashReference::from_slice(hash_ref);
            self.provider
                .storage()
                .write_key_package(&hash_ref_value, bundle)
                .map_err(|e| EngineError::Snapshot(format!("bundle storage failed: {e:?}")))?;
        }

        let storage: Vec<(Vec<u8>, Vec<u8>)> = {
            let values = self
                .provider
                .storage()
                .values
                .read()
                .map_err(|_| EngineError::Snapshot("storage lock poisoned".to_string()))?;
            values.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        let snapshot = EngineSnapshot {
            storage,
            groups: self.groups.keys().copied().collect(),
            signer_public: self.signer_public.clone(),
            key_package_refs: self.bundles.keys().cloned().collect(),
        };

        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&snapshot, &mut bytes)
            .map_err(|e| EngineError::Snapshot(e.to_string()))?;
        Ok(bytes)
    }

    fn restore(&mut self, blob: &[u8]) -> Result<(), EngineError> {
        let snapshot: EngineSnapshot = ciborium::de::from_reader(blob)
            .map_err(|e| EngineError::Snapshot(e.to_string()))?;

        {
            let mut values = self
                .provider
                .storage()
                .values
                .write()
                .map_err(|_| EngineError::Snapshot("storage lock poisoned".to_string()))?;
            values.clear();
            values.extend(snapshot.storage);
        }

        self.signer_public = snapshot.signer_public;
        self.staged.clear();
        self.pending.clear();

        self.groups.clear();
        for raw in snapshot.groups {
            let convo = ConvoId(raw);
            let group_id = GroupId::from_slice(&convo.to_be_bytes());
            match MlsGroup::load(self.provider.storage(), &group_id) {
                Ok(Some(group)) => {
                    self.groups.insert(raw, GroupState { group });
                },
                Ok(None) => {
                    warn!(%convo, "group in snapshot but not in storage");
                },
                Err(e) => {
                    return Err(EngineError::Snapshot(format!("failed to load group: {e:?}")));
                },
            }
        }

        self.bundles.clear();
        for hash_ref in snapshot.key_package_refs {
            let hash_ref_value = HashReference::from_slice(&hash_ref);
            match self
                .provider
                .storage()
                .key_package::<HashReference, KeyPackageBundle>(&hash_ref_value)
            {
                Ok(Some(bundle)) => {
                    self.bundles.insert(hash_ref, bundle);
                },
                Ok(None) => {
                    warn!("key package bundle missing from restored storage");
                },
                Err(e) => {
                    return Err(EngineError::Snapshot(format!("failed to load bundle: {e:?}")));
                },
            }
        }

        debug!(groups = self.groups.len(), bundles = self.bundles.len(), "engine state restored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use cachet_types::{DeviceId, PrincipalId};

    use super::*;

    fn member(principal: u64, device: u64) -> MemberRef {
        MemberRef { principal: PrincipalId(principal), device: DeviceId(device) }
    }

    fn config() -> GroupConfig {
        GroupConfig::default()
    }

    #[test]
    fn create_group_starts_at_epoch_zero() {
        let mut engine = MlsEngine::new(member(1, 1));
        let epoch = engine.create_group(ConvoId(100), &config()).unwrap();
        assert_eq!(epoch, 0);
        assert!(engine.has_group(ConvoId(100)));
    }

    #[test]
    fn epoch_secret_is_stable_within_epoch() {
        let mut engine = MlsEngine::new(member(1, 1));
        engine.create_group(ConvoId(100), &config()).unwrap();

        let a = engine.export_epoch_secret(ConvoId(100)).unwrap();
        let b = engine.export_epoch_secret(ConvoId(100)).unwrap();
        assert_eq!(a.len(), 32);
        assert_eq!(a, b);
    }

    #[test]
    fn key_package_has_bytes_and_hash_ref() {
        let mut engine = MlsEngine::new(member(2, 1));
        let kp = engine.create_key_package().unwrap();
        assert!(!kp.bytes.is_empty());
        assert!(!kp.hash_ref.is_empty());
    }

    #[test]
    fn add_members_then_merge_advances_epoch() {
        let convo = ConvoId(7);
        let mut alice = MlsEngine::new(member(1, 1));
        let mut bob = MlsEngine::new(member(2, 1));

        alice.create_group(convo, &config()).unwrap();
        let bob_kp = bob.create_key_package().unwrap();

        let bundle = alice.add_members(convo, &[bob_kp.bytes]).unwrap();
        assert_eq!(bundle.target_epoch, 1);
        assert!(bundle.welcome.is_some());

        // Epoch has not advanced yet: the commit is only staged.
        assert_eq!(alice.current_epoch(convo).unwrap(), 0);

        let epoch = alice.merge_pending_commit(convo).unwrap();
        assert_eq!(epoch, 1);
    }

    #[test]
    fn welcome_join_converges_on_the_same_secret() {
        let convo = ConvoId(7);
        let mut alice = MlsEngine::new(member(1, 1));
        let mut bob = MlsEngine::new(member(2, 1));

        alice.create_group(convo, &config()).unwrap();
        let bob_kp = bob.create_key_package().unwrap();
        let bundle = alice.add_members(convo, &[bob_kp.bytes]).unwrap();
        alice.merge_pending_commit(convo).unwrap();

        let joined = bob.process_welcome(&bundle.welcome.unwrap(), &config()).unwrap();
        assert_eq!(joined.convo, convo);
        assert_eq!(joined.epoch, 1);
        assert_eq!(joined.members.len(), 2);

        // Both devices derive the same exporter secret for the epoch.
        let alice_secret = alice.export_epoch_secret(convo).unwrap();
        let bob_secret = bob.export_epoch_secret(convo).unwrap();
        assert_eq!(alice_secret, bob_secret);
    }

    #[test]
    fn remote_commit_is_staged_then_merged() {
        let convo = ConvoId(9);
        let mut alice = MlsEngine::new(member(1, 1));
        let mut bob = MlsEngine::new(member(2, 1));
        let mut carol = MlsEngine::new(member(3, 1));

        alice.create_group(convo, &config()).unwrap();
        let bob_kp = bob.create_key_package().unwrap();
        let bundle = alice.add_members(convo, &[bob_kp.bytes]).unwrap();
        alice.merge_pending_commit(convo).unwrap();
        bob.process_welcome(&bundle.welcome.unwrap(), &config()).unwrap();

        // Alice adds Carol; Bob sees the commit as a remote staged commit.
        let carol_kp = carol.create_key_package().unwrap();
        let bundle = alice.add_members(convo, &[carol_kp.bytes]).unwrap();
        alice.merge_pending_commit(convo).unwrap();

        let outcome = bob.process_protocol_message(convo, &bundle.commit).unwrap();
        assert_eq!(outcome, ProtocolOutcome::StagedCommit { current_epoch: 1 });

        let merged = bob.merge_staged_commit(convo).unwrap();
        assert_eq!(merged.epoch, 2);
        assert!(merged.active);

        let alice_secret = alice.export_epoch_secret(convo).unwrap();
        let bob_secret = bob.export_epoch_secret(convo).unwrap();
        assert_eq!(alice_secret, bob_secret);
    }

    #[test]
    fn removed_member_becomes_inactive() {
        let convo = ConvoId(11);
        let mut alice = MlsEngine::new(member(1, 1));
        let mut bob = MlsEngine::new(member(2, 1));

        alice.create_group(convo, &config()).unwrap();
        let bob_kp = bob.create_key_package().unwrap();
        let bundle = alice.add_members(convo, &[bob_kp.bytes]).unwrap();
        alice.merge_pending_commit(convo).unwrap();
        bob.process_welcome(&bundle.welcome.unwrap(), &config()).unwrap();

        let bundle = alice.remove_members(convo, &[member(2, 1)]).unwrap();
        assert!(bundle.welcome.is_none());
        alice.merge_pending_commit(convo).unwrap();

        let outcome = bob.process_protocol_message(convo, &bundle.commit).unwrap();
        assert!(matches!(outcome, ProtocolOutcome::StagedCommit { .. }));
        let merged = bob.merge_staged_commit(convo).unwrap();
        assert!(!merged.active, "removed member must observe inactivity");
    }

    #[test]
    fn welcome_without_bundles_signals_desync() {
        let convo = ConvoId(13);
        let mut alice = MlsEngine::new(member(1, 1));
        let mut bob = MlsEngine::new(member(2, 1));

        alice.create_group(convo, &config()).unwrap();
        let bob_kp = bob.create_key_package().unwrap();
        let bundle = alice.add_members(convo, &[bob_kp.bytes]).unwrap();
        alice.merge_pending_commit(convo).unwrap();

        // A device that lost its storage has no bundles.
        let mut fresh_bob = MlsEngine::new(member(2, 1));
        let result = fresh_bob.process_welcome(&bundle.welcome.unwrap(), &config());
        assert!(matches!(result, Err(EngineError::NoMatchingKeyPackage(_))));
    }

    #[test]
    fn snapshot_restore_preserves_groups() {
        let convo = ConvoId(15);
        let mut engine = MlsEngine::new(member(1, 1));
        engine.create_group(convo, &config()).unwrap();
        let secret_before = engine.export_epoch_secret(convo).unwrap();

        let blob = engine.snapshot().unwrap();

        let mut restored = MlsEngine::new(member(1, 1));
        restored.restore(&blob).unwrap();

        assert!(restored.has_group(convo));
        assert_eq!(restored.current_epoch(convo).unwrap(), 0);
        assert_eq!(restored.export_epoch_secret(convo).unwrap(), secret_before);
    }

    #[test]
    fn snapshot_restore_preserves_bundles_for_pending_welcomes() {
        let convo = ConvoId(17);
        let mut alice = MlsEngine::new(member(1, 1));
        let mut bob = MlsEngine::new(member(2, 1));

        alice.create_group(convo, &config()).unwrap();
        let bob_kp = bob.create_key_package().unwrap();

        // Bob restarts between publishing the key package and the Welcome
        // arriving. The restored engine must still decrypt it.
        let blob = bob.snapshot().unwrap();
        let mut restored_bob = MlsEngine::new(member(2, 1));
        restored_bob.restore(&blob).unwrap();

        let bundle = alice.add_members(convo, &[bob_kp.bytes]).unwrap();
        alice.merge_pending_commit(convo).unwrap();

        let joined = restored_bob.process_welcome(&bundle.welcome.unwrap(), &config()).unwrap();
        assert_eq!(joined.convo, convo);
        assert_eq!(joined.epoch, 1);
    }
}
