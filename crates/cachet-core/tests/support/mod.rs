//! Shared test doubles: a deterministic stub engine and an in-memory fake
//! server.
//!
//! The stub engine models group state as a shared per-conversation seed:
//! every member derives the same epoch secret from (seed, epoch), so two
//! contexts driven through welcomes and commits converge exactly like real
//! engine instances, without any cryptography slowing the tests down.
//!
//! The fake server keeps a token -> result map per operation, so replaying
//! a call with the same idempotency token is a server-side no-op — which is
//! precisely the property the idempotency tests assert.

#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU32, Ordering},
    },
};

use async_trait::async_trait;
use cachet_core::{
    CoreError, FixedEnv, PrincipalContext,
    engine::{
        CommitBundle, CreatedKeyPackage, EngineError, GroupEngine, JoinedGroup, MergeOutcome,
        ProtocolOutcome,
    },
    net::{
        ConversationInit, KeyPackageAd, MembershipChange, NetError, NetworkClient, OutboundMessage,
        RejoinGrant, RejoinReason, WelcomeOutcome,
    },
};
use cachet_store::MemoryStore;
use cachet_types::{ConvoId, CoreConfig, DeviceId, GroupConfig, IdempotencyKey, MemberRef,
    PrincipalId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ---------------------------------------------------------------------------
// Stub engine
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone)]
struct StubKeyPackage {
    member: MemberRef,
    nonce: u64,
}

#[derive(Serialize, Deserialize, Clone)]
struct StubWelcome {
    convo: u128,
    epoch: u64,
    seed: [u8; 32],
    members: Vec<MemberRef>,
    kp_refs: Vec<Vec<u8>>,
}

#[derive(Serialize, Deserialize, Clone)]
struct StubCommit {
    convo: u128,
    new_epoch: u64,
    added: Vec<MemberRef>,
    removed: Vec<MemberRef>,
}

#[derive(Serialize, Deserialize, Clone)]
struct StubGroup {
    epoch: u64,
    seed: [u8; 32],
    members: Vec<MemberRef>,
}

#[derive(Serialize, Deserialize, Default)]
struct StubState {
    groups: HashMap<u128, StubGroup>,
    bundles: Vec<Vec<u8>>,
    kp_counter: u64,
}

struct PendingStub {
    target_epoch: u64,
    added: Vec<MemberRef>,
    removed: Vec<MemberRef>,
}

fn cbor<T: Serialize>(value: &T) -> Vec<u8> {
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(value, &mut bytes).unwrap();
    bytes
}

fn uncbor<T: for<'de> Deserialize<'de>>(bytes: &[u8], what: &str) -> Result<T, EngineError> {
    ciborium::de::from_reader(bytes)
        .map_err(|e| EngineError::Serialization(format!("{what}: {e}")))
}

fn kp_hash(bytes: &[u8]) -> Vec<u8> {
    Sha256::digest(bytes).to_vec()
}

/// The per-conversation seed the stub engine derives for a creator.
/// Deterministic, so tests can reconstruct it to mint rejoin grants.
pub fn stub_seed(convo: ConvoId, creator: MemberRef) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"stub-seed");
    hasher.update(convo.to_be_bytes());
    hasher.update(creator.to_credential_bytes());
    hasher.finalize().into()
}

/// The epoch secret every member derives for (seed, epoch).
pub fn stub_epoch_secret(seed: &[u8; 32], epoch: u64) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(b"stub-epoch");
    hasher.update(seed);
    hasher.update(epoch.to_be_bytes());
    hasher.finalize().to_vec()
}

/// Deterministic [`GroupEngine`] for orchestration tests.
pub struct StubEngine {
    local: MemberRef,
    groups: HashMap<u128, StubGroup>,
    bundles: HashSet<Vec<u8>>,
    pending: HashMap<u128, PendingStub>,
    staged: HashMap<u128, StubCommit>,
    kp_counter: u64,
    /// Counts every successful welcome processing, shared across "restarts"
    /// so tests can assert a key package was consumed exactly once.
    welcome_count: Arc<AtomicU32>,
}

impl StubEngine {
    pub fn new(local: MemberRef, welcome_count: Arc<AtomicU32>) -> Self {
        Self {
            local,
            groups: HashMap::new(),
            bundles: HashSet::new(),
            pending: HashMap::new(),
            staged: HashMap::new(),
            kp_counter: 0,
            welcome_count,
        }
    }

    /// The seed a test needs to prepare rejoin grants for a conversation.
    pub fn group_seed(&self, convo: ConvoId) -> Option<[u8; 32]> {
        self.groups.get(&convo.0).map(|g| g.seed)
    }
}

impl GroupEngine for StubEngine {
    fn create_group(&mut self, convo: ConvoId, _config: &GroupConfig) -> Result<u64, EngineError> {
        let seed = stub_seed(convo, self.local);
        self.groups
            .insert(convo.0, StubGroup { epoch: 0, seed, members: vec![self.local] });
        Ok(0)
    }

    fn create_key_package(&mut self) -> Result<CreatedKeyPackage, EngineError> {
        self.kp_counter += 1;
        let bytes = cbor(&StubKeyPackage { member: self.local, nonce: self.kp_counter });
        let hash_ref = kp_hash(&bytes);
        self.bundles.insert(hash_ref.clone());
        Ok(CreatedKeyPackage { bytes, hash_ref, cipher_suite: 1 })
    }

    fn add_members(
        &mut self,
        convo: ConvoId,
        key_packages: &[Vec<u8>],
    ) -> Result<CommitBundle, EngineError> {
        let group = self.groups.get(&convo.0).ok_or(EngineError::GroupNotFound(convo))?;
        let target_epoch = group.epoch + 1;

        let mut added = Vec::new();
        let mut kp_refs = Vec::new();
        for bytes in key_packages {
            let kp: StubKeyPackage = uncbor(bytes, "key package")?;
            added.push(kp.member);
            kp_refs.push(kp_hash(bytes));
        }

        let mut members = group.members.clone();
        members.extend(added.iter().copied());
        let welcome = cbor(&StubWelcome {
            convo: convo.0,
            epoch: target_epoch,
            seed: group.seed,
            members,
            kp_refs,
        });
        let commit = cbor(&StubCommit {
            convo: convo.0,
            new_epoch: target_epoch,
            added: added.clone(),
            removed: vec![],
        });

        self.pending.insert(convo.0, PendingStub { target_epoch, added, removed: vec![] });
        Ok(CommitBundle { commit, welcome: Some(welcome), target_epoch })
    }

    fn remove_members(
        &mut self,
        convo: ConvoId,
        members: &[MemberRef],
    ) -> Result<CommitBundle, EngineError> {
        let group = self.groups.get(&convo.0).ok_or(EngineError::GroupNotFound(convo))?;
        let target_epoch = group.epoch + 1;

        let commit = cbor(&StubCommit {
            convo: convo.0,
            new_epoch: target_epoch,
            added: vec![],
            removed: members.to_vec(),
        });
        self.pending.insert(convo.0, PendingStub {
            target_epoch,
            added: vec![],
            removed: members.to_vec(),
        });
        Ok(CommitBundle { commit, welcome: None, target_epoch })
    }

    fn merge_pending_commit(&mut self, convo: ConvoId) -> Result<u64, EngineError> {
        let pending = self.pending.remove(&convo.0).ok_or(EngineError::NoPendingCommit(convo))?;
        let group = self.groups.get_mut(&convo.0).ok_or(EngineError::GroupNotFound(convo))?;

        group.epoch = pending.target_epoch;
        group.members.extend(pending.added);
        group.members.retain(|m| !pending.removed.contains(m));
        Ok(group.epoch)
    }

    fn clear_pending_commit(&mut self, convo: ConvoId) -> Result<(), EngineError> {
        self.pending.remove(&convo.0);
        Ok(())
    }

    fn process_protocol_message(
        &mut self,
        convo: ConvoId,
        message: &[u8],
    ) -> Result<ProtocolOutcome, EngineError> {
        let group = self.groups.get(&convo.0).ok_or(EngineError::GroupNotFound(convo))?;
        let commit: StubCommit = uncbor(message, "commit")?;

        if commit.convo != convo.0 {
            return Err(EngineError::Crypto("commit for a different group".to_string()));
        }
        if commit.new_epoch != group.epoch + 1 {
            return Err(EngineError::Crypto(format!(
                "commit targets epoch {} but group is at {}",
                commit.new_epoch, group.epoch
            )));
        }

        let current_epoch = group.epoch;
        self.staged.insert(convo.0, commit);
        Ok(ProtocolOutcome::StagedCommit { current_epoch })
    }

    fn merge_staged_commit(&mut self, convo: ConvoId) -> Result<MergeOutcome, EngineError> {
        let commit = self.staged.remove(&convo.0).ok_or(EngineError::NoStagedCommit(convo))?;
        let group = self.groups.get_mut(&convo.0).ok_or(EngineError::GroupNotFound(convo))?;

        group.epoch = commit.new_epoch;
        group.members.extend(commit.added);
        group.members.retain(|m| !commit.removed.contains(m));

        let active = group.members.contains(&self.local);
        Ok(MergeOutcome { epoch: group.epoch, active })
    }

    fn process_welcome(
        &mut self,
        welcome: &[u8],
        _config: &GroupConfig,
    ) -> Result<JoinedGroup, EngineError> {
        let welcome: StubWelcome = uncbor(welcome, "welcome")?;

        let matching = welcome.kp_refs.iter().find(|r| self.bundles.contains(*r)).cloned();
        let Some(used) = matching else {
            return Err(EngineError::NoMatchingKeyPackage(
                "no key package bundles available".to_string(),
            ));
        };
        self.bundles.remove(&used);

        let convo = ConvoId(welcome.convo);
        self.groups.insert(welcome.convo, StubGroup {
            epoch: welcome.epoch,
            seed: welcome.seed,
            members: welcome.members.clone(),
        });
        self.welcome_count.fetch_add(1, Ordering::SeqCst);

        Ok(JoinedGroup { convo, epoch: welcome.epoch, members: welcome.members })
    }

    fn export_epoch_secret(&mut self, convo: ConvoId) -> Result<Vec<u8>, EngineError> {
        let group = self.groups.get(&convo.0).ok_or(EngineError::GroupNotFound(convo))?;
        Ok(stub_epoch_secret(&group.seed, group.epoch))
    }

    fn current_epoch(&self, convo: ConvoId) -> Result<u64, EngineError> {
        Ok(self.groups.get(&convo.0).ok_or(EngineError::GroupNotFound(convo))?.epoch)
    }

    fn group_members(&self, convo: ConvoId) -> Result<Vec<MemberRef>, EngineError> {
        Ok(self.groups.get(&convo.0).ok_or(EngineError::GroupNotFound(convo))?.members.clone())
    }

    fn has_group(&self, convo: ConvoId) -> bool {
        self.groups.contains_key(&convo.0)
    }

    fn delete_group(&mut self, convo: ConvoId) -> Result<(), EngineError> {
        self.groups.remove(&convo.0);
        self.pending.remove(&convo.0);
        self.staged.remove(&convo.0);
        Ok(())
    }

    fn snapshot(&self) -> Result<Vec<u8>, EngineError> {
        Ok(cbor(&StubState {
            groups: self.groups.clone(),
            bundles: self.bundles.iter().cloned().collect(),
            kp_counter: self.kp_counter,
        }))
    }

    fn restore(&mut self, blob: &[u8]) -> Result<(), EngineError> {
        let state: StubState = ciborium::de::from_reader(blob)
            .map_err(|e| EngineError::Snapshot(e.to_string()))?;
        self.groups = state.groups;
        self.bundles = state.bundles.into_iter().collect();
        self.kp_counter = state.kp_counter;
        self.pending.clear();
        self.staged.clear();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fake server
// ---------------------------------------------------------------------------

/// Template the fake server uses to mint rejoin grants.
#[derive(Clone)]
pub struct RejoinTemplate {
    pub epoch: u64,
    pub seed: [u8; 32],
    pub members: Vec<MemberRef>,
}

#[derive(Default)]
struct ServerState {
    seen: HashSet<IdempotencyKey>,
    conversations: HashMap<u128, Option<Vec<u8>>>,
    commits: Vec<(MembershipChange, IdempotencyKey)>,
    messages: HashMap<u128, Vec<(OutboundMessage, IdempotencyKey)>>,
    key_packages: Vec<(KeyPackageAd, IdempotencyKey)>,
    confirmations: Vec<(ConvoId, WelcomeOutcome, IdempotencyKey)>,
    rejoins: Vec<(ConvoId, IdempotencyKey)>,
    rejoin_templates: HashMap<u128, RejoinTemplate>,
    fail_plan: HashMap<&'static str, VecDeque<NetError>>,
    calls: Vec<(&'static str, IdempotencyKey)>,
}

/// In-memory server double with per-token no-op replay.
#[derive(Clone, Default)]
pub struct FakeServer {
    state: Arc<Mutex<ServerState>>,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `count` failures for the named operation.
    pub fn fail_next(&self, op: &'static str, err: NetError, count: usize) {
        let mut state = self.lock();
        let queue = state.fail_plan.entry(op).or_default();
        for _ in 0..count {
            queue.push_back(err.clone());
        }
    }

    /// Prepare the grant the server hands out for rejoin requests.
    pub fn set_rejoin_template(&self, convo: ConvoId, template: RejoinTemplate) {
        self.lock().rejoin_templates.insert(convo.0, template);
    }

    /// The welcome attached to a created conversation, for "delivery".
    pub fn welcome_for(&self, convo: ConvoId) -> Option<Vec<u8>> {
        self.lock().conversations.get(&convo.0).cloned().flatten()
    }

    /// Observable messages for a conversation (one per token).
    pub fn message_count(&self, convo: ConvoId) -> usize {
        self.lock().messages.get(&convo.0).map_or(0, Vec::len)
    }

    pub fn confirmations(&self, convo: ConvoId) -> Vec<WelcomeOutcome> {
        self.lock()
            .confirmations
            .iter()
            .filter(|(c, _, _)| *c == convo)
            .map(|(_, outcome, _)| outcome.clone())
            .collect()
    }

    /// Tokens seen for the named operation, in call order.
    pub fn tokens_for(&self, op: &'static str) -> Vec<IdempotencyKey> {
        self.lock()
            .calls
            .iter()
            .filter(|(name, _)| *name == op)
            .map(|(_, token)| *token)
            .collect()
    }

    pub fn rejoin_count(&self, convo: ConvoId) -> usize {
        self.lock().rejoins.iter().filter(|(c, _)| *c == convo).count()
    }

    /// The most recently announced membership commit.
    pub fn last_commit(&self) -> Option<Vec<u8>> {
        self.lock().commits.last().map(|(change, _)| change.commit.clone())
    }

    /// The most recently published key package, as (bytes, hash ref).
    pub fn latest_key_package(&self) -> Option<(Vec<u8>, Vec<u8>)> {
        self.lock().key_packages.last().map(|(ad, _)| (ad.bytes.clone(), ad.hash_ref.clone()))
    }

    /// Record the call; pop a planned failure or detect a token replay.
    fn begin(&self, op: &'static str, token: IdempotencyKey) -> Result<bool, NetError> {
        let mut state = self.lock();
        state.calls.push((op, token));

        if let Some(err) = state.fail_plan.get_mut(op).and_then(VecDeque::pop_front) {
            return Err(err);
        }

        Ok(!state.seen.insert(token))
    }
}

#[async_trait]
impl NetworkClient for FakeServer {
    async fn create_conversation(
        &self,
        init: ConversationInit,
        token: IdempotencyKey,
    ) -> Result<(), NetError> {
        if self.begin("create_conversation", token)? {
            return Ok(());
        }
        self.lock().conversations.insert(init.convo.0, init.welcome);
        Ok(())
    }

    async fn add_members(
        &self,
        change: MembershipChange,
        token: IdempotencyKey,
    ) -> Result<(), NetError> {
        if self.begin("add_members", token)? {
            return Ok(());
        }
        self.lock().commits.push((change, token));
        Ok(())
    }

    async fn remove_members(
        &self,
        change: MembershipChange,
        token: IdempotencyKey,
    ) -> Result<(), NetError> {
        if self.begin("remove_members", token)? {
            return Ok(());
        }
        self.lock().commits.push((change, token));
        Ok(())
    }

    async fn send_message(
        &self,
        message: OutboundMessage,
        token: IdempotencyKey,
    ) -> Result<(), NetError> {
        if self.begin("send_message", token)? {
            return Ok(());
        }
        self.lock().messages.entry(message.convo.0).or_default().push((message, token));
        Ok(())
    }

    async fn publish_key_package(
        &self,
        ad: KeyPackageAd,
        token: IdempotencyKey,
    ) -> Result<(), NetError> {
        if self.begin("publish_key_package", token)? {
            return Ok(());
        }
        self.lock().key_packages.push((ad, token));
        Ok(())
    }

    async fn confirm_welcome(
        &self,
        convo: ConvoId,
        outcome: WelcomeOutcome,
        token: IdempotencyKey,
    ) -> Result<(), NetError> {
        if self.begin("confirm_welcome", token)? {
            return Ok(());
        }
        self.lock().confirmations.push((convo, outcome, token));
        Ok(())
    }

    async fn request_rejoin(
        &self,
        convo: ConvoId,
        key_package: Vec<u8>,
        _reason: RejoinReason,
        token: IdempotencyKey,
    ) -> Result<RejoinGrant, NetError> {
        // Record even replays; the grant is deterministic per template.
        if let Err(err) = self.begin("request_rejoin", token) {
            return Err(err);
        }

        let mut state = self.lock();
        let template = state
            .rejoin_templates
            .get(&convo.0)
            .cloned()
            .ok_or_else(|| NetError::Rejected("no rejoin template configured".to_string()))?;
        state.rejoins.push((convo, token));

        let welcome = cbor(&StubWelcome {
            convo: convo.0,
            epoch: template.epoch,
            seed: template.seed,
            members: template.members,
            kp_refs: vec![kp_hash(&key_package)],
        });
        Ok(RejoinGrant { welcome })
    }
}

// ---------------------------------------------------------------------------
// Context plumbing
// ---------------------------------------------------------------------------

pub type TestContext = PrincipalContext<MemoryStore, FakeServer, FixedEnv>;

pub fn member(principal: u64, device: u64) -> MemberRef {
    MemberRef { principal: PrincipalId(principal), device: DeviceId(device) }
}

/// Open a context over the given store, as one would after a process start.
pub fn open_context(
    store: MemoryStore,
    server: FakeServer,
    local: MemberRef,
    welcome_count: Arc<AtomicU32>,
    env_seed: u64,
) -> Result<TestContext, CoreError> {
    let engine = Box::new(StubEngine::new(local, welcome_count));
    let env = FixedEnv::new(1_700_000_000, env_seed);
    PrincipalContext::open(local, store, engine, server, env, CoreConfig::default())
}

/// Corrupt the persisted engine snapshot: the next open falls back to a
/// fresh engine, which is the storage-loss signature.
pub fn corrupt_engine_blob(store: &MemoryStore, principal: PrincipalId) {
    use cachet_store::Store;
    store.put_blob(principal, cachet_core::orchestrator::ENGINE_STATE_BLOB, b"corrupt").unwrap();
}

/// Fetch a published key package from the server and shape it as an
/// orchestrator invitee.
pub fn invitee_from_server(server: &FakeServer, member: MemberRef) -> cachet_core::Invitee {
    let state = server.lock();
    let (ad, _) = state.key_packages.last().expect("a key package was published");
    cachet_core::Invitee {
        member,
        key_package: ad.bytes.clone(),
        hash_ref: ad.hash_ref.clone(),
    }
}
