//! Per-principal contexts and their bounded manager.
//!
//! There is no process-wide singleton holding every principal's crypto
//! state. Each local principal gets an explicit [`PrincipalContext`] owning
//! its store handle, engine, and protocol state machines; a
//! [`ContextManager`] keyed by principal owns a bounded cache of these
//! contexts with least-recently-used eviction. Evicting a context drops its
//! store handle; reopening restores everything from persisted state,
//! including in-flight welcome admissions and recoveries.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use cachet_store::Store;
use cachet_types::{ConvoId, CoreConfig, MemberRef, PrincipalId};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::{
    engine::GroupEngine,
    env::Environment,
    error::CoreError,
    idempotency::IdempotentClient,
    ledger::EpochSecretLedger,
    net::NetworkClient,
    orchestrator::{ENGINE_STATE_BLOB, GroupLifecycleOrchestrator, SharedEngine},
    recovery::KeyPackageRecoveryFlow,
    welcome::WelcomeAdmissionProtocol,
};

/// Everything one local principal needs to operate: store, engine, and the
/// three protocol drivers, sharing the same handles.
pub struct PrincipalContext<S: Store, N: NetworkClient, E: Environment> {
    local: MemberRef,
    store: S,
    engine: SharedEngine,
    orchestrator: GroupLifecycleOrchestrator<S, N, E>,
    welcome: WelcomeAdmissionProtocol<S, N, E>,
    recovery: KeyPackageRecoveryFlow<S, N, E>,
}

impl<S: Store, N: NetworkClient, E: Environment> PrincipalContext<S, N, E> {
    /// Open a context: restore the engine from its persisted snapshot,
    /// complete any pending tombstone deletions, and wire the components.
    ///
    /// A snapshot that fails to restore is logged and discarded — the
    /// device then behaves like one that lost local state, which is
    /// exactly what the recovery flow exists to handle.
    pub fn open(
        local: MemberRef,
        store: S,
        mut engine: Box<dyn GroupEngine>,
        network: N,
        env: E,
        config: CoreConfig,
    ) -> Result<Self, CoreError> {
        let principal = local.principal;

        if let Some(blob) = store.blob(principal, ENGINE_STATE_BLOB)? {
            if let Err(err) = engine.restore(&blob) {
                warn!(%principal, error = %err, "engine snapshot restore failed, starting fresh");
            }
        }

        // Second step of any interrupted prune cycles.
        let ledger = EpochSecretLedger::new(principal, store.clone());
        for conversation in store.conversations(principal)? {
            ledger.sweep(conversation.convo)?;
        }

        let engine: SharedEngine = Arc::new(AsyncMutex::new(engine));
        let client = Arc::new(IdempotentClient::new(network, env.clone(), config.retry));

        let orchestrator = GroupLifecycleOrchestrator::new(
            local,
            store.clone(),
            engine.clone(),
            client.clone(),
            env.clone(),
            config.clone(),
        );
        let welcome = WelcomeAdmissionProtocol::new(
            principal,
            store.clone(),
            engine.clone(),
            client.clone(),
            env.clone(),
            config.clone(),
        );
        let recovery = KeyPackageRecoveryFlow::new(
            local,
            store.clone(),
            engine.clone(),
            client,
            env,
            config,
        );

        Ok(Self { local, store, engine, orchestrator, welcome, recovery })
    }

    /// The local (principal, device) this context acts as.
    pub fn local(&self) -> MemberRef {
        self.local
    }

    /// This context's principal.
    pub fn principal(&self) -> PrincipalId {
        self.local.principal
    }

    /// The store handle.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// The shared engine handle.
    pub fn engine(&self) -> &SharedEngine {
        &self.engine
    }

    /// Lifecycle operations.
    pub fn orchestrator(&self) -> &GroupLifecycleOrchestrator<S, N, E> {
        &self.orchestrator
    }

    /// Welcome admission protocol.
    pub fn welcome(&self) -> &WelcomeAdmissionProtocol<S, N, E> {
        &self.welcome
    }

    /// Key package recovery flow.
    pub fn recovery(&self) -> &KeyPackageRecoveryFlow<S, N, E> {
        &self.recovery
    }

    /// Resume protocols interrupted by a restart: re-drive pending welcome
    /// admissions and in-flight recoveries. Desync failures from admission
    /// are converted into tracked recoveries rather than surfaced.
    ///
    /// Returns the conversations that still have an unresolved failure.
    pub async fn resume(&self) -> Result<Vec<(ConvoId, CoreError)>, CoreError> {
        let mut unresolved = Vec::new();

        for record in self.welcome.pending()? {
            let convo = record.convo;
            match self.welcome.run(convo).await {
                Ok(()) => {},
                Err(CoreError::KeyPackageDesync { convo, reason }) => {
                    self.recovery.detect(convo, &reason)?;
                    if let Err(err) = self.recovery.run(convo).await {
                        unresolved.push((convo, err));
                    }
                },
                Err(err) => unresolved.push((convo, err)),
            }
        }

        for record in self.recovery.pending()? {
            let convo = record.convo;
            if let Err(err) = self.recovery.run(convo).await {
                unresolved.push((convo, err));
            }
        }

        Ok(unresolved)
    }
}

/// Opens a [`PrincipalContext`] for a principal on demand.
///
/// The seam that lets the manager stay agnostic of store paths, custody,
/// engines, and transports.
pub trait ContextOpener<S: Store, N: NetworkClient, E: Environment>: Send + Sync {
    /// Open (or re-open) the context for `principal`.
    fn open(&self, principal: PrincipalId) -> Result<PrincipalContext<S, N, E>, CoreError>;
}

impl<S, N, E, F> ContextOpener<S, N, E> for F
where
    S: Store,
    N: NetworkClient,
    E: Environment,
    F: Fn(PrincipalId) -> Result<PrincipalContext<S, N, E>, CoreError> + Send + Sync,
{
    fn open(&self, principal: PrincipalId) -> Result<PrincipalContext<S, N, E>, CoreError> {
        self(principal)
    }
}

/// Bounded, least-recently-used cache of open principal contexts.
pub struct ContextManager<S: Store, N: NetworkClient, E: Environment> {
    capacity: usize,
    opener: Box<dyn ContextOpener<S, N, E>>,
    /// Most-recently-used first.
    entries: StdMutex<Vec<(PrincipalId, Arc<PrincipalContext<S, N, E>>)>>,
}

impl<S: Store, N: NetworkClient, E: Environment> ContextManager<S, N, E> {
    /// Create a manager holding at most `capacity` open contexts.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize, opener: impl ContextOpener<S, N, E> + 'static) -> Self {
        assert!(capacity > 0, "context cache capacity must be at least 1");
        Self { capacity, opener: Box::new(opener), entries: StdMutex::new(Vec::new()) }
    }

    /// The context for `principal`, opening it if needed.
    ///
    /// Accessing a context marks it most recently used; opening one beyond
    /// capacity evicts the least recently used context, dropping its store
    /// handle.
    pub fn context(
        &self,
        principal: PrincipalId,
    ) -> Result<Arc<PrincipalContext<S, N, E>>, CoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(position) = entries.iter().position(|(id, _)| *id == principal) {
            let entry = entries.remove(position);
            let context = entry.1.clone();
            entries.insert(0, entry);
            return Ok(context);
        }

        let context = Arc::new(self.opener.open(principal)?);
        entries.insert(0, (principal, context.clone()));

        while entries.len() > self.capacity {
            if let Some((evicted, _)) = entries.pop() {
                info!(principal = %evicted, "evicted least-recently-used principal context");
            }
        }

        Ok(context)
    }

    /// Number of currently open contexts.
    pub fn open_count(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Drop the context for `principal`, if open.
    pub fn close(&self, principal: PrincipalId) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|(id, _)| *id != principal);
    }
}
