//! Cachet encrypted group-messaging core.
//!
//! Orchestrates cryptographic group state — epochs, member key material,
//! invitations, recovery — against an external MLS engine, with every piece
//! of state the engine cannot regenerate persisted through the encrypted
//! store *before* the engine is allowed to move past it.
//!
//! # Components
//!
//! - [`ledger::EpochSecretLedger`] — retains per-epoch secrets with
//!   tombstone-then-delete pruning.
//! - [`orchestrator::GroupLifecycleOrchestrator`] — group creation,
//!   membership commits, message send/receive; enforces the
//!   persist-before-advance ordering invariant structurally.
//! - [`welcome::WelcomeAdmissionProtocol`] — two-phase invitation
//!   admission with a server confirmation.
//! - [`recovery::KeyPackageRecoveryFlow`] — guided rejoin after local key
//!   material loss.
//! - [`idempotency::IdempotentClient`] — token discipline for every
//!   state-mutating network call.
//! - [`context::ContextManager`] — bounded LRU cache of per-principal
//!   contexts; there is no process-wide singleton.
//!
//! # Threading
//!
//! The core is a library driven from worker tasks. Storage and engine
//! calls are synchronous and must not run on a UI-affinitized thread;
//! operations on the same conversation are serialized internally, while
//! different conversations proceed in parallel.

pub mod cipher;
pub mod context;
pub mod engine;
pub mod env;
pub mod error;
pub mod idempotency;
pub mod ledger;
pub mod net;
pub mod orchestrator;
pub mod recovery;
pub mod welcome;

pub use context::{ContextManager, ContextOpener, PrincipalContext};
pub use engine::{GroupEngine, MlsEngine};
pub use env::{Environment, FixedEnv, SystemEnv};
pub use error::CoreError;
pub use idempotency::{IdempotentClient, OperationKey};
pub use ledger::EpochSecretLedger;
pub use net::{NetError, NetworkClient};
pub use orchestrator::{
    EpochAdvance, GroupLifecycleOrchestrator, Invitee, ProcessOutcome, SharedEngine,
};
pub use recovery::KeyPackageRecoveryFlow;
pub use welcome::WelcomeAdmissionProtocol;
