//! Shared data model for the Cachet encrypted group-messaging core.
//!
//! This crate sits at the bottom of the workspace dependency graph and holds
//! the logical schema shared by the store and the orchestration layer:
//! identifiers, persisted entity records, protocol state enums, and
//! configuration knobs. All record types derive `serde` traits and are
//! persisted as CBOR by the store.
//!
//! Every entity is scoped to a single local principal. The scoping is
//! enforced by the storage layer (composite keys), but the types here carry
//! the principal identifier explicitly so no API has an implicit global
//! identity.

mod config;
mod ids;
mod records;

pub use config::{CoreConfig, GroupConfig, RetentionPolicy, RetryPolicy};
pub use ids::{ConvoId, DeviceId, IdempotencyKey, MemberRef, PrincipalId};
pub use records::{
    ConversationPhase, ConversationRecord, EpochKeyRecord, KeyPackageRecord, MemberRecord,
    MessageRecord, RecoveryPhase, RecoveryRecord, SealedMessage, WelcomePhase, WelcomeRecord,
};
