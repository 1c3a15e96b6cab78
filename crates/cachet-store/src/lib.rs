//! Per-principal, at-rest-encrypted persistence.
//!
//! Trait-based abstraction over the durable store. The trait is synchronous
//! (no async) so protocol state machines stay free of runtime dependencies;
//! callers run storage work on worker tasks, never on a UI-affinitized
//! thread.
//!
//! Three implementations:
//!
//! - [`RedbStore`]: durable, redb-backed, values sealed with
//!   XChaCha20-Poly1305 before they touch disk. The AEAD key comes from an
//!   external [`KeyCustody`] service and is never persisted by the store.
//! - [`MemoryStore`]: plain in-memory map for tests.
//! - [`ChaoticStore`]: fault-injecting wrapper for chaos tests.
//!
//! Every operation takes an explicit [`cachet_types::PrincipalId`]; the
//! principal is the leading component of every storage key, which is the
//! tenancy boundary — no API can express a cross-principal read.

mod chaotic;
mod cipher;
mod custody;
mod error;
mod keys;
mod memory;
mod redb_store;
mod store;

pub use chaotic::ChaoticStore;
pub use cipher::StoreCipher;
pub use custody::{KeyCustody, StaticCustody};
pub use error::StorageError;
pub use memory::MemoryStore;
pub use redb_store::RedbStore;
pub use store::Store;
