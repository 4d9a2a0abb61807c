//! Holdfast kernel: the shared key-value store contract and the coordination
//! primitives built on it.
//!
//! Everything above this crate (pause control, buffered counters) treats the
//! store as the only shared mutable state. Individual commands are atomic;
//! multi-step operations that must not interleave are expressed as [Script]s.

pub mod clock;
pub mod error;
pub mod exclusive_lease;
pub mod memory_store;
pub mod script;
pub mod sharded_store;
#[cfg(feature = "sqlite-persistence")]
pub mod sqlite_store;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::StoreError;
pub use exclusive_lease::{in_lock, ExclusiveLease, LeaseToken, EXCLUSIVE_LEASE_PREFIX};
pub use memory_store::InMemoryKeyValueStore;
pub use script::{run_script, Script, ScriptHost};
pub use sharded_store::{hash_slot, ShardedKeyValueStore, SLOT_COUNT};
#[cfg(feature = "sqlite-persistence")]
pub use sqlite_store::SqliteKeyValueStore;
pub use store::{KeyValueStore, ScoreRange, SharedStore};
