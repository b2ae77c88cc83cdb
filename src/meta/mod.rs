//! Metadata collaborator
//!
//! Responsibilities:
//! - Answer blob lookups for the disk access controller, handing out the blob's
//!   collection key already unwrapped.
//! - Persist blob creation and replica confirmation atomically with the owning
//!   volume's counters.
//! - Feed the replication and integrity controllers (pending replicas, ordered scans,
//!   integrity job checkpoints).
//!
pub mod memory;
pub mod store;

pub use memory::InMemoryMetaStore;
pub use store::{MetaError, MetaStore, ResolvedBlobMeta};
