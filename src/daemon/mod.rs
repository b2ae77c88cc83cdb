//! Background controllers (replication, integrity verification)

pub mod integrity;
pub mod replication;

pub use integrity::{IntegrityController, JobOutcome};
pub use replication::{ReplicationController, ReplicationJob};
