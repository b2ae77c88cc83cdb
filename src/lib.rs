// Library crate for rkblob: blob placement, replication and scrubbing for a NAS core.

pub mod cadapter;
pub mod codec;
pub mod config;
pub mod daemon;
pub mod diskaccess;
pub mod error;
pub mod keystore;
pub mod meta;
pub mod types;

// Public surface for embedders.
pub use crate::cadapter::{BlobDriver, BlobReader, DriverConfig, InMemoryDriver, LocalFsDriver};
pub use crate::codec::{CollectionKey, decode_blob, encode_blob};
pub use crate::config::{Config, ConfigError, IntegrityConfig, KeyStoreConfig, ReplicationConfig};
pub use crate::daemon::{IntegrityController, JobOutcome, ReplicationController, ReplicationJob};
pub use crate::diskaccess::{DiskAccessController, VolumeDescriptor};
pub use crate::error::{Result, StoreError};
pub use crate::keystore::{KeyEnvelope, KeySlot, KeyStore, KeyStoreError};
pub use crate::meta::{InMemoryMetaStore, MetaError, MetaStore, ResolvedBlobMeta};
pub use crate::types::{
    BlobMeta, BlobRef, IntegrityVerificationJob, JobId, Volume, VolumeId, VolumeMount,
};
