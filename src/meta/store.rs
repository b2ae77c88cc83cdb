use async_trait::async_trait;

use crate::codec::CollectionKey;
use crate::types::{BlobMeta, BlobRef, IntegrityVerificationJob, JobId, Volume, VolumeId};

/// Metadata operation errors
#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Key resolution failed: {0}")]
    KeyResolution(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A blob record together with its collection key, already unwrapped by the store.
#[derive(Debug, Clone)]
pub struct ResolvedBlobMeta {
    pub blob: BlobMeta,
    pub encryption_key: CollectionKey,
}

/// Metadata store abstract interface.
///
/// Implementations own the indexed persistence of blob, volume and job records.
/// Contract notes:
/// - `write_blob_created` and `write_blob_replicated` must update the blob record and
///   the volume counters in one transaction.
/// - `scan_blobs` returns records strictly after `after`, ordered by ref, so a saved
///   cursor resumes exactly.
/// - Absent records are reported as `MetaError::NotFound`, never as empty values.
#[async_trait]
#[auto_impl::auto_impl(&, std::sync::Arc)]
pub trait MetaStore: Send + Sync {
    /// Human readable backend name (for diagnostics and logging)
    fn name(&self) -> &'static str {
        "meta-store"
    }

    async fn query_blob_metadata(&self, blob_ref: &BlobRef) -> Result<ResolvedBlobMeta, MetaError>;

    async fn query_blob_crc32(&self, blob_ref: &BlobRef) -> Result<u32, MetaError>;

    async fn query_blob_exists(&self, blob_ref: &BlobRef) -> Result<bool, MetaError>;

    /// Current key of a collection; new blobs are encrypted with it.
    async fn query_collection_encryption_key_for_new_blobs(
        &self,
        collection_id: &str,
    ) -> Result<CollectionKey, MetaError>;

    async fn query_volume(&self, volume_id: VolumeId) -> Result<Volume, MetaError>;

    async fn write_blob_created(&self, blob: &BlobMeta, volume_id: VolumeId)
    -> Result<(), MetaError>;

    async fn write_blob_replicated(
        &self,
        blob_ref: &BlobRef,
        volume_id: VolumeId,
    ) -> Result<(), MetaError>;

    /// Blobs with a non-empty replication queue, ordered by ref.
    async fn blobs_pending_replication(&self, limit: usize) -> Result<Vec<BlobMeta>, MetaError>;

    async fn scan_blobs(
        &self,
        after: Option<&BlobRef>,
        limit: usize,
    ) -> Result<Vec<BlobMeta>, MetaError>;

    async fn load_integrity_job(&self, job_id: &JobId)
    -> Result<IntegrityVerificationJob, MetaError>;

    async fn save_integrity_job(&self, job: &IntegrityVerificationJob) -> Result<(), MetaError>;
}
