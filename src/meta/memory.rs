//! In-memory metadata store
//!
//! Single-process reference implementation of `MetaStore`. All state sits behind one
//! mutex, which doubles as the transaction boundary for blob + volume counter updates.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use tracing::debug;

use crate::codec::CollectionKey;
use crate::keystore::{KeyEnvelope, KeyStore};
use crate::meta::store::{MetaError, MetaStore, ResolvedBlobMeta};
use crate::types::{BlobMeta, BlobRef, IntegrityVerificationJob, JobId, Volume, VolumeId};

#[derive(Default)]
struct State {
    blobs: BTreeMap<BlobRef, BlobMeta>,
    volumes: BTreeMap<VolumeId, Volume>,
    /// collection id -> id of the DEK used for new blobs
    collections: HashMap<String, String>,
    envelopes: HashMap<String, KeyEnvelope>,
    jobs: HashMap<JobId, IntegrityVerificationJob>,
}

pub struct InMemoryMetaStore {
    state: Mutex<State>,
    keystore: Arc<KeyStore>,
}

impl InMemoryMetaStore {
    pub fn new(keystore: Arc<KeyStore>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            keystore,
        }
    }

    pub fn keystore(&self) -> &Arc<KeyStore> {
        &self.keystore
    }

    pub fn add_volume(&self, volume: Volume) {
        self.state.lock().volumes.insert(volume.id, volume);
    }

    pub fn volume(&self, volume_id: VolumeId) -> Option<Volume> {
        self.state.lock().volumes.get(&volume_id).cloned()
    }

    /// Registers a key envelope and makes it the key for new blobs of `collection_id`.
    /// Older envelopes stay resolvable for blobs written under them.
    pub fn add_collection(&self, collection_id: impl Into<String>, envelope: KeyEnvelope) {
        let mut state = self.state.lock();
        state
            .collections
            .insert(collection_id.into(), envelope.key_id.clone());
        state.envelopes.insert(envelope.key_id.clone(), envelope);
    }

    pub fn blob(&self, blob_ref: &BlobRef) -> Option<BlobMeta> {
        self.state.lock().blobs.get(blob_ref).cloned()
    }

    /// Marks blobs as referenced by a commit and queues the replicas the policy still
    /// wants: pending = desired - current.
    pub fn commit_blob_references(
        &self,
        refs: &[BlobRef],
        desired_volumes: &[VolumeId],
    ) -> Result<(), MetaError> {
        let mut state = self.state.lock();
        if let Some(missing) = refs.iter().find(|r| !state.blobs.contains_key(*r)) {
            return Err(MetaError::NotFound(format!("blob {missing}")));
        }
        for r in refs {
            if let Some(blob) = state.blobs.get_mut(r) {
                blob.referenced = true;
                blob.volumes_pending_replication = desired_volumes
                    .iter()
                    .copied()
                    .filter(|v| !blob.volumes.contains(v))
                    .collect();
            }
        }
        Ok(())
    }

    fn resolve_key(&self, key_id: &str) -> Result<CollectionKey, MetaError> {
        let envelope = self
            .state
            .lock()
            .envelopes
            .get(key_id)
            .cloned()
            .ok_or_else(|| MetaError::KeyResolution(format!("no envelope for key {key_id}")))?;
        let dek = self
            .keystore
            .decrypt_dek(&envelope)
            .map_err(|e| MetaError::KeyResolution(e.to_string()))?;
        CollectionKey::new(key_id, &dek).map_err(|e| MetaError::KeyResolution(e.to_string()))
    }
}

#[async_trait]
impl MetaStore for InMemoryMetaStore {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    async fn query_blob_metadata(&self, blob_ref: &BlobRef) -> Result<ResolvedBlobMeta, MetaError> {
        let blob = self
            .blob(blob_ref)
            .ok_or_else(|| MetaError::NotFound(format!("blob {blob_ref}")))?;
        let encryption_key = self.resolve_key(&blob.encryption_key_id)?;
        Ok(ResolvedBlobMeta {
            blob,
            encryption_key,
        })
    }

    async fn query_blob_crc32(&self, blob_ref: &BlobRef) -> Result<u32, MetaError> {
        self.state
            .lock()
            .blobs
            .get(blob_ref)
            .map(|b| b.crc32)
            .ok_or_else(|| MetaError::NotFound(format!("blob {blob_ref}")))
    }

    async fn query_blob_exists(&self, blob_ref: &BlobRef) -> Result<bool, MetaError> {
        Ok(self.state.lock().blobs.contains_key(blob_ref))
    }

    async fn query_collection_encryption_key_for_new_blobs(
        &self,
        collection_id: &str,
    ) -> Result<CollectionKey, MetaError> {
        let key_id = self
            .state
            .lock()
            .collections
            .get(collection_id)
            .cloned()
            .ok_or_else(|| MetaError::NotFound(format!("collection {collection_id}")))?;
        self.resolve_key(&key_id)
    }

    async fn query_volume(&self, volume_id: VolumeId) -> Result<Volume, MetaError> {
        self.volume(volume_id)
            .ok_or_else(|| MetaError::NotFound(format!("volume {volume_id}")))
    }

    async fn write_blob_created(&self, blob: &BlobMeta, volume_id: VolumeId) -> Result<(), MetaError> {
        let mut state = self.state.lock();
        if state.blobs.contains_key(&blob.blob_ref) {
            return Err(MetaError::AlreadyExists(format!("blob {}", blob.blob_ref)));
        }
        let volume = state
            .volumes
            .get_mut(&volume_id)
            .ok_or_else(|| MetaError::NotFound(format!("volume {volume_id}")))?;
        volume.blob_count += 1;
        volume.blob_size_total += blob.size_on_disk;

        let mut record = blob.clone();
        record.volumes_pending_replication.retain(|v| *v != volume_id);
        if !record.volumes.contains(&volume_id) {
            record.volumes.push(volume_id);
        }
        state.blobs.insert(record.blob_ref, record);
        debug!(blob = %blob.blob_ref, volume_id, "blob created");
        Ok(())
    }

    async fn write_blob_replicated(
        &self,
        blob_ref: &BlobRef,
        volume_id: VolumeId,
    ) -> Result<(), MetaError> {
        let mut state = self.state.lock();
        let State { blobs, volumes, .. } = &mut *state;

        let blob = blobs
            .get_mut(blob_ref)
            .ok_or_else(|| MetaError::NotFound(format!("blob {blob_ref}")))?;
        let volume = volumes
            .get_mut(&volume_id)
            .ok_or_else(|| MetaError::NotFound(format!("volume {volume_id}")))?;

        blob.volumes_pending_replication.retain(|v| *v != volume_id);
        if blob.volumes.contains(&volume_id) {
            // already confirmed; a rediscovered job must not double-count
            return Ok(());
        }
        blob.volumes.push(volume_id);
        volume.blob_count += 1;
        volume.blob_size_total += blob.size_on_disk;
        debug!(blob = %blob_ref, volume_id, "replica confirmed");
        Ok(())
    }

    async fn blobs_pending_replication(&self, limit: usize) -> Result<Vec<BlobMeta>, MetaError> {
        Ok(self
            .state
            .lock()
            .blobs
            .values()
            .filter(|b| !b.volumes_pending_replication.is_empty())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn scan_blobs(
        &self,
        after: Option<&BlobRef>,
        limit: usize,
    ) -> Result<Vec<BlobMeta>, MetaError> {
        let lower = match after {
            Some(r) => Bound::Excluded(*r),
            None => Bound::Unbounded,
        };
        Ok(self
            .state
            .lock()
            .blobs
            .range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(_, b)| b.clone())
            .collect())
    }

    async fn load_integrity_job(&self, job_id: &JobId) -> Result<IntegrityVerificationJob, MetaError> {
        self.state
            .lock()
            .jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| MetaError::NotFound(format!("integrity job {job_id}")))
    }

    async fn save_integrity_job(&self, job: &IntegrityVerificationJob) -> Result<(), MetaError> {
        self.state.lock().jobs.insert(job.id, job.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(content: &[u8]) -> BlobMeta {
        BlobMeta {
            blob_ref: BlobRef::from_content(content),
            encryption_key_id: "dek".into(),
            volumes: vec![],
            volumes_pending_replication: vec![],
            referenced: false,
            is_compressed: false,
            size: content.len() as u64,
            size_on_disk: content.len() as u64,
            crc32: 0,
        }
    }

    fn store() -> InMemoryMetaStore {
        let store = InMemoryMetaStore::new(Arc::new(KeyStore::default()));
        store.add_volume(Volume::new(1, "one"));
        store.add_volume(Volume::new(2, "two"));
        store
    }

    #[tokio::test]
    async fn test_created_and_replicated_keep_counters() {
        let store = store();
        let b = blob(b"abc");
        store.write_blob_created(&b, 1).await.unwrap();
        assert!(store.query_blob_exists(&b.blob_ref).await.unwrap());
        assert!(matches!(
            store.write_blob_created(&b, 1).await,
            Err(MetaError::AlreadyExists(_))
        ));

        store.commit_blob_references(&[b.blob_ref], &[1, 2]).unwrap();
        let rec = store.blob(&b.blob_ref).unwrap();
        assert!(rec.referenced);
        assert_eq!(rec.volumes, vec![1]);
        assert_eq!(rec.volumes_pending_replication, vec![2]);

        store.write_blob_replicated(&b.blob_ref, 2).await.unwrap();
        store.write_blob_replicated(&b.blob_ref, 2).await.unwrap();
        let rec = store.blob(&b.blob_ref).unwrap();
        assert_eq!(rec.volumes, vec![1, 2]);
        assert!(rec.volumes_pending_replication.is_empty());

        assert_eq!(store.volume(1).unwrap().blob_count, 1);
        assert_eq!(store.volume(2).unwrap().blob_count, 1);
        assert_eq!(store.volume(2).unwrap().blob_size_total, 3);
    }

    #[tokio::test]
    async fn test_scan_is_ordered_and_exclusive() {
        let store = store();
        for i in 0..10u8 {
            store.write_blob_created(&blob(&[i]), 1).await.unwrap();
        }
        let first = store.scan_blobs(None, 4).await.unwrap();
        assert_eq!(first.len(), 4);
        assert!(first.windows(2).all(|w| w[0].blob_ref < w[1].blob_ref));

        let cursor = first.last().unwrap().blob_ref;
        let rest = store.scan_blobs(Some(&cursor), 100).await.unwrap();
        assert_eq!(rest.len(), 6);
        assert!(rest.iter().all(|b| b.blob_ref > cursor));
    }

    #[tokio::test]
    async fn test_pending_replication_query() {
        let store = store();
        let a = blob(b"a");
        let b = blob(b"b");
        store.write_blob_created(&a, 1).await.unwrap();
        store.write_blob_created(&b, 1).await.unwrap();
        store.commit_blob_references(&[a.blob_ref], &[1, 2]).unwrap();
        store.commit_blob_references(&[b.blob_ref], &[1]).unwrap();

        let pending = store.blobs_pending_replication(100).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].blob_ref, a.blob_ref);
        assert!(store.commit_blob_references(&[blob(b"zz").blob_ref], &[1]).is_err());
    }

    #[tokio::test]
    async fn test_collection_key_resolution() {
        let store = store();
        let fp = store
            .keystore()
            .register_private_key(KeyStore::generate_kek(2048).unwrap())
            .unwrap();
        let envelope = store.keystore().encrypt_dek("dek", &[4u8; 32], &[fp]).unwrap();
        store.add_collection("photos", envelope);

        let key = store
            .query_collection_encryption_key_for_new_blobs("photos")
            .await
            .unwrap();
        assert_eq!(key.key_id(), "dek");
        assert!(matches!(
            store.query_collection_encryption_key_for_new_blobs("missing").await,
            Err(MetaError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_job_persistence() {
        let store = store();
        assert_eq!(store.name(), "in-memory");
        let mut job = IntegrityVerificationJob::new(1);
        assert!(store.load_integrity_job(&job.id).await.is_err());
        job.bytes_scanned = 42;
        store.save_integrity_job(&job).await.unwrap();
        assert_eq!(store.load_integrity_job(&job.id).await.unwrap().bytes_scanned, 42);
    }
}
