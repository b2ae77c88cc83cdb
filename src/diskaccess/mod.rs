//! Disk access controller: the only component that touches blob drivers.
//!
//! Owns the encode/decode pipeline and the table of volumes mounted on this instance.
//! Every read is verified end to end (ciphertext CRC32 while streaming, plaintext
//! SHA-256 after decoding) and never returns partially verified bytes. Operations do
//! not retry; retry and rediscovery belong to the calling controllers.

mod descriptor;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cadapter::{BlobDriver, BlobReader};
use crate::cadapter::client::reader_from_bytes;
use crate::codec::{VerifyingReader, decode_blob, encode_blob};
use crate::error::StoreError;
use crate::meta::MetaStore;
use crate::types::{BlobMeta, BlobRef, Volume, VolumeId, VolumeMount};

pub use descriptor::VolumeDescriptor;

pub struct DiskAccessController {
    meta: Arc<dyn MetaStore>,
    /// Populated at start-up, read-only afterwards. Entries are never replaced.
    drivers: DashMap<VolumeId, Arc<dyn BlobDriver>>,
}

impl DiskAccessController {
    pub fn new(meta: Arc<dyn MetaStore>) -> Self {
        Self {
            meta,
            drivers: DashMap::new(),
        }
    }

    /// Writes the volume descriptor to a fresh volume. Refuses volumes that already
    /// carry one.
    pub async fn initialize(
        &self,
        volume_uuid: Uuid,
        driver: &dyn BlobDriver,
    ) -> Result<(), StoreError> {
        match descriptor::read(driver).await {
            Ok(existing) => {
                return Err(StoreError::Configuration(format!(
                    "volume already initialized (uuid {})",
                    existing.uuid
                )));
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        descriptor::write(driver, &VolumeDescriptor { uuid: volume_uuid }).await?;
        info!(%volume_uuid, "volume initialized");
        Ok(())
    }

    /// Verifies the on-volume descriptor and registers `driver` for `volume_id`.
    ///
    /// A volume without descriptor fails with `NotFound` so the caller can decide
    /// whether to initialize it. A UUID mismatch never registers the driver.
    pub async fn mount(
        &self,
        volume_id: VolumeId,
        expected_uuid: Uuid,
        driver: Arc<dyn BlobDriver>,
    ) -> Result<(), StoreError> {
        let found = descriptor::read(driver.as_ref()).await?;
        if found.uuid != expected_uuid {
            return Err(StoreError::Configuration(format!(
                "volume {volume_id}: descriptor uuid {} does not match expected {expected_uuid}",
                found.uuid
            )));
        }

        match self.drivers.entry(volume_id) {
            Entry::Occupied(_) => Err(StoreError::Configuration(format!(
                "volume {volume_id} is already mounted"
            ))),
            Entry::Vacant(slot) => {
                slot.insert(driver);
                info!(volume_id, %expected_uuid, "volume mounted");
                Ok(())
            }
        }
    }

    /// Mounts `volume`, initializing it first only if it has never held a blob.
    pub async fn mount_or_initialize(
        &self,
        volume: &Volume,
        driver: Arc<dyn BlobDriver>,
    ) -> Result<(), StoreError> {
        match self.mount(volume.id, volume.uuid, driver.clone()).await {
            Err(e) if e.is_not_found() && volume.blob_count == 0 => {
                info!(volume_id = volume.id, "no descriptor on empty volume, initializing");
                self.initialize(volume.uuid, driver.as_ref()).await?;
                self.mount(volume.id, volume.uuid, driver).await
            }
            other => other,
        }
    }

    /// Start-up helper: mounts every configured volume bound to `node_id`.
    pub async fn mount_configured(
        &self,
        node_id: &str,
        mounts: &[VolumeMount],
    ) -> Result<Vec<VolumeId>, StoreError> {
        let mut mounted = Vec::new();
        for mount in mounts.iter().filter(|m| m.node_id == node_id) {
            let volume = self.meta.query_volume(mount.volume_id).await?;
            self.mount_or_initialize(&volume, mount.driver.build())
                .await?;
            mounted.push(volume.id);
        }
        Ok(mounted)
    }

    pub fn is_mounted(&self, volume_id: VolumeId) -> bool {
        self.drivers.contains_key(&volume_id)
    }

    pub fn mounted_volume_ids(&self) -> Vec<VolumeId> {
        let mut ids: Vec<_> = self.drivers.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    fn driver(&self, volume_id: VolumeId) -> Result<Arc<dyn BlobDriver>, StoreError> {
        self.drivers
            .get(&volume_id)
            .map(|d| d.value().clone())
            .ok_or_else(|| StoreError::not_mounted(volume_id))
    }

    /// Among the mounted candidates, the one with the lowest routing cost. Ties keep
    /// candidate order.
    pub fn best_volume_id(&self, candidates: &[VolumeId]) -> Result<VolumeId, StoreError> {
        candidates
            .iter()
            .filter_map(|id| {
                self.drivers
                    .get(id)
                    .map(|d| (*id, d.value().routing_cost()))
            })
            .min_by_key(|(_, cost)| *cost)
            .map(|(id, _)| id)
            .ok_or_else(|| {
                StoreError::Capability(format!(
                    "none of the volumes {candidates:?} are mounted on this node"
                ))
            })
    }

    /// Stores a new blob on `volume_id`.
    ///
    /// `content` is hashed while it is read; a stream that does not hash to
    /// `blob_ref` fails the whole write before anything reaches the driver.
    pub async fn write_blob<R>(
        &self,
        volume_id: VolumeId,
        collection_id: &str,
        blob_ref: &BlobRef,
        content: R,
        maybe_compressible: bool,
    ) -> Result<BlobMeta, StoreError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let driver = self.driver(volume_id)?;

        if self.meta.query_blob_exists(blob_ref).await? {
            return Err(StoreError::AlreadyExists(format!("blob {blob_ref}")));
        }

        // bounded: upstream chunking caps blob size
        let mut plaintext = Vec::new();
        VerifyingReader::sha256(content, *blob_ref)
            .read_to_end(&mut plaintext)
            .await?;

        let key = self
            .meta
            .query_collection_encryption_key_for_new_blobs(collection_id)
            .await?;
        let encoded = encode_blob(blob_ref, &plaintext, &key, maybe_compressible)?;

        let meta = BlobMeta {
            blob_ref: *blob_ref,
            encryption_key_id: key.key_id().to_string(),
            volumes: vec![volume_id],
            volumes_pending_replication: Vec::new(),
            referenced: false,
            is_compressed: encoded.is_compressed,
            size: plaintext.len() as u64,
            size_on_disk: encoded.ciphertext.len() as u64,
            crc32: encoded.crc32,
        };

        driver
            .raw_store(blob_ref, reader_from_bytes(encoded.ciphertext))
            .await?;
        self.meta.write_blob_created(&meta, volume_id).await?;

        debug!(
            blob = %blob_ref,
            volume_id,
            size = meta.size,
            size_on_disk = meta.size_on_disk,
            compressed = meta.is_compressed,
            "blob written"
        );
        Ok(meta)
    }

    /// Reads, verifies and decodes a blob from `volume_id`.
    pub async fn fetch(&self, blob_ref: &BlobRef, volume_id: VolumeId) -> Result<Vec<u8>, StoreError> {
        let driver = self.driver(volume_id)?;
        let resolved = self.meta.query_blob_metadata(blob_ref).await?;

        let mut ciphertext = Vec::with_capacity(resolved.blob.size_on_disk as usize);
        self.fetch_verified(driver.as_ref(), blob_ref, resolved.blob.crc32)
            .await?
            .read_to_end(&mut ciphertext)
            .await?;

        decode_blob(
            blob_ref,
            &ciphertext,
            &resolved.encryption_key,
            resolved.blob.is_compressed,
        )
    }

    /// Copies the stored ciphertext from one volume to another, untouched.
    pub async fn replicate(
        &self,
        from_volume_id: VolumeId,
        to_volume_id: VolumeId,
        blob_ref: &BlobRef,
    ) -> Result<(), StoreError> {
        let from = self.driver(from_volume_id)?;
        let to = self.driver(to_volume_id)?;
        let crc32 = self.meta.query_blob_crc32(blob_ref).await?;

        // the destination only publishes once the verifying stream hit a clean EOF
        let verified = self.fetch_verified(from.as_ref(), blob_ref, crc32).await?;
        to.raw_store(blob_ref, verified).await?;
        self.meta
            .write_blob_replicated(blob_ref, to_volume_id)
            .await?;

        debug!(blob = %blob_ref, from_volume_id, to_volume_id, "blob replicated");
        Ok(())
    }

    /// Checks the stored ciphertext against its CRC32 without decrypting.
    /// Returns the number of bytes read.
    pub async fn scrub(&self, blob_ref: &BlobRef, volume_id: VolumeId) -> Result<u64, StoreError> {
        let driver = self.driver(volume_id)?;
        let crc32 = self.meta.query_blob_crc32(blob_ref).await?;

        let mut verified = self.fetch_verified(driver.as_ref(), blob_ref, crc32).await?;
        let scanned = tokio::io::copy(&mut verified, &mut tokio::io::sink())
            .await
            .inspect_err(|e| warn!(blob = %blob_ref, volume_id, "scrub failed: {e}"))?;
        Ok(scanned)
    }

    async fn fetch_verified(
        &self,
        driver: &dyn BlobDriver,
        blob_ref: &BlobRef,
        crc32: u32,
    ) -> Result<BlobReader, StoreError> {
        let raw = driver.raw_fetch(blob_ref).await?;
        Ok(Box::pin(VerifyingReader::crc32(raw, crc32)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cadapter::InMemoryDriver;
    use crate::keystore::KeyStore;
    use crate::meta::InMemoryMetaStore;

    fn controller() -> DiskAccessController {
        DiskAccessController::new(Arc::new(InMemoryMetaStore::new(Arc::new(
            KeyStore::default(),
        ))))
    }

    async fn mounted(dac: &DiskAccessController, volume_id: VolumeId, cost: u32) {
        let driver: Arc<dyn BlobDriver> = Arc::new(InMemoryDriver::with_routing_cost(cost));
        let uuid = Uuid::new_v4();
        dac.initialize(uuid, driver.as_ref()).await.unwrap();
        dac.mount(volume_id, uuid, driver).await.unwrap();
    }

    #[tokio::test]
    async fn test_best_volume_id_by_routing_cost() {
        let dac = controller();
        mounted(&dac, 1, 10).await;
        mounted(&dac, 2, 30).await;
        mounted(&dac, 3, 20).await;

        assert_eq!(dac.best_volume_id(&[1, 2, 3]).unwrap(), 1);
        assert_eq!(dac.best_volume_id(&[2, 3]).unwrap(), 3);
        assert_eq!(dac.best_volume_id(&[3, 1]).unwrap(), 1);
        assert_eq!(dac.best_volume_id(&[9, 2]).unwrap(), 2);
        assert!(matches!(
            dac.best_volume_id(&[7, 8]),
            Err(StoreError::Capability(_))
        ));
        assert!(matches!(dac.best_volume_id(&[]), Err(StoreError::Capability(_))));
    }

    #[tokio::test]
    async fn test_mount_lifecycle() {
        let dac = controller();
        let driver: Arc<dyn BlobDriver> = Arc::new(InMemoryDriver::new());
        let uuid = Uuid::new_v4();

        let err = dac.mount(1, uuid, driver.clone()).await.unwrap_err();
        assert!(err.is_not_found(), "{err}");

        dac.initialize(uuid, driver.as_ref()).await.unwrap();
        assert!(matches!(
            dac.initialize(uuid, driver.as_ref()).await,
            Err(StoreError::Configuration(_))
        ));

        assert!(matches!(
            dac.mount(1, Uuid::new_v4(), driver.clone()).await,
            Err(StoreError::Configuration(_))
        ));
        assert!(!dac.is_mounted(1));

        dac.mount(1, uuid, driver.clone()).await.unwrap();
        assert!(dac.is_mounted(1));
        assert!(matches!(
            dac.mount(1, uuid, driver).await,
            Err(StoreError::Configuration(_))
        ));
        assert_eq!(dac.mounted_volume_ids(), vec![1]);
    }

    #[tokio::test]
    async fn test_unmounted_volume_is_capability_error() {
        let dac = controller();
        let r = BlobRef::from_content(b"x");
        assert!(matches!(
            dac.scrub(&r, 4).await,
            Err(StoreError::Capability(_))
        ));
        assert!(matches!(
            dac.write_blob(4, "c", &r, &b"x"[..], true).await,
            Err(StoreError::Capability(_))
        ));
    }

    #[tokio::test]
    async fn test_mount_or_initialize_respects_blob_count() {
        let dac = controller();
        let fresh = Volume::new(1, "fresh");
        dac.mount_or_initialize(&fresh, Arc::new(InMemoryDriver::new()))
            .await
            .unwrap();
        assert!(dac.is_mounted(1));

        // a volume the metadata says holds blobs must not be silently re-initialized
        let mut used = Volume::new(2, "used");
        used.blob_count = 5;
        let err = dac
            .mount_or_initialize(&used, Arc::new(InMemoryDriver::new()))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(!dac.is_mounted(2));
    }
}
