#![allow(dead_code)]

use async_trait::async_trait;
use openssl::pkey::{PKey, Private};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::Semaphore;

use rkblob::cadapter::BlobReader;
use rkblob::{
    BlobDriver, BlobMeta, BlobRef, DiskAccessController, InMemoryDriver, InMemoryMetaStore,
    IntegrityController, IntegrityVerificationJob, JobId, KeyStore, MetaStore, StoreError, Volume, VolumeId,
};

pub const COLLECTION_A: &str = "collection-a";
pub const COLLECTION_B: &str = "collection-b";

pub const FOX: &[u8] = b"The quick brown fox jumps over the lazy dog";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// RSA key generation is slow; every test shares one KEK.
pub fn test_kek() -> PKey<Private> {
    static KEK: OnceLock<PKey<Private>> = OnceLock::new();
    KEK.get_or_init(|| KeyStore::generate_kek(2048).unwrap())
        .clone()
}

pub struct Fixture {
    pub keystore: Arc<KeyStore>,
    pub meta: Arc<InMemoryMetaStore>,
    pub dac: Arc<DiskAccessController>,
    pub drivers: HashMap<VolumeId, Arc<InMemoryDriver>>,
}

impl Fixture {
    /// Volumes given as `(id, routing cost)`, each mounted on a fresh in-memory driver.
    pub async fn new(volumes: &[(VolumeId, u32)]) -> Self {
        init_tracing();
        let keystore = Arc::new(KeyStore::default());
        let fingerprint = keystore.register_private_key(test_kek()).unwrap();
        let meta = Arc::new(InMemoryMetaStore::new(keystore.clone()));

        for (collection, dek_id) in [(COLLECTION_A, "dek-a"), (COLLECTION_B, "dek-b")] {
            let dek = KeyStore::generate_dek().unwrap();
            let envelope = keystore
                .encrypt_dek(dek_id, &dek, &[fingerprint.clone()])
                .unwrap();
            meta.add_collection(collection, envelope);
        }

        let dac = Arc::new(DiskAccessController::new(meta.clone()));
        let mut drivers = HashMap::new();
        for &(id, cost) in volumes {
            let volume = Volume::new(id, format!("volume-{id}"));
            meta.add_volume(volume.clone());
            let driver = Arc::new(InMemoryDriver::with_routing_cost(cost));
            dac.mount_or_initialize(&volume, driver.clone()).await.unwrap();
            drivers.insert(id, driver);
        }

        Self {
            keystore,
            meta,
            dac,
            drivers,
        }
    }

    pub fn driver(&self, volume_id: VolumeId) -> &Arc<InMemoryDriver> {
        &self.drivers[&volume_id]
    }

    pub async fn write(&self, volume_id: VolumeId, content: &[u8]) -> BlobMeta {
        self.dac
            .write_blob(
                volume_id,
                COLLECTION_A,
                &BlobRef::from_content(content),
                content,
                true,
            )
            .await
            .unwrap()
    }

    /// Writes `count` distinct blobs and returns their refs in scan order.
    pub async fn write_many(&self, volume_id: VolumeId, count: usize) -> Vec<BlobRef> {
        let mut refs = Vec::with_capacity(count);
        for i in 0..count {
            let content = format!("blob {i} of volume {volume_id} ").repeat(i % 7 + 1);
            refs.push(self.write(volume_id, content.as_bytes()).await.blob_ref);
        }
        refs.sort();
        refs
    }

    /// Mounts a fresh `GatedDriver` as `volume_id` and writes `blobs` distinct blobs to it.
    /// Returns the driver and the refs in scan order.
    pub async fn mount_gated(
        &self,
        volume_id: VolumeId,
        blobs: usize,
    ) -> (Arc<GatedDriver>, Vec<BlobRef>) {
        let volume = Volume::new(volume_id, "gated");
        self.meta.add_volume(volume.clone());
        let driver = Arc::new(GatedDriver::new());
        self.dac
            .mount_or_initialize(&volume, driver.clone())
            .await
            .unwrap();

        let mut refs = Vec::with_capacity(blobs);
        for i in 0..blobs {
            let content = format!("gated blob {i}");
            let r = BlobRef::from_content(content.as_bytes());
            self.dac
                .write_blob(volume_id, COLLECTION_A, &r, content.as_bytes(), true)
                .await
                .unwrap();
            refs.push(r);
        }
        refs.sort();
        (driver, refs)
    }

    pub fn fetched_blobs(&self, volume_id: VolumeId) -> Vec<BlobRef> {
        self.driver(volume_id)
            .fetched()
            .into_iter()
            .filter(|r| !r.is_volume_descriptor())
            .collect()
    }

    pub async fn wait_for_job(
        &self,
        job_id: JobId,
        done: impl Fn(&IntegrityVerificationJob) -> bool,
    ) -> IntegrityVerificationJob {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let job = self.meta.load_integrity_job(&job_id).await.unwrap();
            if done(&job) {
                return job;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting on job {job_id}: {job:?}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Waits until the control loop has retired every finished scan.
pub async fn wait_idle(controller: &IntegrityController) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !controller.list_running_jobs().await.unwrap().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "scans never retired");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// In-memory driver whose blob reads wait for a permit. Descriptor reads pass freely.
pub struct GatedDriver {
    pub inner: InMemoryDriver,
    pub gate: Semaphore,
}

impl GatedDriver {
    pub fn new() -> Self {
        Self {
            inner: InMemoryDriver::new(),
            gate: Semaphore::new(0),
        }
    }

    pub fn open(&self, permits: usize) {
        self.gate.add_permits(permits);
    }
}

#[async_trait]
impl BlobDriver for GatedDriver {
    async fn raw_store(&self, blob_ref: &BlobRef, content: BlobReader) -> Result<(), StoreError> {
        self.inner.raw_store(blob_ref, content).await
    }

    async fn raw_fetch(&self, blob_ref: &BlobRef) -> Result<BlobReader, StoreError> {
        if !blob_ref.is_volume_descriptor() {
            self.gate
                .acquire()
                .await
                .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
                .forget();
        }
        self.inner.raw_fetch(blob_ref).await
    }

    fn routing_cost(&self) -> u32 {
        self.inner.routing_cost()
    }
}
