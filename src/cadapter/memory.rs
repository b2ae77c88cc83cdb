//! In-memory driver for tests, tooling and ephemeral volumes.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use tokio::io::AsyncReadExt;

use crate::cadapter::ROUTING_COST_LOCAL;
use crate::cadapter::client::{BlobDriver, BlobReader, reader_from_bytes};
use crate::error::StoreError;
use crate::types::BlobRef;

pub struct InMemoryDriver {
    blobs: RwLock<HashMap<BlobRef, Vec<u8>>>,
    routing_cost: u32,
    fetch_log: Mutex<Vec<BlobRef>>,
}

impl Default for InMemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDriver {
    pub fn new() -> Self {
        Self::with_routing_cost(ROUTING_COST_LOCAL)
    }

    pub fn with_routing_cost(routing_cost: u32) -> Self {
        Self {
            blobs: RwLock::new(HashMap::new()),
            routing_cost,
            fetch_log: Mutex::new(Vec::new()),
        }
    }

    /// Stored bytes of a blob, if present.
    pub fn raw_bytes(&self, blob_ref: &BlobRef) -> Option<Vec<u8>> {
        self.blobs.read().get(blob_ref).cloned()
    }

    /// Flips every bit of the byte at `offset`. Returns false if there is no such byte.
    pub fn tamper(&self, blob_ref: &BlobRef, offset: usize) -> bool {
        let mut guard = self.blobs.write();
        match guard.get_mut(blob_ref).and_then(|b| b.get_mut(offset)) {
            Some(byte) => {
                *byte ^= 0xff;
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, blob_ref: &BlobRef) -> Option<Vec<u8>> {
        self.blobs.write().remove(blob_ref)
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }

    /// Refs passed to `raw_fetch`, in call order.
    pub fn fetched(&self) -> Vec<BlobRef> {
        self.fetch_log.lock().clone()
    }
}

#[async_trait]
impl BlobDriver for InMemoryDriver {
    async fn raw_store(&self, blob_ref: &BlobRef, mut content: BlobReader) -> Result<(), StoreError> {
        // buffer fully first so a failing stream publishes nothing
        let mut buf = Vec::new();
        content.read_to_end(&mut buf).await?;
        self.blobs.write().insert(*blob_ref, buf);
        Ok(())
    }

    async fn raw_fetch(&self, blob_ref: &BlobRef) -> Result<BlobReader, StoreError> {
        self.fetch_log.lock().push(*blob_ref);
        let bytes = self
            .blobs
            .read()
            .get(blob_ref)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("blob {blob_ref}")))?;
        Ok(reader_from_bytes(bytes))
    }

    fn routing_cost(&self) -> u32 {
        self.routing_cost
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_fetch_and_tamper() {
        let driver = InMemoryDriver::with_routing_cost(30);
        let r = BlobRef::from_content(b"k");
        driver
            .raw_store(&r, reader_from_bytes(vec![1, 2, 3]))
            .await
            .unwrap();

        assert!(driver.tamper(&r, 1));
        assert!(!driver.tamper(&r, 3));
        assert_eq!(driver.raw_bytes(&r).unwrap(), vec![1, 0xfd, 3]);

        let mut out = Vec::new();
        driver
            .raw_fetch(&r)
            .await
            .unwrap()
            .read_to_end(&mut out)
            .await
            .unwrap();
        assert_eq!(out, vec![1, 0xfd, 3]);
        assert_eq!(driver.fetched(), vec![r]);
        assert_eq!(driver.routing_cost(), 30);
    }

    #[tokio::test]
    async fn test_memory_missing_is_not_found() {
        let driver = InMemoryDriver::new();
        let err = driver
            .raw_fetch(&BlobRef::from_content(b"none"))
            .await
            .err()
            .unwrap();
        assert!(err.is_not_found());
        assert!(driver.is_empty());
    }
}
