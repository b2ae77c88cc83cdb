//! On-volume identity record stored under the all-zero reference.

use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use uuid::Uuid;

use crate::cadapter::BlobDriver;
use crate::cadapter::client::reader_from_bytes;
use crate::error::StoreError;
use crate::types::BlobRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeDescriptor {
    pub uuid: Uuid,
}

pub(super) async fn read(driver: &dyn BlobDriver) -> Result<VolumeDescriptor, StoreError> {
    let mut raw = Vec::new();
    driver
        .raw_fetch(&BlobRef::volume_descriptor())
        .await?
        .read_to_end(&mut raw)
        .await?;

    serde_json::from_slice(&raw)
        .map_err(|e| StoreError::Configuration(format!("malformed volume descriptor: {e}")))
}

pub(super) async fn write(
    driver: &dyn BlobDriver,
    descriptor: &VolumeDescriptor,
) -> Result<(), StoreError> {
    let raw = serde_json::to_vec(descriptor)
        .map_err(|e| StoreError::Configuration(format!("encode volume descriptor: {e}")))?;
    driver
        .raw_store(&BlobRef::volume_descriptor(), reader_from_bytes(raw))
        .await
}
