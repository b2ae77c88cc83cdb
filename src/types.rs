//! Core data model: content references, volumes, mounts and blob records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::cadapter::DriverConfig;

pub type VolumeId = u32;
pub type JobId = Uuid;

/// SHA-256 of a blob's plaintext. Doubles as the storage key and the IV seed.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct BlobRef([u8; 32]);

impl BlobRef {
    pub const LEN: usize = 32;

    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Hashes `content` into its reference.
    pub fn from_content(content: &[u8]) -> Self {
        Self(Sha256::digest(content).into())
    }

    /// Reserved key holding the volume descriptor. No plaintext hashes to it.
    pub const fn volume_descriptor() -> Self {
        Self([0u8; 32])
    }

    pub fn is_volume_descriptor(&self) -> bool {
        self.0 == [0u8; 32]
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// AES-CTR IV for this blob: the first 16 bytes of the content hash.
    pub(crate) fn encryption_iv(&self) -> [u8; 16] {
        let mut iv = [0u8; 16];
        iv.copy_from_slice(&self.0[..16]);
        iv
    }
}

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobRef({})", self.to_hex())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid blob ref {0:?}: expected 64 hex characters")]
pub struct ParseBlobRefError(String);

impl FromStr for BlobRef {
    type Err = ParseBlobRefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| ParseBlobRefError(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl Serialize for BlobRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for BlobRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A storage volume. Counters are maintained incrementally by the metadata store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub id: VolumeId,
    pub uuid: Uuid,
    pub label: String,
    /// Quota in bytes, 0 means unlimited.
    #[serde(default)]
    pub quota: u64,
    #[serde(default)]
    pub blob_count: u64,
    #[serde(default)]
    pub blob_size_total: u64,
}

impl Volume {
    pub fn new(id: VolumeId, label: impl Into<String>) -> Self {
        Self {
            id,
            uuid: Uuid::new_v4(),
            label: label.into(),
            quota: 0,
            blob_count: 0,
            blob_size_total: 0,
        }
    }
}

/// Binds a volume to the node that drives it and the driver that reaches it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeMount {
    pub volume_id: VolumeId,
    pub node_id: String,
    pub driver: DriverConfig,
}

/// Metadata record of one stored blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMeta {
    pub blob_ref: BlobRef,
    pub encryption_key_id: String,
    /// Volumes holding a confirmed full replica.
    pub volumes: Vec<VolumeId>,
    /// Replication work queue. Never overlaps `volumes`.
    pub volumes_pending_replication: Vec<VolumeId>,
    /// False until a commit references the blob.
    pub referenced: bool,
    pub is_compressed: bool,
    /// Plaintext size.
    pub size: u64,
    /// Ciphertext size.
    pub size_on_disk: u64,
    /// CRC32 (IEEE) of the ciphertext.
    pub crc32: u32,
}

impl BlobMeta {
    pub fn is_on_volume(&self, volume_id: VolumeId) -> bool {
        self.volumes.contains(&volume_id)
    }
}

/// A resumable scrub of one volume. `last_completed_blob_ref` is the exact resume point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityVerificationJob {
    pub id: JobId,
    pub volume_id: VolumeId,
    pub last_completed_blob_ref: Option<BlobRef>,
    pub bytes_scanned: u64,
    pub errors_found: u64,
    pub report: String,
    pub started: DateTime<Utc>,
    pub completed: Option<DateTime<Utc>>,
}

impl IntegrityVerificationJob {
    pub fn new(volume_id: VolumeId) -> Self {
        Self {
            id: Uuid::new_v4(),
            volume_id,
            last_completed_blob_ref: None,
            bytes_scanned: 0,
            errors_found: 0,
            report: String::new(),
            started: Utc::now(),
            completed: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed.is_some()
    }
}
