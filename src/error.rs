//! Crate-wide error surface.
//!
//! Every layer keeps its own `thiserror` enum (`MetaError`, `KeyStoreError`) and lifts
//! into `StoreError`, so callers see a single taxonomy: absent things, failed
//! verification, duplicate writes, missing mounts and misconfiguration.

use std::fmt;
use std::io;
use thiserror::Error;
use uuid::Uuid;

use crate::keystore::KeyStoreError;
use crate::meta::store::MetaError;
use crate::types::VolumeId;

/// Which checksum a streaming verification failed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumKind {
    Sha256,
    Crc32,
}

impl fmt::Display for ChecksumKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChecksumKind::Sha256 => f.write_str("sha256"),
            ChecksumKind::Crc32 => f.write_str("crc32"),
        }
    }
}

/// Payload carried inside `io::Error` when a verifying reader hits EOF with a bad digest.
#[derive(Debug, Clone, Error)]
#[error("{kind} mismatch: expected {expected}, got {actual}")]
pub struct ChecksumMismatch {
    pub kind: ChecksumKind,
    pub expected: String,
    pub actual: String,
}

impl ChecksumMismatch {
    pub(crate) fn into_io(self) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, self)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("integrity mismatch: {0}")]
    IntegrityMismatch(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The requested volume is not driven by this instance.
    #[error("capability error: {0}")]
    Capability(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("integrity job {0} is already running")]
    JobAlreadyRunning(Uuid),

    #[error("integrity job {0} is not running")]
    JobNotRunning(Uuid),

    #[error("integrity job {0} is already completed")]
    JobCompleted(Uuid),

    #[error("integrity controller is not running")]
    ControllerStopped,

    #[error("crypto error: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),

    #[error("IO error: {0}")]
    Io(io::Error),

    #[error("metadata error: {0}")]
    Meta(MetaError),

    #[error("key store error: {0}")]
    KeyStore(#[from] KeyStoreError),

    #[error("error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

impl StoreError {
    pub fn not_mounted(volume_id: VolumeId) -> Self {
        StoreError::Capability(format!("volume {volume_id} is not mounted on this node"))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_integrity_mismatch(&self) -> bool {
        matches!(self, StoreError::IntegrityMismatch(_))
    }
}

impl From<io::Error> for StoreError {
    fn from(value: io::Error) -> Self {
        // Verifying readers smuggle their mismatch through io::Error; unwrap it here
        // so integrity failures are never reported as plain I/O trouble.
        if let Some(mismatch) = value
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<ChecksumMismatch>())
        {
            return StoreError::IntegrityMismatch(mismatch.to_string());
        }
        StoreError::Io(value)
    }
}

impl From<MetaError> for StoreError {
    fn from(value: MetaError) -> Self {
        match value {
            MetaError::NotFound(what) => StoreError::NotFound(what),
            MetaError::AlreadyExists(what) => StoreError::AlreadyExists(what),
            other => StoreError::Meta(other),
        }
    }
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_mismatch_survives_io_roundtrip() {
        let io_err = ChecksumMismatch {
            kind: ChecksumKind::Crc32,
            expected: "00000001".into(),
            actual: "00000002".into(),
        }
        .into_io();
        let err: StoreError = io_err.into();
        assert!(err.is_integrity_mismatch(), "{err}");
        assert!(err.to_string().contains("crc32 mismatch"));
    }

    #[test]
    fn test_plain_io_error_stays_io() {
        let err: StoreError = io::Error::new(io::ErrorKind::BrokenPipe, "pipe").into();
        assert!(matches!(err, StoreError::Io(_)));
    }

    #[test]
    fn test_meta_not_found_lifts() {
        let err: StoreError = MetaError::NotFound("blob x".into()).into();
        assert!(err.is_not_found());
    }
}
