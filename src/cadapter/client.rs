//! The blob driver capability: one trait, three operations, one implementation per backend.

use async_trait::async_trait;
use std::pin::Pin;
use tokio::io::AsyncRead;

use crate::error::StoreError;
use crate::types::BlobRef;

/// Streaming content handed across the driver seam.
pub type BlobReader = Pin<Box<dyn AsyncRead + Send>>;

/// Wraps an in-memory buffer as a `BlobReader`.
pub fn reader_from_bytes(bytes: Vec<u8>) -> BlobReader {
    Box::pin(std::io::Cursor::new(bytes))
}

/// Capability implemented by each storage backend.
///
/// Contract:
/// - `raw_store` must be idempotent and atomic: a concurrent `raw_fetch` of the same
///   ref never observes a partial write, and a store whose `content` stream fails
///   must leave nothing behind.
/// - `raw_fetch` returns `StoreError::NotFound` for absent refs and a different
///   variant for every other failure.
/// - `routing_cost` is a static preference weight (10 = local disk, 20 = remote).
#[async_trait]
#[auto_impl::auto_impl(&, std::sync::Arc, Box)]
pub trait BlobDriver: Send + Sync {
    async fn raw_store(&self, blob_ref: &BlobRef, content: BlobReader) -> Result<(), StoreError>;

    async fn raw_fetch(&self, blob_ref: &BlobRef) -> Result<BlobReader, StoreError>;

    fn routing_cost(&self) -> u32;
}
