//! Local filesystem driver. One file per blob under `<root>/blobs/<hex[0..2]>/<hex>`.

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use tokio::{fs, io::AsyncWriteExt};
use uuid::Uuid;

use crate::cadapter::ROUTING_COST_LOCAL;
use crate::cadapter::client::{BlobDriver, BlobReader};
use crate::error::StoreError;
use crate::types::BlobRef;

#[derive(Debug, Clone)]
pub struct LocalFsDriver {
    root: PathBuf,
    routing_cost: u32,
}

impl LocalFsDriver {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            routing_cost: ROUTING_COST_LOCAL,
        }
    }

    pub fn with_routing_cost(mut self, routing_cost: u32) -> Self {
        self.routing_cost = routing_cost;
        self
    }

    /// On-disk location of a blob.
    pub fn path_for(&self, blob_ref: &BlobRef) -> PathBuf {
        let hex = blob_ref.to_hex();
        self.root.join("blobs").join(&hex[..2]).join(hex)
    }

    async fn write_temp(tmp: &Path, mut content: BlobReader) -> io::Result<()> {
        let mut f = fs::File::create(tmp).await?;
        tokio::io::copy(&mut content, &mut f).await?;
        f.flush().await?;
        f.sync_all().await?;
        Ok(())
    }
}

#[async_trait]
impl BlobDriver for LocalFsDriver {
    #[tracing::instrument(level = "trace", skip(self, content), fields(blob = %blob_ref))]
    async fn raw_store(&self, blob_ref: &BlobRef, content: BlobReader) -> Result<(), StoreError> {
        let path = self.path_for(blob_ref);
        let dir = path
            .parent()
            .ok_or_else(|| StoreError::Configuration(format!("bad blob path {path:?}")))?;
        fs::create_dir_all(dir).await?;

        // Readers see either no file or the complete file: write aside, then rename.
        let tmp = dir.join(format!(".{}.tmp-{}", blob_ref.to_hex(), Uuid::new_v4()));
        if let Err(e) = Self::write_temp(&tmp, content).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self), fields(blob = %blob_ref))]
    async fn raw_fetch(&self, blob_ref: &BlobRef) -> Result<BlobReader, StoreError> {
        match fs::File::open(self.path_for(blob_ref)).await {
            Ok(file) => {
                let reader: BlobReader = Box::pin(file);
                Ok(reader)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(format!("blob {blob_ref}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn routing_cost(&self) -> u32 {
        self.routing_cost
    }
}
