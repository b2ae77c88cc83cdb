//! Blob drivers: the per-backend capability consumed by the disk access controller.

pub mod client;
pub mod localfs;
pub mod memory;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

pub use client::{BlobDriver, BlobReader};
pub use localfs::LocalFsDriver;
pub use memory::InMemoryDriver;

/// Routing cost convention for local disks.
pub const ROUTING_COST_LOCAL: u32 = 10;

/// Driver selection as it appears in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DriverConfig {
    #[serde(rename = "local")]
    Local { path: PathBuf },
    #[serde(rename = "memory")]
    Memory {
        #[serde(default = "default_memory_routing_cost")]
        routing_cost: u32,
    },
}

fn default_memory_routing_cost() -> u32 {
    ROUTING_COST_LOCAL
}

impl DriverConfig {
    pub fn build(&self) -> Arc<dyn BlobDriver> {
        match self {
            DriverConfig::Local { path } => Arc::new(LocalFsDriver::new(path)),
            DriverConfig::Memory { routing_cost } => {
                Arc::new(InMemoryDriver::with_routing_cost(*routing_cost))
            }
        }
    }
}
