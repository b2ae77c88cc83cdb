//! rkblob configuration management
//!
//! Tunables for the replication and integrity controllers, the key store cache, and
//! the volume mounts driven by this node. Loaded from YAML.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::types::VolumeMount;

/// rkblob configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Identity of this node; only mounts bound to it are driven here.
    #[serde(default = "default_node_id")]
    pub node_id: String,

    #[serde(default)]
    pub replication: ReplicationConfig,

    #[serde(default)]
    pub integrity: IntegrityConfig,

    #[serde(default)]
    pub keystore: KeyStoreConfig,

    #[serde(default)]
    pub mounts: Vec<VolumeMount>,
}

/// Replication controller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Discovery tick (in seconds)
    #[serde(default = "default_replication_interval", with = "duration_serde")]
    pub interval: Duration,

    /// Max jobs discovered per tick
    #[serde(default = "default_replication_batch_size")]
    pub batch_size: usize,

    /// Worker pool size
    #[serde(default = "default_replication_workers")]
    pub workers: usize,

    /// Pause taken by a worker after a failed job (in seconds)
    #[serde(default = "default_failure_pause", with = "duration_serde")]
    pub failure_pause: Duration,
}

/// Integrity verification configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityConfig {
    /// Blob records fetched per scan batch
    #[serde(default = "default_integrity_batch_size")]
    pub batch_size: usize,

    /// Max time between progress checkpoints (in seconds)
    #[serde(default = "default_checkpoint_interval", with = "duration_serde")]
    pub checkpoint_interval: Duration,

    /// Report size after which a job aborts
    #[serde(default = "default_max_report_bytes")]
    pub max_report_bytes: usize,

    /// Capacity of the control loop's command channel
    #[serde(default = "default_command_queue")]
    pub command_queue: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyStoreConfig {
    /// Decrypted DEKs kept in memory
    #[serde(default = "default_dek_cache_capacity")]
    pub dek_cache_capacity: usize,
}

fn default_node_id() -> String {
    "local".to_string()
}

fn default_replication_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_replication_batch_size() -> usize {
    100
}

fn default_replication_workers() -> usize {
    3
}

fn default_failure_pause() -> Duration {
    Duration::from_secs(3)
}

fn default_integrity_batch_size() -> usize {
    1000
}

fn default_checkpoint_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_max_report_bytes() -> usize {
    20 * 1024
}

fn default_command_queue() -> usize {
    32
}

fn default_dek_cache_capacity() -> usize {
    16
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            replication: ReplicationConfig::default(),
            integrity: IntegrityConfig::default(),
            keystore: KeyStoreConfig::default(),
            mounts: Vec::new(),
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            interval: default_replication_interval(),
            batch_size: default_replication_batch_size(),
            workers: default_replication_workers(),
            failure_pause: default_failure_pause(),
        }
    }
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            batch_size: default_integrity_batch_size(),
            checkpoint_interval: default_checkpoint_interval(),
            max_report_bytes: default_max_report_bytes(),
            command_queue: default_command_queue(),
        }
    }
}

impl Default for KeyStoreConfig {
    fn default() -> Self {
        Self {
            dek_cache_capacity: default_dek_cache_capacity(),
        }
    }
}

impl Config {
    /// Load configuration from YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(ConfigError::IoError)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a data directory, fallback to default paths
    pub fn from_path(data_dir: &Path) -> Result<Self, ConfigError> {
        let config_file = data_dir.join("rkblob.yml");
        if config_file.exists() {
            return Self::from_file(&config_file);
        }

        Self::from_default_path()
    }

    /// Load configuration from default paths
    pub fn from_default_path() -> Result<Self, ConfigError> {
        let possible_paths = ["rkblob.yml", "rkblob.yaml", "/etc/rkblob/config.yml"];

        for path in &possible_paths {
            if Path::new(path).exists() {
                return Self::from_file(path);
            }
        }

        Err(ConfigError::ConfigNotFound)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.replication.workers == 0 || self.replication.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "replication workers and batch_size must be positive".into(),
            ));
        }
        if self.integrity.batch_size == 0 || self.integrity.command_queue == 0 {
            return Err(ConfigError::Invalid(
                "integrity batch_size and command_queue must be positive".into(),
            ));
        }
        if self.keystore.dek_cache_capacity == 0 {
            return Err(ConfigError::Invalid(
                "keystore dek_cache_capacity must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Mounts this node is responsible for.
    pub fn local_mounts(&self) -> impl Iterator<Item = &VolumeMount> {
        self.mounts.iter().filter(|m| m.node_id == self.node_id)
    }
}

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(std::io::Error),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Config file not found in default locations")]
    ConfigNotFound,
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(value)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration {value}: {e}")))
    }
}
