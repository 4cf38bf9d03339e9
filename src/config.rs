use crate::storage::{BlockStorage, MemoryStorage};
use crate::{BlockStore, DEFAULT_FLUSH_INTERVAL, DEFAULT_PART_SIZE};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for a [`BlockStore`] parsed from a YAML file.
///
/// Keys are top-level and prefixed with `block-store-...` to avoid collisions.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct BlockStoreConfig {
    /// Bytes per cached part (optional; default 64 KiB)
    #[serde(rename = "block-store-part-size")]
    pub part_size: Option<i64>,

    /// Cadence of the background flusher in milliseconds (optional; default 5000)
    #[serde(rename = "block-store-flush-interval-ms")]
    pub flush_interval_ms: Option<u64>,

    /// Root directory for [`crate::FsStorage`] data (env fallback: `BLOCK_STORE_DIR`)
    #[serde(rename = "block-store-disk-root")]
    pub disk_root: Option<String>,
}

impl BlockStoreConfig {
    /// Parse configuration from a YAML string. Unknown keys are ignored.
    pub fn from_yaml_str(yaml: &str) -> Self {
        serde_yaml::from_str::<BlockStoreConfig>(yaml).unwrap_or_default()
    }

    /// Read a YAML file from disk and parse the configuration.
    pub fn from_yaml_file(path: impl AsRef<std::path::Path>) -> Self {
        std::fs::read_to_string(&path)
            .ok()
            .as_deref()
            .map(Self::from_yaml_str)
            .unwrap_or_default()
    }

    /// Resolve disk root with environment fallback.
    pub fn resolve_disk_root(&self) -> PathBuf {
        if let Some(root) = &self.disk_root {
            return PathBuf::from(root);
        }
        if let Ok(env_root) = std::env::var("BLOCK_STORE_DIR") {
            return PathBuf::from(env_root);
        }
        PathBuf::from("block_store_data")
    }
}

/// Builder pattern for [`BlockStore`] configuration.
pub struct BlockStoreBuilder {
    storage: Option<Arc<dyn BlockStorage>>,
    part_size: i64,
    flush_interval: Duration,
}

impl BlockStoreBuilder {
    pub fn new() -> Self {
        Self {
            storage: None,
            part_size: DEFAULT_PART_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
    pub fn with_storage(mut self, storage: Arc<dyn BlockStorage>) -> Self {
        self.storage = Some(storage);
        self
    }
    pub fn with_part_size(mut self, part_size: i64) -> Self {
        self.part_size = part_size;
        self
    }
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Build a [`BlockStore`] from this builder, defaulting to
    /// [`MemoryStorage`] when no backend was provided.
    pub fn build(self) -> BlockStore {
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(MemoryStorage::new()));
        let part_size = if self.part_size > 0 {
            self.part_size
        } else {
            DEFAULT_PART_SIZE
        };
        let flush_interval = if self.flush_interval.is_zero() {
            DEFAULT_FLUSH_INTERVAL
        } else {
            self.flush_interval
        };
        BlockStore::with_options(storage, part_size, flush_interval)
    }
}

impl Default for BlockStoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}
