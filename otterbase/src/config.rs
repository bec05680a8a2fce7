use std::path::PathBuf;

fn default_shards() -> usize {
    num_cpus::get().clamp(1, 8)
}

fn default_true() -> bool {
    true
}

fn default_block_alloc_size() -> usize {
    otter_store::DEFAULT_BLOCK_ALLOC_SIZE
}

fn default_buffer_pool_bytes() -> usize {
    256 * 1024 * 1024
}

/// Write-ahead log settings.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WalSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Number of `.wal_N` shard files.
    #[serde(default = "default_shards")]
    pub shards: usize,
    /// fsync after every record. Disable only for bulk loads you can redo.
    #[serde(default = "default_true")]
    pub sync_on_write: bool,
}

impl Default for WalSettings {
    fn default() -> Self {
        Self { enabled: true, shards: default_shards(), sync_on_write: true }
    }
}

/// Block store settings.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StoreSettings {
    #[serde(default = "default_block_alloc_size")]
    pub block_alloc_size: usize,
    #[serde(default = "default_buffer_pool_bytes")]
    pub buffer_pool_bytes: usize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            block_alloc_size: default_block_alloc_size(),
            buffer_pool_bytes: default_buffer_pool_bytes(),
        }
    }
}

/// Top-level engine configuration. With no `data_dir` the engine runs
/// entirely in memory: no database file, no catalog file, no WAL.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub wal: WalSettings,
    #[serde(default)]
    pub store: StoreSettings,
}

impl EngineConfig {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn on_disk(data_dir: impl Into<PathBuf>) -> Self {
        Self { data_dir: Some(data_dir.into()), ..Default::default() }
    }

    pub fn is_durable(&self) -> bool {
        self.data_dir.is_some()
    }

    pub(crate) fn database_file(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join("data.otbx"))
    }

    pub(crate) fn catalog_file(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join("catalog.otbx"))
    }

    pub(crate) fn wal_dir(&self) -> Option<PathBuf> {
        if !self.wal.enabled {
            return None;
        }
        self.data_dir.as_ref().map(|dir| dir.join("wal"))
    }
}
