//! Engine configuration (spec §6). Deserializable from TOML via `serde`,
//! validated once in [`crate::Database::open`].

use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};

pub const MIN_PAGE_SIZE: u32 = 512;
pub const MAX_PAGE_SIZE: u32 = 65536;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl Default for IsolationLevel {
    fn default() -> Self {
        IsolationLevel::ReadCommitted
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageOptions {
    pub enable_compression: bool,
    pub compression_threshold: usize,
    pub enable_checksums: bool,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            enable_compression: false,
            compression_threshold: 256,
            enable_checksums: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexOptions {
    pub min_degree: u32,
    pub max_degree: u32,
    pub auto_optimize_degree: bool,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            min_degree: 4,
            max_degree: 512,
            auto_optimize_degree: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    pub page_cache_size: usize,
    pub index_cache_size: usize,
    pub enable_lru: bool,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            page_cache_size: 1024,
            index_cache_size: 1024,
            enable_lru: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub page_size: u32,
    pub max_file_handles: usize,
    pub b_tree_degree: u32,
    pub use_buffered_io: bool,
    pub default_isolation_level: IsolationLevel,
    pub enable_wal: bool,
    pub wal_max_file_size: u64,
    pub wal_checkpoint_interval: u64,
    pub wal_auto_checkpoint: bool,
    pub storage: StorageOptions,
    pub index: IndexOptions,
    pub cache: CacheOptions,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            page_size: 4096,
            max_file_handles: 128,
            b_tree_degree: 64,
            use_buffered_io: true,
            default_isolation_level: IsolationLevel::default(),
            enable_wal: true,
            wal_max_file_size: 64 * 1024 * 1024,
            wal_checkpoint_interval: 1000,
            wal_auto_checkpoint: true,
            storage: StorageOptions::default(),
            index: IndexOptions::default(),
            cache: CacheOptions::default(),
        }
    }
}

impl Config {
    pub fn from_toml_str(text: &str) -> StorageResult<Self> {
        let cfg: Config = toml::from_str(text).map_err(|e| StorageError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> StorageResult<Self> {
        let mut cfg = self.clone();
        cfg.page_size = cfg.page_size.clamp(MIN_PAGE_SIZE, MAX_PAGE_SIZE);
        if cfg.max_file_handles == 0 {
            return Err(StorageError::invalid_argument(
                "max_file_handles must be positive",
            ));
        }
        if cfg.b_tree_degree < 2 {
            return Err(StorageError::invalid_argument(
                "b_tree_degree must be at least 2",
            ));
        }
        if cfg.index.min_degree > cfg.index.max_degree {
            return Err(StorageError::invalid_argument(
                "index.min_degree must not exceed index.max_degree",
            ));
        }
        Ok(cfg)
    }
}
