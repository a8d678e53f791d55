//! Blobber config loader using TOML and serde.
//!
//! Every field has a default so a partial file (or none at all) still yields
//! a usable node configuration.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::Result;

/// Default LMDB map size: 1 GiB.
pub const DEFAULT_DB_MAP_SIZE: usize = 1 << 30;

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct BlobberConfig {
    /// Blobber id as registered on chain. Markers must name this id.
    pub blobber_id: String,

    /// Root directory; the metadata DB lives in `<data_dir>/db` and content in
    /// `<data_dir>/files`.
    pub data_dir: PathBuf,

    /// LMDB map size in bytes.
    pub db_map_size: usize,

    /// How far in the future a write marker timestamp may be (seconds).
    pub max_timestamp_skew_secs: u64,

    /// Connections untouched for this long are reclaimed by the sweeper.
    pub connection_stale_secs: u64,

    /// Sweeper period.
    pub sweep_interval_secs: u64,

    /// Cached pool snapshots older than this are refetched before use.
    pub pool_cache_ttl_secs: u64,

    /// Upper bound for a single file upload, in bytes.
    pub max_file_size: u64,
}

impl Default for BlobberConfig {
    fn default() -> Self {
        BlobberConfig {
            blobber_id: String::new(),
            data_dir: PathBuf::from("./data"),
            db_map_size: DEFAULT_DB_MAP_SIZE,
            max_timestamp_skew_secs: 300,
            connection_stale_secs: 3600,
            sweep_interval_secs: 300,
            pool_cache_ttl_secs: 600,
            max_file_size: 5 * 1024 * 1024 * 1024,
        }
    }
}

impl BlobberConfig {
    /// `<data_dir>/db`
    pub fn db_dir(&self) -> PathBuf {
        self.data_dir.join("db")
    }

    /// `<data_dir>/files`
    pub fn files_dir(&self) -> PathBuf {
        self.data_dir.join("files")
    }

    /// Reject configurations the node cannot run with.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.blobber_id.trim().is_empty() {
            return Err("blobber_id must be set".to_string());
        }
        if self.db_map_size == 0 {
            return Err("db_map_size must be positive".to_string());
        }
        if self.sweep_interval_secs == 0 {
            return Err("sweep_interval_secs must be positive".to_string());
        }
        Ok(())
    }
}

/// Load config from a TOML file path.
/// If file is missing or parse fails, an error is returned.
pub fn load_from_file(path: impl AsRef<Path>) -> Result<BlobberConfig> {
    let s = fs::read_to_string(path.as_ref())?;
    let cfg: BlobberConfig = toml::from_str(&s)?;
    Ok(cfg)
}
