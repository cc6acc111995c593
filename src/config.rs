// Engine configuration.
// Structured the usual way: nested config blocks with defaults and an
// explicit validate() pass, plus WARP_* environment overrides applied
// once at open.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::error::{Result, WarpError};

/// Default bound on key length (4 KiB).
pub const DEFAULT_MAX_KEY_BYTES: usize = 4 * 1024;

/// Default bound on value length (16 MiB).
pub const DEFAULT_MAX_VALUE_BYTES: usize = 16 * 1024 * 1024;

/// Top-level engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root directory for the manifest, WALs, and snapshots.
    pub data_root: PathBuf,
    /// Number of shards; fixed for the lifetime of the data directory.
    pub shard_count: u16,
    /// Shards 0..hot_shards are hot.
    pub hot_shards: u16,
    /// Shards hot_shards..hot_shards+warm_shards are warm; the rest cold.
    pub warm_shards: u16,
    pub max_key_bytes: usize,
    pub max_value_bytes: usize,
    /// Deadline applied to operations that do not carry their own.
    pub default_deadline: Duration,
    /// Bound on graceful shutdown before handles are force-closed.
    pub shutdown_grace: Duration,
    /// Write a snapshot per shard during close and prune old WAL
    /// generations it covers.
    pub snapshot_on_close: bool,
    pub wal: WalConfig,
    pub cache: CacheConfig,
    pub companions: CompanionConfig,
}

#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Upper bound on the age of a buffered entry before the batcher
    /// forces a flush.
    pub flush_interval: Duration,
    pub max_batch_bytes: usize,
    pub max_batch_entries: usize,
    /// Active file size that triggers rotation to a new generation.
    pub max_file_bytes: u64,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(2),
            max_batch_bytes: 1024 * 1024,
            max_batch_entries: 4096,
            max_file_bytes: 64 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Capacities for L1 (hot), L2 (warm), L3 (cold), L4 (overflow).
    /// Must be strictly descending.
    pub level_capacities: [usize; 4],
    /// Weight on entry age (seconds) in the eviction score.
    pub age_weight: f64,
    /// Weight per recorded hit.
    pub hit_weight: f64,
    /// Weight granted while an entry was hit within recent_hit_window.
    pub recency_weight: f64,
    pub recent_hit_window: Duration,
    /// Background sweep period.
    pub sweep_interval: Duration,
    /// Entries not hit for this long are demoted by the sweep.
    pub stale_after: Duration,
    pub segments_per_level: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            level_capacities: [8192, 4096, 2048, 1024],
            age_weight: 1.0,
            hit_weight: 2.0,
            recency_weight: 8.0,
            recent_hit_window: Duration::from_secs(5),
            sweep_interval: Duration::from_millis(250),
            stale_after: Duration::from_secs(30),
            segments_per_level: 16,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompanionConfig {
    pub max_companions_per_primary: usize,
}

impl Default for CompanionConfig {
    fn default() -> Self {
        Self {
            max_companions_per_primary: 64,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("./warp-data"),
            shard_count: 8,
            hot_shards: 2,
            warm_shards: 3,
            max_key_bytes: DEFAULT_MAX_KEY_BYTES,
            max_value_bytes: DEFAULT_MAX_VALUE_BYTES,
            default_deadline: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(10),
            snapshot_on_close: false,
            wal: WalConfig::default(),
            cache: CacheConfig::default(),
            companions: CompanionConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Apply WARP_* environment overrides. WARP_SHARDS is honored here;
    /// the manifest check at open rejects it when it disagrees with an
    /// existing data directory. Unknown WARP_* variables are ignored
    /// with a warning.
    pub fn apply_env(mut self) -> Result<Self> {
        for (name, value) in std::env::vars() {
            if !name.starts_with("WARP_") {
                continue;
            }
            match name.as_str() {
                "WARP_DATA_ROOT" => {
                    self.data_root = PathBuf::from(value);
                }
                "WARP_SHARDS" => {
                    let n: u16 = value.parse().map_err(|_| {
                        WarpError::Config(format!("WARP_SHARDS must be a positive integer, got {value:?}"))
                    })?;
                    if n == 0 {
                        return Err(WarpError::Config("WARP_SHARDS must be positive".into()));
                    }
                    self.shard_count = n;
                }
                "WARP_WAL_FLUSH_MS" => {
                    let ms: u64 = value.parse().map_err(|_| {
                        WarpError::Config(format!("WARP_WAL_FLUSH_MS must be an integer, got {value:?}"))
                    })?;
                    self.wal.flush_interval = Duration::from_millis(ms);
                }
                "WARP_WAL_MAX_BYTES" => {
                    let bytes: u64 = value.parse().map_err(|_| {
                        WarpError::Config(format!("WARP_WAL_MAX_BYTES must be an integer, got {value:?}"))
                    })?;
                    self.wal.max_file_bytes = bytes;
                }
                other => {
                    warn!(variable = other, "ignoring unknown WARP_* environment variable");
                }
            }
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.shard_count == 0 {
            return Err(WarpError::Config("shard_count must be positive".into()));
        }
        if u32::from(self.hot_shards) + u32::from(self.warm_shards) > u32::from(self.shard_count) {
            return Err(WarpError::Config(format!(
                "hot_shards ({}) + warm_shards ({}) exceed shard_count ({})",
                self.hot_shards, self.warm_shards, self.shard_count
            )));
        }
        if self.max_key_bytes == 0 || self.max_value_bytes == 0 {
            return Err(WarpError::Config("key/value bounds must be positive".into()));
        }
        if self.wal.max_batch_bytes == 0 || self.wal.max_batch_entries == 0 {
            return Err(WarpError::Config("WAL batch bounds must be positive".into()));
        }
        if self.wal.max_file_bytes == 0 {
            return Err(WarpError::Config("WAL max_file_bytes must be positive".into()));
        }
        let caps = &self.cache.level_capacities;
        if caps.iter().any(|&c| c == 0) {
            return Err(WarpError::Config("cache level capacities must be positive".into()));
        }
        if !(caps[0] > caps[1] && caps[1] > caps[2] && caps[2] > caps[3]) {
            return Err(WarpError::Config(
                "cache level capacities must be strictly descending (L1 > L2 > L3 > L4)".into(),
            ));
        }
        if self.cache.segments_per_level == 0 {
            return Err(WarpError::Config("segments_per_level must be positive".into()));
        }
        if self.companions.max_companions_per_primary == 0 {
            return Err(WarpError::Config(
                "max_companions_per_primary must be positive".into(),
            ));
        }
        Ok(())
    }
}
