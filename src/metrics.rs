// Metrics snapshot types.
// Plain serializable values filled from the engine's atomics; taking a
// snapshot never blocks a data-path operation.

use serde::Serialize;

use crate::cache::CacheMetrics;
use crate::companion::CompanionMetrics;
use crate::router::Tier;

#[derive(Debug, Clone, Serialize)]
pub struct ShardMetrics {
    pub shard_id: u16,
    pub tier: Tier,
    pub size: u64,
    pub bytes: u64,
    pub writes: u64,
    pub reads: u64,
    pub hits: u64,
    pub misses: u64,
    pub wal_last_seq: u64,
    pub wal_bytes: u64,
    pub wal_degraded: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_ns: u64,
    pub per_shard: Vec<ShardMetrics>,
    pub cache: CacheMetrics,
    pub companion_index: CompanionMetrics,
}

impl MetricsSnapshot {
    pub fn shard(&self, shard_id: u16) -> Option<&ShardMetrics> {
        self.per_shard.iter().find(|s| s.shard_id == shard_id)
    }
}
