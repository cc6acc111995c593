// Multi-tier read cache.
//
// Four bounded levels sit in front of the shard maps: L1 "hot", L2
// "warm", L3 "cold", and L4 "overflow". A key lives in at most one level
// at a time; hits promote one level, displaced entries demote, and L4
// evicts. Each level is partitioned into independently locked segments
// so shards contend only on bucket collisions.
//
// The cache is strictly best-effort: it never fails a caller-visible
// operation. An internal inconsistency flips a bypass flag and the cache
// steps out of the read/write paths until reset.

mod tiered;

pub use tiered::{CacheLevelMetrics, CacheMetrics, TieredCache};

/// Number of cache levels.
pub const LEVEL_COUNT: usize = 4;

pub const L1_HOT: usize = 0;
pub const L2_WARM: usize = 1;
pub const L3_COLD: usize = 2;
pub const L4_OVERFLOW: usize = 3;

pub fn level_name(level: usize) -> &'static str {
    match level {
        L1_HOT => "L1",
        L2_WARM => "L2",
        L3_COLD => "L3",
        L4_OVERFLOW => "L4",
        _ => "L?",
    }
}
