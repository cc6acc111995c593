// Tiered cache implementation.
// Eviction is age/popularity driven: the victim is the entry with the
// least retention (oldest, fewest hits, not recently hit), computed
// from the configured weights. Inline eviction runs on insert overflow;
// a background sweep demotes entries that have gone stale.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::router::Router;

use super::{level_name, L1_HOT, L4_OVERFLOW, LEVEL_COUNT};

#[derive(Debug, Clone)]
struct Entry {
    value: Bytes,
    inserted_at: Instant,
    last_hit_at: Instant,
    hits: u64,
    /// Placement weight: a hot-hinted entry holds a little extra
    /// retention against eviction.
    weight: u32,
}

struct Level {
    segments: Vec<Mutex<HashMap<Vec<u8>, Entry>>>,
    capacity: usize,
    size: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl Level {
    fn new(capacity: usize, segments: usize) -> Self {
        Self {
            segments: (0..segments).map(|_| Mutex::new(HashMap::new())).collect(),
            capacity,
            size: AtomicUsize::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn segment(&self, key: &[u8]) -> &Mutex<HashMap<Vec<u8>, Entry>> {
        let index = (Router::route_hash(key) as usize) % self.segments.len();
        &self.segments[index]
    }
}

/// Per-level metrics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct CacheLevelMetrics {
    pub level: &'static str,
    pub capacity: usize,
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheMetrics {
    pub levels: Vec<CacheLevelMetrics>,
    pub bypassed: bool,
    pub bypass_events: u64,
}

pub struct TieredCache {
    levels: Vec<Level>,
    cfg: CacheConfig,
    bypassed: AtomicBool,
    bypass_events: AtomicU64,
}

impl TieredCache {
    pub fn new(cfg: CacheConfig) -> Self {
        let levels = cfg
            .level_capacities
            .iter()
            .map(|&capacity| Level::new(capacity, cfg.segments_per_level))
            .collect();
        Self {
            levels,
            cfg,
            bypassed: AtomicBool::new(false),
            bypass_events: AtomicU64::new(0),
        }
    }

    pub fn is_bypassed(&self) -> bool {
        self.bypassed.load(Ordering::Acquire)
    }

    /// Look up a key across levels, promoting on hit. L1 hits only
    /// refresh recency.
    pub fn lookup(&self, key: &[u8]) -> Option<Bytes> {
        if self.is_bypassed() {
            return None;
        }
        let now = Instant::now();
        for level_index in 0..LEVEL_COUNT {
            let level = &self.levels[level_index];
            let taken = {
                let mut segment = level.segment(key).lock();
                if level_index == L1_HOT {
                    if let Some(entry) = segment.get_mut(key) {
                        entry.hits += 1;
                        entry.last_hit_at = now;
                        level.hits.fetch_add(1, Ordering::Relaxed);
                        return Some(entry.value.clone());
                    }
                    None
                } else {
                    segment.remove_entry(key)
                }
            };
            match taken {
                Some((key, mut entry)) => {
                    self.sub_size(level_index);
                    level.hits.fetch_add(1, Ordering::Relaxed);
                    entry.hits += 1;
                    entry.last_hit_at = now;
                    let value = entry.value.clone();
                    self.insert_at(level_index - 1, key, entry);
                    return Some(value);
                }
                None => {
                    level.misses.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        None
    }

    /// Insert (or refresh) a key at a level. Ensures single residence by
    /// dropping any copy at other levels first.
    pub fn insert(&self, key: &[u8], value: Bytes, level_index: usize, hot_hint: bool) {
        if self.is_bypassed() {
            return;
        }
        let level_index = level_index.min(L4_OVERFLOW);
        self.remove_everywhere(key);
        let now = Instant::now();
        self.insert_at(
            level_index,
            key.to_vec(),
            Entry {
                value,
                inserted_at: now,
                last_hit_at: now,
                hits: 0,
                weight: if hot_hint { 2 } else { 1 },
            },
        );
    }

    /// Drop a key from every level.
    pub fn invalidate(&self, key: &[u8]) {
        if self.is_bypassed() {
            return;
        }
        self.remove_everywhere(key);
    }

    /// Clear contents and leave bypass mode.
    pub fn reset(&self) {
        for level in &self.levels {
            for segment in &level.segments {
                segment.lock().clear();
            }
            level.size.store(0, Ordering::Release);
        }
        self.bypassed.store(false, Ordering::Release);
        debug!("cache reset");
    }

    /// Background sweep: demote (or at L4 evict) entries whose last hit
    /// is older than the staleness threshold.
    pub fn sweep(&self) {
        if self.is_bypassed() {
            return;
        }
        let now = Instant::now();
        // Lowest level first so a demoted entry moves exactly one level
        // per sweep instead of cascading straight to eviction.
        for level_index in (0..LEVEL_COUNT).rev() {
            let level = &self.levels[level_index];
            let mut stale: Vec<(Vec<u8>, Entry)> = Vec::new();
            for segment in &level.segments {
                let mut map = segment.lock();
                let keys: Vec<Vec<u8>> = map
                    .iter()
                    .filter(|(_, e)| now.duration_since(e.last_hit_at) >= self.cfg.stale_after)
                    .map(|(k, _)| k.clone())
                    .collect();
                for key in keys {
                    if let Some((key, entry)) = map.remove_entry(&key) {
                        self.sub_size(level_index);
                        stale.push((key, entry));
                    }
                }
            }
            for (key, entry) in stale {
                if level_index < L4_OVERFLOW {
                    self.insert_at(level_index + 1, key, entry);
                } else {
                    level.evictions.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    pub fn metrics(&self) -> CacheMetrics {
        CacheMetrics {
            levels: self
                .levels
                .iter()
                .enumerate()
                .map(|(index, level)| CacheLevelMetrics {
                    level: level_name(index),
                    capacity: level.capacity,
                    size: level.size.load(Ordering::Relaxed),
                    hits: level.hits.load(Ordering::Relaxed),
                    misses: level.misses.load(Ordering::Relaxed),
                    evictions: level.evictions.load(Ordering::Relaxed),
                })
                .collect(),
            bypassed: self.is_bypassed(),
            bypass_events: self.bypass_events.load(Ordering::Relaxed),
        }
    }

    /// Level size currently held (for tests and metrics assertions).
    pub fn level_size(&self, level_index: usize) -> usize {
        self.levels[level_index].size.load(Ordering::Relaxed)
    }

    fn remove_everywhere(&self, key: &[u8]) {
        for level_index in 0..LEVEL_COUNT {
            let level = &self.levels[level_index];
            let removed = level.segment(key).lock().remove(key).is_some();
            if removed {
                self.sub_size(level_index);
            }
        }
    }

    /// Insert at a level, demoting the displaced victim down the chain.
    /// Locks exactly one segment at a time.
    fn insert_at(&self, level_index: usize, key: Vec<u8>, entry: Entry) {
        let mut level_index = level_index;
        let mut key = key;
        let mut entry = entry;
        loop {
            let level = &self.levels[level_index];
            let displaced = {
                let segment = level.segment(&key);
                let mut map = segment.lock();
                if map.insert(key.clone(), entry).is_none() {
                    level.size.fetch_add(1, Ordering::Relaxed);
                }
                if level.size.load(Ordering::Relaxed) > level.capacity {
                    let victim = self.pick_victim(&map);
                    victim.and_then(|victim_key| {
                        map.remove_entry(&victim_key).inspect(|_| {
                            self.sub_size(level_index);
                        })
                    })
                } else {
                    None
                }
            };
            match displaced {
                Some((victim_key, victim_entry)) if level_index < L4_OVERFLOW => {
                    level_index += 1;
                    key = victim_key;
                    entry = victim_entry;
                }
                Some(_) => {
                    level.evictions.fetch_add(1, Ordering::Relaxed);
                    break;
                }
                None => break,
            }
        }
    }

    /// Least-retention entry within one segment: oldest, fewest hits,
    /// not recently hit; ties broken by oldest insertion.
    fn pick_victim(&self, map: &HashMap<Vec<u8>, Entry>) -> Option<Vec<u8>> {
        let now = Instant::now();
        map.iter()
            .min_by(|(_, a), (_, b)| {
                let ra = self.retention(a, now);
                let rb = self.retention(b, now);
                ra.partial_cmp(&rb)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.inserted_at.cmp(&b.inserted_at))
            })
            .map(|(key, _)| key.clone())
    }

    fn retention(&self, entry: &Entry, now: Instant) -> f64 {
        let age = now.duration_since(entry.inserted_at).as_secs_f64();
        let recently_hit = now.duration_since(entry.last_hit_at) <= self.cfg.recent_hit_window;
        self.cfg.hit_weight * entry.hits as f64
            + self.cfg.recency_weight * f64::from(u8::from(recently_hit))
            + f64::from(entry.weight)
            - self.cfg.age_weight * age
    }

    fn sub_size(&self, level_index: usize) {
        let level = &self.levels[level_index];
        let previous = level.size.fetch_sub(1, Ordering::Relaxed);
        if previous == 0 {
            // Accounting went negative: structural corruption. Step out
            // of the data path rather than serve wrong answers.
            level.size.store(0, Ordering::Release);
            self.note_internal_failure("level size underflow");
        }
    }

    fn note_internal_failure(&self, reason: &str) {
        if !self.bypassed.swap(true, Ordering::AcqRel) {
            self.bypass_events.fetch_add(1, Ordering::Relaxed);
            warn!(reason, "cache inconsistency detected; bypassing cache until reset");
        }
    }

    #[cfg(test)]
    pub(crate) fn force_bypass(&self) {
        self.note_internal_failure("forced by test");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{L1_HOT, L2_WARM, L3_COLD, L4_OVERFLOW};
    use std::time::Duration;

    fn small_cache() -> TieredCache {
        TieredCache::new(CacheConfig {
            level_capacities: [4, 3, 2, 1],
            segments_per_level: 1,
            recent_hit_window: Duration::from_secs(5),
            stale_after: Duration::from_millis(50),
            ..CacheConfig::default()
        })
    }

    #[test]
    fn insert_then_lookup_hits() {
        let cache = small_cache();
        cache.insert(b"k", Bytes::from_static(b"v"), L2_WARM, false);
        assert_eq!(cache.lookup(b"k").unwrap().as_ref(), b"v");
    }

    #[test]
    fn invalidate_removes_from_all_levels() {
        let cache = small_cache();
        cache.insert(b"k", Bytes::from_static(b"v"), L2_WARM, false);
        cache.lookup(b"k"); // promotes to L1
        cache.invalidate(b"k");
        assert!(cache.lookup(b"k").is_none());
        for level in 0..LEVEL_COUNT {
            assert_eq!(cache.level_size(level), 0);
        }
    }

    #[test]
    fn hit_promotes_one_level_at_a_time() {
        let cache = small_cache();
        cache.insert(b"k", Bytes::from_static(b"v"), L3_COLD, false);
        assert_eq!(cache.level_size(L3_COLD), 1);

        cache.lookup(b"k");
        assert_eq!(cache.level_size(L3_COLD), 0);
        assert_eq!(cache.level_size(L2_WARM), 1);

        cache.lookup(b"k");
        assert_eq!(cache.level_size(L2_WARM), 0);
        assert_eq!(cache.level_size(L1_HOT), 1);

        // L1 hits stay in L1.
        cache.lookup(b"k");
        assert_eq!(cache.level_size(L1_HOT), 1);
    }

    #[test]
    fn single_residence_is_maintained_on_reinsert() {
        let cache = small_cache();
        cache.insert(b"k", Bytes::from_static(b"v1"), L2_WARM, false);
        cache.lookup(b"k"); // now in L1
        cache.insert(b"k", Bytes::from_static(b"v2"), L2_WARM, false);
        assert_eq!(cache.level_size(L1_HOT), 0);
        assert_eq!(cache.level_size(L2_WARM), 1);
        assert_eq!(cache.lookup(b"k").unwrap().as_ref(), b"v2");
    }

    #[test]
    fn overflow_displaces_down_the_chain() {
        let cache = TieredCache::new(CacheConfig {
            level_capacities: [4, 2, 1, 1],
            segments_per_level: 1,
            ..CacheConfig::default()
        });
        cache.insert(b"a", Bytes::from_static(b"1"), L2_WARM, false);
        cache.insert(b"b", Bytes::from_static(b"2"), L2_WARM, false);
        cache.insert(b"c", Bytes::from_static(b"3"), L2_WARM, false);
        // L2 holds two of the three; one was displaced into L3.
        assert_eq!(cache.level_size(L2_WARM), 2);
        assert_eq!(cache.level_size(L3_COLD), 1);
        // All three remain reachable.
        for key in [b"a", b"b", b"c"] {
            assert!(cache.lookup(key).is_some());
        }
    }

    #[test]
    fn overflow_at_l4_evicts() {
        let cache = TieredCache::new(CacheConfig {
            level_capacities: [4, 3, 2, 1],
            segments_per_level: 1,
            ..CacheConfig::default()
        });
        for i in 0..10u8 {
            cache.insert(&[i], Bytes::from_static(b"v"), L4_OVERFLOW, false);
        }
        assert_eq!(cache.level_size(L4_OVERFLOW), 1);
        assert!(cache.metrics().levels[L4_OVERFLOW].evictions >= 9);
    }

    #[test]
    fn eviction_prefers_fewest_hits() {
        let cache = TieredCache::new(CacheConfig {
            level_capacities: [2, 1, 1, 1],
            segments_per_level: 1,
            ..CacheConfig::default()
        });
        cache.insert(b"hit", Bytes::from_static(b"h"), L1_HOT, false);
        cache.insert(b"idle", Bytes::from_static(b"i"), L1_HOT, false);
        // L1 hits accumulate in place.
        cache.lookup(b"hit");
        cache.lookup(b"hit");

        cache.insert(b"new", Bytes::from_static(b"n"), L1_HOT, false);
        // Overflow displaced the unhit entry, not the hit one.
        let l1 = &cache.levels[L1_HOT];
        let segment = l1.segments[0].lock();
        assert!(segment.contains_key(b"hit".as_slice()));
        assert!(!segment.contains_key(b"idle".as_slice()));
        drop(segment);
        assert_eq!(cache.level_size(L2_WARM), 1);
    }

    #[test]
    fn eviction_ties_break_by_oldest_insertion() {
        let cache = TieredCache::new(CacheConfig {
            level_capacities: [4, 2, 1, 1],
            segments_per_level: 1,
            ..CacheConfig::default()
        });
        cache.insert(b"old", Bytes::from_static(b"1"), L2_WARM, false);
        cache.insert(b"mid", Bytes::from_static(b"2"), L2_WARM, false);
        cache.insert(b"new", Bytes::from_static(b"3"), L2_WARM, false);
        let l3 = &cache.levels[L3_COLD];
        let segment = l3.segments[0].lock();
        assert!(segment.contains_key(b"old".as_slice()));
    }

    #[test]
    fn sweep_demotes_stale_entries() {
        let cache = small_cache();
        cache.insert(b"k", Bytes::from_static(b"v"), L1_HOT, false);
        std::thread::sleep(Duration::from_millis(60));
        cache.sweep();
        assert_eq!(cache.level_size(L1_HOT), 0);
        assert_eq!(cache.level_size(L2_WARM), 1);
    }

    #[test]
    fn bypassed_cache_steps_out_until_reset() {
        let cache = small_cache();
        cache.insert(b"k", Bytes::from_static(b"v"), L2_WARM, false);
        cache.force_bypass();
        assert!(cache.lookup(b"k").is_none());
        cache.insert(b"x", Bytes::from_static(b"y"), L2_WARM, false);
        assert!(cache.metrics().bypassed);

        cache.reset();
        assert!(!cache.metrics().bypassed);
        assert!(cache.lookup(b"k").is_none()); // reset cleared contents
        cache.insert(b"k", Bytes::from_static(b"v"), L2_WARM, false);
        assert!(cache.lookup(b"k").is_some());
    }
}
