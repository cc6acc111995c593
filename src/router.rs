// Key routing.
// A key lives in exactly one shard: shard_of is a pure function of the
// key bytes and the configured shard count. The hash must stay stable
// across releases; changing it requires a data migration and a new
// hash_algorithm_id in the manifest.

use std::hash::Hasher;

use serde::{Deserialize, Serialize};
use siphasher::sip::SipHasher13;

/// Manifest identifier for the routing hash currently built in
/// (SipHash-1-3 with a fixed all-zero key).
pub const HASH_ALGORITHM_ID: u32 = 1;

/// Shard temperature tier. Affects scan probe order, default cache
/// residency, and eviction aggressiveness; never routing or correctness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Hot,
    Warm,
    Cold,
}

#[derive(Debug, Clone)]
pub struct Router {
    shard_count: u16,
    hot_shards: u16,
    warm_shards: u16,
}

impl Router {
    pub fn new(shard_count: u16, hot_shards: u16, warm_shards: u16) -> Self {
        debug_assert!(shard_count > 0);
        debug_assert!(u32::from(hot_shards) + u32::from(warm_shards) <= u32::from(shard_count));
        Self {
            shard_count,
            hot_shards,
            warm_shards,
        }
    }

    pub fn shard_count(&self) -> u16 {
        self.shard_count
    }

    /// Stable 64-bit routing hash of the key bytes.
    pub fn route_hash(key: &[u8]) -> u64 {
        let mut hasher = SipHasher13::new_with_keys(0, 0);
        hasher.write(key);
        hasher.finish()
    }

    /// Deterministic key → shard mapping.
    pub fn shard_of(&self, key: &[u8]) -> u16 {
        (Self::route_hash(key) % u64::from(self.shard_count)) as u16
    }

    /// Tier of a shard id. Shards 0..H are hot, H..H+W warm, rest cold.
    pub fn tier_of(&self, shard_id: u16) -> Tier {
        if shard_id < self.hot_shards {
            Tier::Hot
        } else if shard_id < self.hot_shards + self.warm_shards {
            Tier::Warm
        } else {
            Tier::Cold
        }
    }

    /// Shard ids grouped hot → warm → cold, ascending within each tier.
    /// Used only by cross-shard scan paths; point reads already know
    /// their shard.
    pub fn probe_order(&self) -> impl Iterator<Item = u16> {
        0..self.shard_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_is_deterministic() {
        let router = Router::new(4, 1, 2);
        let a = router.shard_of(b"user:1");
        for _ in 0..100 {
            assert_eq!(router.shard_of(b"user:1"), a);
        }
    }

    #[test]
    fn routing_depends_only_on_bytes_and_count() {
        let r1 = Router::new(16, 2, 4);
        let r2 = Router::new(16, 8, 8);
        // Tier layout differs, routing must not.
        for key in [b"a".as_slice(), b"user:42", b"\x00\x01\x02"] {
            assert_eq!(r1.shard_of(key), r2.shard_of(key));
        }
    }

    #[test]
    fn route_hash_is_seed_free() {
        // Guards the on-disk compatibility contract: the hash must come
        // from fixed keys, not a per-process seed, so two independent
        // hasher constructions agree.
        use std::hash::Hasher;
        let mut h = siphasher::sip::SipHasher13::new_with_keys(0, 0);
        h.write(b"user:1");
        assert_eq!(Router::route_hash(b"user:1"), h.finish());
        assert_ne!(Router::route_hash(b"user:1"), Router::route_hash(b"user:2"));
    }

    #[test]
    fn probe_order_goes_hot_warm_cold() {
        let router = Router::new(6, 2, 2);
        let order: Vec<u16> = router.probe_order().collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(router.tier_of(0), Tier::Hot);
        assert_eq!(router.tier_of(1), Tier::Hot);
        assert_eq!(router.tier_of(2), Tier::Warm);
        assert_eq!(router.tier_of(3), Tier::Warm);
        assert_eq!(router.tier_of(4), Tier::Cold);
        assert_eq!(router.tier_of(5), Tier::Cold);
    }

    #[test]
    fn shards_cover_keyspace() {
        let router = Router::new(4, 1, 1);
        let mut seen = [false; 4];
        for i in 0..1000u32 {
            let key = format!("key-{i}");
            seen[usize::from(router.shard_of(key.as_bytes()))] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }
}
