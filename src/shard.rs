// Shard: one hash-partitioned slice of the keyspace.
// Owns its in-memory table, counters, and WAL handle. Writers serialize
// on a per-shard gate held across the WAL append and the map insert, so
// map order always equals log order; readers share the map lock and only
// touch relaxed counters.

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::time::timeout_at;
use tracing::debug;

use crate::codec::{encode_frame_vec, WalRecord};
use crate::error::{Result, WarpError};
use crate::router::Tier;
use crate::wal::Wal;

/// Durability requested for a single write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Durability {
    /// Acknowledge after the fsync covering the entry (the default).
    #[default]
    Synced,
    /// Acknowledge once buffered; loss window bounded by the batcher's
    /// flush policy.
    Buffered,
}

/// One stored entry.
#[derive(Debug)]
pub struct Record {
    pub value: Bytes,
    /// Monotonic nanoseconds since engine start.
    pub created_at: u64,
    pub updated_at: u64,
    pub access_count: AtomicU64,
    pub last_access: AtomicU64,
    pub size_bytes: usize,
    pub shard_id: u16,
}

#[derive(Debug, Default)]
pub struct ShardCounters {
    pub size: AtomicU64,
    pub bytes: AtomicU64,
    pub writes: AtomicU64,
    pub reads: AtomicU64,
    pub hits: AtomicU64,
    pub misses: AtomicU64,
}

pub struct PutOutcome {
    pub shard_id: u16,
    pub wrote_bytes: usize,
}

/// Copy of a record's metadata, taken under the read lock.
#[derive(Debug, Clone)]
pub struct RecordInfo {
    pub created_at: u64,
    pub updated_at: u64,
    pub access_count: u64,
    pub last_access: u64,
    pub size_bytes: usize,
    pub shard_id: u16,
}

pub struct Shard {
    shard_id: u16,
    tier: Tier,
    /// Engine epoch; all record timestamps are offsets from it.
    epoch: Instant,
    map: RwLock<HashMap<Vec<u8>, Record>>,
    counters: ShardCounters,
    wal: Arc<Wal>,
    /// Serializes the append→insert write path within the shard.
    write_gate: tokio::sync::Mutex<()>,
}

impl Shard {
    pub fn new(shard_id: u16, tier: Tier, epoch: Instant, wal: Arc<Wal>) -> Self {
        Self {
            shard_id,
            tier,
            epoch,
            map: RwLock::new(HashMap::new()),
            counters: ShardCounters::default(),
            wal,
            write_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn shard_id(&self) -> u16 {
        self.shard_id
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn wal(&self) -> &Arc<Wal> {
        &self.wal
    }

    pub fn counters(&self) -> &ShardCounters {
        &self.counters
    }

    fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    /// Replay recovered entries (snapshot stream or WAL) into the map.
    /// No logging happens here; the entries already came from disk.
    pub fn apply_recovered(&self, entries: &[(u64, WalRecord)]) {
        let mut map = self.map.write();
        for (_, record) in entries {
            match record {
                WalRecord::Put { key, value, ts } => {
                    let size_bytes = key.len() + value.len();
                    map.insert(
                        key.clone(),
                        Record {
                            value: value.clone(),
                            created_at: *ts,
                            updated_at: *ts,
                            access_count: AtomicU64::new(0),
                            last_access: AtomicU64::new(*ts),
                            size_bytes,
                            shard_id: self.shard_id,
                        },
                    );
                }
                WalRecord::Delete { key, .. } => {
                    map.remove(key);
                }
                WalRecord::Checkpoint { .. } => {}
            }
        }
        let size = map.len() as u64;
        let bytes: u64 = map.values().map(|r| r.size_bytes as u64).sum();
        drop(map);
        self.counters.size.store(size, Ordering::Relaxed);
        self.counters.bytes.store(bytes, Ordering::Relaxed);
        debug!(shard_id = self.shard_id, size, bytes, "shard state replayed");
    }

    /// Durable write. The WAL append happens before the map insert, so a
    /// crash between the two replays to the same state as a crash after.
    pub async fn put(
        &self,
        key: &[u8],
        value: Bytes,
        durability: Durability,
        deadline: Option<tokio::time::Instant>,
    ) -> Result<PutOutcome> {
        let _gate = self.acquire_gate(deadline).await?;

        // Safe point: nothing has been logged yet.
        if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
            return Err(WarpError::Cancelled);
        }

        let ts = self.now_ns();
        let entry = WalRecord::Put {
            key: key.to_vec(),
            value: value.clone(),
            ts,
        };
        match durability {
            Durability::Synced => {
                self.wal.append_sync(&entry).await?;
            }
            Durability::Buffered => {
                self.wal.append(&entry)?;
            }
        }

        let size_bytes = key.len() + value.len();
        let replaced_bytes = {
            let mut map = self.map.write();
            match map.get_mut(key) {
                Some(record) => {
                    // Overwrite in place; creation time survives.
                    let old = record.size_bytes;
                    record.value = value;
                    record.updated_at = ts;
                    record.size_bytes = size_bytes;
                    Some(old)
                }
                None => {
                    map.insert(
                        key.to_vec(),
                        Record {
                            value,
                            created_at: ts,
                            updated_at: ts,
                            access_count: AtomicU64::new(0),
                            last_access: AtomicU64::new(ts),
                            size_bytes,
                            shard_id: self.shard_id,
                        },
                    );
                    None
                }
            }
        };

        match replaced_bytes {
            Some(old_bytes) => {
                self.counters
                    .bytes
                    .fetch_add(size_bytes as u64, Ordering::Relaxed);
                self.counters
                    .bytes
                    .fetch_sub(old_bytes as u64, Ordering::Relaxed);
            }
            None => {
                self.counters.size.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .bytes
                    .fetch_add(size_bytes as u64, Ordering::Relaxed);
            }
        }
        self.counters.writes.fetch_add(1, Ordering::Relaxed);

        Ok(PutOutcome {
            shard_id: self.shard_id,
            wrote_bytes: size_bytes,
        })
    }

    /// Point lookup. Access tracking is observational and uses relaxed
    /// atomics; it never takes the write lock.
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        let map = self.map.read();
        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        match map.get(key) {
            Some(record) => {
                record.access_count.fetch_add(1, Ordering::Relaxed);
                record.last_access.store(self.now_ns(), Ordering::Relaxed);
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Some(record.value.clone())
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Durable delete. Returns whether the key existed.
    pub async fn delete(
        &self,
        key: &[u8],
        deadline: Option<tokio::time::Instant>,
    ) -> Result<bool> {
        let _gate = self.acquire_gate(deadline).await?;
        if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
            return Err(WarpError::Cancelled);
        }

        let entry = WalRecord::Delete {
            key: key.to_vec(),
            ts: self.now_ns(),
        };
        self.wal.append_sync(&entry).await?;

        let removed = self.map.write().remove(key);
        let existed = match removed {
            Some(old) => {
                self.counters.size.fetch_sub(1, Ordering::Relaxed);
                self.counters
                    .bytes
                    .fetch_sub(old.size_bytes as u64, Ordering::Relaxed);
                true
            }
            None => false,
        };
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        Ok(existed)
    }

    async fn acquire_gate(
        &self,
        deadline: Option<tokio::time::Instant>,
    ) -> Result<tokio::sync::MutexGuard<'_, ()>> {
        match deadline {
            Some(deadline) => timeout_at(deadline, self.write_gate.lock())
                .await
                .map_err(|_| {
                    WarpError::Timeout(format!(
                        "shard {} writer gate not acquired before deadline",
                        self.shard_id
                    ))
                }),
            None => Ok(self.write_gate.lock().await),
        }
    }

    /// Stream all records in key-ascending order as framed Put entries
    /// (seq 0); the result is a replayable snapshot prefix.
    pub fn snapshot(&self, writer: &mut dyn Write) -> Result<u64> {
        let map = self.map.read();
        let mut keys: Vec<&Vec<u8>> = map.keys().collect();
        keys.sort_unstable();
        let mut written = 0u64;
        for key in keys {
            let record = &map[key];
            let frame = encode_frame_vec(
                &WalRecord::Put {
                    key: key.clone(),
                    value: record.value.clone(),
                    ts: record.updated_at,
                },
                0,
            );
            writer.write_all(&frame)?;
            written += 1;
        }
        Ok(written)
    }

    /// Observational view of a stored record's bookkeeping.
    pub fn record_info(&self, key: &[u8]) -> Option<RecordInfo> {
        let map = self.map.read();
        map.get(key).map(|record| RecordInfo {
            created_at: record.created_at,
            updated_at: record.updated_at,
            access_count: record.access_count.load(Ordering::Relaxed),
            last_access: record.last_access.load(Ordering::Relaxed),
            size_bytes: record.size_bytes,
            shard_id: record.shard_id,
        })
    }

    /// Keys beginning with `prefix`, for cross-shard scans.
    pub fn keys_with_prefix(&self, prefix: &[u8]) -> Vec<Vec<u8>> {
        self.map
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WalConfig;
    use tempfile::tempdir;

    async fn test_shard(dir: &std::path::Path) -> (Arc<Shard>, tokio::task::JoinHandle<()>) {
        let cfg = WalConfig {
            flush_interval: std::time::Duration::from_millis(1),
            ..WalConfig::default()
        };
        let (wal, recovered) = Wal::open(0, dir.to_path_buf(), cfg).unwrap();
        let batcher = tokio::spawn(wal.clone().run_batcher());
        let shard = Arc::new(Shard::new(0, Tier::Hot, Instant::now(), wal));
        shard.apply_recovered(&recovered);
        (shard, batcher)
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let dir = tempdir().unwrap();
        let (shard, batcher) = test_shard(dir.path()).await;

        let outcome = shard
            .put(b"user:1", Bytes::from_static(b"alice"), Durability::Synced, None)
            .await
            .unwrap();
        assert_eq!(outcome.shard_id, 0);
        assert_eq!(outcome.wrote_bytes, 6 + 5);
        assert_eq!(shard.get(b"user:1").unwrap().as_ref(), b"alice");
        assert!(!shard.is_empty());
        assert_eq!(shard.len(), 1);
        assert_eq!(shard.counters().size.load(Ordering::Relaxed), 1);
        assert_eq!(shard.counters().hits.load(Ordering::Relaxed), 1);

        shard.wal().close().unwrap();
        batcher.await.unwrap();
    }

    #[tokio::test]
    async fn overwrite_keeps_size_and_adjusts_bytes() {
        let dir = tempdir().unwrap();
        let (shard, batcher) = test_shard(dir.path()).await;

        shard
            .put(b"k", Bytes::from_static(b"short"), Durability::Synced, None)
            .await
            .unwrap();
        let created = shard.record_info(b"k").unwrap().created_at;
        shard
            .put(b"k", Bytes::from_static(b"much longer value"), Durability::Synced, None)
            .await
            .unwrap();
        assert_eq!(shard.counters().size.load(Ordering::Relaxed), 1);
        assert_eq!(
            shard.counters().bytes.load(Ordering::Relaxed),
            (1 + 17) as u64
        );

        let _ = shard.get(b"k");
        let info = shard.record_info(b"k").unwrap();
        assert_eq!(info.created_at, created);
        assert!(info.updated_at >= created);
        assert_eq!(info.access_count, 1);
        assert!(info.last_access >= info.updated_at);
        assert_eq!(info.size_bytes, 1 + 17);
        assert_eq!(info.shard_id, 0);

        shard.wal().close().unwrap();
        batcher.await.unwrap();
    }

    #[tokio::test]
    async fn delete_reports_existence() {
        let dir = tempdir().unwrap();
        let (shard, batcher) = test_shard(dir.path()).await;

        shard
            .put(b"k", Bytes::from_static(b"v"), Durability::Synced, None)
            .await
            .unwrap();
        assert!(shard.delete(b"k", None).await.unwrap());
        assert!(!shard.delete(b"k", None).await.unwrap());
        assert!(shard.get(b"k").is_none());
        assert_eq!(shard.counters().size.load(Ordering::Relaxed), 0);

        shard.wal().close().unwrap();
        batcher.await.unwrap();
    }

    #[tokio::test]
    async fn state_survives_reopen_via_wal_replay() {
        let dir = tempdir().unwrap();
        {
            let (shard, batcher) = test_shard(dir.path()).await;
            shard
                .put(b"a", Bytes::from_static(b"1"), Durability::Synced, None)
                .await
                .unwrap();
            shard
                .put(b"b", Bytes::from_static(b"2"), Durability::Synced, None)
                .await
                .unwrap();
            shard.delete(b"a", None).await.unwrap();
            shard.wal().close().unwrap();
            batcher.await.unwrap();
        }

        let (shard, batcher) = test_shard(dir.path()).await;
        assert!(shard.get(b"a").is_none());
        assert_eq!(shard.get(b"b").unwrap().as_ref(), b"2");
        assert_eq!(shard.counters().size.load(Ordering::Relaxed), 1);
        shard.wal().close().unwrap();
        batcher.await.unwrap();
    }

    #[tokio::test]
    async fn snapshot_streams_sorted_replayable_frames() {
        let dir = tempdir().unwrap();
        let (shard, batcher) = test_shard(dir.path()).await;
        for key in ["c", "a", "b"] {
            shard
                .put(key.as_bytes(), Bytes::from_static(b"v"), Durability::Synced, None)
                .await
                .unwrap();
        }
        let mut out = Vec::new();
        let written = shard.snapshot(&mut out).unwrap();
        assert_eq!(written, 3);

        let decoded = crate::codec::decode_all(&out).unwrap();
        let keys: Vec<&[u8]> = decoded
            .iter()
            .map(|(_, record)| match record {
                WalRecord::Put { key, .. } => key.as_slice(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(keys, vec![b"a".as_slice(), b"b", b"c"]);

        shard.wal().close().unwrap();
        batcher.await.unwrap();
    }
}
