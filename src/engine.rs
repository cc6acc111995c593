// Engine facade.
// Orchestrates Router → Cache → Shard → WAL for the public operations
// and owns the background machinery: one WAL batcher per shard plus the
// cache sweep. This is also the only layer that maps internal failures
// to the public error taxonomy; everything below reports upward.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{TieredCache, L1_HOT, L2_WARM, L3_COLD};
use crate::codec;
use crate::companion::CompanionIndex;
use crate::config::EngineConfig;
use crate::error::{Result, WarpError};
use crate::manifest::Manifest;
use crate::metrics::{MetricsSnapshot, ShardMetrics};
use crate::router::{Router, Tier};
use crate::shard::{Durability, Shard};
use crate::wal::Wal;

/// Cache residency requested for a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePlacement {
    Hot,
    Warm,
    Cold,
    /// Do not cache the value; any stale cached copy is still dropped.
    Skip,
}

/// Per-operation options. The typed struct is the boundary at which the
/// "unknown options rejected" rule holds: outer surfaces translating
/// from loose formats must fail unknown fields before building one.
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub tier_hint: Option<Tier>,
    pub durability: Durability,
    /// Relative deadline; the engine default applies when absent.
    pub deadline: Option<Duration>,
    pub cache_hint: Option<CachePlacement>,
    /// One-shot companion declaration applied after a successful write.
    pub companions: Vec<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct PutReceipt {
    pub shard_id: u16,
    pub elapsed_ns: u64,
}

#[derive(Debug, Clone)]
pub struct GetReceipt {
    pub value: Bytes,
    pub shard_id: u16,
    pub elapsed_ns: u64,
}

/// Result of an enriched read. Companion ordering follows declared
/// strength, not fetch completion.
#[derive(Debug, Clone)]
pub struct EnrichedGet {
    pub value: Bytes,
    pub shard_id: u16,
    pub present_companions: Vec<(Vec<u8>, Bytes)>,
    pub missing_companions: Vec<Vec<u8>>,
    pub fetch_time_ns: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

struct Shutdown {
    flag: AtomicBool,
    notify: Notify,
}

struct Inner {
    cfg: EngineConfig,
    router: Router,
    shards: Vec<Arc<Shard>>,
    cache: Arc<TieredCache>,
    companions: Arc<CompanionIndex>,
    epoch: Instant,
    closed: AtomicBool,
    shutdown: Arc<Shutdown>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// The embeddable engine. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

impl Engine {
    /// Open (or create) an engine at the configured data root. Runs WAL
    /// recovery for every shard and starts the background tasks, so it
    /// must be called from within a tokio runtime.
    pub async fn open(config: EngineConfig) -> Result<Engine> {
        let cfg = config.apply_env()?;
        cfg.validate()?;
        std::fs::create_dir_all(&cfg.data_root)?;
        Manifest::open(&cfg.data_root, cfg.shard_count)?;

        let router = Router::new(cfg.shard_count, cfg.hot_shards, cfg.warm_shards);
        let epoch = Instant::now();
        let cache = Arc::new(TieredCache::new(cfg.cache.clone()));
        let companions = Arc::new(CompanionIndex::new(
            cfg.companions.max_companions_per_primary,
        ));
        let shutdown = Arc::new(Shutdown {
            flag: AtomicBool::new(false),
            notify: Notify::new(),
        });

        let mut shards = Vec::with_capacity(usize::from(cfg.shard_count));
        for shard_id in 0..cfg.shard_count {
            let shard_root = cfg.data_root.join("shards").join(shard_id.to_string());
            let (wal, recovered) =
                Wal::open(shard_id, shard_root.join("wal"), cfg.wal.clone())?;

            let shard = Arc::new(Shard::new(shard_id, router.tier_of(shard_id), epoch, wal));
            if let Some(snapshot) = newest_snapshot(&shard_root.join("snapshot"))? {
                shard.apply_recovered(&snapshot);
            }
            shard.apply_recovered(&recovered);
            shards.push(shard);
        }

        // Recovery succeeded everywhere; only now start the batchers.
        let mut tasks = Vec::new();
        for shard in &shards {
            tasks.push(tokio::spawn(shard.wal().clone().run_batcher()));
        }

        {
            let cache = cache.clone();
            let shutdown = shutdown.clone();
            let interval = cfg.cache.sweep_interval;
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.notify.notified() => {}
                        _ = tokio::time::sleep(interval) => {}
                    }
                    if shutdown.flag.load(Ordering::Acquire) {
                        break;
                    }
                    cache.sweep();
                }
                debug!("cache sweep stopped");
            }));
        }

        info!(
            data_root = %cfg.data_root.display(),
            shard_count = cfg.shard_count,
            "engine open"
        );
        Ok(Engine {
            inner: Arc::new(Inner {
                cfg,
                router,
                shards,
                cache,
                companions,
                epoch,
                closed: AtomicBool::new(false),
                shutdown,
                tasks: Mutex::new(tasks),
            }),
        })
    }

    /// Durable write. Acknowledged after the WAL fsync covering it
    /// unless buffered durability was requested.
    pub async fn put(&self, key: &[u8], value: &[u8], opts: PutOptions) -> Result<PutReceipt> {
        let start = Instant::now();
        self.ensure_open()?;
        self.validate_key(key)?;
        if value.len() > self.inner.cfg.max_value_bytes {
            return Err(WarpError::InvalidArgument(format!(
                "value of {} bytes exceeds limit {}",
                value.len(),
                self.inner.cfg.max_value_bytes
            )));
        }
        for companion in &opts.companions {
            self.validate_key(companion)?;
            if companion.as_slice() == key {
                return Err(WarpError::InvalidArgument(
                    "a key cannot be its own companion".into(),
                ));
            }
        }

        let deadline = self.deadline_from(opts.deadline);
        let shard_id = self.inner.router.shard_of(key);
        let shard = &self.inner.shards[usize::from(shard_id)];
        let value = Bytes::copy_from_slice(value);

        shard
            .put(key, value.clone(), opts.durability, Some(deadline))
            .await?;

        // Cache is best-effort from here on; the write already stands.
        match self.placement_for(&opts) {
            CachePlacement::Skip => self.inner.cache.invalidate(key),
            placement => {
                let (level, hot) = match placement {
                    CachePlacement::Hot => (L1_HOT, true),
                    CachePlacement::Warm => (L2_WARM, false),
                    CachePlacement::Cold => (L3_COLD, false),
                    CachePlacement::Skip => unreachable!(),
                };
                self.inner.cache.insert(key, value, level, hot);
            }
        }

        if !opts.companions.is_empty() {
            self.inner.companions.declare(key, &opts.companions, None)?;
        }

        Ok(PutReceipt {
            shard_id,
            elapsed_ns: start.elapsed().as_nanos() as u64,
        })
    }

    /// Point read: cache first, then the owning shard's map (filling the
    /// cache at the shard tier's default level on the way out).
    pub async fn get(&self, key: &[u8]) -> Result<Option<GetReceipt>> {
        let start = Instant::now();
        self.ensure_open()?;
        self.validate_key(key)?;

        Ok(self.inner.read_value(key).map(|(value, shard_id)| GetReceipt {
            value,
            shard_id,
            elapsed_ns: start.elapsed().as_nanos() as u64,
        }))
    }

    /// Enriched read: the primary plus its declared companions, fetched
    /// concurrently. A companion failure never fails the call; it lands
    /// in missing_companions.
    pub async fn get_with_companions(&self, key: &[u8]) -> Result<Option<EnrichedGet>> {
        let start = Instant::now();
        self.ensure_open()?;
        self.validate_key(key)?;

        let Some((value, shard_id)) = self.inner.read_value(key) else {
            return Ok(None);
        };

        let companions = self.inner.companions.lookup(key);
        let mut handles = Vec::with_capacity(companions.len());
        for (companion_key, _) in &companions {
            let inner = self.inner.clone();
            let companion_key = companion_key.clone();
            handles.push(tokio::spawn(async move {
                inner.read_value(&companion_key).map(|(value, _)| value)
            }));
        }

        let mut present_companions = Vec::new();
        let mut missing_companions = Vec::new();
        let results = futures::future::join_all(handles).await;
        for ((companion_key, _), result) in companions.into_iter().zip(results) {
            match result {
                Ok(Some(value)) => present_companions.push((companion_key, value)),
                // Absent, or the fetch task failed: either way reported
                // as missing, in declared order.
                Ok(None) | Err(_) => missing_companions.push(companion_key),
            }
        }

        Ok(Some(EnrichedGet {
            value,
            shard_id,
            present_companions,
            missing_companions,
            fetch_time_ns: start.elapsed().as_nanos() as u64,
        }))
    }

    /// Durable delete. The key lives in exactly one shard, so the
    /// outcome list carries a single element.
    pub async fn delete(&self, key: &[u8]) -> Result<Vec<(u16, DeleteOutcome)>> {
        self.delete_with_deadline(key, None).await
    }

    pub async fn delete_with_deadline(
        &self,
        key: &[u8],
        deadline: Option<Duration>,
    ) -> Result<Vec<(u16, DeleteOutcome)>> {
        self.ensure_open()?;
        self.validate_key(key)?;

        let deadline = self.deadline_from(deadline);
        let shard_id = self.inner.router.shard_of(key);
        let shard = &self.inner.shards[usize::from(shard_id)];
        let existed = shard.delete(key, Some(deadline)).await?;

        self.inner.cache.invalidate(key);
        self.inner.companions.forget(key);

        let outcome = if existed {
            DeleteOutcome::Deleted
        } else {
            DeleteOutcome::NotFound
        };
        Ok(vec![(shard_id, outcome)])
    }

    /// All keys with the given prefix, traversing shards hot → warm →
    /// cold.
    pub async fn scan_keys(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.ensure_open()?;
        let mut keys = Vec::new();
        for shard_id in self.inner.router.probe_order() {
            keys.extend(self.inner.shards[usize::from(shard_id)].keys_with_prefix(prefix));
        }
        Ok(keys)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        let inner = &self.inner;
        MetricsSnapshot {
            uptime_ns: inner.epoch.elapsed().as_nanos() as u64,
            per_shard: inner
                .shards
                .iter()
                .map(|shard| {
                    let counters = shard.counters();
                    ShardMetrics {
                        shard_id: shard.shard_id(),
                        tier: shard.tier(),
                        size: counters.size.load(Ordering::Relaxed),
                        bytes: counters.bytes.load(Ordering::Relaxed),
                        writes: counters.writes.load(Ordering::Relaxed),
                        reads: counters.reads.load(Ordering::Relaxed),
                        hits: counters.hits.load(Ordering::Relaxed),
                        misses: counters.misses.load(Ordering::Relaxed),
                        wal_last_seq: shard.wal().last_seq(),
                        wal_bytes: shard.wal().total_bytes(),
                        wal_degraded: shard.wal().is_degraded(),
                    }
                })
                .collect(),
            cache: inner.cache.metrics(),
            companion_index: inner.companions.metrics(),
        }
    }

    /// Register companions for a primary outside of a write.
    pub fn declare_companions(
        &self,
        primary: &[u8],
        companions: &[Vec<u8>],
        strength: Option<f64>,
    ) -> Result<()> {
        self.ensure_open()?;
        self.validate_key(primary)?;
        for companion in companions {
            self.validate_key(companion)?;
        }
        self.inner.companions.declare(primary, companions, strength)
    }

    pub fn forget_companions(&self, primary: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.inner.companions.forget(primary);
        Ok(())
    }

    pub fn forget_companion(&self, primary: &[u8], companion: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.inner.companions.forget_companion(primary, companion);
        Ok(())
    }

    /// Write a snapshot per shard and drop WAL generations the snapshots
    /// make redundant.
    pub async fn write_snapshots(&self) -> Result<()> {
        self.ensure_open()?;
        self.inner.write_snapshots()
    }

    /// Graceful shutdown: refuse new operations, drain and close every
    /// WAL, stop background tasks within the grace period, and write
    /// final snapshots when configured. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("engine closing");

        for shard in &self.inner.shards {
            shard.wal().begin_shutdown();
        }
        self.inner.shutdown.flag.store(true, Ordering::Release);
        self.inner.shutdown.notify.notify_waiters();

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.tasks.lock());
        let drain = futures::future::join_all(handles);
        if tokio::time::timeout(self.inner.cfg.shutdown_grace, drain)
            .await
            .is_err()
        {
            warn!("graceful shutdown exceeded grace period; forcing close after final flush");
        }

        let mut first_error = None;
        for shard in &self.inner.shards {
            if let Err(e) = shard.wal().close() {
                // A degraded shard is already read-only; closing keeps
                // going so the healthy shards still sync.
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        if self.inner.cfg.snapshot_on_close {
            self.inner.write_snapshots()?;
        }

        info!("engine closed");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(WarpError::Unavailable);
        }
        Ok(())
    }

    fn validate_key(&self, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(WarpError::InvalidArgument("empty key".into()));
        }
        if key.len() > self.inner.cfg.max_key_bytes {
            return Err(WarpError::InvalidArgument(format!(
                "key of {} bytes exceeds limit {}",
                key.len(),
                self.inner.cfg.max_key_bytes
            )));
        }
        Ok(())
    }

    fn deadline_from(&self, relative: Option<Duration>) -> tokio::time::Instant {
        tokio::time::Instant::now() + relative.unwrap_or(self.inner.cfg.default_deadline)
    }

    /// Writes land in L2 unless hinted otherwise; read-fills use the
    /// shard tier's default residency instead (see Inner::read_value).
    fn placement_for(&self, opts: &PutOptions) -> CachePlacement {
        if let Some(hint) = opts.cache_hint {
            return hint;
        }
        match opts.tier_hint {
            Some(Tier::Hot) => CachePlacement::Hot,
            Some(Tier::Warm) | None => CachePlacement::Warm,
            Some(Tier::Cold) => CachePlacement::Cold,
        }
    }

    #[cfg(test)]
    pub(crate) fn degrade_shard_for_tests(&self, shard_id: u16) {
        self.inner.shards[usize::from(shard_id)].wal().degrade();
    }

    #[cfg(test)]
    pub(crate) fn router(&self) -> &Router {
        &self.inner.router
    }
}

impl Inner {
    /// Shared read path: cache, then shard map with a read-fill at the
    /// tier's default residency level.
    fn read_value(&self, key: &[u8]) -> Option<(Bytes, u16)> {
        let shard_id = self.router.shard_of(key);
        if let Some(value) = self.cache.lookup(key) {
            return Some((value, shard_id));
        }
        let shard = &self.shards[usize::from(shard_id)];
        let value = shard.get(key)?;
        let level = match shard.tier() {
            Tier::Hot => L1_HOT,
            Tier::Warm => L2_WARM,
            Tier::Cold => L3_COLD,
        };
        self.cache.insert(key, value.clone(), level, false);
        Some((value, shard_id))
    }

    fn write_snapshots(&self) -> Result<()> {
        for shard in &self.shards {
            let shard_root = self
                .cfg
                .data_root
                .join("shards")
                .join(shard.shard_id().to_string());
            let snapshot_dir = shard_root.join("snapshot");
            std::fs::create_dir_all(&snapshot_dir)?;

            let generation = shard.wal().generation();
            let tmp = snapshot_dir.join(format!("{generation:010}.snap.tmp"));
            let path = snapshot_dir.join(format!("{generation:010}.snap"));
            let mut out = Vec::new();
            let records = shard.snapshot(&mut out)?;
            std::fs::write(&tmp, &out)?;
            std::fs::rename(&tmp, &path)?;
            debug!(
                shard_id = shard.shard_id(),
                generation, records, "snapshot written"
            );

            shard.wal().prune_generations()?;
        }
        Ok(())
    }
}

/// Load the newest snapshot stream in a shard's snapshot directory.
fn newest_snapshot(dir: &std::path::Path) -> Result<Option<Vec<(u64, codec::WalRecord)>>> {
    if !dir.exists() {
        return Ok(None);
    }
    let mut newest: Option<(u64, std::path::PathBuf)> = None;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(stem) = name.strip_suffix(".snap") else {
            continue;
        };
        let Ok(generation) = stem.parse::<u64>() else {
            continue;
        };
        if newest.as_ref().map_or(true, |(g, _)| generation > *g) {
            newest = Some((generation, entry.path()));
        }
    }
    match newest {
        Some((_, path)) => {
            let raw = std::fs::read(path)?;
            Ok(Some(codec::decode_all(&raw)?))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_config(root: &std::path::Path) -> EngineConfig {
        let mut cfg = EngineConfig {
            data_root: root.to_path_buf(),
            shard_count: 4,
            hot_shards: 1,
            warm_shards: 1,
            ..EngineConfig::default()
        };
        cfg.wal.flush_interval = Duration::from_millis(1);
        cfg
    }

    /// Find a key that routes to the wanted shard.
    fn key_for_shard(engine: &Engine, shard_id: u16) -> Vec<u8> {
        for i in 0..100_000u32 {
            let key = format!("probe-{i}").into_bytes();
            if engine.router().shard_of(&key) == shard_id {
                return key;
            }
        }
        panic!("no key found for shard {shard_id}");
    }

    #[tokio::test]
    async fn degraded_shard_rejects_writes_but_serves_reads() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(test_config(dir.path())).await.unwrap();

        let victim_key = key_for_shard(&engine, 0);
        engine
            .put(&victim_key, b"survives", PutOptions::default())
            .await
            .unwrap();

        engine.degrade_shard_for_tests(0);

        // Writes routed to shard 0 fail with the shard's id.
        let err = engine
            .put(&victim_key, b"rejected", PutOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, WarpError::ShardDegraded { shard_id: 0 }));

        // Another shard still accepts writes.
        let healthy_key = key_for_shard(&engine, 1);
        engine
            .put(&healthy_key, b"fine", PutOptions::default())
            .await
            .unwrap();

        // Reads on the degraded shard keep serving from memory.
        let got = engine.get(&victim_key).await.unwrap().unwrap();
        assert_eq!(got.value.as_ref(), b"survives");

        assert!(engine.metrics().shard(0).unwrap().wal_degraded);

        let _ = engine.close().await;
    }

    #[tokio::test]
    async fn closed_engine_is_unavailable() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(test_config(dir.path())).await.unwrap();
        engine.close().await.unwrap();
        let err = engine.put(b"k", b"v", PutOptions::default()).await.unwrap_err();
        assert!(matches!(err, WarpError::Unavailable));
        // Close is idempotent.
        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn snapshot_on_close_prunes_and_reopens() {
        let dir = tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.snapshot_on_close = true;
        cfg.wal.max_file_bytes = 256;

        let engine = Engine::open(cfg.clone()).await.unwrap();
        for i in 0..32u32 {
            engine
                .put(
                    format!("key-{i:04}").as_bytes(),
                    b"0123456789abcdef",
                    PutOptions::default(),
                )
                .await
                .unwrap();
        }
        engine.close().await.unwrap();

        let engine = Engine::open(cfg).await.unwrap();
        for i in 0..32u32 {
            let got = engine
                .get(format!("key-{i:04}").as_bytes())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(got.value.as_ref(), b"0123456789abcdef");
        }
        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn cache_skip_hint_still_invalidates_stale_value() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(test_config(dir.path())).await.unwrap();

        engine.put(b"k", b"v1", PutOptions::default()).await.unwrap();
        engine.get(b"k").await.unwrap(); // warm the cache
        engine
            .put(
                b"k",
                b"v2",
                PutOptions {
                    cache_hint: Some(CachePlacement::Skip),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let got = engine.get(b"k").await.unwrap().unwrap();
        assert_eq!(got.value.as_ref(), b"v2");

        engine.close().await.unwrap();
    }
}
