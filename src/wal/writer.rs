// WAL batching writer.
// One dedicated batcher per shard drains an append buffer with a single
// write + fsync, then wakes the append_sync waiters it covered. Any I/O
// failure marks the log degraded: the shard keeps serving reads from
// memory while writes are rejected until restart.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::BytesMut;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, error, info, warn};

use crate::codec::{encode_frame, WalRecord};
use crate::config::WalConfig;
use crate::error::{Result, WarpError};

use super::{generation_file, parse_generation, recover_dir};

struct Waiter {
    seq: u64,
    tx: oneshot::Sender<Result<u64>>,
}

/// Append buffer shared between callers and the batcher.
struct Batch {
    next_seq: u64,
    buf: BytesMut,
    entries: usize,
    oldest: Option<Instant>,
    waiters: Vec<Waiter>,
}

impl Batch {
    fn should_flush(&self, cfg: &WalConfig) -> bool {
        if self.entries == 0 {
            return false;
        }
        if self.buf.len() >= cfg.max_batch_bytes || self.entries >= cfg.max_batch_entries {
            return true;
        }
        match self.oldest {
            Some(oldest) => oldest.elapsed() >= cfg.flush_interval,
            None => false,
        }
    }

    fn take(&mut self) -> (BytesMut, Vec<Waiter>, u64) {
        self.oldest = None;
        self.entries = 0;
        let last_seq = self.next_seq.saturating_sub(1);
        (
            std::mem::take(&mut self.buf),
            std::mem::take(&mut self.waiters),
            last_seq,
        )
    }
}

struct ActiveFile {
    file: Option<File>,
    generation: u64,
    file_bytes: u64,
}

/// Flush-discipline statistics for one shard's log.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WalStats {
    pub total_records: u64,
    pub group_commits: u64,
    pub avg_group_size: f64,
    pub fsyncs: u64,
    pub avg_flush_time_ms: f64,
    pub rotations: u64,
}

/// Write-ahead log for one shard.
pub struct Wal {
    shard_id: u16,
    dir: PathBuf,
    cfg: WalConfig,
    batch: Mutex<Batch>,
    active: Mutex<ActiveFile>,
    notify: Notify,
    shutdown: AtomicBool,
    degraded: AtomicBool,
    last_seq: AtomicU64,
    durable_seq: AtomicU64,
    total_bytes: AtomicU64,
    stats: RwLock<WalStats>,
}

impl Wal {
    /// Open the shard's WAL directory: run recovery (torn-tail
    /// truncation included), position the sequence counter, and open the
    /// newest generation for append. The recovered entries are returned
    /// for the shard to replay.
    pub fn open(
        shard_id: u16,
        dir: PathBuf,
        cfg: WalConfig,
    ) -> Result<(Arc<Wal>, Vec<(u64, WalRecord)>)> {
        std::fs::create_dir_all(&dir)?;
        let recovered = recover_dir(&dir)?;

        let path = generation_file(&dir, recovered.active_generation);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let file_bytes = file.metadata()?.len();

        debug!(
            shard_id,
            generation = recovered.active_generation,
            last_seq = recovered.last_seq,
            entries = recovered.entries.len(),
            "opened write-ahead log"
        );

        let wal = Arc::new(Wal {
            shard_id,
            dir,
            cfg,
            batch: Mutex::new(Batch {
                next_seq: recovered.last_seq + 1,
                buf: BytesMut::new(),
                entries: 0,
                oldest: None,
                waiters: Vec::new(),
            }),
            active: Mutex::new(ActiveFile {
                file: Some(file),
                generation: recovered.active_generation,
                file_bytes,
            }),
            notify: Notify::new(),
            shutdown: AtomicBool::new(false),
            degraded: AtomicBool::new(false),
            last_seq: AtomicU64::new(recovered.last_seq),
            durable_seq: AtomicU64::new(recovered.last_seq),
            total_bytes: AtomicU64::new(recovered.total_bytes),
            stats: RwLock::new(WalStats::default()),
        });
        Ok((wal, recovered.entries))
    }

    /// Buffer an entry for the next flush. Returns once the frame is in
    /// the batch; durability follows within the flush policy bounds.
    pub fn append(&self, record: &WalRecord) -> Result<u64> {
        let (seq, _) = self.enqueue(record, false)?;
        Ok(seq)
    }

    /// Buffer an entry and wait for the fsync covering it.
    pub async fn append_sync(&self, record: &WalRecord) -> Result<u64> {
        let (seq, rx) = self.enqueue(record, true)?;
        let rx = rx.expect("sync enqueue registers a waiter");
        match rx.await {
            Ok(result) => result,
            // Batcher dropped the waiter without resolving it: the task
            // died or shutdown raced the flush.
            Err(_) => Err(WarpError::Internal {
                code: "wal-waiter-dropped",
                message: format!("shard {} batcher dropped a sync waiter", self.shard_id),
            }),
        }
    }

    fn enqueue(
        &self,
        record: &WalRecord,
        sync: bool,
    ) -> Result<(u64, Option<oneshot::Receiver<Result<u64>>>)> {
        if self.degraded.load(Ordering::Acquire) {
            return Err(WarpError::ShardDegraded {
                shard_id: self.shard_id,
            });
        }
        if self.shutdown.load(Ordering::Acquire) {
            return Err(WarpError::Unavailable);
        }

        let (seq, rx, full) = {
            let mut batch = self.batch.lock();
            let seq = batch.next_seq;
            batch.next_seq += 1;
            encode_frame(record, seq, &mut batch.buf);
            batch.entries += 1;
            if batch.oldest.is_none() {
                batch.oldest = Some(Instant::now());
            }
            let rx = if sync {
                let (tx, rx) = oneshot::channel();
                batch.waiters.push(Waiter { seq, tx });
                Some(rx)
            } else {
                None
            };
            let full = batch.buf.len() >= self.cfg.max_batch_bytes
                || batch.entries >= self.cfg.max_batch_entries;
            (seq, rx, full)
        };
        self.last_seq.fetch_max(seq, Ordering::AcqRel);

        // Wake the batcher immediately on a full buffer; otherwise its
        // age-bounded tick picks the entry up within flush_interval.
        if full || sync {
            self.notify.notify_one();
        }
        Ok((seq, rx))
    }

    /// Force write + fsync of everything buffered.
    pub fn flush(&self) -> Result<u64> {
        self.flush_batch()?;
        Ok(self.durable_seq.load(Ordering::Acquire))
    }

    fn flush_batch(&self) -> Result<()> {
        let (buf, waiters, last_seq, entries) = {
            let mut batch = self.batch.lock();
            if batch.entries == 0 {
                return Ok(());
            }
            let entries = batch.entries;
            let (buf, waiters, last_seq) = batch.take();
            (buf, waiters, last_seq, entries)
        };

        let flush_started = Instant::now();
        match self.write_and_sync(&buf) {
            Ok(()) => {
                self.durable_seq.fetch_max(last_seq, Ordering::AcqRel);
                self.record_flush(entries, flush_started.elapsed().as_secs_f64() * 1000.0);
                for waiter in waiters {
                    let _ = waiter.tx.send(Ok(waiter.seq));
                }
                Ok(())
            }
            Err(e) => {
                self.degraded.store(true, Ordering::Release);
                error!(
                    shard_id = self.shard_id,
                    error = %e,
                    "WAL write failed; shard degraded to read-only"
                );
                for waiter in waiters {
                    let _ = waiter.tx.send(Err(WarpError::ShardDegraded {
                        shard_id: self.shard_id,
                    }));
                }
                Err(WarpError::ShardDegraded {
                    shard_id: self.shard_id,
                })
            }
        }
    }

    fn write_and_sync(&self, buf: &[u8]) -> std::io::Result<()> {
        let mut active = self.active.lock();
        if active.file.is_none() {
            let path = generation_file(&self.dir, active.generation);
            active.file = Some(OpenOptions::new().create(true).append(true).open(path)?);
        }
        {
            let file = active.file.as_mut().expect("active file just ensured");
            file.write_all(buf)?;
            file.sync_data()?;
        }
        active.file_bytes += buf.len() as u64;
        self.total_bytes.fetch_add(buf.len() as u64, Ordering::Relaxed);

        if active.file_bytes >= self.cfg.max_file_bytes {
            self.rotate_locked(&mut active)?;
        }
        Ok(())
    }

    /// Seal the active file with a checkpoint frame and start the next
    /// generation. Caller holds the active-file lock.
    ///
    /// Entries enqueued since the in-flight flush snapshot still carry
    /// sequence numbers below the checkpoint's, so they are drained into
    /// the sealed file first; anything enqueued after the checkpoint seq
    /// is allocated lands in the next generation.
    fn rotate_locked(&self, active: &mut ActiveFile) -> std::io::Result<()> {
        let (pending, pending_waiters, pending_last, checkpoint_seq) = {
            let mut batch = self.batch.lock();
            let (pending, waiters, pending_last) = batch.take();
            let seq = batch.next_seq;
            batch.next_seq += 1;
            (pending, waiters, pending_last, seq)
        };

        let ref_seq = pending_last.max(self.durable_seq.load(Ordering::Acquire));
        let mut tail = BytesMut::new();
        tail.extend_from_slice(&pending);
        encode_frame(&WalRecord::Checkpoint { ref_seq }, checkpoint_seq, &mut tail);

        let sealed = (|| {
            let file = active.file.as_mut().expect("rotation requires an open file");
            file.write_all(&tail)?;
            file.sync_data()
        })();
        if let Err(e) = sealed {
            for waiter in pending_waiters {
                let _ = waiter.tx.send(Err(WarpError::ShardDegraded {
                    shard_id: self.shard_id,
                }));
            }
            return Err(e);
        }
        self.total_bytes.fetch_add(tail.len() as u64, Ordering::Relaxed);
        self.last_seq.fetch_max(checkpoint_seq, Ordering::AcqRel);
        self.durable_seq.fetch_max(checkpoint_seq, Ordering::AcqRel);
        for waiter in pending_waiters {
            let _ = waiter.tx.send(Ok(waiter.seq));
        }

        let next_generation = active.generation + 1;
        let path = generation_file(&self.dir, next_generation);
        let new_file = OpenOptions::new().create(true).append(true).open(path)?;
        info!(
            shard_id = self.shard_id,
            sealed = active.generation,
            next = next_generation,
            "rotated WAL generation"
        );
        active.file = Some(new_file);
        active.generation = next_generation;
        active.file_bytes = 0;
        {
            let mut stats = self.stats.write();
            stats.rotations += 1;
            stats.fsyncs += 1;
        }
        Ok(())
    }

    /// Batcher task body. Spawned once per shard by the engine; exits
    /// after shutdown once the buffer is drained.
    pub async fn run_batcher(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.cfg.flush_interval) => {}
            }

            let due = { self.batch.lock().should_flush(&self.cfg) };
            if due {
                // Degradation is already recorded and waiters are woken;
                // nothing more to do here.
                let _ = self.flush_batch();
            }

            if self.shutdown.load(Ordering::Acquire) {
                let _ = self.flush_batch();
                break;
            }
        }
        debug!(shard_id = self.shard_id, "WAL batcher stopped");
    }

    /// Stop accepting appends and nudge the batcher to drain and exit.
    pub fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    /// Final close: drain the buffer and fsync the active file.
    pub fn close(&self) -> Result<()> {
        self.begin_shutdown();
        let flush_result = self.flush_batch();
        let mut active = self.active.lock();
        if let Some(file) = active.file.take() {
            if let Err(e) = file.sync_all() {
                warn!(shard_id = self.shard_id, error = %e, "final WAL sync failed");
            }
        }
        flush_result
    }

    /// Delete generations older than the active one. Only valid once a
    /// snapshot has captured the shard state they describe.
    pub fn prune_generations(&self) -> Result<usize> {
        let active_generation = self.active.lock().generation;
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(generation) = parse_generation(name) else {
                continue;
            };
            if generation < active_generation {
                std::fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!(
                shard_id = self.shard_id,
                removed, active_generation, "pruned WAL generations"
            );
        }
        Ok(removed)
    }

    pub fn shard_id(&self) -> u16 {
        self.shard_id
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq.load(Ordering::Acquire)
    }

    pub fn durable_seq(&self) -> u64 {
        self.durable_seq.load(Ordering::Acquire)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    pub fn generation(&self) -> u64 {
        self.active.lock().generation
    }

    pub fn stats(&self) -> WalStats {
        self.stats.read().clone()
    }

    fn record_flush(&self, entries: usize, flush_ms: f64) {
        let mut stats = self.stats.write();
        stats.total_records += entries as u64;
        stats.group_commits += 1;
        stats.fsyncs += 1;
        let commits = stats.group_commits as f64;
        stats.avg_group_size =
            (stats.avg_group_size * (commits - 1.0) + entries as f64) / commits;
        stats.avg_flush_time_ms =
            (stats.avg_flush_time_ms * (commits - 1.0) + flush_ms) / commits;
    }

    /// Force the degraded state, as a failed fsync would.
    #[cfg(test)]
    pub(crate) fn degrade(&self) {
        self.degraded.store(true, Ordering::Release);
    }
}
