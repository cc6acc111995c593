// WAL recovery.
// Replays generation files in order, validating framing and checksums.
// A torn or short frame at the tail of the final file is truncated; the
// same damage anywhere else refuses to open the engine.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::codec::{decode_frame, Decoded, WalRecord, FRAME_OVERHEAD, MAX_FRAME_LEN};
use crate::error::{Result, WarpError};

use super::parse_generation;

/// Outcome of scanning one shard's WAL directory.
#[derive(Debug)]
pub struct RecoveredLog {
    /// Put/Delete entries in replay order (checkpoints are consumed).
    pub entries: Vec<(u64, WalRecord)>,
    /// Largest sequence number seen across all frames.
    pub last_seq: u64,
    /// Generation to continue appending to.
    pub active_generation: u64,
    /// Bytes removed from the final file's torn tail, if any.
    pub truncated_bytes: u64,
    /// Total valid bytes across all generation files.
    pub total_bytes: u64,
}

impl RecoveredLog {
    fn empty() -> Self {
        Self {
            entries: Vec::new(),
            last_seq: 0,
            active_generation: 1,
            truncated_bytes: 0,
            total_bytes: 0,
        }
    }
}

/// Scan and repair a WAL directory. A missing directory or one with no
/// valid entries yields an empty shard; that is not an error.
pub fn recover_dir(dir: &Path) -> Result<RecoveredLog> {
    if !dir.exists() {
        return Ok(RecoveredLog::empty());
    }

    let mut files: Vec<(u64, PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(generation) = entry.file_name().to_str().and_then(parse_generation) {
            files.push((generation, entry.path()));
        }
    }
    if files.is_empty() {
        return Ok(RecoveredLog::empty());
    }
    files.sort_by_key(|(generation, _)| *generation);

    let mut recovered = RecoveredLog::empty();
    recovered.active_generation = files.last().map(|(generation, _)| *generation).unwrap_or(1);

    let final_index = files.len() - 1;
    for (index, (generation, path)) in files.iter().enumerate() {
        let is_final_file = index == final_index;
        let data = std::fs::read(path)?;
        let file_len = data.len();
        let mut offset = 0usize;

        loop {
            let remaining = &data[offset..];
            if remaining.is_empty() {
                break;
            }
            match decode_frame(remaining) {
                Decoded::Frame {
                    seq,
                    record,
                    frame_len,
                } => {
                    if seq <= recovered.last_seq {
                        return Err(corruption(path, offset, "sequence number regression"));
                    }
                    recovered.last_seq = seq;
                    match record {
                        WalRecord::Put { .. } | WalRecord::Delete { .. } => {
                            recovered.entries.push((seq, record));
                        }
                        // Checkpoints only mark rotation boundaries.
                        WalRecord::Checkpoint { .. } => {}
                    }
                    offset += frame_len;
                }
                Decoded::UnknownType { frame_len } => {
                    // Tolerated only as the very last frame of a file;
                    // anything after it is unreachable and recovery of a
                    // mid-file mystery frame cannot be trusted.
                    if offset + frame_len == file_len {
                        warn!(
                            file = %path.display(),
                            offset,
                            "stopping at unrecognized trailing frame type"
                        );
                        if is_final_file {
                            truncate_file(path, offset as u64)?;
                            recovered.truncated_bytes += (file_len - offset) as u64;
                        }
                        break;
                    }
                    return Err(corruption(path, offset, "unrecognized frame type mid-file"));
                }
                Decoded::Incomplete | Decoded::Corrupt { .. } => {
                    if is_final_file && reaches_eof(remaining, file_len - offset) {
                        // Torn tail from a crash mid-write: drop it.
                        warn!(
                            file = %path.display(),
                            offset,
                            dropped = file_len - offset,
                            "truncating torn WAL tail"
                        );
                        truncate_file(path, offset as u64)?;
                        recovered.truncated_bytes += (file_len - offset) as u64;
                        break;
                    }
                    let reason = match decode_frame(remaining) {
                        Decoded::Corrupt { reason } => reason,
                        _ => "short frame before end of log",
                    };
                    return Err(corruption(path, offset, reason));
                }
            }
        }

        recovered.total_bytes += offset as u64;
    }

    debug!(
        entries = recovered.entries.len(),
        last_seq = recovered.last_seq,
        active_generation = recovered.active_generation,
        truncated = recovered.truncated_bytes,
        "WAL recovery complete"
    );
    Ok(recovered)
}

/// A damaged frame counts as a torn tail only when it extends to the end
/// of the file; a structurally complete frame with bytes after it is
/// mid-file corruption.
fn reaches_eof(remaining: &[u8], remaining_len: usize) -> bool {
    if remaining.len() < 4 {
        return true;
    }
    let len = u32::from_le_bytes([remaining[0], remaining[1], remaining[2], remaining[3]]) as usize;
    if len < FRAME_OVERHEAD || len > MAX_FRAME_LEN {
        // Garbage length: indistinguishable from a partially written
        // length field, so only trust it at EOF-reaching positions.
        return true;
    }
    4 + len >= remaining_len
}

fn truncate_file(path: &Path, len: u64) -> Result<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(len)?;
    file.sync_all()?;
    Ok(())
}

fn corruption(path: &Path, offset: usize, reason: &str) -> WarpError {
    WarpError::Corrupted(format!(
        "{} at byte {offset}: {reason}",
        path.display()
    ))
}
