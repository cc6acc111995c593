// Per-shard write-ahead log.
//
// Each shard owns exactly one `Wal`: an append-only, generation-rotated
// sequence of framed, checksummed entries (format in `crate::codec`).
// Appends are acknowledged by a dedicated batcher that issues one write
// and one fsync per flush; recovery replays generations in order and
// truncates a torn tail.

mod recovery;
mod writer;

pub use recovery::{recover_dir, RecoveredLog};
pub use writer::{Wal, WalStats};

use std::path::{Path, PathBuf};

/// On-disk name for a WAL generation file.
pub fn generation_file(dir: &Path, generation: u64) -> PathBuf {
    dir.join(format!("{generation:010}.wal"))
}

/// Parse a generation number out of a WAL file name.
pub fn parse_generation(name: &str) -> Option<u64> {
    let stem = name.strip_suffix(".wal")?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_names_round_trip() {
        let path = generation_file(Path::new("/tmp/w"), 42);
        let name = path.file_name().unwrap().to_str().unwrap();
        assert_eq!(name, "0000000042.wal");
        assert_eq!(parse_generation(name), Some(42));
    }

    #[test]
    fn foreign_names_are_ignored() {
        assert_eq!(parse_generation("snapshot.snap"), None);
        assert_eq!(parse_generation("x.wal"), None);
        assert_eq!(parse_generation(".wal"), None);
    }
}
