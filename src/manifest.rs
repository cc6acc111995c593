// Engine manifest.
// A small versioned JSON file at the data root that pins the parameters
// a data directory was created with. Any mismatch on open is fatal:
// re-sharding or changing the routing hash requires a migration, not a
// silent reinterpretation of existing files.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, WarpError};
use crate::router::HASH_ALGORITHM_ID;

pub const MANIFEST_FILE: &str = "engine.manifest";
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub schema_version: u32,
    pub shard_count: u16,
    pub hash_algorithm_id: u32,
}

impl Manifest {
    pub fn new(shard_count: u16) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            shard_count,
            hash_algorithm_id: HASH_ALGORITHM_ID,
        }
    }

    pub fn path(data_root: &Path) -> PathBuf {
        data_root.join(MANIFEST_FILE)
    }

    /// Load the manifest if one exists.
    pub fn load(data_root: &Path) -> Result<Option<Manifest>> {
        let path = Self::path(data_root);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let manifest: Manifest = serde_json::from_slice(&raw).map_err(|e| {
            WarpError::Corrupted(format!("unreadable manifest at {}: {e}", path.display()))
        })?;
        Ok(Some(manifest))
    }

    /// Write atomically: temp file in the same directory, then rename.
    pub fn store(&self, data_root: &Path) -> Result<()> {
        fs::create_dir_all(data_root)?;
        let path = Self::path(data_root);
        let tmp = data_root.join(format!("{MANIFEST_FILE}.tmp"));
        let raw = serde_json::to_vec_pretty(self)
            .map_err(|e| WarpError::Internal {
                code: "manifest-encode",
                message: e.to_string(),
            })?;
        fs::write(&tmp, raw)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Verify this on-disk manifest against the opening configuration.
    pub fn verify(&self, shard_count: u16) -> Result<()> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(WarpError::Corrupted(format!(
                "manifest schema_version {} unsupported (expected {SCHEMA_VERSION})",
                self.schema_version
            )));
        }
        if self.hash_algorithm_id != HASH_ALGORITHM_ID {
            return Err(WarpError::Corrupted(format!(
                "manifest hash_algorithm_id {} does not match built-in {HASH_ALGORITHM_ID}",
                self.hash_algorithm_id
            )));
        }
        if self.shard_count != shard_count {
            return Err(WarpError::Corrupted(format!(
                "shard_count {} requested but data directory was created with {}; \
                 changing shard count requires migration",
                shard_count, self.shard_count
            )));
        }
        Ok(())
    }

    /// Load-or-create for engine open. Returns the effective manifest.
    pub fn open(data_root: &Path, shard_count: u16) -> Result<Manifest> {
        match Self::load(data_root)? {
            Some(existing) => {
                existing.verify(shard_count)?;
                Ok(existing)
            }
            None => {
                let manifest = Manifest::new(shard_count);
                manifest.store(data_root)?;
                info!(shard_count, "created engine manifest");
                Ok(manifest)
            }
        }
    }
}
