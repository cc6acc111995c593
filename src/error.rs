// Engine-wide error taxonomy.
// The engine facade is the only layer that translates internal failures
// into these public kinds; subsystems below it report upward.

use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WarpError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found")]
    NotFound,

    #[error("shard {shard_id} degraded: write-ahead log unusable")]
    ShardDegraded { shard_id: u16 },

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled before commit point")]
    Cancelled,

    #[error("corrupted: {0}")]
    Corrupted(String),

    #[error("engine is shutting down")]
    Unavailable,

    #[error("internal error [{code}]: {message}")]
    Internal { code: &'static str, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl WarpError {
    /// Stable diagnostic code for the public failure surface.
    pub fn diagnostic_code(&self) -> &'static str {
        match self {
            WarpError::InvalidArgument(_) => "WARP-100",
            WarpError::NotFound => "WARP-101",
            WarpError::ShardDegraded { .. } => "WARP-200",
            WarpError::Timeout(_) => "WARP-300",
            WarpError::Cancelled => "WARP-301",
            WarpError::Corrupted(_) => "WARP-400",
            WarpError::Unavailable => "WARP-500",
            WarpError::Internal { .. } => "WARP-900",
            WarpError::Io(_) => "WARP-901",
            WarpError::Config(_) => "WARP-902",
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WarpError::InvalidArgument(_) => "InvalidArgument",
            WarpError::NotFound => "NotFound",
            WarpError::ShardDegraded { .. } => "ShardDegraded",
            WarpError::Timeout(_) => "Timeout",
            WarpError::Cancelled => "Cancelled",
            WarpError::Corrupted(_) => "Corrupted",
            WarpError::Unavailable => "Unavailable",
            WarpError::Internal { .. } => "Internal",
            WarpError::Io(_) => "Io",
            WarpError::Config(_) => "Config",
        }
    }

    /// Structured form of a user-visible failure. Keys are reported hex
    /// encoded; values are never included.
    pub fn to_failure(&self) -> FailureInfo {
        let shard_id = match self {
            WarpError::ShardDegraded { shard_id } => Some(*shard_id),
            _ => None,
        };
        FailureInfo {
            kind: self.kind(),
            shard_id,
            key: None,
            message: self.to_string(),
            diagnostic_code: self.diagnostic_code(),
        }
    }
}

/// Wire-friendly failure report: { kind, shard_id?, key?, message, code }.
#[derive(Debug, Clone, Serialize)]
pub struct FailureInfo {
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard_id: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub message: String,
    pub diagnostic_code: &'static str,
}

impl FailureInfo {
    pub fn with_key(mut self, key: &[u8]) -> Self {
        self.key = Some(hex_encode(key));
        self
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

pub type Result<T> = std::result::Result<T, WarpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostic_codes_are_stable() {
        assert_eq!(WarpError::Cancelled.diagnostic_code(), "WARP-301");
        assert_eq!(
            WarpError::ShardDegraded { shard_id: 3 }.diagnostic_code(),
            "WARP-200"
        );
    }

    #[test]
    fn failure_info_carries_key_but_never_value() {
        let failure = WarpError::InvalidArgument("oversized key".into())
            .to_failure()
            .with_key(b"\x01\xff");
        assert_eq!(failure.key.as_deref(), Some("01ff"));
        assert_eq!(failure.kind, "InvalidArgument");
    }
}
