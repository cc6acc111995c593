// WarpEngine - embeddable sharded key/value storage engine
// Core library module

pub mod cache;
pub mod codec;
pub mod companion;
pub mod config;
pub mod engine;
pub mod error;
pub mod manifest;
pub mod metrics;
pub mod router;
pub mod shard;
pub mod wal;

pub use config::{CacheConfig, CompanionConfig, EngineConfig, WalConfig};
pub use engine::{
    CachePlacement, DeleteOutcome, Engine, EnrichedGet, GetReceipt, PutOptions, PutReceipt,
};
pub use error::{FailureInfo, Result, WarpError};
pub use router::{Router, Tier};
pub use shard::Durability;
