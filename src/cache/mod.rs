//! Two-Tier Cache System
//!
//! In-memory LRU tiers backed by a persistent disk tier, read through a
//! stale-while-revalidate protocol.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                          Cache Manager                               │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  L1 Memory Tier              │  L2 Disk Tier                         │
//! │  ┌───────────────────────┐   │  ┌─────────────────────────────────┐  │
//! │  │ Objects (entry count) │   │  │ <sha256>       value blob       │  │
//! │  │ Bitmaps (byte budget) │   │  │ <sha256>.meta  metadata blob    │  │
//! │  └───────────────────────┘   │  └─────────────────────────────────┘  │
//! │              ▲               │                 │                     │
//! │              └──── promotion on L2 hit ────────┘                     │
//! │                                                                      │
//! │        Access Predictor ──▶ Prefetch Scheduler ──▶ put()             │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Entry lifecycle
//!
//! - `age <= stale_threshold`: fresh, served from cache
//! - `stale_threshold < age <= ttl`: stale, served and revalidated
//! - `age > ttl`: expired, deleted on access or by the cleanup sweep

mod codec;
mod entry;
mod key_codec;
mod l1;
mod l2;
mod manager;
mod metrics;
mod predictor;
mod resource;

pub use codec::CacheCodec;
pub use entry::{CacheEntry, CacheMetadata};
pub use key_codec::{encode_key, is_encoded_key};
pub use l1::{EvictionListener, MemoryTier, RemovalCause};
pub use l2::{DiskConfig, DiskTier, EVICTION_TARGET_RATIO, META_SUFFIX};
pub use manager::{CacheManager, PREDICTION_COUNT};
pub use metrics::{CacheMetrics, CacheStats, TierSizes};
pub use predictor::{
    schedule_prefetch, AccessPredictor, AccessRecord, Fetcher, PrefetchReport,
    PREFETCH_CONCURRENCY,
};
pub use resource::CachedResource;
