//! tiercache - Two-Tier Cache Engine
//!
//! A bounded in-memory LRU tier backed by a persistent, capacity-bounded
//! disk tier, unified behind a stale-while-revalidate read protocol with
//! predictive prefetching.
//!
//! # Architecture
//!
//! ```text
//! caller ─▶ CacheManager ─▶ L1 (memory) ─miss─▶ L2 (disk) ─miss─▶ fetcher
//!                │                ▲                 │
//!                │                └──── promote ────┘
//!                └─▶ AccessPredictor ─▶ prefetch ─▶ put
//! ```
//!
//! # Example
//!
//! ```no_run
//! use futures::StreamExt;
//! use tiercache::{CacheConfig, CacheManager, CachedResource};
//!
//! # async fn run() -> tiercache::Result<()> {
//! let cache = CacheManager::open(CacheConfig::with_cache_dir("/tmp/tiercache")).await?;
//!
//! let key = CacheManager::normalize_key(&["conversation", "42"]);
//! let mut updates = Box::pin(cache.get_with_swr(
//!     &key,
//!     || async { anyhow::Ok("hello".to_string()) },
//!     false,
//! ));
//! while let Some(update) = updates.next().await {
//!     if let CachedResource::Success { data, is_stale, .. } = update {
//!         println!("{} (stale: {})", data, is_stale);
//!     }
//! }
//!
//! cache.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Tiers, predictor and the cache manager
//! - [`config`] - Configuration and duration parsing
//! - [`error`] - Error types
//! - [`exporter`] - Prometheus exposition of cache statistics

pub mod cache;
pub mod config;
pub mod error;
pub mod exporter;

// Re-export commonly used types
pub use cache::{
    AccessPredictor, CacheCodec, CacheEntry, CacheManager, CacheMetadata, CacheStats,
    CachedResource, DiskTier, Fetcher, MemoryTier, PrefetchReport,
};
pub use config::{parse_duration, CacheConfig};
pub use error::{Error, Result};
