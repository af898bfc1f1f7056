//! Cache Manager - Unified Two-Tier Cache
//!
//! Composes the in-memory tiers (objects and bitmaps), the disk tier and the
//! access predictor behind one handle.
//!
//! # Read path
//!
//! L1 first, then L2; L2 hits are promoted into L1 with their metadata. The
//! L2 read completes before L1 is touched, so no tier lock is ever held
//! while another is acquired.
//!
//! # Write path
//!
//! Write-through to both tiers. L1 always receives the value; L2 is written
//! next, on a detached task. A failed disk write is reported to the caller
//! and leaves the memory copy in place.
//!
//! # Maintenance
//!
//! `open` starts a periodic disk cleanup task; `shutdown` (or dropping the
//! last handle) stops it.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, Stream};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::codec::CacheCodec;
use super::entry::CacheEntry;
use super::l1::{MemoryTier, RemovalCause};
use super::l2::{DiskConfig, DiskTier};
use super::metrics::{CacheMetrics, CacheStats, LatencyTracker, TierSizes};
use super::predictor::{schedule_prefetch, AccessPredictor, Fetcher, PrefetchReport};
use super::resource::CachedResource;
use crate::config::CacheConfig;
use crate::error::{Error, Result};

/// Keys requested from the predictor per predictive prefetch
pub const PREDICTION_COUNT: usize = 5;

/// Values held by the object tier
type AnyValue = Arc<dyn Any + Send + Sync>;

struct ManagerInner {
    config: CacheConfig,
    memory: MemoryTier<AnyValue>,
    bitmaps: MemoryTier<Bytes>,
    disk: DiskTier,
    predictor: AccessPredictor,
    metrics: Arc<CacheMetrics>,
    shutdown: CancellationToken,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Unified cache manager
#[derive(Clone)]
pub struct CacheManager {
    inner: Arc<ManagerInner>,
}

impl fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheManager")
            .field("cache_dir", &self.inner.config.cache_dir)
            .field("memory_entries", &self.inner.memory.len())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

enum SwrState<T, F> {
    Start { fetcher: F },
    Lookup { fetcher: F },
    Revalidate { fetcher: F, cached: T },
    Done,
}

impl CacheManager {
    /// Open the cache: create the directory, build the tiers and start the
    /// maintenance task
    pub async fn open(config: CacheConfig) -> Result<Self> {
        config.validate()?;

        let disk = DiskTier::open(DiskConfig {
            dir: config.cache_dir.clone(),
            max_bytes: config.disk_max_bytes,
            sweep_batch_size: config.sweep_batch_size,
        })
        .await?;

        let metrics = Arc::new(CacheMetrics::new());

        let listener_metrics = Arc::clone(&metrics);
        let memory = MemoryTier::with_max_entries(config.memory_max_entries).on_eviction(
            move |key: &str, _entry: &CacheEntry<AnyValue>, cause: RemovalCause| {
                if cause == RemovalCause::Capacity {
                    listener_metrics.record_memory_eviction();
                }
                debug!(key, ?cause, "Object removed from memory tier");
            },
        );

        let listener_metrics = Arc::clone(&metrics);
        let bitmaps = MemoryTier::with_max_cost(config.bitmap_max_bytes, |b: &Bytes| b.len() as u64)
            .on_eviction(move |key: &str, _entry: &CacheEntry<Bytes>, cause: RemovalCause| {
                if cause == RemovalCause::Capacity {
                    listener_metrics.record_memory_eviction();
                }
                debug!(key, ?cause, "Bitmap removed from memory tier");
            });

        let shutdown = CancellationToken::new();
        let maintenance = spawn_maintenance(
            disk.clone(),
            Arc::clone(&metrics),
            config.cleanup_interval,
            shutdown.clone(),
        );

        info!(
            dir = %config.cache_dir.display(),
            memory_max_entries = config.memory_max_entries,
            disk_max_bytes = config.disk_max_bytes,
            "Cache manager opened"
        );

        Ok(Self {
            inner: Arc::new(ManagerInner {
                predictor: AccessPredictor::new(config.history_capacity, config.frequent_set_size),
                config,
                memory,
                bitmaps,
                disk,
                metrics,
                shutdown,
                maintenance: Mutex::new(Some(maintenance)),
            }),
        })
    }

    /// Stop the maintenance task and wait for it to finish
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handle = self.inner.maintenance.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Maintenance task ended abnormally: {}", e);
            }
        }
    }

    /// Whether the maintenance task is still running
    pub fn is_running(&self) -> bool {
        self.inner
            .maintenance
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Get a value from the cache (L1, then L2)
    pub async fn get<T>(&self, key: &str) -> Option<T>
    where
        T: CacheCodec + Clone + Send + Sync + 'static,
    {
        self.lookup::<T>(key).await.map(|entry| entry.value)
    }

    /// Put a value with the default TTL
    pub async fn put<T>(&self, key: &str, value: T) -> Result<()>
    where
        T: CacheCodec + Send + Sync + 'static,
    {
        self.put_with_ttl(key, value, self.inner.config.default_ttl)
            .await
    }

    /// Put a value in both tiers.
    ///
    /// The TTL must exceed the stale threshold.
    pub async fn put_with_ttl<T>(&self, key: &str, value: T, ttl: Duration) -> Result<()>
    where
        T: CacheCodec + Send + Sync + 'static,
    {
        let stale_threshold = self.inner.config.stale_threshold;
        if ttl <= stale_threshold {
            return Err(Error::InvalidTtl {
                ttl,
                stale_threshold,
            });
        }

        let value = Arc::new(value);
        self.inner
            .memory
            .put(key, Arc::clone(&value) as AnyValue, ttl);

        if let Err(e) = self.inner.disk.put(key, value.as_ref(), ttl).await {
            self.inner.metrics.record_put_failure();
            warn!(key, "Disk write failed, value held in memory only: {}", e);
            return Err(e);
        }
        self.inner.metrics.record_put();
        debug!(key, ?ttl, "Cached value");
        Ok(())
    }

    /// Remove a key from both tiers; true if any tier held it
    pub async fn remove(&self, key: &str) -> bool {
        let in_memory = self.inner.memory.remove(key).is_some();
        let on_disk = self.inner.disk.remove(key).await;
        in_memory || on_disk
    }

    /// Clear every tier and the access history
    pub async fn clear_all(&self) -> Result<()> {
        self.inner.memory.clear();
        self.inner.bitmaps.clear();
        self.inner.predictor.clear();
        self.inner.disk.clear().await?;
        info!("Cleared all cache tiers");
        Ok(())
    }

    /// Get a bitmap from the byte-bounded memory tier
    pub fn get_bitmap(&self, key: &str) -> Option<Bytes> {
        self.inner.bitmaps.get(key).map(|entry| entry.value)
    }

    /// Store a bitmap; false if it alone exceeds the tier's byte budget
    pub fn put_bitmap(&self, key: &str, bitmap: Bytes) -> bool {
        self.inner
            .bitmaps
            .put(key, bitmap, self.inner.config.default_ttl)
    }

    /// Stale-while-revalidate read.
    ///
    /// Emits `Loading`, then the cached value if any. A stale, missing or
    /// force-refreshed value is followed by the outcome of `fetcher`. Fresh
    /// values are written through to both tiers. Concurrent calls for the
    /// same key are not coalesced; each runs its own fetcher.
    pub fn get_with_swr<T, F, Fut>(
        &self,
        key: &str,
        fetcher: F,
        force_refresh: bool,
    ) -> impl Stream<Item = CachedResource<T>> + Send + 'static
    where
        T: CacheCodec + Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let manager = self.clone();
        let key = key.to_string();

        stream::unfold(SwrState::Start { fetcher }, move |state| {
            let manager = manager.clone();
            let key = key.clone();
            async move {
                match state {
                    SwrState::Start { fetcher } => Some((
                        CachedResource::Loading { data: None },
                        SwrState::Lookup { fetcher },
                    )),
                    SwrState::Lookup { fetcher } => match manager.lookup::<T>(&key).await {
                        Some(entry) if !force_refresh => {
                            let is_stale = entry
                                .metadata
                                .is_stale(manager.inner.config.stale_threshold);
                            let emission = CachedResource::Success {
                                data: entry.value.clone(),
                                is_from_cache: true,
                                is_stale,
                            };
                            let next = if is_stale {
                                debug!(key = %key, "Serving stale value, revalidating");
                                SwrState::Revalidate {
                                    fetcher,
                                    cached: entry.value,
                                }
                            } else {
                                SwrState::Done
                            };
                            Some((emission, next))
                        }
                        cached => {
                            let cached = cached.map(|entry| entry.value);
                            let emission = manager.revalidate(&key, fetcher, cached).await;
                            Some((emission, SwrState::Done))
                        }
                    },
                    SwrState::Revalidate { fetcher, cached } => {
                        let emission = manager.revalidate(&key, fetcher, Some(cached)).await;
                        Some((emission, SwrState::Done))
                    }
                    SwrState::Done => None,
                }
            }
        })
    }

    /// Fetch `keys` in the background and cache every value obtained.
    ///
    /// Per-key failures are logged and counted in the stats.
    pub fn prefetch<T, F>(&self, keys: Vec<String>, fetcher: Arc<F>) -> JoinHandle<PrefetchReport>
    where
        T: CacheCodec + Send + Sync + 'static,
        F: Fetcher<T> + ?Sized + 'static,
    {
        let count = keys.len();
        let manager = self.clone();
        let batch = schedule_prefetch(keys, fetcher, move |key: String, value: T| {
            let manager = manager.clone();
            async move { manager.put(&key, value).await }
        });

        let metrics = Arc::clone(&self.inner.metrics);
        tokio::spawn(async move {
            let report = match batch.await {
                Ok(report) => report,
                Err(e) => {
                    warn!("Prefetch batch aborted: {}", e);
                    PrefetchReport {
                        succeeded: 0,
                        failed: count,
                    }
                }
            };
            metrics.record_prefetch(report.succeeded as u64, report.failed as u64);
            info!(succeeded = report.succeeded, failed = report.failed, "Prefetch batch complete");
            report
        })
    }

    /// Prefetch the keys the predictor expects next, skipping those already
    /// held in memory
    pub fn predictive_prefetch<T, F>(
        &self,
        current_key: &str,
        fetcher: Arc<F>,
    ) -> JoinHandle<PrefetchReport>
    where
        T: CacheCodec + Send + Sync + 'static,
        F: Fetcher<T> + ?Sized + 'static,
    {
        let keys: Vec<String> = self
            .inner
            .predictor
            .predict_next_keys(current_key, PREDICTION_COUNT)
            .into_iter()
            .filter(|key| !self.inner.memory.contains(key))
            .collect();
        debug!(current_key, predicted = keys.len(), "Predictive prefetch");
        self.prefetch(keys, fetcher)
    }

    /// Join key parts with `:`
    pub fn normalize_key(parts: &[&str]) -> String {
        parts.join(":")
    }

    /// Snapshot of counters and tier sizes
    pub async fn get_stats(&self) -> CacheStats {
        let sizes = TierSizes {
            memory_entries: self.inner.memory.len() as u64,
            memory_capacity: self.inner.memory.max_capacity(),
            bitmap_bytes: self.inner.bitmaps.size(),
            bitmap_capacity: self.inner.bitmaps.max_capacity(),
            disk_bytes: self.inner.disk.size_bytes().await,
            disk_capacity: self.inner.disk.max_bytes(),
            disk_evictions: self.inner.disk.evictions(),
            disk_healed: self.inner.disk.healed(),
        };
        self.inner.metrics.snapshot(sizes)
    }

    /// Run the disk cleanup sweep now; returns entries removed
    pub async fn cleanup(&self) -> usize {
        let removed = self.inner.disk.cleanup().await;
        self.inner.metrics.record_cleanup(removed as u64);
        removed
    }

    /// Access predictor fed by successful fetches
    pub fn predictor(&self) -> &AccessPredictor {
        &self.inner.predictor
    }

    /// Active configuration
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    async fn lookup<T>(&self, key: &str) -> Option<CacheEntry<T>>
    where
        T: CacheCodec + Clone + Send + Sync + 'static,
    {
        if let Some(entry) = self.inner.memory.get(key) {
            if let Some(value) = entry.value.downcast_ref::<T>() {
                self.inner.metrics.record_l1_hit();
                debug!(key, "L1 hit");
                return Some(CacheEntry::with_metadata(value.clone(), entry.metadata));
            }
            debug!(key, "L1 holds a different type, reading disk");
        }

        let tracker = LatencyTracker::start();
        let entry = self.inner.disk.get::<T>(key).await;
        self.inner.metrics.record_l2_read_latency(tracker.elapsed());

        match entry {
            Some(entry) => {
                self.inner.metrics.record_l2_hit();
                let promoted = entry.clone().map(|value| Arc::new(value) as AnyValue);
                if self.inner.memory.insert_entry(key, promoted) {
                    self.inner.metrics.record_promotion();
                }
                debug!(key, "L2 hit, promoted");
                Some(entry)
            }
            None => {
                self.inner.metrics.record_miss();
                debug!(key, "Cache miss");
                None
            }
        }
    }

    async fn revalidate<T, F, Fut>(&self, key: &str, fetcher: F, cached: Option<T>) -> CachedResource<T>
    where
        T: CacheCodec + Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        match fetcher().await {
            Ok(fresh) => {
                if let Err(e) = self.put(key, fresh.clone()).await {
                    warn!(key, "Failed to cache fetched value: {}", e);
                }
                self.inner.predictor.record_access(key);
                CachedResource::Success {
                    data: fresh,
                    is_from_cache: false,
                    is_stale: false,
                }
            }
            Err(e) => {
                warn!(key, "Fetch failed: {:#}", e);
                CachedResource::Error {
                    cause: Arc::new(Error::FetchFailed(e)),
                    is_from_cache: cached.is_some(),
                    data: cached,
                }
            }
        }
    }
}

fn spawn_maintenance(
    disk: DiskTier,
    metrics: Arc<CacheMetrics>,
    period: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(?period, "Starting cache maintenance");

        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        tick.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Cache maintenance shutting down");
                    break;
                }
                _ = tick.tick() => {
                    let removed = disk.cleanup().await;
                    metrics.record_cleanup(removed as u64);
                }
            }
        }
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use assert_matches::assert_matches;
    use futures::StreamExt;

    use crate::cache::encode_key;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Conversation {
        id: u64,
        title: String,
    }

    fn conversation(id: u64, title: &str) -> Conversation {
        Conversation {
            id,
            title: title.to_string(),
        }
    }

    fn test_config(dir: &TempDir) -> CacheConfig {
        CacheConfig::with_cache_dir(dir.path())
    }

    async fn open_manager(config: CacheConfig) -> CacheManager {
        CacheManager::open(config).await.unwrap()
    }

    /// Config whose entries turn stale after 30ms
    fn short_stale_config(dir: &TempDir) -> CacheConfig {
        CacheConfig {
            stale_threshold: Duration::from_millis(30),
            ..test_config(dir)
        }
    }

    #[tokio::test]
    async fn test_cache_manager_creation() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join("nested").join("cache");
        let manager = open_manager(CacheConfig::with_cache_dir(&cache_dir)).await;

        assert!(cache_dir.is_dir());
        assert!(manager.is_running());

        let stats = manager.get_stats().await;
        assert_eq!(stats.memory_entries, 0);
        assert_eq!(stats.memory_capacity, 100);
        assert_eq!(stats.disk_capacity, 100 * 1024 * 1024);
    }

    #[tokio::test]
    async fn test_open_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig {
            memory_max_entries: 0,
            ..test_config(&dir)
        };
        assert_matches!(CacheManager::open(config).await, Err(Error::Config(_)));
    }

    #[tokio::test]
    async fn test_cache_manager_put_get() {
        let dir = tempfile::tempdir().unwrap();
        let manager = open_manager(test_config(&dir)).await;

        manager
            .put("conversation:1", conversation(1, "hello"))
            .await
            .unwrap();
        let value: Conversation = manager.get("conversation:1").await.unwrap();
        assert_eq!(value, conversation(1, "hello"));

        let stats = manager.get_stats().await;
        assert_eq!(stats.l1_hits, 1);
        assert_eq!(stats.puts, 1);
        assert!(stats.disk_bytes > 0);
    }

    #[tokio::test]
    async fn test_cache_manager_miss() {
        let dir = tempfile::tempdir().unwrap();
        let manager = open_manager(test_config(&dir)).await;

        assert!(manager.get::<String>("nonexistent").await.is_none());
        let stats = manager.get_stats().await;
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate, 0.0);
    }

    #[tokio::test]
    async fn test_disk_hit_promotes_to_memory() {
        let dir = tempfile::tempdir().unwrap();
        {
            let manager = open_manager(test_config(&dir)).await;
            manager.put("k", "persisted".to_string()).await.unwrap();
            manager.shutdown().await;
        }

        let manager = open_manager(test_config(&dir)).await;
        assert_eq!(manager.get::<String>("k").await.unwrap(), "persisted");
        assert_eq!(manager.get::<String>("k").await.unwrap(), "persisted");

        let stats = manager.get_stats().await;
        assert_eq!(stats.l2_hits, 1);
        assert_eq!(stats.promotions, 1);
        assert_eq!(stats.l1_hits, 1);
        assert_eq!(stats.memory_entries, 1);
    }

    #[tokio::test]
    async fn test_memory_type_mismatch_falls_back_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let manager = open_manager(test_config(&dir)).await;
        manager.put("n", 42u64).await.unwrap();

        // A compatible encoding on disk still decodes
        assert_eq!(manager.get::<u32>("n").await, Some(42));
        assert_eq!(manager.get_stats().await.l2_hits, 1);
    }

    #[tokio::test]
    async fn test_memory_eviction_keeps_disk_copy() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig {
            memory_max_entries: 2,
            ..test_config(&dir)
        };
        let manager = open_manager(config).await;

        for key in ["a", "b", "c"] {
            manager.put(key, key.to_string()).await.unwrap();
        }
        let stats = manager.get_stats().await;
        assert_eq!(stats.memory_entries, 2);
        assert_eq!(stats.evictions, 1);

        // "a" left memory but is still served from disk
        assert_eq!(manager.get::<String>("a").await.unwrap(), "a");
        assert_eq!(manager.get_stats().await.l2_hits, 1);
    }

    #[tokio::test]
    async fn test_failed_disk_write_keeps_memory_copy() {
        let dir = tempfile::tempdir().unwrap();
        let manager = open_manager(test_config(&dir)).await;
        // A directory where the value blob should go makes the disk write fail
        std::fs::create_dir(dir.path().join(encode_key("k"))).unwrap();

        let result = manager.put("k", "v".to_string()).await;
        assert_matches!(result, Err(Error::Io(_)));
        assert_eq!(manager.get::<String>("k").await.as_deref(), Some("v"));

        let stats = manager.get_stats().await;
        assert_eq!(stats.put_failures, 1);
        assert_eq!(stats.puts, 0);
        assert_eq!(stats.memory_entries, 1);
        assert_eq!(stats.l1_hits, 1);
    }

    #[tokio::test]
    async fn test_cancelled_put_never_leaves_half_written_pair() {
        let dir = tempfile::tempdir().unwrap();
        let manager = open_manager(test_config(&dir)).await;
        let big: Vec<u64> = (0..200_000).collect();

        let put = manager.put("big", big.clone());
        let _ = tokio::time::timeout(Duration::from_micros(50), put).await;
        // Give the detached disk write time to settle
        tokio::time::sleep(Duration::from_millis(200)).await;

        let id = encode_key("big");
        let files = [dir.path().join(&id), dir.path().join(format!("{}.meta", id))]
            .iter()
            .filter(|path| path.exists())
            .count();
        assert!(files == 0 || files == 2, "found {} of 2 files", files);

        if files == 2 {
            let entry = manager.inner.disk.get::<Vec<u64>>("big").await.unwrap();
            assert_eq!(entry.value, big);
        }
        assert_eq!(manager.get::<Vec<u64>>("big").await, Some(big));
    }

    #[tokio::test]
    async fn test_debug_format() {
        let dir = tempfile::tempdir().unwrap();
        let manager = open_manager(test_config(&dir)).await;
        let text = format!("{:?}", manager);
        assert!(text.starts_with("CacheManager"));
        assert!(text.contains("running: true"));
    }

    #[tokio::test]
    async fn test_put_rejects_ttl_within_stale_window() {
        let dir = tempfile::tempdir().unwrap();
        let manager = open_manager(test_config(&dir)).await;

        let result = manager
            .put_with_ttl("k", 1u32, Duration::from_secs(3600))
            .await;
        assert_matches!(result, Err(Error::InvalidTtl { .. }));
        assert!(manager.get::<u32>("k").await.is_none());
    }

    #[tokio::test]
    async fn test_expired_entry_absent_from_both_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let manager = open_manager(short_stale_config(&dir)).await;

        manager
            .put_with_ttl("k", 1u32, Duration::from_millis(80))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(manager.get::<u32>("k").await.is_none());
        let stats = manager.get_stats().await;
        assert_eq!(stats.memory_entries, 0);
        assert_eq!(stats.disk_bytes, 0);
    }

    #[tokio::test]
    async fn test_remove() {
        let dir = tempfile::tempdir().unwrap();
        let manager = open_manager(test_config(&dir)).await;
        manager.put("k", 1u32).await.unwrap();

        assert!(manager.remove("k").await);
        assert!(!manager.remove("k").await);
        assert!(manager.get::<u32>("k").await.is_none());
    }

    #[tokio::test]
    async fn test_clear_all() {
        let dir = tempfile::tempdir().unwrap();
        let manager = open_manager(test_config(&dir)).await;
        manager.put("k", 1u32).await.unwrap();
        manager.put_bitmap("thumb", Bytes::from_static(b"\x89PNG"));
        manager.predictor().record_access("k");

        manager.clear_all().await.unwrap();
        assert!(manager.predictor().is_empty());

        let stats = manager.get_stats().await;
        assert_eq!(stats.memory_entries, 0);
        assert_eq!(stats.bitmap_bytes, 0);
        assert_eq!(stats.disk_bytes, 0);
        assert!(manager.get_bitmap("thumb").is_none());
    }

    #[tokio::test]
    async fn test_bitmap_tier_is_byte_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig {
            bitmap_max_bytes: 1000,
            ..test_config(&dir)
        };
        let manager = open_manager(config).await;

        assert!(manager.put_bitmap("a", Bytes::from(vec![0u8; 400])));
        assert!(manager.put_bitmap("b", Bytes::from(vec![1u8; 400])));
        assert!(manager.put_bitmap("c", Bytes::from(vec![2u8; 400])));
        assert!(!manager.put_bitmap("huge", Bytes::from(vec![3u8; 1001])));

        assert!(manager.get_bitmap("a").is_none());
        assert_eq!(manager.get_bitmap("c").unwrap().len(), 400);

        let stats = manager.get_stats().await;
        assert_eq!(stats.bitmap_bytes, 800);
        assert_eq!(stats.bitmap_capacity, 1000);
    }

    #[test]
    fn test_normalize_key() {
        assert_eq!(
            CacheManager::normalize_key(&["conversation", "42"]),
            "conversation:42"
        );
        assert_eq!(CacheManager::normalize_key(&["single"]), "single");
        assert_eq!(CacheManager::normalize_key(&[]), "");
    }

    #[tokio::test]
    async fn test_swr_fresh_value_skips_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let manager = open_manager(test_config(&dir)).await;
        manager.put("k", "cached".to_string()).await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let emissions: Vec<CachedResource<String>> = manager
            .get_with_swr(
                "k",
                move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    anyhow::Ok("fetched".to_string())
                },
                false,
            )
            .collect()
            .await;

        assert_eq!(emissions.len(), 2);
        assert_matches!(&emissions[0], CachedResource::Loading { data: None });
        assert_matches!(
            &emissions[1],
            CachedResource::Success { data, is_from_cache: true, is_stale: false } if data == "cached"
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_swr_stale_value_revalidates() {
        let dir = tempfile::tempdir().unwrap();
        let manager = open_manager(short_stale_config(&dir)).await;
        manager.put("k", "old".to_string()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        let emissions: Vec<CachedResource<String>> = manager
            .get_with_swr("k", || async { anyhow::Ok("new".to_string()) }, false)
            .collect()
            .await;

        assert_eq!(emissions.len(), 3);
        assert_matches!(&emissions[0], CachedResource::Loading { data: None });
        assert_matches!(
            &emissions[1],
            CachedResource::Success { data, is_from_cache: true, is_stale: true } if data == "old"
        );
        assert_matches!(
            &emissions[2],
            CachedResource::Success { data, is_from_cache: false, is_stale: false } if data == "new"
        );

        assert_eq!(manager.get::<String>("k").await.unwrap(), "new");
        assert_eq!(manager.predictor().history()[0].key, "k");
    }

    #[tokio::test]
    async fn test_swr_cold_key_fetch_failure() {
        let dir = tempfile::tempdir().unwrap();
        let manager = open_manager(test_config(&dir)).await;

        let emissions: Vec<CachedResource<String>> = manager
            .get_with_swr("k", || async { anyhow::bail!("offline") }, false)
            .collect()
            .await;

        assert_eq!(emissions.len(), 2);
        assert_matches!(&emissions[0], CachedResource::Loading { data: None });
        assert_matches!(
            &emissions[1],
            CachedResource::Error { cause, data: None, is_from_cache: false } => {
                assert_matches!(&**cause, Error::FetchFailed(_));
                assert!(cause.to_string().contains("offline"));
            }
        );
        assert!(manager.predictor().is_empty());
    }

    #[tokio::test]
    async fn test_swr_stale_value_survives_fetch_failure() {
        let dir = tempfile::tempdir().unwrap();
        let manager = open_manager(short_stale_config(&dir)).await;
        manager.put("k", "old".to_string()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        let emissions: Vec<CachedResource<String>> = manager
            .get_with_swr("k", || async { anyhow::bail!("offline") }, false)
            .collect()
            .await;

        assert_eq!(emissions.len(), 3);
        assert!(emissions[1].is_stale());
        assert_matches!(
            &emissions[2],
            CachedResource::Error { data: Some(data), is_from_cache: true, .. } if data == "old"
        );
        assert_eq!(manager.get::<String>("k").await.unwrap(), "old");
    }

    #[tokio::test]
    async fn test_swr_cold_key_fetches_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let manager = open_manager(test_config(&dir)).await;

        let emissions: Vec<CachedResource<Conversation>> = manager
            .get_with_swr("conversation:9", || async { anyhow::Ok(conversation(9, "fresh")) }, false)
            .collect()
            .await;

        assert_eq!(emissions.len(), 2);
        assert_matches!(
            &emissions[1],
            CachedResource::Success { is_from_cache: false, is_stale: false, .. }
        );
        assert_eq!(
            manager.get::<Conversation>("conversation:9").await,
            Some(conversation(9, "fresh"))
        );
    }

    #[tokio::test]
    async fn test_swr_force_refresh_bypasses_cache() {
        let dir = tempfile::tempdir().unwrap();
        let manager = open_manager(test_config(&dir)).await;
        manager.put("k", "cached".to_string()).await.unwrap();

        let emissions: Vec<CachedResource<String>> = manager
            .get_with_swr("k", || async { anyhow::Ok("forced".to_string()) }, true)
            .collect()
            .await;

        assert_eq!(emissions.len(), 2);
        assert_matches!(
            &emissions[1],
            CachedResource::Success { data, is_from_cache: false, .. } if data == "forced"
        );

        let failed: Vec<CachedResource<String>> = manager
            .get_with_swr("k", || async { anyhow::bail!("offline") }, true)
            .collect()
            .await;
        assert_matches!(
            &failed[1],
            CachedResource::Error { data: Some(data), is_from_cache: true, .. } if data == "forced"
        );
    }

    #[tokio::test]
    async fn test_swr_dropped_stream_stops_emitting() {
        let dir = tempfile::tempdir().unwrap();
        let manager = open_manager(test_config(&dir)).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut stream = Box::pin(manager.get_with_swr(
            "k",
            move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                anyhow::Ok(1u32)
            },
            false,
        ));

        assert_matches!(stream.next().await, Some(CachedResource::Loading { .. }));
        drop(stream);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_swr_concurrent_cold_reads_each_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let manager = open_manager(test_config(&dir)).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let read = |calls: Arc<AtomicUsize>| {
            manager
                .get_with_swr(
                    "cold",
                    move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        anyhow::Ok(7u32)
                    },
                    false,
                )
                .collect::<Vec<_>>()
        };

        let (a, b) = tokio::join!(read(Arc::clone(&calls)), read(Arc::clone(&calls)));
        assert_eq!(a.len(), 2);
        assert_eq!(b.len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_prefetch_caches_values_and_counts_failures() {
        let dir = tempfile::tempdir().unwrap();
        let manager = open_manager(test_config(&dir)).await;

        let fetcher = Arc::new(|key: String| async move {
            if key.ends_with("bad") {
                anyhow::bail!("no such conversation");
            }
            Ok(format!("body of {}", key))
        });
        let keys = vec!["c:1".to_string(), "c:bad".to_string(), "c:2".to_string()];

        let report = manager.prefetch(keys, fetcher).await.unwrap();
        assert_eq!(report, PrefetchReport { succeeded: 2, failed: 1 });

        assert_eq!(manager.get::<String>("c:1").await.unwrap(), "body of c:1");
        assert!(manager.get::<String>("c:bad").await.is_none());

        let stats = manager.get_stats().await;
        assert_eq!(stats.prefetch_succeeded, 2);
        assert_eq!(stats.prefetch_failed, 1);
    }

    #[tokio::test]
    async fn test_predictive_prefetch() {
        let dir = tempfile::tempdir().unwrap();
        let manager = open_manager(test_config(&dir)).await;

        manager.predictor().record_access("conversation:1");
        manager.predictor().record_access("conversation:1");
        manager.predictor().record_access("conversation:2");
        manager.put("conversation:2", "already here".to_string()).await.unwrap();

        let fetched = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&fetched);
        let fetcher = Arc::new(move |key: String| {
            let log = Arc::clone(&log);
            async move {
                log.lock().push(key.clone());
                anyhow::Ok(format!("predicted {}", key))
            }
        });

        let report = manager
            .predictive_prefetch("conversation:2", fetcher)
            .await
            .unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(*fetched.lock(), vec!["conversation:1".to_string()]);
        assert_eq!(
            manager.get::<String>("conversation:1").await.unwrap(),
            "predicted conversation:1"
        );
    }

    #[tokio::test]
    async fn test_maintenance_sweeps_expired_entries() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig {
            stale_threshold: Duration::from_millis(10),
            cleanup_interval: Duration::from_millis(50),
            ..test_config(&dir)
        };
        let manager = open_manager(config).await;
        manager
            .put_with_ttl("short", 1u32, Duration::from_millis(30))
            .await
            .unwrap();
        manager.put("long", 2u32).await.unwrap();

        tokio::time::sleep(Duration::from_millis(250)).await;

        let stats = manager.get_stats().await;
        assert!(stats.cleanup_runs >= 1);
        assert_eq!(stats.cleanup_removed, 1);
        assert_eq!(manager.get::<u32>("long").await, Some(2));
    }

    #[tokio::test]
    async fn test_shutdown_stops_maintenance() {
        let dir = tempfile::tempdir().unwrap();
        let manager = open_manager(test_config(&dir)).await;
        assert!(manager.is_running());

        manager.shutdown().await;
        assert!(!manager.is_running());

        // The cache stays usable without the maintenance task
        manager.put("k", 1u32).await.unwrap();
        assert_eq!(manager.get::<u32>("k").await, Some(1));
        assert_eq!(manager.cleanup().await, 0);
    }

    #[tokio::test]
    async fn test_concurrent_put_get() {
        let dir = tempfile::tempdir().unwrap();
        let manager = open_manager(test_config(&dir)).await;

        let mut handles = Vec::new();
        for i in 0..16u64 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                let key = CacheManager::normalize_key(&["conversation", &i.to_string()]);
                manager.put(&key, conversation(i, "concurrent")).await.unwrap();
                manager.get::<Conversation>(&key).await
            }));
        }

        for (i, handle) in handles.into_iter().enumerate() {
            let value = handle.await.unwrap().unwrap();
            assert_eq!(value.id, i as u64);
        }
        assert_eq!(manager.get_stats().await.memory_entries, 16);
    }
}
