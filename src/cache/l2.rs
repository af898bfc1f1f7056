//! L2 Cache - Persistent Disk Tier
//!
//! Durable, capacity-bounded store. Each key owns two sibling files in the
//! cache directory, named by the SHA-256 of the key:
//!
//! ```text
//! <hex>        value blob (CacheCodec)
//! <hex>.meta   metadata blob (JSON CacheMetadata)
//! ```
//!
//! # Design
//!
//! - One async mutex per tier serializes every directory mutation
//! - Public operations run on detached tasks; dropping the caller's future
//!   never leaves a half-applied write behind
//! - Corrupted or unreadable pairs are deleted and reported as misses
//! - Sweeps work in fixed-size batches and yield to the scheduler in between

use std::collections::HashMap;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::codec::CacheCodec;
use super::entry::{CacheEntry, CacheMetadata};
use super::key_codec::{encode_key, is_encoded_key};
use crate::error::{Error, Result};

/// Suffix of metadata blobs
pub const META_SUFFIX: &str = ".meta";

/// Fraction of the budget an eviction sweep shrinks the tier down to
pub const EVICTION_TARGET_RATIO: f64 = 0.8;

/// L2 Cache configuration
#[derive(Debug, Clone)]
pub struct DiskConfig {
    /// Cache directory path
    pub dir: PathBuf,
    /// Byte budget for value and metadata blobs together
    pub max_bytes: u64,
    /// Entries processed between scheduler yields during sweeps
    pub sweep_batch_size: usize,
}

impl DiskConfig {
    pub fn new(dir: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self {
            dir: dir.into(),
            max_bytes,
            sweep_batch_size: 64,
        }
    }
}

/// One key's files as found on disk
#[derive(Debug, Clone)]
struct StoredPair {
    id: String,
    size: u64,
}

struct DiskInner {
    dir: PathBuf,
    max_bytes: u64,
    batch_size: usize,
    lock: Mutex<()>,
    /// Running byte total, updated under `lock` by every write and delete
    used_bytes: AtomicU64,
    evictions: AtomicU64,
    healed: AtomicU64,
}

/// L2 Cache - persistent disk tier
#[derive(Clone)]
pub struct DiskTier {
    inner: Arc<DiskInner>,
}

impl DiskTier {
    /// Open (creating if needed) a disk tier rooted at `config.dir`
    pub async fn open(config: DiskConfig) -> Result<Self> {
        if config.max_bytes == 0 {
            return Err(Error::Config("disk tier budget must be non-zero".to_string()));
        }
        fs::create_dir_all(&config.dir).await?;

        let inner = DiskInner {
            dir: config.dir,
            max_bytes: config.max_bytes,
            batch_size: config.sweep_batch_size.max(1),
            lock: Mutex::new(()),
            used_bytes: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            healed: AtomicU64::new(0),
        };
        let used: u64 = inner.scan().await?.iter().map(|p| p.size).sum();
        inner.used_bytes.store(used, Ordering::Relaxed);
        info!(
            dir = %inner.dir.display(),
            max_bytes = inner.max_bytes,
            used_bytes = used,
            "Opened L2 disk tier"
        );

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Get an entry, recording the access in its metadata blob.
    ///
    /// Missing, expired, unreadable and corrupted entries are all misses;
    /// the last three also delete the pair.
    pub async fn get<T>(&self, key: &str) -> Option<CacheEntry<T>>
    where
        T: CacheCodec + Send + 'static,
    {
        let key = key.to_string();
        match self
            .detached(move |inner| async move { inner.get::<T>(&key).await })
            .await
        {
            Ok(entry) => entry,
            Err(e) => {
                warn!("L2 read task failed: {}", e);
                None
            }
        }
    }

    /// Put a value. Makes room first, then writes value and metadata.
    pub async fn put<T: CacheCodec>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        let blob = value.encode()?;
        let key = key.to_string();
        self.detached(move |inner| async move { inner.put(&key, blob, ttl).await })
            .await?
    }

    /// Remove both blobs of a key; true if anything existed
    pub async fn remove(&self, key: &str) -> bool {
        let id = encode_key(key);
        self.detached(move |inner| async move {
            let _guard = inner.lock.lock().await;
            inner.delete_pair(&id).await
        })
        .await
        .unwrap_or(false)
    }

    /// Delete every entry in the tier
    pub async fn clear(&self) -> Result<()> {
        self.detached(|inner| async move { inner.clear().await })
            .await?
    }

    /// Total bytes used by cache blobs, measured on disk.
    ///
    /// Also resynchronizes the running total with the directory.
    pub async fn size_bytes(&self) -> u64 {
        self.detached(|inner| async move {
            let _guard = inner.lock.lock().await;
            match inner.scan().await {
                Ok(pairs) => {
                    let total = pairs.iter().map(|p| p.size).sum();
                    inner.used_bytes.store(total, Ordering::Relaxed);
                    total
                }
                Err(e) => {
                    warn!("L2 size scan failed: {}", e);
                    0
                }
            }
        })
        .await
        .unwrap_or(0)
    }

    /// Running byte total maintained by writes and deletes
    pub fn used_bytes(&self) -> u64 {
        self.inner.used_bytes.load(Ordering::Relaxed)
    }

    /// Delete expired and unreadable entries; returns the number removed
    pub async fn cleanup(&self) -> usize {
        self.detached(|inner| async move { inner.cleanup().await })
            .await
            .unwrap_or(0)
    }

    /// Run the eviction sweep against the byte budget; returns entries removed
    pub async fn ensure_space(&self) -> usize {
        self.detached(|inner| async move {
            let _guard = inner.lock.lock().await;
            inner.ensure_space().await
        })
        .await
        .unwrap_or(0)
    }

    /// Byte budget
    pub fn max_bytes(&self) -> u64 {
        self.inner.max_bytes
    }

    /// Cache directory
    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Entries removed by the budget sweep
    pub fn evictions(&self) -> u64 {
        self.inner.evictions.load(Ordering::Relaxed)
    }

    /// Corrupted or unreadable pairs deleted on access or by cleanup
    pub fn healed(&self) -> u64 {
        self.inner.healed.load(Ordering::Relaxed)
    }

    async fn detached<R, F, Fut>(&self, op: F) -> Result<R>
    where
        F: FnOnce(Arc<DiskInner>) -> Fut,
        Fut: Future<Output = R> + Send + 'static,
        R: Send + 'static,
    {
        let task = tokio::spawn(op(Arc::clone(&self.inner)));
        Ok(task.await?)
    }
}

impl DiskInner {
    fn value_path(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }

    fn meta_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}{}", id, META_SUFFIX))
    }

    async fn get<T: CacheCodec>(&self, key: &str) -> Option<CacheEntry<T>> {
        let id = encode_key(key);
        let _guard = self.lock.lock().await;

        let mut metadata = match self.read_metadata(&id).await {
            Ok(Some(metadata)) => metadata,
            Ok(None) => {
                // An orphaned value blob is useless without metadata
                self.delete_pair(&id).await;
                return None;
            }
            Err(e) => {
                warn!(key, "L2 metadata unreadable, deleting entry: {}", e);
                self.heal(&id).await;
                return None;
            }
        };

        let now = Utc::now();
        if metadata.is_expired_at(now) {
            debug!(key, "L2 entry expired");
            self.delete_pair(&id).await;
            return None;
        }

        let blob = match fs::read(self.value_path(&id)).await {
            Ok(blob) => blob,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(key, "L2 value blob missing, deleting entry");
                self.heal(&id).await;
                return None;
            }
            Err(e) => {
                warn!(key, "L2 value read failed: {}", e);
                return None;
            }
        };

        let value = match T::decode(&blob) {
            Ok(value) => value,
            Err(e) => {
                warn!(key, "L2 value corrupted, deleting entry: {}", e);
                self.heal(&id).await;
                return None;
            }
        };

        metadata.record_access(now);
        if let Err(e) = self.write_metadata(&id, &metadata).await {
            warn!(key, "L2 metadata refresh failed: {}", e);
        }

        Some(CacheEntry::with_metadata(value, metadata))
    }

    async fn put(&self, key: &str, blob: Vec<u8>, ttl: Duration) -> Result<()> {
        let id = encode_key(key);
        let _guard = self.lock.lock().await;

        self.ensure_space().await;

        let metadata = CacheMetadata::new(ttl);
        if let Err(e) = self.write_blob(&self.value_path(&id), &blob).await {
            self.delete_pair(&id).await;
            return Err(e);
        }
        if let Err(e) = self.write_metadata(&id, &metadata).await {
            self.delete_pair(&id).await;
            return Err(e);
        }

        debug!(key, bytes = blob.len(), "L2 stored entry");
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        let pairs = self.scan().await?;
        for batch in pairs.chunks(self.batch_size) {
            for pair in batch {
                self.delete_pair(&pair.id).await;
            }
            tokio::task::yield_now().await;
        }
        self.used_bytes.store(0, Ordering::Relaxed);
        info!(removed = pairs.len(), "Cleared L2 disk tier");
        Ok(())
    }

    #[instrument(skip(self), fields(dir = %self.dir.display()))]
    async fn cleanup(&self) -> usize {
        let pairs = {
            let _guard = self.lock.lock().await;
            match self.scan().await {
                Ok(pairs) => pairs,
                Err(e) => {
                    warn!("L2 cleanup scan failed: {}", e);
                    return 0;
                }
            }
        };

        let mut removed = 0;
        for batch in pairs.chunks(self.batch_size) {
            {
                let _guard = self.lock.lock().await;
                let now = Utc::now();
                for pair in batch {
                    let delete = match self.read_metadata(&pair.id).await {
                        Ok(Some(metadata)) => metadata.is_expired_at(now),
                        Ok(None) => true,
                        Err(e) => {
                            warn!(id = %pair.id, "Unreadable L2 metadata: {}", e);
                            self.healed.fetch_add(1, Ordering::Relaxed);
                            true
                        }
                    };
                    if delete && self.delete_pair(&pair.id).await {
                        removed += 1;
                    }
                }
            }
            // Lock released: queued tier operations run before the next batch
            tokio::task::yield_now().await;
        }

        info!(scanned = pairs.len(), removed, "L2 cleanup complete");
        removed
    }

    /// Caller must hold the tier lock
    async fn ensure_space(&self) -> usize {
        if self.used_bytes.load(Ordering::Relaxed) < self.max_bytes {
            return 0;
        }

        let pairs = match self.scan().await {
            Ok(pairs) => pairs,
            Err(e) => {
                warn!("L2 eviction scan failed: {}", e);
                return 0;
            }
        };

        let mut total: u64 = pairs.iter().map(|p| p.size).sum();
        self.used_bytes.store(total, Ordering::Relaxed);
        if total < self.max_bytes {
            return 0;
        }
        let target = (self.max_bytes as f64 * EVICTION_TARGET_RATIO) as u64;

        let mut candidates: Vec<(DateTime<Utc>, &StoredPair)> = Vec::with_capacity(pairs.len());
        for batch in pairs.chunks(self.batch_size) {
            for pair in batch {
                let last_accessed = match self.read_metadata(&pair.id).await {
                    Ok(Some(metadata)) => metadata.last_accessed_at,
                    // Unreadable entries go first
                    _ => DateTime::<Utc>::MIN_UTC,
                };
                candidates.push((last_accessed, pair));
            }
            tokio::task::yield_now().await;
        }
        candidates.sort_by_key(|(last_accessed, _)| *last_accessed);

        let mut removed = 0;
        'sweep: for batch in candidates.chunks(self.batch_size) {
            for (_, pair) in batch {
                if total <= target {
                    break 'sweep;
                }
                self.delete_pair(&pair.id).await;
                total = total.saturating_sub(pair.size);
                removed += 1;
            }
            tokio::task::yield_now().await;
        }

        self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        info!(removed, total, target, "L2 eviction sweep complete");
        removed
    }

    async fn scan(&self) -> Result<Vec<StoredPair>> {
        let mut sizes: HashMap<String, u64> = HashMap::new();
        let mut dir = fs::read_dir(&self.dir).await?;

        while let Some(item) = dir.next_entry().await? {
            let file_name = item.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let id = name.strip_suffix(META_SUFFIX).unwrap_or(name);
            if !is_encoded_key(id) {
                continue;
            }
            let size = match item.metadata().await {
                Ok(meta) if meta.is_file() => meta.len(),
                _ => continue,
            };
            *sizes.entry(id.to_string()).or_default() += size;
        }

        Ok(sizes
            .into_iter()
            .map(|(id, size)| StoredPair { id, size })
            .collect())
    }

    async fn read_metadata(&self, id: &str) -> Result<Option<CacheMetadata>> {
        match fs::read(self.meta_path(id)).await {
            Ok(blob) => CacheMetadata::decode(&blob).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_metadata(&self, id: &str, metadata: &CacheMetadata) -> Result<()> {
        let blob = metadata.encode()?;
        self.write_blob(&self.meta_path(id), &blob).await
    }

    /// Write one blob, moving the running total by the change in file size
    async fn write_blob(&self, path: &Path, blob: &[u8]) -> Result<()> {
        let before = file_len(path).await;
        let written = fs::write(path, blob).await;
        let after = file_len(path).await;
        self.used_bytes.fetch_add(after, Ordering::Relaxed);
        self.release_bytes(before);
        written.map_err(Error::from)
    }

    fn release_bytes(&self, bytes: u64) {
        let _ = self
            .used_bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
                Some(used.saturating_sub(bytes))
            });
    }

    async fn heal(&self, id: &str) {
        self.healed.fetch_add(1, Ordering::Relaxed);
        self.delete_pair(id).await;
    }

    /// Delete both blobs; true if at least one existed
    async fn delete_pair(&self, id: &str) -> bool {
        let value = self.delete_blob(&self.value_path(id)).await;
        let meta = self.delete_blob(&self.meta_path(id)).await;
        value || meta
    }

    async fn delete_blob(&self, path: &Path) -> bool {
        let size = file_len(path).await;
        let removed = remove_if_exists(path).await;
        if removed {
            self.release_bytes(size);
        }
        removed
    }
}

/// Size of a regular file; 0 when missing or not a file
async fn file_len(path: &Path) -> u64 {
    match fs::metadata(path).await {
        Ok(meta) if meta.is_file() => meta.len(),
        _ => 0,
    }
}

async fn remove_if_exists(path: &Path) -> bool {
    match fs::remove_file(path).await {
        Ok(()) => true,
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => {
            warn!("Failed to remove {}: {}", path.display(), e);
            false
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
