//! Cache Entry Types
//!
//! Entries carry their own access metadata; the same metadata layout is
//! persisted next to every disk blob.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Access and lifetime metadata for a cache entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetadata {
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Number of reads served since creation
    pub access_count: u64,
    /// Last read timestamp (creation time until first read)
    pub last_accessed_at: DateTime<Utc>,
    /// Time-to-live measured from `created_at`
    #[serde(rename = "ttl_ms", with = "duration_millis")]
    pub ttl: Duration,
}

impl CacheMetadata {
    /// Fresh metadata for an entry created now
    pub fn new(ttl: Duration) -> Self {
        Self::created_at(Utc::now(), ttl)
    }

    /// Fresh metadata for an entry created at `now`
    pub fn created_at(now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            created_at: now,
            access_count: 0,
            last_accessed_at: now,
            ttl,
        }
    }

    /// Age of the entry at `now` (zero if the clock went backwards)
    #[inline]
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Check if entry has expired
    #[inline]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.age_at(now) > self.ttl
    }

    /// Check if entry is past the stale threshold but not yet expired
    #[inline]
    pub fn is_stale(&self, stale_threshold: Duration) -> bool {
        self.is_stale_at(Utc::now(), stale_threshold)
    }

    pub fn is_stale_at(&self, now: DateTime<Utc>, stale_threshold: Duration) -> bool {
        let age = self.age_at(now);
        age > stale_threshold && age <= self.ttl
    }

    /// Record a read at `now`
    pub fn record_access(&mut self, now: DateTime<Utc>) {
        self.access_count += 1;
        self.last_accessed_at = now;
    }
}

/// Cache entry containing a value and its metadata
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
    pub value: T,
    pub metadata: CacheMetadata,
}

impl<T> CacheEntry<T> {
    /// Create a new entry with fresh metadata
    pub fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            metadata: CacheMetadata::new(ttl),
        }
    }

    /// Create with existing metadata (for cache tier transfers)
    pub fn with_metadata(value: T, metadata: CacheMetadata) -> Self {
        Self { value, metadata }
    }

    /// Map the value, keeping metadata
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CacheEntry<U> {
        CacheEntry {
            value: f(self.value),
            metadata: self.metadata,
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    const TTL: Duration = Duration::from_secs(3600);
    const STALE: Duration = Duration::from_secs(600);

    fn created(ago_secs: i64) -> (CacheMetadata, DateTime<Utc>) {
        let now = Utc::now();
        let meta = CacheMetadata::created_at(now - TimeDelta::seconds(ago_secs), TTL);
        (meta, now)
    }

    #[test]
    fn test_metadata_creation() {
        let meta = CacheMetadata::new(TTL);
        assert_eq!(meta.access_count, 0);
        assert_eq!(meta.created_at, meta.last_accessed_at);
        assert!(!meta.is_expired());
        assert!(!meta.is_stale(STALE));
    }

    #[test]
    fn test_fresh_window() {
        let (meta, now) = created(60);
        assert!(!meta.is_stale_at(now, STALE));
        assert!(!meta.is_expired_at(now));
    }

    #[test]
    fn test_stale_window() {
        let (meta, now) = created(1800);
        assert!(meta.is_stale_at(now, STALE));
        assert!(!meta.is_expired_at(now));
    }

    #[test]
    fn test_expired_is_not_stale() {
        let (meta, now) = created(7200);
        assert!(meta.is_expired_at(now));
        assert!(!meta.is_stale_at(now, STALE));
    }

    #[test]
    fn test_boundaries() {
        let now = Utc::now();
        let at_ttl = CacheMetadata::created_at(now - TimeDelta::seconds(3600), TTL);
        // age == ttl is still servable
        assert!(!at_ttl.is_expired_at(now));
        assert!(at_ttl.is_stale_at(now, STALE));

        let at_threshold = CacheMetadata::created_at(now - TimeDelta::seconds(600), TTL);
        assert!(!at_threshold.is_stale_at(now, STALE));
    }

    #[test]
    fn test_clock_skew_counts_as_fresh() {
        let now = Utc::now();
        let meta = CacheMetadata::created_at(now + TimeDelta::seconds(30), TTL);
        assert_eq!(meta.age_at(now), Duration::ZERO);
        assert!(!meta.is_expired_at(now));
    }

    #[test]
    fn test_record_access() {
        let mut meta = CacheMetadata::new(TTL);
        let later = meta.created_at + TimeDelta::seconds(5);
        meta.record_access(later);
        meta.record_access(later);
        assert_eq!(meta.access_count, 2);
        assert_eq!(meta.last_accessed_at, later);
    }

    #[test]
    fn test_metadata_json_layout() {
        let meta = CacheMetadata::new(Duration::from_millis(1500));
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["ttl_ms"], 1500);
        assert_eq!(json["access_count"], 0);

        let back: CacheMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(back, meta);
    }

    #[test]
    fn test_entry_map_keeps_metadata() {
        let entry = CacheEntry::new(21u32, TTL);
        let meta = entry.metadata.clone();
        let doubled = entry.map(|v| v * 2);
        assert_eq!(doubled.value, 42);
        assert_eq!(doubled.metadata, meta);
    }
}
