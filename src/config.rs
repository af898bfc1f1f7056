//! Cache configuration
//!
//! Every knob has a default; a YAML file may override any subset of them.
//! Durations are written as strings such as `"24h"`, `"90m"` or `"1h30m"`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default in-memory entry capacity
pub const DEFAULT_MEMORY_MAX_ENTRIES: usize = 100;

/// Default byte budget of the bitmap tier (32 MiB)
pub const DEFAULT_BITMAP_MAX_BYTES: u64 = 32 * 1024 * 1024;

/// Default byte budget of the disk tier (100 MiB)
pub const DEFAULT_DISK_MAX_BYTES: u64 = 100 * 1024 * 1024;

/// Default entry lifetime
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 3600);

/// Default age after which entries are served as stale
pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(3600);

/// Default period of the disk cleanup sweep
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

/// Cache engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Directory holding the disk tier
    pub cache_dir: PathBuf,
    /// L1 capacity in entries
    pub memory_max_entries: usize,
    /// Bitmap tier capacity in bytes
    pub bitmap_max_bytes: u64,
    /// L2 capacity in bytes
    pub disk_max_bytes: u64,
    /// TTL used when `put` is called without one
    #[serde(with = "duration_str")]
    pub default_ttl: Duration,
    /// Entries older than this are served with `is_stale = true`
    #[serde(with = "duration_str")]
    pub stale_threshold: Duration,
    /// Period of the background cleanup sweep
    #[serde(with = "duration_str")]
    pub cleanup_interval: Duration,
    /// Entries handled between scheduler yields in disk sweeps
    pub sweep_batch_size: usize,
    /// Access records kept by the predictor
    pub history_capacity: usize,
    /// Frequency-ranked keys considered by the predictor
    pub frequent_set_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: std::env::temp_dir().join("tiercache"),
            memory_max_entries: DEFAULT_MEMORY_MAX_ENTRIES,
            bitmap_max_bytes: DEFAULT_BITMAP_MAX_BYTES,
            disk_max_bytes: DEFAULT_DISK_MAX_BYTES,
            default_ttl: DEFAULT_TTL,
            stale_threshold: DEFAULT_STALE_THRESHOLD,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            sweep_batch_size: 64,
            history_capacity: 1000,
            frequent_set_size: 10,
        }
    }
}

impl CacheConfig {
    /// Defaults rooted at `cache_dir`
    pub fn with_cache_dir(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            ..Default::default()
        }
    }

    /// Parse a YAML document; missing fields keep their defaults
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&yaml)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let non_zero = [
            ("memory_max_entries", self.memory_max_entries as u64),
            ("bitmap_max_bytes", self.bitmap_max_bytes),
            ("disk_max_bytes", self.disk_max_bytes),
            ("sweep_batch_size", self.sweep_batch_size as u64),
            ("history_capacity", self.history_capacity as u64),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(Error::Config(format!("{} must be greater than 0", name)));
            }
        }

        if self.stale_threshold.is_zero() {
            return Err(Error::Config("stale_threshold must be greater than 0".to_string()));
        }
        if self.cleanup_interval.is_zero() {
            return Err(Error::Config("cleanup_interval must be greater than 0".to_string()));
        }
        if self.stale_threshold >= self.default_ttl {
            return Err(Error::Config(format!(
                "stale_threshold ({:?}) must be less than default_ttl ({:?})",
                self.stale_threshold, self.default_ttl
            )));
        }
        Ok(())
    }
}

/// Parse a duration string like "1h", "30m", "90s", "7d" or "1h30m".
///
/// A trailing number without a unit counts as seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::DurationParse("empty duration string".to_string()));
    }

    let mut total_secs: u64 = 0;
    let mut num_buf = String::new();

    for c in s.chars() {
        if c.is_ascii_digit() {
            num_buf.push(c);
        } else {
            let num: u64 = num_buf
                .parse()
                .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
            num_buf.clear();

            let multiplier = match c {
                'h' | 'H' => 3600,
                'm' | 'M' => 60,
                's' | 'S' => 1,
                'd' | 'D' => 86400,
                _ => {
                    return Err(Error::DurationParse(format!(
                        "unknown duration unit: {}",
                        c
                    )))
                }
            };

            total_secs = num
                .checked_mul(multiplier)
                .and_then(|secs| total_secs.checked_add(secs))
                .ok_or_else(|| Error::DurationParse(format!("duration overflows: {}", s)))?;
        }
    }

    if !num_buf.is_empty() {
        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        total_secs = total_secs
            .checked_add(num)
            .ok_or_else(|| Error::DurationParse(format!("duration overflows: {}", s)))?;
    }

    if total_secs == 0 {
        return Err(Error::DurationParse(
            "duration must be greater than 0".to_string(),
        ));
    }

    Ok(Duration::from_secs(total_secs))
}

mod duration_str {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("{}s", d.as_secs()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_duration(&raw).map_err(de::Error::custom)
    }
}

// =============================================================================
// Tests
// =============================================================================
