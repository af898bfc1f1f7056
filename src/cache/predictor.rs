//! Access Predictor
//!
//! Bounded history of key accesses used to guess which keys will be wanted
//! next, plus the scheduler that warms them in the background.
//!
//! # Ranking
//!
//! 1. The most frequently accessed keys over the whole history
//! 2. Keys accessed during the current hour of day, oldest first
//!
//! Duplicates keep their first position.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Local, Timelike, Utc};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Result;

/// Default number of records kept
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// Default size of the frequency-ranked set
pub const DEFAULT_FREQUENT_SET_SIZE: usize = 10;

/// Fetches run concurrently per prefetch batch
pub const PREFETCH_CONCURRENCY: usize = 4;

/// One observed access
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessRecord {
    pub key: String,
    pub timestamp: DateTime<Utc>,
    /// Local hour of day, 0..=23
    pub hour_of_day: u32,
}

/// Access history and key ranking
pub struct AccessPredictor {
    history: Mutex<VecDeque<AccessRecord>>,
    capacity: usize,
    frequent_set_size: usize,
}

impl AccessPredictor {
    pub fn new(capacity: usize, frequent_set_size: usize) -> Self {
        Self {
            history: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            frequent_set_size,
        }
    }

    /// Record an access happening now
    pub fn record_access(&self, key: &str) {
        self.record_access_at(key, Local::now());
    }

    /// Record an access at a given local time
    pub fn record_access_at(&self, key: &str, at: DateTime<Local>) {
        let record = AccessRecord {
            key: key.to_string(),
            timestamp: at.with_timezone(&Utc),
            hour_of_day: at.hour(),
        };

        let mut history = self.history.lock();
        history.push_back(record);
        while history.len() > self.capacity {
            history.pop_front();
        }
    }

    /// Suggest up to `count` keys likely to be accessed next.
    ///
    /// `current_key` is accepted for call-site symmetry; the ranking only
    /// depends on the history and the clock.
    pub fn predict_next_keys(&self, current_key: &str, count: usize) -> Vec<String> {
        self.predict_next_keys_at(current_key, count, Local::now())
    }

    pub fn predict_next_keys_at(
        &self,
        _current_key: &str,
        count: usize,
        now: DateTime<Local>,
    ) -> Vec<String> {
        let hour = now.hour();
        let history = self.history.lock();

        // key -> (count, first position)
        let mut counts: HashMap<&str, (usize, usize)> = HashMap::new();
        for (position, record) in history.iter().enumerate() {
            counts.entry(record.key.as_str()).or_insert((0, position)).0 += 1;
        }
        let mut frequent: Vec<(&str, usize, usize)> = counts
            .into_iter()
            .map(|(key, (count, first))| (key, count, first))
            .collect();
        frequent.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
        frequent.truncate(self.frequent_set_size);

        let same_hour = history
            .iter()
            .filter(|record| record.hour_of_day == hour)
            .map(|record| record.key.as_str());

        let mut seen = HashSet::new();
        let mut predicted = Vec::with_capacity(count);
        for key in frequent.iter().map(|(key, _, _)| *key).chain(same_hour) {
            if predicted.len() >= count {
                break;
            }
            if seen.insert(key) {
                predicted.push(key.to_string());
            }
        }
        predicted
    }

    /// Snapshot of the history, oldest first
    pub fn history(&self) -> Vec<AccessRecord> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.history.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.lock().is_empty()
    }

    pub fn clear(&self) {
        self.history.lock().clear();
    }
}

impl Default for AccessPredictor {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY, DEFAULT_FREQUENT_SET_SIZE)
    }
}

/// Source of values for keys being prefetched
#[async_trait]
pub trait Fetcher<T>: Send + Sync {
    async fn fetch(&self, key: &str) -> anyhow::Result<T>;
}

#[async_trait]
impl<T, F, Fut> Fetcher<T> for F
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    T: Send + 'static,
{
    async fn fetch(&self, key: &str) -> anyhow::Result<T> {
        (self)(key.to_string()).await
    }
}

/// Outcome of one prefetch batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PrefetchReport {
    pub succeeded: usize,
    pub failed: usize,
}

/// Fetch `keys` in the background and hand each value to `on_fetched`.
///
/// Failures are logged and counted; they never abort the batch.
pub fn schedule_prefetch<T, F, C, CFut>(
    keys: Vec<String>,
    fetcher: Arc<F>,
    on_fetched: C,
) -> JoinHandle<PrefetchReport>
where
    T: Send + 'static,
    F: Fetcher<T> + ?Sized + 'static,
    C: Fn(String, T) -> CFut + Send + Sync + 'static,
    CFut: Future<Output = Result<()>> + Send,
{
    let on_fetched = Arc::new(on_fetched);

    tokio::spawn(async move {
        let outcomes: Vec<bool> = stream::iter(keys)
            .map(|key| {
                let fetcher = Arc::clone(&fetcher);
                let on_fetched = Arc::clone(&on_fetched);
                async move {
                    let value = match fetcher.fetch(&key).await {
                        Ok(value) => value,
                        Err(e) => {
                            warn!(key = %key, "Prefetch fetch failed: {:#}", e);
                            return false;
                        }
                    };
                    match on_fetched(key.clone(), value).await {
                        Ok(()) => {
                            debug!(key = %key, "Prefetched");
                            true
                        }
                        Err(e) => {
                            warn!(key = %key, "Prefetch store failed: {}", e);
                            false
                        }
                    }
                }
            })
            .buffer_unordered(PREFETCH_CONCURRENCY)
            .collect()
            .await;

        let succeeded = outcomes.iter().filter(|ok| **ok).count();
        PrefetchReport {
            succeeded,
            failed: outcomes.len() - succeeded,
        }
    })
}

// =============================================================================
// Tests
// =============================================================================
