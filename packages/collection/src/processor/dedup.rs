//! In-memory duplicate filter.
//!
//! Fingerprints are MD5 digests over canonical JSON: record maps are
//! BTreeMap-backed, so serialization order is stable and equal records
//! always produce equal digests. The cache maps fingerprint → first-seen
//! timestamp, bounded by `cache_size` with oldest-entry eviction, and an
//! hourly background sweep removes entries older than the time window.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{DedupStrategy, DeduplicatorConfig};
use crate::error::{ProcessError, ProcessResult};
use crate::record::Record;

const SWEEP_INTERVAL: StdDuration = StdDuration::from_secs(3600);

/// Running totals, updated atomically.
#[derive(Default)]
struct Stats {
    total_processed: AtomicU64,
    duplicates: AtomicU64,
    unique: AtomicU64,
}

/// Point-in-time view of deduplication totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub total_processed: u64,
    pub duplicates: u64,
    pub unique: u64,
}

impl StatsSnapshot {
    /// Duplicates as a percentage of everything processed.
    pub fn duplicate_rate(&self) -> f64 {
        if self.total_processed == 0 {
            return 0.0;
        }
        self.duplicates as f64 / self.total_processed as f64 * 100.0
    }
}

/// Per-job duplicate filter with a bounded fingerprint cache.
pub struct Deduplicator {
    config: DeduplicatorConfig,
    cache: Mutex<HashMap<String, DateTime<Utc>>>,
    stats: Stats,
    sweeper: CancellationToken,
}

impl Deduplicator {
    /// Create a deduplicator and start its hourly expiry sweeper.
    ///
    /// Must be called from a tokio runtime context.
    pub fn new(config: DeduplicatorConfig) -> Arc<Self> {
        let dedup = Arc::new(Self {
            config,
            cache: Mutex::new(HashMap::new()),
            stats: Stats::default(),
            sweeper: CancellationToken::new(),
        });

        let weak: Weak<Self> = Arc::downgrade(&dedup);
        let stop = dedup.sweeper.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.tick().await; // immediate first tick is a no-op
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(dedup) = weak.upgrade() else { break };
                        dedup.sweep();
                    }
                }
            }
        });

        dedup
    }

    /// Filter duplicates out of a batch, keeping first occurrences.
    pub fn deduplicate(&self, records: Vec<Record>) -> ProcessResult<Vec<Record>> {
        if records.is_empty() {
            return Ok(records);
        }

        if self.config.enable_logging {
            info!(input = records.len(), "deduplication starting");
        }

        let mut unique = Vec::with_capacity(records.len());
        let mut duplicates = 0usize;

        for record in records {
            self.stats.total_processed.fetch_add(1, Ordering::Relaxed);

            if self.is_duplicate(&record)? {
                duplicates += 1;
                self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            self.stats.unique.fetch_add(1, Ordering::Relaxed);
            unique.push(record);
        }

        if self.config.enable_logging {
            info!(output = unique.len(), duplicates, "deduplication completed");
        }

        Ok(unique)
    }

    fn is_duplicate(&self, record: &Record) -> ProcessResult<bool> {
        let key = self.fingerprint(record)?;
        let now = Utc::now();
        let window = Duration::seconds(self.config.time_window_secs as i64);

        let mut cache = self.cache.lock().expect("dedup cache lock poisoned");

        if let Some(seen_at) = cache.get(&key).copied() {
            match self.config.strategy {
                DedupStrategy::TimeWindow => {
                    if now - seen_at < window {
                        return Ok(true);
                    }
                    // Outside the window: accept and restart the clock.
                    cache.remove(&key);
                }
                _ => return Ok(true),
            }
        }

        cache.insert(key, now);
        if cache.len() > self.config.cache_size {
            evict_oldest(&mut cache);
        }

        Ok(false)
    }

    /// MD5 over the canonical JSON of the record, or of its projection
    /// to the configured fields for `field_based`.
    fn fingerprint(&self, record: &Record) -> ProcessResult<String> {
        let json = match self.config.strategy {
            DedupStrategy::ContentHash | DedupStrategy::TimeWindow => {
                serde_json::to_string(record)?
            }
            DedupStrategy::FieldBased => {
                if self.config.fields.is_empty() {
                    return Err(ProcessError::NoDedupFields);
                }
                let projection: BTreeMap<&str, &serde_json::Value> = self
                    .config
                    .fields
                    .iter()
                    .filter_map(|f| record.get(f).map(|v| (f.as_str(), v)))
                    .collect();
                serde_json::to_string(&projection)?
            }
        };

        Ok(format!("{:x}", md5::compute(json.as_bytes())))
    }

    /// Remove entries older than the time window.
    fn sweep(&self) {
        let cutoff = Utc::now() - Duration::seconds(self.config.time_window_secs as i64);
        let mut cache = self.cache.lock().expect("dedup cache lock poisoned");
        let before = cache.len();
        cache.retain(|_, seen_at| *seen_at >= cutoff);
        let removed = before - cache.len();
        if removed > 0 {
            debug!(removed, "dedup cache sweep removed expired entries");
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_processed: self.stats.total_processed.load(Ordering::Relaxed),
            duplicates: self.stats.duplicates.load(Ordering::Relaxed),
            unique: self.stats.unique.load(Ordering::Relaxed),
        }
    }

    pub fn reset_stats(&self) {
        self.stats.total_processed.store(0, Ordering::Relaxed);
        self.stats.duplicates.store(0, Ordering::Relaxed);
        self.stats.unique.store(0, Ordering::Relaxed);
    }

    pub fn clear_cache(&self) {
        self.cache
            .lock()
            .expect("dedup cache lock poisoned")
            .clear();
    }

    /// Stop the background sweeper.
    pub fn close(&self) {
        self.sweeper.cancel();
    }

    #[cfg(test)]
    fn backdate(&self, record: &Record, age: Duration) {
        let key = self.fingerprint(record).unwrap();
        let mut cache = self.cache.lock().unwrap();
        if let Some(seen_at) = cache.get_mut(&key) {
            *seen_at -= age;
        }
    }
}

impl Drop for Deduplicator {
    fn drop(&mut self) {
        self.sweeper.cancel();
    }
}

fn evict_oldest(cache: &mut HashMap<String, DateTime<Utc>>) {
    // O(n) scan; acceptable at the cache sizes this runs with.
    if let Some(oldest) = cache
        .iter()
        .min_by_key(|(_, seen_at)| **seen_at)
        .map(|(key, _)| key.clone())
    {
        cache.remove(&oldest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::record_from;
    use serde_json::json;

    fn config(strategy: DedupStrategy) -> DeduplicatorConfig {
        DeduplicatorConfig {
            strategy,
            ..DeduplicatorConfig::default()
        }
    }

    #[tokio::test]
    async fn test_content_hash_second_pass_yields_nothing() {
        let dedup = Deduplicator::new(config(DedupStrategy::ContentHash));
        let record = record_from([("id", json!(1)), ("name", json!("Alice"))]);

        let first = dedup.deduplicate(vec![record.clone()]).unwrap();
        assert_eq!(first.len(), 1);

        let second = dedup.deduplicate(vec![record]).unwrap();
        assert_eq!(second.len(), 0);
        dedup.close();
    }

    #[tokio::test]
    async fn test_key_order_does_not_defeat_dedup() {
        let dedup = Deduplicator::new(config(DedupStrategy::ContentHash));
        let a = record_from([("a", json!(1)), ("b", json!(2))]);
        let b = record_from([("b", json!(2)), ("a", json!(1))]);

        let out = dedup.deduplicate(vec![a, b]).unwrap();
        assert_eq!(out.len(), 1);
        dedup.close();
    }

    #[tokio::test]
    async fn test_field_based_projection() {
        let mut cfg = config(DedupStrategy::FieldBased);
        cfg.fields = vec!["email".to_string()];
        let dedup = Deduplicator::new(cfg);

        let records = vec![
            record_from([("id", json!(1)), ("email", json!("a@x.com"))]),
            record_from([("id", json!(2)), ("email", json!("b@x.com"))]),
            record_from([("id", json!(3)), ("email", json!("a@x.com"))]),
        ];

        let out = dedup.deduplicate(records).unwrap();
        assert_eq!(out.len(), 2);

        let stats = dedup.stats();
        assert_eq!(stats.total_processed, 3);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.unique, 2);
        dedup.close();
    }

    #[tokio::test]
    async fn test_field_based_without_fields_fails() {
        let dedup = Deduplicator::new(config(DedupStrategy::FieldBased));
        let records = vec![record_from([("id", json!(1))])];

        assert!(matches!(
            dedup.deduplicate(records),
            Err(ProcessError::NoDedupFields)
        ));
        dedup.close();
    }

    #[tokio::test]
    async fn test_time_window_readmits_after_expiry() {
        let mut cfg = config(DedupStrategy::TimeWindow);
        cfg.time_window_secs = 60;
        let dedup = Deduplicator::new(cfg);
        let record = record_from([("id", json!(1))]);

        assert_eq!(dedup.deduplicate(vec![record.clone()]).unwrap().len(), 1);
        assert_eq!(dedup.deduplicate(vec![record.clone()]).unwrap().len(), 0);

        dedup.backdate(&record, Duration::seconds(120));
        assert_eq!(dedup.deduplicate(vec![record]).unwrap().len(), 1);
        dedup.close();
    }

    #[tokio::test]
    async fn test_cache_overflow_evicts_oldest() {
        let mut cfg = config(DedupStrategy::ContentHash);
        cfg.cache_size = 2;
        let dedup = Deduplicator::new(cfg);

        let r1 = record_from([("id", json!(1))]);
        let r2 = record_from([("id", json!(2))]);
        let r3 = record_from([("id", json!(3))]);

        dedup.deduplicate(vec![r1.clone()]).unwrap();
        dedup.backdate(&r1, Duration::seconds(10));
        dedup.deduplicate(vec![r2, r3]).unwrap();

        // r1 was evicted as oldest, so it is accepted again.
        assert_eq!(dedup.deduplicate(vec![r1]).unwrap().len(), 1);
        dedup.close();
    }

    #[tokio::test]
    async fn test_duplicate_rate() {
        let dedup = Deduplicator::new(config(DedupStrategy::ContentHash));
        let record = record_from([("id", json!(1))]);

        dedup.deduplicate(vec![record.clone(), record]).unwrap();
        let stats = dedup.stats();
        assert!((stats.duplicate_rate() - 50.0).abs() < f64::EPSILON);

        dedup.reset_stats();
        assert_eq!(dedup.stats().total_processed, 0);
        dedup.close();
    }
}
