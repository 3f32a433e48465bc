//! Log index.
//!
//! Entries are queued on ingestion and indexed together once `batch_size` of
//! them are waiting. With a background flusher attached
//! ([`LogIndex::set_background_flush`]) a full batch only wakes the flusher
//! through [`LogIndex::batch_signal`], so ingestion stays a queue push; the
//! backlog is capped and the oldest queued entries are dropped once the
//! flusher falls behind. Without one, the caller that fills a batch indexes it.
//! Every indexed dimension (level, category, correlation id, tag, hour bucket)
//! keeps its own postings set and searches intersect them before inspecting
//! candidates.
//!
//! Retention is enforced by count and by age after every batch. Evicted
//! entries are removed from each postings set they appear in, so no posting
//! ever refers to an entry that is gone.

mod entry;
mod index;
mod layer;
mod query;

pub use entry::{LogContext, LogEntry, LogError, LogLevel, LogPerformance};
pub use layer::LogIndexLayer;
pub use query::{LogQuery, SearchAggregations, SearchResult, SortOrder, TimeBucket};

use crate::clock::{to_chrono, SharedClock};
use crate::config::LogIndexConfig;
use crate::error::{Error, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use entry::hour_bucket;
use index::{intersect, IndexStore};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

const MAX_TIME_BUCKETS: usize = 10_000;
/// Queued batches kept while the background flusher is behind.
pub const MAX_PENDING_BATCHES: usize = 20;
const TOP_TAGS: usize = 10;

/// Counters describing the index.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LogIndexStats {
    /// Indexed entries.
    pub entries: usize,
    /// Entries waiting for the next batch.
    pub pending: usize,
    /// Entries accepted since start.
    pub ingested: u64,
    /// Entries removed by retention.
    pub evicted: u64,
    /// Queued entries dropped because the backlog was full.
    pub dropped: u64,
    /// Timestamp of the oldest indexed entry.
    pub oldest: Option<DateTime<Utc>>,
}

/// Searchable in-memory log store.
pub struct LogIndex {
    config: RwLock<LogIndexConfig>,
    clock: SharedClock,
    pending: Mutex<Vec<LogEntry>>,
    store: RwLock<IndexStore>,
    next_id: AtomicU64,
    ingested: AtomicU64,
    evicted: AtomicU64,
    dropped: AtomicU64,
    background_flush: AtomicBool,
    batch_ready: Arc<Notify>,
}

impl LogIndex {
    /// Creates an empty index.
    pub fn new(config: LogIndexConfig, clock: SharedClock) -> Self {
        Self {
            config: RwLock::new(config),
            clock,
            pending: Mutex::new(Vec::new()),
            store: RwLock::new(IndexStore::default()),
            next_id: AtomicU64::new(1),
            ingested: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            background_flush: AtomicBool::new(false),
            batch_ready: Arc::new(Notify::new()),
        }
    }

    /// Hands full batches to a background flusher instead of indexing them on
    /// the ingesting thread.
    pub fn set_background_flush(&self, enabled: bool) {
        self.background_flush.store(enabled, Ordering::SeqCst);
    }

    /// Notified whenever a full batch is waiting for the background flusher.
    pub fn batch_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.batch_ready)
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Replaces the configuration. Tighter retention applies on the next batch.
    pub fn update_config(&self, config: LogIndexConfig) {
        *self.config.write() = config;
    }

    /// Current configuration.
    pub fn config(&self) -> LogIndexConfig {
        self.config.read().clone()
    }

    /// Queues an entry. A full batch wakes the background flusher, or is
    /// indexed right away when none is attached.
    pub fn ingest(&self, mut entry: LogEntry) {
        let (enabled, batch_size) = {
            let config = self.config.read();
            (config.enabled, config.batch_size)
        };
        if !enabled {
            return;
        }
        entry.id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.ingested.fetch_add(1, Ordering::Relaxed);

        let background = self.background_flush.load(Ordering::SeqCst);
        let batch = {
            let mut pending = self.pending.lock();
            pending.push(entry);
            if pending.len() < batch_size {
                None
            } else if background {
                let cap = batch_size.saturating_mul(MAX_PENDING_BATCHES);
                if pending.len() > cap {
                    let excess = pending.len() - cap;
                    pending.drain(..excess);
                    self.dropped.fetch_add(excess as u64, Ordering::Relaxed);
                }
                Some(Vec::new())
            } else {
                Some(std::mem::take(&mut *pending))
            }
        };
        match batch {
            Some(batch) if batch.is_empty() => self.batch_ready.notify_one(),
            Some(batch) => self.index_batch(batch),
            None => {}
        }
    }

    /// Builds an entry stamped with the current time and ingests it.
    pub fn log(&self, level: LogLevel, message: impl Into<String>, context: LogContext) {
        self.ingest(LogEntry::new(level, message, self.clock.now()).with_context(context));
    }

    /// Indexes every queued entry. Returns how many were indexed.
    pub fn flush(&self) -> usize {
        let batch = std::mem::take(&mut *self.pending.lock());
        let count = batch.len();
        if count > 0 {
            self.index_batch(batch);
        }
        count
    }

    fn index_batch(&self, batch: Vec<LogEntry>) {
        let count = batch.len();
        let mut store = self.store.write();
        for entry in batch {
            store.insert(entry);
        }
        let evicted = self.enforce_retention_locked(&mut store);
        crate::utils::metrics::set_log_index_size(store.len());
        debug!(indexed = count, evicted, total = store.len(), "Log batch indexed");
    }

    /// Applies count and age retention. Returns how many entries were evicted.
    pub fn enforce_retention(&self) -> usize {
        let mut store = self.store.write();
        let evicted = self.enforce_retention_locked(&mut store);
        crate::utils::metrics::set_log_index_size(store.len());
        evicted
    }

    fn enforce_retention_locked(&self, store: &mut IndexStore) -> usize {
        let (max_entries, max_age) = {
            let config = self.config.read();
            (config.max_entries, config.max_age())
        };
        let cutoff = self.clock.now() - to_chrono(max_age);

        let expired = store.expired_before(cutoff);
        let mut evicted = 0;
        for id in expired {
            if store.remove(id) {
                evicted += 1;
            }
        }

        while store.len() > max_entries {
            let Some(oldest) = store.entries.keys().next().copied() else {
                break;
            };
            store.remove(oldest);
            evicted += 1;
        }

        if evicted > 0 {
            self.evicted.fetch_add(evicted as u64, Ordering::Relaxed);
        }
        evicted
    }

    /// Searches indexed entries. Queued entries are not visible until flushed.
    pub fn search(&self, query: &LogQuery) -> SearchResult {
        let limit = query.limit.unwrap_or_else(|| self.config.read().default_page_size);
        let text_lower = query.text.as_ref().map(|t| t.to_lowercase());
        let store = self.store.read();

        let used_index = query.has_indexed_criterion();
        let candidates: Vec<u64> = if used_index {
            let mut sets: Vec<BTreeSet<u64>> = Vec::new();
            if let Some(level) = query.level {
                sets.push(store.level_postings(level));
            }
            if let Some(min) = query.min_level {
                sets.push(store.min_level_postings(min));
            }
            if let Some(category) = &query.category {
                sets.push(store.category_postings(category));
            }
            if let Some(id) = &query.correlation_id {
                sets.push(store.correlation_postings(id));
            }
            for tag in &query.tags {
                sets.push(store.tag_postings(tag));
            }
            if let (Some(start), Some(end)) = (query.start, query.end) {
                if start > end {
                    sets.push(BTreeSet::new());
                } else {
                    sets.push(store.hour_postings(hour_bucket(start), hour_bucket(end)));
                }
            }
            intersect(sets).into_iter().collect()
        } else {
            store.entries.keys().copied().collect()
        };

        let mut matches: Vec<&Arc<LogEntry>> = candidates
            .iter()
            .filter_map(|id| store.entries.get(id))
            .filter(|entry| query.inspect(entry, text_lower.as_deref()))
            .collect();

        let aggregations = aggregate(&matches);
        match query.order {
            SortOrder::NewestFirst => matches.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id))),
            SortOrder::OldestFirst => matches.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id))),
        }

        let total = matches.len();
        let entries: Vec<LogEntry> = matches
            .iter()
            .skip(query.offset)
            .take(limit)
            .map(|entry| LogEntry::clone(entry))
            .collect();

        SearchResult {
            has_more: query.offset.saturating_add(entries.len()) < total,
            entries,
            total,
            offset: query.offset,
            limit,
            aggregations,
            used_index,
        }
    }

    /// Per-bucket counts of indexed entries between `start` (inclusive) and `end` (exclusive).
    pub fn time_window_stats(&self, start: DateTime<Utc>, end: DateTime<Utc>, bucket: Duration) -> Result<Vec<TimeBucket>> {
        if bucket.is_zero() {
            return Err(Error::other("time window bucket size must be positive"));
        }
        if end <= start {
            return Ok(Vec::new());
        }
        // A bucket wider than the window collapses to one bucket covering it
        let span_ms = (end - start).num_milliseconds().max(1);
        let bucket_ms = (bucket.as_millis().min(span_ms as u128) as i64).max(1);
        let bucket_count = span_ms / bucket_ms + i64::from(span_ms % bucket_ms != 0);
        let bucket_count = usize::try_from(bucket_count).unwrap_or(usize::MAX);
        if bucket_count > MAX_TIME_BUCKETS {
            return Err(Error::other(format!(
                "time window needs {} buckets, at most {} are allowed",
                bucket_count, MAX_TIME_BUCKETS
            )));
        }

        let offset = |i: usize| ChronoDuration::milliseconds(bucket_ms.saturating_mul(i as i64));
        let mut buckets: Vec<TimeBucket> = (0..bucket_count)
            .map(|i| {
                let bucket_start = start.checked_add_signed(offset(i)).unwrap_or(end);
                TimeBucket {
                    start: bucket_start,
                    end: start.checked_add_signed(offset(i + 1)).map_or(end, |e| e.min(end)),
                    total: 0,
                    by_level: BTreeMap::new(),
                    errors: 0,
                }
            })
            .collect();

        let store = self.store.read();
        let ids = store.hour_postings(hour_bucket(start), hour_bucket(end));
        for id in ids {
            let Some(entry) = store.entries.get(&id) else {
                continue;
            };
            if entry.timestamp < start || entry.timestamp >= end {
                continue;
            }
            let index = ((entry.timestamp - start).num_milliseconds() / bucket_ms) as usize;
            if let Some(bucket) = buckets.get_mut(index) {
                bucket.total += 1;
                *bucket.by_level.entry(entry.level).or_insert(0) += 1;
                if entry.level.is_error() {
                    bucket.errors += 1;
                }
            }
        }
        Ok(buckets)
    }

    /// One indexed entry.
    pub fn get(&self, id: u64) -> Option<LogEntry> {
        self.store.read().entries.get(&id).map(|e| LogEntry::clone(e))
    }

    /// Indexed entry count.
    pub fn len(&self) -> usize {
        self.store.read().len()
    }

    /// Whether nothing is indexed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries waiting for the next batch.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Counters.
    pub fn stats(&self) -> LogIndexStats {
        let store = self.store.read();
        LogIndexStats {
            entries: store.len(),
            pending: self.pending_len(),
            ingested: self.ingested.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            oldest: store.entries.values().map(|e| e.timestamp).min(),
        }
    }

    /// Rebuilds every postings set from the retained entries.
    pub fn rebuild_index(&self) {
        let mut store = self.store.write();
        store.rebuild();
        debug!(entries = store.len(), "Log index rebuilt");
    }

    /// Lists postings that disagree with the retained entries. Empty when consistent.
    pub fn check_consistency(&self) -> Vec<String> {
        let problems = self.store.read().consistency_problems();
        if !problems.is_empty() {
            warn!(problems = problems.len(), "Log index inconsistent");
        }
        problems
    }

    /// Drops every entry, indexed or queued.
    pub fn clear(&self) {
        self.pending.lock().clear();
        *self.store.write() = IndexStore::default();
    }
}

fn aggregate(matches: &[&Arc<LogEntry>]) -> SearchAggregations {
    let mut by_level = BTreeMap::new();
    let mut by_category = BTreeMap::new();
    let mut tags: HashMap<&str, usize> = HashMap::new();
    for entry in matches {
        *by_level.entry(entry.level).or_insert(0) += 1;
        if let Some(category) = &entry.context.category {
            *by_category.entry(category.clone()).or_insert(0) += 1;
        }
        for tag in &entry.tags {
            *tags.entry(tag.as_str()).or_insert(0) += 1;
        }
    }
    let mut top_tags: Vec<(String, usize)> = tags.into_iter().map(|(t, c)| (t.to_string(), c)).collect();
    top_tags.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    top_tags.truncate(TOP_TAGS);
    SearchAggregations {
        by_level,
        by_category,
        top_tags,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};

    fn index_with(config: LogIndexConfig) -> (LogIndex, ManualClock) {
        let clock = ManualClock::at_epoch_2024();
        (LogIndex::new(config, Arc::new(clock.clone())), clock)
    }

    fn index() -> (LogIndex, ManualClock) {
        index_with(LogIndexConfig {
            batch_size: 10,
            ..LogIndexConfig::default()
        })
    }

    #[test]
    fn test_batches_until_flush() {
        let (index, clock) = index();
        for i in 0..15 {
            index.ingest(LogEntry::new(LogLevel::Info, format!("line {}", i), clock.now()));
        }
        assert_eq!(index.len(), 10);
        assert_eq!(index.pending_len(), 5);
        assert_eq!(index.flush(), 5);
        assert_eq!(index.len(), 15);
        assert_eq!(index.flush(), 0);
    }

    #[test]
    fn test_count_retention_evicts_oldest() {
        let (index, clock) = index_with(LogIndexConfig {
            max_entries: 100,
            ..LogIndexConfig::default()
        });
        for i in 0..150 {
            let entry = LogEntry::new(LogLevel::Info, format!("line {}", i), clock.now())
                .with_context(LogContext::new().with_category("content"))
                .with_tag(format!("batch-{}", i / 50));
            index.ingest(entry);
            clock.advance(Duration::from_millis(10));
        }
        index.flush();

        assert_eq!(index.len(), 100);
        assert_eq!(index.stats().evicted, 50);
        assert!(index.check_consistency().is_empty());

        let oldest = index.search(&LogQuery::new().page(0, 1).category("content"));
        assert_eq!(oldest.total, 100);
        let first = index.search(&LogQuery {
            order: SortOrder::OldestFirst,
            limit: Some(1),
            ..LogQuery::default()
        });
        assert_eq!(first.entries[0].message, "line 50");
        // Every entry tagged batch-0 was among the evicted
        assert_eq!(index.search(&LogQuery::new().tag("batch-0")).total, 0);
    }

    #[test]
    fn test_age_retention() {
        let (index, clock) = index_with(LogIndexConfig {
            batch_size: 1,
            max_age_secs: 60,
            ..LogIndexConfig::default()
        });
        index.ingest(LogEntry::new(LogLevel::Info, "old", clock.now()));
        clock.advance(Duration::from_secs(61));
        index.ingest(LogEntry::new(LogLevel::Info, "new", clock.now()));
        assert_eq!(index.len(), 1);
        assert!(index.check_consistency().is_empty());
    }

    #[test]
    fn test_age_retention_with_out_of_order_timestamps() {
        let (index, clock) = index_with(LogIndexConfig {
            batch_size: 2,
            max_age_secs: 3_600,
            ..LogIndexConfig::default()
        });
        let now = clock.now();
        // The older entry carries the higher sequence id
        index.ingest(LogEntry::new(LogLevel::Info, "fresh", now));
        index.ingest(LogEntry::new(LogLevel::Info, "backfilled", now - chrono::Duration::minutes(90)));
        assert_eq!(index.len(), 1);
        let kept = index.search(&LogQuery::new());
        assert_eq!(kept.entries[0].message, "fresh");
        assert_eq!(index.stats().evicted, 1);
        assert!(index.check_consistency().is_empty());
    }

    #[tokio::test]
    async fn test_background_flush_defers_full_batches() {
        let (index, clock) = index();
        index.set_background_flush(true);
        let signal = index.batch_signal();
        for i in 0..10 {
            index.ingest(LogEntry::new(LogLevel::Info, format!("line {}", i), clock.now()));
        }
        assert_eq!(index.len(), 0);
        assert_eq!(index.pending_len(), 10);
        // The wake-up is stored even though nobody was waiting yet
        assert!(tokio::time::timeout(Duration::from_millis(50), signal.notified()).await.is_ok());
        assert_eq!(index.flush(), 10);
        assert_eq!(index.len(), 10);
    }

    #[test]
    fn test_stalled_background_flush_keeps_backlog_bounded() {
        let (index, clock) = index_with(LogIndexConfig {
            batch_size: 2,
            ..LogIndexConfig::default()
        });
        index.set_background_flush(true);
        for i in 0..100 {
            index.ingest(LogEntry::new(LogLevel::Info, format!("line {}", i), clock.now()));
        }
        assert_eq!(index.pending_len(), 2 * MAX_PENDING_BATCHES);
        assert_eq!(index.stats().dropped, 100 - 2 * MAX_PENDING_BATCHES as u64);
        assert_eq!(index.stats().ingested, 100);

        index.flush();
        let oldest = index.search(&LogQuery {
            order: SortOrder::OldestFirst,
            limit: Some(1),
            ..LogQuery::default()
        });
        assert_eq!(oldest.entries[0].message, "line 60");
    }

    #[test]
    fn test_window_stats_bucket_edges() {
        let (index, clock) = index();
        let start = clock.now();
        index.ingest(LogEntry::new(LogLevel::Error, "boom", start + chrono::Duration::minutes(5)));
        index.flush();
        let end = start + chrono::Duration::hours(1);

        // Wider than the window: one bucket spanning it
        let buckets = index.time_window_stats(start, end, Duration::from_secs(u64::MAX)).unwrap();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].start, start);
        assert_eq!(buckets[0].end, end);
        assert_eq!(buckets[0].errors, 1);

        // A partial last bucket ends at the window end
        let buckets = index.time_window_stats(start, end, Duration::from_secs(25 * 60)).unwrap();
        assert_eq!(buckets.len(), 3);
        assert_eq!(buckets[2].end, end);

        assert!(index.time_window_stats(start, end, Duration::from_nanos(1)).is_err());
    }

    #[test]
    fn test_search_intersects_criteria() {
        let (index, clock) = index();
        let request = LogContext::new().with_category("content").with_correlation_id("req-7");
        index.ingest(LogEntry::new(LogLevel::Error, "Save failed: disk full", clock.now()).with_context(request.clone()));
        index.ingest(LogEntry::new(LogLevel::Info, "Save started", clock.now()).with_context(request));
        index.ingest(
            LogEntry::new(LogLevel::Error, "Upload failed", clock.now())
                .with_context(LogContext::new().with_category("media").with_correlation_id("req-8")),
        );
        index.flush();

        let result = index.search(&LogQuery::new().min_level(LogLevel::Error).correlation("req-7"));
        assert!(result.used_index);
        assert_eq!(result.total, 1);
        assert_eq!(result.entries[0].message, "Save failed: disk full");

        let result = index.search(&LogQuery::new().text("FAILED"));
        assert!(!result.used_index);
        assert_eq!(result.total, 2);
        assert_eq!(result.aggregations.by_category.get("media"), Some(&1));
        assert_eq!(result.aggregations.by_level.get(&LogLevel::Error), Some(&2));

        let result = index.search(&LogQuery::new().category("content").text("started"));
        assert_eq!(result.total, 1);
    }

    #[test]
    fn test_pagination() {
        let (index, clock) = index();
        for i in 0..25 {
            index.ingest(LogEntry::new(LogLevel::Info, format!("line {}", i), clock.now()));
            clock.advance(Duration::from_secs(1));
        }
        index.flush();

        let page = index.search(&LogQuery::new().page(20, 10));
        assert_eq!(page.total, 25);
        assert_eq!(page.entries.len(), 5);
        assert!(!page.has_more);
        // Newest first
        assert_eq!(page.entries[0].message, "line 4");

        let page = index.search(&LogQuery::new().page(0, 10));
        assert!(page.has_more);
        assert_eq!(page.entries[0].message, "line 24");
    }

    #[test]
    fn test_time_range_search_and_window_stats() {
        let (index, clock) = index();
        let start = clock.now();
        for i in 0..6 {
            let level = if i % 3 == 0 { LogLevel::Error } else { LogLevel::Info };
            index.ingest(LogEntry::new(level, "tick", clock.now()));
            clock.advance(Duration::from_secs(30 * 60));
        }
        index.flush();

        let hour_one = index.search(&LogQuery::new().between(start, start + chrono::Duration::minutes(59)));
        assert!(hour_one.used_index);
        assert_eq!(hour_one.total, 2);

        let buckets = index
            .time_window_stats(start, start + chrono::Duration::hours(3), Duration::from_secs(3_600))
            .unwrap();
        assert_eq!(buckets.len(), 3);
        assert!(buckets.iter().all(|b| b.total == 2));
        assert_eq!(buckets[0].errors, 1);
        assert_eq!(buckets[1].errors, 1);

        assert!(index.time_window_stats(start, start, Duration::from_secs(60)).unwrap().is_empty());
        assert!(index.time_window_stats(start, clock.now(), Duration::ZERO).is_err());
    }

    #[test]
    fn test_rebuild_index_keeps_results() {
        let (index, clock) = index();
        index.ingest(LogEntry::new(LogLevel::Warn, "slow", clock.now()).with_tag("perf"));
        index.flush();
        index.rebuild_index();
        assert_eq!(index.search(&LogQuery::new().tag("perf")).total, 1);
        assert!(index.check_consistency().is_empty());
    }

    #[test]
    fn test_disabled_index_drops_entries() {
        let (index, clock) = index_with(LogIndexConfig {
            enabled: false,
            ..LogIndexConfig::default()
        });
        index.ingest(LogEntry::new(LogLevel::Info, "ignored", clock.now()));
        index.flush();
        assert!(index.is_empty());
    }
}
