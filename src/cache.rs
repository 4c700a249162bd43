//! The write-coalescing counter cache.
//!
//! # Architecture
//!
//! A [`CounterCache`] owns two maps from key to a shared [`CounterCell`]:
//!
//! ```text
//!                 update(key, delta)
//!                        │
//!                        ▼
//!   ┌──────────────────────────────────────┐   hit: fetch_add, no lock
//!   │ Fast map (ArcSwap, immutable)        │ ─────────────────────────►
//!   └──────────────────────────────────────┘
//!                        │ miss
//!                        ▼  lock
//!   ┌──────────────────────────────────────┐   hit: record miss, fetch_add
//!   │ Staging map + miss counter (Mutex)   │ ─────────────────────────►
//!   └──────────────────────────────────────┘
//!                        │ absent
//!                        ▼
//!                 insert new cell
//! ```
//!
//! The fast map is never mutated in place. Promotion and commit build a new
//! map and publish it with a single atomic pointer swap, so readers only ever
//! see complete snapshots. The staging map and the miss counter are owned by
//! whoever holds the staging lock. A key lives in at most one of the two maps
//! at any time.
//!
//! # Promotion
//!
//! Every update that has to take the lock and finds its key in staging counts
//! as a miss. Once misses reach the staging map's size (scaled by the
//! configured promotion ratio), the whole staging map is merged into a clone of
//! the fast map, which is then published. Hot keys therefore migrate to the
//! lock-free path after a bounded number of slow accesses.
//!
//! # Commit
//!
//! [`CounterCache::commit`] drains every cell with an atomic swap to zero while
//! holding the staging lock, publishes the next fast map, releases the lock and
//! only then writes one batch to the store. Updates are never blocked by
//! network latency.
//!
//! Cells are deleted lazily. A zero cell found in the fast map is moved to
//! staging instead of being dropped, and is deleted only if it is still zero at
//! the next commit. An update holding a stale fast snapshot can still land on
//! the cell after the zeroing swap; the deferred deletion keeps that increment
//! reachable by the next commit. A zero staging cell that is still shared with
//! a superseded snapshot (its `Arc` strong count is above one) is kept as
//! well, so even an update stalled across several commits is never lost.
//!
//! # Single Committer
//!
//! `commit` must not run concurrently with itself. Two overlapping commits race
//! on the fast map republication and can drop cells that still hold deltas.
//! Drive commits from a single task, typically a periodic timer.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::cell::{CounterCell, Number};
use crate::config::CacheConfig;
use crate::error::Result;
use crate::stats::{CacheStats, Event, StatsRecorder};
use crate::store::{CounterStore, WriteBatch};

type CellMap<K, V> = HashMap<K, Arc<CounterCell<V>>>;

/// The lock-protected half of the cache.
struct Staging<K, V: Number> {
    map: CellMap<K, V>,
    misses: usize,
}

/// Outcome of one [`CounterCache::commit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommitReport {
    /// Increment operations sent to the store.
    pub written: usize,
    /// Cells deleted because they were zero while in staging.
    pub evicted: usize,
    /// Zero staging cells kept because an older fast snapshot still
    /// references them.
    pub retained: usize,
    /// Zero cells moved from the fast map to staging.
    pub demoted: usize,
    /// Whether the staging map seeded the new fast map.
    pub promoted: bool,
    /// Size of the published fast map.
    pub fast_len: usize,
    /// Size of the staging map once the drain finished.
    pub staging_len: usize,
}

/// Deltas captured under the staging lock, waiting to be written.
struct Drained<K, V> {
    pending: Vec<(K, V)>,
    report: CommitReport,
}

/// An in-memory cache coalescing per-key deltas into periodic batched writes.
///
/// * `K` identifies a logical counter and is mapped to a remote document by the
///   function given at construction.
/// * `V` is the counter width: `i32`, `u32`, `i64` or `u64`.
/// * `S` is the remote [`CounterStore`].
///
/// The cache is `Send + Sync` and is meant to be shared through an `Arc`.
///
/// # Examples
///
/// ```rust
/// use coalesce::store::memory::MemoryStore;
/// use coalesce::CounterCache;
///
/// # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
/// let store = MemoryStore::<i64>::new();
/// let cache = CounterCache::new(store.clone(), |post: &u64| format!("posts/{post}"), "likes");
///
/// cache.update(7, 1);
/// cache.update(7, 1);
/// cache.update(9, -1);
///
/// let report = cache.commit().await.unwrap();
/// assert_eq!(report.written, 2);
/// assert_eq!(store.value("posts/7", "likes"), 2);
/// assert_eq!(store.value("posts/9", "likes"), -1);
/// # });
/// ```
pub struct CounterCache<K, V: Number, S> {
    fast: ArcSwap<CellMap<K, V>>,
    staging: Mutex<Staging<K, V>>,
    doc_id: Box<dyn Fn(&K) -> String + Send + Sync>,
    config: CacheConfig,
    store: S,
    stats: StatsRecorder,
}

impl<K, V, S> CounterCache<K, V, S>
where
    K: Eq + Hash + Clone,
    V: Number,
{
    /// Creates a cache writing to `field_name` with the default promotion
    /// ratio.
    ///
    /// `doc_id` maps a key to the identifier of the remote document holding its
    /// counter. It is called once per written key and commit, outside of any
    /// lock. The field name is passed to the store as is; use
    /// [`CounterCache::with_config`] to validate untrusted settings.
    pub fn new<F>(store: S, doc_id: F, field_name: impl Into<String>) -> Self
    where
        F: Fn(&K) -> String + Send + Sync + 'static,
    {
        Self::build(store, Box::new(doc_id), CacheConfig::new(field_name))
    }

    /// Creates a cache from a validated [`CacheConfig`].
    pub fn with_config<F>(store: S, doc_id: F, config: CacheConfig) -> Result<Self>
    where
        F: Fn(&K) -> String + Send + Sync + 'static,
    {
        config.validate()?;
        Ok(Self::build(store, Box::new(doc_id), config))
    }

    fn build(
        store: S,
        doc_id: Box<dyn Fn(&K) -> String + Send + Sync>,
        config: CacheConfig,
    ) -> Self {
        Self {
            fast: ArcSwap::from_pointee(HashMap::new()),
            staging: Mutex::new(Staging {
                map: HashMap::new(),
                misses: 0,
            }),
            doc_id,
            config,
            store,
            stats: StatsRecorder::new(),
        }
    }

    /// Records `delta` against `key`.
    ///
    /// Returns the counter's value immediately before this contribution, or
    /// `delta` itself when the key was not cached yet. Never fails and never
    /// performs I/O.
    ///
    /// The common case, a key already in the fast map, is a lock-free load of
    /// the snapshot followed by one atomic add. Otherwise the staging lock is
    /// taken; a staging hit counts as a miss and may promote the staging map.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use coalesce::store::memory::MemoryStore;
    /// use coalesce::CounterCache;
    ///
    /// let cache = CounterCache::new(MemoryStore::<u32>::new(), |k: &&str| k.to_string(), "hits");
    /// assert_eq!(cache.update("home", 3), 3);
    /// assert_eq!(cache.update("home", 2), 3);
    /// assert_eq!(cache.get(&"home"), Some(5));
    /// ```
    pub fn update(&self, key: K, delta: V) -> V {
        if let Some(cell) = self.fast.load().get(&key) {
            self.stats.record(Event::FastHit);
            return cell.fetch_add(delta);
        }

        let mut staging = self.staging.lock();

        // A promotion may have published the key since the first load.
        if let Some(cell) = self.fast.load().get(&key) {
            self.stats.record(Event::RecheckHit);
            return cell.fetch_add(delta);
        }

        // Adds below happen before the guard drops so that a commit cannot
        // evict the cell between the lookup and the add.
        if let Some(cell) = staging.map.get(&key).cloned() {
            self.stats.record(Event::StagingHit);
            self.record_miss(&mut staging);
            return cell.fetch_add(delta);
        }

        staging.map.insert(key, Arc::new(CounterCell::new(delta)));
        self.stats.record(Event::Insert);
        delta
    }

    /// Counts one staging hit and promotes the staging map once misses reach
    /// the threshold. Caller holds the staging lock.
    fn record_miss(&self, staging: &mut Staging<K, V>) {
        staging.misses += 1;
        self.stats.record(Event::Miss);
        if !self.config.should_promote(staging.misses, staging.map.len()) {
            return;
        }

        let moved = staging.map.len();
        let mut promoted: CellMap<K, V> = (**self.fast.load()).clone();
        promoted.extend(std::mem::take(&mut staging.map));
        let fast_len = promoted.len();
        self.fast.store(Arc::new(promoted));
        staging.misses = 0;

        self.stats.record(Event::Promotion);
        trace!(moved, fast_len, "promoted staging map");
    }

    /// Returns the current un-flushed value for `key`, if the key is cached.
    pub fn get(&self, key: &K) -> Option<V> {
        if let Some(cell) = self.fast.load().get(key) {
            return Some(cell.load());
        }
        let staging = self.staging.lock();
        if let Some(cell) = self.fast.load().get(key) {
            return Some(cell.load());
        }
        staging.map.get(key).map(|cell| cell.load())
    }

    /// Returns `true` if `key` has a live counter.
    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Number of live counters in both maps.
    pub fn len(&self) -> usize {
        let staging = self.staging.lock();
        self.fast.load().len() + staging.map.len()
    }

    /// Returns `true` if no counter is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a snapshot of the cache's map sizes and activity counters.
    pub fn stats(&self) -> CacheStats {
        let staging = self.staging.lock();
        self.stats
            .snapshot(self.fast.load().len(), staging.map.len(), staging.misses)
    }

    /// Returns the configuration the cache was built with.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Returns the remote store handle.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Swaps every cell to zero and reorganizes both maps for the next cycle.
    ///
    /// Runs entirely under the staging lock; returns the captured deltas in a
    /// form that needs no shared state to be written.
    fn drain(&self) -> Drained<K, V> {
        let mut staging = self.staging.lock();
        let mut pending = Vec::new();
        let mut report = CommitReport::default();

        // Staging cells already had their first chance: zero means delete,
        // unless a superseded fast snapshot still held by an updater shares
        // the cell. Such a cell survives until the last snapshot is gone.
        staging.map.retain(|key, cell| {
            let value = cell.take();
            if value.is_zero() {
                if Arc::strong_count(cell) > 1 {
                    report.retained += 1;
                    return true;
                }
                report.evicted += 1;
                return false;
            }
            pending.push((key.clone(), value));
            true
        });

        let mut next_fast = if self.config.should_promote(staging.misses, staging.map.len()) {
            staging.misses = 0;
            report.promoted = !staging.map.is_empty();
            std::mem::take(&mut staging.map)
        } else {
            HashMap::new()
        };

        let current = self.fast.load_full();
        for (key, cell) in current.iter() {
            let value = cell.take();
            if value.is_zero() {
                report.demoted += 1;
                staging.map.insert(key.clone(), Arc::clone(cell));
                continue;
            }
            pending.push((key.clone(), value));
            next_fast.insert(key.clone(), Arc::clone(cell));
        }

        debug_assert!(next_fast.keys().all(|key| !staging.map.contains_key(key)));

        report.written = pending.len();
        report.fast_len = next_fast.len();
        report.staging_len = staging.map.len();
        self.fast.store(Arc::new(next_fast));

        self.stats.record(Event::Commit);
        self.stats.add(Event::Evicted, report.evicted as u64);
        self.stats.add(Event::Demoted, report.demoted as u64);
        if report.promoted {
            self.stats.record(Event::Promotion);
        }

        Drained { pending, report }
    }
}

impl<K, V, S> CounterCache<K, V, S>
where
    K: Eq + Hash + Clone,
    V: Number,
    S: CounterStore<V>,
{
    /// Flushes every non-zero counter to the store as one batch.
    ///
    /// The drain happens under the staging lock; the batch is built and
    /// flushed after the lock is released. When nothing changed since the last
    /// commit the store is not contacted at all.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Store`](crate::CacheError::Store) when the batch
    /// flush fails. The drained deltas are not re-queued and the in-memory
    /// cells stay zeroed: a failed or cancelled flush loses that cycle's
    /// increments.
    ///
    /// # Concurrency
    ///
    /// Safe to run alongside any number of [`update`](Self::update) calls, but
    /// **never concurrently with another `commit`** on the same cache.
    ///
    /// # Cancellation
    ///
    /// The drain runs on the first poll. Dropping the future afterwards, for
    /// example through `tokio::time::timeout`, abandons the batch with the
    /// same data loss as a failed flush.
    pub async fn commit(&self) -> Result<CommitReport> {
        let Drained { pending, report } = self.drain();

        if pending.is_empty() {
            debug!(
                evicted = report.evicted,
                retained = report.retained,
                demoted = report.demoted,
                fast_len = report.fast_len,
                staging_len = report.staging_len,
                "commit drained nothing to write"
            );
            return Ok(report);
        }

        let mut batch = self.store.begin_batch();
        for (key, value) in &pending {
            batch.enqueue((self.doc_id)(key), &self.config.field_name, *value);
        }
        self.stats.add(Event::Written, pending.len() as u64);

        if let Err(err) = batch.flush().await {
            self.stats.record(Event::FailedFlush);
            warn!(%err, lost = pending.len(), "commit batch flush failed");
            return Err(err.into());
        }

        debug!(
            written = report.written,
            evicted = report.evicted,
            retained = report.retained,
            demoted = report.demoted,
            promoted = report.promoted,
            fast_len = report.fast_len,
            staging_len = report.staging_len,
            "commit flushed"
        );
        Ok(report)
    }
}

impl<K, V: Number, S> fmt::Debug for CounterCache<K, V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let staging = self.staging.lock();
        f.debug_struct("CounterCache")
            .field("field_name", &self.config.field_name)
            .field("fast_len", &self.fast.load().len())
            .field("staging_len", &staging.map.len())
            .field("misses", &staging.misses)
            .finish()
    }
}

impl<K, V: Number, S> Drop for CounterCache<K, V, S> {
    fn drop(&mut self) {
        let fast = self.fast.load();
        let unflushed = fast
            .values()
            .chain(self.staging.get_mut().map.values())
            .filter(|cell| !cell.load().is_zero())
            .count();
        if unflushed > 0 {
            warn!(unflushed, "counter cache dropped with unflushed deltas");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CacheError;
    use crate::store::memory::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    type TestCache<V> = CounterCache<u32, V, MemoryStore<V>>;

    fn doc(key: &u32) -> String {
        format!("test/{key}")
    }

    fn cache<V: Number>() -> (TestCache<V>, MemoryStore<V>) {
        let store = MemoryStore::new();
        (CounterCache::new(store.clone(), doc, "count"), store)
    }

    fn in_fast<V: Number>(cache: &TestCache<V>, key: u32) -> bool {
        cache.fast.load().contains_key(&key)
    }

    fn in_staging<V: Number>(cache: &TestCache<V>, key: u32) -> bool {
        cache.staging.lock().map.contains_key(&key)
    }

    fn assert_exclusive<V: Number>(cache: &TestCache<V>) {
        let staging = cache.staging.lock();
        let fast = cache.fast.load();
        for key in staging.map.keys() {
            assert!(!fast.contains_key(key), "key {key} in both maps");
        }
    }

    #[test]
    fn test_new_key_goes_to_staging() {
        let (cache, _) = cache::<i64>();
        assert_eq!(cache.update(1, 7), 7);
        assert!(in_staging(&cache, 1));
        assert!(!in_fast(&cache, 1));
        assert_eq!(cache.get(&1), Some(7));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().inserts, 1);
    }

    #[test]
    fn test_update_returns_previous_value() {
        let (cache, _) = cache::<i32>();
        cache.update(1, 2);
        cache.update(2, 0);
        assert_eq!(cache.update(1, 3), 2);
        assert_eq!(cache.update(1, -1), 5);
        assert_eq!(cache.get(&1), Some(4));
    }

    #[test]
    fn test_empty_cache() {
        let (cache, _) = cache::<u64>();
        assert!(cache.is_empty());
        assert_eq!(cache.get(&3), None);
        assert!(!cache.contains_key(&3));
    }

    #[test]
    fn test_staging_hits_promote() {
        let (cache, _) = cache::<u64>();
        for key in 0..4 {
            cache.update(key, 1);
        }
        for hit in 1..4 {
            cache.update(0, 1);
            assert_eq!(cache.stats().pending_misses, hit);
            assert!(in_staging(&cache, 0));
        }

        // Fourth miss reaches the staging size.
        cache.update(0, 1);
        let stats = cache.stats();
        assert_eq!(stats.promotions, 1);
        assert_eq!(stats.fast_len, 4);
        assert_eq!(stats.staging_len, 0);
        assert_eq!(stats.pending_misses, 0);
        assert_eq!(cache.get(&0), Some(5));
        assert_exclusive(&cache);
    }

    #[test]
    fn test_promoted_keys_take_fast_path() {
        let (cache, _) = cache::<u64>();
        cache.update(1, 1);
        cache.update(2, 1);
        cache.update(1, 1);
        cache.update(2, 1);
        assert!(in_fast(&cache, 1) && in_fast(&cache, 2));

        let before = cache.stats();
        for _ in 0..10 {
            cache.update(1, 1);
            cache.update(2, 1);
        }
        let after = cache.stats();
        assert_eq!(after.misses, before.misses);
        assert_eq!(after.fast_hits, before.fast_hits + 20);
        assert_eq!(cache.get(&1), Some(12));
    }

    #[test]
    fn test_promotion_keeps_existing_fast_entries() {
        let (cache, _) = cache::<i64>();
        cache.update(1, 1);
        cache.update(1, 1);
        assert!(in_fast(&cache, 1));

        cache.update(2, 1);
        cache.update(2, 1);
        assert!(in_fast(&cache, 1));
        assert!(in_fast(&cache, 2));
        assert_eq!(cache.stats().promotions, 2);
    }

    #[test]
    fn test_zero_ratio_promotes_on_first_hit() {
        let config = CacheConfig::new("count").with_promotion_ratio(0.0);
        let cache: TestCache<i64> =
            CounterCache::with_config(MemoryStore::new(), doc, config).unwrap();
        cache.update(1, 1);
        cache.update(2, 1);
        cache.update(1, 1);
        assert!(in_fast(&cache, 1));
        assert!(in_fast(&cache, 2));
    }

    #[test]
    fn test_with_config_rejects_invalid() {
        let result: Result<TestCache<i64>> =
            CounterCache::with_config(MemoryStore::new(), doc, CacheConfig::new(""));
        assert!(matches!(result, Err(CacheError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_new_accepts_any_field_name() {
        let store = MemoryStore::<i64>::new();
        let cache: TestCache<i64> = CounterCache::new(store.clone(), doc, "");
        cache.update(1, 2);
        cache.commit().await.unwrap();
        assert_eq!(cache.config().field_name, "");
        assert_eq!(store.value("test/1", ""), 2);
    }

    #[tokio::test]
    async fn test_entry_lifecycle() {
        let (cache, store) = cache::<i64>();

        cache.update(1, 1);
        assert!(in_staging(&cache, 1) && !in_fast(&cache, 1));

        // One miss against a staging map of one promotes.
        cache.update(1, 0);
        assert!(in_fast(&cache, 1) && !in_staging(&cache, 1));
        cache.update(1, 0);
        assert_eq!(cache.update(1, 4), 1);
        assert_eq!(cache.get(&1), Some(5));

        let report = cache.commit().await.unwrap();
        assert_eq!(report.written, 1);
        assert_eq!(store.increments_for("test/1"), vec![5]);
        assert!(in_fast(&cache, 1));
        assert_eq!(cache.get(&1), Some(0));

        let report = cache.commit().await.unwrap();
        assert_eq!(report.written, 0);
        assert_eq!(report.demoted, 1);
        assert!(in_staging(&cache, 1) && !in_fast(&cache, 1));

        let report = cache.commit().await.unwrap();
        assert_eq!(report.evicted, 1);
        assert!(cache.is_empty());
        assert_eq!(store.value("test/1", "count"), 5);
        assert_eq!(store.batches().len(), 1);
    }

    #[tokio::test]
    async fn test_untouched_key_is_not_written() {
        let store = MemoryStore::<u64>::new();
        let cache = Arc::new(CounterCache::new(store.clone(), doc, "count"));
        cache.update(2, 0);

        let mut handles = vec![];
        for _ in 0..4 {
            let cache_clone = Arc::clone(&cache);
            handles.push(thread::spawn(move || {
                for _ in 0..250 {
                    cache_clone.update(1, 1);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        cache.commit().await.unwrap();
        let batches = store.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[0][0].document_id, "test/1");
        assert_eq!(batches[0][0].field_name, "count");
        assert_eq!(batches[0][0].increment_by, 1000);
        assert!(store.increments_for("test/2").is_empty());
    }

    #[tokio::test]
    async fn test_returning_to_zero_is_collected() {
        let (cache, store) = cache::<i64>();

        cache.update(1, 5);
        cache.commit().await.unwrap();
        assert!(in_staging(&cache, 1));
        assert_eq!(cache.get(&1), Some(0));

        // Staging hit against a map of one: promoted before the add.
        cache.update(1, -5);
        assert!(in_fast(&cache, 1));

        cache.commit().await.unwrap();
        assert!(cache.contains_key(&1));

        // Two consecutive zero observations.
        cache.commit().await.unwrap();
        assert!(in_staging(&cache, 1));
        cache.commit().await.unwrap();
        assert!(!cache.contains_key(&1));

        assert_eq!(store.increments_for("test/1"), vec![5, -5]);
        assert_eq!(store.value("test/1", "count"), 0);
    }

    #[tokio::test]
    async fn test_staging_zero_is_evicted_immediately() {
        let (cache, store) = cache::<i64>();
        cache.update(1, 0);
        cache.update(2, 3);

        let report = cache.commit().await.unwrap();
        assert_eq!(report.evicted, 1);
        assert_eq!(report.written, 1);
        assert!(!cache.contains_key(&1));
        assert_eq!(store.increments_for("test/1"), Vec::<i64>::new());
    }

    #[tokio::test]
    async fn test_commit_promotes_staging_after_eviction() {
        let (cache, _) = cache::<u64>();
        cache.update(1, 1);
        cache.update(2, 0);
        cache.update(3, 0);
        cache.update(1, 1);
        assert_eq!(cache.stats().pending_misses, 1);

        // Evicting 2 and 3 leaves one entry against one miss.
        let report = cache.commit().await.unwrap();
        assert!(report.promoted);
        assert_eq!(report.evicted, 2);
        assert!(in_fast(&cache, 1));
        assert_eq!(cache.stats().pending_misses, 0);
        assert_exclusive(&cache);
    }

    #[tokio::test]
    async fn test_commit_without_promotion_keeps_staging() {
        let (cache, store) = cache::<u64>();
        cache.update(1, 2);
        cache.update(2, 3);

        let report = cache.commit().await.unwrap();
        assert!(!report.promoted);
        assert_eq!(report.staging_len, 2);
        assert!(in_staging(&cache, 1) && in_staging(&cache, 2));
        assert_eq!(store.value("test/2", "count"), 3);
    }

    #[tokio::test]
    async fn test_empty_commit_skips_store() {
        let (cache, store) = cache::<u64>();
        let report = cache.commit().await.unwrap();
        assert_eq!(report, CommitReport::default());
        assert!(store.batches().is_empty());
        assert_eq!(cache.stats().commits, 1);
    }

    #[tokio::test]
    async fn test_failed_flush_loses_deltas() {
        let (cache, store) = cache::<u64>();
        cache.update(1, 10);
        store.fail_next_flush();

        let err = cache.commit().await.unwrap_err();
        assert!(matches!(err, CacheError::Store(_)));
        assert_eq!(cache.get(&1), Some(0));
        assert_eq!(cache.stats().failed_flushes, 1);

        cache.update(1, 1);
        cache.commit().await.unwrap();
        assert_eq!(store.value("test/1", "count"), 1);
    }

    #[tokio::test]
    async fn test_unsigned_decrement_wraps_back() {
        let (cache, store) = cache::<u32>();
        cache.update(1, 10);
        cache.update(1, 3u32.wrapping_neg());
        cache.commit().await.unwrap();
        assert_eq!(store.value("test/1", "count"), 7);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_no_lost_increments_under_concurrency() {
        const THREADS: usize = 8;
        const PER_THREAD: u64 = 20_000;
        const KEYS: u32 = 16;

        let store = MemoryStore::<u64>::new();
        let cache = Arc::new(CounterCache::new(store.clone(), doc, "count"));
        let done = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for t in 0..THREADS {
            let cache_clone = Arc::clone(&cache);
            let done_clone = Arc::clone(&done);
            handles.push(thread::spawn(move || {
                for i in 0..PER_THREAD {
                    cache_clone.update(((i as u32) + t as u32) % KEYS, 1);
                }
                done_clone.fetch_add(1, Ordering::Relaxed);
            }));
        }

        let committer = {
            let cache = Arc::clone(&cache);
            let done = Arc::clone(&done);
            tokio::spawn(async move {
                while done.load(Ordering::Relaxed) < THREADS {
                    cache.commit().await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };
        committer.await.unwrap();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_exclusive(&cache);

        let residual: u64 = (0..KEYS).filter_map(|key| cache.get(&key)).sum();
        let written: u64 = (0..KEYS)
            .map(|key| store.value(&doc(&key), "count"))
            .sum();
        assert_eq!(written + residual, THREADS as u64 * PER_THREAD);

        cache.commit().await.unwrap();
        let written: u64 = (0..KEYS)
            .map(|key| store.value(&doc(&key), "count"))
            .sum();
        assert_eq!(written, THREADS as u64 * PER_THREAD);
        for key in 0..KEYS {
            assert_eq!(
                store.value(&doc(&key), "count"),
                THREADS as u64 * PER_THREAD / KEYS as u64
            );
        }
    }

    #[tokio::test]
    async fn test_stale_snapshot_add_survives_two_commits() {
        let (cache, store) = cache::<u64>();
        cache.update(1, 1);
        cache.update(1, 1);
        assert!(in_fast(&cache, 1));
        cache.commit().await.unwrap();
        assert_eq!(store.value("test/1", "count"), 2);

        // An updater that loaded the fast map and stalls before its add.
        let stale = cache.fast.load_full();

        let report = cache.commit().await.unwrap();
        assert_eq!(report.demoted, 1);
        let report = cache.commit().await.unwrap();
        assert_eq!(report.evicted, 0);
        assert_eq!(report.retained, 1);
        assert!(in_staging(&cache, 1));

        stale.get(&1).unwrap().fetch_add(7);
        cache.commit().await.unwrap();
        assert_eq!(store.value("test/1", "count"), 9);

        // Once the snapshot is released the cell is collected normally.
        drop(stale);
        let report = cache.commit().await.unwrap();
        assert_eq!(report.evicted, 1);
        assert!(!cache.contains_key(&1));
        assert_eq!(store.value("test/1", "count"), 9);
    }

    #[test]
    fn test_recheck_after_concurrent_promotion() {
        let (cache, _) = cache::<i64>();
        let cache = Arc::new(cache);
        cache.update(1, 2);
        assert!(in_staging(&cache, 1));

        let mut staging = cache.staging.lock();
        let started = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let updater = {
            let cache = Arc::clone(&cache);
            let started = Arc::clone(&started);
            thread::spawn(move || {
                started.store(true, Ordering::Release);
                cache.update(1, 3)
            })
        };
        while !started.load(Ordering::Acquire) {
            thread::yield_now();
        }
        // Let the updater miss the fast map and block on the staging lock.
        thread::sleep(std::time::Duration::from_millis(100));

        let mut promoted: CellMap<u32, i64> = (**cache.fast.load()).clone();
        promoted.extend(std::mem::take(&mut staging.map));
        cache.fast.store(Arc::new(promoted));
        drop(staging);

        assert_eq!(updater.join().unwrap(), 2);
        let stats = cache.stats();
        assert_eq!(stats.recheck_hits, 1);
        assert_eq!(stats.staging_hits, 0);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.pending_misses, 0);
        assert_eq!(cache.get(&1), Some(5));
        assert_exclusive(&cache);
    }

    #[test]
    fn test_debug() {
        let (cache, _) = cache::<i64>();
        cache.update(1, 1);
        let debug_str = format!("{:?}", cache);
        assert!(debug_str.contains("CounterCache"));
        assert!(debug_str.contains("staging_len: 1"));
    }
}
