//! Sharded event counters and the [`CacheStats`] snapshot.
//!
//! Every `update` records at least one event, so the statistics must not
//! become a contention point of their own. They use the same strategy as the
//! rest of the crate's hot path: updates go to a per-thread shard, reads
//! aggregate all shards.
//!
//! ```text
//!                          ┌─────────────────────────────────────┐
//!                          │           StatsRecorder             │
//!                          ├─────────────────────────────────────┤
//!   Thread 0 ──records──►  │ [Shard 0]  fast_hits, misses, ...   │
//!   Thread 1 ──records──►  │ [Shard 1]  fast_hits, misses, ...   │
//!        ...               │    ...                              │
//!   Thread 63 ─records──►  │ [Shard 63] fast_hits, misses, ...   │
//!                          └─────────────────────────────────────┘
//!                                          │
//!                                          ▼
//!                                 snapshot() sums every
//!                                 event across the shards
//! ```
//!
//! A shard holds one atomic per [`Event`] and is cache-line padded as a whole,
//! so one recorder costs `NUM_SHARDS` padded lines regardless of how many
//! event kinds exist.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

/// Number of shards per recorder.
///
/// Threads beyond this count share shards round-robin, which only adds
/// contention, never inaccuracy.
pub(crate) const NUM_SHARDS: usize = 64;

static NEXT_SLOT_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    /// Shard index of the current thread, assigned lazily and stable for the
    /// thread's lifetime.
    static THREAD_SLOT_INDEX: usize = next_slot_id();
}

fn next_slot_id() -> usize {
    NEXT_SLOT_ID.fetch_add(1, Ordering::Relaxed) % NUM_SHARDS
}

/// Events recorded by a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    FastHit,
    RecheckHit,
    StagingHit,
    Insert,
    Miss,
    Promotion,
    Commit,
    Written,
    Evicted,
    Demoted,
    FailedFlush,
}

const NUM_EVENTS: usize = 11;

#[derive(Default)]
struct Shard {
    events: [AtomicU64; NUM_EVENTS],
}

/// Per-cache event recorder.
pub(crate) struct StatsRecorder {
    shards: Box<[CachePadded<Shard>]>,
}

impl StatsRecorder {
    pub(crate) fn new() -> Self {
        Self {
            shards: (0..NUM_SHARDS)
                .map(|_| CachePadded::new(Shard::default()))
                .collect(),
        }
    }

    #[inline]
    pub(crate) fn record(&self, event: Event) {
        self.add(event, 1);
    }

    #[inline]
    pub(crate) fn add(&self, event: Event, n: u64) {
        THREAD_SLOT_INDEX.with(|idx| {
            self.shards[*idx].events[event as usize].fetch_add(n, Ordering::Relaxed);
        });
    }

    /// Sums one event across all shards.
    pub(crate) fn total(&self, event: Event) -> u64 {
        self.shards
            .iter()
            .map(|shard| shard.events[event as usize].load(Ordering::Relaxed))
            .sum()
    }

    /// Aggregates every event into a [`CacheStats`], completed with the map
    /// sizes observed by the caller.
    pub(crate) fn snapshot(
        &self,
        fast_len: usize,
        staging_len: usize,
        pending_misses: usize,
    ) -> CacheStats {
        CacheStats {
            fast_len,
            staging_len,
            pending_misses,
            fast_hits: self.total(Event::FastHit),
            recheck_hits: self.total(Event::RecheckHit),
            staging_hits: self.total(Event::StagingHit),
            inserts: self.total(Event::Insert),
            misses: self.total(Event::Miss),
            promotions: self.total(Event::Promotion),
            commits: self.total(Event::Commit),
            written: self.total(Event::Written),
            evicted: self.total(Event::Evicted),
            demoted: self.total(Event::Demoted),
            failed_flushes: self.total(Event::FailedFlush),
        }
    }
}

impl std::fmt::Debug for StatsRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsRecorder")
            .field("shards", &self.shards.len())
            .finish()
    }
}

/// A point-in-time view of a cache's activity.
///
/// Event totals are cumulative since the cache was created. The map sizes are
/// read under the staging lock, so `fast_len + staging_len` is the number of
/// live counters at that instant.
///
/// With the `serde` feature this type is serializable; with `json` it can be
/// rendered directly through [`CacheStats::to_json`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CacheStats {
    /// Entries in the current fast map.
    pub fast_len: usize,
    /// Entries in the staging map.
    pub staging_len: usize,
    /// Misses accumulated toward the next promotion.
    pub pending_misses: usize,
    /// Updates served lock-free by the fast map.
    pub fast_hits: u64,
    /// Updates that found their key in the fast map only after taking the
    /// staging lock, because a promotion published it in between.
    pub recheck_hits: u64,
    /// Updates that took the staging lock and found the key in staging.
    pub staging_hits: u64,
    /// Keys created by `update`.
    pub inserts: u64,
    /// Misses recorded toward promotion.
    pub misses: u64,
    /// Promotions of the staging map into the fast map.
    pub promotions: u64,
    /// Completed drains.
    pub commits: u64,
    /// Increment operations handed to the store.
    pub written: u64,
    /// Cells deleted after a zero observation in staging.
    pub evicted: u64,
    /// Zero cells moved from the fast map back to staging.
    pub demoted: u64,
    /// Batches whose flush returned an error.
    pub failed_flushes: u64,
}

impl CacheStats {
    /// Number of live counters.
    pub fn len(&self) -> usize {
        self.fast_len + self.staging_len
    }

    /// Returns `true` if no counter is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serializes the statistics to JSON.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let json = cache.stats().to_json(true)?;
    /// println!("{json}");
    /// ```
    #[cfg(feature = "json")]
    pub fn to_json(&self, pretty: bool) -> crate::Result<String> {
        let json = if pretty {
            serde_json::to_string_pretty(self)?
        } else {
            serde_json::to_string(self)?
        };
        Ok(json)
    }
}
