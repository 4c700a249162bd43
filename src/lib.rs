//! # Coalesce - Write-Coalescing Atomic Counter Cache
//!
//! A Rust library that accumulates per-key counter deltas in memory, from any
//! number of threads, and periodically flushes the aggregated totals to a
//! remote counter store as **one batched write per flush**.
//!
//! ## The Problem
//!
//! Remote counter stores (document databases, key-value services) charge a
//! round trip, and often a billable write, for every increment. Incrementing
//! a "views" or "likes" field once per event turns a busy key into a stream
//! of tiny writes that saturates the store and the network long before the
//! application does.
//!
//! ## The Solution: Coalescing
//!
//! [`CounterCache::update`] records the delta in memory and returns
//! immediately. [`CounterCache::commit`], called by a timer you own, drains
//! every counter and sends one increment per active key in a single batch. N
//! increments on one key between two commits cost one remote write.
//!
//! ### Design Principles
//!
//! 1. **Lock-free hot path**: Hot keys live in an immutable *fast map*
//!    published through an atomic pointer swap ([`arc_swap::ArcSwap`]).
//!    Updating a key found there is a snapshot load plus one atomic add.
//!
//! 2. **Locked cold path**: New and rarely used keys live in a mutex-guarded
//!    *staging map*. Lookups there are counted as misses.
//!
//! 3. **Adaptive promotion**: Once misses reach the staging map's size, the
//!    staging map is merged into a new fast map. Frequently updated keys pay
//!    for the lock only a bounded number of times.
//!
//! 4. **I/O outside the lock**: Commits drain the cells under the staging lock,
//!    release it, then talk to the store. Updates never wait on the network.
//!
//! 5. **Deferred deletion**: A counter that drains to zero is demoted to staging
//!    and deleted only if it is still zero one commit later, so an increment
//!    racing with the drain is never lost.
//!
//! ## Counter Widths
//!
//! | Type  | Atomic      | Notes                               |
//! |-------|-------------|-------------------------------------|
//! | `i32` | `AtomicI32` | Signed deltas                       |
//! | `u32` | `AtomicU32` | Wrapping; decrement with `wrapping_neg` |
//! | `i64` | `AtomicI64` | Signed deltas                       |
//! | `u64` | `AtomicU64` | Wrapping; decrement with `wrapping_neg` |
//!
//! ## Quick Start
//!
//! ```rust
//! use coalesce::store::memory::MemoryStore;
//! use coalesce::CounterCache;
//! use std::sync::Arc;
//!
//! # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
//! let store = MemoryStore::<i64>::new();
//! let cache = Arc::new(CounterCache::new(
//!     store.clone(),
//!     |post: &u64| format!("posts/{post}"),
//!     "views",
//! ));
//!
//! // Hot path, from any thread.
//! cache.update(42, 1);
//! cache.update(42, 1);
//!
//! // Cold path, from a single periodic task.
//! cache.commit().await?;
//! assert_eq!(store.value("posts/42", "views"), 2);
//! # Ok::<(), coalesce::CacheError>(())
//! # }).unwrap();
//! ```
//!
//! ## Thread Safety
//!
//! [`CounterCache`] is `Send + Sync`; share it through `Arc`. `update` may be
//! called from any number of threads. `commit` must be serialized by the
//! caller: **never run two commits on the same cache at once**.
//!
//! ## Durability
//!
//! Deltas live only in memory until a commit flushes them. A process exit
//! before the next commit, a failed flush, or a cancelled commit loses the
//! affected deltas; they are never re-queued. Remote totals are exact only at
//! quiescence, after a completed commit.
//!
//! ## Remote Stores
//!
//! Stores implement [`store::CounterStore`] and [`store::WriteBatch`]: open a
//! batch, enqueue server-side increments, flush once.
//! [`store::memory::MemoryStore`] is an in-process implementation for tests.
//!
//! ## Observability
//!
//! The cache emits [`tracing`] events (`trace` on promotion, `debug` per
//! commit, `warn` on failed flushes) and keeps sharded activity counters
//! exposed through [`CounterCache::stats`].
//!
//! | Feature | Description |
//! |---------|-------------|
//! | `serde` | `Serialize`/`Deserialize` for [`CacheStats`] and [`CacheConfig`] |
//! | `json`  | [`CacheStats::to_json`] |
//! | `full`  | All of the above |

pub mod cache;
pub mod cell;
pub mod config;
pub mod error;
pub mod stats;
pub mod store;

pub use cache::{CommitReport, CounterCache};
pub use cell::{CounterCell, Number};
pub use config::CacheConfig;
pub use error::{CacheError, Result, StoreError};
pub use stats::CacheStats;
