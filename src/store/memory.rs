//! In-process [`CounterStore`] implementation.
//!
//! [`MemoryStore`] keeps one total per `(document, field)` pair and a log of
//! every flushed batch. Handles are cheap to clone and share the same state,
//! so a test can hand one clone to a cache and inspect another.
//!
//! # Example
//!
//! ```rust
//! use coalesce::store::memory::MemoryStore;
//! use coalesce::store::{CounterStore, WriteBatch};
//!
//! # tokio_test_block_on(async {
//! let store = MemoryStore::<u64>::new();
//! let mut batch = store.begin_batch();
//! batch.enqueue("posts/1".to_string(), "likes", 3);
//! batch.flush().await.unwrap();
//!
//! assert_eq!(store.value("posts/1", "likes"), 3);
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{CounterStore, Increment, WriteBatch};
use crate::cell::Number;
use crate::error::StoreError;

struct State<V> {
    totals: HashMap<(String, String), V>,
    batches: Vec<Vec<Increment<V>>>,
    pending_failures: usize,
}

/// A shared, in-memory counter store.
pub struct MemoryStore<V> {
    state: Arc<Mutex<State<V>>>,
}

impl<V: Number> MemoryStore<V> {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                totals: HashMap::new(),
                batches: Vec::new(),
                pending_failures: 0,
            })),
        }
    }

    /// Returns the stored total of `field_name` on `document_id`, zero if it
    /// was never incremented.
    pub fn value(&self, document_id: &str, field_name: &str) -> V {
        self.state
            .lock()
            .totals
            .get(&(document_id.to_string(), field_name.to_string()))
            .copied()
            .unwrap_or_else(V::zero)
    }

    /// Returns every successfully flushed batch, oldest first.
    pub fn batches(&self) -> Vec<Vec<Increment<V>>> {
        self.state.lock().batches.clone()
    }

    /// Returns every increment applied to `document_id`, oldest first.
    pub fn increments_for(&self, document_id: &str) -> Vec<V> {
        self.state
            .lock()
            .batches
            .iter()
            .flatten()
            .filter(|op| op.document_id == document_id)
            .map(|op| op.increment_by)
            .collect()
    }

    /// Makes the next flush fail with [`StoreError::Transport`] without
    /// applying any of its operations. Calls accumulate.
    pub fn fail_next_flush(&self) {
        self.state.lock().pending_failures += 1;
    }
}

impl<V: Number> Default for MemoryStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Clone for MemoryStore<V> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<V: Number> fmt::Debug for MemoryStore<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryStore")
            .field("totals", &state.totals.len())
            .field("batches", &state.batches.len())
            .finish()
    }
}

impl<V: Number> CounterStore<V> for MemoryStore<V> {
    type Batch = MemoryBatch<V>;

    fn begin_batch(&self) -> MemoryBatch<V> {
        MemoryBatch {
            state: Arc::clone(&self.state),
            ops: Vec::new(),
        }
    }
}

/// Batch opened by [`MemoryStore::begin_batch`].
pub struct MemoryBatch<V> {
    state: Arc<Mutex<State<V>>>,
    ops: Vec<Increment<V>>,
}

impl<V: Number> MemoryBatch<V> {
    /// Number of staged operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns `true` if nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

impl<V: Number> WriteBatch<V> for MemoryBatch<V> {
    fn enqueue(&mut self, document_id: String, field_name: &str, increment_by: V) {
        self.ops.push(Increment {
            document_id,
            field_name: field_name.to_string(),
            increment_by,
        });
    }

    fn flush(self) -> impl Future<Output = Result<(), StoreError>> + Send {
        async move {
            let mut state = self.state.lock();
            if state.pending_failures > 0 {
                state.pending_failures -= 1;
                return Err(StoreError::Transport("injected flush failure".to_string()));
            }
            for op in &self.ops {
                let total = state
                    .totals
                    .entry((op.document_id.clone(), op.field_name.clone()))
                    .or_insert_with(V::zero);
                *total = total.wrapping_add(&op.increment_by);
            }
            state.batches.push(self.ops);
            Ok(())
        }
    }
}
