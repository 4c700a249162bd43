//! The remote counter store contract.
//!
//! The cache never talks to a database directly. A commit opens one
//! [`WriteBatch`] from a [`CounterStore`], enqueues one server-side increment
//! per non-zero counter and flushes the batch once. Connection handling,
//! authentication, retries and document addressing all belong to the store
//! implementation.
//!
//! # Implementing a Store
//!
//! ```rust,ignore
//! use coalesce::store::{CounterStore, WriteBatch};
//! use coalesce::StoreError;
//!
//! struct DocumentDb { client: db::Client }
//!
//! struct DocumentBatch { writer: db::BulkWriter }
//!
//! impl CounterStore<i64> for DocumentDb {
//!     type Batch = DocumentBatch;
//!
//!     fn begin_batch(&self) -> DocumentBatch {
//!         DocumentBatch { writer: self.client.bulk_writer() }
//!     }
//! }
//!
//! impl WriteBatch<i64> for DocumentBatch {
//!     fn enqueue(&mut self, document_id: String, field_name: &str, increment_by: i64) {
//!         self.writer.update(document_id, db::increment(field_name, increment_by));
//!     }
//!
//!     fn flush(self) -> impl Future<Output = Result<(), StoreError>> + Send {
//!         async move {
//!             self.writer
//!                 .end()
//!                 .await
//!                 .map_err(|err| StoreError::Transport(err.to_string()))
//!         }
//!     }
//! }
//! ```
//!
//! [`memory::MemoryStore`] is a complete in-process implementation, useful in
//! tests and as a reference.

pub mod memory;

use std::future::Future;

use crate::cell::Number;
use crate::error::StoreError;

/// A remote store able to apply batched atomic increments.
pub trait CounterStore<V: Number>: Send + Sync {
    /// The batch type opened for each commit.
    type Batch: WriteBatch<V>;

    /// Opens a batched-write session.
    fn begin_batch(&self) -> Self::Batch;
}

/// A batched-write session.
///
/// Operations are only staged by [`enqueue`](WriteBatch::enqueue); nothing
/// reaches the store before [`flush`](WriteBatch::flush).
pub trait WriteBatch<V: Number>: Send {
    /// Stages `field_name += increment_by` on `document_id`.
    ///
    /// The store must apply the increment server-side, without reading the
    /// current value first.
    fn enqueue(&mut self, document_id: String, field_name: &str, increment_by: V);

    /// Submits every staged operation and waits for the store to accept them.
    ///
    /// Partial failure of individual operations is the store's concern; an
    /// error here means the batch as a whole did not make it.
    fn flush(self) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// One staged increment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Increment<V> {
    /// Document the counter field lives in.
    pub document_id: String,
    /// Name of the incremented field.
    pub field_name: String,
    /// Amount added server-side.
    pub increment_by: V,
}
