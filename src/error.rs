//! Error types for the cache and its remote store.
//!
//! `update` never fails, so every error in this crate comes from building a
//! cache with an invalid [`CacheConfig`](crate::CacheConfig), from a remote
//! store refusing or losing a batch during `commit`, or from exporting
//! statistics.
//!
//! # Example
//!
//! ```rust,ignore
//! use coalesce::{CacheError, Result};
//!
//! async fn flush(cache: &Cache) -> Result<()> {
//!     match cache.commit().await {
//!         Ok(report) => tracing::info!(written = report.written, "flushed"),
//!         Err(CacheError::Store(err)) => tracing::warn!(%err, "deltas lost"),
//!         Err(err) => return Err(err),
//!     }
//!     Ok(())
//! }
//! ```

use thiserror::Error;

/// Error returned by a [`WriteBatch`](crate::store::WriteBatch) flush.
///
/// Stores map their own failures onto these variants; the cache only
/// forwards them to the caller of `commit`.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The batch could not reach the store (network, timeout, shutdown).
    #[error("transport error: {0}")]
    Transport(String),

    /// The store received the batch but refused it.
    #[error("batch rejected: {0}")]
    Rejected(String),

    /// Any other store-specific failure.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Unified error type for cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Flushing a commit batch failed. The drained deltas are not re-queued.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The cache configuration is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Error serializing statistics.
    #[cfg(feature = "json")]
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;
