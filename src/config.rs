//! Construction-time cache configuration.
//!
//! Configuration is read once when the cache is built and never reloaded.
//! With the `serde` feature, [`CacheConfig`] can be deserialized from any
//! serde format; missing fields fall back to their defaults.
//!
//! ```rust,ignore
//! let config: CacheConfig = serde_json::from_str(r#"{ "field_name": "views" }"#)?;
//! let cache = CounterCache::with_config(store, |id: &u64| format!("posts/{id}"), config)?;
//! ```

use crate::error::{CacheError, Result};

/// Default field incremented on every write.
pub const DEFAULT_FIELD_NAME: &str = "count";

/// Default promotion ratio: promote once recorded misses reach the staging
/// map's size.
pub const DEFAULT_PROMOTION_RATIO: f64 = 1.0;

/// Settings consumed by [`CounterCache`](crate::CounterCache).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CacheConfig {
    /// Remote field incremented by every commit write.
    pub field_name: String,

    /// Staging misses needed for a promotion, relative to the staging map's
    /// size. The threshold is `misses >= staging_len * promotion_ratio`.
    ///
    /// Lower values promote sooner and move more keys to the lock-free path;
    /// `0.0` promotes on every staging hit.
    pub promotion_ratio: f64,
}

impl CacheConfig {
    /// Creates a configuration writing to `field_name` with default settings.
    pub fn new(field_name: impl Into<String>) -> Self {
        Self {
            field_name: field_name.into(),
            ..Self::default()
        }
    }

    /// Sets the promotion ratio, returning `self` for method chaining.
    pub fn with_promotion_ratio(self, promotion_ratio: f64) -> Self {
        Self {
            promotion_ratio,
            ..self
        }
    }

    /// Checks that the configuration can drive a cache.
    pub fn validate(&self) -> Result<()> {
        if self.field_name.is_empty() {
            return Err(CacheError::InvalidConfig(
                "field name must not be empty".to_string(),
            ));
        }
        if !self.promotion_ratio.is_finite() || self.promotion_ratio < 0.0 {
            return Err(CacheError::InvalidConfig(format!(
                "promotion ratio must be a finite non-negative number, got {}",
                self.promotion_ratio
            )));
        }
        Ok(())
    }

    /// Returns `true` once `misses` justify promoting a staging map holding
    /// `staging_len` entries.
    #[inline]
    pub(crate) fn should_promote(&self, misses: usize, staging_len: usize) -> bool {
        // Exact integer comparison for the default ratio.
        if self.promotion_ratio == DEFAULT_PROMOTION_RATIO {
            return misses >= staging_len;
        }
        misses as f64 >= staging_len as f64 * self.promotion_ratio
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            field_name: DEFAULT_FIELD_NAME.to_string(),
            promotion_ratio: DEFAULT_PROMOTION_RATIO,
        }
    }
}
