//! Error types for the cache layer.

use std::sync::Arc;

use thiserror::Error;

/// Errors surfaced by cache lookups.
///
/// A load failure is shared between every caller waiting on the same
/// single-flight refresh, hence the `Arc` around the underlying error.
/// The last good cached value is never evicted by a failed refresh.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The backing store failed while (re)computing a cache entry.
    #[error("backing store load failed: {0}")]
    Load(Arc<anyhow::Error>),
}

impl CacheError {
    pub(crate) fn load(err: anyhow::Error) -> Self {
        Self::Load(Arc::new(err))
    }
}

/// Result alias used across the cache layer.
pub type CacheResult<T> = Result<T, CacheError>;
