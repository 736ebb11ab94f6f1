//! Parametrized query-memoization cache.

use std::hash::Hash;
use std::sync::Arc;

use futures::future::BoxFuture;
use moka::future::Cache;
use tracing::debug;

use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::types::{Changed, Cursor};

/// Loader invoked once per distinct parameter identity per TTL window.
pub type ParamLoader<P, T> =
    Arc<dyn Fn(P) -> BoxFuture<'static, anyhow::Result<(Vec<T>, Cursor)>> + Send + Sync>;

struct Bucket<T> {
    items: Arc<Vec<T>>,
    last_change: Cursor,
}

impl<T> Clone for Bucket<T> {
    fn clone(&self) -> Self {
        Self {
            items: Arc::clone(&self.items),
            last_change: self.last_change,
        }
    }
}

/// One independent TTL bucket per distinct query-parameter identity.
///
/// This is memoization, not incrementality: repeated polls carrying the
/// same parameter tuple within the TTL window share one bucket, a
/// different tuple (for instance a different cursor) computes a fresh
/// one. Suits unbounded-tail data like message history, where a live
/// full index is infeasible and polls cluster around the same sampling
/// instant. The bucket count is capacity-bounded because cursors make
/// the key space unbounded.
///
/// Per-key single-flight and TTL eviction come from the underlying moka
/// cache; failed loads are not cached, the error is shared with the
/// callers waiting on that bucket.
pub struct ParamCache<P, T>
where
    P: Hash + Eq + Clone + Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    name: &'static str,
    buckets: Cache<P, Bucket<T>>,
    loader: ParamLoader<P, T>,
}

impl<P, T> ParamCache<P, T>
where
    P: Hash + Eq + Clone + Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    pub fn new(name: &'static str, config: &CacheConfig, loader: ParamLoader<P, T>) -> Self {
        let buckets = Cache::builder()
            .max_capacity(config.max_buckets)
            .time_to_live(config.ttl)
            .build();
        Self { name, buckets, loader }
    }

    /// The bucket for `param`, loading it if absent or expired.
    pub async fn get(&self, param: P) -> CacheResult<Changed<Arc<Vec<T>>>> {
        let loader = Arc::clone(&self.loader);
        let name = self.name;
        let key = param.clone();
        let bucket = self
            .buckets
            .try_get_with(key, async move {
                let (items, last_change) = loader(param).await.map_err(CacheError::load)?;
                debug!(cache = name, items = items.len(), "bucket loaded");
                Ok::<_, CacheError>(Bucket {
                    items: Arc::new(items),
                    last_change,
                })
            })
            .await
            .map_err(|e: Arc<CacheError>| (*e).clone())?;
        Ok(Changed::new(bucket.items, bucket.last_change))
    }

    /// The bucket for `param` with a per-call filter applied on top.
    ///
    /// The filter runs downstream of the shared immutable snapshot and
    /// is never cached, so callers sharing a bucket can see different
    /// subsets. Returns `None` when nothing survives the filter.
    pub async fn get_filtered<F>(&self, param: P, filter: F) -> CacheResult<Option<Changed<Vec<T>>>>
    where
        F: Fn(&T) -> bool,
        T: Clone,
    {
        let bucket = self.get(param).await?;
        let items: Vec<T> = bucket.items.iter().filter(|t| filter(t)).cloned().collect();
        if items.is_empty() {
            return Ok(None);
        }
        Ok(Some(Changed::new(items, bucket.last_change)))
    }
}
