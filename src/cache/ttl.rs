//! Single-slot TTL cache with single-flight refresh.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
// Tokio's Instant (not std's) so paused-clock tests can drive TTL expiry.
use tokio::time::Instant;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::types::{Changed, Cursor};

/// Zero-argument loader producing the value plus its change cursor.
pub type SlotLoader<T> =
    Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<(T, Cursor)>> + Send + Sync>;

struct Slot<T> {
    value: T,
    last_change: Cursor,
    computed_at: Instant,
}

/// Tracks the outcome of the in-flight refresh so a failure can be
/// shared with every caller that was already waiting on it. Failures
/// are numbered by refresh generation; a caller who observed the
/// failed generation already arrived after it and retries instead.
struct Flight {
    last_failure: Option<(u64, CacheError)>,
}

/// A single cached value, recomputed lazily via an injected loader when
/// older than its TTL.
///
/// Concurrent callers hitting a stale slot block on one in-flight
/// refresh and share its result. A failed refresh never evicts the
/// previous valid value.
pub struct TtlCache<T> {
    name: &'static str,
    ttl: Duration,
    loader: SlotLoader<T>,
    slot: RwLock<Option<Slot<T>>>,
    flight: tokio::sync::Mutex<Flight>,
    refresh_gen: AtomicU64,
}

impl<T: Clone + Send + Sync> TtlCache<T> {
    pub fn new(name: &'static str, config: &CacheConfig, loader: SlotLoader<T>) -> Self {
        Self {
            name,
            ttl: config.ttl,
            loader,
            slot: RwLock::new(None),
            flight: tokio::sync::Mutex::new(Flight { last_failure: None }),
            refresh_gen: AtomicU64::new(0),
        }
    }

    /// Cached value, refreshing first if the slot is stale or empty.
    pub async fn get(&self) -> CacheResult<T> {
        self.get_with_change().await.map(|c| c.items)
    }

    /// Cached value plus the slot's change cursor.
    pub async fn get_with_change(&self) -> CacheResult<Changed<T>> {
        if let Some(hit) = self.fresh() {
            return Ok(hit);
        }

        let observed_gen = self.refresh_gen.load(Ordering::Acquire);
        let mut flight = self.flight.lock().await;

        // Someone else may have refreshed while we waited on the lock.
        if let Some(hit) = self.fresh() {
            return Ok(hit);
        }
        // Or the refresh we were waiting on may have failed.
        if let Some((failed_gen, err)) = &flight.last_failure
            && *failed_gen > observed_gen
        {
            return Err(err.clone());
        }

        match (self.loader)().await {
            Ok((value, change)) => {
                flight.last_failure = None;
                let mut slot = self.slot.write();
                // Slot cursors never go backwards across refreshes.
                let change = match slot.as_ref() {
                    Some(prev) => prev.last_change.max(change),
                    None => change,
                };
                *slot = Some(Slot {
                    value: value.clone(),
                    last_change: change,
                    computed_at: Instant::now(),
                });
                debug!(cache = self.name, "slot refreshed");
                Ok(Changed::new(value, change))
            }
            Err(e) => {
                let err = CacheError::load(e);
                let generation = self.refresh_gen.fetch_add(1, Ordering::AcqRel) + 1;
                flight.last_failure = Some((generation, err.clone()));
                warn!(cache = self.name, error = %err, "refresh failed, keeping last good value");
                Err(err)
            }
        }
    }

    /// Force the next access to recompute.
    pub fn invalidate(&self) {
        debug!(cache = self.name, "slot invalidated");
        *self.slot.write() = None;
    }

    /// Last good value regardless of freshness, if any.
    pub fn peek(&self) -> Option<Changed<T>> {
        self.slot
            .read()
            .as_ref()
            .map(|s| Changed::new(s.value.clone(), s.last_change))
    }

    fn fresh(&self) -> Option<Changed<T>> {
        let slot = self.slot.read();
        slot.as_ref()
            .filter(|s| s.computed_at.elapsed() <= self.ttl)
            .map(|s| Changed::new(s.value.clone(), s.last_change))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;
    use crate::cache::SlotLoader;

    fn counting_loader(
        calls: Arc<AtomicUsize>,
        fail: Arc<AtomicBool>,
        delay: Option<Duration>,
    ) -> SlotLoader<u64> {
        Arc::new(move || {
            let calls = Arc::clone(&calls);
            let fail = Arc::clone(&fail);
            Box::pin(async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) as u64 + 1;
                if let Some(d) = delay {
                    tokio::time::sleep(d).await;
                }
                if fail.load(Ordering::SeqCst) {
                    anyhow::bail!("loader down");
                }
                Ok((n, Cursor::now()))
            })
        })
    }

    fn cache(ttl: Duration, loader: SlotLoader<u64>) -> Arc<TtlCache<u64>> {
        let config = CacheConfig::default().ttl(ttl);
        Arc::new(TtlCache::new("test", &config, loader))
    }

    #[tokio::test]
    async fn serves_cached_value_within_ttl() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = cache(
            Duration::from_secs(60),
            counting_loader(Arc::clone(&calls), Arc::default(), None),
        );

        let a = cache.get_with_change().await.unwrap();
        let b = cache.get_with_change().await.unwrap();
        assert_eq!(a.items, b.items);
        assert_eq!(a.last_change, b.last_change);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidate_forces_recompute() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = cache(
            Duration::from_secs(60),
            counting_loader(Arc::clone(&calls), Arc::default(), None),
        );

        assert_eq!(cache.get().await.unwrap(), 1);
        cache.invalidate();
        assert_eq!(cache.get().await.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_one_refresh() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = cache(
            Duration::from_secs(60),
            counting_loader(Arc::clone(&calls), Arc::default(), Some(Duration::from_millis(50))),
        );

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let cache = Arc::clone(&cache);
            tasks.push(tokio::spawn(async move { cache.get().await.unwrap() }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap(), 1);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_keeps_last_good_value() {
        let calls = Arc::new(AtomicUsize::new(0));
        let fail = Arc::new(AtomicBool::new(false));
        let cache = cache(
            Duration::from_millis(10),
            counting_loader(Arc::clone(&calls), Arc::clone(&fail), None),
        );

        let first = cache.get_with_change().await.unwrap();
        assert_eq!(first.items, 1);

        tokio::time::advance(Duration::from_millis(20)).await;
        fail.store(true, Ordering::SeqCst);
        assert!(cache.get().await.is_err());

        // Old value survived the failed attempt.
        let kept = cache.peek().unwrap();
        assert_eq!(kept.items, 1);
        assert_eq!(kept.last_change, first.last_change);

        // Next poll retries and succeeds.
        fail.store(false, Ordering::SeqCst);
        assert_eq!(cache.get().await.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_issued_right_after_failure_retries() {
        let calls = Arc::new(AtomicUsize::new(0));
        let fail = Arc::new(AtomicBool::new(true));
        let cache = cache(
            Duration::from_millis(10),
            counting_loader(Arc::clone(&calls), Arc::clone(&fail), None),
        );

        assert!(cache.get().await.is_err());

        // The clock has not moved since the failure. This poll was not
        // waiting on the failed refresh, so it gets its own attempt.
        fail.store(false, Ordering::SeqCst);
        assert_eq!(cache.get().await.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn last_change_never_goes_backwards() {
        let base = Cursor::now();
        let seq = Arc::new(AtomicUsize::new(0));
        let loader: SlotLoader<u64> = {
            let seq = Arc::clone(&seq);
            Arc::new(move || {
                let seq = Arc::clone(&seq);
                let base = base;
                Box::pin(async move {
                    let n = seq.fetch_add(1, Ordering::SeqCst);
                    // Second load reports an older cursor than the first.
                    let offset = if n == 0 { 10 } else { 5 };
                    let at = Cursor::from_datetime(
                        base.as_datetime() + chrono::Duration::seconds(offset),
                    );
                    Ok((n as u64, at))
                })
            })
        };
        let cache = cache(Duration::from_millis(10), loader);

        let first = cache.get_with_change().await.unwrap();
        tokio::time::advance(Duration::from_millis(20)).await;
        let second = cache.get_with_change().await.unwrap();
        assert!(second.last_change >= first.last_change);
    }
}
