//! Incremental materialized-state cache.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::types::{Changed, Cursor, StateItem};

/// Wholesale loader returning the entire current state.
pub type FullLoader<V> = Arc<
    dyn Fn() -> BoxFuture<'static, anyhow::Result<HashMap<<V as StateItem>::Key, V>>>
        + Send
        + Sync,
>;

/// Incremental loader returning only records changed after a cursor.
pub type DeltaLoader<V> =
    Arc<dyn Fn(Cursor) -> BoxFuture<'static, anyhow::Result<Vec<V>>> + Send + Sync>;

/// Authoritative point lookup for a single key.
pub type PointLoader<V> = Arc<
    dyn Fn(<V as StateItem>::Key) -> BoxFuture<'static, anyhow::Result<Option<V>>> + Send + Sync,
>;

struct State<V: StateItem> {
    map: Arc<HashMap<V::Key, V>>,
    /// Max per-item change time seen so far, non-decreasing.
    last_change: Cursor,
    /// The map reflects every store change up to this cursor. Advanced
    /// only by full and delta reloads; a point lookup merged in may be
    /// newer than it, so it is the floor the next delta loads from.
    loaded_through: Cursor,
    /// Cursor floor: since-queries older than this cannot be answered
    /// from the map (entries deleted before the wholesale load are
    /// gone) and force another wholesale load.
    full_loaded_at: Cursor,
    full_loaded_instant: Instant,
    computed_at: Instant,
}

struct Flight {
    last_failure: Option<(u64, CacheError)>,
}

/// A materialized current-state map answering arbitrary since-queries
/// by per-item change time.
///
/// The map is refreshed either wholesale (full loader) or by merging an
/// incremental "changed since" load by key, so periodic refresh cost is
/// proportional to churn, not room size. Readers always get immutable
/// snapshots; the map is replaced whole, never mutated in place.
///
/// Presence and kick state are safety-sensitive, so besides the cheap
/// periodic path there are two certain paths: [`StateCache::force_get`]
/// resolves a read-after-write miss with one point lookup, and
/// [`StateCache::update_and_get`] forces a wholesale reload when an
/// item's fields (not just presence) may be stale.
pub struct StateCache<V: StateItem> {
    name: &'static str,
    ttl: Duration,
    load_full: FullLoader<V>,
    load_delta: Option<DeltaLoader<V>>,
    load_one: Option<PointLoader<V>>,
    state: RwLock<Option<Arc<State<V>>>>,
    flight: tokio::sync::Mutex<Flight>,
    refresh_gen: AtomicU64,
}

impl<V: StateItem> StateCache<V> {
    pub fn new(
        name: &'static str,
        config: &CacheConfig,
        load_full: FullLoader<V>,
        load_delta: Option<DeltaLoader<V>>,
        load_one: Option<PointLoader<V>>,
    ) -> Self {
        Self {
            name,
            ttl: config.ttl,
            load_full,
            load_delta,
            load_one,
            state: RwLock::new(None),
            flight: tokio::sync::Mutex::new(Flight { last_failure: None }),
            refresh_gen: AtomicU64::new(0),
        }
    }

    /// Full snapshot plus the max per-item change time ("now" when the
    /// state is empty), refreshing first if the TTL expired.
    pub async fn current_with_change(&self) -> CacheResult<Changed<Arc<HashMap<V::Key, V>>>> {
        let state = self.ensure_fresh(None).await?;
        Ok(Changed::new(Arc::clone(&state.map), state.last_change))
    }

    /// Items whose individual change time exceeds `since`, or `None` if
    /// nothing is newer. Without a cursor, the full current state.
    pub async fn latest_since(&self, since: Option<Cursor>) -> CacheResult<Option<Changed<Vec<V>>>> {
        let state = self.ensure_fresh(since).await?;
        let items: Vec<V> = match since {
            None => state.map.values().cloned().collect(),
            Some(c) => state
                .map
                .values()
                .filter(|v| v.changed_at() > c)
                .cloned()
                .collect(),
        };
        if items.is_empty() {
            return Ok(None);
        }
        Ok(Some(Changed::new(items, state.last_change)))
    }

    /// Cached item for `key`; on a miss, one immediate authoritative
    /// point lookup (bypassing the TTL), merged back into the snapshot.
    /// Does not rebuild the whole map.
    pub async fn force_get(&self, key: V::Key) -> CacheResult<Option<V>> {
        let state = self.ensure_fresh(None).await?;
        if let Some(v) = state.map.get(&key) {
            return Ok(Some(v.clone()));
        }
        let Some(load_one) = self.load_one.clone() else {
            return Ok(None);
        };
        debug!(cache = self.name, "point lookup for missing key");
        match load_one(key).await.map_err(CacheError::load)? {
            Some(v) => {
                self.merge_one(v.clone());
                Ok(Some(v))
            }
            None => Ok(None),
        }
    }

    /// Force a wholesale authoritative reload, then look `key` up.
    /// For callers that must rule out stale item fields, not just
    /// stale presence.
    pub async fn update_and_get(&self, key: &V::Key) -> CacheResult<Option<V>> {
        let mut flight = self.flight.lock().await;
        let state = self.reload_full(&mut flight).await?;
        Ok(state.map.get(key).cloned())
    }

    async fn ensure_fresh(&self, since: Option<Cursor>) -> CacheResult<Arc<State<V>>> {
        let observed_gen = self.refresh_gen.load(Ordering::Acquire);
        let arrived = Instant::now();
        if let Some(state) = self.read()
            && self.is_fresh(&state)
            && !needs_full(&state, since)
        {
            return Ok(state);
        }

        let mut flight = self.flight.lock().await;

        if let Some(state) = self.read() {
            let full_since_arrival = state.full_loaded_instant >= arrived;
            let full_satisfied = !needs_full(&state, since) || full_since_arrival;
            if self.is_fresh(&state) && full_satisfied {
                return Ok(state);
            }
            if let Some((failed_gen, err)) = &flight.last_failure
                && *failed_gen > observed_gen
            {
                return Err(err.clone());
            }
            if !full_satisfied {
                // Cursor predates the last wholesale load.
                return self.reload_full(&mut flight).await;
            }
            if let Some(delta) = self.load_delta.clone() {
                return self.reload_delta(&mut flight, state, delta).await;
            }
            return self.reload_full(&mut flight).await;
        }

        if let Some((failed_gen, err)) = &flight.last_failure
            && *failed_gen > observed_gen
        {
            return Err(err.clone());
        }
        self.reload_full(&mut flight).await
    }

    async fn reload_full(&self, flight: &mut Flight) -> CacheResult<Arc<State<V>>> {
        match (self.load_full)().await {
            Ok(map) => {
                flight.last_failure = None;
                let loaded = map
                    .values()
                    .map(StateItem::changed_at)
                    .max()
                    .unwrap_or_else(Cursor::now);
                let last_change = match self.read() {
                    Some(prev) => prev.last_change.max(loaded),
                    None => loaded,
                };
                let now = Instant::now();
                let state = Arc::new(State {
                    map: Arc::new(map),
                    last_change,
                    loaded_through: loaded,
                    full_loaded_at: last_change,
                    full_loaded_instant: now,
                    computed_at: now,
                });
                debug!(cache = self.name, entries = state.map.len(), "wholesale reload");
                *self.state.write() = Some(Arc::clone(&state));
                Ok(state)
            }
            Err(e) => {
                let err = CacheError::load(e);
                let generation = self.refresh_gen.fetch_add(1, Ordering::AcqRel) + 1;
                flight.last_failure = Some((generation, err.clone()));
                warn!(cache = self.name, error = %err, "wholesale reload failed");
                Err(err)
            }
        }
    }

    async fn reload_delta(
        &self,
        flight: &mut Flight,
        prev: Arc<State<V>>,
        delta: DeltaLoader<V>,
    ) -> CacheResult<Arc<State<V>>> {
        // The delta floor, not the advertised cursor: a point lookup may
        // have raised `last_change` past store changes not yet absorbed.
        match delta(prev.loaded_through).await {
            Ok(items) => {
                flight.last_failure = None;
                let state = if items.is_empty() {
                    Arc::new(State {
                        map: Arc::clone(&prev.map),
                        last_change: prev.last_change,
                        loaded_through: prev.loaded_through,
                        full_loaded_at: prev.full_loaded_at,
                        full_loaded_instant: prev.full_loaded_instant,
                        computed_at: Instant::now(),
                    })
                } else {
                    let mut map = (*prev.map).clone();
                    let mut last_change = prev.last_change;
                    let mut loaded_through = prev.loaded_through;
                    for v in items {
                        last_change = last_change.max(v.changed_at());
                        loaded_through = loaded_through.max(v.changed_at());
                        map.insert(v.key(), v);
                    }
                    debug!(cache = self.name, "incremental merge");
                    Arc::new(State {
                        map: Arc::new(map),
                        last_change,
                        loaded_through,
                        full_loaded_at: prev.full_loaded_at,
                        full_loaded_instant: prev.full_loaded_instant,
                        computed_at: Instant::now(),
                    })
                };
                *self.state.write() = Some(Arc::clone(&state));
                Ok(state)
            }
            Err(e) => {
                let err = CacheError::load(e);
                let generation = self.refresh_gen.fetch_add(1, Ordering::AcqRel) + 1;
                flight.last_failure = Some((generation, err.clone()));
                warn!(cache = self.name, error = %err, "incremental reload failed");
                Err(err)
            }
        }
    }

    fn merge_one(&self, v: V) {
        let mut guard = self.state.write();
        if let Some(cur) = guard.as_ref() {
            let mut map = (*cur.map).clone();
            let last_change = cur.last_change.max(v.changed_at());
            map.insert(v.key(), v);
            *guard = Some(Arc::new(State {
                map: Arc::new(map),
                last_change,
                // Not advanced: the merged item says nothing about other
                // keys that changed before it.
                loaded_through: cur.loaded_through,
                full_loaded_at: cur.full_loaded_at,
                full_loaded_instant: cur.full_loaded_instant,
                computed_at: cur.computed_at,
            }));
        }
    }

    fn read(&self) -> Option<Arc<State<V>>> {
        self.state.read().clone()
    }

    fn is_fresh(&self, state: &State<V>) -> bool {
        state.computed_at.elapsed() <= self.ttl
    }
}

fn needs_full<V: StateItem>(state: &State<V>, since: Option<Cursor>) -> bool {
    since.is_some_and(|s| s < state.full_loaded_at)
}
