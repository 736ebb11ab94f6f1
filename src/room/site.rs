//! Per-site room registry and online-count table.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::cache::TtlCache;
use crate::config::SyncConfig;
use crate::error::{CacheError, CacheResult};
use crate::room::RoomState;
use crate::store::{AccessPolicy, ChatStore};
use crate::types::{Changed, Cursor, RoomCount, RoomId, SiteId, UserId};

/// All rooms of a site, partitioned public/private. Rebuilt wholesale
/// per TTL window; room definitions churn far less than presence, so
/// there is no incremental merge here.
pub struct RoomsContainer {
    rooms: HashMap<RoomId, Arc<RoomState>>,
    public: Vec<RoomId>,
    private: Vec<RoomId>,
}

impl RoomsContainer {
    pub fn get(&self, room_id: RoomId) -> Option<&Arc<RoomState>> {
        self.rooms.get(&room_id)
    }

    pub fn public_ids(&self) -> &[RoomId] {
        &self.public
    }

    pub fn private_ids(&self) -> &[RoomId] {
        &self.private
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

/// TTL-cached room registry of one site plus the per-room online-count
/// table, with permission-filtered listings on top.
///
/// `RoomState` instances survive registry rebuilds: a rebuild reuses
/// the existing instance (publishing the freshly loaded metadata into
/// it) so per-room message and presence caches are not thrown away
/// every TTL window.
pub struct SiteRooms {
    site_id: SiteId,
    policy: Arc<dyn AccessPolicy>,
    rooms: TtlCache<Arc<RoomsContainer>>,
    counts: TtlCache<Arc<HashMap<RoomId, RoomCount>>>,
}

impl SiteRooms {
    pub fn new(
        site_id: SiteId,
        store: Arc<dyn ChatStore>,
        policy: Arc<dyn AccessPolicy>,
        config: &SyncConfig,
    ) -> Self {
        // Long-lived per-room instances, keyed by room id. The registry
        // loader reconciles this map against each wholesale load.
        let instances: Arc<DashMap<RoomId, Arc<RoomState>>> = Arc::new(DashMap::new());

        let rooms = TtlCache::new("site_rooms", &config.room_registry, {
            let store = Arc::clone(&store);
            let policy = Arc::clone(&policy);
            let config = config.clone();
            let instances = Arc::clone(&instances);
            Arc::new(move || {
                let store = Arc::clone(&store);
                let policy = Arc::clone(&policy);
                let config = config.clone();
                let instances = Arc::clone(&instances);
                Box::pin(async move {
                    let infos = store.load_site_rooms(site_id).await?;
                    let mut rooms = HashMap::with_capacity(infos.len());
                    let mut public = Vec::new();
                    let mut private = Vec::new();
                    let mut last_change: Option<Cursor> = None;

                    for info in infos {
                        let id = info.room_id;
                        last_change = Some(match last_change {
                            Some(c) => c.max(info.changed_at),
                            None => info.changed_at,
                        });
                        if info.is_public {
                            public.push(id);
                        } else {
                            private.push(id);
                        }
                        let room = match instances.get(&id) {
                            Some(existing) => {
                                existing.reload_info(info);
                                Arc::clone(&existing)
                            }
                            None => {
                                let room = Arc::new(RoomState::new(
                                    info,
                                    Arc::clone(&store),
                                    Arc::clone(&policy),
                                    &config,
                                ));
                                instances.insert(id, Arc::clone(&room));
                                room
                            }
                        };
                        rooms.insert(id, room);
                    }
                    // Rooms deleted from the site drop their state.
                    instances.retain(|id, _| rooms.contains_key(id));
                    public.sort();
                    private.sort();

                    debug!(site = site_id.0, rooms = rooms.len(), "room registry rebuilt");
                    let container = Arc::new(RoomsContainer { rooms, public, private });
                    Ok((container, last_change.unwrap_or_else(Cursor::now)))
                })
            })
        });

        let counts = TtlCache::new("site_online_counts", &config.online_counts, {
            let store = Arc::clone(&store);
            Arc::new(move || {
                let store = Arc::clone(&store);
                Box::pin(async move {
                    let counts = store.load_online_counts(site_id).await?;
                    let last_change = counts
                        .values()
                        .map(|c| c.changed_at)
                        .max()
                        .unwrap_or_else(Cursor::now);
                    Ok((Arc::new(counts), last_change))
                })
            })
        });

        Self {
            site_id,
            policy,
            rooms,
            counts,
        }
    }

    pub fn site_id(&self) -> SiteId {
        self.site_id
    }

    /// Room by id from the cached registry.
    pub async fn get_room(&self, room_id: RoomId) -> CacheResult<Option<Arc<RoomState>>> {
        let container = self.rooms.get().await?;
        Ok(container.get(room_id).cloned())
    }

    /// Room by id, rebuilding the registry once on a miss. Resolves a
    /// lookup racing a just-created room.
    pub async fn force_try_get_room(&self, room_id: RoomId) -> CacheResult<Option<Arc<RoomState>>> {
        if let Some(room) = self.get_room(room_id).await? {
            return Ok(Some(room));
        }
        self.force_update().await?;
        self.get_room(room_id).await
    }

    /// Throw the registry and count table away and rebuild now.
    pub async fn force_update(&self) -> CacheResult<()> {
        self.rooms.invalidate();
        self.counts.invalidate();
        self.rooms.get().await?;
        Ok(())
    }

    /// Rooms visible to `viewer` whose definition changed after `since`
    /// (all of them when the cursor is absent).
    pub async fn changed_rooms(
        &self,
        since: Option<Cursor>,
        viewer: Option<UserId>,
    ) -> CacheResult<Changed<Vec<Arc<RoomState>>>> {
        let registry = self.rooms.get_with_change().await?;
        let accessible = self.accessible_ids(&registry.items, viewer).await?;

        let mut out: Vec<Arc<RoomState>> = Vec::new();
        for id in accessible {
            if let Some(room) = registry.items.get(id) {
                let info = room.info();
                if since.is_none_or(|c| info.changed_at > c) {
                    out.push(Arc::clone(room));
                }
            }
        }
        out.sort_by_key(|r| r.room_id());
        Ok(Changed::new(out, registry.last_change))
    }

    /// Per-room online-user counts for one poll.
    ///
    /// Three shapes, selected by viewer identity and cursor:
    /// anonymous viewers see only public anonymous-allowed rooms; a
    /// first request returns every accessible count unfiltered; a
    /// subsequent request returns counts newer than the cursor, plus
    /// unconditional counts for every room the caller flags as changed
    /// this turn (a room just joined or left must report its fresh
    /// count even if the shared table has not refreshed yet). The
    /// flagged rooms are exempt from the cursor filter, so an answer
    /// may consist only of them; the envelope cursor is then clamped to
    /// the supplied one so the caller's next poll does not regress.
    pub async fn users_in_rooms_counts(
        &self,
        since: Option<Cursor>,
        viewer: Option<UserId>,
        changed_room_ids: &[RoomId],
    ) -> CacheResult<Option<Changed<Vec<RoomCount>>>> {
        let counts = self.counts.get_with_change().await?;
        let container = self.rooms.get().await?;
        let accessible = self.accessible_ids(&container, viewer).await?;

        let mut out: Vec<RoomCount> = Vec::new();
        let mut last_change = counts.last_change;
        match since {
            None => {
                for id in &accessible {
                    if let Some(count) = counts.items.get(id) {
                        out.push(*count);
                    }
                }
            }
            Some(cursor) => {
                let mut seen: HashSet<RoomId> = HashSet::new();
                for id in &accessible {
                    if let Some(count) = counts.items.get(id)
                        && count.changed_at > cursor
                    {
                        out.push(*count);
                        seen.insert(*id);
                    }
                }
                // Rooms the caller changed this turn are always included.
                for id in changed_room_ids {
                    if seen.contains(id) || !accessible.contains(id) {
                        continue;
                    }
                    if let Some(count) = counts.items.get(id) {
                        out.push(*count);
                        seen.insert(*id);
                    }
                }
                if out.is_empty() {
                    return Ok(None);
                }
                last_change = last_change.max(cursor);
            }
        }
        out.sort_by_key(|c| c.room_id);
        Ok(Some(Changed::new(out, last_change)))
    }

    async fn accessible_ids(
        &self,
        container: &RoomsContainer,
        viewer: Option<UserId>,
    ) -> CacheResult<Vec<RoomId>> {
        let mut ids: Vec<RoomId> = Vec::new();
        match viewer {
            None => {
                for id in container.public_ids() {
                    if let Some(room) = container.get(*id)
                        && room.info().visible_to_anonymous()
                    {
                        ids.push(*id);
                    }
                }
            }
            Some(user) => {
                for id in container.public_ids() {
                    if let Some(room) = container.get(*id)
                        && room.info().is_enabled
                    {
                        ids.push(*id);
                    }
                }
                let joinable = self
                    .policy
                    .joinable_rooms(self.site_id, user)
                    .await
                    .map_err(CacheError::load)?;
                for id in container.private_ids() {
                    if joinable.contains(id) {
                        ids.push(*id);
                    }
                }
            }
        }
        Ok(ids)
    }
}
