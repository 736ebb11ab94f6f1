//! Per-site aggregate and the registry owning all site state.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::cache::{StateCache, TtlCache};
use crate::config::SyncConfig;
use crate::error::CacheResult;
use crate::room::{SiteRooms, SupportRooms};
use crate::store::{AccessPolicy, ChatStore};
use crate::types::{Changed, Cursor, OnlineUser, SiteId};

/// Everything cached for one site: the room registry, the site-wide
/// online-user roster, support presence and the pending-support queue.
pub struct SiteState {
    site_id: SiteId,
    rooms: SiteRooms,
    support: SupportRooms,
    online_users: StateCache<OnlineUser>,
    support_online: TtlCache<bool>,
}

impl SiteState {
    pub fn new(
        site_id: SiteId,
        store: Arc<dyn ChatStore>,
        policy: Arc<dyn AccessPolicy>,
        config: &SyncConfig,
    ) -> Self {
        let rooms = SiteRooms::new(site_id, Arc::clone(&store), Arc::clone(&policy), config);
        let support = SupportRooms::new(site_id, Arc::clone(&store), config);

        let online_users = StateCache::new(
            "site_online_users",
            &config.site_presence,
            {
                let store = Arc::clone(&store);
                Arc::new(move || {
                    let store = Arc::clone(&store);
                    Box::pin(async move { store.load_site_online_users(site_id).await })
                })
            },
            Some({
                let store = Arc::clone(&store);
                Arc::new(move |since| {
                    let store = Arc::clone(&store);
                    Box::pin(async move {
                        store.load_site_online_users_since(site_id, since).await
                    })
                })
            }),
            None,
        );

        let support_online = TtlCache::new("site_support_online", &config.support_presence, {
            let store = Arc::clone(&store);
            Arc::new(move || {
                let store = Arc::clone(&store);
                Box::pin(async move {
                    let online = store.load_support_online(site_id).await?;
                    Ok((online, Cursor::now()))
                })
            })
        });

        Self {
            site_id,
            rooms,
            support,
            online_users,
            support_online,
        }
    }

    pub fn site_id(&self) -> SiteId {
        self.site_id
    }

    pub fn rooms(&self) -> &SiteRooms {
        &self.rooms
    }

    pub fn support(&self) -> &SupportRooms {
        &self.support
    }

    /// Site-wide online users changed since `since`.
    pub async fn online_users(
        &self,
        since: Option<Cursor>,
    ) -> CacheResult<Option<Changed<Vec<OnlineUser>>>> {
        self.online_users.latest_since(since).await
    }

    /// Whether any support agent is online. Pollers use this to decide
    /// if the support queue is worth asking about at all.
    pub async fn is_support_online(&self) -> CacheResult<bool> {
        self.support_online.get().await
    }
}

/// Owner of all per-site caches. Sites are created lazily on first
/// access; there is no hidden process-wide state, everything dies with
/// the registry.
pub struct SiteRegistry {
    store: Arc<dyn ChatStore>,
    policy: Arc<dyn AccessPolicy>,
    config: SyncConfig,
    sites: DashMap<SiteId, Arc<SiteState>>,
}

impl SiteRegistry {
    pub fn new(
        store: Arc<dyn ChatStore>,
        policy: Arc<dyn AccessPolicy>,
        config: SyncConfig,
    ) -> Self {
        info!("site registry initialized");
        Self {
            store,
            policy,
            config,
            sites: DashMap::new(),
        }
    }

    /// The state of `site_id`, created on first access.
    pub fn site(&self, site_id: SiteId) -> Arc<SiteState> {
        if let Some(site) = self.sites.get(&site_id) {
            return Arc::clone(&site);
        }
        let entry = self.sites.entry(site_id).or_insert_with(|| {
            debug!(site = site_id.0, "site state created");
            Arc::new(SiteState::new(
                site_id,
                Arc::clone(&self.store),
                Arc::clone(&self.policy),
                &self.config,
            ))
        });
        Arc::clone(&entry)
    }

    /// Drop a site's caches entirely (site deleted or disabled).
    pub fn remove(&self, site_id: SiteId) -> bool {
        self.sites.remove(&site_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}
