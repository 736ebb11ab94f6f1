//! Cached state of a single chat room.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::cache::{ParamCache, StateCache, TtlCache};
use crate::config::SyncConfig;
use crate::error::{CacheError, CacheResult};
use crate::store::{AccessPolicy, ChatStore};
use crate::types::{
    Changed, ChatMessage, Cursor, KickedUsers, MessageBatch, MessagePageKey, OnlineUser, RoomId,
    RoomInfo, UserId,
};

/// All cached state of one room: message history pages, the online-user
/// roster and the kicked-user set, plus a swappable [`RoomInfo`]
/// snapshot.
///
/// The info snapshot is replaced whole via [`RoomState::reload_info`],
/// never mutated field by field, so readers cannot observe a
/// half-updated room.
pub struct RoomState {
    room_id: RoomId,
    info: RwLock<Arc<RoomInfo>>,
    policy: Arc<dyn AccessPolicy>,
    online: StateCache<OnlineUser>,
    messages: ParamCache<MessagePageKey, ChatMessage>,
    newest_message: TtlCache<Cursor>,
    kicked: TtlCache<KickedUsers>,
}

impl RoomState {
    pub fn new(
        info: RoomInfo,
        store: Arc<dyn ChatStore>,
        policy: Arc<dyn AccessPolicy>,
        config: &SyncConfig,
    ) -> Self {
        let room_id = info.room_id;

        let online = StateCache::new(
            "room_online_users",
            &config.presence,
            {
                let store = Arc::clone(&store);
                Arc::new(move || {
                    let store = Arc::clone(&store);
                    Box::pin(async move { store.load_all_online_users(room_id).await })
                })
            },
            Some({
                let store = Arc::clone(&store);
                Arc::new(move |since| {
                    let store = Arc::clone(&store);
                    Box::pin(async move { store.load_online_users_since(room_id, since).await })
                })
            }),
            Some({
                let store = Arc::clone(&store);
                Arc::new(move |user| {
                    let store = Arc::clone(&store);
                    Box::pin(async move { store.load_online_user(room_id, user).await })
                })
            }),
        );

        let messages = ParamCache::new("room_messages", &config.messages, {
            let store = Arc::clone(&store);
            Arc::new(move |key: MessagePageKey| {
                let store = Arc::clone(&store);
                Box::pin(async move {
                    let items = store.load_latest_messages(room_id, key).await?;
                    let last_change = items
                        .iter()
                        .map(|m| m.sent_at)
                        .max()
                        .unwrap_or_else(Cursor::now);
                    Ok((items, last_change))
                })
            })
        });

        let newest_message = TtlCache::new("room_newest_message", &config.newest_message, {
            let store = Arc::clone(&store);
            Arc::new(move || {
                let store = Arc::clone(&store);
                Box::pin(async move {
                    let newest = store
                        .load_newest_message_time(room_id)
                        .await?
                        .unwrap_or_else(Cursor::now);
                    Ok((newest, newest))
                })
            })
        });

        let kicked = TtlCache::new("room_kicked_users", &config.kicked, {
            let store = Arc::clone(&store);
            Arc::new(move || {
                let store = Arc::clone(&store);
                Box::pin(async move {
                    let set = store.load_kicked_users(room_id).await?;
                    Ok((set, Cursor::now()))
                })
            })
        });

        Self {
            room_id,
            info: RwLock::new(Arc::new(info)),
            policy,
            online,
            messages,
            newest_message,
            kicked,
        }
    }

    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    /// Current room metadata snapshot.
    pub fn info(&self) -> Arc<RoomInfo> {
        Arc::clone(&self.info.read())
    }

    /// Publish a fresh metadata snapshot atomically.
    pub fn reload_info(&self, new: RoomInfo) {
        debug!(room = self.room_id.0, "room info reloaded");
        *self.info.write() = Arc::new(new);
    }

    /// Message history for one poll.
    ///
    /// `max_count == Some(0)` on a first request means the caller wants
    /// no backlog, only a cursor to tail from: the answer carries
    /// `messages: None` and the newest message time, and the message
    /// page cache is never touched.
    ///
    /// On a first request, system messages are restricted to the site's
    /// allow-list (text and whispers always pass). On subsequent
    /// requests no kind filter applies; the cursor already bounds the
    /// result. Whisper visibility is evaluated per caller on top of the
    /// shared bucket, never cached.
    pub async fn get_messages(
        &self,
        max_count: Option<usize>,
        since: Option<Cursor>,
        first_request: bool,
        caller: Option<UserId>,
    ) -> CacheResult<Option<MessageBatch>> {
        if first_request && max_count == Some(0) {
            let newest = self.newest_message.get().await?;
            return Ok(Some(MessageBatch {
                messages: None,
                last_change: newest,
            }));
        }

        let key = MessagePageKey { since, max_count };

        if first_request {
            let site = self.info().site_id;
            let allowed = self
                .policy
                .first_load_kinds(site)
                .await
                .map_err(CacheError::load)?;
            let bucket = self.messages.get(key).await?;
            let messages: Vec<ChatMessage> = bucket
                .items
                .iter()
                .filter(|m| m.kind.always_visible() || allowed.contains(&m.kind))
                .filter(|m| m.visible_to(caller))
                .cloned()
                .collect();
            // A first request always yields a batch, even an empty one,
            // so the caller gets an initial cursor.
            return Ok(Some(MessageBatch {
                messages: Some(messages),
                last_change: bucket.last_change,
            }));
        }

        let got = self
            .messages
            .get_filtered(key, |m| m.visible_to(caller))
            .await?;
        Ok(got.map(|c| MessageBatch {
            messages: Some(c.items),
            last_change: c.last_change,
        }))
    }

    /// Online-user roster changes since `since` (everything when the
    /// cursor is absent). Records flagged offline are leave events.
    pub async fn get_online_users(
        &self,
        since: Option<Cursor>,
    ) -> CacheResult<Option<Changed<Vec<OnlineUser>>>> {
        self.online.latest_since(since).await
    }

    /// Seconds remaining of `user`'s kick, or `None` if not kicked.
    pub async fn is_user_kicked(&self, user: UserId) -> CacheResult<Option<i64>> {
        let kicked = self.kicked.get().await?;
        Ok(kicked
            .kicked_until(user)
            .filter(|until| *until > Cursor::now())
            .map(|until| until.seconds_from_now()))
    }

    /// Presence check that must not answer from a stale reading.
    ///
    /// A cache miss triggers a point lookup; a cached record flagged
    /// offline escalates to a wholesale reload to rule out a stale
    /// "offline" before answering no.
    pub async fn force_is_user_online(&self, user: UserId) -> CacheResult<bool> {
        match self.online.force_get(user).await? {
            Some(u) if u.is_online => Ok(true),
            Some(_) => Ok(self
                .online
                .update_and_get(&user)
                .await?
                .map(|u| u.is_online)
                .unwrap_or(false)),
            None => Ok(false),
        }
    }

    /// Force the next kick check to hit the store.
    pub fn invalidate_kicked_users(&self) {
        self.kicked.invalidate();
    }
}
