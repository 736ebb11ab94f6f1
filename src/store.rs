//! Backing-store and access-policy collaborator contracts.
//!
//! The cache layer never talks to a database directly; it consumes
//! these traits. Implementations live in the host application (the
//! authoritative store, session/permission lookups). Every method is a
//! bounded round trip, assumed fast.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use async_trait::async_trait;

use crate::types::{
    ChatMessage, Cursor, KickedUsers, MessagePageKey, OnlineUser, RoomCount, RoomId, RoomInfo,
    SiteId, SupportRoomRecord, UserId,
};

/// Authoritative chat store.
///
/// `*_since` methods return only records whose change time is strictly
/// greater than the given cursor, so incremental refresh cost tracks
/// churn rather than room size.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn load_all_online_users(&self, room: RoomId) -> Result<HashMap<UserId, OnlineUser>>;

    async fn load_online_users_since(&self, room: RoomId, since: Cursor) -> Result<Vec<OnlineUser>>;

    /// Authoritative point lookup of a single user's presence, used to
    /// resolve read-after-write races without rebuilding the map.
    async fn load_online_user(&self, room: RoomId, user: UserId) -> Result<Option<OnlineUser>>;

    async fn load_latest_messages(
        &self,
        room: RoomId,
        query: MessagePageKey,
    ) -> Result<Vec<ChatMessage>>;

    async fn load_newest_message_time(&self, room: RoomId) -> Result<Option<Cursor>>;

    async fn load_kicked_users(&self, room: RoomId) -> Result<KickedUsers>;

    async fn load_site_rooms(&self, site: SiteId) -> Result<Vec<RoomInfo>>;

    async fn load_online_counts(&self, site: SiteId) -> Result<HashMap<RoomId, RoomCount>>;

    async fn load_site_online_users(&self, site: SiteId) -> Result<HashMap<UserId, OnlineUser>>;

    async fn load_site_online_users_since(
        &self,
        site: SiteId,
        since: Cursor,
    ) -> Result<Vec<OnlineUser>>;

    /// Rooms waiting for support attention. With a cursor, only rooms
    /// whose taken/resolved state changed after it.
    async fn load_pending_support_rooms(
        &self,
        site: SiteId,
        since: Option<Cursor>,
    ) -> Result<Vec<SupportRoomRecord>>;

    /// Whether any support agent is currently online for the site.
    async fn load_support_online(&self, site: SiteId) -> Result<bool>;
}

/// Settings/permission collaborator.
#[async_trait]
pub trait AccessPolicy: Send + Sync {
    /// System-message kinds that appear in a room's initial history for
    /// this site. Text and whispers are always included on top of this.
    async fn first_load_kinds(&self, site: SiteId) -> Result<HashSet<crate::types::MessageKind>>;

    /// Private rooms the user has join rights to.
    async fn joinable_rooms(&self, site: SiteId, user: UserId) -> Result<HashSet<RoomId>>;
}
