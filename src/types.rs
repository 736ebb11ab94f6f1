//! Core identifiers, cursors and domain records.
//!
//! Everything here is plain data. Records returned to callers are
//! snapshots: once handed out they are never mutated by the cache.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque, strictly-ordered change cursor.
///
/// Callers echo the `last_change` they received back as the next
/// `since` value. An absent cursor means "give me everything now".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(DateTime<Utc>);

impl Cursor {
    /// Current instant as a cursor. Used to stamp empty states so the
    /// caller still gets something to tail from.
    pub fn now() -> Self {
        Self(Utc::now())
    }

    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Self(at)
    }

    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    /// Whole seconds between `self` and now, clamped at zero.
    /// Used for kick expiry countdowns.
    pub fn seconds_from_now(&self) -> i64 {
        (self.0 - Utc::now()).num_seconds().max(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

/// Envelope for every "what changed since" answer: the payload plus the
/// cursor to echo back on the next poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Changed<T> {
    pub items: T,
    pub last_change: Cursor,
}

impl<T> Changed<T> {
    pub fn new(items: T, last_change: Cursor) -> Self {
        Self { items, last_change }
    }
}

/// Items held by an incremental state cache carry their own key and
/// per-item change time, distinct from the cache bucket's `last_change`.
pub trait StateItem: Clone + Send + Sync + 'static {
    type Key: std::hash::Hash + Eq + Clone + Send + Sync + 'static;

    fn key(&self) -> Self::Key;
    fn changed_at(&self) -> Cursor;
}

/// One user's presence record in a room (or site-wide).
///
/// A record with `is_online == false` is a leave event: it stays in the
/// materialized state so pollers learn about the departure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineUser {
    pub user_id: UserId,
    pub nickname: String,
    pub is_online: bool,
    pub changed_at: Cursor,
}

impl StateItem for OnlineUser {
    type Key = UserId;

    fn key(&self) -> UserId {
        self.user_id
    }

    fn changed_at(&self) -> Cursor {
        self.changed_at
    }
}

/// Message classification. `Text` and `Whisper` are always included in
/// history; the system kinds are subject to the site's first-load
/// allow-list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Whisper,
    Joined,
    Left,
    Kicked,
    NicknameChanged,
}

impl MessageKind {
    /// Kinds that appear in initial history regardless of site settings.
    pub fn always_visible(&self) -> bool {
        matches!(self, Self::Text | Self::Whisper)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: i64,
    pub room_id: RoomId,
    pub author: UserId,
    pub author_name: String,
    pub kind: MessageKind,
    pub body: String,
    /// Addressee of a whisper. Whispers are visible only to the author
    /// and this user.
    pub whisper_to: Option<UserId>,
    pub sent_at: Cursor,
}

impl ChatMessage {
    /// Per-viewer visibility. Evaluated per call, never cached.
    pub fn visible_to(&self, viewer: Option<UserId>) -> bool {
        match self.kind {
            MessageKind::Whisper => {
                viewer.is_some() && (viewer == Some(self.author) || viewer == self.whisper_to)
            }
            _ => true,
        }
    }
}

/// Parameters of one message-history query. Used as the structured
/// bucket key of the message page cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessagePageKey {
    pub since: Option<Cursor>,
    pub max_count: Option<usize>,
}

/// Room metadata snapshot. Replaced whole on reload, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub room_id: RoomId,
    pub site_id: SiteId,
    pub name: String,
    pub topic: Option<String>,
    pub is_public: bool,
    pub is_enabled: bool,
    pub allow_anonymous: bool,
    pub changed_at: Cursor,
}

impl RoomInfo {
    /// Whether an anonymous visitor may see this room at all.
    pub fn visible_to_anonymous(&self) -> bool {
        self.is_public && self.is_enabled && self.allow_anonymous
    }
}

/// The set of currently kicked users of a room, with kick expiry times.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KickedUsers {
    until_by_user: HashMap<UserId, Cursor>,
}

impl KickedUsers {
    pub fn new(until_by_user: HashMap<UserId, Cursor>) -> Self {
        Self { until_by_user }
    }

    /// Kick expiry for `user`, if currently kicked.
    pub fn kicked_until(&self, user: UserId) -> Option<Cursor> {
        self.until_by_user.get(&user).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.until_by_user.is_empty()
    }
}

/// Live online-user count of one room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomCount {
    pub room_id: RoomId,
    pub online: u32,
    pub changed_at: Cursor,
}

/// A room waiting for support attention, as loaded from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupportRoomRecord {
    pub room_id: RoomId,
    pub name: String,
    pub unread: u32,
    /// Agent currently handling the room, if any.
    pub taken_by: Option<UserId>,
    /// When the taken/resolved state last changed.
    pub state_changed: Cursor,
}

/// A support-queue delta as seen by one particular agent.
///
/// `removed == true` means the room left this agent's queue (taken by
/// someone else, or resolved).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupportQueueEntry {
    pub room_id: RoomId,
    pub name: String,
    pub unread: u32,
    pub is_taken: bool,
    pub removed: bool,
}

/// Result of a room's message query.
///
/// `messages` is `None` when the caller asked for no backlog
/// (`max_count == 0` on a first request) and only wants a cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBatch {
    pub messages: Option<Vec<ChatMessage>>,
    pub last_change: Cursor,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(kind: MessageKind, author: i64, whisper_to: Option<i64>) -> ChatMessage {
        ChatMessage {
            id: 1,
            room_id: RoomId(1),
            author: UserId(author),
            author_name: "a".into(),
            kind,
            body: "hi".into(),
            whisper_to: whisper_to.map(UserId),
            sent_at: Cursor::now(),
        }
    }

    #[test]
    fn whisper_visible_only_to_author_and_addressee() {
        let m = msg(MessageKind::Whisper, 1, Some(2));
        assert!(m.visible_to(Some(UserId(1))));
        assert!(m.visible_to(Some(UserId(2))));
        assert!(!m.visible_to(Some(UserId(3))));
        assert!(!m.visible_to(None));
    }

    #[test]
    fn text_visible_to_everyone() {
        let m = msg(MessageKind::Text, 1, None);
        assert!(m.visible_to(Some(UserId(3))));
        assert!(m.visible_to(None));
    }

    #[test]
    fn cursor_ordering_follows_time() {
        let a = Cursor::now();
        let b = Cursor::from_datetime(a.as_datetime() + chrono::Duration::seconds(1));
        assert!(b > a);
    }
}
