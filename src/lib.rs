//! Roomsync - presence and message synchronization cache
//!
//! An in-memory cache layer backing a polling-based live chat feature.
//! Participants and support agents repeatedly ask "what changed since
//! cursor T" for room messages, online rosters and the pending-support
//! queue; this crate answers those polls cheaply without hammering the
//! backing store, never silently drops an update, and applies
//! per-viewer visibility rules downstream of data shared across
//! viewers.
//!
//! ## Architecture
//!
//! - `cache` - generic wrappers: single-slot TTL cache, parametrized
//!   query-memoization cache, incremental materialized-state cache
//! - `room` - domain caches composed from the wrappers: per-room state,
//!   per-site room registry and counts, pending-support queue
//! - `site` - per-site aggregate and the registry owning all of it
//! - `store` - backing-store and access-policy collaborator traits
//! - `config` - per-cache TTL configuration
//!
//! Everything is pull-based: no background refresh task exists, the
//! request that discovers staleness pays for the reload, so backend
//! load tracks polling traffic directly. The cache is single-process
//! and volatile; durability and replication belong to the store behind
//! it.
//!
//! ## Cursor contract
//!
//! Callers echo back exactly the `last_change` they last received as
//! the next `since`. An absent cursor asks for a full snapshot plus a
//! fresh initial cursor.

pub mod cache;
pub mod config;
pub mod error;
pub mod room;
pub mod site;
pub mod store;
pub mod types;

pub use config::{CacheConfig, SyncConfig};
pub use error::{CacheError, CacheResult};
pub use room::{RoomState, RoomsContainer, SiteRooms, SupportRooms};
pub use site::{SiteRegistry, SiteState};
pub use types::{
    Changed, ChatMessage, Cursor, KickedUsers, MessageBatch, MessageKind, MessagePageKey,
    OnlineUser, RoomCount, RoomId, RoomInfo, SiteId, SupportQueueEntry, SupportRoomRecord, UserId,
};
