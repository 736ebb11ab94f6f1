//! Per-room and per-site domain caches, composed from the generic
//! wrappers in [`crate::cache`].

mod site;
mod state;
mod support;

pub use site::{RoomsContainer, SiteRooms};
pub use state::RoomState;
pub use support::{SupportQueueKey, SupportRooms};
