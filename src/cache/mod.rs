//! Generic cache wrappers.
//!
//! Three building blocks, composed by the domain layer:
//!
//! - [`TtlCache`] - a single cached value, recomputed on demand when
//!   stale (single-flight).
//! - [`ParamCache`] - one TTL bucket per distinct query-parameter
//!   identity; memoizes exact queries for a short window.
//! - [`StateCache`] - a materialized current-state map, refreshed
//!   wholesale or by merging an incremental "changed since" load.
//!
//! All refresh is pull-based: nothing runs in the background, the
//! request that discovers staleness pays for the reload. Every loader
//! runs under strict single-flight rather than stale-while-revalidate;
//! presence and kick state must not be served half-refreshed.

mod param;
mod state;
mod ttl;

pub use param::{ParamCache, ParamLoader};
pub use state::{DeltaLoader, FullLoader, PointLoader, StateCache};
pub use ttl::{SlotLoader, TtlCache};
