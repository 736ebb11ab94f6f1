//! Cache configuration.
//!
//! TTLs here bound staleness, they are not request timeouts. All values
//! are seconds-scale and configurable per cache instance.

use std::time::Duration;

use serde::Deserialize;

/// Configuration for a single cache instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum staleness tolerated before the next access recomputes.
    pub ttl: Duration,

    /// Upper bound on the number of parameter buckets a parametrized
    /// cache may hold. Ignored by single-slot and state caches.
    pub max_buckets: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5),
            max_buckets: 10_000,
        }
    }
}

impl CacheConfig {
    /// Set the TTL (builder pattern).
    #[must_use]
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the bucket capacity bound (builder pattern).
    #[must_use]
    pub fn max_buckets(mut self, max_buckets: u64) -> Self {
        self.max_buckets = max_buckets;
        self
    }

    /// Config for room presence. Short TTL, correctness-sensitive data.
    pub fn presence() -> Self {
        Self::default().ttl(Duration::from_secs(5))
    }

    /// Config for message page buckets. Very short TTL, one bucket per
    /// distinct `{since, max_count}` query, so keep the bound high.
    pub fn messages() -> Self {
        Self::default()
            .ttl(Duration::from_secs(3))
            .max_buckets(10_000)
    }

    /// Config for the kicked-user set. Slightly longer TTL, kick state
    /// changes rarely and has an explicit invalidate path.
    pub fn kicked() -> Self {
        Self::default().ttl(Duration::from_secs(10))
    }

    /// Config for the per-site room registry. Room definitions churn far
    /// less than presence.
    pub fn room_registry() -> Self {
        Self::default().ttl(Duration::from_secs(30))
    }

    /// Config for per-room online-count tables.
    pub fn online_counts() -> Self {
        Self::default().ttl(Duration::from_secs(5))
    }

    /// Config for the pending-support queue buckets, keyed by cursor.
    pub fn support_queue() -> Self {
        Self::default()
            .ttl(Duration::from_secs(3))
            .max_buckets(1_000)
    }

    /// Config for the "is any support agent online" flag.
    pub fn support_presence() -> Self {
        Self::default().ttl(Duration::from_secs(15))
    }
}

/// Per-site bundle of cache configurations, one per cache instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub presence: CacheConfig,
    pub messages: CacheConfig,
    pub newest_message: CacheConfig,
    pub kicked: CacheConfig,
    pub room_registry: CacheConfig,
    pub online_counts: CacheConfig,
    pub site_presence: CacheConfig,
    pub support_queue: CacheConfig,
    pub support_presence: CacheConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            presence: CacheConfig::presence(),
            messages: CacheConfig::messages(),
            newest_message: CacheConfig::messages(),
            kicked: CacheConfig::kicked(),
            room_registry: CacheConfig::room_registry(),
            online_counts: CacheConfig::online_counts(),
            site_presence: CacheConfig::presence(),
            support_queue: CacheConfig::support_queue(),
            support_presence: CacheConfig::support_presence(),
        }
    }
}
