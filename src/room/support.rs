//! Pending-support queue cache.

use std::sync::Arc;

use crate::cache::ParamCache;
use crate::config::SyncConfig;
use crate::error::CacheResult;
use crate::store::ChatStore;
use crate::types::{Changed, Cursor, SiteId, SupportQueueEntry, SupportRoomRecord, UserId};

/// Bucket key of the support queue: the since-cursor alone. Agents
/// polling with the same cursor share one bucket; reclassification per
/// agent happens downstream of the cached snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SupportQueueKey {
    pub since: Option<Cursor>,
}

/// Query-memoized view of the rooms awaiting support on one site.
pub struct SupportRooms {
    queue: ParamCache<SupportQueueKey, SupportRoomRecord>,
}

impl SupportRooms {
    pub fn new(site_id: SiteId, store: Arc<dyn ChatStore>, config: &SyncConfig) -> Self {
        let queue = ParamCache::new("support_rooms", &config.support_queue, {
            Arc::new(move |key: SupportQueueKey| {
                let store = Arc::clone(&store);
                Box::pin(async move {
                    let records = store.load_pending_support_rooms(site_id, key.since).await?;
                    let last_change = records
                        .iter()
                        .map(|r| r.state_changed)
                        .max()
                        .unwrap_or_else(Cursor::now);
                    Ok((records, last_change))
                })
            })
        });
        Self { queue }
    }

    /// Support-queue changes as seen by one agent.
    ///
    /// Each cached record is reclassified per requesting agent: a room
    /// taken by a different agent, or resolved (zero unread, untaken),
    /// is a removal for this agent. Removals are reported only to
    /// callers whose cursor predates the state change; on a first
    /// request they are dropped entirely. An empty filtered set is
    /// `None`, so callers can tell "nothing changed" from "explicitly
    /// empty".
    pub async fn changed_support_rooms(
        &self,
        agent: UserId,
        since: Option<Cursor>,
    ) -> CacheResult<Option<Changed<Vec<SupportQueueEntry>>>> {
        let bucket = self.queue.get(SupportQueueKey { since }).await?;

        let mut out: Vec<SupportQueueEntry> = Vec::new();
        for record in bucket.items.iter() {
            let taken_by_other = matches!(record.taken_by, Some(a) if a != agent);
            let resolved = record.unread == 0 && record.taken_by.is_none();
            if taken_by_other || resolved {
                let removal_is_news = since.is_some_and(|c| record.state_changed > c);
                if removal_is_news {
                    out.push(SupportQueueEntry {
                        room_id: record.room_id,
                        name: record.name.clone(),
                        unread: record.unread,
                        is_taken: record.taken_by.is_some(),
                        removed: true,
                    });
                }
                continue;
            }
            out.push(SupportQueueEntry {
                room_id: record.room_id,
                name: record.name.clone(),
                unread: record.unread,
                is_taken: record.taken_by.is_some(),
                removed: false,
            });
        }

        if out.is_empty() {
            return Ok(None);
        }
        out.sort_by_key(|e| e.room_id);
        Ok(Some(Changed::new(out, bucket.last_change)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::mock::MockStore;
    use crate::types::RoomId;

    fn cur(base: Cursor, seconds: i64) -> Cursor {
        Cursor::from_datetime(base.as_datetime() + chrono::Duration::seconds(seconds))
    }

    fn record(room: i64, unread: u32, taken_by: Option<i64>, at: Cursor) -> SupportRoomRecord {
        SupportRoomRecord {
            room_id: RoomId(room),
            name: format!("room-{room}"),
            unread,
            taken_by: taken_by.map(UserId),
            state_changed: at,
        }
    }

    fn support(store: &Arc<MockStore>) -> SupportRooms {
        SupportRooms::new(
            SiteId(1),
            Arc::clone(store) as Arc<dyn ChatStore>,
            &SyncConfig::default(),
        )
    }

    #[tokio::test]
    async fn agents_share_bucket_but_see_their_own_queue() {
        let base = Cursor::now();
        let store = Arc::new(MockStore::new());
        store.support_rooms.lock().insert(
            SiteId(1),
            vec![
                record(1, 3, None, cur(base, 1)),
                record(2, 2, Some(20), cur(base, 2)),
            ],
        );
        let support = support(&store);

        // Agent 20 took room 2: still on their queue, gone from 10's.
        let ten = support
            .changed_support_rooms(UserId(10), None)
            .await
            .unwrap()
            .unwrap();
        let twenty = support
            .changed_support_rooms(UserId(20), None)
            .await
            .unwrap()
            .unwrap();

        let ten_ids: Vec<RoomId> = ten.items.iter().map(|e| e.room_id).collect();
        assert_eq!(ten_ids, vec![RoomId(1)]);
        let twenty_ids: Vec<RoomId> = twenty.items.iter().map(|e| e.room_id).collect();
        assert_eq!(twenty_ids, vec![RoomId(1), RoomId(2)]);
        assert!(twenty.items[1].is_taken);

        // Both polls were served from one cached bucket.
        assert_eq!(store.calls("load_pending_support_rooms"), 1);
    }

    #[tokio::test]
    async fn unclaimed_room_visible_to_concurrent_first_requests() {
        let base = Cursor::now();
        let store = Arc::new(MockStore::new());
        store
            .support_rooms
            .lock()
            .insert(SiteId(1), vec![record(1, 3, None, cur(base, 1))]);
        let support = Arc::new(support(&store));

        let a = Arc::clone(&support);
        let b = Arc::clone(&support);
        let (ra, rb) = tokio::join!(
            async move { a.changed_support_rooms(UserId(10), None).await },
            async move { b.changed_support_rooms(UserId(20), None).await },
        );
        for r in [ra.unwrap().unwrap(), rb.unwrap().unwrap()] {
            assert_eq!(r.items.len(), 1);
            assert!(!r.items[0].is_taken);
            assert!(!r.items[0].removed);
        }
    }

    #[tokio::test]
    async fn resolution_reported_only_to_stale_cursors() {
        let base = Cursor::now();
        let store = Arc::new(MockStore::new());
        // Room 1 was resolved at +5.
        store
            .support_rooms
            .lock()
            .insert(SiteId(1), vec![record(1, 0, None, cur(base, 5))]);
        let support = support(&store);

        // Fresh query: resolved room dropped entirely.
        assert!(
            support
                .changed_support_rooms(UserId(10), None)
                .await
                .unwrap()
                .is_none()
        );

        // Cursor predating the resolution: removal is news.
        let got = support
            .changed_support_rooms(UserId(10), Some(cur(base, 2)))
            .await
            .unwrap()
            .unwrap();
        assert!(got.items[0].removed);

        // Cursor postdating it: nothing to say.
        assert!(
            support
                .changed_support_rooms(UserId(10), Some(cur(base, 7)))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn takeover_reported_as_removal_to_other_agents() {
        let base = Cursor::now();
        let store = Arc::new(MockStore::new());
        store
            .support_rooms
            .lock()
            .insert(SiteId(1), vec![record(1, 4, Some(20), cur(base, 5))]);
        let support = support(&store);

        let got = support
            .changed_support_rooms(UserId(10), Some(cur(base, 2)))
            .await
            .unwrap()
            .unwrap();
        assert!(got.items[0].removed);

        // The taking agent keeps the room, marked taken.
        let got = support
            .changed_support_rooms(UserId(20), Some(cur(base, 2)))
            .await
            .unwrap()
            .unwrap();
        assert!(!got.items[0].removed);
        assert!(got.items[0].is_taken);
    }
}
