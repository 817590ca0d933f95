use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::{RwLock, broadcast};
use tracing::debug;

use quill_sync::PresenceRoster;
use quill_types::models::{CommentUpdate, PresenceRecord};
use quill_types::{PostId, RoomId, ViewerId};

const COMMENT_CHANNEL_CAPACITY: usize = 256;
const PRESENCE_CHANNEL_CAPACITY: usize = 64;

/// Fans comment updates and presence changes out to subscribers, one
/// broadcast channel per post and per room. Also owns the presence roster.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// post_id -> comment update channel
    comment_channels: RwLock<HashMap<PostId, broadcast::Sender<CommentUpdate>>>,

    /// room_id -> live set channel
    presence_channels: RwLock<HashMap<RoomId, broadcast::Sender<Vec<PresenceRecord>>>>,

    roster: RwLock<PresenceRoster>,
}

impl Dispatcher {
    pub fn new(presence_timeout: TimeDelta) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                comment_channels: RwLock::new(HashMap::new()),
                presence_channels: RwLock::new(HashMap::new()),
                roster: RwLock::new(PresenceRoster::new(presence_timeout)),
            }),
        }
    }

    /// Subscribe to a post's comment updates, creating the channel if needed.
    pub async fn subscribe_comments(&self, post_id: PostId) -> broadcast::Receiver<CommentUpdate> {
        self.inner
            .comment_channels
            .write()
            .await
            .entry(post_id)
            .or_insert_with(|| broadcast::channel(COMMENT_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Send an update to everyone watching the post. Nobody watching is fine.
    pub async fn publish_comments(&self, post_id: PostId, update: CommentUpdate) {
        if let Some(tx) = self.inner.comment_channels.read().await.get(&post_id) {
            let _ = tx.send(update);
        }
    }

    pub async fn subscribe_presence(&self, room_id: RoomId) -> broadcast::Receiver<Vec<PresenceRecord>> {
        self.inner
            .presence_channels
            .write()
            .await
            .entry(room_id)
            .or_insert_with(|| broadcast::channel(PRESENCE_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    async fn publish_presence(&self, room_id: RoomId, live: Vec<PresenceRecord>) {
        if let Some(tx) = self.inner.presence_channels.read().await.get(&room_id) {
            let _ = tx.send(live);
        }
    }

    pub async fn join(&self, room_id: RoomId, viewer_id: ViewerId, now: DateTime<Utc>) -> Vec<PresenceRecord> {
        self.presence_op(room_id, now, |roster| roster.join(room_id, viewer_id, now))
            .await
    }

    pub async fn heartbeat(&self, room_id: RoomId, viewer_id: ViewerId, now: DateTime<Utc>) -> Vec<PresenceRecord> {
        self.presence_op(room_id, now, |roster| roster.heartbeat(room_id, viewer_id, now))
            .await
    }

    pub async fn leave(&self, room_id: RoomId, viewer_id: ViewerId, now: DateTime<Utc>) -> Vec<PresenceRecord> {
        self.presence_op(room_id, now, |roster| roster.leave(room_id, viewer_id))
            .await
    }

    /// The room's live set as of `now`. Reading evaluates deadlines, so a
    /// read can evict; watchers hear about it.
    pub async fn live_set(&self, room_id: RoomId, now: DateTime<Utc>) -> Vec<PresenceRecord> {
        self.presence_op(room_id, now, |_| false).await
    }

    /// Evict expired records in every room and push the new live sets.
    /// Returns the number of evicted records.
    pub async fn reap(&self, now: DateTime<Utc>) -> usize {
        let changed: Vec<(RoomId, usize, Vec<PresenceRecord>)> = {
            let mut roster = self.inner.roster.write().await;
            roster
                .reap_all(now)
                .into_iter()
                .map(|(room_id, evicted)| (room_id, evicted.len(), roster.records(room_id)))
                .collect()
        };

        let mut total = 0;
        for (room_id, evicted, live) in changed {
            debug!("Reaped {} viewers from room {}", evicted, room_id);
            total += evicted;
            self.publish_presence(room_id, live).await;
        }
        total
    }

    /// Drop channels nobody listens to any more. Returns how many were removed.
    pub async fn prune(&self) -> usize {
        let mut removed = 0;
        {
            let mut channels = self.inner.comment_channels.write().await;
            let before = channels.len();
            channels.retain(|_, tx| tx.receiver_count() > 0);
            removed += before - channels.len();
        }
        {
            let mut channels = self.inner.presence_channels.write().await;
            let before = channels.len();
            channels.retain(|_, tx| tx.receiver_count() > 0);
            removed += before - channels.len();
        }
        removed
    }

    /// (comment channels, presence channels, occupied rooms)
    pub async fn counts(&self) -> (usize, usize, usize) {
        (
            self.inner.comment_channels.read().await.len(),
            self.inner.presence_channels.read().await.len(),
            self.inner.roster.read().await.room_count(),
        )
    }

    async fn presence_op(
        &self,
        room_id: RoomId,
        now: DateTime<Utc>,
        op: impl FnOnce(&mut PresenceRoster) -> bool,
    ) -> Vec<PresenceRecord> {
        let (changed, live) = {
            let mut roster = self.inner.roster.write().await;
            let before = roster.records(room_id).len();
            let touched = op(&mut roster);
            let live = roster.live_set(room_id, now);
            (touched || live.len() != before, live)
        };
        if changed {
            self.publish_presence(room_id, live.clone()).await;
        }
        live
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH + TimeDelta::seconds(secs)
    }

    #[tokio::test]
    async fn join_and_leave_push_to_room_watchers() {
        let dispatcher = Dispatcher::new(TimeDelta::seconds(30));
        let room = Uuid::new_v4();
        let viewer = Uuid::new_v4();
        let mut rx = dispatcher.subscribe_presence(room).await;

        dispatcher.join(room, viewer, at(0)).await;
        assert_eq!(rx.recv().await.unwrap().len(), 1);

        // a heartbeat that changes nothing is not pushed
        dispatcher.heartbeat(room, viewer, at(5)).await;
        dispatcher.leave(room, viewer, at(6)).await;
        assert!(rx.recv().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reap_evicts_only_stale_viewers() {
        let dispatcher = Dispatcher::new(TimeDelta::seconds(30));
        let room = Uuid::new_v4();
        let stale = Uuid::new_v4();
        let fresh = Uuid::new_v4();

        dispatcher.join(room, stale, at(0)).await;
        dispatcher.join(room, fresh, at(0)).await;
        dispatcher.heartbeat(room, fresh, at(10)).await;

        let mut rx = dispatcher.subscribe_presence(room).await;
        assert_eq!(dispatcher.reap(at(35)).await, 1);

        let live = rx.recv().await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].viewer_id, fresh);
    }

    #[tokio::test]
    async fn prune_drops_unwatched_channels() {
        let dispatcher = Dispatcher::new(TimeDelta::seconds(30));
        let watched = dispatcher.subscribe_comments(Uuid::new_v4()).await;
        drop(dispatcher.subscribe_comments(Uuid::new_v4()).await);
        drop(dispatcher.subscribe_presence(Uuid::new_v4()).await);

        assert_eq!(dispatcher.prune().await, 2);
        assert_eq!(dispatcher.counts().await, (1, 0, 0));
        drop(watched);
    }
}
