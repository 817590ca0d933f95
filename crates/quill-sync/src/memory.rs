//! In-process `ReactiveBackend` that keeps everything in memory.
//!
//! It exists so the sync layer can be exercised without a database or a
//! network. The failure switches and call counters are there for tests that
//! need to see what the layer above did (or did not do).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::broadcast;
use uuid::Uuid;

use quill_types::models::{Comment, CommentUpdate, Post, PresenceRecord, VersionedComments};
use quill_types::{PostId, RoomId, ViewerId};

use crate::backend::{CommentFeed, ReactiveBackend};
use crate::clock::{Clock, SystemClock};
use crate::config::PresenceConfig;
use crate::error::BackendError;
use crate::presence::PresenceRoster;

const FEED_CAPACITY: usize = 256;

#[derive(Default)]
struct MemoryState {
    users: HashMap<ViewerId, String>,
    tokens: HashMap<String, ViewerId>,
    posts: HashMap<PostId, Post>,
    comments: HashMap<PostId, Vec<(u64, Comment)>>,
    comment_feeds: HashMap<PostId, broadcast::Sender<CommentUpdate>>,
    presence_feeds: HashMap<RoomId, broadcast::Sender<Vec<PresenceRecord>>>,
    last_created: Option<DateTime<Utc>>,
}

pub struct MemoryBackend {
    clock: Arc<dyn Clock>,
    state: Mutex<MemoryState>,
    roster: Mutex<PresenceRoster>,
    fail_writes: AtomicBool,
    fail_presence: AtomicBool,
    write_calls: AtomicUsize,
    presence_calls: AtomicUsize,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let timeout = PresenceConfig::default()
            .timeout_delta()
            .unwrap_or(TimeDelta::seconds(30));
        Self::with_clock(Arc::new(SystemClock), timeout)
    }

    pub fn with_clock(clock: Arc<dyn Clock>, presence_timeout: TimeDelta) -> Self {
        Self {
            clock,
            state: Mutex::new(MemoryState::default()),
            roster: Mutex::new(PresenceRoster::new(presence_timeout)),
            fail_writes: AtomicBool::new(false),
            fail_presence: AtomicBool::new(false),
            write_calls: AtomicUsize::new(0),
            presence_calls: AtomicUsize::new(0),
        }
    }

    pub fn add_user(&self, name: &str) -> ViewerId {
        let id = Uuid::new_v4();
        let mut state = self.state();
        state.users.insert(id, name.to_string());
        state.tokens.insert(self.token_for(id), id);
        id
    }

    /// The bearer token `get_user_id` accepts for `viewer_id`.
    pub fn token_for(&self, viewer_id: ViewerId) -> String {
        format!("token-{}", viewer_id)
    }

    pub fn add_post(&self, author_id: ViewerId, title: &str, body: &str) -> Post {
        let post = Post {
            id: Uuid::new_v4(),
            author_id,
            title: title.to_string(),
            body: body.to_string(),
            image_url: None,
            created_at: self.clock.now(),
        };
        self.state().posts.insert(post.id, post.clone());
        post
    }

    /// Push an arbitrary update to a post's subscribers, bypassing the store.
    /// Used to simulate redelivery.
    pub fn inject(&self, post_id: PostId, update: CommentUpdate) {
        if let Some(tx) = self.state().comment_feeds.get(&post_id) {
            let _ = tx.send(update);
        }
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_presence(&self, fail: bool) {
        self.fail_presence.store(fail, Ordering::SeqCst);
    }

    /// Number of `create_comment` calls that reached the backend.
    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    /// Number of join/heartbeat/leave calls that reached the backend.
    pub fn presence_calls(&self) -> usize {
        self.presence_calls.load(Ordering::SeqCst)
    }

    /// Evaluate every room and push the new live sets of rooms that changed.
    pub fn reap_all(&self) {
        let now = self.clock.now();
        let changed: Vec<(RoomId, Vec<PresenceRecord>)> = {
            let mut roster = self.roster();
            roster
                .reap_all(now)
                .into_iter()
                .map(|(room_id, _)| (room_id, roster.records(room_id)))
                .collect()
        };
        for (room_id, live) in changed {
            self.publish_presence(room_id, live);
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn roster(&self) -> MutexGuard<'_, PresenceRoster> {
        self.roster.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish_presence(&self, room_id: RoomId, live: Vec<PresenceRecord>) {
        if let Some(tx) = self.state().presence_feeds.get(&room_id) {
            let _ = tx.send(live);
        }
    }

    fn presence_op(
        &self,
        room_id: RoomId,
        op: impl FnOnce(&mut PresenceRoster, DateTime<Utc>) -> bool,
    ) -> Result<Vec<PresenceRecord>, BackendError> {
        self.presence_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_presence.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("presence write failed".into()));
        }

        let now = self.clock.now();
        let (changed, live) = {
            let mut roster = self.roster();
            let before = roster.records(room_id).len();
            let touched = op(&mut roster, now);
            let live = roster.live_set(room_id, now);
            (touched || live.len() != before, live)
        };
        if changed {
            self.publish_presence(room_id, live.clone());
        }
        Ok(live)
    }
}

impl ReactiveBackend for MemoryBackend {
    async fn get_post_by_id(&self, post_id: PostId) -> Result<Option<Post>, BackendError> {
        Ok(self.state().posts.get(&post_id).cloned())
    }

    async fn get_comments_by_post_id(&self, post_id: PostId) -> Result<VersionedComments, BackendError> {
        let state = self.state();
        let stored = state.comments.get(&post_id);
        Ok(VersionedComments {
            version: stored.map_or(0, |c| c.len() as u64),
            comments: stored
                .map(|c| c.iter().map(|(_, comment)| comment.clone()).collect())
                .unwrap_or_default(),
        })
    }

    async fn subscribe_comments(&self, post_id: PostId, since: u64) -> Result<CommentFeed, BackendError> {
        let mut state = self.state();
        let updates = state
            .comment_feeds
            .entry(post_id)
            .or_insert_with(|| broadcast::channel(FEED_CAPACITY).0)
            .subscribe();

        let stored = state.comments.get(&post_id);
        let version = stored.map_or(0, |c| c.len() as u64);
        let comments = stored
            .map(|c| {
                c.iter()
                    .filter(|(seq, _)| *seq > since)
                    .map(|(_, comment)| comment.clone())
                    .collect()
            })
            .unwrap_or_default();

        Ok(CommentFeed {
            catch_up: CommentUpdate::Append { version, comments },
            updates,
        })
    }

    async fn create_comment(&self, post_id: PostId, author_id: ViewerId, body: String) -> Result<(), BackendError> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("write not confirmed".into()));
        }

        let mut state = self.state();
        if !state.posts.contains_key(&post_id) {
            return Err(BackendError::NotFound(post_id));
        }
        let author_name = state
            .users
            .get(&author_id)
            .cloned()
            .ok_or(BackendError::Unauthorized)?;

        // Creation times are strictly increasing across the store.
        let now = self.clock.now();
        let created_at = match state.last_created {
            Some(last) if now <= last => last + TimeDelta::microseconds(1),
            _ => now,
        };
        state.last_created = Some(created_at);

        let comment = Comment {
            id: Uuid::new_v4(),
            post_id,
            author_id,
            author_name,
            body,
            created_at,
        };

        let stored = state.comments.entry(post_id).or_default();
        let seq = stored.len() as u64 + 1;
        stored.push((seq, comment.clone()));

        if let Some(tx) = state.comment_feeds.get(&post_id) {
            let _ = tx.send(CommentUpdate::Append {
                version: seq,
                comments: vec![comment],
            });
        }
        Ok(())
    }

    async fn join(&self, room_id: RoomId, viewer_id: ViewerId) -> Result<Vec<PresenceRecord>, BackendError> {
        self.presence_op(room_id, |roster, now| roster.join(room_id, viewer_id, now))
    }

    async fn heartbeat(&self, room_id: RoomId, viewer_id: ViewerId) -> Result<Vec<PresenceRecord>, BackendError> {
        self.presence_op(room_id, |roster, now| roster.heartbeat(room_id, viewer_id, now))
    }

    async fn leave(&self, room_id: RoomId, viewer_id: ViewerId) -> Result<Vec<PresenceRecord>, BackendError> {
        self.presence_op(room_id, |roster, _| roster.leave(room_id, viewer_id))
    }

    async fn subscribe_presence(
        &self,
        room_id: RoomId,
    ) -> Result<broadcast::Receiver<Vec<PresenceRecord>>, BackendError> {
        Ok(self
            .state()
            .presence_feeds
            .entry(room_id)
            .or_insert_with(|| broadcast::channel(FEED_CAPACITY).0)
            .subscribe())
    }

    async fn get_user_id(&self, token: &str) -> Option<ViewerId> {
        self.state().tokens.get(token).copied()
    }
}
