use std::future::Future;

use tokio::sync::broadcast;

use quill_types::models::{CommentUpdate, Post, PresenceRecord, VersionedComments};
use quill_types::{PostId, RoomId, ViewerId};

use crate::error::BackendError;

/// A live comment feed for one post.
///
/// `updates` is opened before `catch_up` is read, so every comment past the
/// requested cursor is in one or the other (possibly both).
pub struct CommentFeed {
    pub catch_up: CommentUpdate,
    pub updates: broadcast::Receiver<CommentUpdate>,
}

/// The reactive data store the sync layer sits on. It owns ordering,
/// persistence and write serialization; this crate only reads, subscribes and
/// issues independent writes.
pub trait ReactiveBackend: Send + Sync + 'static {
    fn get_post_by_id(
        &self,
        post_id: PostId,
    ) -> impl Future<Output = Result<Option<Post>, BackendError>> + Send;

    fn get_comments_by_post_id(
        &self,
        post_id: PostId,
    ) -> impl Future<Output = Result<VersionedComments, BackendError>> + Send;

    /// Open a feed that starts right after sequence number `since`.
    fn subscribe_comments(
        &self,
        post_id: PostId,
        since: u64,
    ) -> impl Future<Output = Result<CommentFeed, BackendError>> + Send;

    /// Succeeds once the store has accepted the comment. The comment itself is
    /// delivered through the feed, not returned here.
    fn create_comment(
        &self,
        post_id: PostId,
        author_id: ViewerId,
        body: String,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;

    fn join(
        &self,
        room_id: RoomId,
        viewer_id: ViewerId,
    ) -> impl Future<Output = Result<Vec<PresenceRecord>, BackendError>> + Send;

    fn heartbeat(
        &self,
        room_id: RoomId,
        viewer_id: ViewerId,
    ) -> impl Future<Output = Result<Vec<PresenceRecord>, BackendError>> + Send;

    fn leave(
        &self,
        room_id: RoomId,
        viewer_id: ViewerId,
    ) -> impl Future<Output = Result<Vec<PresenceRecord>, BackendError>> + Send;

    /// Live set pushes for a room, sent whenever someone joins, leaves or is
    /// reaped.
    fn subscribe_presence(
        &self,
        room_id: RoomId,
    ) -> impl Future<Output = Result<broadcast::Receiver<Vec<PresenceRecord>>, BackendError>> + Send;

    /// Resolve a bearer token to a viewer. Anything unresolvable is anonymous.
    fn get_user_id(&self, token: &str) -> impl Future<Output = Option<ViewerId>> + Send;
}
