use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use jsonwebtoken::{DecodingKey, Validation, decode};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, error, warn};
use uuid::Uuid;

use quill_db::Database;
use quill_db::InsertComment;
use quill_db::models::{CommentRow, PostRow};
use quill_sync::{BackendError, Clock, CommentFeed, ReactiveBackend};
use quill_types::api::Claims;
use quill_types::models::{Comment, CommentUpdate, Post, PresenceRecord, VersionedComments};
use quill_types::{PostId, RoomId, ViewerId};

use crate::dispatcher::Dispatcher;

/// The server's `ReactiveBackend`: SQLite for posts and comments, the
/// dispatcher for fan-out and presence.
pub struct Store {
    db: Arc<Database>,
    dispatcher: Dispatcher,
    clock: Arc<dyn Clock>,
    jwt_secret: String,
    /// Serializes comment insert + publish. Holds the last creation time
    /// handed out so timestamps follow sequence order.
    write_lock: Mutex<Option<DateTime<Utc>>>,
}

impl Store {
    pub fn new(db: Arc<Database>, dispatcher: Dispatcher, clock: Arc<dyn Clock>, jwt_secret: String) -> Self {
        Self {
            db,
            dispatcher,
            clock,
            jwt_secret,
            write_lock: Mutex::new(None),
        }
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Current live set of a room, evaluated at the store's clock.
    pub async fn presence(&self, room_id: RoomId) -> Vec<PresenceRecord> {
        self.dispatcher.live_set(room_id, self.clock.now()).await
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, BackendError>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| {
                error!("spawn_blocking join error: {}", e);
                BackendError::Unavailable("storage task failed".into())
            })?
            .map_err(|e| {
                error!("Storage error: {}", e);
                BackendError::Unavailable("storage error".into())
            })
    }
}

pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_id(raw: &str, what: &str, owner: &str) -> Uuid {
    raw.parse().unwrap_or_else(|e| {
        warn!("Corrupt {} '{}' on '{}': {}", what, raw, owner, e);
        Uuid::default()
    })
}

fn parse_time(raw: &str, owner: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|e| {
            warn!("Corrupt created_at '{}' on '{}': {}", raw, owner, e);
            DateTime::default()
        })
}

pub fn post_from_row(row: PostRow) -> Post {
    Post {
        id: parse_id(&row.id, "id", &row.id),
        author_id: parse_id(&row.author_id, "author_id", &row.id),
        created_at: parse_time(&row.created_at, &row.id),
        title: row.title,
        body: row.body,
        image_url: row.image_url,
    }
}

pub fn comment_from_row(row: CommentRow) -> Comment {
    Comment {
        id: parse_id(&row.id, "id", &row.id),
        post_id: parse_id(&row.post_id, "post_id", &row.id),
        author_id: parse_id(&row.author_id, "author_id", &row.id),
        created_at: parse_time(&row.created_at, &row.id),
        author_name: row.author_name,
        body: row.body,
    }
}

fn version(seq: i64) -> u64 {
    u64::try_from(seq).unwrap_or_default()
}

impl ReactiveBackend for Store {
    async fn get_post_by_id(&self, post_id: PostId) -> Result<Option<Post>, BackendError> {
        let row = self.blocking(move |db| db.get_post(&post_id.to_string())).await?;
        Ok(row.map(post_from_row))
    }

    async fn get_comments_by_post_id(&self, post_id: PostId) -> Result<VersionedComments, BackendError> {
        let (seq, rows) = self
            .blocking(move |db| db.get_comments(&post_id.to_string()))
            .await?;
        Ok(VersionedComments {
            version: version(seq),
            comments: rows.into_iter().map(comment_from_row).collect(),
        })
    }

    async fn subscribe_comments(&self, post_id: PostId, since: u64) -> Result<CommentFeed, BackendError> {
        // Subscribe before reading so nothing published in between is missed.
        let updates = self.dispatcher.subscribe_comments(post_id).await;

        let since_seq = i64::try_from(since).unwrap_or(i64::MAX);
        let (seq, rows) = self
            .blocking(move |db| db.get_comments_since(&post_id.to_string(), since_seq))
            .await?;

        debug!(
            "Feed for post {} attached after {} ({} to catch up)",
            post_id,
            since,
            rows.len()
        );

        Ok(CommentFeed {
            catch_up: CommentUpdate::Append {
                version: version(seq),
                comments: rows.into_iter().map(comment_from_row).collect(),
            },
            updates,
        })
    }

    async fn create_comment(&self, post_id: PostId, author_id: ViewerId, body: String) -> Result<(), BackendError> {
        let mut last_created = self.write_lock.lock().await;

        let now = self.clock.now();
        let created_at = match *last_created {
            Some(last) if now <= last => last + TimeDelta::microseconds(1),
            _ => now,
        };

        let id = Uuid::new_v4().to_string();
        let created = timestamp(created_at);
        let outcome = self
            .blocking(move |db| {
                db.insert_comment(&id, &post_id.to_string(), &author_id.to_string(), &body, &created)
            })
            .await?;

        let row = match outcome {
            InsertComment::Inserted(row) => row,
            InsertComment::UnknownPost => return Err(BackendError::NotFound(post_id)),
            InsertComment::UnknownAuthor => return Err(BackendError::Unauthorized),
        };
        *last_created = Some(created_at);

        let seq = row.seq;
        let comment = comment_from_row(row);
        debug!("Comment {} stored on post {} as #{}", comment.id, post_id, seq);

        self.dispatcher
            .publish_comments(
                post_id,
                CommentUpdate::Append {
                    version: version(seq),
                    comments: vec![comment],
                },
            )
            .await;
        Ok(())
    }

    async fn join(&self, room_id: RoomId, viewer_id: ViewerId) -> Result<Vec<PresenceRecord>, BackendError> {
        Ok(self.dispatcher.join(room_id, viewer_id, self.clock.now()).await)
    }

    async fn heartbeat(&self, room_id: RoomId, viewer_id: ViewerId) -> Result<Vec<PresenceRecord>, BackendError> {
        Ok(self.dispatcher.heartbeat(room_id, viewer_id, self.clock.now()).await)
    }

    async fn leave(&self, room_id: RoomId, viewer_id: ViewerId) -> Result<Vec<PresenceRecord>, BackendError> {
        Ok(self.dispatcher.leave(room_id, viewer_id, self.clock.now()).await)
    }

    async fn subscribe_presence(
        &self,
        room_id: RoomId,
    ) -> Result<broadcast::Receiver<Vec<PresenceRecord>>, BackendError> {
        Ok(self.dispatcher.subscribe_presence(room_id).await)
    }

    async fn get_user_id(&self, token: &str) -> Option<ViewerId> {
        match decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.jwt_secret.as_bytes()),
            &Validation::default(),
        ) {
            Ok(data) => Some(data.claims.sub),
            Err(e) => {
                debug!("Rejected bearer token: {}", e);
                None
            }
        }
    }
}
