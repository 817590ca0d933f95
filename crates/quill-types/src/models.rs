use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CommentId, PostId, RoomId, ViewerId};

/// A blog post. The sync layer only ever reads these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub id: PostId,
    pub author_id: ViewerId,
    pub title: String,
    pub body: String,
    pub image_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Comments are append-only: never edited, never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: CommentId,
    pub post_id: PostId,
    pub author_id: ViewerId,
    pub author_name: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl Comment {
    /// Total order key: creation time, ties broken by id.
    pub fn order_key(&self) -> (DateTime<Utc>, CommentId) {
        (self.created_at, self.id)
    }
}

/// The comment set of a post as of backend sequence number `version`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VersionedComments {
    pub version: u64,
    pub comments: Vec<Comment>,
}

/// A push update for one post's comment list.
///
/// `version` is the post's comment sequence number after the update was
/// applied upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommentUpdate {
    /// The whole current mapping for the post.
    Replace { version: u64, comments: Vec<Comment> },
    /// Comments added since the previous update.
    Append { version: u64, comments: Vec<Comment> },
}

impl CommentUpdate {
    pub fn version(&self) -> u64 {
        match self {
            Self::Replace { version, .. } | Self::Append { version, .. } => *version,
        }
    }

    pub fn comments(&self) -> &[Comment] {
        match self {
            Self::Replace { comments, .. } | Self::Append { comments, .. } => comments,
        }
    }
}

/// One viewer's liveness in one room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub room_id: RoomId,
    pub viewer_id: ViewerId,
    pub last_heartbeat: DateTime<Utc>,
}
