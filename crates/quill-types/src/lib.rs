pub mod api;
pub mod events;
pub mod models;

/// Identifier aliases. All of them are v4 UUIDs issued by the store.
pub type PostId = uuid::Uuid;
pub type CommentId = uuid::Uuid;
pub type ViewerId = uuid::Uuid;

/// A room is the presence set of one post, so it shares the post's id.
pub type RoomId = PostId;
