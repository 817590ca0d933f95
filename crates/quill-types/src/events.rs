use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{CommentUpdate, PresenceRecord};

/// Events sent over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Connection accepted. `viewer_id` is `None` for anonymous readers.
    Ready { viewer_id: Option<Uuid> },

    /// The comment list of a subscribed post changed
    CommentsUpdated { post_id: Uuid, update: CommentUpdate },

    /// The live presence set of a joined room changed
    PresenceSync {
        room_id: Uuid,
        viewers: Vec<PresenceRecord>,
    },

    /// A command could not be served
    Error { message: String },
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Attach a live comment feed. The server first sends every comment with a
    /// sequence number above `since_version`, then pushes new ones.
    Subscribe { post_id: Uuid, since_version: u64 },

    /// Release a comment feed
    Unsubscribe { post_id: Uuid },

    /// Register presence in a room (requires an authenticated connection)
    PresenceJoin { room_id: Uuid },

    /// Refresh presence in a room
    PresenceHeartbeat { room_id: Uuid },

    /// Clean departure from a room
    PresenceLeave { room_id: Uuid },
}
