//! Live comment and presence synchronization for a shared post.
//!
//! Data flows `SnapshotPreloader` -> `HydrationBridge` -> `CommentStream`.
//! Presence runs beside it: `PresenceRoster` is the backend's room table and
//! `PresenceSession` is the heartbeat a mounted page keeps alive.

pub mod backend;
pub mod clock;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod hydration;
pub mod memory;
pub mod page;
pub mod presence;
pub mod reconcile;
pub mod snapshot;
pub mod stream;

pub use backend::{CommentFeed, ReactiveBackend};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CommentLimits, PresenceConfig};
pub use error::{BackendError, ConfigError, HydrationError, SubmitError, ValidationError};
pub use heartbeat::PresenceSession;
pub use hydration::HydrationBridge;
pub use page::{AccessPolicy, PageOutcome, PostPage, decide_page, metadata};
pub use presence::PresenceRoster;
pub use reconcile::{CommentList, StreamState, reconcile};
pub use snapshot::{Handoff, Preloaded, Snapshot, SnapshotPreloader};
pub use stream::{CommentStream, CommentView, FeedStatus, submit_comment, validate_body};
