use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use quill_types::PostId;
use quill_types::models::{Comment, Post};

use crate::backend::ReactiveBackend;
use crate::clock::Clock;
use crate::error::{BackendError, HydrationError};

/// The state of `T` for one post as of backend sequence number `version`.
///
/// Not `Clone`: a snapshot seeds exactly one live subscription.
#[derive(Debug, Serialize, Deserialize)]
pub struct Snapshot<T> {
    post_id: PostId,
    version: u64,
    taken_at: DateTime<Utc>,
    data: T,
}

impl<T> Snapshot<T> {
    pub fn new(post_id: PostId, version: u64, taken_at: DateTime<Utc>, data: T) -> Self {
        Self {
            post_id,
            version,
            taken_at,
            data,
        }
    }

    pub fn post_id(&self) -> PostId {
        self.post_id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }

    pub fn data(&self) -> &T {
        &self.data
    }

    pub fn into_data(self) -> T {
        self.data
    }
}

/// Single-use slot that carries a snapshot from the rendering phase to the
/// mounting phase. Taking it twice is an error, not a silent re-fetch.
#[derive(Debug)]
pub struct Handoff<T> {
    slot: Mutex<Option<Snapshot<T>>>,
}

impl<T> Handoff<T> {
    pub fn new(snapshot: Snapshot<T>) -> Self {
        Self {
            slot: Mutex::new(Some(snapshot)),
        }
    }

    /// Take the snapshot for `post_id`. A mismatched snapshot stays in the
    /// slot so the right caller can still claim it.
    pub fn take(&self, post_id: PostId) -> Result<Snapshot<T>, HydrationError> {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        let Some(snapshot) = slot.take() else {
            return Err(HydrationError::AlreadyConsumed);
        };
        if snapshot.post_id != post_id {
            let actual = snapshot.post_id;
            *slot = Some(snapshot);
            return Err(HydrationError::SnapshotMismatch {
                expected: post_id,
                actual,
            });
        }
        Ok(snapshot)
    }

    pub fn is_consumed(&self) -> bool {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).is_none()
    }
}

/// Result of a preload. A missing post is a normal outcome, not an error.
#[derive(Debug)]
pub enum Preloaded {
    Found {
        post: Post,
        comments: Snapshot<Vec<Comment>>,
    },
    NotFound,
}

/// Fetches the post and its comment snapshot before anything is rendered.
/// Never looks at presence or viewer identity.
pub struct SnapshotPreloader<B> {
    backend: Arc<B>,
    clock: Arc<dyn Clock>,
}

impl<B: ReactiveBackend> SnapshotPreloader<B> {
    pub fn new(backend: Arc<B>, clock: Arc<dyn Clock>) -> Self {
        Self { backend, clock }
    }

    pub async fn preload(&self, post_id: PostId) -> Result<Preloaded, BackendError> {
        let (post, comments) = tokio::join!(
            self.backend.get_post_by_id(post_id),
            self.backend.get_comments_by_post_id(post_id),
        );

        let Some(post) = post? else {
            debug!("Preload: post {} not found", post_id);
            return Ok(Preloaded::NotFound);
        };
        let comments = comments?;

        debug!(
            "Preload: post {} with {} comments at version {}",
            post_id,
            comments.comments.len(),
            comments.version
        );

        Ok(Preloaded::Found {
            post,
            comments: Snapshot::new(post_id, comments.version, self.clock.now(), comments.comments),
        })
    }
}
