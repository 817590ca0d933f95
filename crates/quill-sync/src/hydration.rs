use std::sync::Arc;

use tracing::debug;

use quill_types::PostId;
use quill_types::models::Comment;

use crate::backend::ReactiveBackend;
use crate::config::CommentLimits;
use crate::error::HydrationError;
use crate::reconcile::CommentList;
use crate::snapshot::Handoff;
use crate::stream::CommentStream;

/// Turns a preloaded snapshot into a live `CommentStream`.
///
/// The snapshot becomes the stream's initial state, so it renders right away.
/// The live feed then resumes from the snapshot's version through the same
/// reconciliation path. Nothing is fetched twice, and a comment written in
/// between is picked up by the feed's catch-up.
pub struct HydrationBridge<B> {
    backend: Arc<B>,
    limits: CommentLimits,
}

impl<B: ReactiveBackend> HydrationBridge<B> {
    pub fn new(backend: Arc<B>, limits: CommentLimits) -> Self {
        Self { backend, limits }
    }

    /// Consume the handoff for `post_id` and start the live stream.
    /// Must be called from within a tokio runtime.
    pub fn hydrate(
        &self,
        post_id: PostId,
        handoff: &Handoff<Vec<Comment>>,
    ) -> Result<CommentStream<B>, HydrationError> {
        let snapshot = handoff.take(post_id)?;
        let version = snapshot.version();
        let list = CommentList::from_snapshot(version, snapshot.into_data());

        debug!(
            "Hydrating post {} from snapshot version {} ({} comments)",
            post_id,
            version,
            list.len()
        );

        Ok(CommentStream::start(self.backend.clone(), post_id, list, self.limits))
    }
}
