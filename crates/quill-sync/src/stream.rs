use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use quill_types::models::Comment;
use quill_types::{PostId, ViewerId};

use crate::backend::{CommentFeed, ReactiveBackend};
use crate::config::CommentLimits;
use crate::error::{SubmitError, ValidationError};
use crate::reconcile::{CommentList, StreamState};

/// Health of the live subscription, reported next to the data so a UI can
/// tell "still attaching" from "broken".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedStatus {
    Attaching,
    Live,
    Faulted(String),
    Released,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentView {
    pub list: CommentList,
    pub status: FeedStatus,
}

/// The live, ordered comment list of one post plus its write path.
///
/// The list only ever contains what the backend has accepted; submissions are
/// never inserted locally.
pub struct CommentStream<B: ReactiveBackend> {
    post_id: PostId,
    backend: Arc<B>,
    limits: CommentLimits,
    view: Arc<watch::Sender<CommentView>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl<B: ReactiveBackend> CommentStream<B> {
    /// Attach to a post with no snapshot. The stream is `Empty` until the
    /// backend's catch-up arrives.
    pub fn connect(backend: Arc<B>, post_id: PostId, limits: CommentLimits) -> Self {
        Self::start(backend, post_id, CommentList::new(), limits)
    }

    /// Spawn the feed task, resuming after `initial`'s version.
    pub(crate) fn start(backend: Arc<B>, post_id: PostId, initial: CommentList, limits: CommentLimits) -> Self {
        let since = initial.version();
        let (tx, _) = watch::channel(CommentView {
            list: initial,
            status: FeedStatus::Attaching,
        });
        let view = Arc::new(tx);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_feed(
            backend.clone(),
            post_id,
            since,
            view.clone(),
            cancel.clone(),
        ));

        Self {
            post_id,
            backend,
            limits,
            view,
            cancel,
            task: Some(task),
        }
    }

    pub fn post_id(&self) -> PostId {
        self.post_id
    }

    /// Observe every change to the list or the feed status.
    pub fn subscribe(&self) -> watch::Receiver<CommentView> {
        self.view.subscribe()
    }

    pub fn view(&self) -> CommentView {
        self.view.borrow().clone()
    }

    /// Comments in render order.
    pub fn comments(&self) -> Vec<Comment> {
        self.view.borrow().list.to_vec()
    }

    pub fn state(&self) -> StreamState {
        self.view.borrow().list.state()
    }

    pub fn status(&self) -> FeedStatus {
        self.view.borrow().status.clone()
    }

    /// Ask the backend to store a comment. Success means accepted; the
    /// comment shows up when the feed delivers it. Failures are returned
    /// as-is and never retried here.
    pub async fn submit(&self, author: Option<ViewerId>, body: &str) -> Result<(), SubmitError> {
        submit_comment(self.backend.as_ref(), self.post_id, author, body, &self.limits).await
    }

    /// Release the subscription and wait for the feed task to stop.
    pub async fn close(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl<B: ReactiveBackend> Drop for CommentStream<B> {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.view.send_modify(|view| view.status = FeedStatus::Released);
    }
}

/// The comment write path without a live stream: identity first, then the
/// body, and only then the backend.
pub async fn submit_comment<B: ReactiveBackend>(
    backend: &B,
    post_id: PostId,
    author: Option<ViewerId>,
    body: &str,
    limits: &CommentLimits,
) -> Result<(), SubmitError> {
    let author = author.ok_or(SubmitError::Unauthenticated)?;
    let body = validate_body(body, limits)?;

    backend.create_comment(post_id, author, body).await.map_err(|e| {
        warn!("Comment on post {} by {} failed: {}", post_id, author, e);
        SubmitError::from(e)
    })
}

/// Trim and bound-check a comment body.
pub fn validate_body(body: &str, limits: &CommentLimits) -> Result<String, ValidationError> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyBody);
    }

    let chars = trimmed.chars().count();
    if chars > limits.max_body_chars {
        return Err(ValidationError::BodyTooLong {
            max: limits.max_body_chars,
            actual: chars,
        });
    }

    Ok(trimmed.to_string())
}

/// A released stream keeps `Released` even if the feed task is mid-update.
fn set_status(view: &watch::Sender<CommentView>, cancel: &CancellationToken, status: FeedStatus) {
    view.send_if_modified(|view| {
        if cancel.is_cancelled() {
            return false;
        }
        view.status = status;
        true
    });
}

async fn run_feed<B: ReactiveBackend>(
    backend: Arc<B>,
    post_id: PostId,
    mut since: u64,
    view: Arc<watch::Sender<CommentView>>,
    cancel: CancellationToken,
) {
    loop {
        let feed = tokio::select! {
            _ = cancel.cancelled() => return,
            feed = backend.subscribe_comments(post_id, since) => feed,
        };

        let CommentFeed { catch_up, mut updates } = match feed {
            Ok(feed) => feed,
            Err(e) => {
                warn!("Comment feed for post {} could not attach: {}", post_id, e);
                set_status(&view, &cancel, FeedStatus::Faulted(e.to_string()));
                return;
            }
        };

        view.send_modify(|view| {
            view.list.apply(&catch_up);
            if !cancel.is_cancelled() {
                view.status = FeedStatus::Live;
            }
        });
        info!(
            "Comment feed for post {} live after version {} ({} caught up)",
            post_id,
            since,
            catch_up.comments().len()
        );

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => return,
                received = updates.recv() => received,
            };

            match received {
                Ok(update) => {
                    view.send_if_modified(|view| view.list.apply(&update));
                }
                Err(RecvError::Lagged(n)) => {
                    since = view.borrow().list.version();
                    warn!(
                        "Comment feed for post {} lagged by {} updates, resubscribing after {}",
                        post_id, n, since
                    );
                    break;
                }
                Err(RecvError::Closed) => {
                    debug!("Comment feed for post {} closed by backend", post_id);
                    set_status(&view, &cancel, FeedStatus::Faulted("comment feed closed".into()));
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use quill_types::models::CommentUpdate;
    use std::time::Duration;

    async fn until(rx: &mut watch::Receiver<CommentView>, pred: impl FnMut(&CommentView) -> bool) {
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(pred))
            .await
            .expect("timed out waiting for comment view")
            .expect("view sender dropped");
    }

    fn setup() -> (Arc<MemoryBackend>, ViewerId, PostId) {
        let backend = Arc::new(MemoryBackend::new());
        let author = backend.add_user("ada");
        let post = backend.add_post(author, "Post", "Body");
        (backend, author, post.id)
    }

    #[tokio::test]
    async fn connect_moves_from_empty_to_populated() {
        let (backend, _, post_id) = setup();
        let stream = CommentStream::connect(backend, post_id, CommentLimits::default());
        assert_eq!(stream.state(), StreamState::Empty);

        let mut rx = stream.subscribe();
        until(&mut rx, |v| v.status == FeedStatus::Live).await;
        assert_eq!(stream.state(), StreamState::Populated);
        assert!(stream.comments().is_empty());
    }

    #[tokio::test]
    async fn accepted_comment_arrives_through_the_feed() {
        let (backend, author, post_id) = setup();
        let stream = CommentStream::connect(backend, post_id, CommentLimits::default());
        let mut rx = stream.subscribe();
        until(&mut rx, |v| v.status == FeedStatus::Live).await;

        stream.submit(Some(author), "  hello  ").await.unwrap();
        until(&mut rx, |v| v.list.len() == 1).await;
        assert_eq!(stream.comments()[0].body, "hello");
        assert_eq!(stream.comments()[0].author_name, "ada");
    }

    #[tokio::test]
    async fn rejected_submissions_never_reach_the_backend() {
        let (backend, author, post_id) = setup();
        let limits = CommentLimits { max_body_chars: 5 };
        let stream = CommentStream::connect(backend.clone(), post_id, limits);

        assert_eq!(
            stream.submit(None, "hi").await,
            Err(SubmitError::Unauthenticated)
        );
        assert_eq!(
            stream.submit(Some(author), "   ").await,
            Err(SubmitError::Validation(ValidationError::EmptyBody))
        );
        assert_eq!(
            stream.submit(Some(author), "too long").await,
            Err(SubmitError::Validation(ValidationError::BodyTooLong { max: 5, actual: 8 }))
        );
        assert_eq!(backend.write_calls(), 0);
    }

    #[tokio::test]
    async fn transient_failure_is_surfaced_once_without_local_insert() {
        let (backend, author, post_id) = setup();
        let stream = CommentStream::connect(backend.clone(), post_id, CommentLimits::default());
        let mut rx = stream.subscribe();
        until(&mut rx, |v| v.status == FeedStatus::Live).await;

        backend.set_fail_writes(true);
        let err = stream.submit(Some(author), "lost?").await.unwrap_err();
        assert!(matches!(err, SubmitError::Transient(_)));
        assert_eq!(backend.write_calls(), 1);

        tokio::task::yield_now().await;
        assert!(stream.comments().is_empty());
        assert_eq!(backend.write_calls(), 1);
    }

    #[tokio::test]
    async fn unknown_author_maps_to_unauthenticated() {
        let (backend, _, post_id) = setup();
        let stream = CommentStream::connect(backend, post_id, CommentLimits::default());
        let stranger = uuid::Uuid::new_v4();
        assert_eq!(
            stream.submit(Some(stranger), "hi").await,
            Err(SubmitError::Unauthenticated)
        );
    }

    #[tokio::test]
    async fn redelivered_update_does_not_duplicate() {
        let (backend, author, post_id) = setup();
        let stream = CommentStream::connect(backend.clone(), post_id, CommentLimits::default());
        let mut rx = stream.subscribe();
        until(&mut rx, |v| v.status == FeedStatus::Live).await;

        stream.submit(Some(author), "once").await.unwrap();
        until(&mut rx, |v| v.list.len() == 1).await;

        let update = CommentUpdate::Append {
            version: 1,
            comments: stream.comments(),
        };
        backend.inject(post_id, update.clone());
        backend.inject(post_id, update);
        stream.submit(Some(author), "twice").await.unwrap();
        until(&mut rx, |v| v.list.len() == 2).await;

        let bodies: Vec<_> = stream.comments().into_iter().map(|c| c.body).collect();
        assert_eq!(bodies, ["once", "twice"]);
    }

    #[tokio::test]
    async fn lagging_feed_resubscribes_without_losing_comments() {
        let (backend, author, post_id) = setup();
        let stream = CommentStream::connect(backend.clone(), post_id, CommentLimits::default());
        let mut rx = stream.subscribe();
        until(&mut rx, |v| v.status == FeedStatus::Live).await;

        // The feed task cannot run until we yield, so the broadcast buffer overflows.
        for i in 0..300 {
            stream.submit(Some(author), &format!("c{}", i)).await.unwrap();
        }

        until(&mut rx, |v| v.list.len() == 300).await;
        assert_eq!(stream.status(), FeedStatus::Live);
        assert_eq!(stream.view().list.version(), 300);
    }

    #[tokio::test]
    async fn close_releases_the_subscription() {
        let (backend, author, post_id) = setup();
        let stream = CommentStream::connect(backend.clone(), post_id, CommentLimits::default());
        let mut rx = stream.subscribe();
        until(&mut rx, |v| v.status == FeedStatus::Live).await;

        stream.close().await;
        assert_eq!(rx.borrow().status, FeedStatus::Released);

        backend.create_comment(post_id, author, "after".into()).await.unwrap();
        tokio::task::yield_now().await;
        assert!(rx.borrow().list.is_empty());
    }

    #[tokio::test]
    async fn feed_attaching_after_release_keeps_released_status() {
        let (backend, _, post_id) = setup();
        let (tx, rx) = watch::channel(CommentView {
            list: CommentList::new(),
            status: FeedStatus::Released,
        });
        let tx = Arc::new(tx);
        let cancel = CancellationToken::new();
        cancel.cancel();

        // select! picks a ready branch at random, so cover both orders
        for _ in 0..16 {
            run_feed(backend.clone(), post_id, 0, tx.clone(), cancel.clone()).await;
            assert_eq!(rx.borrow().status, FeedStatus::Released);
        }
    }

    #[tokio::test]
    async fn feed_failure_after_release_keeps_released_status() {
        let (tx, rx) = watch::channel(CommentView {
            list: CommentList::new(),
            status: FeedStatus::Released,
        });
        let cancel = CancellationToken::new();
        cancel.cancel();

        set_status(&tx, &cancel, FeedStatus::Faulted("comment feed closed".into()));
        assert_eq!(rx.borrow().status, FeedStatus::Released);
    }
}
