use chrono::{DateTime, Datelike, Utc};
use serde::Serialize;

use quill_types::ViewerId;
use quill_types::api::PageMetadata;
use quill_types::models::{Comment, Post};

use crate::snapshot::{Preloaded, Snapshot};

/// Shown when a post has no image of its own.
pub const FALLBACK_IMAGE_URL: &str = "https://images.unsplash.com/photo-1761168129112-4ddc297dc797?w=600&auto=format&fit=crop&q=60&ixlib=rb-4.1.0&ixid=M3wxMjA3fDB8MHxzZWFyY2h8MTV8fHBsYWNlaG9sZGVyJTIwaW1hZ2V8ZW58MHx8MHx8fDA%3D";

pub const NOT_FOUND_TITLE: &str = "No post found";

/// Who may see a post page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessPolicy {
    /// Anonymous readers get the page, read-only and without presence.
    Open,
    /// Anonymous readers are sent to `login_path`.
    RequireLogin { login_path: String },
}

impl AccessPolicy {
    pub fn require_login() -> Self {
        Self::RequireLogin {
            login_path: "/auth/login".to_string(),
        }
    }
}

/// Everything a post page needs to render on first paint.
#[derive(Debug, Serialize)]
pub struct PostPage {
    pub post: Post,
    pub image_url: String,
    pub posted_on: String,
    pub comments: Snapshot<Vec<Comment>>,
    pub viewer_id: Option<ViewerId>,
    /// Presence is only mounted for identified viewers.
    pub show_presence: bool,
}

#[derive(Debug)]
pub enum PageOutcome {
    Render(PostPage),
    Redirect { target: String },
    NotFound,
}

/// Decide what a request for a post page gets. A missing post is reported
/// before any identity check.
pub fn decide_page(preloaded: Preloaded, viewer: Option<ViewerId>, policy: &AccessPolicy) -> PageOutcome {
    let (post, comments) = match preloaded {
        Preloaded::Found { post, comments } => (post, comments),
        Preloaded::NotFound => return PageOutcome::NotFound,
    };

    if let (None, AccessPolicy::RequireLogin { login_path }) = (viewer, policy) {
        return PageOutcome::Redirect {
            target: login_path.clone(),
        };
    }

    let image_url = post
        .image_url
        .clone()
        .unwrap_or_else(|| FALLBACK_IMAGE_URL.to_string());
    let posted_on = posted_on(post.created_at);

    PageOutcome::Render(PostPage {
        post,
        image_url,
        posted_on,
        comments,
        viewer_id: viewer,
        show_presence: viewer.is_some(),
    })
}

/// Title and description for the page head.
pub fn metadata(post: Option<&Post>) -> PageMetadata {
    match post {
        Some(post) => PageMetadata {
            title: post.title.clone(),
            description: Some(post.body.clone()),
        },
        None => PageMetadata {
            title: NOT_FOUND_TITLE.to_string(),
            description: None,
        },
    }
}

/// en-US short date, e.g. `3/7/2025`.
pub fn posted_on(at: DateTime<Utc>) -> String {
    format!("{}/{}/{}", at.month(), at.day(), at.year())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn post(image_url: Option<&str>) -> Post {
        Post {
            id: Uuid::new_v4(),
            author_id: Uuid::new_v4(),
            title: "Hello".into(),
            body: "World".into(),
            image_url: image_url.map(String::from),
            created_at: Utc.with_ymd_and_hms(2025, 3, 7, 22, 15, 0).unwrap(),
        }
    }

    fn found(post: Post) -> Preloaded {
        let comments = Snapshot::new(post.id, 0, Utc::now(), Vec::new());
        Preloaded::Found { post, comments }
    }

    #[test]
    fn missing_post_wins_over_login_redirect() {
        let outcome = decide_page(Preloaded::NotFound, None, &AccessPolicy::require_login());
        assert!(matches!(outcome, PageOutcome::NotFound));
    }

    #[test]
    fn anonymous_viewer_redirected_only_when_required() {
        match decide_page(found(post(None)), None, &AccessPolicy::require_login()) {
            PageOutcome::Redirect { target } => assert_eq!(target, "/auth/login"),
            other => panic!("expected redirect, got {:?}", other),
        }

        match decide_page(found(post(None)), None, &AccessPolicy::Open) {
            PageOutcome::Render(page) => {
                assert!(!page.show_presence);
                assert_eq!(page.viewer_id, None);
            }
            other => panic!("expected render, got {:?}", other),
        }
    }

    #[test]
    fn render_fills_image_and_date() {
        let viewer = Uuid::new_v4();
        let PageOutcome::Render(page) = decide_page(found(post(None)), Some(viewer), &AccessPolicy::require_login())
        else {
            panic!("expected render");
        };
        assert_eq!(page.image_url, FALLBACK_IMAGE_URL);
        assert_eq!(page.posted_on, "3/7/2025");
        assert!(page.show_presence);

        let PageOutcome::Render(page) = decide_page(found(post(Some("/img.png"))), Some(viewer), &AccessPolicy::Open)
        else {
            panic!("expected render");
        };
        assert_eq!(page.image_url, "/img.png");
    }

    #[test]
    fn metadata_falls_back_for_missing_post() {
        assert_eq!(metadata(None).title, NOT_FOUND_TITLE);
        let p = post(None);
        let meta = metadata(Some(&p));
        assert_eq!(meta.title, "Hello");
        assert_eq!(meta.description.as_deref(), Some("World"));
    }
}
