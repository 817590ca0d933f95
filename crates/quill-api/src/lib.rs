pub mod auth;
pub mod comments;
pub mod middleware;
pub mod posts;
pub mod presence;

use axum::{
    Router,
    middleware as axum_middleware,
    routing::{get, post},
};

use crate::auth::AppState;
use crate::middleware::require_auth;

/// All HTTP routes except the WebSocket gateway.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route("/posts", get(posts::list_posts))
        .route("/posts/{post_id}", get(posts::get_post_page))
        .route("/posts/{post_id}/metadata", get(posts::get_post_metadata))
        .route("/posts/{post_id}/comments", get(comments::get_comments))
        .route("/rooms/{room_id}/presence", get(presence::get_presence))
        .with_state(state.clone());

    let protected_routes = Router::new()
        .route("/posts", post(posts::create_post))
        .route("/posts/{post_id}/comments", post(comments::create_comment))
        .layer(axum_middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state);

    Router::new().merge(public_routes).merge(protected_routes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode, header};
    use chrono::TimeDelta;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use quill_db::Database;
    use quill_gateway::{Dispatcher, Store};
    use quill_sync::{AccessPolicy, CommentLimits, SystemClock};

    use crate::auth::AppStateInner;

    fn state(policy: AccessPolicy) -> AppState {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let store = Arc::new(Store::new(
            db,
            Dispatcher::new(TimeDelta::seconds(30)),
            Arc::new(SystemClock),
            "test-secret".into(),
        ));
        Arc::new(AppStateInner {
            store,
            jwt_secret: "test-secret".into(),
            limits: CommentLimits::default(),
            policy,
        })
    }

    async fn call(app: &Router, method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            req = req.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let req = match body {
            Some(body) => req
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => req.body(Body::empty()).unwrap(),
        };

        let res = app.clone().oneshot(req).await.unwrap();
        let status = res.status();
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn register(app: &Router, name: &str) -> String {
        let (status, body) = call(
            app,
            "POST",
            "/auth/register",
            None,
            Some(json!({"name": name, "email": format!("{}@example.com", name), "password": "hunter22"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        body["token"].as_str().unwrap().to_string()
    }

    async fn publish(app: &Router, token: &str) -> String {
        let (status, post) = call(
            app,
            "POST",
            "/posts",
            Some(token),
            Some(json!({"title": "Hello", "body": "World", "image_url": null})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        post["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn register_validates_and_login_checks_password() {
        let app = router(state(AccessPolicy::Open));

        let (status, _) = call(
            &app,
            "POST",
            "/auth/register",
            None,
            Some(json!({"name": "al", "email": "al@example.com", "password": "hunter22"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        register(&app, "ada").await;

        let (status, body) = call(
            &app,
            "POST",
            "/auth/login",
            None,
            Some(json!({"email": "ada@example.com", "password": "hunter22"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "ada");

        let (status, _) = call(
            &app,
            "POST",
            "/auth/login",
            None,
            Some(json!({"email": "ada@example.com", "password": "wrong-one"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn page_renders_snapshot_with_fallback_image() {
        let app = router(state(AccessPolicy::Open));
        let token = register(&app, "ada").await;
        let post_id = publish(&app, &token).await;

        let (status, _) = call(
            &app,
            "POST",
            &format!("/posts/{}/comments", post_id),
            Some(&token),
            Some(json!({"body": "first"})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let (status, page) = call(&app, "GET", &format!("/posts/{}", post_id), None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["image_url"], quill_sync::page::FALLBACK_IMAGE_URL);
        assert_eq!(page["show_presence"], false);
        assert_eq!(page["comments"]["version"], 1);
        assert_eq!(page["comments"]["data"][0]["body"], "first");

        let (_, page) = call(&app, "GET", &format!("/posts/{}", post_id), Some(&token), None).await;
        assert_eq!(page["show_presence"], true);
    }

    #[tokio::test]
    async fn missing_post_and_login_redirect() {
        let app = router(state(AccessPolicy::require_login()));
        let token = register(&app, "ada").await;
        let post_id = publish(&app, &token).await;

        let missing = uuid::Uuid::new_v4();
        let (status, body) = call(&app, "GET", &format!("/posts/{}", missing), None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["title"], "No post found");

        let (status, _) = call(&app, "GET", &format!("/posts/{}", post_id), None, None).await;
        assert_eq!(status, StatusCode::SEE_OTHER);

        let (_, meta) = call(&app, "GET", &format!("/posts/{}/metadata", post_id), None, None).await;
        assert_eq!(meta["title"], "Hello");
        assert_eq!(meta["description"], "World");
    }

    #[tokio::test]
    async fn malformed_post_id_is_not_found() {
        let app = router(state(AccessPolicy::Open));

        let (status, body) = call(&app, "GET", "/posts/not-a-uuid", None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["title"], "No post found");

        let (status, meta) = call(&app, "GET", "/posts/not-a-uuid/metadata", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(meta["title"], "No post found");
    }

    #[tokio::test]
    async fn comment_submission_statuses() {
        let app = router(state(AccessPolicy::Open));
        let token = register(&app, "ada").await;
        let post_id = publish(&app, &token).await;
        let uri = format!("/posts/{}/comments", post_id);

        let (status, _) = call(&app, "POST", &uri, None, Some(json!({"body": "hi"}))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = call(&app, "POST", &uri, Some(&token), Some(json!({"body": "   "}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let missing = format!("/posts/{}/comments", uuid::Uuid::new_v4());
        let (status, _) = call(&app, "POST", &missing, Some(&token), Some(json!({"body": "hi"}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, comments) = call(&app, "GET", &uri, None, None).await;
        assert_eq!(comments["version"], 0);
    }
}
