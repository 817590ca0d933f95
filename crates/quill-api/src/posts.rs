use axum::{
    Extension, Json,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
};
use tracing::{debug, error, info};
use uuid::Uuid;

use quill_gateway::store::{post_from_row, timestamp};
use quill_sync::{Clock, PageOutcome, ReactiveBackend, SnapshotPreloader, decide_page, metadata};
use quill_types::api::{Claims, CreatePostRequest};
use quill_types::models::Post;

use crate::auth::AppState;
use crate::middleware::bearer_token;

const LIST_LIMIT: u32 = 50;

/// GET /posts/{post_id}
///
/// Preloads the post and its comment snapshot and resolves the viewer at the
/// same time, then decides between rendering, a login redirect and 404.
pub async fn get_post_page(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, StatusCode> {
    // An id that cannot name a post is the same as a post that is not there.
    let Ok(post_id) = raw_id.parse::<Uuid>() else {
        debug!("Malformed post id '{}'", raw_id);
        return Ok(not_found());
    };

    let store = state.store.clone();
    let preloader = SnapshotPreloader::new(store.clone(), store.clock().clone());
    let token = bearer_token(&headers).map(str::to_string);

    let (preloaded, viewer) = tokio::join!(preloader.preload(post_id), async {
        match token {
            Some(token) => store.get_user_id(&token).await,
            None => None,
        }
    });
    let preloaded = preloaded.map_err(|e| {
        error!("Preload of post {} failed: {}", post_id, e);
        StatusCode::SERVICE_UNAVAILABLE
    })?;

    Ok(match decide_page(preloaded, viewer, &state.policy) {
        PageOutcome::Render(page) => Json(page).into_response(),
        PageOutcome::Redirect { target } => {
            debug!("Anonymous request for post {}, redirecting to {}", post_id, target);
            Redirect::to(&target).into_response()
        }
        PageOutcome::NotFound => not_found(),
    })
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(metadata(None))).into_response()
}

/// GET /posts/{post_id}/metadata
pub async fn get_post_metadata(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    let Ok(post_id) = raw_id.parse::<Uuid>() else {
        return Ok(Json(metadata(None)));
    };
    let post = state.store.get_post_by_id(post_id).await.map_err(|e| {
        error!("Metadata lookup for post {} failed: {}", post_id, e);
        StatusCode::SERVICE_UNAVAILABLE
    })?;
    Ok(Json(metadata(post.as_ref())))
}

/// GET /posts, newest first.
pub async fn list_posts(State(state): State<AppState>) -> Result<impl IntoResponse, StatusCode> {
    let db = state.store.db().clone();
    let rows = tokio::task::spawn_blocking(move || db.list_posts(LIST_LIMIT))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let posts: Vec<Post> = rows.into_iter().map(post_from_row).collect();
    Ok(Json(posts))
}

/// POST /posts
pub async fn create_post(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreatePostRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let title = req.title.trim().to_string();
    let body = req.body.trim().to_string();
    if title.is_empty() || body.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let image_url = req.image_url.map(|u| u.trim().to_string()).filter(|u| !u.is_empty());

    let post = Post {
        id: Uuid::new_v4(),
        author_id: claims.sub,
        title,
        body,
        image_url,
        created_at: state.store.clock().now(),
    };

    let db = state.store.db().clone();
    let row = post.clone();
    tokio::task::spawn_blocking(move || {
        db.insert_post(
            &row.id.to_string(),
            &row.author_id.to_string(),
            &row.title,
            &row.body,
            row.image_url.as_deref(),
            &timestamp(row.created_at),
        )
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    info!("{} published post {}", claims.name, post.id);
    Ok((StatusCode::CREATED, Json(post)))
}
