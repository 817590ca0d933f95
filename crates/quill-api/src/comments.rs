use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::{debug, error};
use uuid::Uuid;

use quill_sync::{ReactiveBackend, SubmitError, ValidationError, submit_comment};
use quill_types::api::{Claims, CreateCommentRequest};

use crate::auth::AppState;

/// GET /posts/{post_id}/comments
pub async fn get_comments(
    State(state): State<AppState>,
    Path(post_id): Path<Uuid>,
) -> Result<impl IntoResponse, StatusCode> {
    let comments = state.store.get_comments_by_post_id(post_id).await.map_err(|e| {
        error!("Comment lookup for post {} failed: {}", post_id, e);
        StatusCode::SERVICE_UNAVAILABLE
    })?;
    Ok(Json(comments))
}

/// POST /posts/{post_id}/comments
///
/// 202 means the store accepted the comment. It reaches readers, the author
/// included, through the live feed.
pub async fn create_comment(
    State(state): State<AppState>,
    Path(post_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateCommentRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    submit_comment(state.store.as_ref(), post_id, Some(claims.sub), &req.body, &state.limits)
        .await
        .map_err(|e| {
            debug!("Comment by {} on post {} rejected: {}", claims.sub, post_id, e);
            status_for(&e)
        })?;

    Ok(StatusCode::ACCEPTED)
}

fn status_for(err: &SubmitError) -> StatusCode {
    match err {
        SubmitError::Validation(ValidationError::UnknownPost(_)) => StatusCode::NOT_FOUND,
        SubmitError::Validation(_) => StatusCode::BAD_REQUEST,
        SubmitError::Unauthenticated => StatusCode::UNAUTHORIZED,
        SubmitError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}
