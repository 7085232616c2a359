//! Inbound build triggers.

use axum::{
    Json,
    extract::State,
    http::{HeaderMap, StatusCode, Uri},
};
use cinder_scheduler::{Hook, TriggerOutcome};
use std::sync::Arc;
use tracing::info;

use super::created_or_ok;
use crate::error::{ApiError, ApiResult};
use crate::middleware::request_token;
use crate::state::AppState;

/// `POST /hook`. A skipped trigger is still a success, with the reason in the body.
pub async fn hook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    uri: Uri,
    Json(hook): Json<Hook>,
) -> ApiResult<(StatusCode, Json<TriggerOutcome>)> {
    let token = request_token(&headers, &uri)
        .ok_or_else(|| ApiError::Unauthorized("invalid or missing hook token".into()))?;

    info!(repo = %hook.repo, event = %hook.event, sha = %hook.commit.sha, "hook received");
    let outcome = state.triggers.handle(hook, &token).await?;
    Ok((created_or_ok(&outcome), Json(outcome)))
}
