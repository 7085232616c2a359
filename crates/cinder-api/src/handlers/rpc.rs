//! Agent RPC surface.
//!
//! Every route sits behind the agent secret. `next` and `wait` are long polls:
//! when the agent disconnects the handler future is dropped, which abandons
//! the wait without touching the queue.

use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use cinder_core::build::{File, JobState, LogLine};
use cinder_core::JobId;
use cinder_scheduler::TaskFilter;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ApiError, ApiResult};
use crate::middleware::AGENT_HEADER;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct NextRequest {
    /// Agent capabilities, e.g. `platform: linux/amd64`.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Lease the next pipeline, or `204 No Content` when none arrives in time.
pub async fn next(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<NextRequest>,
) -> ApiResult<Response> {
    let agent = agent_name(&headers);
    let filter = TaskFilter::new(request.labels);
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    match tokio::time::timeout(state.poll_timeout, state.gateway.next(&filter, &cancel)).await {
        Ok(result) => {
            let pipeline = result?;
            debug!(job = %pipeline.id, agent = ?agent, "pipeline handed out");
            Ok(Json(pipeline).into_response())
        }
        Err(_) => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

pub async fn extend(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.gateway.extend(parse_job(&id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn wait(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let id = parse_job(&id)?;
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    state.gateway.wait(id, &cancel).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn init(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(job_state): Json<JobState>,
) -> ApiResult<StatusCode> {
    state
        .gateway
        .init(parse_job(&id)?, job_state, agent_name(&headers))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(job_state): Json<JobState>,
) -> ApiResult<StatusCode> {
    state.gateway.update(parse_job(&id)?, job_state).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn done(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(job_state): Json<JobState>,
) -> ApiResult<StatusCode> {
    state.gateway.done(parse_job(&id)?, job_state).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct UploadRequest {
    pub name: String,
    #[serde(default = "default_mime")]
    pub mime: String,
    /// Base64-encoded file content.
    pub data: String,
}

fn default_mime() -> String {
    "application/octet-stream".to_string()
}

pub async fn upload(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<UploadRequest>,
) -> ApiResult<StatusCode> {
    let data = STANDARD
        .decode(request.data.as_bytes())
        .map_err(|e| ApiError::BadRequest(format!("invalid file data: {}", e)))?;
    let file = File {
        name: request.name,
        mime: request.mime,
        data,
    };
    state.gateway.upload(parse_job(&id)?, file).await?;
    Ok(StatusCode::CREATED)
}

#[derive(Debug, Deserialize)]
pub struct LogRequest {
    #[serde(default)]
    pub proc: String,
    #[serde(default)]
    pub pos: u64,
    #[serde(default)]
    pub time: i64,
    pub out: String,
}

pub async fn log(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<LogRequest>,
) -> ApiResult<StatusCode> {
    let id = parse_job(&id)?;
    let line = LogLine {
        job_id: id,
        proc: request.proc,
        pos: request.pos,
        time: request.time,
        out: request.out,
    };
    state.gateway.log(id, line).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn parse_job(id: &str) -> ApiResult<JobId> {
    id.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid job id: {}", id)))
}

fn agent_name(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AGENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
