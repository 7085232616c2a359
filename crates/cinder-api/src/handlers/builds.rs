//! Build read, manual trigger, re-run and cancellation.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, Uri},
};
use cinder_core::build::{Build, BuildEvent, Commit, Job};
use cinder_core::Error;
use cinder_core::repo::Repo;
use cinder_scheduler::{Hook, TriggerOutcome};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use super::{Access, authorized_repo, created_or_ok};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ListBuildsParams {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    25
}

#[derive(Debug, Serialize)]
pub struct BuildDetail {
    #[serde(flatten)]
    pub build: Build,
    pub jobs: Vec<Job>,
}

pub async fn list_builds(
    State(state): State<Arc<AppState>>,
    Path((owner, name)): Path<(String, String)>,
    Query(params): Query<ListBuildsParams>,
    headers: HeaderMap,
    uri: Uri,
) -> ApiResult<Json<Vec<Build>>> {
    let repo = authorized_repo(&state, &headers, &uri, (&owner, &name), Access::Read).await?;
    let limit = params.limit.clamp(1, 100);
    let builds = state.stores.builds.list(repo.id, limit).await?;
    Ok(Json(
        builds
            .into_iter()
            .map(|build| state.gateway.current_build(build))
            .collect(),
    ))
}

pub async fn get_build(
    State(state): State<Arc<AppState>>,
    Path((owner, name, number)): Path<(String, String, u64)>,
    headers: HeaderMap,
    uri: Uri,
) -> ApiResult<Json<BuildDetail>> {
    let repo = authorized_repo(&state, &headers, &uri, (&owner, &name), Access::Read).await?;
    let build = find_build(&state, &repo, number).await?;
    let jobs = state.gateway.current_jobs(build.id).await?;
    Ok(Json(BuildDetail { build, jobs }))
}

#[derive(Debug, Deserialize)]
pub struct TriggerBuildRequest {
    pub branch: String,
    pub sha: String,
    #[serde(default, rename = "ref")]
    pub git_ref: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub author: String,
    #[serde(default = "default_event")]
    pub event: BuildEvent,
    pub deploy_to: Option<String>,
    #[serde(default = "default_sender")]
    pub sender: String,
}

fn default_event() -> BuildEvent {
    BuildEvent::Push
}

fn default_sender() -> String {
    "api".to_string()
}

/// Manual trigger for a branch and commit.
pub async fn create_build(
    State(state): State<Arc<AppState>>,
    Path((owner, name)): Path<(String, String)>,
    headers: HeaderMap,
    uri: Uri,
    Json(request): Json<TriggerBuildRequest>,
) -> ApiResult<(StatusCode, Json<TriggerOutcome>)> {
    let repo = authorized_repo(&state, &headers, &uri, (&owner, &name), Access::Write).await?;
    if request.branch.is_empty() || request.sha.is_empty() {
        return Err(ApiError::BadRequest("branch and sha are required".into()));
    }

    let hook = Hook {
        repo: repo.full_name.clone(),
        event: request.event,
        commit: Commit {
            git_ref: request
                .git_ref
                .unwrap_or_else(|| format!("refs/heads/{}", request.branch)),
            sha: request.sha,
            branch: request.branch,
            message: request.message,
            author: request.author,
            link: None,
        },
        deploy_to: request.deploy_to,
        sender: request.sender,
    };
    info!(repo = %repo.full_name, branch = %hook.commit.branch, sender = %hook.sender, "manual trigger");
    let outcome = state.triggers.trigger(&repo, hook).await?;
    Ok((created_or_ok(&outcome), Json(outcome)))
}

#[derive(Debug, Deserialize)]
pub struct RestartParams {
    pub deploy_to: Option<String>,
    #[serde(default = "default_sender")]
    pub sender: String,
}

/// Re-run a finished build.
pub async fn restart_build(
    State(state): State<Arc<AppState>>,
    Path((owner, name, number)): Path<(String, String, u64)>,
    Query(params): Query<RestartParams>,
    headers: HeaderMap,
    uri: Uri,
) -> ApiResult<(StatusCode, Json<TriggerOutcome>)> {
    let repo = authorized_repo(&state, &headers, &uri, (&owner, &name), Access::Write).await?;
    let outcome = state
        .triggers
        .restart(&repo, number, &params.sender, params.deploy_to)
        .await?;
    Ok((created_or_ok(&outcome), Json(outcome)))
}

pub async fn cancel_build(
    State(state): State<Arc<AppState>>,
    Path((owner, name, number)): Path<(String, String, u64)>,
    headers: HeaderMap,
    uri: Uri,
) -> ApiResult<Json<Build>> {
    let repo = authorized_repo(&state, &headers, &uri, (&owner, &name), Access::Write).await?;
    let build = find_build(&state, &repo, number).await?;
    Ok(Json(state.gateway.cancel_build(build.id).await?))
}

async fn find_build(state: &AppState, repo: &Repo, number: u64) -> ApiResult<Build> {
    let build = state
        .stores
        .builds
        .find_by_number(repo.id, number)
        .await?
        .ok_or_else(|| Error::not_found("build", number))?;
    Ok(state.gateway.current_build(build))
}
