//! Repository and secret administration.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use cinder_auth::{TokenKind, generate_hash, sign_token};
use cinder_core::Error;
use cinder_core::build::BuildEvent;
use cinder_core::repo::{Repo, RepoPatch, RepoPolicy};
use cinder_core::secret::Secret;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use super::find_repo;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RegisterRepoRequest {
    pub owner: String,
    pub name: String,
    #[serde(default)]
    pub private: bool,
    pub link: Option<String>,
    #[serde(default)]
    pub policy: RepoPolicy,
}

#[derive(Debug, Serialize)]
pub struct RegisterRepoResponse {
    pub repo: Repo,
    /// Bearer token for `POST /hook` and build administration.
    pub hook_token: String,
    /// Bearer token for reading builds and streaming private events.
    pub pull_token: String,
}

pub async fn register_repo(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RegisterRepoRequest>,
) -> ApiResult<(StatusCode, Json<RegisterRepoResponse>)> {
    if request.owner.is_empty() || request.name.is_empty() || request.name.contains('/') {
        return Err(ApiError::BadRequest("owner and name are required".into()));
    }

    let mut repo = Repo::new(request.owner, request.name, generate_hash())
        .with_private(request.private)
        .with_policy(request.policy);
    repo.link = request.link;
    state.stores.repos.create(&repo).await?;
    info!(repo = %repo.full_name, private = repo.private, "repo registered");

    let response = RegisterRepoResponse {
        hook_token: sign_token(&repo, TokenKind::Hook).map_err(Error::from)?,
        pull_token: sign_token(&repo, TokenKind::Pull).map_err(Error::from)?,
        repo,
    };
    Ok((StatusCode::CREATED, Json(response)))
}

pub async fn list_repos(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<Repo>>> {
    Ok(Json(state.stores.repos.list().await?))
}

pub async fn get_repo(
    State(state): State<Arc<AppState>>,
    Path((owner, name)): Path<(String, String)>,
) -> ApiResult<Json<Repo>> {
    Ok(Json(find_repo(&state, &owner, &name).await?))
}

pub async fn update_repo(
    State(state): State<Arc<AppState>>,
    Path((owner, name)): Path<(String, String)>,
    Json(patch): Json<RepoPatch>,
) -> ApiResult<Json<Repo>> {
    let mut repo = find_repo(&state, &owner, &name).await?;
    patch.apply(&mut repo);
    state.stores.repos.update(&repo).await?;
    info!(repo = %repo.full_name, trusted = repo.policy.trusted, "repo policy updated");
    Ok(Json(repo))
}

#[derive(Debug, Deserialize)]
pub struct SecretRequest {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub events: Vec<BuildEvent>,
    #[serde(default)]
    pub skip_verify: bool,
    #[serde(default)]
    pub conceal: bool,
}

pub async fn list_secrets(
    State(state): State<Arc<AppState>>,
    Path((owner, name)): Path<(String, String)>,
) -> ApiResult<Json<Vec<Secret>>> {
    let repo = find_repo(&state, &owner, &name).await?;
    Ok(Json(state.stores.secrets.list(repo.id).await?))
}

pub async fn put_secret(
    State(state): State<Arc<AppState>>,
    Path((owner, name)): Path<(String, String)>,
    Json(request): Json<SecretRequest>,
) -> ApiResult<(StatusCode, Json<Secret>)> {
    if request.name.is_empty() || request.value.is_empty() {
        return Err(ApiError::BadRequest("secret name and value are required".into()));
    }
    let repo = find_repo(&state, &owner, &name).await?;

    let mut secret = Secret::new(repo.id, request.name, request.value)
        .with_images(request.images)
        .with_events(request.events)
        .with_skip_verify(request.skip_verify);
    secret.conceal = request.conceal;
    state.stores.secrets.upsert(&secret).await?;
    info!(repo = %repo.full_name, secret = %secret.name, "secret stored");
    Ok((StatusCode::CREATED, Json(secret)))
}

pub async fn delete_secret(
    State(state): State<Arc<AppState>>,
    Path((owner, name, secret)): Path<(String, String, String)>,
) -> ApiResult<StatusCode> {
    let repo = find_repo(&state, &owner, &name).await?;
    state.stores.secrets.delete(repo.id, &secret).await?;
    info!(repo = %repo.full_name, %secret, "secret deleted");
    Ok(StatusCode::NO_CONTENT)
}
