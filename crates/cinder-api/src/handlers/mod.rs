//! Request handlers organized by resource.

pub mod builds;
pub mod health;
pub mod hooks;
pub mod info;
pub mod repos;
pub mod rpc;

use axum::http::{HeaderMap, StatusCode, Uri};
use cinder_auth::{TokenKind, verify_token};
use cinder_core::repo::Repo;
use cinder_core::Error;
use cinder_scheduler::TriggerOutcome;

use crate::error::{ApiError, ApiResult};
use crate::middleware::{is_admin, request_token};
use crate::state::AppState;

/// What a caller wants to do with a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Access {
    Read,
    Write,
}

pub(crate) async fn find_repo(state: &AppState, owner: &str, name: &str) -> ApiResult<Repo> {
    let full_name = format!("{}/{}", owner, name);
    state
        .stores
        .repos
        .find_by_name(&full_name)
        .await?
        .ok_or_else(|| Error::not_found("repo", full_name).into())
}

/// Look up a repository on behalf of a possibly unauthenticated caller. Only
/// admins learn that a repository is missing; everyone else gets the same 401
/// a private repository would give them.
pub(crate) async fn authorized_repo(
    state: &AppState,
    headers: &HeaderMap,
    uri: &Uri,
    (owner, name): (&str, &str),
    access: Access,
) -> ApiResult<Repo> {
    let full_name = format!("{}/{}", owner, name);
    match state.stores.repos.find_by_name(&full_name).await? {
        Some(repo) => {
            authorize(state, headers, uri, &repo, access)?;
            Ok(repo)
        }
        None if is_admin(state, headers, uri) => Err(Error::not_found("repo", full_name).into()),
        None => Err(denied()),
    }
}

fn denied() -> ApiError {
    ApiError::Unauthorized("invalid or missing repo token".into())
}

/// Admins may do anything. Otherwise writes need a hook token for the repo;
/// reads need a pull or hook token unless the repo is public.
fn authorize(
    state: &AppState,
    headers: &HeaderMap,
    uri: &Uri,
    repo: &Repo,
    access: Access,
) -> ApiResult<()> {
    if is_admin(state, headers, uri) {
        return Ok(());
    }
    match request_token(headers, uri) {
        Some(token) => {
            let hook = verify_token(&token, repo, TokenKind::Hook).is_ok();
            let pull = access == Access::Read && verify_token(&token, repo, TokenKind::Pull).is_ok();
            if hook || pull { Ok(()) } else { Err(denied()) }
        }
        None if access == Access::Read && !repo.private => Ok(()),
        None => Err(denied()),
    }
}

pub(crate) fn created_or_ok(outcome: &TriggerOutcome) -> StatusCode {
    match outcome {
        TriggerOutcome::Created { .. } => StatusCode::CREATED,
        TriggerOutcome::Skipped { .. } => StatusCode::OK,
    }
}
