//! HTTP middleware and credential extraction.

use axum::{
    body::Body,
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, Method, Request, Uri, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::headers::{Authorization, HeaderMapExt, authorization::Bearer};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

/// Header agents use to identify themselves in RPC calls.
pub const AGENT_HEADER: &str = "x-cinder-agent";

pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT])
        .allow_origin(Any)
}

/// Inject request ID into each request.
pub async fn request_id(mut request: Request<Body>, next: Next) -> Response {
    let request_id = HeaderValue::from_str(&Uuid::new_v4().to_string()).ok();
    if let Some(id) = &request_id {
        request.headers_mut().insert("x-request-id", id.clone());
    }

    let mut response = next.run(request).await;
    if let Some(id) = request_id {
        response.headers_mut().insert("x-request-id", id);
    }
    response
}

#[derive(Debug, Default, Deserialize)]
pub struct TokenQuery {
    pub access_token: Option<String>,
}

/// Bearer token from the `Authorization` header, falling back to `?access_token=`.
pub fn request_token(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    if let Some(Authorization(bearer)) = headers.typed_get::<Authorization<Bearer>>() {
        return Some(bearer.token().to_string());
    }
    Query::<TokenQuery>::try_from_uri(uri)
        .ok()
        .and_then(|Query(query)| query.access_token)
        .filter(|token| !token.is_empty())
}

/// Reject agent RPC calls without the shared agent secret.
pub async fn require_agent(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let authorized = request_token(request.headers(), request.uri())
        .is_some_and(|token| state.agent_secret.verify(&token));
    if !authorized {
        warn!(path = %request.uri().path(), "agent request rejected");
        return ApiError::Unauthorized("invalid agent credentials".into()).into_response();
    }
    next.run(request).await
}

/// Reject administrative calls without the admin secret.
pub async fn require_admin(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !is_admin(&state, request.headers(), request.uri()) {
        warn!(path = %request.uri().path(), "admin request rejected");
        return ApiError::Unauthorized("invalid admin credentials".into()).into_response();
    }
    next.run(request).await
}

pub fn is_admin(state: &AppState, headers: &HeaderMap, uri: &Uri) -> bool {
    request_token(headers, uri).is_some_and(|token| state.admin_secret.verify(&token))
}
