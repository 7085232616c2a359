//! API route definitions.

use axum::{
    Router, middleware as axum_middleware,
    routing::{delete, get, post},
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::handlers::{builds, health, hooks, info, repos, rpc};
use crate::middleware::{cors_layer, request_id, require_admin, require_agent};
use crate::state::AppState;
use crate::ws;

/// Create the main API router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/hook", post(hooks::hook))
        .nest("/api", api_routes(state.clone()))
        .nest("/rpc", rpc_routes(state.clone()))
        .route("/stream/events", get(ws::ws_handler))
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .layer(axum_middleware::from_fn(request_id))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer())
        .with_state(state)
}

fn api_routes(state: Arc<AppState>) -> Router<Arc<AppState>> {
    build_routes().merge(admin_routes(state))
}

/// Repo-token or admin authorized, checked per handler.
fn build_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/repos/{owner}/{name}/builds",
            get(builds::list_builds).post(builds::create_build),
        )
        .route(
            "/repos/{owner}/{name}/builds/{number}",
            get(builds::get_build)
                .post(builds::restart_build)
                .delete(builds::cancel_build),
        )
}

fn admin_routes(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/repos", get(repos::list_repos).post(repos::register_repo))
        .route(
            "/repos/{owner}/{name}",
            get(repos::get_repo).patch(repos::update_repo),
        )
        .route(
            "/repos/{owner}/{name}/secrets",
            get(repos::list_secrets).post(repos::put_secret),
        )
        .route(
            "/repos/{owner}/{name}/secrets/{secret}",
            delete(repos::delete_secret),
        )
        .route("/info/queue", get(info::queue_info))
        .route_layer(axum_middleware::from_fn_with_state(state, require_admin))
}

fn rpc_routes(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/next", post(rpc::next))
        .route("/jobs/{id}/extend", post(rpc::extend))
        .route("/jobs/{id}/wait", post(rpc::wait))
        .route("/jobs/{id}/init", post(rpc::init))
        .route("/jobs/{id}/update", post(rpc::update))
        .route("/jobs/{id}/done", post(rpc::done))
        .route("/jobs/{id}/upload", post(rpc::upload))
        .route("/jobs/{id}/log", post(rpc::log))
        .route_layer(axum_middleware::from_fn_with_state(state, require_agent))
}
