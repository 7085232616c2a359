//! Operational information.

use axum::{Json, extract::State};
use cinder_scheduler::QueueInfo;
use std::sync::Arc;

use crate::state::AppState;

pub async fn queue_info(State(state): State<Arc<AppState>>) -> Json<QueueInfo> {
    Json(state.queue.info())
}
