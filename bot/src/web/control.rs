use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde::Serialize;
use tracing::info;

use super::app_state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub cached_servers: usize,
    pub cached_users: usize,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let (cached_servers, cached_users) = state.registry.cache_sizes();
    Json(HealthResponse {
        status: "ok",
        cached_servers,
        cached_users,
    })
}

/// Configuration-changed signal: drop the cached server so it reloads on next use.
pub async fn invalidate_server(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> Result<StatusCode, (StatusCode, &'static str)> {
    if state.registry.invalidate_server(id) {
        info!(guild_id = id, "invalidated over control plane");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err((StatusCode::NOT_FOUND, "Server not cached"))
    }
}
