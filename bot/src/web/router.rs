use std::sync::Arc;

use axum::Router;

use super::app_state::AppState;
use super::control;

/// Build the control-plane router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", axum::routing::get(control::health))
        .route(
            "/servers/{id}/invalidate",
            axum::routing::post(control::invalidate_server),
        )
        .with_state(state)
}
