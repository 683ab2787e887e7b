use std::sync::Arc;

use crate::engine::registry::Registry;

/// Shared state handed to every control-plane handler.
pub struct AppState {
    pub registry: Arc<Registry>,
}
