use std::sync::Arc;

use sluice_core::config::GatewayConfig;
use sluice_engine::Engine;

/// Shared application state for axum handlers.
pub struct AppState {
    pub config: GatewayConfig,
    pub engine: Arc<Engine>,
}
