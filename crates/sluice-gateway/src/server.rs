use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use sluice_core::config::GatewayConfig;
use sluice_engine::Engine;

use crate::routes;
use crate::state::AppState;

/// Build the API router over an engine.
pub fn router(config: GatewayConfig, engine: Arc<Engine>) -> Router {
    let state = Arc::new(AppState { config, engine });

    Router::new()
        .route("/api/health", get(routes::health))
        .route("/api/pipelines", get(routes::list_pipelines))
        .route("/api/runs", get(routes::list_runs).post(routes::start_run))
        .route("/api/runs/{id}", get(routes::get_run))
        .route("/api/runs/{id}/dead-letters", get(routes::dead_letters))
        .route("/api/runs/{id}/gates/{step}/approve", post(routes::approve_gate))
        .route("/api/runs/{id}/resume", post(routes::resume_run))
        .route("/api/runs/{id}/cancel", post(routes::cancel_run))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// HTTP gateway server built on axum.
pub struct GatewayServer {
    config: GatewayConfig,
    engine: Arc<Engine>,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig, engine: Arc<Engine>) -> Self {
        Self { config, engine }
    }

    /// Run the gateway server until the cancellation token is triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let app = router(self.config.clone(), self.engine.clone());

        let listener = TcpListener::bind(&self.config.bind).await?;
        info!(bind = %self.config.bind, auth = self.config.token.is_some(), "Gateway listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Gateway shut down");
        Ok(())
    }
}
