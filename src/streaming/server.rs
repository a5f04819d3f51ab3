use crate::{
    config::StreamConfig,
    control::Controller,
    error::{Result, StreamError},
};
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use super::handlers::{
    capture_start_handler, capture_stop_handler, config_get_handler, config_update_handler,
    health_handler, mjpeg_overlay_handler, mjpeg_stream_handler, snapshot_handler, stats_handler,
    status_handler, stream_page_handler,
};

/// Shared state for the Axum server
#[derive(Clone)]
pub struct ServerState {
    pub(crate) controller: Arc<Controller>,
    pub(crate) frame_interval: Duration,
    pub(crate) jpeg_quality: u8,
    /// Ends open MJPEG streams so graceful shutdown can finish
    pub(crate) shutdown: CancellationToken,
}

impl ServerState {
    pub fn new(controller: Arc<Controller>, fps: u32, jpeg_quality: u8) -> Self {
        Self {
            controller,
            frame_interval: Duration::from_micros(1_000_000u64 / fps.max(1) as u64),
            jpeg_quality,
            shutdown: CancellationToken::new(),
        }
    }
}

/// HTTP server for live MJPEG streams, snapshots, stats and runtime config
pub struct StreamServer {
    pub(crate) config: StreamConfig,
    pub(crate) state: ServerState,
}

impl StreamServer {
    pub fn new(config: StreamConfig, controller: Arc<Controller>) -> Self {
        let state = ServerState::new(controller, config.fps, config.jpeg_quality);
        Self { config, state }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.config.ip, self.config.port)
    }

    /// All routes with tracing and permissive CORS applied
    pub fn router(&self) -> Router {
        router(self.state.clone())
    }

    /// Bind and serve until `shutdown` is cancelled, which also ends open MJPEG streams
    pub async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        let addr = self.address();
        info!("Starting HTTP server on {}", addr);

        let listener =
            tokio::net::TcpListener::bind(&addr)
                .await
                .map_err(|e| StreamError::BindFailed {
                    address: addr.clone(),
                    source: e,
                })?;

        info!("HTTP server listening on {}", addr);

        let state = ServerState {
            shutdown: shutdown.clone(),
            ..self.state.clone()
        };

        axum::serve(listener, router(state))
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| StreamError::StartupFailed {
                details: format!("Server error: {}", e),
            })?;

        info!("HTTP server on {} stopped", addr);
        Ok(())
    }
}

pub(crate) fn router(state: ServerState) -> Router {
    Router::new()
        .route("/", get(stream_page_handler))
        .route("/stream", get(mjpeg_stream_handler))
        .route("/stream/overlay", get(mjpeg_overlay_handler))
        .route("/snapshot", get(snapshot_handler))
        .route("/api/stats", get(stats_handler))
        .route("/api/status", get(status_handler))
        .route(
            "/api/config",
            get(config_get_handler).post(config_update_handler),
        )
        .route("/api/capture/start", post(capture_start_handler))
        .route("/api/capture/stop", post(capture_stop_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
