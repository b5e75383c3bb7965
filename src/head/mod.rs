//! Head: configuration authority and report ingestion.

pub mod config;
mod error;
mod handlers;
pub mod registry;
pub mod store;

pub use store::ConfigStore;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post, put},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::models::ReportPacket;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<ConfigStore>,
    /// Accepted reports on their way to the metric sink.
    pub sink_tx: mpsc::Sender<ReportPacket>,
}

/// Build the router with all routes.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

    Router::new()
        // Satellite API
        .route("/satellites/{name}/targets", get(handlers::handle_get_targets))
        .route("/satellites/{name}/{target}/metrics", put(handlers::handle_submit_metrics))
        // Admin API
        .route(
            "/satellites",
            get(handlers::handle_list_satellites).post(handlers::handle_create_satellite),
        )
        .route(
            "/satellites/{name}",
            get(handlers::handle_get_satellite)
                .put(handlers::handle_put_satellite)
                .patch(handlers::handle_patch_satellite)
                .delete(handlers::handle_delete_satellite),
        )
        .route(
            "/config",
            get(handlers::handle_get_config).put(handlers::handle_put_config),
        )
        .route("/config/reload", post(handlers::handle_reload_config))
        // Status
        .route("/healthz", get(handlers::handle_health))
        .route("/version", get(handlers::handle_version))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB
        .with_state(state)
}

/// HTTP server for the head.
pub struct Server {
    addr: SocketAddr,
    state: AppState,
}

impl Server {
    pub fn new(http_port: u16, state: AppState) -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], http_port)),
            state,
        }
    }

    /// Serve until `shutdown` is cancelled.
    pub async fn start(&self, shutdown: CancellationToken) -> std::io::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("Head listening on {}", self.addr);

        axum::serve(listener, router(self.state.clone()))
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
    }
}
