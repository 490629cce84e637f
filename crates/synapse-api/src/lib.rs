//! HTTP/WebSocket edge for the Synapse oracle.
//!
//! Telemetry and pipeline lifecycle writes, the dashboard read API and the
//! `/pipeline` topology stream, served by one axum router.

pub mod handlers;
pub mod payloads;
pub mod state;
pub mod ws;

pub use state::AppState;

use axum::routing::{get, post};
use axum::Router;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Bind error: {0}")]
    Bind(String),

    #[error("Server error: {0}")]
    Server(String),
}

/// HTTP API server
pub struct ApiServer {
    state: AppState,
    bind_address: String,
}

impl ApiServer {
    pub fn new(state: AppState, bind_address: &str) -> Self {
        Self {
            state,
            bind_address: bind_address.to_string(),
        }
    }

    pub fn router(state: AppState) -> Router {
        Router::new()
            .route("/health", get(handlers::health))
            // Telemetry
            .route("/api/metrics", post(handlers::submit_metrics))
            .route("/api/v1/metrics/report", post(handlers::submit_metrics))
            .route("/api/v1/metrics/:address", get(handlers::metrics_for_address))
            // Node and pipeline lifecycle
            .route("/api/nodes/register", post(handlers::register_node))
            .route("/api/v1/pipeline/register", post(handlers::register_pipeline))
            .route("/api/v1/pipeline/ready", post(handlers::pipeline_ready))
            .route("/api/v1/pipeline/topology", get(handlers::pipeline_topology))
            // Read API
            .route("/api/nodes", get(handlers::list_nodes))
            .route("/api/nodes/:address", get(handlers::get_node))
            .route("/api/agents", get(handlers::list_agents))
            .route("/api/agents/:address", get(handlers::get_agent))
            .route("/api/epochs", get(handlers::list_epochs))
            .route("/api/epochs/:number", get(handlers::get_epoch))
            .route("/api/challenges", get(handlers::list_challenges))
            .route("/api/rewards/:address", get(handlers::get_rewards))
            .route("/api/formula", get(handlers::get_formula))
            .route("/api/stats", get(handlers::get_stats))
            .route("/api/v1/leaderboard", get(handlers::leaderboard))
            .route("/api/v1/proofs/:address", get(handlers::proofs_for_address))
            .route("/api/v1/proofs/:address/stats", get(handlers::proof_stats))
            // Topology stream
            .route("/pipeline", get(ws::pipeline_ws))
            .with_state(state)
    }

    /// Serve until the shutdown channel fires, then drain in-flight
    /// requests and return.
    pub async fn run(
        self,
        mut shutdown: tokio::sync::broadcast::Receiver<()>,
    ) -> Result<(), ApiError> {
        let app = Self::router(self.state);

        let listener = tokio::net::TcpListener::bind(&self.bind_address)
            .await
            .map_err(|e| ApiError::Bind(e.to_string()))?;

        info!("API listening on http://{}", self.bind_address);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
            })
            .await
            .map_err(|e| ApiError::Server(e.to_string()))
    }
}
