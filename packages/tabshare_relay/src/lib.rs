//! Real-time group relay for shared browser tabs.
//!
//! Clients join named groups over a WebSocket; tab shares, annotations and
//! cluster updates are fanned out to the other members. All state is held in
//! memory and aged out by the liveness sweeper.

pub mod config;
pub mod group;
mod handlers;
pub mod metrics;
pub mod registry;
pub mod router;
pub mod sweeper;
pub mod ws;

use axum::{Router, routing::get};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::{MakeSpan, TraceLayer};
use tracing::info;
use uuid::Uuid;

pub use config::{LivenessConfig, RelayConfig};
pub use metrics::RelayMetrics;
pub use router::{Relay, SweepReport};

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<Relay>,
    pub config: Arc<RelayConfig>,
}

impl AppState {
    pub fn new(config: RelayConfig) -> Self {
        let metrics = Arc::new(RelayMetrics::new());
        Self {
            relay: Arc::new(Relay::new(config.history_capacity, metrics)),
            config: Arc::new(config),
        }
    }
}

/// Build the HTTP router: `/ws` plus health and metrics endpoints.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(handlers::websocket_handler))
        .route("/health", get(handlers::health_handler))
        .route("/health/live", get(handlers::health_live_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .with_state(state)
}

/// Serve the relay on an already-bound listener until `shutdown` resolves.
///
/// The sweeper runs for the lifetime of the server.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let cancel = CancellationToken::new();
    let sweeper = sweeper::spawn_sweeper(
        state.relay.clone(),
        state.config.liveness.clone(),
        cancel.clone(),
    );

    if let Ok(addr) = listener.local_addr() {
        info!("Relay listening on ws://{}/ws", addr);
    }
    let result = axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await;

    cancel.cancel();
    let _ = sweeper.await;
    result
}
