use axum::{
    Json,
    extract::{State, WebSocketUpgrade},
    response::{IntoResponse, Response},
};

use crate::AppState;
use crate::metrics::HealthStatus;
use crate::ws::handle_relay_ws;

/// Relay WebSocket endpoint
pub async fn websocket_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let relay = state.relay.clone();
    let outbound_queue = state.config.outbound_queue;
    ws.on_upgrade(move |socket| handle_relay_ws(socket, relay, outbound_queue))
}

/// Health check endpoint - returns relay status
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(health_status(&state).await)
}

/// Send failures are reported as a count only: fan-out to a closing socket
/// fails routinely and does not make the relay unhealthy.
async fn health_status(state: &AppState) -> HealthStatus {
    let metrics = state.relay.metrics().snapshot();
    HealthStatus {
        status: "healthy".to_string(),
        connections: metrics.connections.active,
        groups: state.relay.group_count().await,
        send_failures: metrics.messages.send_failures,
        uptime_secs: metrics.uptime_secs,
    }
}

/// Metrics endpoint - returns detailed relay metrics
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.relay.metrics().snapshot())
}

/// Liveness check - returns 200 if the relay is running
pub async fn health_live_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "alive" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RelayConfig;

    #[tokio::test]
    async fn test_health_stays_healthy_after_send_failures() {
        let state = AppState::new(RelayConfig::default());
        state.relay.metrics().send_failed();
        state.relay.metrics().send_failed();

        let health = health_status(&state).await;
        assert_eq!(health.status, "healthy");
        assert_eq!(health.send_failures, 2);
        assert_eq!(health.connections, 0);
        assert_eq!(health.groups, 0);
    }
}
