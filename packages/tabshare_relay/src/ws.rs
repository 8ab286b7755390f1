//! WebSocket Handler
//!
//! One task pair per connection: a writer draining the connection's outbound
//! queue and a reader decoding inbound frames into the router.

use axum::extract::ws::{Message, WebSocket};
use futures::{sink::SinkExt, stream::StreamExt};
use std::sync::Arc;
use tabshare_protocol::{ServerMessage, decode_client, encode};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::router::Relay;

/// Handle a relay WebSocket connection until either side closes.
pub async fn handle_relay_ws(socket: WebSocket, relay: Arc<Relay>, outbound_queue: usize) {
    let metrics = relay.metrics().clone();
    metrics.connection_opened();

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // The registry holds the only sender; dropping it (disconnect or
    // eviction) ends the writer task.
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(outbound_queue);
    let connection_id = relay.connect(tx).await;

    let sender_conn_id = connection_id.clone();
    let mut sender_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match encode(&msg) {
                Ok(t) => t,
                Err(e) => {
                    error!("Failed to serialize message: {}", e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                debug!(conn_id = %sender_conn_id, "socket closed while sending");
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let input_relay = relay.clone();
    let input_conn_id = connection_id.clone();
    let input_metrics = metrics.clone();
    let mut input_task = tokio::spawn(async move {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => match decode_client(text.as_str()) {
                    Ok(client_msg) => input_relay.dispatch(&input_conn_id, client_msg).await,
                    Err(e) => {
                        input_metrics.malformed_message();
                        warn!(conn_id = %input_conn_id, "ignoring malformed envelope: {}", e);
                    }
                },
                Ok(Message::Binary(_)) => {
                    input_metrics.malformed_message();
                    debug!(conn_id = %input_conn_id, "binary frames not supported");
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!(conn_id = %input_conn_id, "websocket receive error: {}", e);
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut sender_task => input_task.abort(),
        _ = &mut input_task => sender_task.abort(),
    }

    relay.disconnect(&connection_id).await;
    metrics.connection_closed();
    info!(conn_id = %connection_id, "WebSocket connection closed");
}
