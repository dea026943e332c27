//! One instance's WebSocket connection.
//!
//! Inbound frames are handled in order on the connection's own task. Outbound frames go
//! through a bounded queue drained by a writer task, so forwarding a request never waits
//! on another connection's socket.

use crate::protocol::{InstanceMessage, RelayMessage};
use crate::relay::Relay;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

const OUTBOUND_QUEUE_SIZE: usize = 64;

/// Serves an upgraded instance connection until either side closes it.
pub async fn serve_instance(socket: WebSocket, relay: Relay) {
    let (mut write, mut read) = socket.split();
    let (tx, mut rx) = mpsc::channel::<RelayMessage>(OUTBOUND_QUEUE_SIZE);
    let handle = relay.registry().connect(tx);
    let connection = handle.id();
    tracing::debug!(connection, "Instance connected");

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!(connection, error = %e, "Failed to encode message");
                    continue;
                }
            };
            if let Err(e) = write.send(Message::Text(text.into())).await {
                tracing::debug!(connection, error = %e, "Instance socket closed while writing");
                break;
            }
        }
        let _ = write.close().await;
    });

    while let Some(frame) = read.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            // Pings are answered by the socket itself
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(connection, error = %e, "Instance socket error");
                break;
            }
        };

        match serde_json::from_str::<InstanceMessage>(text.as_str()) {
            Ok(InstanceMessage::Register(registration)) => {
                // Refusals are logged and counted by the relay; the instance may retry
                let _ = relay.register(registration, &handle).await;
            }
            Ok(InstanceMessage::Reply { request_id, body }) => {
                relay.handle_reply(&request_id, body);
            }
            Err(e) => {
                tracing::warn!(connection, error = %e, "Ignoring malformed instance message");
            }
        }
    }

    relay.disconnect(&handle);
    // Requests still holding a handle would otherwise keep the writer alive
    writer.abort();
}
