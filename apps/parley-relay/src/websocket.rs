use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use parley_proto::ServerMessage;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::handlers::AppState;
use crate::relay::Relay;

/// WebSocket upgrade handler
pub async fn websocket_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.relay, remote_addr))
}

/// Drive one endpoint connection: a writer task drains the connection's queue while this
/// task reads frames. Faults on either side end only this connection.
async fn handle_socket(socket: WebSocket, relay: Relay, remote_addr: SocketAddr) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let connection_id = relay.connect(tx);
    info!(connection_id, %remote_addr, "websocket connected");

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let json = match serde_json::to_string(&message) {
                Ok(json) => json,
                Err(err) => {
                    error!(connection_id, error = %err, "failed to encode server message");
                    continue;
                }
            };
            if let Err(err) = sender.send(Message::Text(json)).await {
                debug!(connection_id, error = %err, "websocket write failed");
                break;
            }
        }
        let _ = sender.close().await;
        debug!(connection_id, "writer task ended");
    });

    while let Some(frame) = receiver.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                warn!(connection_id, error = %err, "websocket read failed");
                break;
            }
        };

        match frame {
            Message::Text(text) => relay.handle_text(connection_id, &text),
            // Some clients ship JSON in binary frames
            Message::Binary(data) => match std::str::from_utf8(&data) {
                Ok(text) => relay.handle_text(connection_id, text),
                Err(_) => debug!(
                    connection_id,
                    len = data.len(),
                    "ignoring non-UTF-8 binary frame"
                ),
            },
            Message::Close(_) => {
                debug!(connection_id, "received close frame");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    // Unregistering drops the registry's sender, which lets the writer drain and exit.
    relay.disconnect(connection_id);
    if let Err(err) = writer.await {
        if !err.is_cancelled() {
            error!(connection_id, error = %err, "writer task panicked");
        }
    }
    info!(connection_id, %remote_addr, "websocket disconnected");
}
