use futures_util::{SinkExt, StreamExt};
use parley_proto::{ClientMessage, ServerMessage};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use crate::error::SignalingClosed;

/// Outbound half of a relay connection.
pub trait SignalingSink: Send + Sync {
    fn send(&self, message: ClientMessage) -> Result<(), SignalingClosed>;
}

impl SignalingSink for mpsc::UnboundedSender<ClientMessage> {
    fn send(&self, message: ClientMessage) -> Result<(), SignalingClosed> {
        mpsc::UnboundedSender::send(self, message).map_err(|_| SignalingClosed)
    }
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("failed to connect to relay: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
}

/// WebSocket connection to a relay. Frames are pumped by two background tasks; callers only
/// see typed messages.
pub struct SignalingClient {
    outbound: mpsc::UnboundedSender<ClientMessage>,
    inbound: mpsc::UnboundedReceiver<ServerMessage>,
}

impl SignalingClient {
    pub async fn connect(url: &str) -> Result<Self, SignalingError> {
        debug!(url, "connecting to relay");
        let (stream, _) = connect_async(url).await?;
        let (mut write, mut read) = stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel::<ServerMessage>();

        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(error = %err, "failed to encode client message");
                        continue;
                    }
                };
                if let Err(err) = write.send(Message::Text(text.into())).await {
                    warn!(error = %err, "relay write failed");
                    break;
                }
            }
            let _ = write.send(Message::Close(None)).await;
        });

        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<ServerMessage>(text.as_str()) {
                            Ok(message) => {
                                if inbound_tx.send(message).is_err() {
                                    break;
                                }
                            }
                            Err(err) => warn!(error = %err, "dropping unparseable relay frame"),
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, "relay read failed");
                        break;
                    }
                }
            }
            debug!("relay connection closed");
        });

        Ok(Self { outbound, inbound })
    }

    /// Split into the outbound queue and the inbound stream. The pump tasks keep running until
    /// both ends are dropped or the relay goes away.
    pub fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedSender<ClientMessage>,
        mpsc::UnboundedReceiver<ServerMessage>,
    ) {
        (self.outbound, self.inbound)
    }
}
