use metrics::{counter, gauge};
use parley_proto::{ClientMessage, ConnectionId, Envelope, ServerMessage, SignalKind};
use tracing::{debug, info, warn};

use crate::error::RelayError;
use crate::registry::{Outbound, Registry};

/// Validates client messages and routes signaling envelopes between endpoints.
#[derive(Clone)]
pub struct Relay {
    registry: Registry,
}

impl Relay {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn connect(&self, outbound: Outbound) -> ConnectionId {
        let id = self.registry.register(outbound);
        counter!("parley_relay_connections_total").increment(1);
        gauge!("parley_relay_connections_active").set(self.registry.len() as f64);
        id
    }

    pub fn disconnect(&self, id: ConnectionId) {
        if self.registry.unregister(id) {
            gauge!("parley_relay_connections_active").set(self.registry.len() as f64);
        }
    }

    /// Handle one text frame. Unparseable frames are logged and dropped; rejected
    /// messages are answered with a typed error sent to the originator only.
    pub fn handle_text(&self, id: ConnectionId, text: &str) {
        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => message,
            Err(err) => {
                warn!(connection_id = id, error = %err, "dropping unparseable frame");
                counter!("parley_relay_frames_dropped_total").increment(1);
                return;
            }
        };

        if let Err(err) = self.dispatch(id, message) {
            warn!(connection_id = id, error = %err, "rejecting client message");
            counter!(
                "parley_relay_envelopes_rejected_total",
                "code" => error_label(&err)
            )
            .increment(1);
            self.registry.send_to(id, err.to_reply());
        }
    }

    pub fn dispatch(&self, id: ConnectionId, message: ClientMessage) -> Result<(), RelayError> {
        match message {
            ClientMessage::SetUsername { username } => {
                let proposed = username
                    .ok_or(RelayError::MalformedEnvelope("set-username requires `username`"))?;
                self.registry.set_username(id, &proposed)?;
                counter!("parley_relay_usernames_assigned_total").increment(1);
                Ok(())
            }
            ClientMessage::Offer(envelope) => self.forward(id, SignalKind::Offer, envelope),
            ClientMessage::Answer(envelope) => self.forward(id, SignalKind::Answer, envelope),
            ClientMessage::NewIceCandidate(envelope) => {
                self.forward(id, SignalKind::NewIceCandidate, envelope)
            }
            ClientMessage::Metadata(envelope) => {
                let target = envelope
                    .to
                    .clone()
                    .ok_or(RelayError::MalformedEnvelope("metadata requires `to`"))?;
                if envelope.metadata.is_none() {
                    return Err(RelayError::MalformedEnvelope("metadata requires `metadata`"));
                }
                let from = self.registry.deliver(id, &target, |from| {
                    ServerMessage::Metadata(envelope.stamped(from))
                })?;
                self.record_relayed(SignalKind::Metadata, &from, &target);
                Ok(())
            }
        }
    }

    fn forward(
        &self,
        id: ConnectionId,
        kind: SignalKind,
        envelope: Envelope,
    ) -> Result<(), RelayError> {
        let target = envelope
            .to
            .clone()
            .ok_or(RelayError::MalformedEnvelope("envelope requires `to`"))?;
        if envelope.payload.is_none() {
            return Err(RelayError::MalformedEnvelope("envelope requires `payload`"));
        }

        let from = self.registry.deliver(id, &target, |from| {
            let stamped = envelope.stamped(from);
            match kind {
                SignalKind::Offer => ServerMessage::Offer(stamped),
                SignalKind::Answer => ServerMessage::Answer(stamped),
                _ => ServerMessage::NewIceCandidate(stamped),
            }
        })?;
        self.record_relayed(kind, &from, &target);
        Ok(())
    }

    fn record_relayed(&self, kind: SignalKind, from: &str, to: &str) {
        counter!(
            "parley_relay_envelopes_relayed_total",
            "kind" => kind.as_str()
        )
        .increment(1);
        if kind == SignalKind::NewIceCandidate {
            debug!(%kind, from, to, "relayed envelope");
        } else {
            info!(%kind, from, to, "relayed envelope");
        }
    }
}

fn error_label(err: &RelayError) -> &'static str {
    match err {
        RelayError::MalformedEnvelope(_) => "malformed-envelope",
        RelayError::InvalidUsername => "invalid-username",
        RelayError::TargetUnavailable(_) => "target-unavailable",
    }
}
