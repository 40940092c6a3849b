//! Shared protocol definitions for endpoint ↔ relay communication.
//! Keeping these in a dedicated crate lets the relay and the endpoint
//! runtime agree on the JSON shapes without depending on each other.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Relay-assigned connection identifier.
pub type ConnectionId = u64;

/// Kinds of envelope the relay forwards between endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    NewIceCandidate,
    Metadata,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::NewIceCandidate => "new-ice-candidate",
            SignalKind::Metadata => "metadata",
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Messages sent from an endpoint to the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Propose a display name
    SetUsername {
        #[serde(default)]
        username: Option<String>,
    },
    Offer(Envelope),
    Answer(Envelope),
    NewIceCandidate(Envelope),
    /// Out-of-band announcement of a file about to arrive on the file channel
    #[serde(alias = "metadata-file")]
    Metadata(MetadataEnvelope),
}

impl ClientMessage {
    pub fn set_username(username: impl Into<String>) -> Self {
        ClientMessage::SetUsername {
            username: Some(username.into()),
        }
    }

    pub fn signal(kind: SignalKind, to: impl Into<String>, payload: Value) -> Self {
        let envelope = Envelope::new(to, payload);
        match kind {
            SignalKind::Offer => ClientMessage::Offer(envelope),
            SignalKind::Answer => ClientMessage::Answer(envelope),
            SignalKind::NewIceCandidate => ClientMessage::NewIceCandidate(envelope),
            SignalKind::Metadata => ClientMessage::Metadata(MetadataEnvelope {
                to: envelope.to,
                from: None,
                metadata: envelope
                    .payload
                    .and_then(|value| serde_json::from_value(value).ok()),
                extra: envelope.extra,
            }),
        }
    }

    pub fn metadata(to: impl Into<String>, metadata: FileMetadata) -> Self {
        ClientMessage::Metadata(MetadataEnvelope {
            to: Some(to.into()),
            from: None,
            metadata: Some(metadata),
            extra: Map::new(),
        })
    }

    /// The routed kind, or `None` for messages the relay handles itself.
    pub fn signal_kind(&self) -> Option<SignalKind> {
        match self {
            ClientMessage::SetUsername { .. } => None,
            ClientMessage::Offer(_) => Some(SignalKind::Offer),
            ClientMessage::Answer(_) => Some(SignalKind::Answer),
            ClientMessage::NewIceCandidate(_) => Some(SignalKind::NewIceCandidate),
            ClientMessage::Metadata(_) => Some(SignalKind::Metadata),
        }
    }
}

/// Messages sent from the relay to an endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Identifier assigned on connect
    Id { id: ConnectionId },
    UsernameAccepted { username: String },
    /// Full roster of open endpoints; clients filter themselves out
    UserList { users: Vec<String> },
    Offer(Envelope),
    Answer(Envelope),
    NewIceCandidate(Envelope),
    #[serde(alias = "metadata-file")]
    Metadata(MetadataEnvelope),
    /// Rejection of a message the sender submitted
    Error {
        code: ErrorCode,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    MalformedEnvelope,
    InvalidUsername,
    TargetUnavailable,
}

/// Routed negotiation envelope (offer, answer, ICE candidate).
///
/// `from` is stamped by the relay; anything a client puts there is overwritten. Fields the
/// relay does not know about are carried through untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(
        default,
        deserialize_with = "peer_ref",
        skip_serializing_if = "Option::is_none"
    )]
    pub to: Option<String>,
    #[serde(
        default,
        deserialize_with = "peer_ref",
        skip_serializing_if = "Option::is_none"
    )]
    pub from: Option<String>,
    #[serde(default, alias = "data", skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Envelope {
    pub fn new(to: impl Into<String>, payload: Value) -> Self {
        Self {
            to: Some(to.into()),
            from: None,
            payload: Some(payload),
            extra: Map::new(),
        }
    }

    pub fn stamped(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    /// Decode the opaque payload into a concrete shape.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Option<T> {
        self.payload
            .as_ref()
            .and_then(|value| T::deserialize(value).ok())
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MetadataEnvelope {
    #[serde(
        default,
        deserialize_with = "peer_ref",
        skip_serializing_if = "Option::is_none"
    )]
    pub to: Option<String>,
    #[serde(
        default,
        deserialize_with = "peer_ref",
        skip_serializing_if = "Option::is_none"
    )]
    pub from: Option<String>,
    #[serde(default, alias = "payload", skip_serializing_if = "Option::is_none")]
    pub metadata: Option<FileMetadata>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MetadataEnvelope {
    pub fn stamped(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }
}

/// Description of a file announced ahead of its chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub name: String,
    pub size: u64,
    #[serde(default, alias = "type")]
    pub mime_type: String,
    #[serde(default)]
    pub last_modified: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description in the browser JSON shape (`{type, sdp}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in the browser JSON shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

// Peers address each other by display name or by numeric id; accept either.
fn peer_ref<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(name)) => Ok(Some(name)),
        Some(Value::Number(id)) => Ok(Some(id.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected peer name or id, got {other}"
        ))),
    }
}
