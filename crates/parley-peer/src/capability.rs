//! Peer-connection capability.
//!
//! The real media stack (encoding, DTLS/SRTP, NAT traversal) sits behind these traits so the
//! negotiation logic can run against a browser bridge, a native stack or the in-memory
//! [`crate::mock`] implementation. Everything the capability observes asynchronously is pushed
//! into a [`PeerEventSink`] instead of registered callbacks.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parley_proto::{IceCandidate, SessionDescription};
use tokio::sync::mpsc;

use crate::error::CapabilityError;
use crate::media::{MediaTrack, TrackKind};

/// Identifies one capability instance within a session. Bumped on every teardown.
pub type Generation = u64;

pub type PeerEvents = mpsc::UnboundedReceiver<(Generation, PeerEvent)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// States that end the call.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelPayload {
    Text(String),
    Binary(Bytes),
}

impl ChannelPayload {
    pub fn len(&self) -> usize {
        match self {
            ChannelPayload::Text(text) => text.len(),
            ChannelPayload::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_bytes(self) -> Bytes {
        match self {
            ChannelPayload::Text(text) => Bytes::from(text),
            ChannelPayload::Binary(bytes) => bytes,
        }
    }
}

pub enum PeerEvent {
    /// A local candidate; `None` marks the end of gathering.
    IceCandidate(Option<IceCandidate>),
    Track(Arc<MediaTrack>),
    ConnectionState(ConnectionState),
    /// A channel opened by the remote side.
    DataChannel(Arc<dyn DataChannel>),
    ChannelMessage {
        label: String,
        payload: ChannelPayload,
    },
    LocalTrackEnded {
        track_id: String,
    },
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEvent::IceCandidate(candidate) => {
                f.debug_tuple("IceCandidate").field(candidate).finish()
            }
            PeerEvent::Track(track) => f.debug_tuple("Track").field(&track.id()).finish(),
            PeerEvent::ConnectionState(state) => {
                f.debug_tuple("ConnectionState").field(state).finish()
            }
            PeerEvent::DataChannel(channel) => {
                f.debug_tuple("DataChannel").field(&channel.label()).finish()
            }
            PeerEvent::ChannelMessage { label, payload } => f
                .debug_struct("ChannelMessage")
                .field("label", label)
                .field("len", &payload.len())
                .finish(),
            PeerEvent::LocalTrackEnded { track_id } => f
                .debug_struct("LocalTrackEnded")
                .field("track_id", track_id)
                .finish(),
        }
    }
}

/// Where a capability reports events. Every event carries the generation it was created for.
#[derive(Clone, Debug)]
pub struct PeerEventSink {
    generation: Generation,
    tx: mpsc::UnboundedSender<(Generation, PeerEvent)>,
}

impl PeerEventSink {
    pub fn new(generation: Generation, tx: mpsc::UnboundedSender<(Generation, PeerEvent)>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Returns false once nobody is listening.
    pub fn emit(&self, event: PeerEvent) -> bool {
        self.tx.send((self.generation, event)).is_ok()
    }
}

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    fn is_open(&self) -> bool;

    /// Resolves once the channel has accepted the payload.
    async fn send(&self, payload: ChannelPayload) -> Result<(), CapabilityError>;

    async fn close(&self);
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, CapabilityError>;

    async fn create_answer(&self) -> Result<SessionDescription, CapabilityError>;

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), CapabilityError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), CapabilityError>;

    async fn add_track(&self, track: Arc<MediaTrack>) -> Result<(), CapabilityError>;

    /// Swap the track on the sender currently carrying `kind`, without renegotiating.
    async fn replace_track(
        &self,
        kind: TrackKind,
        track: Arc<MediaTrack>,
    ) -> Result<(), CapabilityError>;

    async fn create_data_channel(&self, label: &str)
        -> Result<Arc<dyn DataChannel>, CapabilityError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CapabilityError>;

    async fn close(&self);
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, CapabilityError>;
}

#[async_trait]
pub trait ScreenCapture: Send + Sync {
    async fn capture(&self) -> Result<Arc<MediaTrack>, CapabilityError>;
}
