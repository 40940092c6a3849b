//! Endpoint side of Parley: call negotiation, local media, chunked file transfer and the
//! relay connection, on top of a pluggable peer-connection capability.

pub mod capability;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod media;
pub mod mock;
pub mod session;
pub mod signaling;
pub mod transfer;

pub use capability::{
    ChannelPayload, ConnectionState, DataChannel, Generation, PeerConnection,
    PeerConnectionFactory, PeerEvent, PeerEventSink, PeerEvents, ScreenCapture,
};
pub use config::PeerConfig;
pub use endpoint::{Endpoint, EndpointEvent, OutgoingFile};
pub use error::{CapabilityError, SessionError, SignalingClosed, TransferError};
pub use media::{LocalTracks, MediaTrack, TrackKind, TrackSwap};
pub use session::{NegotiationSession, SessionNotice, SignalingState};
pub use signaling::{SignalingClient, SignalingError, SignalingSink};
pub use transfer::{
    AnnounceOutcome, ChunkOutcome, FileReceiver, FileSender, ReceivedFile, SendOutcome,
};
