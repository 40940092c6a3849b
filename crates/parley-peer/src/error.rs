use parley_proto::SignalKind;
use thiserror::Error;

use crate::media::TrackKind;
use crate::session::SignalingState;

/// Failures reported by a peer-connection capability.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("no sender carries a {0} track")]
    NoSender(TrackKind),
    #[error("data channel closed")]
    ChannelClosed,
    #[error("screen capture failed: {0}")]
    Capture(String),
    #[error("peer connection closed")]
    Closed,
}

/// The outbound signaling queue is gone.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("signaling connection closed")]
pub struct SignalingClosed;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("no active session")]
    NoActiveSession,
    #[error("cannot {operation} while {state}")]
    InvalidSignalingState {
        operation: &'static str,
        state: SignalingState,
    },
    #[error("{kind} from {from} does not belong to the current call")]
    UnexpectedPeer { kind: SignalKind, from: String },
    #[error("no local {0} track")]
    NoLocalTrack(TrackKind),
    #[error("no screen source configured")]
    NoScreenSource,
    #[error("data channel {0} is not open")]
    ChannelNotOpen(String),
    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: SignalKind, reason: String },
    #[error(transparent)]
    Signaling(#[from] SignalingClosed),
    #[error(transparent)]
    Capability(#[from] CapabilityError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("file channel is not open")]
    ChannelNotOpen,
    #[error("{name}: received {received} bytes, announced {size}")]
    SizeExceeded {
        name: String,
        size: u64,
        received: u64,
    },
    #[error("{name}: abandoned after {received} of {size} bytes when another file was announced")]
    Superseded {
        name: String,
        received: u64,
        size: u64,
    },
    #[error("{0} is still being sent")]
    SendInProgress(String),
    #[error("chunk of {0} bytes arrived with no announced transfer")]
    UnexpectedChunk(usize),
    #[error("failed to read file: {0}")]
    Read(String),
    #[error("sender task failed: {0}")]
    Task(String),
    #[error(transparent)]
    Signaling(#[from] SignalingClosed),
    #[error(transparent)]
    Capability(#[from] CapabilityError),
}
