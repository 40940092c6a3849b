use parley_proto::{ErrorCode, ServerMessage};
use thiserror::Error;

/// Problems with a message an endpoint submitted. None of these are fatal to the relay;
/// each is reported back to the originating connection only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(&'static str),
    #[error("username must contain at least one non-whitespace character")]
    InvalidUsername,
    #[error("target {0} is not connected")]
    TargetUnavailable(String),
}

impl RelayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RelayError::MalformedEnvelope(_) => ErrorCode::MalformedEnvelope,
            RelayError::InvalidUsername => ErrorCode::InvalidUsername,
            RelayError::TargetUnavailable(_) => ErrorCode::TargetUnavailable,
        }
    }

    /// Typed reply envelope sent back to the originator.
    pub fn to_reply(&self) -> ServerMessage {
        let target = match self {
            RelayError::TargetUnavailable(target) => Some(target.clone()),
            _ => None,
        };
        ServerMessage::Error {
            code: self.code(),
            message: self.to_string(),
            target,
        }
    }
}
