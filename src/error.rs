use thiserror::Error;

use crate::negotiation::ConnectionState;

/// Negotiation error taxonomy
///
/// Every failure coming out of the peer-connection capability or the
/// signaling channel is converted into one of these at the call site.
#[derive(Error, Debug)]
pub enum NegotiationError {
    #[error("Not ready: {0}")]
    NotReady(String),

    #[error("Invalid transition: {event} while {state}")]
    InvalidTransition {
        event: &'static str,
        state: ConnectionState,
    },

    #[error("Candidate application failed: {0}")]
    CandidateApplicationFailed(String),

    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("Data channel is not open")]
    ChannelNotOpen,

    #[error("Session error: {0}")]
    SessionError(String),

    #[error("Peer connection error: {0}")]
    Peer(String),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Malformed payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Session closed")]
    SessionClosed,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Limit reached: {0}")]
    LimitReached(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl NegotiationError {
    /// Stable identifier used in diagnostic entries
    pub fn kind(&self) -> &'static str {
        match self {
            NegotiationError::NotReady(_) => "not_ready",
            NegotiationError::InvalidTransition { .. } => "invalid_transition",
            NegotiationError::CandidateApplicationFailed(_) => "candidate_application_failed",
            NegotiationError::NegotiationFailed(_) => "negotiation_failed",
            NegotiationError::ChannelNotOpen => "channel_not_open",
            NegotiationError::SessionError(_) => "session_error",
            NegotiationError::Peer(_) => "peer",
            NegotiationError::Signaling(_) => "signaling",
            NegotiationError::Payload(_) => "payload",
            NegotiationError::SessionClosed => "session_closed",
            NegotiationError::NotFound(_) => "not_found",
            NegotiationError::LimitReached(_) => "limit_reached",
            NegotiationError::Config(_) => "config",
            NegotiationError::Io(_) => "io",
        }
    }
}

/// Result type alias for negotiation operations
pub type Result<T> = std::result::Result<T, NegotiationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_transition_message() {
        let err = NegotiationError::InvalidTransition {
            event: "answer",
            state: ConnectionState::New,
        };
        assert_eq!(err.to_string(), "Invalid transition: answer while new");
        assert_eq!(err.kind(), "invalid_transition");
    }

    #[test]
    fn test_payload_error_conversion() {
        let parse = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: NegotiationError = parse.into();
        assert_eq!(err.kind(), "payload");
    }
}
