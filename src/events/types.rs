//! Diagnostic event types
//!
//! Defines every event a negotiation session can publish on the bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::negotiation::ConnectionState;
use crate::peer::ConnectivityState;
use crate::signaling::PeerId;

/// Diagnostic event
///
/// Serialized as `{"kind": "...", "payload": {...}}` so that log viewers can
/// filter on `kind` without knowing every payload shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum DiagnosticEvent {
    // ============================================================================
    // Session Events
    // ============================================================================
    /// Local identifier obtained from the signaling channel
    #[serde(rename = "session.local_id")]
    LocalId { local_id: PeerId },

    /// `join-session` emitted
    #[serde(rename = "session.join_requested")]
    JoinRequested { session_key: String },

    /// Remote endpoint joined
    #[serde(rename = "session.joined")]
    Joined { remote_id: PeerId },

    /// Connection state transition
    #[serde(rename = "session.state_changed")]
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },

    // ============================================================================
    // Signaling Events
    // ============================================================================
    #[serde(rename = "signaling.offer_sent")]
    OfferSent { to: PeerId, restart: bool },

    #[serde(rename = "signaling.answer_received")]
    AnswerReceived { from: PeerId },

    /// `session-error` reported by the relay
    #[serde(rename = "signaling.session_error")]
    SessionError { message: String },

    // ============================================================================
    // ICE Events
    // ============================================================================
    /// Remote candidate received, either applied or buffered
    #[serde(rename = "ice.candidate_received")]
    CandidateReceived { buffered: bool },

    /// Local candidate relayed to the remote endpoint
    #[serde(rename = "ice.candidate_sent")]
    CandidateSent { to: PeerId },

    /// Buffered candidates applied after the remote description
    #[serde(rename = "ice.buffer_drained")]
    BufferDrained { applied: usize, discarded: usize },

    #[serde(rename = "ice.connectivity_changed")]
    ConnectivityChanged { state: ConnectivityState },

    #[serde(rename = "ice.restart")]
    IceRestart { attempt: u32 },

    // ============================================================================
    // Data Channel Events
    // ============================================================================
    #[serde(rename = "channel.opened")]
    ChannelOpened { label: String },

    #[serde(rename = "channel.message")]
    MessageReceived { text: String },

    #[serde(rename = "channel.message_sent")]
    MessageSent { text: String },

    #[serde(rename = "channel.closed")]
    ChannelClosed { label: String },

    // ============================================================================
    // Errors
    // ============================================================================
    /// Any `NegotiationError` surfaced by the session
    #[serde(rename = "error")]
    Error { kind: String, message: String },
}

impl DiagnosticEvent {
    /// Get the event name (for filtering/routing)
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::LocalId { .. } => "session.local_id",
            Self::JoinRequested { .. } => "session.join_requested",
            Self::Joined { .. } => "session.joined",
            Self::StateChanged { .. } => "session.state_changed",
            Self::OfferSent { .. } => "signaling.offer_sent",
            Self::AnswerReceived { .. } => "signaling.answer_received",
            Self::SessionError { .. } => "signaling.session_error",
            Self::CandidateReceived { .. } => "ice.candidate_received",
            Self::CandidateSent { .. } => "ice.candidate_sent",
            Self::BufferDrained { .. } => "ice.buffer_drained",
            Self::ConnectivityChanged { .. } => "ice.connectivity_changed",
            Self::IceRestart { .. } => "ice.restart",
            Self::ChannelOpened { .. } => "channel.opened",
            Self::MessageReceived { .. } => "channel.message",
            Self::MessageSent { .. } => "channel.message_sent",
            Self::ChannelClosed { .. } => "channel.closed",
            Self::Error { .. } => "error",
        }
    }

    /// Check if event name matches a topic pattern
    ///
    /// Supports wildcards:
    /// - `*` matches all events
    /// - `ice.*` matches all ICE events
    /// - `session.state_changed` matches exact event
    pub fn matches_topic(&self, topic: &str) -> bool {
        if topic == "*" {
            return true;
        }

        let event_name = self.event_name();

        if let Some(prefix) = topic.strip_suffix(".*") {
            event_name
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('.'))
        } else {
            event_name == topic
        }
    }
}

/// Diagnostic event stamped with its session and time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticEntry {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: DiagnosticEvent,
}

impl DiagnosticEntry {
    pub fn new(session_id: impl Into<String>, event: DiagnosticEvent) -> Self {
        Self {
            session_id: session_id.into(),
            timestamp: Utc::now(),
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_name() {
        let event = DiagnosticEvent::StateChanged {
            from: ConnectionState::New,
            to: ConnectionState::Negotiating,
        };
        assert_eq!(event.event_name(), "session.state_changed");

        let event = DiagnosticEvent::BufferDrained {
            applied: 2,
            discarded: 0,
        };
        assert_eq!(event.event_name(), "ice.buffer_drained");
    }

    #[test]
    fn test_matches_topic() {
        let event = DiagnosticEvent::CandidateReceived { buffered: true };

        assert!(event.matches_topic("*"));
        assert!(event.matches_topic("ice.*"));
        assert!(event.matches_topic("ice.candidate_received"));
        assert!(!event.matches_topic("session.*"));
        assert!(!event.matches_topic("ice.candidate_sent"));
        assert!(!event.matches_topic("ic.*"));
    }

    #[test]
    fn test_serialization() {
        let entry = DiagnosticEntry::new(
            "s1",
            DiagnosticEvent::OfferSent {
                to: PeerId::new("K1"),
                restart: false,
            },
        );

        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["session_id"], "s1");
        assert_eq!(value["kind"], "signaling.offer_sent");
        assert_eq!(value["payload"]["to"], "K1");

        let deserialized: DiagnosticEntry = serde_json::from_value(value).unwrap();
        assert_eq!(deserialized, entry);
    }
}
