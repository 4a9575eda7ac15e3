//! Signaling wire types
//!
//! Payload shapes are shared with the kiosk side and must stay bit-exact:
//! camelCase keys, descriptions as `{type, sdp}`, candidates in the browser
//! `RTCIceCandidateInit` JSON form.

use serde::{Deserialize, Serialize};
use typeshare::typeshare;

/// Event names used on the signaling channel
pub mod event {
    pub const JOIN_SESSION: &str = "join-session";
    pub const SESSION_JOINED: &str = "session-joined";
    pub const COUNTER_JOINED: &str = "counter-joined";
    pub const OFFER: &str = "offer";
    pub const ANSWER: &str = "answer";
    pub const ICE_CANDIDATE: &str = "ice-candidate";
    pub const SESSION_ERROR: &str = "session-error";
}

/// Opaque endpoint identifier assigned by the signaling channel
#[typeshare]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// SDP type
#[typeshare]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// Session description as exchanged on the wire
#[typeshare]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate
#[typeshare]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate string
    pub candidate: String,
    /// SDP mid (media ID)
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    /// SDP mline index
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    /// Username fragment
    #[serde(rename = "usernameFragment", default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    pub fn with_mid(mut self, mid: impl Into<String>, index: u16) -> Self {
        self.sdp_mid = Some(mid.into());
        self.sdp_mline_index = Some(index);
        self
    }
}

/// STUN/TURN server handed to the peer connection
#[typeshare]
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URLs, multiple entries allow UDP/TCP fallback
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

impl IceServer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            ..Default::default()
        }
    }

    pub fn with_credentials(
        urls: Vec<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls,
            username: username.into(),
            credential: credential.into(),
        }
    }
}

/// `join-session` request
#[typeshare]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinSession {
    pub session_key: String,
    pub counter_id: PeerId,
}

/// `session-joined` notification delivered to the counter
#[typeshare]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionJoined {
    #[serde(alias = "remoteId")]
    pub kiosk_id: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
}

/// `counter-joined` notification delivered to the kiosk
#[typeshare]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterJoined {
    pub counter_id: PeerId,
    pub session_key: String,
}

/// `offer` relay payload
#[typeshare]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferPayload {
    pub to: PeerId,
    pub from: PeerId,
    pub offer: SessionDescription,
}

/// `answer` relay payload
#[typeshare]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerPayload {
    pub to: PeerId,
    pub from: PeerId,
    pub answer: SessionDescription,
}

/// `ice-candidate` relay payload
#[typeshare]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidatePayload {
    pub to: PeerId,
    pub from: PeerId,
    pub candidate: IceCandidate,
}

/// `session-error` payload
#[typeshare]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionErrorPayload {
    pub message: String,
}

/// Typed view of the events a counter session consumes
#[derive(Debug, Clone, PartialEq)]
pub enum InboundSignal {
    SessionJoined(SessionJoined),
    Answer(AnswerPayload),
    IceCandidate(IceCandidatePayload),
    SessionError(SessionErrorPayload),
}

impl InboundSignal {
    /// Events a counter subscribes to
    pub const EVENTS: [&'static str; 4] = [
        event::SESSION_JOINED,
        event::ANSWER,
        event::ICE_CANDIDATE,
        event::SESSION_ERROR,
    ];

    /// Decode a raw payload received under `event`
    pub fn decode(event: &str, payload: serde_json::Value) -> Result<Option<Self>, serde_json::Error> {
        let signal = match event {
            event::SESSION_JOINED => Self::SessionJoined(serde_json::from_value(payload)?),
            event::ANSWER => Self::Answer(serde_json::from_value(payload)?),
            event::ICE_CANDIDATE => Self::IceCandidate(serde_json::from_value(payload)?),
            event::SESSION_ERROR => Self::SessionError(serde_json::from_value(payload)?),
            _ => return Ok(None),
        };
        Ok(Some(signal))
    }
}

/// Typed view of the events a counter session emits
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundSignal {
    JoinSession(JoinSession),
    Offer(OfferPayload),
    IceCandidate(IceCandidatePayload),
}

impl OutboundSignal {
    pub fn event_name(&self) -> &'static str {
        match self {
            OutboundSignal::JoinSession(_) => event::JOIN_SESSION,
            OutboundSignal::Offer(_) => event::OFFER,
            OutboundSignal::IceCandidate(_) => event::ICE_CANDIDATE,
        }
    }

    pub fn to_payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            OutboundSignal::JoinSession(p) => serde_json::to_value(p),
            OutboundSignal::Offer(p) => serde_json::to_value(p),
            OutboundSignal::IceCandidate(p) => serde_json::to_value(p),
        }
    }
}
