//! Peer-connection capability
//!
//! The negotiation core consumes these traits and never touches the
//! underlying WebRTC stack directly:
//! - `PeerFactory` creates one `PeerHandle` per negotiation
//! - `PeerHandle` exposes description/candidate operations
//! - callbacks (local candidates, connectivity, data channel) are pushed
//!   into a `PeerEventSink` instead of being invoked re-entrantly
//!
//! Implementations:
//! - `rtc::RtcPeerFactory` backed by the `webrtc` crate (production)
//! - `mock::MockPeerFactory` (testing)

pub mod mock;
pub mod rtc;

pub use mock::{MockPeerControl, MockPeerFactory, PeerCall};
pub use rtc::RtcPeerFactory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::signaling::{IceCandidate, IceServer, SessionDescription};

/// Configuration for a new peer connection
#[derive(Debug, Clone, Default)]
pub struct PeerConfig {
    pub ice_servers: Vec<IceServer>,
}

/// ICE connectivity state as reported by the capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl std::fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectivityState::New => write!(f, "new"),
            ConnectivityState::Checking => write!(f, "checking"),
            ConnectivityState::Connected => write!(f, "connected"),
            ConnectivityState::Completed => write!(f, "completed"),
            ConnectivityState::Disconnected => write!(f, "disconnected"),
            ConnectivityState::Failed => write!(f, "failed"),
            ConnectivityState::Closed => write!(f, "closed"),
        }
    }
}

/// Callback raised by a peer connection or its data channel
#[derive(Clone)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    Connectivity(ConnectivityState),
    ChannelOpened,
    ChannelMessage(String),
    ChannelClosed,
    /// Channel created by the remote side (responder role)
    RemoteChannel(Arc<dyn DataChannel>),
}

impl std::fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerEvent::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            PeerEvent::Connectivity(s) => f.debug_tuple("Connectivity").field(s).finish(),
            PeerEvent::ChannelOpened => write!(f, "ChannelOpened"),
            PeerEvent::ChannelMessage(m) => f.debug_tuple("ChannelMessage").field(m).finish(),
            PeerEvent::ChannelClosed => write!(f, "ChannelClosed"),
            PeerEvent::RemoteChannel(dc) => {
                f.debug_tuple("RemoteChannel").field(&dc.label()).finish()
            }
        }
    }
}

/// Peer event tagged with the generation of the handle that raised it
#[derive(Debug, Clone)]
pub struct TaggedPeerEvent {
    pub generation: u64,
    pub event: PeerEvent,
}

/// Where a peer connection delivers its callbacks
///
/// Every handle gets its own generation so that callbacks still in flight
/// from a replaced or closed handle can be told apart.
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<TaggedPeerEvent>,
}

impl PeerEventSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<TaggedPeerEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns false once the receiving session is gone
    pub fn emit(&self, event: PeerEvent) -> bool {
        self.tx
            .send(TaggedPeerEvent {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// Text data channel
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    async fn send_text(&self, text: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// One live peer connection
#[async_trait]
pub trait PeerHandle: Send + Sync {
    /// Create a data channel, its events go to the handle's sink
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>>;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Best-effort path renegotiation
    ///
    /// Returns a fresh local offer when the restart has to be signaled to
    /// the remote side.
    async fn restart_ice(&self) -> Result<Option<SessionDescription>>;

    async fn close(&self) -> Result<()>;
}

/// Creates peer connections
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(&self, config: PeerConfig, sink: PeerEventSink) -> Result<Arc<dyn PeerHandle>>;
}
