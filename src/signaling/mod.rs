//! Signaling channel boundary
//!
//! The relay between counter and kiosk is an external collaborator. This
//! module fixes its interface (`SignalingChannel`), the wire payloads, and
//! ships an in-process hub used by tests and the loopback demo.

pub mod memory;
pub mod types;

pub use memory::{MemoryHub, MemorySignaling};
pub use types::{
    event, AnswerPayload, CounterJoined, IceCandidate, IceCandidatePayload, IceServer,
    InboundSignal, JoinSession, OfferPayload, OutboundSignal, PeerId, SdpType,
    SessionDescription, SessionErrorPayload, SessionJoined,
};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// Named-event relay between the two endpoints
///
/// Delivery is at-least-once and ordered within one event name at best;
/// consumers must not rely on ordering across names.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Identifier the relay assigned to this endpoint
    async fn local_id(&self) -> Result<PeerId>;

    /// STUN/TURN servers to configure peer connections with
    async fn ice_servers(&self) -> Result<Vec<IceServer>>;

    /// Fire-and-forget send
    fn emit(&self, event: &str, payload: serde_json::Value);

    /// Subscribe to one event name for the lifetime of the channel
    fn on(&self, event: &str) -> mpsc::UnboundedReceiver<serde_json::Value>;
}

/// Encode and emit a typed signal
pub fn emit_signal(channel: &dyn SignalingChannel, signal: &OutboundSignal) -> Result<()> {
    let payload = signal.to_payload()?;
    channel.emit(signal.event_name(), payload);
    Ok(())
}
