//! Scriptable peer connection capability
//!
//! Records every call made by the negotiation core and lets the caller
//! inject callbacks (connectivity changes, local candidates, data channel
//! events) as if the WebRTC stack had raised them.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use super::{DataChannel, PeerConfig, PeerEvent, PeerEventSink, PeerFactory, PeerHandle};
use crate::error::{NegotiationError, Result};
use crate::signaling::{IceCandidate, SessionDescription};

/// Operation performed on a mock handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCall {
    CreateDataChannel(String),
    CreateOffer,
    CreateAnswer,
    SetLocalDescription(SessionDescription),
    SetRemoteDescription(SessionDescription),
    AddIceCandidate(IceCandidate),
    RestartIce,
    Close,
}

#[derive(Debug, Clone, Default)]
struct Behavior {
    fail_create: bool,
    fail_offer: bool,
    fail_local_description: bool,
    fail_remote_description: bool,
    rejected_candidates: Vec<String>,
    restart_offer: bool,
    offer_delay: Option<Duration>,
}

#[derive(Default)]
struct FactoryState {
    behavior: Behavior,
    created: Vec<MockPeerControl>,
}

/// Factory producing recording handles
#[derive(Clone, Default)]
pub struct MockPeerFactory {
    state: Arc<Mutex<FactoryState>>,
}

impl MockPeerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    fn configure(self, f: impl FnOnce(&mut Behavior)) -> Self {
        f(&mut self.state.lock().behavior);
        self
    }

    pub fn fail_create(self) -> Self {
        self.configure(|b| b.fail_create = true)
    }

    pub fn fail_offer(self) -> Self {
        self.configure(|b| b.fail_offer = true)
    }

    pub fn fail_local_description(self) -> Self {
        self.configure(|b| b.fail_local_description = true)
    }

    pub fn fail_remote_description(self) -> Self {
        self.configure(|b| b.fail_remote_description = true)
    }

    /// Reject any candidate whose string equals `candidate`
    pub fn reject_candidate(self, candidate: impl Into<String>) -> Self {
        let candidate = candidate.into();
        self.configure(|b| b.rejected_candidates.push(candidate))
    }

    /// Make `restart_ice` produce a fresh offer
    pub fn restart_with_offer(self) -> Self {
        self.configure(|b| b.restart_offer = true)
    }

    /// Hold `create_offer` for `delay` before completing
    pub fn delay_offer(self, delay: Duration) -> Self {
        self.configure(|b| b.offer_delay = Some(delay))
    }

    /// Handles created so far, oldest first
    pub fn handles(&self) -> Vec<MockPeerControl> {
        self.state.lock().created.clone()
    }

    pub fn last(&self) -> Option<MockPeerControl> {
        self.state.lock().created.last().cloned()
    }
}

#[async_trait]
impl PeerFactory for MockPeerFactory {
    async fn create(&self, config: PeerConfig, sink: PeerEventSink) -> Result<Arc<dyn PeerHandle>> {
        let mut state = self.state.lock();
        if state.behavior.fail_create {
            return Err(NegotiationError::Peer("mock create failure".to_string()));
        }
        let control = MockPeerControl {
            config,
            sink,
            calls: Arc::new(Mutex::new(Vec::new())),
            sent: Arc::new(Mutex::new(Vec::new())),
        };
        state.created.push(control.clone());
        Ok(Arc::new(MockPeerHandle {
            behavior: state.behavior.clone(),
            control,
        }))
    }
}

/// Test-side view of one mock handle
#[derive(Clone)]
pub struct MockPeerControl {
    config: PeerConfig,
    sink: PeerEventSink,
    calls: Arc<Mutex<Vec<PeerCall>>>,
    sent: Arc<Mutex<Vec<String>>>,
}

impl MockPeerControl {
    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    pub fn generation(&self) -> u64 {
        self.sink.generation()
    }

    pub fn calls(&self) -> Vec<PeerCall> {
        self.calls.lock().clone()
    }

    /// Candidates applied through `add_ice_candidate`, in call order
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                PeerCall::AddIceCandidate(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, call: impl Fn(&PeerCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| call(c)).count()
    }

    /// Messages written to data channels of this handle
    pub fn sent_messages(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    /// Raise a callback as the WebRTC stack would
    pub fn emit(&self, event: PeerEvent) -> bool {
        self.sink.emit(event)
    }
}

struct MockPeerHandle {
    behavior: Behavior,
    control: MockPeerControl,
}

impl MockPeerHandle {
    fn record(&self, call: PeerCall) {
        self.control.calls.lock().push(call);
    }
}

#[async_trait]
impl PeerHandle for MockPeerHandle {
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>> {
        self.record(PeerCall::CreateDataChannel(label.to_string()));
        Ok(Arc::new(MockDataChannel {
            label: label.to_string(),
            sent: self.control.sent.clone(),
        }))
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        self.record(PeerCall::CreateOffer);
        if let Some(delay) = self.behavior.offer_delay {
            tokio::time::sleep(delay).await;
        }
        if self.behavior.fail_offer {
            return Err(NegotiationError::Peer("mock offer failure".to_string()));
        }
        Ok(SessionDescription::offer(format!(
            "mock-offer-{}",
            self.control.generation()
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.record(PeerCall::CreateAnswer);
        Ok(SessionDescription::answer(format!(
            "mock-answer-{}",
            self.control.generation()
        )))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.record(PeerCall::SetLocalDescription(description));
        if self.behavior.fail_local_description {
            return Err(NegotiationError::Peer(
                "mock local description failure".to_string(),
            ));
        }
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.record(PeerCall::SetRemoteDescription(description));
        if self.behavior.fail_remote_description {
            return Err(NegotiationError::Peer(
                "mock remote description failure".to_string(),
            ));
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let rejected = self
            .behavior
            .rejected_candidates
            .iter()
            .any(|c| *c == candidate.candidate);
        self.record(PeerCall::AddIceCandidate(candidate.clone()));
        if rejected {
            return Err(NegotiationError::CandidateApplicationFailed(format!(
                "mock rejected {}",
                candidate.candidate
            )));
        }
        Ok(())
    }

    async fn restart_ice(&self) -> Result<Option<SessionDescription>> {
        self.record(PeerCall::RestartIce);
        if self.behavior.restart_offer {
            let offer = SessionDescription::offer(format!(
                "mock-restart-offer-{}",
                self.control.generation()
            ));
            self.record(PeerCall::SetLocalDescription(offer.clone()));
            return Ok(Some(offer));
        }
        Ok(None)
    }

    async fn close(&self) -> Result<()> {
        self.record(PeerCall::Close);
        Ok(())
    }
}

struct MockDataChannel {
    label: String,
    sent: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl DataChannel for MockDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        self.sent.lock().push(text.to_string());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
