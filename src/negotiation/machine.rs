//! Initiator-side negotiation state machine
//!
//! Owns one peer connection lifecycle:
//!
//! ```text
//! New --joined--> Negotiating --connected--> Connected
//!                     |                          |
//!                     +--------failed------------+--> Failed --restart--> Connected
//!                                                        |
//!                          close / timeout / exhausted   +--> Closed
//! ```
//!
//! The machine is driven by exactly one task (see `session`). Every await on
//! the peer or signaling capability races the session's cancellation token;
//! once it fires, completions are discarded and only `close` has effect.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::buffer::CandidateBuffer;
use super::ConnectionState;
use crate::config::{NegotiationConfig, SessionErrorPolicy};
use crate::datachannel::{ChannelState, DataChannelBridge};
use crate::error::{NegotiationError, Result};
use crate::events::{DiagnosticEntry, DiagnosticEvent, EventBus};
use crate::peer::{
    ConnectivityState, PeerConfig, PeerEvent, PeerEventSink, PeerFactory, PeerHandle,
    TaggedPeerEvent,
};
use crate::signaling::{
    emit_signal, AnswerPayload, IceCandidate, IceCandidatePayload, JoinSession, OfferPayload,
    OutboundSignal, PeerId, SessionDescription, SessionJoined, SignalingChannel,
};

/// Await `fut` unless `cancel` fires first
///
/// Returns `None` when the session was closed while the call was in flight.
async fn guarded<T>(cancel: &CancellationToken, fut: impl Future<Output = T>) -> Option<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        result = fut => Some(result),
    }
}

pub struct NegotiationStateMachine {
    session_id: String,
    config: NegotiationConfig,
    signaling: Arc<dyn SignalingChannel>,
    factory: Arc<dyn PeerFactory>,
    events: EventBus,
    cancel: CancellationToken,
    peer_tx: mpsc::UnboundedSender<TaggedPeerEvent>,

    state: watch::Sender<ConnectionState>,
    local_id: Option<PeerId>,
    remote_id: Option<PeerId>,
    session_key: Option<String>,

    handle: Option<Arc<dyn PeerHandle>>,
    generation: u64,
    buffer: CandidateBuffer,
    bridge: DataChannelBridge,
    awaiting_answer: bool,
    restarts: u32,
    deadline: Option<Instant>,
}

impl NegotiationStateMachine {
    pub fn new(
        session_id: impl Into<String>,
        config: NegotiationConfig,
        signaling: Arc<dyn SignalingChannel>,
        factory: Arc<dyn PeerFactory>,
        events: EventBus,
        peer_tx: mpsc::UnboundedSender<TaggedPeerEvent>,
    ) -> Self {
        let session_id = session_id.into();
        let (state, _) = watch::channel(ConnectionState::New);
        Self {
            bridge: DataChannelBridge::new(session_id.clone(), events.clone()),
            session_id,
            config,
            signaling,
            factory,
            events,
            cancel: CancellationToken::new(),
            peer_tx,
            state,
            local_id: None,
            remote_id: None,
            session_key: None,
            handle: None,
            generation: 0,
            buffer: CandidateBuffer::new(),
            awaiting_answer: false,
            restarts: 0,
            deadline: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn local_id(&self) -> Option<&PeerId> {
        self.local_id.as_ref()
    }

    pub fn remote_id(&self) -> Option<&PeerId> {
        self.remote_id.as_ref()
    }

    pub fn bridge(&self) -> &DataChannelBridge {
        &self.bridge
    }

    pub fn buffer(&self) -> &CandidateBuffer {
        &self.buffer
    }

    pub fn has_handle(&self) -> bool {
        self.handle.is_some()
    }

    /// Token cancelled by `close`; shared with whoever may close concurrently
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// When the current negotiation attempt times out
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    fn publish(&self, event: DiagnosticEvent) {
        self.events
            .publish(DiagnosticEntry::new(self.session_id.clone(), event));
    }

    /// Surface an error as a diagnostic entry
    pub fn report(&self, err: &NegotiationError) {
        warn!("Session {}: {}", self.session_id, err);
        self.publish(DiagnosticEvent::Error {
            kind: err.kind().to_string(),
            message: err.to_string(),
        });
    }

    fn transition(&mut self, to: ConnectionState) {
        let from = self.state();
        if from == to {
            return;
        }
        info!("Session {} state: {} -> {}", self.session_id, from, to);
        self.state.send_replace(to);
        self.publish(DiagnosticEvent::StateChanged { from, to });
    }

    fn invalid(&self, event: &'static str) -> NegotiationError {
        NegotiationError::InvalidTransition {
            event,
            state: self.state(),
        }
    }

    fn arm_deadline(&mut self) {
        self.deadline = Some(Instant::now() + self.config.negotiation_timeout());
    }

    fn emit(&self, signal: OutboundSignal) -> Result<()> {
        emit_signal(self.signaling.as_ref(), &signal)
    }

    /// Record the identifier assigned by the signaling channel
    pub fn set_local_id(&mut self, local_id: PeerId) {
        if self.local_id.is_some() {
            debug!("Local id already resolved, ignoring {}", local_id);
            return;
        }
        info!("Session {} local id: {}", self.session_id, local_id);
        self.publish(DiagnosticEvent::LocalId {
            local_id: local_id.clone(),
        });
        self.local_id = Some(local_id);
    }

    /// Ask the signaling channel to pair this endpoint with a kiosk
    pub fn start(&mut self, session_key: &str) -> Result<()> {
        if self.is_cancelled() {
            return Err(NegotiationError::SessionClosed);
        }
        if self.state() != ConnectionState::New {
            return Err(self.invalid("start"));
        }
        let Some(local_id) = self.local_id.clone() else {
            return Err(NegotiationError::NotReady(
                "local id not yet obtained".to_string(),
            ));
        };

        self.emit(OutboundSignal::JoinSession(JoinSession {
            session_key: session_key.to_string(),
            counter_id: local_id,
        }))?;
        info!("Session {} joining {}", self.session_id, session_key);
        self.session_key = Some(session_key.to_string());
        self.publish(DiagnosticEvent::JoinRequested {
            session_key: session_key.to_string(),
        });
        Ok(())
    }

    /// Remote endpoint joined: create the peer connection and send an offer
    pub async fn on_joined(&mut self, joined: SessionJoined) -> Result<()> {
        if self.is_cancelled() {
            return Ok(());
        }
        if let (Some(theirs), Some(ours)) = (&joined.session_key, &self.session_key) {
            if theirs != ours {
                debug!("Ignoring join for session {} (ours: {})", theirs, ours);
                return Ok(());
            }
        }
        if self.state() != ConnectionState::New {
            return Err(self.invalid("session-joined"));
        }
        if self.local_id.is_none() {
            return Err(NegotiationError::NotReady(
                "joined before local id was obtained".to_string(),
            ));
        }

        info!("Session {} joined by {}", self.session_id, joined.kiosk_id);
        self.publish(DiagnosticEvent::Joined {
            remote_id: joined.kiosk_id.clone(),
        });
        self.remote_id = Some(joined.kiosk_id);
        self.transition(ConnectionState::Negotiating);
        self.arm_deadline();

        self.negotiate().await
    }

    async fn negotiate(&mut self) -> Result<()> {
        let ice_servers = match guarded(&self.cancel, self.signaling.ice_servers()).await {
            None => return Ok(()),
            Some(Ok(servers)) => servers,
            Some(Err(e)) => {
                warn!("Using fallback ICE servers: {}", e);
                self.config.fallback_ice_servers.clone()
            }
        };

        self.generation += 1;
        let sink = PeerEventSink::new(self.generation, self.peer_tx.clone());
        let config = PeerConfig { ice_servers };
        let handle = match guarded(&self.cancel, self.factory.create(config, sink)).await {
            None => return Ok(()),
            Some(Ok(handle)) => handle,
            Some(Err(e)) => return Err(self.fail(format!("peer connection: {}", e)).await),
        };
        self.handle = Some(handle.clone());

        let label = self.config.data_channel_label.clone();
        match guarded(&self.cancel, handle.create_data_channel(&label)).await {
            None => return Ok(()),
            Some(Ok(channel)) => self.bridge.attach(channel),
            Some(Err(e)) => return Err(self.fail(format!("data channel: {}", e)).await),
        }

        let offer = match guarded(&self.cancel, handle.create_offer()).await {
            None => return Ok(()),
            Some(Ok(offer)) => offer,
            Some(Err(e)) => return Err(self.fail(format!("create offer: {}", e)).await),
        };
        match guarded(&self.cancel, handle.set_local_description(offer.clone())).await {
            None => return Ok(()),
            Some(Ok(())) => {}
            Some(Err(e)) => return Err(self.fail(format!("local description: {}", e)).await),
        }

        self.send_offer(offer, false)
    }

    fn send_offer(&mut self, offer: SessionDescription, restart: bool) -> Result<()> {
        let (Some(from), Some(to)) = (self.local_id.clone(), self.remote_id.clone()) else {
            return Err(NegotiationError::NotReady(
                "offer without both endpoint ids".to_string(),
            ));
        };
        self.emit(OutboundSignal::Offer(OfferPayload {
            to: to.clone(),
            from,
            offer,
        }))?;
        info!("Session {} sent offer to {}", self.session_id, to);
        self.awaiting_answer = true;
        self.publish(DiagnosticEvent::OfferSent { to, restart });
        Ok(())
    }

    /// Apply the kiosk's answer, then the candidates that raced ahead of it
    pub async fn on_answer(&mut self, payload: AnswerPayload) -> Result<()> {
        if self.is_cancelled() {
            return Ok(());
        }
        if !self.is_from_remote(&payload.from, "answer") {
            return Ok(());
        }
        let Some(handle) = self.handle.clone() else {
            return Err(self.invalid("answer"));
        };
        if !self.awaiting_answer {
            return Err(self.invalid("answer"));
        }
        self.awaiting_answer = false;

        match guarded(&self.cancel, handle.set_remote_description(payload.answer)).await {
            None => return Ok(()),
            Some(Ok(())) => {}
            Some(Err(e)) => return Err(self.fail(format!("answer rejected: {}", e)).await),
        }
        info!("Session {} applied answer from {}", self.session_id, payload.from);
        self.publish(DiagnosticEvent::AnswerReceived {
            from: payload.from.clone(),
        });

        let pending = self.buffer.len();
        let drain = self.buffer.drain_into(handle.as_ref(), &payload.from);
        let (drained, result) = match guarded(&self.cancel, drain).await {
            None => return Ok(()),
            Some(Ok(drained)) => (drained, Ok(())),
            Some(Err(failure)) => (failure.drained, Err(failure.error)),
        };
        if pending > 0 {
            self.publish(DiagnosticEvent::BufferDrained {
                applied: drained.applied,
                discarded: drained.discarded,
            });
        }
        result
    }

    /// Remote candidate: apply now or hold until the answer is in
    pub async fn on_candidate(&mut self, payload: IceCandidatePayload) -> Result<()> {
        if self.is_cancelled() {
            return Ok(());
        }
        if !self.is_from_remote(&payload.from, "ice-candidate") {
            return Ok(());
        }

        if self.buffer.append(payload.from.clone(), payload.candidate.clone()) {
            debug!(
                "Session {} buffered remote candidate ({} pending)",
                self.session_id,
                self.buffer.len()
            );
            self.publish(DiagnosticEvent::CandidateReceived { buffered: true });
            return Ok(());
        }

        let Some(handle) = self.handle.clone() else {
            debug!("Session {} has no peer connection, dropping candidate", self.session_id);
            return Ok(());
        };
        match guarded(&self.cancel, handle.add_ice_candidate(payload.candidate)).await {
            None => Ok(()),
            Some(Ok(())) => {
                debug!("Session {} applied remote candidate", self.session_id);
                self.publish(DiagnosticEvent::CandidateReceived { buffered: false });
                Ok(())
            }
            Some(Err(NegotiationError::CandidateApplicationFailed(reason))) => {
                Err(NegotiationError::CandidateApplicationFailed(reason))
            }
            Some(Err(e)) => Err(NegotiationError::CandidateApplicationFailed(e.to_string())),
        }
    }

    /// Relay a locally gathered candidate to the kiosk
    pub fn on_local_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        let (Some(from), Some(to)) = (self.local_id.clone(), self.remote_id.clone()) else {
            warn!(
                "Session {} gathered a candidate without a remote endpoint, dropping",
                self.session_id
            );
            return Ok(());
        };
        self.emit(OutboundSignal::IceCandidate(IceCandidatePayload {
            to: to.clone(),
            from,
            candidate,
        }))?;
        debug!("Session {} sent local candidate to {}", self.session_id, to);
        self.publish(DiagnosticEvent::CandidateSent { to });
        Ok(())
    }

    /// Connectivity report from the peer connection
    pub async fn on_connectivity(&mut self, connectivity: ConnectivityState) -> Result<()> {
        self.publish(DiagnosticEvent::ConnectivityChanged {
            state: connectivity,
        });

        match connectivity {
            ConnectivityState::Connected | ConnectivityState::Completed => {
                if self.state() != ConnectionState::Connected {
                    self.transition(ConnectionState::Connected);
                }
                self.restarts = 0;
                self.deadline = None;
                Ok(())
            }
            ConnectivityState::Failed => self.on_connectivity_failed().await,
            ConnectivityState::Closed => {
                info!("Session {} peer connection closed", self.session_id);
                self.teardown().await;
                Ok(())
            }
            ConnectivityState::Disconnected => {
                warn!("Session {} connectivity lost, waiting for recovery", self.session_id);
                Ok(())
            }
            ConnectivityState::New | ConnectivityState::Checking => {
                debug!("Session {} connectivity: {}", self.session_id, connectivity);
                Ok(())
            }
        }
    }

    async fn on_connectivity_failed(&mut self) -> Result<()> {
        self.transition(ConnectionState::Failed);

        if self.restarts >= self.config.max_ice_restarts {
            let err = NegotiationError::NegotiationFailed(format!(
                "connectivity failed after {} restart(s)",
                self.restarts
            ));
            self.teardown().await;
            return Err(err);
        }
        let Some(handle) = self.handle.clone() else {
            self.teardown().await;
            return Err(NegotiationError::NegotiationFailed(
                "connectivity failed without a peer connection".to_string(),
            ));
        };

        self.restarts += 1;
        info!(
            "Session {} restarting ICE (attempt {}/{})",
            self.session_id, self.restarts, self.config.max_ice_restarts
        );
        self.publish(DiagnosticEvent::IceRestart {
            attempt: self.restarts,
        });
        self.arm_deadline();

        match guarded(&self.cancel, handle.restart_ice()).await {
            None => Ok(()),
            Some(Ok(Some(offer))) => self.send_offer(offer, true),
            Some(Ok(None)) => Ok(()),
            Some(Err(e)) => {
                self.teardown().await;
                Err(NegotiationError::NegotiationFailed(format!(
                    "ICE restart: {}",
                    e
                )))
            }
        }
    }

    /// Relay reported an error for this endpoint
    pub async fn on_session_error(&mut self, message: String) -> Result<()> {
        if self.is_cancelled() {
            return Ok(());
        }
        warn!("Session {} signaling error: {}", self.session_id, message);
        self.publish(DiagnosticEvent::SessionError {
            message: message.clone(),
        });
        match self.config.session_error_policy {
            SessionErrorPolicy::Advisory => Ok(()),
            SessionErrorPolicy::Fatal => {
                self.teardown().await;
                Err(NegotiationError::SessionError(message))
            }
        }
    }

    /// Callback from the current (or a stale) peer connection
    pub async fn on_peer_event(&mut self, tagged: TaggedPeerEvent) -> Result<()> {
        if self.is_cancelled() {
            debug!("Session {} closed, dropping {:?}", self.session_id, tagged.event);
            return Ok(());
        }
        if tagged.generation != self.generation || self.handle.is_none() {
            debug!(
                "Session {} dropping event from stale peer connection (generation {}, current {})",
                self.session_id, tagged.generation, self.generation
            );
            return Ok(());
        }

        match tagged.event {
            PeerEvent::LocalCandidate(candidate) => self.on_local_candidate(candidate),
            PeerEvent::Connectivity(connectivity) => self.on_connectivity(connectivity).await,
            PeerEvent::ChannelOpened => {
                self.bridge.on_opened();
                Ok(())
            }
            PeerEvent::ChannelMessage(text) => {
                self.bridge.on_message(text);
                Ok(())
            }
            PeerEvent::ChannelClosed => {
                self.bridge.on_closed();
                Ok(())
            }
            PeerEvent::RemoteChannel(channel) => {
                debug!(
                    "Session {} ignoring remote data channel '{}'",
                    self.session_id,
                    channel.label()
                );
                Ok(())
            }
        }
    }

    /// Deadline passed without reaching `Connected`
    pub async fn on_timeout(&mut self) -> Result<()> {
        self.deadline = None;
        if self.is_cancelled() {
            return Ok(());
        }
        match self.state() {
            ConnectionState::Connected | ConnectionState::Closed => Ok(()),
            _ => {
                self.transition(ConnectionState::Failed);
                let err = NegotiationError::NegotiationFailed(format!(
                    "not connected within {} ms",
                    self.config.negotiation_timeout_ms
                ));
                self.teardown().await;
                Err(err)
            }
        }
    }

    pub async fn send_message(&mut self, text: &str) -> Result<()> {
        if self.is_cancelled() {
            return Err(NegotiationError::SessionClosed);
        }
        self.bridge.send(text).await
    }

    pub fn channel_state(&self) -> ChannelState {
        self.bridge.state()
    }

    /// Tear the session down; safe to call repeatedly and from any state
    pub async fn close(&mut self) {
        if self.state().is_terminal() && self.handle.is_none() {
            self.cancel.cancel();
            return;
        }
        info!("Closing session {}", self.session_id);
        self.teardown().await;
    }

    async fn teardown(&mut self) {
        self.cancel.cancel();
        self.awaiting_answer = false;
        self.deadline = None;
        let discarded = self.buffer.discard();
        if discarded > 0 {
            debug!(
                "Session {} discarded {} buffered candidates",
                self.session_id, discarded
            );
        }
        self.release_handle().await;
        self.transition(ConnectionState::Closed);
    }

    /// Move to `Failed` and drop the peer connection, keeping the session
    async fn fail(&mut self, reason: String) -> NegotiationError {
        self.transition(ConnectionState::Failed);
        self.awaiting_answer = false;
        self.deadline = None;
        self.buffer.discard();
        self.release_handle().await;
        NegotiationError::NegotiationFailed(reason)
    }

    async fn release_handle(&mut self) {
        self.bridge.detach();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.close().await {
                warn!("Session {} failed to close peer connection: {}", self.session_id, e);
            }
        }
    }

    fn is_from_remote(&self, from: &PeerId, event: &str) -> bool {
        match &self.remote_id {
            Some(remote) if remote != from => {
                warn!(
                    "Session {} dropping {} from {} (expected {})",
                    self.session_id, event, from, remote
                );
                false
            }
            _ => true,
        }
    }
}
