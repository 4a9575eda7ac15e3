//! Kiosk responder
//!
//! Minimal responder-role peer: answers offers relayed by the signaling
//! channel, trickles its candidates back and echoes data channel text.
//! Remote candidates are held until the offer has been applied, the same
//! way the counter holds them until the answer.

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::NegotiationConfig;
use crate::error::{NegotiationError, Result};
use crate::negotiation::CandidateBuffer;
use crate::peer::{
    ConnectivityState, DataChannel, PeerConfig, PeerEvent, PeerEventSink, PeerFactory, PeerHandle,
    TaggedPeerEvent,
};
use crate::signaling::{
    event, AnswerPayload, CounterJoined, IceCandidate, IceCandidatePayload, OfferPayload, PeerId,
    SignalingChannel,
};

/// Prefix put in front of every echoed message
pub const ECHO_PREFIX: &str = "echo: ";

/// Handle to a running kiosk responder
pub struct KioskResponder {
    cancel: CancellationToken,
    connectivity: watch::Receiver<Option<ConnectivityState>>,
}

impl KioskResponder {
    /// Spawn the responder task for one signaling endpoint
    pub fn spawn(
        config: NegotiationConfig,
        signaling: Arc<dyn SignalingChannel>,
        factory: Arc<dyn PeerFactory>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let (connectivity_tx, connectivity) = watch::channel(None);
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();

        let inputs = Inputs {
            joined: signaling.on(event::COUNTER_JOINED),
            offers: signaling.on(event::OFFER),
            candidates: signaling.on(event::ICE_CANDIDATE),
            peer: peer_rx,
        };
        let responder = Responder {
            config,
            signaling,
            factory,
            cancel: cancel.clone(),
            peer_tx,
            connectivity: connectivity_tx,
            local_id: None,
            counter_id: None,
            handle: None,
            generation: 0,
            buffer: CandidateBuffer::new(),
            channel: None,
        };
        tokio::spawn(responder.run(inputs));

        Self {
            cancel,
            connectivity,
        }
    }

    /// Last connectivity state reported by the kiosk's peer connection
    pub fn connectivity_watch(&self) -> watch::Receiver<Option<ConnectivityState>> {
        self.connectivity.clone()
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for KioskResponder {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Inputs {
    joined: mpsc::UnboundedReceiver<serde_json::Value>,
    offers: mpsc::UnboundedReceiver<serde_json::Value>,
    candidates: mpsc::UnboundedReceiver<serde_json::Value>,
    peer: mpsc::UnboundedReceiver<TaggedPeerEvent>,
}

struct Responder {
    config: NegotiationConfig,
    signaling: Arc<dyn SignalingChannel>,
    factory: Arc<dyn PeerFactory>,
    cancel: CancellationToken,
    peer_tx: mpsc::UnboundedSender<TaggedPeerEvent>,
    connectivity: watch::Sender<Option<ConnectivityState>>,
    local_id: Option<PeerId>,
    counter_id: Option<PeerId>,
    handle: Option<Arc<dyn PeerHandle>>,
    generation: u64,
    buffer: CandidateBuffer,
    channel: Option<Arc<dyn DataChannel>>,
}

impl Responder {
    async fn run(mut self, mut inputs: Inputs) {
        let local_id = tokio::select! {
            _ = self.cancel.cancelled() => return,
            id = self.signaling.local_id() => id,
        };
        match local_id {
            Ok(id) => {
                info!("Kiosk ready as {}", id);
                self.local_id = Some(id);
            }
            Err(e) => {
                warn!("Kiosk could not obtain a local id: {}", e);
                return;
            }
        }

        loop {
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(tagged) = inputs.peer.recv() => self.on_peer_event(tagged).await,
                Some(payload) = inputs.joined.recv() => self.on_counter_joined(payload).await,
                Some(payload) = inputs.candidates.recv() => self.on_candidate(payload).await,
                Some(payload) = inputs.offers.recv() => self.on_offer(payload).await,
                else => break,
            };
            if let Err(e) = result {
                warn!("Kiosk: {}", e);
            }
        }

        self.release().await;
        info!("Kiosk responder stopped");
    }

    async fn on_counter_joined(&mut self, payload: serde_json::Value) -> Result<()> {
        let joined: CounterJoined = serde_json::from_value(payload)?;
        info!(
            "Counter {} joined session {}",
            joined.counter_id, joined.session_key
        );
        self.release().await;
        self.buffer = CandidateBuffer::new();
        self.counter_id = Some(joined.counter_id);
        Ok(())
    }

    async fn on_offer(&mut self, payload: serde_json::Value) -> Result<()> {
        let offer: OfferPayload = serde_json::from_value(payload)?;
        let renegotiation =
            self.handle.is_some() && self.counter_id.as_ref() == Some(&offer.from);
        if !renegotiation {
            if self.counter_id.as_ref().is_some_and(|c| *c != offer.from) {
                self.buffer = CandidateBuffer::new();
            }
            self.release().await;
            self.counter_id = Some(offer.from.clone());
        }

        let handle = match &self.handle {
            Some(handle) => handle.clone(),
            None => self.create_handle().await?,
        };

        handle.set_remote_description(offer.offer).await?;
        if let Err(failure) = self.buffer.drain_into(handle.as_ref(), &offer.from).await {
            warn!("Kiosk: {}", failure.error);
        }

        let answer = handle.create_answer().await?;
        handle.set_local_description(answer.clone()).await?;

        let local_id = self
            .local_id
            .clone()
            .ok_or_else(|| NegotiationError::NotReady("kiosk local id".to_string()))?;
        let payload = serde_json::to_value(AnswerPayload {
            to: offer.from.clone(),
            from: local_id,
            answer,
        })?;
        self.signaling.emit(event::ANSWER, payload);
        info!("Kiosk answered {}", offer.from);
        Ok(())
    }

    async fn create_handle(&mut self) -> Result<Arc<dyn PeerHandle>> {
        let ice_servers = match self.signaling.ice_servers().await {
            Ok(servers) => servers,
            Err(e) => {
                warn!("Kiosk using fallback ICE servers: {}", e);
                self.config.fallback_ice_servers.clone()
            }
        };
        self.generation += 1;
        let sink = PeerEventSink::new(self.generation, self.peer_tx.clone());
        let handle = self
            .factory
            .create(PeerConfig { ice_servers }, sink)
            .await?;
        if self.buffer.is_drained() {
            self.buffer = CandidateBuffer::new();
        }
        self.handle = Some(handle.clone());
        Ok(handle)
    }

    async fn on_candidate(&mut self, payload: serde_json::Value) -> Result<()> {
        let payload: IceCandidatePayload = serde_json::from_value(payload)?;
        if let Some(counter) = &self.counter_id {
            if *counter != payload.from {
                debug!("Kiosk dropping candidate from {}", payload.from);
                return Ok(());
            }
        }

        if self.buffer.append(payload.from.clone(), payload.candidate.clone()) {
            debug!("Kiosk buffered candidate ({} pending)", self.buffer.len());
            return Ok(());
        }
        match &self.handle {
            Some(handle) => handle.add_ice_candidate(payload.candidate).await,
            None => Ok(()),
        }
    }

    async fn on_peer_event(&mut self, tagged: TaggedPeerEvent) -> Result<()> {
        if tagged.generation != self.generation {
            return Ok(());
        }
        match tagged.event {
            PeerEvent::LocalCandidate(candidate) => self.send_candidate(candidate),
            PeerEvent::Connectivity(state) => {
                info!("Kiosk connectivity: {}", state);
                self.connectivity.send_replace(Some(state));
                Ok(())
            }
            PeerEvent::RemoteChannel(channel) => {
                info!("Kiosk received data channel '{}'", channel.label());
                self.channel = Some(channel);
                Ok(())
            }
            PeerEvent::ChannelOpened => Ok(()),
            PeerEvent::ChannelMessage(text) => {
                let Some(channel) = &self.channel else {
                    return Ok(());
                };
                debug!("Kiosk echoing {} bytes", text.len());
                channel.send_text(&format!("{}{}", ECHO_PREFIX, text)).await
            }
            PeerEvent::ChannelClosed => {
                self.channel = None;
                Ok(())
            }
        }
    }

    fn send_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let (Some(from), Some(to)) = (self.local_id.clone(), self.counter_id.clone()) else {
            debug!("Kiosk has no counter, dropping local candidate");
            return Ok(());
        };
        let payload = serde_json::to_value(IceCandidatePayload {
            to,
            from,
            candidate,
        })?;
        self.signaling.emit(event::ICE_CANDIDATE, payload);
        Ok(())
    }

    async fn release(&mut self) {
        self.channel = None;
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.close().await {
                warn!("Kiosk failed to close peer connection: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{MockPeerFactory, PeerCall};
    use crate::signaling::{MemoryHub, SessionDescription};
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    async fn wait_until(mut check: impl FnMut() -> bool) {
        timeout(WAIT, async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn test_answers_offer_and_applies_early_candidates() {
        let hub = MemoryHub::new();
        let kiosk = hub.connect_as("K1");
        let counter = hub.connect_as("C1");
        let mut answers = counter.on(event::ANSWER);
        let factory = MockPeerFactory::new();
        let _responder = KioskResponder::spawn(
            NegotiationConfig::default(),
            Arc::new(kiosk),
            Arc::new(factory.clone()),
        );

        counter.emit(
            event::ICE_CANDIDATE,
            json!({"to": "K1", "from": "C1", "candidate": {"candidate": "early", "sdpMid": "0", "sdpMLineIndex": 0}}),
        );
        let offer = OfferPayload {
            to: PeerId::new("K1"),
            from: PeerId::new("C1"),
            offer: SessionDescription::offer("counter-offer"),
        };
        counter.emit(event::OFFER, serde_json::to_value(&offer).unwrap());

        let answer = timeout(WAIT, answers.recv()).await.unwrap().unwrap();
        assert_eq!(answer["to"], "C1");
        assert_eq!(answer["from"], "K1");
        assert_eq!(answer["answer"]["type"], "answer");

        let control = factory.last().unwrap();
        let calls = control.calls();
        assert_eq!(
            calls[0],
            PeerCall::SetRemoteDescription(SessionDescription::offer("counter-offer"))
        );
        assert_eq!(
            calls[1],
            PeerCall::AddIceCandidate(IceCandidate::new("early").with_mid("0", 0))
        );
        assert_eq!(calls[2], PeerCall::CreateAnswer);
    }

    #[tokio::test]
    async fn test_echoes_messages() {
        let hub = MemoryHub::new();
        let kiosk = hub.connect_as("K1");
        let counter = hub.connect_as("C1");
        let mut answers = counter.on(event::ANSWER);
        let factory = MockPeerFactory::new();
        let responder = KioskResponder::spawn(
            NegotiationConfig::default(),
            Arc::new(kiosk),
            Arc::new(factory.clone()),
        );

        let offer = OfferPayload {
            to: PeerId::new("K1"),
            from: PeerId::new("C1"),
            offer: SessionDescription::offer("counter-offer"),
        };
        counter.emit(event::OFFER, serde_json::to_value(&offer).unwrap());
        timeout(WAIT, answers.recv()).await.unwrap().unwrap();

        let control = factory.last().unwrap();
        let channel_factory = MockPeerFactory::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let remote = channel_factory
            .create(PeerConfig::default(), PeerEventSink::new(1, tx))
            .await
            .unwrap()
            .create_data_channel("chat")
            .await
            .unwrap();
        control.emit(PeerEvent::RemoteChannel(remote));
        control.emit(PeerEvent::ChannelMessage("hi".to_string()));

        let channel = channel_factory.last().unwrap();
        wait_until(|| !channel.sent_messages().is_empty()).await;
        assert_eq!(channel.sent_messages(), vec!["echo: hi"]);

        control.emit(PeerEvent::Connectivity(ConnectivityState::Connected));
        let mut connectivity = responder.connectivity_watch();
        timeout(
            WAIT,
            connectivity.wait_for(|s| *s == Some(ConnectivityState::Connected)),
        )
        .await
        .unwrap()
        .unwrap();
    }
}
