//! Counter session actor
//!
//! One tokio task owns the `NegotiationStateMachine` and consumes three
//! queues: caller commands, decoded signaling events (one pump task per
//! event name) and peer callbacks. Nothing else touches the machine, so
//! negotiation steps never interleave.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::machine::NegotiationStateMachine;
use super::ConnectionState;
use crate::config::NegotiationConfig;
use crate::datachannel::ChannelState;
use crate::error::{NegotiationError, Result};
use crate::events::{DiagnosticEntry, EventBus};
use crate::peer::{PeerFactory, TaggedPeerEvent};
use crate::signaling::{InboundSignal, PeerId, SignalingChannel};

enum Command {
    Start {
        session_key: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Send {
        text: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Attempts made by one local id resolution before giving up
const LOCAL_ID_ATTEMPTS: u32 = 3;

/// Resolution progress of the id the signaling channel assigns us
#[derive(Debug, Clone, PartialEq, Eq)]
enum LocalIdStatus {
    Pending,
    Ready(PeerId),
    Failed(String),
}

/// Input produced by the helper tasks of a session
enum Inbound {
    LocalId(Result<PeerId>),
    Signal(InboundSignal),
    Malformed {
        event: &'static str,
        error: serde_json::Error,
    },
}

/// Caller-facing handle to one counter session
///
/// Cheap to clone. Dropping every clone closes the session.
#[derive(Clone)]
pub struct CounterSession {
    id: String,
    cmd_tx: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    events: EventBus,
    state_rx: watch::Receiver<ConnectionState>,
    channel_rx: watch::Receiver<ChannelState>,
    message_rx: watch::Receiver<Option<String>>,
    local_id_rx: watch::Receiver<LocalIdStatus>,
}

impl CounterSession {
    /// Spawn the session task
    ///
    /// Subscribes to the counter's signaling events and starts resolving the
    /// local id right away; call `start` once `wait_ready` returns.
    pub fn spawn(
        id: impl Into<String>,
        config: NegotiationConfig,
        signaling: Arc<dyn SignalingChannel>,
        factory: Arc<dyn PeerFactory>,
        events: EventBus,
    ) -> Self {
        let id = id.into();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let machine = NegotiationStateMachine::new(
            id.clone(),
            config,
            signaling.clone(),
            factory,
            events.clone(),
            peer_tx,
        );
        let cancel = machine.cancel_token();
        let state_rx = machine.state_watch();
        let channel_rx = machine.bridge().state_watch();
        let message_rx = machine.bridge().message_watch();
        let (local_id_tx, local_id_rx) = watch::channel(LocalIdStatus::Pending);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        for event in InboundSignal::EVENTS {
            spawn_pump(event, signaling.on(event), inbound_tx.clone(), cancel.clone());
        }

        spawn_resolver(signaling.clone(), inbound_tx.clone(), cancel.clone());

        let actor = Actor {
            machine,
            signaling,
            inbound_tx,
            local_id_tx,
            resolving: true,
        };
        info!("Spawned counter session {}", id);
        tokio::spawn(run(actor, cmd_rx, inbound_rx, peer_rx));

        Self {
            id,
            cmd_tx,
            cancel,
            events,
            state_rx,
            channel_rx,
            message_rx,
            local_id_rx,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait until the signaling channel assigned this endpoint an id
    ///
    /// Fails with `NotReady` when resolution gave up. A later `start` asks
    /// the signaling channel again, after which this can be awaited anew.
    pub async fn wait_ready(&self) -> Result<PeerId> {
        let mut rx = self.local_id_rx.clone();
        let status = rx
            .wait_for(|status| *status != LocalIdStatus::Pending)
            .await
            .map_err(|_| NegotiationError::SessionClosed)?;
        match &*status {
            LocalIdStatus::Ready(id) => Ok(id.clone()),
            LocalIdStatus::Failed(reason) => Err(NegotiationError::NotReady(reason.clone())),
            LocalIdStatus::Pending => Err(NegotiationError::NotReady(
                "local id not yet obtained".to_string(),
            )),
        }
    }

    /// Emit `join-session` for `session_key`
    pub async fn start(&self, session_key: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Start {
            session_key: session_key.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| NegotiationError::SessionClosed)?
    }

    /// Send text over the data channel
    pub async fn send_message(&self, text: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Send {
            text: text.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| NegotiationError::SessionClosed)?
    }

    /// Tear the session down; in-flight negotiation steps are abandoned
    pub async fn close(&self) {
        self.cancel.cancel();
        let (reply, rx) = oneshot::channel();
        if self.request(Command::Close { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    fn request(&self, command: Command) -> Result<()> {
        self.cmd_tx
            .send(command)
            .map_err(|_| NegotiationError::SessionClosed)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn channel_state(&self) -> ChannelState {
        *self.channel_rx.borrow()
    }

    pub fn channel_watch(&self) -> watch::Receiver<ChannelState> {
        self.channel_rx.clone()
    }

    pub fn last_received_message(&self) -> Option<String> {
        self.message_rx.borrow().clone()
    }

    pub fn message_watch(&self) -> watch::Receiver<Option<String>> {
        self.message_rx.clone()
    }

    /// Diagnostic entries of this session only
    pub fn subscribe(&self) -> SessionEvents {
        SessionEvents {
            session_id: self.id.clone(),
            rx: self.events.subscribe(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }
}

impl std::fmt::Debug for CounterSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CounterSession")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("channel", &self.channel_state())
            .finish_non_exhaustive()
    }
}

/// Diagnostic stream filtered to one session
pub struct SessionEvents {
    session_id: String,
    rx: broadcast::Receiver<DiagnosticEntry>,
}

impl SessionEvents {
    /// Next entry of this session, `None` once the bus is gone
    pub async fn recv(&mut self) -> Option<DiagnosticEntry> {
        loop {
            match self.rx.recv().await {
                Ok(entry) if entry.session_id == self.session_id => return Some(entry),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Session {} diagnostics lagged by {}", self.session_id, n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

fn spawn_pump(
    event: &'static str,
    mut rx: mpsc::UnboundedReceiver<serde_json::Value>,
    tx: mpsc::UnboundedSender<Inbound>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let payload = tokio::select! {
                _ = cancel.cancelled() => break,
                payload = rx.recv() => match payload {
                    Some(payload) => payload,
                    None => break,
                },
            };
            let inbound = match InboundSignal::decode(event, payload) {
                Ok(Some(signal)) => Inbound::Signal(signal),
                Ok(None) => continue,
                Err(error) => Inbound::Malformed { event, error },
            };
            if tx.send(inbound).is_err() {
                break;
            }
        }
        debug!("Signaling pump for {} stopped", event);
    });
}

/// Ask the signaling channel for our id, retrying with exponential backoff
fn spawn_resolver(
    signaling: Arc<dyn SignalingChannel>,
    tx: mpsc::UnboundedSender<Inbound>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut attempt = 0;
        let result = loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = signaling.local_id() => result,
            };
            attempt += 1;
            match result {
                Err(e) if attempt < LOCAL_ID_ATTEMPTS => {
                    // 100, 200ms
                    let delay = Duration::from_millis(100 << (attempt - 1));
                    warn!(
                        "Local id unavailable, retrying in {:?} (attempt {}/{}): {}",
                        delay, attempt, LOCAL_ID_ATTEMPTS, e
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                result => break result,
            }
        };
        let _ = tx.send(Inbound::LocalId(result));
    });
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// State owned by the session task besides the machine itself
struct Actor {
    machine: NegotiationStateMachine,
    signaling: Arc<dyn SignalingChannel>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    local_id_tx: watch::Sender<LocalIdStatus>,
    resolving: bool,
}

impl Actor {
    fn start(&mut self, session_key: &str) -> Result<()> {
        let result = self.machine.start(session_key);
        if matches!(result, Err(NegotiationError::NotReady(_))) && !self.resolving {
            info!(
                "Session {} retrying local id resolution",
                self.machine.session_id()
            );
            self.resolving = true;
            self.local_id_tx.send_replace(LocalIdStatus::Pending);
            spawn_resolver(
                self.signaling.clone(),
                self.inbound_tx.clone(),
                self.machine.cancel_token(),
            );
        }
        result
    }

    fn on_local_id(&mut self, result: Result<PeerId>) -> Result<()> {
        self.resolving = false;
        match result {
            Ok(local_id) => {
                self.machine.set_local_id(local_id.clone());
                self.local_id_tx.send_replace(LocalIdStatus::Ready(local_id));
                Ok(())
            }
            Err(e) => {
                let reason = format!("local id unavailable: {}", e);
                self.local_id_tx
                    .send_replace(LocalIdStatus::Failed(reason.clone()));
                Err(NegotiationError::NotReady(reason))
            }
        }
    }
}

async fn run(
    mut actor: Actor,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    mut inbound_rx: mpsc::UnboundedReceiver<Inbound>,
    mut peer_rx: mpsc::UnboundedReceiver<TaggedPeerEvent>,
) {
    loop {
        let deadline = actor.machine.deadline();
        tokio::select! {
            biased;
            command = cmd_rx.recv() => match command {
                Some(Command::Close { reply }) => {
                    actor.machine.close().await;
                    let _ = reply.send(());
                    break;
                }
                Some(Command::Start { session_key, reply }) => {
                    let result = actor.start(&session_key);
                    if let Err(e) = &result {
                        actor.machine.report(e);
                    }
                    let _ = reply.send(result);
                }
                Some(Command::Send { text, reply }) => {
                    let result = actor.machine.send_message(&text).await;
                    if let Err(e) = &result {
                        actor.machine.report(e);
                    }
                    let _ = reply.send(result);
                }
                None => {
                    debug!("All handles of session {} dropped", actor.machine.session_id());
                    actor.machine.close().await;
                    break;
                }
            },
            Some(tagged) = peer_rx.recv() => {
                if let Err(e) = actor.machine.on_peer_event(tagged).await {
                    actor.machine.report(&e);
                }
            }
            Some(inbound) = inbound_rx.recv() => {
                let result = match inbound {
                    Inbound::LocalId(result) => actor.on_local_id(result),
                    Inbound::Signal(signal) => dispatch(&mut actor.machine, signal).await,
                    Inbound::Malformed { event, error } => {
                        warn!("Malformed {} payload: {}", event, error);
                        Err(error.into())
                    }
                };
                if let Err(e) = result {
                    actor.machine.report(&e);
                }
            }
            _ = sleep_until(deadline) => {
                if let Err(e) = actor.machine.on_timeout().await {
                    actor.machine.report(&e);
                }
            }
        }
    }
    info!("Counter session {} finished", actor.machine.session_id());
}

async fn dispatch(machine: &mut NegotiationStateMachine, signal: InboundSignal) -> Result<()> {
    match signal {
        InboundSignal::SessionJoined(joined) => machine.on_joined(joined).await,
        InboundSignal::Answer(answer) => machine.on_answer(answer).await,
        InboundSignal::IceCandidate(candidate) => machine.on_candidate(candidate).await,
        InboundSignal::SessionError(error) => machine.on_session_error(error.message).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::DiagnosticEvent;
    use crate::peer::{MockPeerFactory, PeerCall, PeerEvent};
    use crate::peer::ConnectivityState;
    use crate::signaling::{event, IceServer, MemoryHub, MemorySignaling};
    use serde_json::json;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::timeout;
    use tokio_test::{assert_err, assert_ok};

    const WAIT: Duration = Duration::from_secs(5);

    /// Relay whose id lookup fails a fixed number of times first
    struct FlakySignaling {
        inner: MemorySignaling,
        failures: AtomicU32,
    }

    #[async_trait]
    impl SignalingChannel for FlakySignaling {
        async fn local_id(&self) -> Result<PeerId> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(NegotiationError::Signaling("relay unreachable".to_string()));
            }
            self.inner.local_id().await
        }

        async fn ice_servers(&self) -> Result<Vec<IceServer>> {
            self.inner.ice_servers().await
        }

        fn emit(&self, event: &str, payload: serde_json::Value) {
            self.inner.emit(event, payload)
        }

        fn on(&self, event: &str) -> mpsc::UnboundedReceiver<serde_json::Value> {
            self.inner.on(event)
        }
    }

    fn flaky_session(hub: &MemoryHub, failures: u32) -> CounterSession {
        let signaling = FlakySignaling {
            inner: hub.connect_as("C1"),
            failures: AtomicU32::new(failures),
        };
        CounterSession::spawn(
            "s1",
            NegotiationConfig::default(),
            Arc::new(signaling),
            Arc::new(MockPeerFactory::new()),
            EventBus::new(),
        )
    }

    struct Fixture {
        hub: MemoryHub,
        kiosk: MemorySignaling,
        factory: MockPeerFactory,
        session: CounterSession,
    }

    fn fixture(config: NegotiationConfig) -> Fixture {
        let hub = MemoryHub::new().with_ice_servers(vec![IceServer::new("stun:hub:3478")]);
        let kiosk = hub.connect_as("K1");
        hub.register_kiosk("KIOSK-ABC123", kiosk.id());
        let factory = MockPeerFactory::new();
        let session = CounterSession::spawn(
            "s1",
            config,
            Arc::new(hub.connect_as("C1")),
            Arc::new(factory.clone()),
            EventBus::new(),
        );
        Fixture {
            hub,
            kiosk,
            factory,
            session,
        }
    }

    async fn wait_for_state(session: &CounterSession, state: ConnectionState) {
        let mut rx = session.state_watch();
        timeout(WAIT, rx.wait_for(|s| *s == state))
            .await
            .expect("state not reached")
            .unwrap();
    }

    #[tokio::test]
    async fn test_full_negotiation() {
        let f = fixture(NegotiationConfig::default());
        let mut offers = f.kiosk.on(event::OFFER);

        assert_eq!(f.session.wait_ready().await.unwrap(), PeerId::new("C1"));
        f.session.start("KIOSK-ABC123").await.unwrap();

        let offer = timeout(WAIT, offers.recv()).await.unwrap().unwrap();
        assert_eq!(offer["from"], "C1");
        assert_eq!(f.session.state(), ConnectionState::Negotiating);

        // candidate overtakes the answer
        let mut events = f.session.subscribe();
        f.kiosk.emit(
            event::ICE_CANDIDATE,
            json!({"to": "C1", "from": "K1", "candidate": {"candidate": "c1", "sdpMid": "0", "sdpMLineIndex": 0}}),
        );
        let buffered = timeout(WAIT, async {
            loop {
                let entry = events.recv().await.unwrap();
                if let DiagnosticEvent::CandidateReceived { buffered } = entry.event {
                    return buffered;
                }
            }
        })
        .await
        .unwrap();
        assert!(buffered);

        f.kiosk.emit(
            event::ANSWER,
            json!({"to": "C1", "from": "K1", "answer": {"type": "answer", "sdp": "a"}}),
        );
        let drained = timeout(WAIT, async {
            loop {
                let entry = events.recv().await.unwrap();
                if let DiagnosticEvent::BufferDrained { applied, .. } = entry.event {
                    return applied;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(drained, 1);

        let control = f.factory.last().unwrap();
        let calls = control.calls();
        let remote_at = calls
            .iter()
            .position(|c| matches!(c, PeerCall::SetRemoteDescription(_)))
            .unwrap();
        let candidate_at = calls
            .iter()
            .position(|c| matches!(c, PeerCall::AddIceCandidate(_)))
            .unwrap();
        assert!(candidate_at > remote_at);

        control.emit(PeerEvent::Connectivity(ConnectivityState::Connected));
        wait_for_state(&f.session, ConnectionState::Connected).await;

        control.emit(PeerEvent::ChannelOpened);
        let mut channel = f.session.channel_watch();
        timeout(WAIT, channel.wait_for(|s| *s == ChannelState::Open))
            .await
            .unwrap()
            .unwrap();
        f.session.send_message("hi").await.unwrap();
        assert_eq!(control.sent_messages(), vec!["hi"]);

        control.emit(PeerEvent::ChannelMessage("hello".to_string()));
        let mut messages = f.session.message_watch();
        timeout(WAIT, messages.wait_for(|m| m.is_some()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(f.session.last_received_message().as_deref(), Some("hello"));

        f.session.close().await;
        assert_eq!(f.session.state(), ConnectionState::Closed);
        assert_eq!(control.count(|c| *c == PeerCall::Close), 1);
    }

    #[tokio::test]
    async fn test_send_before_open_is_rejected() {
        let f = fixture(NegotiationConfig::default());
        f.session.wait_ready().await.unwrap();

        let err = f.session.send_message("hi").await.unwrap_err();
        assert!(matches!(err, NegotiationError::ChannelNotOpen));
        assert!(f.hub.emitted().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_session_key_is_advisory() {
        let f = fixture(NegotiationConfig::default());
        let mut events = f.session.subscribe();
        f.session.wait_ready().await.unwrap();
        f.session.start("MISSING").await.unwrap();

        let error = timeout(WAIT, async {
            loop {
                let entry = events.recv().await.unwrap();
                if let DiagnosticEvent::SessionError { message } = entry.event {
                    return message;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(error, "Session MISSING not found");
        assert_eq!(f.session.state(), ConnectionState::New);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_reported() {
        let f = fixture(NegotiationConfig::default());
        let mut events = f.session.subscribe();
        f.session.wait_ready().await.unwrap();

        f.hub.deliver(&PeerId::new("C1"), event::ANSWER, json!({"to": "C1"}));

        let kind = timeout(WAIT, async {
            loop {
                let entry = events.recv().await.unwrap();
                if let DiagnosticEvent::Error { kind, .. } = entry.event {
                    return kind;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(kind, "payload");
        assert_eq!(f.session.state(), ConnectionState::New);
    }

    #[tokio::test]
    async fn test_negotiation_timeout_closes_session() {
        let config = NegotiationConfig {
            negotiation_timeout_ms: 50,
            ..Default::default()
        };
        let f = fixture(config);
        f.session.wait_ready().await.unwrap();
        assert_ok!(f.session.start("KIOSK-ABC123").await);
        wait_for_state(&f.session, ConnectionState::Negotiating).await;

        wait_for_state(&f.session, ConnectionState::Closed).await;
        assert!(f.session.is_closed());
        assert_err!(f.session.send_message("late").await);
    }

    #[tokio::test]
    async fn test_commands_after_close_fail() {
        let f = fixture(NegotiationConfig::default());
        f.session.close().await;
        f.session.close().await;

        assert_eq!(f.session.state(), ConnectionState::Closed);
        assert!(matches!(
            f.session.start("KIOSK-ABC123").await,
            Err(NegotiationError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_transient_local_id_failure_is_retried() {
        let hub = MemoryHub::new();
        let session = flaky_session(&hub, 1);

        let local_id = timeout(WAIT, session.wait_ready()).await.unwrap();
        assert_eq!(local_id.unwrap(), PeerId::new("C1"));
    }

    #[tokio::test]
    async fn test_local_id_failure_surfaces_and_start_retries() {
        let hub = MemoryHub::new();
        let kiosk = hub.connect_as("K1");
        hub.register_kiosk("KIOSK-ABC123", kiosk.id());
        let session = flaky_session(&hub, LOCAL_ID_ATTEMPTS);

        let err = timeout(WAIT, session.wait_ready()).await.unwrap().unwrap_err();
        assert!(matches!(err, NegotiationError::NotReady(_)));

        let err = session.start("KIOSK-ABC123").await.unwrap_err();
        assert!(matches!(err, NegotiationError::NotReady(_)));

        let local_id = timeout(WAIT, session.wait_ready()).await.unwrap();
        assert_eq!(local_id.unwrap(), PeerId::new("C1"));
        assert_ok!(session.start("KIOSK-ABC123").await);
        wait_for_state(&session, ConnectionState::Negotiating).await;
    }

    #[tokio::test]
    async fn test_debug_shows_id_and_state() {
        let f = fixture(NegotiationConfig::default());
        let rendered = format!("{:?}", f.session);
        assert!(rendered.contains("\"s1\""));
        assert!(rendered.contains("New"));
    }
}
