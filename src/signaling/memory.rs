//! In-process signaling hub
//!
//! Routes `offer`, `answer` and `ice-candidate` by their `to` field and
//! pairs `join-session` requests with the kiosk registered for the session
//! key. Recent emissions are also kept for inspection.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::types::{event, CounterJoined, IceServer, JoinSession, PeerId, SessionErrorPayload, SessionJoined};
use super::SignalingChannel;
use crate::error::{NegotiationError, Result};

/// Emissions kept by a hub unless configured otherwise
pub const DEFAULT_RECORD_CAPACITY: usize = 1024;

type Subscribers = HashMap<String, Vec<mpsc::UnboundedSender<serde_json::Value>>>;

/// Event emitted by one of the hub endpoints
#[derive(Debug, Clone, PartialEq)]
pub struct EmittedEvent {
    pub from: PeerId,
    pub event: String,
    pub payload: serde_json::Value,
}

struct HubInner {
    endpoints: HashMap<PeerId, Subscribers>,
    kiosks: HashMap<String, PeerId>,
    ice_servers: Vec<IceServer>,
    emitted: VecDeque<EmittedEvent>,
    record_capacity: usize,
}

impl Default for HubInner {
    fn default() -> Self {
        Self {
            endpoints: HashMap::new(),
            kiosks: HashMap::new(),
            ice_servers: Vec::new(),
            emitted: VecDeque::new(),
            record_capacity: DEFAULT_RECORD_CAPACITY,
        }
    }
}

impl HubInner {
    fn record(&mut self, emitted: EmittedEvent) {
        if self.record_capacity == 0 {
            return;
        }
        while self.emitted.len() >= self.record_capacity {
            self.emitted.pop_front();
        }
        self.emitted.push_back(emitted);
    }

    fn deliver(&mut self, to: &PeerId, event: &str, payload: serde_json::Value) -> bool {
        let Some(subscribers) = self.endpoints.get_mut(to) else {
            warn!("Dropping {} for unknown endpoint {}", event, to);
            return false;
        };
        let Some(senders) = subscribers.get_mut(event) else {
            debug!("Endpoint {} has no subscriber for {}", to, event);
            return false;
        };
        senders.retain(|tx| !tx.is_closed());
        for tx in senders.iter() {
            let _ = tx.send(payload.clone());
        }
        !senders.is_empty()
    }

    fn route(&mut self, from: &PeerId, event: &str, payload: serde_json::Value) {
        match event {
            event::JOIN_SESSION => {
                let join: JoinSession = match serde_json::from_value(payload) {
                    Ok(join) => join,
                    Err(e) => {
                        warn!("Malformed join-session from {}: {}", from, e);
                        return;
                    }
                };
                match self.kiosks.get(&join.session_key).cloned() {
                    Some(kiosk_id) => {
                        let joined = SessionJoined {
                            kiosk_id: kiosk_id.clone(),
                            session_key: Some(join.session_key.clone()),
                        };
                        let counter = CounterJoined {
                            counter_id: join.counter_id,
                            session_key: join.session_key,
                        };
                        if let Ok(value) = serde_json::to_value(&counter) {
                            self.deliver(&kiosk_id, event::COUNTER_JOINED, value);
                        }
                        if let Ok(value) = serde_json::to_value(&joined) {
                            self.deliver(from, event::SESSION_JOINED, value);
                        }
                    }
                    None => {
                        let error = SessionErrorPayload {
                            message: format!("Session {} not found", join.session_key),
                        };
                        if let Ok(value) = serde_json::to_value(&error) {
                            self.deliver(from, event::SESSION_ERROR, value);
                        }
                    }
                }
            }
            event::OFFER | event::ANSWER | event::ICE_CANDIDATE => {
                let to = payload
                    .get("to")
                    .and_then(|v| v.as_str())
                    .map(PeerId::new);
                match to {
                    Some(to) => {
                        self.deliver(&to, event, payload);
                    }
                    None => warn!("Dropping {} from {} without recipient", event, from),
                }
            }
            other => warn!("Hub does not route {} events", other),
        }
    }
}

/// In-memory relay shared by any number of endpoints
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<Mutex<HubInner>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Servers handed out by `ice_servers()`
    pub fn with_ice_servers(self, servers: Vec<IceServer>) -> Self {
        self.inner.lock().ice_servers = servers;
        self
    }

    /// Keep at most `capacity` recent emissions; 0 disables recording
    pub fn with_record_capacity(self, capacity: usize) -> Self {
        {
            let mut inner = self.inner.lock();
            inner.record_capacity = capacity;
            while inner.emitted.len() > capacity {
                inner.emitted.pop_front();
            }
        }
        self
    }

    /// Connect an endpoint with a random identifier
    pub fn connect(&self) -> MemorySignaling {
        self.connect_as(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Connect an endpoint with a chosen identifier
    pub fn connect_as(&self, id: impl Into<String>) -> MemorySignaling {
        let id = PeerId::new(id);
        self.inner.lock().endpoints.entry(id.clone()).or_default();
        MemorySignaling {
            id,
            hub: self.clone(),
        }
    }

    /// Make `kiosk` the target of `join-session` requests for `session_key`
    pub fn register_kiosk(&self, session_key: impl Into<String>, kiosk: &PeerId) {
        self.inner
            .lock()
            .kiosks
            .insert(session_key.into(), kiosk.clone());
    }

    /// Push an event straight to one endpoint, bypassing routing
    pub fn deliver(&self, to: &PeerId, event: &str, payload: serde_json::Value) -> bool {
        self.inner.lock().deliver(to, event, payload)
    }

    /// Recent emissions, oldest first
    pub fn emitted(&self) -> Vec<EmittedEvent> {
        self.inner.lock().emitted.iter().cloned().collect()
    }

    /// Emissions of one event name
    pub fn emitted_named(&self, event: &str) -> Vec<EmittedEvent> {
        self.inner
            .lock()
            .emitted
            .iter()
            .filter(|e| e.event == event)
            .cloned()
            .collect()
    }
}

/// One endpoint of a `MemoryHub`
#[derive(Clone)]
pub struct MemorySignaling {
    id: PeerId,
    hub: MemoryHub,
}

impl MemorySignaling {
    pub fn id(&self) -> &PeerId {
        &self.id
    }
}

#[async_trait]
impl SignalingChannel for MemorySignaling {
    async fn local_id(&self) -> Result<PeerId> {
        Ok(self.id.clone())
    }

    async fn ice_servers(&self) -> Result<Vec<IceServer>> {
        let servers = self.hub.inner.lock().ice_servers.clone();
        if servers.is_empty() {
            return Err(NegotiationError::Signaling(
                "hub has no ICE servers configured".to_string(),
            ));
        }
        Ok(servers)
    }

    fn emit(&self, event: &str, payload: serde_json::Value) {
        let mut inner = self.hub.inner.lock();
        if inner.record_capacity > 0 {
            inner.record(EmittedEvent {
                from: self.id.clone(),
                event: event.to_string(),
                payload: payload.clone(),
            });
        }
        inner.route(&self.id, event, payload);
    }

    fn on(&self, event: &str) -> mpsc::UnboundedReceiver<serde_json::Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.hub
            .inner
            .lock()
            .endpoints
            .entry(self.id.clone())
            .or_default()
            .entry(event.to_string())
            .or_default()
            .push(tx);
        rx
    }
}
