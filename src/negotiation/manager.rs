//! Counter session management

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::session::CounterSession;
use super::ConnectionState;
use crate::config::ConfigStore;
use crate::error::{NegotiationError, Result};
use crate::events::EventBus;
use crate::peer::PeerFactory;
use crate::signaling::SignalingChannel;

/// Maximum concurrent counter sessions
pub const MAX_SESSIONS: usize = 8;

/// Counter session info
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub state: ConnectionState,
}

struct SessionEntry {
    session: CounterSession,
    created_at: DateTime<Utc>,
}

impl SessionEntry {
    fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.session.id().to_string(),
            created_at: self.created_at,
            state: self.session.state(),
        }
    }
}

/// Runs many counter sessions over one signaling channel
///
/// Each session keeps its own actor; the manager only tracks handles.
/// Sessions read the configuration once, when they are created.
pub struct SessionManager {
    config: ConfigStore,
    signaling: Arc<dyn SignalingChannel>,
    factory: Arc<dyn PeerFactory>,
    events: EventBus,
    sessions: Arc<RwLock<HashMap<String, SessionEntry>>>,
}

impl SessionManager {
    /// Create a new session manager
    pub fn new(
        config: ConfigStore,
        signaling: Arc<dyn SignalingChannel>,
        factory: Arc<dyn PeerFactory>,
    ) -> Self {
        let events = EventBus::with_capacity(config.get().event_capacity as usize);
        Self {
            config,
            signaling,
            factory,
            events,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Bus shared by every session of this manager
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Create a new counter session
    pub async fn create_session(&self) -> Result<CounterSession> {
        let mut sessions = self.sessions.write().await;

        // Check session limit
        if sessions.len() >= MAX_SESSIONS {
            return Err(NegotiationError::LimitReached(format!(
                "Maximum sessions ({}) reached",
                MAX_SESSIONS
            )));
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let config = (*self.config.get()).clone();
        let session = CounterSession::spawn(
            session_id.clone(),
            config,
            self.signaling.clone(),
            self.factory.clone(),
            self.events.clone(),
        );

        sessions.insert(
            session_id.clone(),
            SessionEntry {
                session: session.clone(),
                created_at: Utc::now(),
            },
        );

        info!("Counter session created: {}", session_id);
        Ok(session)
    }

    pub async fn get_session(&self, session_id: &str) -> Option<CounterSession> {
        let sessions = self.sessions.read().await;
        sessions.get(session_id).map(|entry| entry.session.clone())
    }

    /// Get session info
    pub async fn session_info(&self, session_id: &str) -> Option<SessionInfo> {
        let sessions = self.sessions.read().await;
        sessions.get(session_id).map(SessionEntry::info)
    }

    /// Close a session
    pub async fn close_session(&self, session_id: &str) -> Result<()> {
        let entry = self
            .sessions
            .write()
            .await
            .remove(session_id)
            .ok_or_else(|| NegotiationError::NotFound(format!("Session not found: {}", session_id)))?;

        entry.session.close().await;
        info!("Counter session closed: {}", session_id);
        Ok(())
    }

    /// List all sessions
    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.read().await;
        sessions.values().map(SessionEntry::info).collect()
    }

    /// Drop sessions that already reached `Closed`
    pub async fn cleanup_stale_sessions(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|id, entry| {
            let keep = !entry.session.is_closed();
            if !keep {
                debug!("Removing closed counter session: {}", id);
            }
            keep
        });
        before - sessions.len()
    }

    /// Close every session
    pub async fn close_all(&self) {
        let entries: Vec<SessionEntry> = self.sessions.write().await.drain().map(|(_, e)| e).collect();
        for entry in entries {
            entry.session.close().await;
        }
    }

    /// Get session count
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}
