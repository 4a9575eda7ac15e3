use serde::{Deserialize, Serialize};
use std::time::Duration;
use typeshare::typeshare;

use crate::signaling::IceServer;

/// Default session key joined by the counter when none is supplied
pub const DEFAULT_SESSION_KEY: &str = "KIOSK-ABC123";

/// Default data channel label
pub const DEFAULT_DATA_CHANNEL_LABEL: &str = "chat";

/// Negotiation configuration for the counter side
#[typeshare]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    /// Session key sent with `join-session`
    pub session_key: String,
    /// Label of the data channel created with every peer connection
    pub data_channel_label: String,
    /// Upper bound for a session to reach `Connected` after joining (ms)
    pub negotiation_timeout_ms: u32,
    /// ICE restarts attempted before a `failed` report becomes terminal
    pub max_ice_restarts: u32,
    /// How `session-error` events affect the session
    pub session_error_policy: SessionErrorPolicy,
    /// ICE servers used when the signaling channel cannot provide any
    pub fallback_ice_servers: Vec<IceServer>,
    /// Diagnostic event ring buffer size
    pub event_capacity: u32,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            session_key: DEFAULT_SESSION_KEY.to_string(),
            data_channel_label: DEFAULT_DATA_CHANNEL_LABEL.to_string(),
            negotiation_timeout_ms: 30_000,
            max_ice_restarts: 1,
            session_error_policy: SessionErrorPolicy::Advisory,
            fallback_ice_servers: vec![IceServer::new("stun:stun.l.google.com:19302")],
            event_capacity: 256,
        }
    }
}

impl NegotiationConfig {
    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms as u64)
    }
}

/// Reaction to a `session-error` event relayed by the signaling side
#[typeshare]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionErrorPolicy {
    /// Surface as a diagnostic only, the connection state is untouched
    #[default]
    Advisory,
    /// Tear the session down to `Closed`
    Fatal,
}

impl std::fmt::Display for SessionErrorPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionErrorPolicy::Advisory => write!(f, "advisory"),
            SessionErrorPolicy::Fatal => write!(f, "fatal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: NegotiationConfig =
            serde_json::from_str(r#"{"session_key":"KIOSK-XYZ","session_error_policy":"fatal"}"#)
                .unwrap();
        assert_eq!(config.session_key, "KIOSK-XYZ");
        assert_eq!(config.session_error_policy, SessionErrorPolicy::Fatal);
        assert_eq!(config.data_channel_label, "chat");
        assert_eq!(config.max_ice_restarts, 1);
        assert_eq!(config.negotiation_timeout(), Duration::from_secs(30));
    }
}
