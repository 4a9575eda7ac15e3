//! Data channel bridge
//!
//! Tracks the observed state of the session's data channel and gates `send`
//! on it. Open/message/close callbacks arrive through the session queue, so
//! the bridge itself holds no locks.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::{NegotiationError, Result};
use crate::events::{DiagnosticEntry, DiagnosticEvent, EventBus};
use crate::peer::DataChannel;

/// Observed data channel state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    /// Channel created, not yet open
    Connecting,
    Open,
    Closed,
}

pub struct DataChannelBridge {
    session_id: String,
    events: EventBus,
    channel: Option<Arc<dyn DataChannel>>,
    state: watch::Sender<ChannelState>,
    last_message: watch::Sender<Option<String>>,
}

impl DataChannelBridge {
    pub fn new(session_id: impl Into<String>, events: EventBus) -> Self {
        let (state, _) = watch::channel(ChannelState::Closed);
        let (last_message, _) = watch::channel(None);
        Self {
            session_id: session_id.into(),
            events,
            channel: None,
            state,
            last_message,
        }
    }

    fn publish(&self, event: DiagnosticEvent) {
        self.events
            .publish(DiagnosticEntry::new(self.session_id.clone(), event));
    }

    fn label(&self) -> String {
        self.channel
            .as_ref()
            .map(|dc| dc.label().to_string())
            .unwrap_or_default()
    }

    /// Bind a freshly created channel, replacing any previous one
    pub fn attach(&mut self, channel: Arc<dyn DataChannel>) {
        debug!("Attaching data channel '{}'", channel.label());
        self.channel = Some(channel);
        self.state.send_replace(ChannelState::Connecting);
    }

    /// Forget the channel; it is closed together with its peer connection
    pub fn detach(&mut self) {
        if self.channel.take().is_some() {
            self.state.send_replace(ChannelState::Closed);
        }
    }

    pub fn on_opened(&mut self) {
        if self.channel.is_none() {
            debug!("Ignoring open for detached data channel");
            return;
        }
        info!("Data channel '{}' open", self.label());
        self.state.send_replace(ChannelState::Open);
        self.publish(DiagnosticEvent::ChannelOpened { label: self.label() });
    }

    pub fn on_message(&mut self, text: String) {
        debug!("Data channel message ({} bytes)", text.len());
        self.last_message.send_replace(Some(text.clone()));
        self.publish(DiagnosticEvent::MessageReceived { text });
    }

    pub fn on_closed(&mut self) {
        if *self.state.borrow() == ChannelState::Closed {
            return;
        }
        info!("Data channel '{}' closed", self.label());
        self.state.send_replace(ChannelState::Closed);
        self.publish(DiagnosticEvent::ChannelClosed { label: self.label() });
    }

    /// Send text, failing with `ChannelNotOpen` unless the channel is open
    pub async fn send(&self, text: &str) -> Result<()> {
        let channel = match (&self.channel, *self.state.borrow()) {
            (Some(channel), ChannelState::Open) => channel.clone(),
            _ => return Err(NegotiationError::ChannelNotOpen),
        };
        channel.send_text(text).await?;
        self.publish(DiagnosticEvent::MessageSent {
            text: text.to_string(),
        });
        Ok(())
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    pub fn last_message(&self) -> Option<String> {
        self.last_message.borrow().clone()
    }

    pub fn message_watch(&self) -> watch::Receiver<Option<String>> {
        self.last_message.subscribe()
    }
}
