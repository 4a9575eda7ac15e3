//! Event system for negotiation diagnostics
//!
//! Every transition, signaling exchange and error of a session is published
//! as a `DiagnosticEntry` on an `EventBus`. Log viewers, tests and the demo
//! binary subscribe to it instead of reading session internals.

pub mod types;

pub use types::{DiagnosticEntry, DiagnosticEvent};

use tokio::sync::broadcast;

/// Default event channel capacity (ring buffer size)
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Broadcast bus for diagnostic entries
///
/// Cloning is cheap and every clone publishes into the same channel, so a
/// single bus can be shared by all sessions of a manager.
///
/// # Example
///
/// ```no_run
/// use kiosk_link::events::{DiagnosticEntry, DiagnosticEvent, EventBus};
///
/// let bus = EventBus::new();
/// let mut rx = bus.subscribe();
///
/// bus.publish(DiagnosticEntry::new(
///     "session-1",
///     DiagnosticEvent::SessionError { message: "busy".to_string() },
/// ));
///
/// tokio::spawn(async move {
///     while let Ok(entry) = rx.recv().await {
///         println!("{}: {}", entry.session_id, entry.event.event_name());
///     }
/// });
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DiagnosticEntry>,
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an entry to all subscribers
    ///
    /// If there are no active subscribers, the entry is dropped.
    pub fn publish(&self, entry: DiagnosticEntry) {
        let _ = self.tx.send(entry);
    }

    /// Subscribe to entries
    ///
    /// The receiver uses a ring buffer, so if a subscriber falls too far
    /// behind, it will receive a `Lagged` error and miss some entries.
    pub fn subscribe(&self) -> broadcast::Receiver<DiagnosticEntry> {
        self.tx.subscribe()
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::negotiation::ConnectionState;

    fn state_changed() -> DiagnosticEntry {
        DiagnosticEntry::new(
            "s1",
            DiagnosticEvent::StateChanged {
                from: ConnectionState::New,
                to: ConnectionState::Negotiating,
            },
        )
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(state_changed());

        let entry = rx.recv().await.unwrap();
        assert_eq!(entry.session_id, "s1");
        assert!(matches!(entry.event, DiagnosticEvent::StateChanged { .. }));
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.clone().subscribe();

        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(DiagnosticEntry::new(
            "s1",
            DiagnosticEvent::Error {
                kind: "peer".to_string(),
                message: "test message".to_string(),
            },
        ));

        let entry1 = rx1.recv().await.unwrap();
        let entry2 = rx2.recv().await.unwrap();

        assert!(matches!(entry1.event, DiagnosticEvent::Error { .. }));
        assert_eq!(entry1, entry2);
    }

    #[test]
    fn test_no_subscribers() {
        let bus = EventBus::with_capacity(0);
        assert_eq!(bus.subscriber_count(), 0);

        // Should not panic when publishing with no subscribers
        bus.publish(state_changed());
    }
}
