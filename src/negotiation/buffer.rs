//! Early remote candidate buffering
//!
//! Candidates that arrive before the remote description is applied cannot be
//! handed to the peer connection yet. They are held here in arrival order and
//! applied once, right after the answer.

use tracing::{debug, warn};

use crate::error::NegotiationError;
use crate::peer::PeerHandle;
use crate::signaling::{IceCandidate, PeerId};

/// Counts from one drain
///
/// `discarded` covers candidates from other senders as well as those left
/// behind a rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Drained {
    pub applied: usize,
    pub discarded: usize,
}

/// A drain that stopped at a rejected candidate
#[derive(Debug)]
pub struct DrainFailure {
    pub drained: Drained,
    pub error: NegotiationError,
}

#[derive(Debug)]
struct Pending {
    from: PeerId,
    candidate: IceCandidate,
}

#[derive(Debug)]
enum BufferState {
    Collecting(Vec<Pending>),
    Drained,
}

/// Ordered, drain-once candidate queue
#[derive(Debug)]
pub struct CandidateBuffer {
    state: BufferState,
}

impl Default for CandidateBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self {
            state: BufferState::Collecting(Vec::new()),
        }
    }

    /// Queue a candidate sent by `from`
    ///
    /// Returns false once the buffer has been drained; the caller applies
    /// the candidate directly instead.
    pub fn append(&mut self, from: PeerId, candidate: IceCandidate) -> bool {
        match &mut self.state {
            BufferState::Collecting(pending) => {
                pending.push(Pending { from, candidate });
                true
            }
            BufferState::Drained => false,
        }
    }

    pub fn len(&self) -> usize {
        match &self.state {
            BufferState::Collecting(pending) => pending.len(),
            BufferState::Drained => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_drained(&self) -> bool {
        matches!(self.state, BufferState::Drained)
    }

    /// Drop everything without applying it
    pub fn discard(&mut self) -> usize {
        match std::mem::replace(&mut self.state, BufferState::Drained) {
            BufferState::Collecting(pending) => pending.len(),
            BufferState::Drained => 0,
        }
    }

    /// Apply the candidates sent by `remote` to `handle` in arrival order
    ///
    /// Candidates from any other sender are skipped. Stops at the first
    /// rejection and discards the remainder. The buffer is marked drained
    /// before the first candidate is applied, so a second call (or a
    /// cancelled first one) never applies anything again.
    pub async fn drain_into(
        &mut self,
        handle: &dyn PeerHandle,
        remote: &PeerId,
    ) -> std::result::Result<Drained, DrainFailure> {
        let pending = match std::mem::replace(&mut self.state, BufferState::Drained) {
            BufferState::Collecting(pending) => pending,
            BufferState::Drained => {
                debug!("Candidate buffer already drained");
                return Ok(Drained::default());
            }
        };

        let total = pending.len();
        let mut drained = Drained::default();
        for (index, entry) in pending.into_iter().enumerate() {
            if entry.from != *remote {
                debug!("Skipping buffered candidate from {} (remote: {})", entry.from, remote);
                drained.discarded += 1;
                continue;
            }
            if let Err(e) = handle.add_ice_candidate(entry.candidate).await {
                let remaining = total - index - 1;
                drained.discarded += remaining;
                warn!(
                    "Buffered candidate {} rejected, discarding {} remaining: {}",
                    index, remaining, e
                );
                let reason = match e {
                    NegotiationError::CandidateApplicationFailed(reason) => reason,
                    other => other.to_string(),
                };
                let error = NegotiationError::CandidateApplicationFailed(format!(
                    "buffered candidate {} of {}: {} ({} discarded)",
                    index + 1,
                    total,
                    reason,
                    remaining
                ));
                return Err(DrainFailure { drained, error });
            }
            drained.applied += 1;
        }

        debug!(
            "Applied {} buffered candidates, skipped {}",
            drained.applied, drained.discarded
        );
        Ok(drained)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{MockPeerFactory, PeerCall, PeerConfig, PeerEventSink, PeerFactory};
    use tokio::sync::mpsc;

    fn kiosk() -> PeerId {
        PeerId::from("K1")
    }

    async fn mock_handle(
        factory: &MockPeerFactory,
    ) -> std::sync::Arc<dyn PeerHandle> {
        let (tx, _rx) = mpsc::unbounded_channel();
        factory
            .create(PeerConfig::default(), PeerEventSink::new(1, tx))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_drains_in_arrival_order_once() {
        let factory = MockPeerFactory::new();
        let handle = mock_handle(&factory).await;
        let mut buffer = CandidateBuffer::new();

        assert!(buffer.append(kiosk(), IceCandidate::new("a")));
        assert!(buffer.append(kiosk(), IceCandidate::new("b")));
        assert!(buffer.append(kiosk(), IceCandidate::new("c")));
        assert_eq!(buffer.len(), 3);

        let drained = buffer.drain_into(handle.as_ref(), &kiosk()).await.unwrap();
        assert_eq!(drained, Drained { applied: 3, discarded: 0 });
        assert!(buffer.is_drained());

        let again = buffer.drain_into(handle.as_ref(), &kiosk()).await.unwrap();
        assert_eq!(again, Drained::default());

        let control = factory.last().unwrap();
        let applied: Vec<String> = control
            .applied_candidates()
            .into_iter()
            .map(|c| c.candidate)
            .collect();
        assert_eq!(applied, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_stops_at_first_rejection() {
        let factory = MockPeerFactory::new().reject_candidate("b");
        let handle = mock_handle(&factory).await;
        let mut buffer = CandidateBuffer::new();
        for c in ["a", "b", "c"] {
            buffer.append(kiosk(), IceCandidate::new(c));
        }

        let failure = match buffer.drain_into(handle.as_ref(), &kiosk()).await {
            Ok(drained) => panic!("drain succeeded: {:?}", drained),
            Err(failure) => failure,
        };
        assert_eq!(failure.error.kind(), "candidate_application_failed");
        assert!(failure.error.to_string().contains("1 discarded"));
        assert_eq!(failure.drained, Drained { applied: 1, discarded: 1 });
        assert!(buffer.is_drained());

        let control = factory.last().unwrap();
        assert_eq!(
            control.count(|c| matches!(c, PeerCall::AddIceCandidate(_))),
            2
        );
    }

    #[test]
    fn test_append_refused_after_drain() {
        let mut buffer = CandidateBuffer::new();
        buffer.append(kiosk(), IceCandidate::new("a"));
        assert_eq!(buffer.discard(), 1);
        assert!(!buffer.append(kiosk(), IceCandidate::new("b")));
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_skips_candidates_from_other_senders() {
        let factory = MockPeerFactory::new().reject_candidate("from-k9");
        let handle = mock_handle(&factory).await;
        let mut buffer = CandidateBuffer::new();
        buffer.append(PeerId::from("K9"), IceCandidate::new("from-k9"));
        buffer.append(kiosk(), IceCandidate::new("from-k1"));

        let drained = buffer.drain_into(handle.as_ref(), &kiosk()).await.unwrap();
        assert_eq!(drained, Drained { applied: 1, discarded: 1 });

        let control = factory.last().unwrap();
        let applied: Vec<String> = control
            .applied_candidates()
            .into_iter()
            .map(|c| c.candidate)
            .collect();
        assert_eq!(applied, vec!["from-k1"]);
    }
}
