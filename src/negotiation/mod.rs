//! Counter-side negotiation
//!
//! - `buffer`: remote candidates that arrive before the answer
//! - `machine`: the offer/answer state machine for one session
//! - `session`: single-owner actor around one machine
//! - `manager`: many concurrent sessions keyed by id

pub mod buffer;
pub mod machine;
pub mod manager;
pub mod session;

pub use buffer::{CandidateBuffer, DrainFailure, Drained};
pub use machine::NegotiationStateMachine;
pub use manager::{SessionInfo, SessionManager, MAX_SESSIONS};
pub use session::{CounterSession, SessionEvents};

use serde::{Deserialize, Serialize};
use typeshare::typeshare;

/// Negotiation state of a session
#[typeshare]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    New,
    Negotiating,
    Connected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        self == ConnectionState::Closed
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::New => write!(f, "new"),
            ConnectionState::Negotiating => write!(f, "negotiating"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Failed => write!(f, "failed"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}
