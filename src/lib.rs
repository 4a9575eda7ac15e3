//! kiosk-link - counter-to-kiosk WebRTC negotiation
//!
//! This crate drives the initiator ("counter") side of a peer-to-peer data
//! connection: it pairs with a kiosk over a signaling channel, exchanges
//! offer/answer and ICE candidates in a strictly sequenced order, and
//! exposes the resulting data channel as a send/receive text surface.

pub mod config;
pub mod datachannel;
pub mod error;
pub mod events;
pub mod kiosk;
pub mod negotiation;
pub mod peer;
pub mod signaling;

pub use error::{NegotiationError, Result};
