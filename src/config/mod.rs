//! Configuration for negotiation sessions
//!
//! `NegotiationConfig` is plain serde data; `ConfigStore` keeps it in a
//! JSON file with a lock-free in-memory cache.

pub mod schema;
pub mod store;

pub use schema::{
    NegotiationConfig, SessionErrorPolicy, DEFAULT_DATA_CHANNEL_LABEL, DEFAULT_SESSION_KEY,
};
pub use store::{ConfigChange, ConfigStore};
