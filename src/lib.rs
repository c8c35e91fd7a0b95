//! Sweep Push Client Library
//!
//! Resilient client for the sweep service's push channel: keeps a
//! wallet-scoped WebSocket alive across failures, replays topic
//! subscriptions after every reconnect, and fans pushed events out to
//! independent listeners.

pub mod config;
pub mod error;
pub mod facade;
pub mod network;
pub mod telemetry;
pub mod utils;

// Re-export main types
pub use config::{AppConfig, PushConfig};
pub use error::PushError;
pub use network::{
    ConnectionManager, ConnectionState, Event, EventBus, EventKind, MemoryTransport, Topic,
    WebSocketTransport,
};
