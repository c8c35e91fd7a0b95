//! Network module
//!
//! Push channel plumbing: envelope codec, backoff, heartbeat, subscription
//! registry, event fan-out, transports and the connection manager.

pub mod backoff;
pub mod connection;
pub mod envelope;
pub mod event_bus;
pub mod heartbeat;
pub mod subscriptions;
pub mod transport;
pub mod websocket;

pub use backoff::BackoffPolicy;
pub use connection::{ConnectionManager, ConnectionState, ManagerSnapshot};
pub use envelope::{ClientCommand, Envelope, InboundKind};
pub use event_bus::{
    Disposer, ErrorSink, Event, EventBus, EventKind, EventStream, ListenerFailure, PushMessage,
};
pub use subscriptions::{Topic, TopicKind};
pub use transport::{MemoryPeer, MemoryServer, MemoryTransport, Transport};
pub use websocket::WebSocketTransport;
