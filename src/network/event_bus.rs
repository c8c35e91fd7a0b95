//! Event Bus for push-channel events
//!
//! Two ways to observe the connection:
//! - callback listeners registered per [`EventKind`], invoked synchronously
//!   on the connection task with per-listener failure isolation
//! - a broadcast stream ([`EventStream`]) carrying every event

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::network::connection::ConnectionState;
use crate::network::envelope::{Envelope, InboundKind};
use crate::telemetry::metrics;

/// Payload of a server-pushed event
#[derive(Debug, Clone, PartialEq)]
pub struct PushMessage {
    pub data: Value,
    /// Sender clock, not used for ordering
    pub timestamp: i64,
}

impl PushMessage {
    /// Deserialize the payload into a caller-defined type
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.data)
    }
}

/// Events delivered to consumers
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    // Connection events
    Connected,
    Error { message: String },
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },

    // Server-pushed events
    TransactionUpdate(PushMessage),
    PriceUpdate(PushMessage),
    SubscriptionTrigger(PushMessage),
    ConsolidationUpdate(PushMessage),
}

impl Event {
    /// Map a decoded envelope to an event; unknown types yield `None`
    pub fn from_envelope(envelope: Envelope<Value>) -> Option<Self> {
        let kind = InboundKind::from_wire(&envelope.message_type)?;
        let msg = PushMessage {
            data: envelope.data,
            timestamp: envelope.timestamp,
        };
        Some(match kind {
            InboundKind::TransactionUpdate => Event::TransactionUpdate(msg),
            InboundKind::PriceUpdate => Event::PriceUpdate(msg),
            InboundKind::SubscriptionTrigger => Event::SubscriptionTrigger(msg),
            InboundKind::ConsolidationUpdate => Event::ConsolidationUpdate(msg),
        })
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Event::Connected => EventKind::Connected,
            Event::Error { .. } => EventKind::Error,
            Event::StateChanged { .. } => EventKind::StateChange,
            Event::TransactionUpdate(_) => EventKind::TransactionUpdate,
            Event::PriceUpdate(_) => EventKind::PriceUpdate,
            Event::SubscriptionTrigger(_) => EventKind::SubscriptionTrigger,
            Event::ConsolidationUpdate(_) => EventKind::ConsolidationUpdate,
        }
    }

    pub fn push_message(&self) -> Option<&PushMessage> {
        match self {
            Event::TransactionUpdate(m)
            | Event::PriceUpdate(m)
            | Event::SubscriptionTrigger(m)
            | Event::ConsolidationUpdate(m) => Some(m),
            _ => None,
        }
    }
}

/// Listener key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Error,
    StateChange,
    TransactionUpdate,
    PriceUpdate,
    SubscriptionTrigger,
    ConsolidationUpdate,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Connected => "connected",
            EventKind::Error => "error",
            EventKind::StateChange => "state_change",
            EventKind::TransactionUpdate => InboundKind::TransactionUpdate.as_str(),
            EventKind::PriceUpdate => InboundKind::PriceUpdate.as_str(),
            EventKind::SubscriptionTrigger => InboundKind::SubscriptionTrigger.as_str(),
            EventKind::ConsolidationUpdate => InboundKind::ConsolidationUpdate.as_str(),
        }
    }
}

impl From<InboundKind> for EventKind {
    fn from(kind: InboundKind) -> Self {
        match kind {
            InboundKind::TransactionUpdate => EventKind::TransactionUpdate,
            InboundKind::PriceUpdate => EventKind::PriceUpdate,
            InboundKind::SubscriptionTrigger => EventKind::SubscriptionTrigger,
            InboundKind::ConsolidationUpdate => EventKind::ConsolidationUpdate,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type ListenerId = u64;

/// Callback listener. Returning `Err` (or panicking) is reported to the
/// bus's [`ErrorSink`] and never reaches the dispatcher.
pub type Listener = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

/// A listener that failed while handling an event
#[derive(Debug, Clone)]
pub struct ListenerFailure {
    pub kind: EventKind,
    pub listener: ListenerId,
    pub message: String,
}

/// Destination for listener failures
pub trait ErrorSink: Send + Sync {
    fn report(&self, failure: &ListenerFailure);
}

impl<F> ErrorSink for F
where
    F: Fn(&ListenerFailure) + Send + Sync,
{
    fn report(&self, failure: &ListenerFailure) {
        self(failure)
    }
}

/// Default sink: log and count
#[derive(Debug, Default, Clone, Copy)]
pub struct LogErrorSink;

impl ErrorSink for LogErrorSink {
    fn report(&self, failure: &ListenerFailure) {
        error!(
            "Listener {} failed on '{}': {}",
            failure.listener, failure.kind, failure.message
        );
        metrics::record_listener_failure();
    }
}

#[derive(Default)]
struct ListenerTable {
    by_kind: DashMap<EventKind, Vec<(ListenerId, Listener)>>,
    next_id: AtomicU64,
}

impl ListenerTable {
    fn remove(&self, kind: EventKind, id: ListenerId) -> bool {
        match self.by_kind.get_mut(&kind) {
            Some(mut entry) => {
                let before = entry.len();
                entry.retain(|(existing, _)| *existing != id);
                before != entry.len()
            }
            None => false,
        }
    }

    fn snapshot(&self, kind: EventKind) -> Vec<(ListenerId, Listener)> {
        self.by_kind
            .get(&kind)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }
}

/// Handle returned by [`EventBus::on`]; removes exactly that listener
#[must_use = "dropping a Disposer keeps the listener registered"]
pub struct Disposer {
    table: Weak<ListenerTable>,
    kind: EventKind,
    id: ListenerId,
}

impl Disposer {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Remove the listener. Returns false if it was already gone.
    pub fn dispose(self) -> bool {
        match self.table.upgrade() {
            Some(table) => table.remove(self.kind, self.id),
            None => false,
        }
    }
}

impl fmt::Debug for Disposer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disposer")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .finish()
    }
}

/// Type-indexed fan-out plus broadcast stream
#[derive(Clone)]
pub struct EventBus {
    listeners: Arc<ListenerTable>,
    /// Broadcast sender
    sender: broadcast::Sender<Event>,
    /// Channel capacity
    capacity: usize,
    sink: Arc<dyn ErrorSink>,
}

impl EventBus {
    /// Create a new event bus with the given stream capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            listeners: Arc::new(ListenerTable::default()),
            sender,
            capacity,
            sink: Arc::new(LogErrorSink),
        }
    }

    /// Replace the sink receiving listener failures
    pub fn with_error_sink(mut self, sink: impl ErrorSink + 'static) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    /// Register a listener for one event kind
    pub fn on<F>(&self, kind: EventKind, listener: F) -> Disposer
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.listeners.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .by_kind
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        debug!("Listener {} registered for '{}'", id, kind);
        Disposer {
            table: Arc::downgrade(&self.listeners),
            kind,
            id,
        }
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.by_kind.get(&kind).map(|e| e.len()).unwrap_or(0)
    }

    /// Deliver an event to every listener registered for its kind and to
    /// stream subscribers. Returns the number of listeners that handled it
    /// without failing.
    ///
    /// Listeners added or removed while dispatching take effect on the next
    /// event; this pass runs over the set captured at entry.
    pub fn dispatch(&self, event: &Event) -> usize {
        let kind = event.kind();
        let snapshot = self.listeners.snapshot(kind);
        let mut delivered = 0;

        for (id, listener) in snapshot {
            let outcome = catch_unwind(AssertUnwindSafe(|| listener(event)));
            let message = match outcome {
                Ok(Ok(())) => {
                    delivered += 1;
                    continue;
                }
                Ok(Err(e)) => format!("{:#}", e),
                Err(panic) => format!("panicked: {}", panic_message(panic.as_ref())),
            };
            self.sink.report(&ListenerFailure {
                kind,
                listener: id,
                message,
            });
        }

        if self.sender.send(event.clone()).is_err() {
            // No stream subscribers
            trace!("No stream receivers for '{}'", kind);
        }
        delivered
    }

    /// Subscribe to the raw broadcast stream
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Attach a named stream consumer
    pub fn stream(&self, name: &str) -> EventStream {
        EventStream {
            receiver: self.sender.subscribe(),
            name: name.to_string(),
        }
    }

    /// Run an async handler over every event on its own task.
    ///
    /// Handler errors go to the error sink like listener failures. The task
    /// ends once every bus handle is dropped and yields the number of events
    /// it handled successfully.
    pub fn spawn_handler<F, Fut>(&self, name: &str, mut handler: F) -> JoinHandle<u64>
    where
        F: FnMut(Event) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send,
    {
        let id = self.listeners.next_id.fetch_add(1, Ordering::Relaxed);
        let mut stream = self.stream(name);
        let sink = self.sink.clone();

        tokio::spawn(async move {
            debug!("Event handler '{}' started as listener {}", stream.name, id);
            let mut handled = 0;
            while let Some(event) = stream.next().await {
                let kind = event.kind();
                match handler(event).await {
                    Ok(()) => handled += 1,
                    Err(e) => sink.report(&ListenerFailure {
                        kind,
                        listener: id,
                        message: format!("{:#}", e),
                    }),
                }
            }
            debug!("Event handler '{}' stopped after {} events", stream.name, handled);
            handled
        })
    }

    /// Get number of active stream receivers
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Get stream channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Stream view of the bus
pub struct EventStream {
    receiver: broadcast::Receiver<Event>,
    name: String,
}

impl EventStream {
    /// Wait for the next event; `None` once the bus is gone
    pub async fn next(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    warn!("Event stream '{}' lagged by {} events", self.name, count);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed for stream '{}'", self.name);
                    return None;
                }
            }
        }
    }

    /// Try to receive event without blocking
    pub fn try_next(&mut self) -> Option<Event> {
        self.receiver.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    fn price(v: f64) -> Event {
        Event::PriceUpdate(PushMessage {
            data: json!({ "usd": v }),
            timestamp: 1,
        })
    }

    #[test]
    fn test_failing_listener_is_isolated() {
        let failures = Arc::new(Mutex::new(Vec::new()));
        let sink_failures = failures.clone();
        let bus = EventBus::new(8).with_error_sink(move |f: &ListenerFailure| {
            sink_failures.lock().push(f.clone());
        });

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_ok = seen.clone();
        let _bad = bus.on(EventKind::PriceUpdate, |_| anyhow::bail!("boom"));
        let _panicky = bus.on(EventKind::PriceUpdate, |_| panic!("listener exploded"));
        let _good = bus.on(EventKind::PriceUpdate, move |event| {
            seen_ok.lock().push(event.clone());
            Ok(())
        });

        assert_eq!(bus.dispatch(&price(1.0)), 1);
        assert_eq!(seen.lock().as_slice(), &[price(1.0)]);

        let failures = failures.lock();
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].message, "boom");
        assert!(failures[1].message.contains("listener exploded"));
    }

    #[test]
    fn test_disposer_removes_only_its_listener() {
        let bus = EventBus::new(8);
        let count = Arc::new(AtomicU64::new(0));

        let c1 = count.clone();
        let first = bus.on(EventKind::Connected, move |_| {
            c1.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let c2 = count.clone();
        let _second = bus.on(EventKind::Connected, move |_| {
            c2.fetch_add(10, Ordering::SeqCst);
            Ok(())
        });

        assert!(first.dispose());
        assert_eq!(bus.listener_count(EventKind::Connected), 1);
        bus.dispatch(&Event::Connected);
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_registration_during_dispatch_applies_next_time() {
        let bus = EventBus::new(8);
        let calls = Arc::new(AtomicU64::new(0));

        let inner_bus = bus.clone();
        let inner_calls = calls.clone();
        let _outer = bus.on(EventKind::Connected, move |_| {
            let c = inner_calls.clone();
            let _added = inner_bus.on(EventKind::Connected, move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            Ok(())
        });

        assert_eq!(bus.dispatch(&Event::Connected), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(bus.listener_count(EventKind::Connected), 2);
    }

    #[test]
    fn test_dispatch_without_listeners() {
        let bus = EventBus::new(8);
        assert_eq!(bus.dispatch(&price(2.0)), 0);
    }

    #[test]
    fn test_unknown_envelope_type_has_no_event() {
        let env = Envelope {
            message_type: "unknown_future_type".to_string(),
            data: json!({}),
            timestamp: 0,
        };
        assert!(Event::from_envelope(env).is_none());
    }

    #[test]
    fn test_push_message_decode() {
        #[derive(serde::Deserialize)]
        struct Tick {
            usd: f64,
        }
        let event = price(3.5);
        let tick: Tick = event.push_message().unwrap().decode().unwrap();
        assert_eq!(tick.usd, 3.5);
    }

    #[test]
    fn test_every_inbound_kind_routes_to_its_event_kind() {
        for kind in InboundKind::ALL {
            let env = Envelope {
                message_type: kind.as_str().to_string(),
                data: json!({ "n": 1 }),
                timestamp: 7,
            };
            let event = Event::from_envelope(env).unwrap();
            assert_eq!(event.kind(), EventKind::from(kind));
            assert_eq!(event.kind().as_str(), kind.as_str());
            assert_eq!(event.push_message().unwrap().timestamp, 7);
        }
    }

    #[tokio::test]
    async fn test_spawned_handler_counts_and_reports_failures() {
        let failures = Arc::new(Mutex::new(Vec::new()));
        let sink_failures = failures.clone();
        let bus = EventBus::new(8).with_error_sink(move |f: &ListenerFailure| {
            sink_failures.lock().push(f.clone());
        });

        let task = bus.spawn_handler("printer", |event| async move {
            match event {
                Event::Error { message } => anyhow::bail!("cannot print {}", message),
                _ => Ok(()),
            }
        });

        bus.dispatch(&Event::Connected);
        bus.dispatch(&Event::Error {
            message: "reset".to_string(),
        });
        bus.dispatch(&price(1.0));
        drop(bus);

        assert_eq!(task.await.unwrap(), 2);
        let failures = failures.lock();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].kind, EventKind::Error);
        assert_eq!(failures[0].message, "cannot print reset");
    }

    #[tokio::test]
    async fn test_stream_receives_all_kinds() {
        let bus = EventBus::new(10);
        let mut s1 = bus.stream("one");
        let mut s2 = bus.stream("two");

        bus.dispatch(&Event::Connected);
        bus.dispatch(&price(1.0));

        assert_eq!(s1.next().await, Some(Event::Connected));
        assert_eq!(s1.next().await, Some(price(1.0)));
        assert_eq!(s2.try_next(), Some(Event::Connected));
        assert_eq!(bus.receiver_count(), 2);
    }
}
