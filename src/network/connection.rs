//! Push Connection Manager
//!
//! Keeps one wallet-scoped push channel alive across network failures.
//!
//! All connection state lives on a single actor task. [`ConnectionManager`]
//! is a cheap, cloneable handle that forwards commands to it, so `connect`,
//! `disconnect` and `subscribe` never block; results surface later through
//! state-change and event listeners.
//!
//! Lifecycle:
//! - Disconnected --connect--> Connecting --open--> Connected
//! - Connected --close(1000)--> Disconnected (terminal)
//! - Connected --close(other)/fault--> Disconnected, retry after backoff
//! - Error --no close within [`FAULT_CLOSE_GRACE`]--> treated as close(1006)
//! - any --disconnect--> Disconnected, attempt counter reset

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, Sleep};
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::config::PushConfig;
use crate::error::PushError;
use crate::network::backoff::{BackoffPolicy, ReconnectTimer};
use crate::network::envelope::{self, ClientCommand};
use crate::network::event_bus::{Disposer, Event, EventBus, EventKind, EventStream};
use crate::network::heartbeat::HeartbeatMonitor;
use crate::network::subscriptions::{SubscriptionRegistry, Topic};
use crate::network::transport::{
    Transport, TransportEvent, TransportLink, ABNORMAL_CLOSURE, CLIENT_DISCONNECT_REASON,
    NORMAL_CLOSURE,
};
use crate::network::websocket::WebSocketTransport;
use crate::telemetry::metrics;

/// How long a faulted link may stay open before it is treated as closed
pub const FAULT_CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Push channel connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    pub fn code(&self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Error => 3,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "DISCONNECTED"),
            ConnectionState::Connecting => write!(f, "CONNECTING"),
            ConnectionState::Connected => write!(f, "CONNECTED"),
            ConnectionState::Error => write!(f, "ERROR"),
        }
    }
}

/// Point-in-time view of the actor, for diagnostics and tests
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerSnapshot {
    pub state: ConnectionState,
    pub identity: Option<String>,
    pub topics: Vec<Topic>,
    /// Reconnect attempts since the last successful connect
    pub attempts: u32,
    pub heartbeat_active: bool,
    /// Pings sent on the current connection
    pub pings_sent: u64,
    /// Delay of the pending reconnect, if one is scheduled
    pub reconnect_pending: Option<Duration>,
}

enum Command {
    Connect(String),
    Disconnect,
    Subscribe(Topic),
    Unsubscribe(Topic),
    Send { message_type: String, data: Value },
    Snapshot(oneshot::Sender<ManagerSnapshot>),
    Shutdown,
}

/// Build `<endpoint>?wallet=<identity>`, keeping any other query parameters
pub fn build_endpoint(base: &str, wallet: &str) -> Result<Url, PushError> {
    let mut url = Url::parse(base)
        .map_err(|e| PushError::InvalidEndpoint(format!("{}: {}", base, e)))?;
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != "wallet")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    url.query_pairs_mut()
        .clear()
        .extend_pairs(kept)
        .append_pair("wallet", wallet);
    Ok(url)
}

/// Handle to a push connection actor
#[derive(Clone)]
pub struct ConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
    state: Arc<RwLock<ConnectionState>>,
    bus: EventBus,
}

impl ConnectionManager {
    /// Spawn a manager on the current Tokio runtime
    pub fn new(config: &PushConfig, transport: impl Transport) -> Result<Self, PushError> {
        Self::with_event_bus(config, transport, EventBus::new(config.event_capacity))
    }

    /// Spawn a manager over the WebSocket transport
    pub fn with_websocket(config: &PushConfig) -> Result<Self, PushError> {
        let transport = WebSocketTransport::new().with_connect_timeout(config.connect_timeout());
        Self::new(config, transport)
    }

    /// Spawn a manager publishing into a caller-provided bus. Fails on an
    /// invalid config or outside a Tokio runtime.
    pub fn with_event_bus(
        config: &PushConfig,
        transport: impl Transport,
        bus: EventBus,
    ) -> Result<Self, PushError> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| PushError::NoRuntime)?;
        Ok(Self::spawn_on(&runtime, config, Arc::new(transport), bus))
    }

    pub(crate) fn spawn_on(
        runtime: &tokio::runtime::Handle,
        config: &PushConfig,
        transport: Arc<dyn Transport>,
        bus: EventBus,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(RwLock::new(ConnectionState::Disconnected));

        let actor = ConnectionActor {
            endpoint: config.endpoint.clone(),
            transport,
            policy: BackoffPolicy::from_config(&config.backoff),
            heartbeat_period: config.heartbeat_interval(),
            registry: SubscriptionRegistry::new(),
            bus: bus.clone(),
            state: state.clone(),
            phase: Phase::Idle,
            attempts: 0,
            commands: rx,
        };
        runtime.spawn(actor.run());

        Self {
            commands: tx,
            state,
            bus,
        }
    }

    fn submit(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!("Push connection manager has shut down; command ignored");
        }
    }

    /// Open the channel for `wallet`, or re-announce it if already connected
    pub fn connect(&self, wallet: impl Into<String>) {
        self.submit(Command::Connect(wallet.into()));
    }

    /// Close the channel and cancel any pending reconnect
    pub fn disconnect(&self) {
        self.submit(Command::Disconnect);
    }

    pub fn subscribe(&self, topic: Topic) {
        self.submit(Command::Subscribe(topic));
    }

    pub fn unsubscribe(&self, topic: Topic) {
        self.submit(Command::Unsubscribe(topic));
    }

    pub fn subscribe_sweep(&self, sweep_id: impl Into<String>) {
        self.subscribe(Topic::sweep(sweep_id));
    }

    pub fn unsubscribe_sweep(&self, sweep_id: impl Into<String>) {
        self.unsubscribe(Topic::sweep(sweep_id));
    }

    pub fn subscribe_consolidation(&self, consolidation_id: impl Into<String>) {
        self.subscribe(Topic::consolidation(consolidation_id));
    }

    pub fn unsubscribe_consolidation(&self, consolidation_id: impl Into<String>) {
        self.unsubscribe(Topic::consolidation(consolidation_id));
    }

    /// Send an arbitrary envelope; dropped with a warning unless connected
    pub fn send(&self, message_type: impl Into<String>, data: Value) {
        self.submit(Command::Send {
            message_type: message_type.into(),
            data,
        });
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Register a listener for one event kind
    pub fn on<F>(&self, kind: EventKind, listener: F) -> Disposer
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.bus.on(kind, listener)
    }

    /// Called with `(from, to)` on every actual state transition
    pub fn on_state_change<F>(&self, handler: F) -> Disposer
    where
        F: Fn(ConnectionState, ConnectionState) + Send + Sync + 'static,
    {
        self.bus.on(EventKind::StateChange, move |event| {
            if let Event::StateChanged { from, to } = event {
                handler(*from, *to);
            }
            Ok(())
        })
    }

    /// Stream of every event the manager dispatches
    pub fn events(&self, name: &str) -> EventStream {
        self.bus.stream(name)
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    /// Ask the actor for its current internals
    pub async fn snapshot(&self) -> Result<ManagerSnapshot, PushError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Snapshot(tx))
            .map_err(|_| PushError::Closed)?;
        rx.await.map_err(|_| PushError::Closed)
    }

    /// Disconnect, forget all subscriptions and stop the actor
    pub fn shutdown(&self) {
        self.submit(Command::Shutdown);
    }
}

/// What the actor is doing. Resources live inside the phase that needs them:
/// the heartbeat only exists while connected, the reconnect timer only while
/// retrying.
enum Phase {
    Idle,
    Connecting { link: TransportLink },
    Connected {
        link: TransportLink,
        heartbeat: HeartbeatMonitor,
    },
    /// Transport reported an error and is expected to close. If no close
    /// arrives within the grace period the link is abandoned.
    Faulted {
        link: TransportLink,
        grace: Pin<Box<Sleep>>,
    },
    Retrying { timer: ReconnectTimer },
}

impl Phase {
    fn state(&self) -> ConnectionState {
        match self {
            Phase::Idle | Phase::Retrying { .. } => ConnectionState::Disconnected,
            Phase::Connecting { .. } => ConnectionState::Connecting,
            Phase::Connected { .. } => ConnectionState::Connected,
            Phase::Faulted { .. } => ConnectionState::Error,
        }
    }

    fn into_link(self) -> Option<TransportLink> {
        match self {
            Phase::Connecting { link }
            | Phase::Connected { link, .. }
            | Phase::Faulted { link, .. } => Some(link),
            Phase::Idle | Phase::Retrying { .. } => None,
        }
    }

    fn heartbeat(&self) -> Option<&HeartbeatMonitor> {
        match self {
            Phase::Connected { heartbeat, .. } => Some(heartbeat),
            _ => None,
        }
    }
}

enum Wake {
    Transport(TransportEvent),
    Heartbeat(ClientCommand),
    ReconnectDue,
}

async fn next_wake(phase: &mut Phase) -> Wake {
    match phase {
        Phase::Connecting { link } => Wake::Transport(link.next_event().await),
        Phase::Faulted { link, grace } => {
            tokio::select! {
                biased;

                event = link.next_event() => Wake::Transport(event),
                _ = grace.as_mut() => Wake::Transport(TransportEvent::Closed {
                    code: ABNORMAL_CLOSURE,
                    reason: "no close after transport error".to_string(),
                }),
            }
        }
        Phase::Connected { link, heartbeat } => {
            tokio::select! {
                event = link.next_event() => Wake::Transport(event),
                ping = heartbeat.tick() => Wake::Heartbeat(ping),
            }
        }
        Phase::Retrying { timer } => {
            timer.await;
            Wake::ReconnectDue
        }
        Phase::Idle => std::future::pending().await,
    }
}

struct ConnectionActor {
    endpoint: String,
    transport: Arc<dyn Transport>,
    policy: BackoffPolicy,
    heartbeat_period: Duration,
    registry: SubscriptionRegistry,
    bus: EventBus,
    state: Arc<RwLock<ConnectionState>>,
    phase: Phase,
    attempts: u32,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl ConnectionActor {
    async fn run(mut self) {
        debug!("Push connection actor started");
        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                wake = next_wake(&mut self.phase) => self.handle_wake(wake),
            }
        }
        self.teardown();
        debug!("Push connection actor stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(wallet) => self.connect(wallet),
            Command::Disconnect => self.disconnect(),
            Command::Subscribe(topic) => {
                let command = self.registry.subscribe(topic);
                if self.is_connected() {
                    self.send_command(&command);
                } else {
                    debug!("Queued {} for replay on connect", command.name());
                }
            }
            Command::Unsubscribe(topic) => {
                let command = self.registry.unsubscribe(&topic);
                if self.is_connected() {
                    self.send_command(&command);
                }
            }
            Command::Send { message_type, data } => self.send_raw(&message_type, data),
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown => self.teardown(),
        }
    }

    fn handle_wake(&mut self, wake: Wake) {
        match wake {
            Wake::Transport(TransportEvent::Opened) => self.on_open(),
            Wake::Transport(TransportEvent::Message(text)) => self.on_message(&text),
            Wake::Transport(TransportEvent::Error(description)) => self.on_fault(description),
            Wake::Transport(TransportEvent::Closed { code, reason }) => {
                self.on_close(code, &reason)
            }
            Wake::Heartbeat(ping) => {
                trace!("Heartbeat ping");
                self.send_command(&ping);
                metrics::record_ping();
            }
            Wake::ReconnectDue => {
                self.phase = Phase::Idle;
                info!("Reconnect attempt {}", self.attempts);
                self.open_transport();
            }
        }
    }

    fn is_connected(&self) -> bool {
        matches!(self.phase, Phase::Connected { .. })
    }

    fn connect(&mut self, wallet: String) {
        match self.phase {
            Phase::Connected { .. } => {
                self.registry.set_identity(wallet);
                if let Some(command) = self.registry.wallet_command() {
                    self.send_command(&command);
                }
            }
            Phase::Connecting { .. } => {
                if self.registry.identity() != Some(wallet.as_str()) {
                    warn!("Connect ignored, handshake for another wallet already in progress");
                } else {
                    debug!("Connect ignored, handshake already in progress");
                }
            }
            Phase::Idle | Phase::Faulted { .. } | Phase::Retrying { .. } => {
                self.registry.set_identity(wallet);
                self.open_transport();
            }
        }
    }

    fn disconnect(&mut self) {
        info!("Disconnecting push channel");
        if let Some(link) = std::mem::replace(&mut self.phase, Phase::Idle).into_link() {
            link.close(NORMAL_CLOSURE, CLIENT_DISCONNECT_REASON);
        }
        self.registry.clear_identity();
        self.attempts = 0;
        self.publish_state(ConnectionState::Disconnected);
    }

    /// Start a connection attempt. Construction failures take the same
    /// path as a fault on an open link.
    fn open_transport(&mut self) {
        // Replacing the phase drops any pending timer or stale link
        if let Some(link) = std::mem::replace(&mut self.phase, Phase::Idle).into_link() {
            link.close(NORMAL_CLOSURE, CLIENT_DISCONNECT_REASON);
        }

        let Some(wallet) = self.registry.identity() else {
            warn!("No wallet identity, not connecting");
            self.publish_state(ConnectionState::Disconnected);
            return;
        };

        self.publish_state(ConnectionState::Connecting);
        let opened =
            build_endpoint(&self.endpoint, wallet).and_then(|url| self.transport.open(&url));
        match opened {
            Ok(link) => self.enter(Phase::Connecting { link }),
            Err(e) => {
                self.on_fault(e.to_string());
                self.schedule_retry();
            }
        }
    }

    fn on_open(&mut self) {
        let link = match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Connecting { link } => link,
            other => {
                debug!("Ignoring open notification while {}", other.state());
                self.phase = other;
                return;
            }
        };

        let heartbeat = HeartbeatMonitor::start(self.heartbeat_period);
        self.attempts = 0;
        self.enter(Phase::Connected { link, heartbeat });
        metrics::record_reconnect_attempts(0);

        let replay = self.registry.replay();
        debug!("Replaying {} subscriptions", replay.len());
        for command in &replay {
            self.send_command(command);
        }

        self.bus.dispatch(&Event::Connected);
    }

    fn on_message(&mut self, text: &str) {
        metrics::record_frame_received();
        let envelope = match envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Discarding undecodable frame ({} bytes): {}", text.len(), e);
                metrics::record_decode_failure();
                return;
            }
        };

        let message_type = envelope.message_type.clone();
        match Event::from_envelope(envelope) {
            Some(event) => {
                let delivered = self.bus.dispatch(&event);
                trace!("'{}' delivered to {} listeners", message_type, delivered);
            }
            None => trace!("Dropping unrouted message type '{}'", message_type),
        }
    }

    fn on_fault(&mut self, description: String) {
        error!("Push channel fault: {}", description);
        metrics::record_error();
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Connecting { link }
            | Phase::Connected { link, .. }
            | Phase::Faulted { link, .. } => {
                let grace = Box::pin(sleep(FAULT_CLOSE_GRACE));
                self.enter(Phase::Faulted { link, grace });
            }
            other => {
                self.phase = other;
                self.publish_state(ConnectionState::Error);
            }
        }
        self.bus.dispatch(&Event::Error {
            message: description,
        });
    }

    fn on_close(&mut self, code: u16, reason: &str) {
        if matches!(self.phase, Phase::Idle | Phase::Retrying { .. }) {
            debug!("Close for an abandoned link ignored");
            return;
        }
        self.phase = Phase::Idle;

        if code == NORMAL_CLOSURE {
            info!("Push channel closed normally ({})", reason);
            self.publish_state(ConnectionState::Disconnected);
        } else {
            warn!("Push channel closed with code {} ({})", code, reason);
            self.schedule_retry();
        }
    }

    /// Arm the reconnect timer. No-op while one is pending.
    fn schedule_retry(&mut self) {
        if matches!(self.phase, Phase::Retrying { .. }) {
            return;
        }

        let timer = ReconnectTimer::schedule(&self.policy, self.attempts);
        warn!(
            "Reconnecting in {:?} (attempt {})",
            timer.delay(),
            self.attempts + 1
        );
        self.attempts = self.attempts.saturating_add(1);
        metrics::record_reconnect_attempts(self.attempts);
        self.enter(Phase::Retrying { timer });
    }

    fn enter(&mut self, phase: Phase) {
        let state = phase.state();
        self.phase = phase;
        self.publish_state(state);
    }

    fn publish_state(&self, next: ConnectionState) {
        let previous = {
            let mut current = self.state.write();
            if *current == next {
                return;
            }
            std::mem::replace(&mut *current, next)
        };
        info!("Push state transition: {} -> {}", previous, next);
        metrics::record_connection_state(next.code());
        self.bus.dispatch(&Event::StateChanged {
            from: previous,
            to: next,
        });
    }

    fn send_command(&self, command: &ClientCommand) {
        match envelope::encode(command) {
            Ok(text) => self.send_text(command.name(), text),
            Err(e) => error!("Failed to encode {}: {}", command.name(), e),
        }
    }

    fn send_raw(&self, message_type: &str, data: Value) {
        match envelope::encode_raw(message_type, data) {
            Ok(text) => self.send_text(message_type, text),
            Err(e) => error!("Failed to encode {}: {}", message_type, e),
        }
    }

    fn send_text(&self, label: &str, text: String) {
        let Phase::Connected { link, .. } = &self.phase else {
            warn!("Not connected, dropping outbound '{}'", label);
            return;
        };
        match link.send_text(text) {
            Ok(()) => {
                debug!("Sent '{}'", label);
                metrics::record_frame_sent();
            }
            Err(e) => warn!("Failed to send '{}': {}", label, e),
        }
    }

    fn snapshot(&self) -> ManagerSnapshot {
        ManagerSnapshot {
            state: self.phase.state(),
            identity: self.registry.identity().map(str::to_string),
            topics: self.registry.topics().cloned().collect(),
            attempts: self.attempts,
            heartbeat_active: self.phase.heartbeat().is_some(),
            pings_sent: self.phase.heartbeat().map_or(0, HeartbeatMonitor::beats),
            reconnect_pending: match &self.phase {
                Phase::Retrying { timer } => Some(timer.delay()),
                _ => None,
            },
        }
    }

    fn teardown(&mut self) {
        if let Some(link) = std::mem::replace(&mut self.phase, Phase::Idle).into_link() {
            link.close(NORMAL_CLOSURE, CLIENT_DISCONNECT_REASON);
        }
        self.registry.clear();
        self.attempts = 0;
        self.publish_state(ConnectionState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::transport::{Frame, MemoryTransport};

    #[test]
    fn test_build_endpoint_appends_wallet() {
        let url = build_endpoint("wss://push.example.com/ws", "0xWallet").unwrap();
        assert_eq!(url.as_str(), "wss://push.example.com/ws?wallet=0xWallet");
    }

    #[test]
    fn test_build_endpoint_replaces_existing_wallet() {
        let url = build_endpoint("ws://h/ws?token=t&wallet=old", "new").unwrap();
        assert_eq!(url.query(), Some("token=t&wallet=new"));
    }

    #[test]
    fn test_build_endpoint_rejects_garbage() {
        assert!(matches!(
            build_endpoint("not a url", "w"),
            Err(PushError::InvalidEndpoint(_))
        ));
    }

    #[tokio::test]
    async fn test_new_rejects_zero_heartbeat() {
        let (transport, _server) = MemoryTransport::new();
        let config = PushConfig {
            heartbeat_interval_ms: 0,
            ..PushConfig::default()
        };
        assert!(matches!(
            ConnectionManager::new(&config, transport),
            Err(PushError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_new_requires_runtime() {
        let (transport, _server) = MemoryTransport::new();
        assert!(matches!(
            ConnectionManager::new(&PushConfig::default(), transport),
            Err(PushError::NoRuntime)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_sends_wallet_once_connected() {
        let (transport, mut server) = MemoryTransport::new();
        let manager = ConnectionManager::new(&PushConfig::default(), transport).unwrap();

        manager.connect("0xabc");
        let mut peer = server.accept().await.unwrap();
        assert_eq!(peer.url.query(), Some("wallet=0xabc"));
        assert_eq!(manager.state(), ConnectionState::Connecting);

        peer.open();
        let frame = peer.next_frame().await.unwrap();
        let Frame::Text(text) = frame else { panic!("expected text frame") };
        let env = envelope::decode(&text).unwrap();
        assert_eq!(env.message_type, "subscribe_wallet");
        assert_eq!(env.data["wallet"], "0xabc");
        assert!(manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_while_disconnected_is_dropped() {
        let (transport, mut server) = MemoryTransport::new();
        let manager = ConnectionManager::new(&PushConfig::default(), transport).unwrap();

        manager.send("custom", serde_json::json!({ "x": 1 }));
        let snap = manager.snapshot().await.unwrap();
        assert_eq!(snap.state, ConnectionState::Disconnected);
        assert!(server.try_accept().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_clears_topics_and_stops_actor() {
        let (transport, _server) = MemoryTransport::new();
        let manager = ConnectionManager::new(&PushConfig::default(), transport).unwrap();

        manager.subscribe_sweep("s1");
        assert_eq!(manager.snapshot().await.unwrap().topics, vec![Topic::sweep("s1")]);

        manager.shutdown();
        assert!(matches!(manager.snapshot().await, Err(PushError::Closed)));
    }
}
