//! Transport abstraction
//!
//! A transport turns an endpoint URL into a [`TransportLink`]: an outbound
//! frame sender plus a stream of lifecycle events, in the same shape a
//! browser WebSocket exposes (open, message, error, close). Construction is
//! synchronous and may fail; everything after that arrives as events.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use url::Url;

use crate::error::PushError;

/// Close code used for an intentional shutdown
pub const NORMAL_CLOSURE: u16 = 1000;
/// Close code reported when the link dropped without a close frame
pub const ABNORMAL_CLOSURE: u16 = 1006;
pub const CLIENT_DISCONNECT_REASON: &str = "Client disconnect";

/// Frames the client asks the transport to write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Close { code: u16, reason: String },
}

/// Lifecycle notifications from a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    Message(String),
    /// A fault on the link. Implementations should follow it with `Closed`;
    /// the manager gives up on a faulted link that stays silent for
    /// `FAULT_CLOSE_GRACE` and treats it as an abnormal close.
    Error(String),
    Closed { code: u16, reason: String },
}

/// One connection attempt
#[derive(Debug)]
pub struct TransportLink {
    outbound: mpsc::UnboundedSender<Frame>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl TransportLink {
    pub fn new(
        outbound: mpsc::UnboundedSender<Frame>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Self {
        Self { outbound, events }
    }

    /// Build a link and the peer ends a transport implementation drives
    pub fn pair() -> (
        Self,
        mpsc::UnboundedReceiver<Frame>,
        mpsc::UnboundedSender<TransportEvent>,
    ) {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (Self::new(frame_tx, event_rx), frame_rx, event_tx)
    }

    pub fn send_text(&self, text: String) -> Result<(), PushError> {
        self.outbound
            .send(Frame::Text(text))
            .map_err(|_| PushError::Transport("link closed".to_string()))
    }

    pub fn close(&self, code: u16, reason: &str) {
        // The peer may already be gone; closing a dead link is fine.
        let _ = self.outbound.send(Frame::Close {
            code,
            reason: reason.to_string(),
        });
    }

    /// Next lifecycle event. A link whose driver vanished reads as an
    /// abnormal close.
    pub async fn next_event(&mut self) -> TransportEvent {
        match self.events.recv().await {
            Some(event) => event,
            None => TransportEvent::Closed {
                code: ABNORMAL_CLOSURE,
                reason: "transport dropped".to_string(),
            },
        }
    }
}

/// Factory for connection attempts.
///
/// `open` must not block. Each link reports `Opened` once, then messages,
/// and ends with `Closed`; dropping the event sender counts as a close with
/// [`ABNORMAL_CLOSURE`].
pub trait Transport: Send + Sync + 'static {
    fn open(&self, url: &Url) -> Result<TransportLink, PushError>;
}

/// Server side of one in-memory link
#[derive(Debug)]
pub struct MemoryPeer {
    pub url: Url,
    frames: mpsc::UnboundedReceiver<Frame>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl MemoryPeer {
    pub fn open(&self) {
        self.emit(TransportEvent::Opened);
    }

    pub fn push_text(&self, text: impl Into<String>) {
        self.emit(TransportEvent::Message(text.into()));
    }

    pub fn fail(&self, description: impl Into<String>) {
        self.emit(TransportEvent::Error(description.into()));
    }

    pub fn close(&self, code: u16, reason: impl Into<String>) {
        self.emit(TransportEvent::Closed {
            code,
            reason: reason.into(),
        });
    }

    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    /// Next frame written by the client; `None` once the client dropped the link
    pub async fn next_frame(&mut self) -> Option<Frame> {
        self.frames.recv().await
    }

    pub fn try_next_frame(&mut self) -> Option<Frame> {
        self.frames.try_recv().ok()
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    refuse: VecDeque<String>,
}

/// In-process transport; each `open` hands a [`MemoryPeer`] to the paired
/// [`MemoryServer`]
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    peers: mpsc::UnboundedSender<MemoryPeer>,
    state: Arc<Mutex<MemoryState>>,
}

/// Receiving end of a [`MemoryTransport`]
#[derive(Debug)]
pub struct MemoryServer {
    peers: mpsc::UnboundedReceiver<MemoryPeer>,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTransport {
    pub fn new() -> (Self, MemoryServer) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(MemoryState::default()));
        (
            Self {
                peers: tx,
                state: state.clone(),
            },
            MemoryServer { peers: rx, state },
        )
    }
}

impl Transport for MemoryTransport {
    fn open(&self, url: &Url) -> Result<TransportLink, PushError> {
        if let Some(reason) = self.state.lock().refuse.pop_front() {
            return Err(PushError::Transport(reason));
        }
        let (link, frames, events) = TransportLink::pair();
        self.peers
            .send(MemoryPeer {
                url: url.clone(),
                frames,
                events,
            })
            .map_err(|_| PushError::Transport("memory server dropped".to_string()))?;
        Ok(link)
    }
}

impl MemoryServer {
    /// Wait for the client's next connection attempt
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.peers.recv().await
    }

    pub fn try_accept(&mut self) -> Option<MemoryPeer> {
        self.peers.try_recv().ok()
    }

    /// Make the next `open` fail during construction
    pub fn refuse_next(&self, reason: impl Into<String>) {
        self.state.lock().refuse.push_back(reason.into());
    }
}
