//! WebSocket transport
//!
//! Drives one tokio-tungstenite connection per [`TransportLink`]. The socket
//! runs on its own task; the connection manager only sees frames and
//! lifecycle events through the link's channels.

use futures::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::error::PushError;
use crate::network::transport::{Frame, Transport, TransportEvent, TransportLink, ABNORMAL_CLOSURE};

/// Close code tungstenite reports when the peer sent no status
const NO_STATUS_RECEIVED: u16 = 1005;

/// Transport backed by tokio-tungstenite
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport {
    connect_timeout: Option<Duration>,
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound the opening handshake. A timeout is reported as an ordinary
    /// fault, so the reconnect cadence is unchanged.
    pub fn with_connect_timeout(mut self, connect_timeout: Option<Duration>) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

impl Transport for WebSocketTransport {
    fn open(&self, url: &Url) -> Result<TransportLink, PushError> {
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(PushError::InvalidEndpoint(format!(
                "unsupported scheme '{}'",
                url.scheme()
            )));
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| PushError::NoRuntime)?;

        let (link, frames, events) = TransportLink::pair();
        runtime.spawn(run_socket(url.clone(), self.connect_timeout, frames, events));
        Ok(link)
    }
}

async fn run_socket(
    url: Url,
    connect_timeout: Option<Duration>,
    mut frames: mpsc::UnboundedReceiver<Frame>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    // Receivers vanish when the manager abandons this link; sends are best effort.
    let emit = |event: TransportEvent| {
        let _ = events.send(event);
    };

    info!("Connecting to push endpoint: {}", redact(&url));
    let handshake = connect_async(url.as_str());
    let connected = match connect_timeout {
        Some(limit) => match timeout(limit, handshake).await {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(_) => Err(format!("connect timed out after {:?}", limit)),
        },
        None => handshake.await.map_err(|e| e.to_string()),
    };

    let ws_stream = match connected {
        Ok((stream, _)) => stream,
        Err(e) => {
            error!("WebSocket connect failed: {}", e);
            emit(TransportEvent::Error(e.clone()));
            emit(TransportEvent::Closed {
                code: ABNORMAL_CLOSURE,
                reason: e,
            });
            return;
        }
    };

    emit(TransportEvent::Opened);
    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            // Handle incoming messages
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        debug!("WebSocket message: {} bytes", text.len());
                        emit(TransportEvent::Message(text));
                    }
                    Some(Ok(Message::Binary(data))) => {
                        debug!("WebSocket binary ignored: {} bytes", data.len());
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        debug!("WebSocket control frame");
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!("WebSocket close frame: {:?}", frame);
                        let (code, reason) = match frame {
                            Some(f) => (u16::from(f.code), f.reason.into_owned()),
                            None => (NO_STATUS_RECEIVED, String::new()),
                        };
                        emit(TransportEvent::Closed { code, reason });
                        return;
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => {
                        error!("WebSocket read error: {}", e);
                        emit(TransportEvent::Error(e.to_string()));
                        emit(TransportEvent::Closed {
                            code: ABNORMAL_CLOSURE,
                            reason: e.to_string(),
                        });
                        return;
                    }
                    None => {
                        info!("WebSocket stream ended");
                        emit(TransportEvent::Closed {
                            code: ABNORMAL_CLOSURE,
                            reason: "stream ended".to_string(),
                        });
                        return;
                    }
                }
            }

            // Outbound frames from the connection manager
            frame = frames.recv() => {
                match frame {
                    Some(Frame::Text(text)) => {
                        if let Err(e) = write.send(Message::Text(text)).await {
                            warn!("Failed to send frame: {}", e);
                            emit(TransportEvent::Error(e.to_string()));
                            emit(TransportEvent::Closed {
                                code: ABNORMAL_CLOSURE,
                                reason: e.to_string(),
                            });
                            return;
                        }
                    }
                    Some(Frame::Close { code, reason }) => {
                        let close = CloseFrame {
                            code: CloseCode::from(code),
                            reason: Cow::Owned(reason),
                        };
                        if let Err(e) = write.send(Message::Close(Some(close))).await {
                            debug!("Close frame not delivered: {}", e);
                        }
                        return;
                    }
                    None => {
                        debug!("Link dropped by manager, closing socket");
                        let _ = write.close().await;
                        return;
                    }
                }
            }
        }
    }
}

/// Strip the query string (it carries the wallet) from logged URLs
fn redact(url: &Url) -> String {
    let mut shown = url.clone();
    shown.set_query(None);
    shown.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_ws_scheme() {
        let url = Url::parse("https://example.com/ws").unwrap();
        assert!(matches!(
            WebSocketTransport::new().open(&url),
            Err(PushError::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn test_open_outside_runtime() {
        let url = Url::parse("ws://127.0.0.1:1/ws").unwrap();
        assert!(matches!(
            WebSocketTransport::new().open(&url),
            Err(PushError::NoRuntime)
        ));
    }

    #[tokio::test]
    async fn test_refused_connection_reports_fault_then_close() {
        // Port 1 on loopback is closed on any sane test host
        let url = Url::parse("ws://127.0.0.1:1/ws?wallet=0xabc").unwrap();
        let mut link = WebSocketTransport::new()
            .with_connect_timeout(Some(Duration::from_secs(5)))
            .open(&url)
            .unwrap();

        assert!(matches!(link.next_event().await, TransportEvent::Error(_)));
        assert!(matches!(
            link.next_event().await,
            TransportEvent::Closed { code: ABNORMAL_CLOSURE, .. }
        ));
    }

    #[test]
    fn test_redact_hides_wallet() {
        let url = Url::parse("wss://push.example.com/ws?wallet=0xabc").unwrap();
        assert_eq!(redact(&url), "wss://push.example.com/ws");
    }
}
