//! Relay signaling channel.
//!
//! A persistent, ordered, bidirectional WebSocket to the relay. This is
//! the only component that touches the network for session control and
//! negotiation metadata. It decodes JSON envelopes into
//! [`SignalMessage`]s and fans them out to subscribers without
//! interpreting them.
//!
//! # Architecture
//!
//! ```text
//! SignalingChannel
//!     ├── WebSocket connection (tokio-tungstenite)
//!     ├── Outbound queue (mpsc) - single writer, in-order delivery
//!     ├── Event fan-out (broadcast): Connected / Disconnected / Message
//!     └── Stale-connection detection (no traffic within the window)
//! ```
//!
//! Deliberately absent: reconnection. A dropped socket surfaces as a
//! `Disconnected` event and nothing more - retry policy lives in the
//! resilience manager, keeping transport separate from policy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tokio_tungstenite::{
    connect_async, tungstenite::client::IntoClientRequest, tungstenite::Message,
    MaybeTlsStream, WebSocketStream,
};

use crate::error::{ErrorKind, ErrorRecord, SessionError, Severity};
use crate::protocol::SignalMessage;

/// Bound on the WebSocket handshake itself.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How often the connection task checks for staleness.
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Outbound queue depth.
const SEND_QUEUE_DEPTH: usize = 100;

/// Event fan-out buffer depth.
const EVENT_BUFFER: usize = 256;

/// Events surfaced by a signaling transport.
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// The channel is up.
    Connected,
    /// The channel went down (server close, error, or staleness).
    Disconnected,
    /// A decoded relay envelope.
    Message(SignalMessage),
}

/// Transport seam between the session layer and the concrete WebSocket
/// channel. Tests substitute an in-memory implementation.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Establish the connection. Fails with a network error; never
    /// retries internally.
    async fn connect(&self) -> Result<(), SessionError>;

    /// Queue a message for in-order delivery.
    async fn send(&self, message: SignalMessage) -> Result<(), SessionError>;

    /// Attach an event observer.
    fn subscribe(&self) -> broadcast::Receiver<SignalingEvent>;

    /// Tear the connection down. Idempotent.
    async fn disconnect(&self);

    /// Whether the channel is currently up.
    fn is_connected(&self) -> bool;
}

/// WebSocket signaling channel to the relay.
pub struct SignalingChannel {
    relay_url: String,
    stale_timeout: Duration,
    error_log: std::sync::Arc<crate::error::ErrorLog>,
    events_tx: broadcast::Sender<SignalingEvent>,
    connected: AtomicBool,
    send_tx: StdMutex<Option<mpsc::Sender<SignalMessage>>>,
    shutdown_tx: StdMutex<Option<oneshot::Sender<()>>>,
}

impl std::fmt::Debug for SignalingChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingChannel")
            .field("relay_url", &self.relay_url)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl SignalingChannel {
    /// Create a channel for the given relay. Nothing connects until
    /// [`SignalingTransport::connect`] is called.
    pub fn new(
        relay_url: impl Into<String>,
        stale_timeout: Duration,
        error_log: std::sync::Arc<crate::error::ErrorLog>,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            relay_url: relay_url.into(),
            stale_timeout,
            error_log,
            events_tx,
            connected: AtomicBool::new(false),
            send_tx: StdMutex::new(None),
            shutdown_tx: StdMutex::new(None),
        }
    }

    /// Rewrite `http(s)` schemes to `ws(s)` so embedders can hand us the
    /// same base URL they use for REST calls.
    fn ws_url(relay_url: &str) -> String {
        relay_url
            .replace("https://", "wss://")
            .replace("http://", "ws://")
    }

    /// Connection task: owns the socket, multiplexes outbound sends,
    /// inbound frames, staleness checks, and shutdown.
    async fn run_loop(
        ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
        mut send_rx: mpsc::Receiver<SignalMessage>,
        events_tx: broadcast::Sender<SignalingEvent>,
        error_log: std::sync::Arc<crate::error::ErrorLog>,
        stale_timeout: Duration,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        let (mut write, mut read) = ws_stream.split();
        let mut last_activity = Instant::now();
        let mut health_interval = tokio::time::interval(HEALTH_CHECK_INTERVAL);

        loop {
            tokio::select! {
                // Outbound messages, serialized in queue order over the
                // single socket writer.
                Some(msg) = send_rx.recv() => {
                    let json = serde_json::to_string(&msg).expect("signal message serializable");
                    if let Err(e) = write.send(Message::Text(json)).await {
                        log::error!("[Signaling] Send failed: {e}");
                        break;
                    }
                }

                // Inbound frames.
                item = read.next() => {
                    match item {
                        Some(Ok(Message::Text(text))) => {
                            last_activity = Instant::now();
                            match serde_json::from_str::<SignalMessage>(&text) {
                                Ok(msg) => {
                                    log::trace!("[Signaling] Received {msg:?}");
                                    let _ = events_tx.send(SignalingEvent::Message(msg));
                                }
                                Err(e) => {
                                    log::warn!("[Signaling] Undecodable relay frame: {e}");
                                    error_log.record(
                                        ErrorRecord::new(
                                            ErrorKind::Signaling,
                                            Severity::Low,
                                            "undecodable relay frame",
                                        )
                                        .with_details(e.to_string()),
                                    );
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            last_activity = Instant::now();
                            if write.send(Message::Pong(data)).await.is_err() {
                                log::warn!("[Signaling] Failed to send pong");
                                break;
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {
                            last_activity = Instant::now();
                        }
                        Some(Ok(Message::Close(_))) => {
                            log::info!("[Signaling] Closed by relay");
                            break;
                        }
                        Some(Err(e)) => {
                            log::error!("[Signaling] WebSocket error: {e}");
                            break;
                        }
                        None => {
                            log::info!("[Signaling] Stream ended");
                            break;
                        }
                        _ => {}
                    }
                }

                // Staleness: a socket with no traffic for the window is
                // as good as dead even if the OS has not noticed yet.
                _ = health_interval.tick() => {
                    if last_activity.elapsed() > stale_timeout {
                        log::warn!(
                            "[Signaling] Connection stale ({}s without traffic)",
                            last_activity.elapsed().as_secs()
                        );
                        break;
                    }
                }

                // Local teardown.
                _ = &mut shutdown_rx => {
                    log::info!("[Signaling] Shutdown requested");
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
            }
        }

        let _ = events_tx.send(SignalingEvent::Disconnected);
    }
}

#[async_trait]
impl SignalingTransport for SignalingChannel {
    async fn connect(&self) -> Result<(), SessionError> {
        if self.connected.load(Ordering::SeqCst) {
            return Err(SessionError::network("already connected"));
        }

        let ws_url = Self::ws_url(&self.relay_url);
        log::debug!("[Signaling] Connecting to {ws_url}");

        let request = ws_url
            .as_str()
            .into_client_request()
            .map_err(|e| SessionError::network(format!("invalid relay URL '{ws_url}': {e}")))?;

        let (ws_stream, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(request))
            .await
            .map_err(|_| SessionError::network("relay connect timed out"))?
            .map_err(|e| SessionError::network(format!("relay connect failed: {e}")))?;

        let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        *self.send_tx.lock().expect("send lock poisoned") = Some(send_tx);
        *self.shutdown_tx.lock().expect("shutdown lock poisoned") = Some(shutdown_tx);

        let events_tx = self.events_tx.clone();
        let error_log = std::sync::Arc::clone(&self.error_log);
        let stale_timeout = self.stale_timeout;
        tokio::spawn(async move {
            Self::run_loop(
                ws_stream,
                send_rx,
                events_tx,
                error_log,
                stale_timeout,
                shutdown_rx,
            )
            .await;
        });

        self.connected.store(true, Ordering::SeqCst);
        let _ = self.events_tx.send(SignalingEvent::Connected);
        log::info!("[Signaling] Connected to {ws_url}");
        Ok(())
    }

    async fn send(&self, message: SignalMessage) -> Result<(), SessionError> {
        let tx = self
            .send_tx
            .lock()
            .expect("send lock poisoned")
            .clone()
            .ok_or_else(|| SessionError::network("not connected"))?;
        tx.send(message)
            .await
            .map_err(|_| SessionError::network("signaling channel closed"))
    }

    fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.events_tx.subscribe()
    }

    async fn disconnect(&self) {
        if let Some(tx) = self
            .shutdown_tx
            .lock()
            .expect("shutdown lock poisoned")
            .take()
        {
            let _ = tx.send(());
        }
        self.send_tx.lock().expect("send lock poisoned").take();
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        if let Some(tx) = self
            .shutdown_tx
            .lock()
            .expect("shutdown lock poisoned")
            .take()
        {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorLog;
    use std::sync::Arc;

    fn channel(url: &str) -> SignalingChannel {
        SignalingChannel::new(url, Duration::from_secs(15), Arc::new(ErrorLog::new(16)))
    }

    #[test]
    fn test_ws_url_rewrites_http_schemes() {
        assert_eq!(
            SignalingChannel::ws_url("https://relay.example/session"),
            "wss://relay.example/session"
        );
        assert_eq!(
            SignalingChannel::ws_url("http://localhost:3000/cable"),
            "ws://localhost:3000/cable"
        );
        assert_eq!(
            SignalingChannel::ws_url("wss://relay.example"),
            "wss://relay.example"
        );
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_url_with_network_error() {
        let channel = channel("not a url at all");
        let err = channel.connect().await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Network);
        assert!(!channel.is_connected());
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let channel = channel("wss://relay.invalid");
        let err = channel
            .send(SignalMessage::LeaveSession {
                session_id: "sess-1".into(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Network);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let channel = channel("wss://relay.invalid");
        channel.disconnect().await;
        channel.disconnect().await;
        assert!(!channel.is_connected());
    }
}
