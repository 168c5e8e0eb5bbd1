//! In-memory signaling transport for tests.
//!
//! Stands in for the relay: records everything sent, optionally answers
//! with scripted responses, and lets tests inject relay-side events
//! directly. A silent fake (no responder) models a relay that never
//! replies.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::SessionError;
use crate::protocol::SignalMessage;
use crate::signaling::{SignalingEvent, SignalingTransport};

type Responder = Box<dyn Fn(&SignalMessage) -> Option<SignalMessage> + Send + Sync>;

pub(crate) struct FakeTransport {
    events_tx: broadcast::Sender<SignalingEvent>,
    sent: StdMutex<Vec<SignalMessage>>,
    connected: AtomicBool,
    connect_count: AtomicU32,
    fail_connect: AtomicBool,
    responder: StdMutex<Option<Responder>>,
}

impl FakeTransport {
    pub(crate) fn shared() -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            events_tx,
            sent: StdMutex::new(Vec::new()),
            connected: AtomicBool::new(false),
            connect_count: AtomicU32::new(0),
            fail_connect: AtomicBool::new(false),
            responder: StdMutex::new(None),
        })
    }

    /// Script the relay: `f` maps each sent message to an optional
    /// immediate response event.
    pub(crate) fn respond_with(
        &self,
        f: impl Fn(&SignalMessage) -> Option<SignalMessage> + Send + Sync + 'static,
    ) {
        *self.responder.lock().expect("responder lock poisoned") = Some(Box::new(f));
    }

    /// Make subsequent `connect()` calls fail with a network error.
    pub(crate) fn fail_connections(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Everything sent so far, in order.
    pub(crate) fn sent(&self) -> Vec<SignalMessage> {
        self.sent.lock().expect("sent lock poisoned").clone()
    }

    pub(crate) fn connect_count(&self) -> u32 {
        self.connect_count.load(Ordering::SeqCst)
    }

    /// Inject a relay-side event as if it arrived over the socket.
    pub(crate) fn inject(&self, message: SignalMessage) {
        let _ = self.events_tx.send(SignalingEvent::Message(message));
    }
}

impl std::fmt::Debug for FakeTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeTransport")
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SignalingTransport for FakeTransport {
    async fn connect(&self) -> Result<(), SessionError> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(SessionError::network("fake relay refused connection"));
        }
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.events_tx.send(SignalingEvent::Connected);
        Ok(())
    }

    async fn send(&self, message: SignalMessage) -> Result<(), SessionError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SessionError::network("not connected"));
        }
        self.sent
            .lock()
            .expect("sent lock poisoned")
            .push(message.clone());
        let response = self
            .responder
            .lock()
            .expect("responder lock poisoned")
            .as_ref()
            .and_then(|f| f(&message));
        if let Some(response) = response {
            let _ = self.events_tx.send(SignalingEvent::Message(response));
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.events_tx.subscribe()
    }

    async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.events_tx.send(SignalingEvent::Disconnected);
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
