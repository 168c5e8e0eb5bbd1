//! Typed event fan-out for the whole subsystem.
//!
//! Components publish [`SessionEvent`]s onto a shared [`EventBus`];
//! observers attach with [`EventBus::subscribe`] and each gets its own
//! receiver, so attaching a new observer never displaces an existing one.
//! Dropping the receiver is the unsubscribe.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use webrtc::track::track_remote::TrackRemote;

use crate::error::ErrorRecord;
use crate::guidance::GuidanceMessage;
use crate::peer_link::{DataChannelState, LinkSignalingState};
use crate::protocol::{Participant, ParticipantState, SignalMessage};
use crate::resilience::LinkHealth;

/// Default buffer depth for the event broadcast channel. Slow observers
/// that fall further behind than this see a `Lagged` error and skip
/// ahead rather than stalling publishers.
const EVENT_BUFFER: usize = 256;

/// Everything the subsystem reports upward.
#[derive(Clone)]
pub enum SessionEvent {
    /// The signaling channel came up.
    SignalingConnected,
    /// The signaling channel went down (closed, errored, or stale).
    SignalingDisconnected,
    /// A participant entered the session.
    ParticipantJoined(Participant),
    /// A participant's connection state changed.
    ParticipantStateChanged {
        /// Which participant.
        participant_id: String,
        /// New state.
        state: ParticipantState,
    },
    /// The peer link signaling state machine advanced.
    LinkStateChanged(LinkSignalingState),
    /// The peer link reached the connected state.
    LinkConnected,
    /// The peer link failed (negotiation timeout or transport failure).
    LinkFailed,
    /// The data channel opened or closed.
    DataChannelStateChanged(DataChannelState),
    /// The remote side attached a media track.
    RemoteTrack(Arc<TrackRemote>),
    /// An application message arrived over the data channel
    /// (`game-state-sync` / `real-time-action`).
    Data(SignalMessage),
    /// A guidance message arrived (guest side).
    Guidance(GuidanceMessage),
    /// The resilience manager moved between health states.
    HealthChanged(LinkHealth),
    /// A reconnection attempt is about to run after `delay`.
    ReconnectAttempt {
        /// 1-based attempt number.
        attempt: u32,
        /// Backoff delay preceding the attempt.
        delay: Duration,
    },
    /// Automatic reconnection succeeded.
    Recovered,
    /// Automatic reconnection gave up; manual action needed.
    ReconnectExhausted,
    /// An emergency snapshot was written.
    SnapshotTaken,
    /// An error record was raised.
    ErrorRecorded(ErrorRecord),
}

impl std::fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SignalingConnected => write!(f, "SignalingConnected"),
            Self::SignalingDisconnected => write!(f, "SignalingDisconnected"),
            Self::ParticipantJoined(p) => write!(f, "ParticipantJoined({})", p.id),
            Self::ParticipantStateChanged {
                participant_id,
                state,
            } => write!(f, "ParticipantStateChanged({participant_id}, {state:?})"),
            Self::LinkStateChanged(s) => write!(f, "LinkStateChanged({s:?})"),
            Self::LinkConnected => write!(f, "LinkConnected"),
            Self::LinkFailed => write!(f, "LinkFailed"),
            Self::DataChannelStateChanged(s) => write!(f, "DataChannelStateChanged({s:?})"),
            Self::RemoteTrack(_) => write!(f, "RemoteTrack(..)"),
            Self::Data(msg) => write!(f, "Data({msg:?})"),
            Self::Guidance(g) => write!(f, "Guidance({:?})", g.kind),
            Self::HealthChanged(h) => write!(f, "HealthChanged({h:?})"),
            Self::ReconnectAttempt { attempt, delay } => {
                write!(f, "ReconnectAttempt({attempt}, {delay:?})")
            }
            Self::Recovered => write!(f, "Recovered"),
            Self::ReconnectExhausted => write!(f, "ReconnectExhausted"),
            Self::SnapshotTaken => write!(f, "SnapshotTaken"),
            Self::ErrorRecorded(r) => write!(f, "ErrorRecorded({:?}/{:?})", r.kind, r.severity),
        }
    }
}

/// Shared publisher handle. Cheap to clone; all clones feed the same
/// subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    /// Create a bus with the default buffer depth.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self { tx }
    }

    /// Attach an observer.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. A bus with no subscribers drops the event;
    /// publishing is never an error for the publisher.
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.emit(SessionEvent::SignalingConnected);
    }

    #[tokio::test]
    async fn test_multiple_observers_each_receive() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.emit(SessionEvent::LinkConnected);
        assert!(matches!(a.recv().await.unwrap(), SessionEvent::LinkConnected));
        assert!(matches!(b.recv().await.unwrap(), SessionEvent::LinkConnected));
    }

    #[tokio::test]
    async fn test_clone_publishes_to_same_subscribers() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let publisher = bus.clone();
        publisher.emit(SessionEvent::Recovered);
        assert!(matches!(rx.recv().await.unwrap(), SessionEvent::Recovered));
    }
}
