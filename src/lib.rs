//! Duetlink - real-time collaborative session subsystem.
//!
//! Lets two clients (a "host" and a "guest") discover each other through
//! a relay, negotiate a direct peer-to-peer audio/video + data link,
//! synchronize application state over that link, and survive flaky
//! connectivity without losing session progress.
//!
//! # Architecture
//!
//! ```text
//! SessionManager (lifecycle, roster, event pump)
//!     ├── SignalingChannel (relay WebSocket, ordered, no retry policy)
//!     ├── PeerLinkController (WebRTC negotiation + data channel)
//!     │   └── GuidanceChannel (host → guest, role-enforced)
//!     └── EventBus (typed multi-observer fan-out)
//!
//! ConnectionResilienceManager (injected, owns retry policy)
//!     ├── QualityMonitor (rolling sample window)
//!     ├── ReconnectDriver ← SessionManager::rejoin
//!     └── StateSnapshotStore (emergency snapshots, memory + disk)
//! ```
//!
//! The split between `SignalingChannel` and
//! `ConnectionResilienceManager` is deliberate: the transport never
//! retries on its own, and the policy layer never touches a socket.
//!
//! # Modules
//!
//! - [`session`] - session lifecycle, roster, and the event pump
//! - [`signaling`] - relay WebSocket channel and the transport seam
//! - [`peer_link`] - WebRTC negotiation state machine and data channel
//! - [`resilience`] - health monitoring and bounded reconnection
//! - [`snapshot`] - versioned emergency snapshot store
//! - [`guidance`] - host-to-guest guidance protocol
//! - [`protocol`] - wire envelopes shared by relay and data channel
//! - [`config`] - construction-supplied configuration
//! - [`error`] - error taxonomy and the bounded error log
//! - [`events`] - typed event bus

pub mod config;
pub mod error;
pub mod events;
pub mod guidance;
pub mod peer_link;
pub mod protocol;
pub mod resilience;
pub mod session;
pub mod signaling;
pub mod snapshot;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types
pub use config::{IceServerConfig, QualityThresholds, SessionConfig};
pub use error::{ErrorKind, ErrorLog, ErrorRecord, SessionError, Severity};
pub use events::{EventBus, SessionEvent};
pub use guidance::{GuidanceChannel, GuidanceKind, GuidanceMessage};
pub use peer_link::{DataChannelState, LinkSignalingState, PeerLinkController};
pub use protocol::{Participant, ParticipantInfo, ParticipantState, Role, SignalMessage};
pub use resilience::{
    ConnectionResilienceManager, ConnectivityProbe, LinkHealth, Quality, ReconnectDriver,
};
pub use session::{SessionInfo, SessionManager};
pub use signaling::{SignalingChannel, SignalingEvent, SignalingTransport};
pub use snapshot::{StateSnapshot, StateSnapshotStore};
