//! Session configuration.
//!
//! Everything the subsystem needs is supplied at construction; there are
//! no hidden globals and nothing is read from the environment. The
//! `Default` impl carries the documented defaults so embedders only
//! override what they care about.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// One ICE server entry (STUN or TURN).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    /// Server URLs, e.g. `stun:stun.l.google.com:19302`.
    pub urls: Vec<String>,
    /// TURN username, if required.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// TURN credential, if required.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerConfig {
    /// A plain STUN entry with no credentials.
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Latency thresholds for connection-quality classification.
///
/// A sample below `excellent_below_ms` is Excellent, below
/// `good_below_ms` Good, below `poor_below_ms` Poor, anything else
/// Critical.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityThresholds {
    /// Upper latency bound for Excellent.
    pub excellent_below_ms: u64,
    /// Upper latency bound for Good.
    pub good_below_ms: u64,
    /// Upper latency bound for Poor.
    pub poor_below_ms: u64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            excellent_below_ms: 100,
            good_below_ms: 300,
            poor_below_ms: 1000,
        }
    }
}

/// Configuration for the collaborative session subsystem.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Relay URL. `http(s)` schemes are rewritten to `ws(s)` on connect.
    pub relay_url: String,
    /// ICE servers handed to the peer connection.
    pub ice_servers: Vec<IceServerConfig>,
    /// Bound on session create/join round-trips. A relay that does not
    /// answer within this window produces a session error instead of a
    /// hanging caller.
    pub session_request_timeout: Duration,
    /// Bound on peer negotiation reaching the connected state.
    pub negotiation_timeout: Duration,
    /// Maximum automatic reconnection attempts before giving up.
    pub max_reconnect_attempts: u32,
    /// Delay before the first reconnection attempt; doubles per attempt.
    pub base_reconnect_delay: Duration,
    /// Ceiling on the reconnection delay.
    pub reconnect_delay_cap: Duration,
    /// Latency thresholds for quality classification.
    pub quality_thresholds: QualityThresholds,
    /// Number of samples kept in the rolling quality window.
    pub quality_window: usize,
    /// Consecutive Critical samples that trigger degradation handling.
    pub critical_sample_threshold: u32,
    /// Take an emergency snapshot as soon as the link degrades.
    pub auto_backup: bool,
    /// Durable snapshot location. `None` uses the platform data dir.
    pub snapshot_path: Option<PathBuf>,
    /// Silence window after which the signaling socket counts as dead.
    pub stale_timeout: Duration,
    /// Capacity of the error ring buffer.
    pub error_log_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            relay_url: "wss://relay.invalid".to_string(),
            ice_servers: vec![IceServerConfig::stun("stun:stun.l.google.com:19302")],
            session_request_timeout: Duration::from_secs(10),
            negotiation_timeout: Duration::from_secs(15),
            max_reconnect_attempts: 5,
            base_reconnect_delay: Duration::from_secs(1),
            reconnect_delay_cap: Duration::from_secs(30),
            quality_thresholds: QualityThresholds::default(),
            quality_window: 8,
            critical_sample_threshold: 3,
            auto_backup: true,
            snapshot_path: None,
            stale_timeout: Duration::from_secs(15),
            error_log_capacity: 64,
        }
    }
}

impl SessionConfig {
    /// Config pointing at the given relay, defaults for everything else.
    pub fn for_relay(relay_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            ..Self::default()
        }
    }
}
