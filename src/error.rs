//! Error taxonomy and the bounded error log.
//!
//! Two layers:
//!
//! - [`SessionError`] - the error type returned by fallible public
//!   operations. Each variant maps onto one [`ErrorKind`].
//! - [`ErrorRecord`] / [`ErrorLog`] - operator-facing records kept in a
//!   bounded ring buffer (oldest evicted first). `Critical` records are
//!   additionally retained in a separate list that only an explicit
//!   [`ErrorLog::clear_criticals`] empties, so they cannot be silently
//!   pushed out by later noise.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Classification of what went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// Transport unreachable (socket refused, DNS, stale connection).
    Network,
    /// Malformed or unexpected relay message.
    Signaling,
    /// Peer link failed to reach the connected state.
    Negotiation,
    /// Session-level failure (not found, full, ended, request timeout).
    Session,
    /// Action disallowed for the current role.
    Permission,
    /// Sustained connection-quality degradation.
    Quality,
}

/// How bad it is. Independent of [`ErrorKind`]: a network blip is `Low`,
/// exhausting reconnection is `Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Absorbed internally; logged for diagnostics only.
    Low,
    /// Recoverable; retried internally.
    Medium,
    /// Operation failed; caller must react.
    High,
    /// Surfaced to the user; never swallowed.
    Critical,
}

/// A single recorded error, as kept in the [`ErrorLog`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Unique record id.
    pub id: Uuid,
    /// Classification.
    pub kind: ErrorKind,
    /// Severity, independent of kind.
    pub severity: Severity,
    /// Human-readable description.
    pub message: String,
    /// When the error occurred.
    pub timestamp: DateTime<Utc>,
    /// Optional structured context.
    pub details: Option<String>,
}

impl ErrorRecord {
    /// Create a record stamped with the current time.
    pub fn new(kind: ErrorKind, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            severity,
            message: message.into(),
            timestamp: Utc::now(),
            details: None,
        }
    }

    /// Attach structured context.
    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Bounded ring of [`ErrorRecord`]s plus the retained criticals list.
///
/// Shared (`Arc`) between the components that raise records; interior
/// mutability via a plain mutex since every operation is short and
/// non-blocking.
#[derive(Debug)]
pub struct ErrorLog {
    inner: Mutex<LogInner>,
}

#[derive(Debug)]
struct LogInner {
    ring: VecDeque<ErrorRecord>,
    criticals: Vec<ErrorRecord>,
    capacity: usize,
}

impl ErrorLog {
    /// Create a log holding at most `capacity` records.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LogInner {
                ring: VecDeque::with_capacity(capacity),
                criticals: Vec::new(),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Append a record, evicting the oldest when full. `Critical` records
    /// are also copied into the retained list.
    pub fn record(&self, record: ErrorRecord) {
        match record.severity {
            Severity::Critical => log::error!(
                "[ErrorLog] {:?}/{:?}: {}",
                record.kind,
                record.severity,
                record.message
            ),
            Severity::High => log::warn!(
                "[ErrorLog] {:?}/{:?}: {}",
                record.kind,
                record.severity,
                record.message
            ),
            _ => log::debug!(
                "[ErrorLog] {:?}/{:?}: {}",
                record.kind,
                record.severity,
                record.message
            ),
        }

        let mut inner = self.inner.lock().expect("error log lock poisoned");
        if record.severity == Severity::Critical {
            inner.criticals.push(record.clone());
        }
        if inner.ring.len() == inner.capacity {
            inner.ring.pop_front();
        }
        inner.ring.push_back(record);
    }

    /// Snapshot of the ring, oldest first.
    pub fn recent(&self) -> Vec<ErrorRecord> {
        let inner = self.inner.lock().expect("error log lock poisoned");
        inner.ring.iter().cloned().collect()
    }

    /// Snapshot of the retained critical records.
    pub fn criticals(&self) -> Vec<ErrorRecord> {
        let inner = self.inner.lock().expect("error log lock poisoned");
        inner.criticals.clone()
    }

    /// Empty the retained criticals list (operator acknowledgement).
    pub fn clear_criticals(&self) {
        let mut inner = self.inner.lock().expect("error log lock poisoned");
        inner.criticals.clear();
    }
}

/// Errors returned by fallible operations across the subsystem.
#[derive(Debug)]
pub enum SessionError {
    /// Transport unreachable or closed underneath us.
    Network(String),
    /// Malformed or unexpected relay traffic.
    Signaling(String),
    /// Peer link negotiation failure (including sends on a closed channel).
    Negotiation(String),
    /// Session-level failure: not found, ended, or request timed out.
    Session(String),
    /// The current role may not perform this action.
    Permission(String),
    /// Sustained quality degradation.
    Quality(String),
}

impl SessionError {
    /// Shorthand constructors, one per taxonomy kind.
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }
    /// See [`SessionError::network`].
    pub fn signaling(msg: impl Into<String>) -> Self {
        Self::Signaling(msg.into())
    }
    /// See [`SessionError::network`].
    pub fn negotiation(msg: impl Into<String>) -> Self {
        Self::Negotiation(msg.into())
    }
    /// See [`SessionError::network`].
    pub fn session(msg: impl Into<String>) -> Self {
        Self::Session(msg.into())
    }
    /// See [`SessionError::network`].
    pub fn permission(msg: impl Into<String>) -> Self {
        Self::Permission(msg.into())
    }
    /// See [`SessionError::network`].
    pub fn quality(msg: impl Into<String>) -> Self {
        Self::Quality(msg.into())
    }

    /// Taxonomy kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network(_) => ErrorKind::Network,
            Self::Signaling(_) => ErrorKind::Signaling,
            Self::Negotiation(_) => ErrorKind::Negotiation,
            Self::Session(_) => ErrorKind::Session,
            Self::Permission(_) => ErrorKind::Permission,
            Self::Quality(_) => ErrorKind::Quality,
        }
    }
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Network(msg) => write!(f, "network error: {msg}"),
            Self::Signaling(msg) => write!(f, "signaling error: {msg}"),
            Self::Negotiation(msg) => write!(f, "negotiation error: {msg}"),
            Self::Session(msg) => write!(f, "session error: {msg}"),
            Self::Permission(msg) => write!(f, "permission error: {msg}"),
            Self::Quality(msg) => write!(f, "quality error: {msg}"),
        }
    }
}

impl std::error::Error for SessionError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_evicts_oldest_first() {
        let log = ErrorLog::new(3);
        for i in 0..5 {
            log.record(ErrorRecord::new(
                ErrorKind::Network,
                Severity::Low,
                format!("blip {i}"),
            ));
        }
        let recent = log.recent();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].message, "blip 2");
        assert_eq!(recent[2].message, "blip 4");
    }

    #[test]
    fn test_criticals_survive_ring_eviction() {
        let log = ErrorLog::new(2);
        log.record(ErrorRecord::new(
            ErrorKind::Network,
            Severity::Critical,
            "reconnection exhausted",
        ));
        for i in 0..4 {
            log.record(ErrorRecord::new(
                ErrorKind::Quality,
                Severity::Low,
                format!("sample {i}"),
            ));
        }
        // Pushed out of the ring, still retained.
        assert!(log.recent().iter().all(|r| r.severity != Severity::Critical));
        let criticals = log.criticals();
        assert_eq!(criticals.len(), 1);
        assert_eq!(criticals[0].message, "reconnection exhausted");

        log.clear_criticals();
        assert!(log.criticals().is_empty());
    }

    #[test]
    fn test_session_error_kind_mapping() {
        assert_eq!(SessionError::network("x").kind(), ErrorKind::Network);
        assert_eq!(SessionError::signaling("x").kind(), ErrorKind::Signaling);
        assert_eq!(SessionError::negotiation("x").kind(), ErrorKind::Negotiation);
        assert_eq!(SessionError::session("x").kind(), ErrorKind::Session);
        assert_eq!(SessionError::permission("x").kind(), ErrorKind::Permission);
        assert_eq!(SessionError::quality("x").kind(), ErrorKind::Quality);
    }

    #[test]
    fn test_session_error_display() {
        let err = SessionError::session("join-session timed out after 10s");
        assert_eq!(
            err.to_string(),
            "session error: join-session timed out after 10s"
        );
    }
}
