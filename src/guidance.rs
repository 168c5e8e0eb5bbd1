//! Host → guest guidance protocol.
//!
//! A thin, one-directional message layer on top of the peer data
//! channel: the host sends hints, corrections, encouragement, or
//! annotations; the guest renders them. Delivery rides the ordered,
//! reliable data channel, so messages are neither reordered nor lost,
//! but no delivery acknowledgement is modeled - receipt feedback is the
//! guest UI's business.
//!
//! The direction constraint is enforced here at the protocol level, not
//! in the UI: a guest calling [`GuidanceChannel::send`] is rejected
//! synchronously with a permission error before anything touches the
//! link.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::peer_link::PeerLinkController;
use crate::protocol::{Role, SignalMessage};

/// What kind of guidance is being sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuidanceKind {
    /// Nudge toward the next step.
    Hint,
    /// Point out a mistake.
    Correction,
    /// Praise.
    Encouragement,
    /// Free-form drawing/markup over the shared view.
    Annotation,
}

/// A guidance message as carried on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuidanceMessage {
    /// Kind of guidance.
    pub kind: GuidanceKind,
    /// Opaque payload (text, coordinates, stroke data - the UI's call).
    pub data: serde_json::Value,
    /// How long the guest UI should display it, if bounded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// When the host sent it.
    pub timestamp: DateTime<Utc>,
}

impl GuidanceMessage {
    /// Build a message stamped with the current time.
    pub fn new(kind: GuidanceKind, data: serde_json::Value, duration_ms: Option<u64>) -> Self {
        Self {
            kind,
            data,
            duration_ms,
            timestamp: Utc::now(),
        }
    }
}

/// Sender half of the guidance protocol, held by the host's UI layer.
#[derive(Debug, Clone)]
pub struct GuidanceChannel {
    link: Arc<PeerLinkController>,
}

impl GuidanceChannel {
    /// Wrap a peer link.
    pub fn new(link: Arc<PeerLinkController>) -> Self {
        Self { link }
    }

    /// Send guidance to the guest.
    ///
    /// # Errors
    ///
    /// `Permission` if the local role is not host (checked before the
    /// link is touched), `Negotiation` if the data channel is not open.
    pub async fn send(
        &self,
        kind: GuidanceKind,
        data: serde_json::Value,
        duration_ms: Option<u64>,
    ) -> Result<(), SessionError> {
        match self.link.role() {
            Some(Role::Host) => {}
            Some(Role::Guest) => {
                return Err(SessionError::permission(
                    "guidance is host-to-guest; the guest cannot send it",
                ))
            }
            None => {
                return Err(SessionError::permission(
                    "guidance requires an active session",
                ))
            }
        }

        let message = GuidanceMessage::new(kind, data, duration_ms);
        log::debug!("[Guidance] Sending {:?}", message.kind);
        self.link
            .send_data(&SignalMessage::TeacherGuidance { guidance: message })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::error::{ErrorKind, ErrorLog};
    use crate::events::EventBus;
    use crate::test_support::FakeTransport;

    fn channel_for(role: Option<Role>) -> GuidanceChannel {
        let link = Arc::new(PeerLinkController::new(
            FakeTransport::shared(),
            SessionConfig::default(),
            EventBus::new(),
            Arc::new(ErrorLog::new(16)),
        ));
        if let Some(role) = role {
            link.bind("sess-1".into(), role);
        }
        GuidanceChannel::new(link)
    }

    #[tokio::test]
    async fn test_guest_cannot_send_guidance() {
        let channel = channel_for(Some(Role::Guest));
        let err = channel
            .send(GuidanceKind::Hint, serde_json::json!("psst"), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permission);
    }

    #[tokio::test]
    async fn test_guidance_requires_a_session() {
        let channel = channel_for(None);
        let err = channel
            .send(GuidanceKind::Hint, serde_json::json!("psst"), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permission);
    }

    #[tokio::test]
    async fn test_host_passes_role_gate_but_needs_open_channel() {
        let channel = channel_for(Some(Role::Host));
        let err = channel
            .send(GuidanceKind::Correction, serde_json::json!("there"), Some(2000))
            .await
            .unwrap_err();
        // Role check passed; the failure is the unopened data channel.
        assert_eq!(err.kind(), ErrorKind::Negotiation);
    }

    #[test]
    fn test_guidance_message_wire_shape() {
        let msg = GuidanceMessage::new(
            GuidanceKind::Annotation,
            serde_json::json!({ "stroke": [[0, 0], [10, 10]] }),
            None,
        );
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"kind\":\"annotation\""));
        // Unset duration is omitted entirely rather than null.
        assert!(!json.contains("durationMs"));

        let back: GuidanceMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_guidance_kind_covers_all_wire_names() {
        for (kind, name) in [
            (GuidanceKind::Hint, "\"hint\""),
            (GuidanceKind::Correction, "\"correction\""),
            (GuidanceKind::Encouragement, "\"encouragement\""),
            (GuidanceKind::Annotation, "\"annotation\""),
        ] {
            assert_eq!(serde_json::to_string(&kind).unwrap(), name);
        }
    }
}
