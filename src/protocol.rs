//! Wire protocol for the relay and the peer data channel.
//!
//! Every message exchanged with the relay is a JSON envelope tagged by
//! `type` (kebab-case). The data channel reuses the same envelope for the
//! message kinds that flow peer-to-peer once the link is up
//! (`game-state-sync`, `real-time-action`, `teacher-guidance`), so both
//! transports share one serde definition.
//!
//! The signaling channel itself never interprets these bodies; it decodes
//! the envelope and hands it to subscribers verbatim. Unknown `type` tags
//! decode to [`SignalMessage::Unknown`] instead of failing the stream.

use serde::{Deserialize, Serialize};

use crate::guidance::GuidanceMessage;

/// Length of locally generated invite codes.
pub const INVITE_CODE_LEN: usize = 6;

/// Invite-code alphabet. Ambiguity-prone characters (`0/O/1/I`) are
/// excluded so codes survive being read aloud.
const INVITE_CODE_CHARSET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Role of a participant within a session.
///
/// Exactly one `Host` exists per session; everyone else is a `Guest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Session owner; answers peer offers and sends guidance.
    Host,
    /// Session joiner; initiates the peer link.
    Guest,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Host => write!(f, "host"),
            Self::Guest => write!(f, "guest"),
        }
    }
}

/// Connection state of a remote participant as tracked in the roster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantState {
    /// Announced but not yet reachable.
    Connecting,
    /// Reachable.
    Connected,
    /// Reachable but degraded.
    Degraded,
    /// Joined at some point, then lost. Kept in the roster (rather than
    /// removed) to distinguish "joined then lost" from "never joined".
    Disconnected,
}

/// A session participant as carried on the wire and kept in the roster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    /// Relay-issued participant id.
    pub id: String,
    /// Role within the session.
    pub role: Role,
    /// Human-readable name for the UI layer.
    pub display_name: String,
    /// Current connection state.
    pub connection_state: ParticipantState,
}

/// Locally supplied participant details sent on create/join.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    /// Display name shown to the other side.
    pub display_name: String,
}

impl ParticipantInfo {
    /// Convenience constructor.
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
        }
    }
}

/// An ICE candidate as exchanged through the relay.
///
/// Field names follow the browser's `RTCIceCandidateInit` shape so the
/// relay can pass candidates through to a JS peer unmodified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceCandidatePayload {
    /// Candidate SDP line (`candidate:...`).
    pub candidate: String,
    /// Media stream identification tag.
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    /// Index of the media description the candidate belongs to.
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

/// JSON envelope exchanged with the relay (and, for the peer-to-peer
/// kinds, over the data channel).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalMessage {
    /// Client → relay: open a new session.
    CreateSession {
        /// Role of the requester (always `host`).
        role: Role,
        /// Host participant details.
        host_info: ParticipantInfo,
        /// Opaque session configuration forwarded to joiners.
        session_config: serde_json::Value,
    },
    /// Relay → client: session opened.
    SessionCreated {
        /// Relay-issued session id.
        session_id: String,
        /// Short shareable code that maps to `session_id`.
        invite_code: String,
    },
    /// Client → relay: join an existing session by invite code.
    JoinSession {
        /// Invite code as shared by the host.
        invite_code: String,
        /// Role of the requester (always `guest`).
        role: Role,
        /// Guest participant details.
        guest_info: ParticipantInfo,
    },
    /// Relay → client: join succeeded.
    SessionJoined {
        /// Session id the invite code resolved to.
        session_id: String,
        /// Role granted to the joiner.
        role: Role,
        /// Current roster, including the joiner.
        participants: Vec<Participant>,
    },
    /// Relay → clients: a participant entered the session.
    ParticipantJoined {
        /// The new participant.
        participant: Participant,
    },
    /// Relay → clients: a participant left or timed out.
    ParticipantLeft {
        /// Id of the departed participant.
        participant_id: String,
    },
    /// Client ↔ client via relay: SDP offer (guest → host).
    WebrtcOffer {
        /// Session the offer belongs to.
        session_id: String,
        /// Offer SDP.
        description: String,
    },
    /// Client ↔ client via relay: SDP answer (host → guest).
    WebrtcAnswer {
        /// Session the answer belongs to.
        session_id: String,
        /// Answer SDP.
        description: String,
    },
    /// Client ↔ client via relay: ICE candidate (either direction).
    WebrtcIceCandidate {
        /// Session the candidate belongs to.
        session_id: String,
        /// The candidate itself.
        candidate: IceCandidatePayload,
    },
    /// Guest → host: full application state for synchronization.
    GameStateSync {
        /// Session the state belongs to.
        session_id: String,
        /// Opaque application state.
        game_state: serde_json::Value,
    },
    /// Either direction: low-latency interactive action.
    RealTimeAction {
        /// Opaque action payload.
        action: serde_json::Value,
    },
    /// Host → guest: guidance message (hint/correction/...).
    TeacherGuidance {
        /// The guidance body.
        #[serde(flatten)]
        guidance: GuidanceMessage,
    },
    /// Client → relay: leave the session.
    LeaveSession {
        /// Session being left.
        session_id: String,
    },
    /// Relay → client: request failed.
    Error {
        /// Machine-readable error code.
        code: String,
        /// Human-readable description.
        message: String,
    },
    /// Any message type this client does not understand. Newer relays may
    /// emit kinds we do not know about; they are surfaced, not fatal.
    #[serde(other)]
    Unknown,
}

/// Validate an invite code before anything touches the network.
///
/// Accepts 6–8 ASCII-alphanumeric characters, case-insensitive, so
/// relay-issued formats have room to grow past the locally generated
/// [`INVITE_CODE_LEN`].
pub fn is_valid_invite_code(code: &str) -> bool {
    (INVITE_CODE_LEN..=8).contains(&code.len())
        && code.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Generate a shareable invite code.
///
/// The relay issues the authoritative code; this helper exists for relay
/// implementations and test fixtures that need to fabricate one.
pub fn generate_invite_code() -> String {
    (0..INVITE_CODE_LEN)
        .map(|_| {
            let idx = rand::random::<u32>() as usize % INVITE_CODE_CHARSET.len();
            INVITE_CODE_CHARSET[idx] as char
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guidance::GuidanceKind;

    #[test]
    fn test_create_session_envelope_shape() {
        let msg = SignalMessage::CreateSession {
            role: Role::Host,
            host_info: ParticipantInfo::new("Avery"),
            session_config: serde_json::json!({ "mode": "duet" }),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"create-session\""));
        assert!(json.contains("\"displayName\":\"Avery\""));
        assert!(json.contains("\"role\":\"host\""));
    }

    #[test]
    fn test_session_joined_roundtrip() {
        let msg = SignalMessage::SessionJoined {
            session_id: "sess-1".into(),
            role: Role::Guest,
            participants: vec![Participant {
                id: "p-1".into(),
                role: Role::Host,
                display_name: "Avery".into(),
                connection_state: ParticipantState::Connected,
            }],
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"session-joined\""));
        let back: SignalMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_ice_candidate_uses_browser_field_names() {
        let msg = SignalMessage::WebrtcIceCandidate {
            session_id: "sess-1".into(),
            candidate: IceCandidatePayload {
                candidate: "candidate:1 1 udp 2130706431 192.0.2.1 54321 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"webrtc-ice-candidate\""));
        assert!(json.contains("\"sdpMid\":\"0\""));
        assert!(json.contains("\"sdpMLineIndex\":0"));
    }

    #[test]
    fn test_teacher_guidance_flattens_body() {
        let msg = SignalMessage::TeacherGuidance {
            guidance: GuidanceMessage::new(
                GuidanceKind::Hint,
                serde_json::json!({ "text": "try the left corner" }),
                Some(4000),
            ),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"teacher-guidance\""));
        assert!(json.contains("\"kind\":\"hint\""));
        assert!(json.contains("\"durationMs\":4000"));
        let back: SignalMessage = serde_json::from_str(&json).unwrap();
        match back {
            SignalMessage::TeacherGuidance { guidance } => {
                assert_eq!(guidance.kind, GuidanceKind::Hint);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_message_type_is_not_fatal() {
        let json = r#"{"type":"server-maintenance","at":"soon"}"#;
        let msg: SignalMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg, SignalMessage::Unknown);
    }

    #[test]
    fn test_invite_code_validation() {
        assert!(is_valid_invite_code("ABC123"));
        assert!(is_valid_invite_code("abc123"));
        assert!(is_valid_invite_code("ABCD1234"));
        assert!(!is_valid_invite_code(""));
        assert!(!is_valid_invite_code("AB"));
        assert!(!is_valid_invite_code("ABC 12"));
        assert!(!is_valid_invite_code("ABC12345X"));
        assert!(!is_valid_invite_code("ABC-12"));
    }

    #[test]
    fn test_generated_invite_codes_are_valid() {
        for _ in 0..32 {
            let code = generate_invite_code();
            assert_eq!(code.len(), INVITE_CODE_LEN);
            assert!(is_valid_invite_code(&code), "bad code: {code}");
        }
    }
}
