//! Session lifecycle and roster.
//!
//! `SessionManager` owns create/join/leave, the participant roster, and
//! the local role. It is the only writer of the roster; every other
//! component sees roster changes as events. Incoming relay traffic is
//! routed by a single event-pump task: roster messages mutate the
//! roster, negotiation messages are handed to the
//! [`PeerLinkController`], and application messages are re-emitted on
//! the session event bus.
//!
//! Network round-trips (create/join) are bounded: a relay that never
//! answers produces a session error after the configured timeout
//! instead of hanging the caller.

use std::sync::{Arc, RwLock as StdRwLock};

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::config::SessionConfig;
use crate::error::{ErrorKind, ErrorLog, ErrorRecord, SessionError, Severity};
use crate::events::{EventBus, SessionEvent};
use crate::guidance::GuidanceChannel;
use crate::peer_link::PeerLinkController;
use crate::protocol::{
    is_valid_invite_code, Participant, ParticipantInfo, ParticipantState, Role, SignalMessage,
};
use crate::signaling::{SignalingChannel, SignalingEvent, SignalingTransport};

/// What a resolved create/join hands back to the caller.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Relay-issued session id.
    pub session_id: String,
    /// Shareable invite code (present for the creating host).
    pub invite_code: Option<String>,
    /// Local role.
    pub role: Role,
    /// Roster at resolution time.
    pub participants: Vec<Participant>,
    /// When the local side entered the session.
    pub created_at: DateTime<Utc>,
}

/// Live session state. Single-writer: only manager methods and the
/// event pump touch it.
#[derive(Debug, Clone)]
struct ActiveSession {
    session_id: String,
    invite_code: Option<String>,
    role: Role,
    participants: Vec<Participant>,
    created_at: DateTime<Utc>,
    local_info: ParticipantInfo,
}

/// Builder for [`SessionManager`].
#[derive(Default)]
pub struct SessionManagerBuilder {
    config: Option<SessionConfig>,
    transport: Option<Arc<dyn SignalingTransport>>,
    error_log: Option<Arc<ErrorLog>>,
}

impl std::fmt::Debug for SessionManagerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManagerBuilder")
            .field("config", &self.config)
            .field("transport", &self.transport.is_some())
            .finish()
    }
}

impl SessionManagerBuilder {
    /// Set the configuration (defaults otherwise).
    #[must_use]
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Substitute the signaling transport (tests, alternative relays).
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn SignalingTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Share an existing error log instead of creating one.
    #[must_use]
    pub fn error_log(mut self, error_log: Arc<ErrorLog>) -> Self {
        self.error_log = Some(error_log);
        self
    }

    /// Build the manager (and its peer link controller).
    #[must_use]
    pub fn build(self) -> SessionManager {
        let config = self.config.unwrap_or_default();
        let error_log = self
            .error_log
            .unwrap_or_else(|| Arc::new(ErrorLog::new(config.error_log_capacity)));
        let transport = self.transport.unwrap_or_else(|| {
            Arc::new(SignalingChannel::new(
                config.relay_url.clone(),
                config.stale_timeout,
                Arc::clone(&error_log),
            ))
        });
        let events = EventBus::new();
        let peer_link = Arc::new(PeerLinkController::new(
            Arc::clone(&transport),
            config.clone(),
            events.clone(),
            Arc::clone(&error_log),
        ));
        SessionManager {
            transport,
            config,
            events,
            error_log,
            peer_link,
            session: Arc::new(StdRwLock::new(None)),
            pump: Mutex::new(None),
        }
    }
}

/// Owns session lifecycle, the roster, and the local role.
pub struct SessionManager {
    transport: Arc<dyn SignalingTransport>,
    config: SessionConfig,
    events: EventBus,
    error_log: Arc<ErrorLog>,
    peer_link: Arc<PeerLinkController>,
    session: Arc<StdRwLock<Option<ActiveSession>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("session", &self.session_info())
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Create a manager builder.
    #[must_use]
    pub fn builder() -> SessionManagerBuilder {
        SessionManagerBuilder::default()
    }

    /// The shared event bus.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// The peer link this manager owns.
    #[must_use]
    pub fn peer_link(&self) -> Arc<PeerLinkController> {
        Arc::clone(&self.peer_link)
    }

    /// The shared error log.
    #[must_use]
    pub fn error_log(&self) -> Arc<ErrorLog> {
        Arc::clone(&self.error_log)
    }

    /// Guidance sender bound to this session's link.
    #[must_use]
    pub fn guidance(&self) -> GuidanceChannel {
        GuidanceChannel::new(self.peer_link())
    }

    /// Snapshot of the current session, if any.
    pub fn session_info(&self) -> Option<SessionInfo> {
        self.session
            .read()
            .expect("session lock poisoned")
            .as_ref()
            .map(|s| SessionInfo {
                session_id: s.session_id.clone(),
                invite_code: s.invite_code.clone(),
                role: s.role,
                participants: s.participants.clone(),
                created_at: s.created_at,
            })
    }

    /// Local role, if in a session.
    pub fn role(&self) -> Option<Role> {
        self.session
            .read()
            .expect("session lock poisoned")
            .as_ref()
            .map(|s| s.role)
    }

    /// Current roster snapshot.
    pub fn participants(&self) -> Vec<Participant> {
        self.session
            .read()
            .expect("session lock poisoned")
            .as_ref()
            .map(|s| s.participants.clone())
            .unwrap_or_default()
    }

    /// Create a session as host.
    ///
    /// Resolves on `session-created`; rejects with a session error if
    /// the relay answers with `error` or stays silent past the
    /// configured timeout.
    pub async fn create_session(
        &self,
        host_info: ParticipantInfo,
        session_config: serde_json::Value,
    ) -> Result<SessionInfo, SessionError> {
        self.ensure_connected().await?;
        let mut rx = self.transport.subscribe();
        self.transport
            .send(SignalMessage::CreateSession {
                role: Role::Host,
                host_info: host_info.clone(),
                session_config,
            })
            .await?;

        let (session_id, invite_code) = self
            .await_response(&mut rx, "create-session", |msg| match msg {
                SignalMessage::SessionCreated {
                    session_id,
                    invite_code,
                } => Some(Ok((session_id, invite_code))),
                SignalMessage::Error { code, message } => {
                    Some(Err(SessionError::session(format!("{code}: {message}"))))
                }
                _ => None,
            })
            .await?;

        log::info!("[Session] Created {session_id} (invite {invite_code})");
        let created_at = Utc::now();
        *self.session.write().expect("session lock poisoned") = Some(ActiveSession {
            session_id: session_id.clone(),
            invite_code: Some(invite_code.clone()),
            role: Role::Host,
            participants: Vec::new(),
            created_at,
            local_info: host_info,
        });
        self.peer_link.bind(session_id.clone(), Role::Host);
        self.start_pump().await;

        Ok(SessionInfo {
            session_id,
            invite_code: Some(invite_code),
            role: Role::Host,
            participants: Vec::new(),
            created_at,
        })
    }

    /// Join a session as guest.
    ///
    /// A malformed invite code is rejected synchronously, before
    /// anything touches the network.
    pub async fn join_session(
        &self,
        invite_code: &str,
        guest_info: ParticipantInfo,
    ) -> Result<SessionInfo, SessionError> {
        if !is_valid_invite_code(invite_code) {
            return Err(SessionError::session(format!(
                "malformed invite code '{invite_code}'"
            )));
        }

        self.ensure_connected().await?;
        let mut rx = self.transport.subscribe();
        self.transport
            .send(SignalMessage::JoinSession {
                invite_code: invite_code.to_string(),
                role: Role::Guest,
                guest_info: guest_info.clone(),
            })
            .await?;

        let (session_id, role, participants) = self
            .await_response(&mut rx, "join-session", |msg| match msg {
                SignalMessage::SessionJoined {
                    session_id,
                    role,
                    participants,
                } => Some(Ok((session_id, role, participants))),
                SignalMessage::Error { code, message } => {
                    Some(Err(SessionError::session(format!("{code}: {message}"))))
                }
                _ => None,
            })
            .await?;

        log::info!("[Session] Joined {session_id} as {role}");
        let created_at = Utc::now();
        *self.session.write().expect("session lock poisoned") = Some(ActiveSession {
            session_id: session_id.clone(),
            invite_code: Some(invite_code.to_string()),
            role,
            participants: participants.clone(),
            created_at,
            local_info: guest_info,
        });
        self.peer_link.bind(session_id.clone(), role);
        self.start_pump().await;

        Ok(SessionInfo {
            session_id,
            invite_code: Some(invite_code.to_string()),
            role,
            participants,
            created_at,
        })
    }

    /// Leave the current session.
    ///
    /// Idempotent. Cancels the event pump and the peer link (including
    /// any in-flight negotiation watchdog) before the farewell is sent,
    /// so nothing this session owns fires afterwards.
    pub async fn leave_session(&self) {
        if let Some(handle) = self.pump.lock().await.take() {
            handle.abort();
        }

        self.peer_link.close().await;
        self.peer_link.unbind();

        let departed = self.session.write().expect("session lock poisoned").take();
        if let Some(session) = departed {
            if self.transport.is_connected() {
                let farewell = SignalMessage::LeaveSession {
                    session_id: session.session_id.clone(),
                };
                if let Err(e) = self.transport.send(farewell).await {
                    log::debug!("[Session] Farewell not sent: {e}");
                }
            }
            log::info!("[Session] Left {}", session.session_id);
        }
    }

    /// Re-establish signaling and session membership after an outage.
    ///
    /// Guests re-run `join-session` with the remembered invite code and
    /// re-offer the peer link; hosts reconnect signaling and reset the
    /// link so the guest's fresh offer is answerable.
    pub async fn rejoin(&self) -> Result<(), SessionError> {
        let (invite_code, role, local_info) = {
            let guard = self.session.read().expect("session lock poisoned");
            let session = guard
                .as_ref()
                .ok_or_else(|| SessionError::session("no session to rejoin"))?;
            (
                session.invite_code.clone(),
                session.role,
                session.local_info.clone(),
            )
        };

        self.transport.disconnect().await;
        self.transport.connect().await?;
        self.start_pump().await;

        match role {
            Role::Guest => {
                let code = invite_code
                    .ok_or_else(|| SessionError::session("no invite code remembered"))?;
                let mut rx = self.transport.subscribe();
                self.transport
                    .send(SignalMessage::JoinSession {
                        invite_code: code,
                        role: Role::Guest,
                        guest_info: local_info,
                    })
                    .await?;
                let (session_id, role, participants) = self
                    .await_response(&mut rx, "rejoin", |msg| match msg {
                        SignalMessage::SessionJoined {
                            session_id,
                            role,
                            participants,
                        } => Some(Ok((session_id, role, participants))),
                        SignalMessage::Error { code, message } => {
                            Some(Err(SessionError::session(format!("{code}: {message}"))))
                        }
                        _ => None,
                    })
                    .await?;

                {
                    let mut guard = self.session.write().expect("session lock poisoned");
                    if let Some(session) = guard.as_mut() {
                        session.session_id = session_id.clone();
                        session.participants = participants;
                    }
                }
                self.peer_link.bind(session_id, role);
                self.peer_link.restart().await?;
            }
            Role::Host => {
                // The guest re-offers once it recovers; just make sure
                // the stale link does not block the fresh negotiation.
                self.peer_link.restart().await?;
            }
        }

        log::info!("[Session] Rejoined after outage");
        Ok(())
    }

    async fn ensure_connected(&self) -> Result<(), SessionError> {
        if self.transport.is_connected() {
            return Ok(());
        }
        self.transport.connect().await
    }

    /// Wait for the matcher to claim a relay message, bounded by the
    /// session request timeout.
    async fn await_response<T>(
        &self,
        rx: &mut broadcast::Receiver<SignalingEvent>,
        what: &str,
        mut matcher: impl FnMut(SignalMessage) -> Option<Result<T, SessionError>>,
    ) -> Result<T, SessionError> {
        let deadline = self.config.session_request_timeout;
        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(SignalingEvent::Message(msg)) => {
                        if let Some(result) = matcher(msg) {
                            return result;
                        }
                    }
                    Ok(SignalingEvent::Disconnected) => {
                        return Err(SessionError::network(format!(
                            "signaling lost during {what}"
                        )));
                    }
                    Ok(SignalingEvent::Connected) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("[Session] Event stream lagged by {n} during {what}");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(SessionError::network("signaling channel closed"));
                    }
                }
            }
        };

        match tokio::time::timeout(deadline, wait).await {
            Ok(result) => result,
            Err(_) => {
                let err = SessionError::session(format!(
                    "{what} timed out after {}s",
                    deadline.as_secs()
                ));
                self.error_log.record(ErrorRecord::new(
                    ErrorKind::Session,
                    Severity::Medium,
                    err.to_string(),
                ));
                Err(err)
            }
        }
    }

    /// Spawn (or replace) the event pump for the current session.
    async fn start_pump(&self) {
        let mut rx = self.transport.subscribe();
        let session = Arc::clone(&self.session);
        let events = self.events.clone();
        let peer_link = Arc::clone(&self.peer_link);
        let error_log = Arc::clone(&self.error_log);

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(SignalingEvent::Message(msg)) => {
                        Self::handle_relay_message(msg, &session, &events, &peer_link, &error_log)
                            .await;
                    }
                    Ok(SignalingEvent::Connected) => {
                        events.emit(SessionEvent::SignalingConnected);
                    }
                    Ok(SignalingEvent::Disconnected) => {
                        events.emit(SessionEvent::SignalingDisconnected);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("[Session] Pump lagged by {n} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        if let Some(previous) = self.pump.lock().await.replace(handle) {
            previous.abort();
        }
    }

    async fn handle_relay_message(
        msg: SignalMessage,
        session: &Arc<StdRwLock<Option<ActiveSession>>>,
        events: &EventBus,
        peer_link: &Arc<PeerLinkController>,
        error_log: &Arc<ErrorLog>,
    ) {
        let role = session
            .read()
            .expect("session lock poisoned")
            .as_ref()
            .map(|s| s.role);

        match msg {
            SignalMessage::ParticipantJoined { participant } => {
                let added = {
                    let mut guard = session.write().expect("session lock poisoned");
                    match guard.as_mut() {
                        Some(s) if !s.participants.iter().any(|p| p.id == participant.id) => {
                            s.participants.push(participant.clone());
                            true
                        }
                        _ => false,
                    }
                };
                if added {
                    log::info!("[Session] Participant joined: {}", participant.id);
                    events.emit(SessionEvent::ParticipantJoined(participant));
                }
            }
            SignalMessage::ParticipantLeft { participant_id } => {
                // Mark rather than remove: a roster entry that exists in
                // the Disconnected state means "joined then lost".
                let marked = {
                    let mut guard = session.write().expect("session lock poisoned");
                    guard.as_mut().is_some_and(|s| {
                        s.participants
                            .iter_mut()
                            .find(|p| p.id == participant_id)
                            .map(|p| p.connection_state = ParticipantState::Disconnected)
                            .is_some()
                    })
                };
                if marked {
                    log::info!("[Session] Participant disconnected: {participant_id}");
                    events.emit(SessionEvent::ParticipantStateChanged {
                        participant_id,
                        state: ParticipantState::Disconnected,
                    });
                }
            }
            SignalMessage::WebrtcOffer { description, .. } => match role {
                Some(Role::Host) => {
                    if let Err(e) = peer_link.accept_offer(&description).await {
                        log::error!("[Session] Failed to answer offer: {e}");
                        error_log.record(ErrorRecord::new(
                            ErrorKind::Negotiation,
                            Severity::High,
                            format!("failed to answer offer: {e}"),
                        ));
                    }
                }
                _ => log::debug!("[Session] Ignoring offer (not the host)"),
            },
            SignalMessage::WebrtcAnswer { description, .. } => match role {
                Some(Role::Guest) => {
                    if let Err(e) = peer_link.apply_answer(&description).await {
                        log::error!("[Session] Failed to apply answer: {e}");
                        error_log.record(ErrorRecord::new(
                            ErrorKind::Negotiation,
                            Severity::Medium,
                            format!("failed to apply answer: {e}"),
                        ));
                    }
                }
                _ => log::debug!("[Session] Ignoring answer (not the guest)"),
            },
            SignalMessage::WebrtcIceCandidate { candidate, .. } => {
                if let Err(e) = peer_link.apply_remote_candidate(candidate).await {
                    log::warn!("[Session] Rejected remote candidate: {e}");
                }
            }
            message @ (SignalMessage::GameStateSync { .. }
            | SignalMessage::RealTimeAction { .. }) => {
                events.emit(SessionEvent::Data(message));
            }
            SignalMessage::TeacherGuidance { guidance } => {
                events.emit(SessionEvent::Guidance(guidance));
            }
            SignalMessage::Error { code, message } => {
                let record = ErrorRecord::new(
                    ErrorKind::Signaling,
                    Severity::Medium,
                    format!("relay error {code}: {message}"),
                );
                error_log.record(record.clone());
                events.emit(SessionEvent::ErrorRecorded(record));
            }
            // Resolutions of our own requests are consumed by the
            // awaiting callers; everything else is relay chatter.
            _ => {}
        }
    }
}
