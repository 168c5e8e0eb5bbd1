//! Peer link negotiation and the data channel.
//!
//! One peer-to-peer connection per session: media tracks, a single
//! ordered + reliable data channel, and asynchronous ICE candidate
//! exchange, negotiated over the signaling channel.
//!
//! # Initiator rule
//!
//! The guest always initiates; the host only answers. A fixed initiator
//! makes glare (both sides offering at once) impossible without a
//! tie-breaker, and it matches the traffic direction: the guest is the
//! one intending to share its stream and state. The rule is enforced
//! here with permission errors, not by UI convention.
//!
//! # State machine
//!
//! ```text
//! idle → offer-sent (guest)                 → answer-received → connected
//! idle → offer-received (host) → answer-sent                 → connected
//!                                   any non-terminal → failed | closed
//! ```
//!
//! ICE candidates are applied whenever they arrive while the link is not
//! `Failed`/`Closed`; candidates that arrive before the remote
//! description is set are buffered and flushed afterwards, so arrival
//! order relative to the offer/answer does not matter.
//!
//! Negotiation that does not reach `Connected` within the configured
//! window moves the link to `Failed` and records one high-severity
//! negotiation error. The controller never retries on its own - whether
//! to retry the session is the resilience manager's call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};

use bytes::Bytes;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::SessionConfig;
use crate::error::{ErrorKind, ErrorLog, ErrorRecord, SessionError, Severity};
use crate::events::{EventBus, SessionEvent};
use crate::protocol::{IceCandidatePayload, Role, SignalMessage};
use crate::signaling::SignalingTransport;

/// Label of the single data channel the guest opens.
const DATA_CHANNEL_LABEL: &str = "session-data";

/// Signaling progress of the peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkSignalingState {
    /// Nothing negotiated yet.
    Idle,
    /// Guest: offer created and forwarded to the relay.
    OfferSent,
    /// Host: offer arrived, answer not yet produced.
    OfferReceived,
    /// Host: answer forwarded to the relay.
    AnswerSent,
    /// Guest: answer applied, waiting for the transports to connect.
    AnswerReceived,
    /// The peer connection is up.
    Connected,
    /// Negotiation failed or the connection was lost.
    Failed,
    /// Explicitly torn down.
    Closed,
}

/// State of the data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataChannelState {
    /// Created but not yet open.
    Connecting,
    /// Usable.
    Open,
    /// Closed or never created.
    Closed,
}

/// Session identity the link is negotiating for.
#[derive(Debug, Clone)]
struct LinkBinding {
    session_id: String,
    role: Role,
}

/// Drives the host/guest negotiation and owns every piece of peer-link
/// state. Other components read state through accessors and observe
/// events; nothing mutates the link except through these methods.
pub struct PeerLinkController {
    transport: Arc<dyn SignalingTransport>,
    config: SessionConfig,
    events: EventBus,
    error_log: Arc<ErrorLog>,

    binding: Arc<StdRwLock<Option<LinkBinding>>>,
    signaling_state: Arc<StdRwLock<LinkSignalingState>>,
    ice_state: Arc<StdRwLock<RTCIceConnectionState>>,
    dc_state: Arc<StdRwLock<DataChannelState>>,

    pc: Arc<Mutex<Option<Arc<RTCPeerConnection>>>>,
    dc: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,

    /// Candidates that arrived before the remote description was set.
    pending_candidates: Arc<Mutex<Vec<RTCIceCandidateInit>>>,
    remote_desc_set: Arc<AtomicBool>,

    /// Flips to `true` when the peer connection reaches Connected; the
    /// negotiation watchdog watches it so success cancels the timer.
    connected_tx: watch::Sender<bool>,

    watchdog: Mutex<Option<JoinHandle<()>>>,

    /// Local tracks, kept so a resilience-driven restart can re-offer
    /// the same media.
    local_tracks: Mutex<Vec<Arc<dyn TrackLocal + Send + Sync>>>,
    initiated: AtomicBool,
}

impl std::fmt::Debug for PeerLinkController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLinkController")
            .field("signaling_state", &self.signaling_state())
            .field("data_channel_state", &self.data_channel_state())
            .finish_non_exhaustive()
    }
}

impl PeerLinkController {
    /// Create an idle controller.
    pub fn new(
        transport: Arc<dyn SignalingTransport>,
        config: SessionConfig,
        events: EventBus,
        error_log: Arc<ErrorLog>,
    ) -> Self {
        let (connected_tx, _) = watch::channel(false);
        Self {
            transport,
            config,
            events,
            error_log,
            binding: Arc::new(StdRwLock::new(None)),
            signaling_state: Arc::new(StdRwLock::new(LinkSignalingState::Idle)),
            ice_state: Arc::new(StdRwLock::new(RTCIceConnectionState::New)),
            dc_state: Arc::new(StdRwLock::new(DataChannelState::Closed)),
            pc: Arc::new(Mutex::new(None)),
            dc: Arc::new(Mutex::new(None)),
            pending_candidates: Arc::new(Mutex::new(Vec::new())),
            remote_desc_set: Arc::new(AtomicBool::new(false)),
            connected_tx,
            watchdog: Mutex::new(None),
            local_tracks: Mutex::new(Vec::new()),
            initiated: AtomicBool::new(false),
        }
    }

    /// Attach the link to a session. Called by the session manager once
    /// create/join has resolved.
    pub(crate) fn bind(&self, session_id: String, role: Role) {
        *self.binding.write().expect("binding lock poisoned") = Some(LinkBinding {
            session_id,
            role,
        });
    }

    /// Detach from the session and forget negotiation history.
    pub(crate) fn unbind(&self) {
        self.binding.write().expect("binding lock poisoned").take();
        self.initiated.store(false, Ordering::SeqCst);
    }

    /// Role of the local participant, if a session is bound.
    pub fn role(&self) -> Option<Role> {
        self.binding
            .read()
            .expect("binding lock poisoned")
            .as_ref()
            .map(|b| b.role)
    }

    /// Current signaling progress.
    pub fn signaling_state(&self) -> LinkSignalingState {
        *self.signaling_state.read().expect("state lock poisoned")
    }

    /// Mirrored ICE connection state of the underlying peer connection.
    pub fn ice_connection_state(&self) -> RTCIceConnectionState {
        *self.ice_state.read().expect("ice state lock poisoned")
    }

    /// Current data channel state.
    pub fn data_channel_state(&self) -> DataChannelState {
        *self.dc_state.read().expect("dc state lock poisoned")
    }

    /// Register the local media tracks the host will attach when
    /// answering. The guest passes tracks to [`initiate`] directly.
    ///
    /// [`initiate`]: PeerLinkController::initiate
    pub async fn set_local_tracks(&self, tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>) {
        *self.local_tracks.lock().await = tracks;
    }

    fn binding_for(&self, operation: &str) -> Result<LinkBinding, SessionError> {
        self.binding
            .read()
            .expect("binding lock poisoned")
            .clone()
            .ok_or_else(|| {
                SessionError::permission(format!("{operation} requires an active session"))
            })
    }

    /// Guest only: create the local description, attach media, open the
    /// data channel, and forward the offer through the relay.
    pub async fn initiate(
        &self,
        local_tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>,
    ) -> Result<(), SessionError> {
        let binding = self.binding_for("initiate")?;
        if binding.role != Role::Guest {
            return Err(SessionError::permission(
                "only the guest initiates the peer link; the host answers",
            ));
        }
        if self.signaling_state() != LinkSignalingState::Idle {
            return Err(SessionError::negotiation("negotiation already in progress"));
        }

        *self.local_tracks.lock().await = local_tracks.clone();

        let pc = self.build_peer_connection().await?;
        self.wire_peer_callbacks(&pc);

        for track in local_tracks {
            pc.add_track(track)
                .await
                .map_err(|e| SessionError::negotiation(format!("failed to add track: {e}")))?;
        }

        // Ordered + reliable: guidance and game-state messages are
        // delivery- and order-sensitive, so no max-retransmits/lifetime.
        let dc = pc
            .create_data_channel(
                DATA_CHANNEL_LABEL,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| {
                SessionError::negotiation(format!("failed to create data channel: {e}"))
            })?;
        Self::wire_data_channel(
            &dc,
            self.events.clone(),
            Arc::clone(&self.dc_state),
            Arc::clone(&self.error_log),
        );
        Self::set_dc_state(&self.dc_state, &self.events, DataChannelState::Connecting);
        *self.dc.lock().await = Some(dc);

        let offer = pc
            .create_offer(None)
            .await
            .map_err(|e| SessionError::negotiation(format!("failed to create offer: {e}")))?;
        let offer_sdp = offer.sdp.clone();
        pc.set_local_description(offer)
            .await
            .map_err(|e| SessionError::negotiation(format!("failed to set local offer: {e}")))?;

        *self.pc.lock().await = Some(Arc::clone(&pc));
        self.initiated.store(true, Ordering::SeqCst);

        self.transport
            .send(SignalMessage::WebrtcOffer {
                session_id: binding.session_id,
                description: offer_sdp,
            })
            .await?;

        self.set_state(LinkSignalingState::OfferSent);
        self.arm_watchdog().await;
        log::info!("[PeerLink] Offer sent, awaiting answer");
        Ok(())
    }

    /// Host only: answer an incoming offer. Local tracks registered via
    /// [`set_local_tracks`](PeerLinkController::set_local_tracks) are
    /// attached to the answer.
    pub async fn accept_offer(&self, offer_sdp: &str) -> Result<(), SessionError> {
        let binding = self.binding_for("accept_offer")?;
        if binding.role != Role::Host {
            return Err(SessionError::permission(
                "only the host answers offers; the guest initiates",
            ));
        }
        if self.signaling_state() != LinkSignalingState::Idle {
            return Err(SessionError::negotiation("negotiation already in progress"));
        }

        let pc = self.build_peer_connection().await?;
        self.wire_peer_callbacks(&pc);

        // The guest creates the channel; hook its announcement.
        {
            let dc_slot = Arc::clone(&self.dc);
            let dc_state = Arc::clone(&self.dc_state);
            let events = self.events.clone();
            let error_log = Arc::clone(&self.error_log);
            pc.on_data_channel(Box::new(move |incoming: Arc<RTCDataChannel>| {
                let dc_slot = Arc::clone(&dc_slot);
                let dc_state = Arc::clone(&dc_state);
                let events = events.clone();
                let error_log = Arc::clone(&error_log);
                Box::pin(async move {
                    log::info!(
                        "[PeerLink] Data channel announced by guest: {}",
                        incoming.label()
                    );
                    Self::wire_data_channel(&incoming, events.clone(), Arc::clone(&dc_state), error_log);
                    Self::set_dc_state(&dc_state, &events, DataChannelState::Connecting);
                    *dc_slot.lock().await = Some(incoming);
                })
            }));
        }

        let tracks = self.local_tracks.lock().await.clone();
        for track in tracks {
            pc.add_track(track)
                .await
                .map_err(|e| SessionError::negotiation(format!("failed to add track: {e}")))?;
        }

        self.set_state(LinkSignalingState::OfferReceived);

        let offer = RTCSessionDescription::offer(offer_sdp.to_owned())
            .map_err(|e| SessionError::negotiation(format!("invalid offer SDP: {e}")))?;
        pc.set_remote_description(offer)
            .await
            .map_err(|e| SessionError::negotiation(format!("failed to set remote offer: {e}")))?;
        self.remote_desc_set.store(true, Ordering::SeqCst);
        *self.pc.lock().await = Some(Arc::clone(&pc));
        self.flush_pending_candidates(&pc).await;

        let answer = pc
            .create_answer(None)
            .await
            .map_err(|e| SessionError::negotiation(format!("failed to create answer: {e}")))?;
        let answer_sdp = answer.sdp.clone();
        pc.set_local_description(answer)
            .await
            .map_err(|e| SessionError::negotiation(format!("failed to set local answer: {e}")))?;

        self.transport
            .send(SignalMessage::WebrtcAnswer {
                session_id: binding.session_id,
                description: answer_sdp,
            })
            .await?;

        self.set_state(LinkSignalingState::AnswerSent);
        self.arm_watchdog().await;
        log::info!("[PeerLink] Answer sent");
        Ok(())
    }

    /// Guest only: apply the host's answer.
    pub async fn apply_answer(&self, answer_sdp: &str) -> Result<(), SessionError> {
        let binding = self.binding_for("apply_answer")?;
        if binding.role != Role::Guest {
            return Err(SessionError::permission("only the guest applies answers"));
        }
        if self.signaling_state() != LinkSignalingState::OfferSent {
            return Err(SessionError::negotiation(
                "answer arrived without an outstanding offer",
            ));
        }

        let pc = self
            .pc
            .lock()
            .await
            .clone()
            .ok_or_else(|| SessionError::negotiation("no peer connection"))?;

        let answer = RTCSessionDescription::answer(answer_sdp.to_owned())
            .map_err(|e| SessionError::negotiation(format!("invalid answer SDP: {e}")))?;
        pc.set_remote_description(answer)
            .await
            .map_err(|e| SessionError::negotiation(format!("failed to set remote answer: {e}")))?;
        self.remote_desc_set.store(true, Ordering::SeqCst);
        self.flush_pending_candidates(&pc).await;

        self.set_state(LinkSignalingState::AnswerReceived);
        log::info!("[PeerLink] Answer applied, waiting for transports");
        Ok(())
    }

    /// Either role: apply a remote ICE candidate.
    ///
    /// Candidates may legitimately arrive before or after the
    /// offer/answer; anything early is buffered and flushed once the
    /// remote description lands. Candidates for a failed or closed link
    /// are dropped.
    pub async fn apply_remote_candidate(
        &self,
        candidate: IceCandidatePayload,
    ) -> Result<(), SessionError> {
        match self.signaling_state() {
            LinkSignalingState::Failed | LinkSignalingState::Closed => {
                log::debug!("[PeerLink] Dropping candidate for dead link");
                return Ok(());
            }
            _ => {}
        }

        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };

        let pc = self.pc.lock().await.clone();
        match pc {
            Some(pc) if self.remote_desc_set.load(Ordering::SeqCst) => pc
                .add_ice_candidate(init)
                .await
                .map_err(|e| SessionError::negotiation(format!("bad ICE candidate: {e}"))),
            _ => {
                log::debug!("[PeerLink] Buffering early ICE candidate");
                self.pending_candidates.lock().await.push(init);
                Ok(())
            }
        }
    }

    /// Send an application message over the data channel.
    ///
    /// # Errors
    ///
    /// `Negotiation` unless the data channel is open - callers must see
    /// the failure rather than have messages silently dropped.
    pub async fn send_data(&self, message: &SignalMessage) -> Result<(), SessionError> {
        if self.data_channel_state() != DataChannelState::Open {
            return Err(SessionError::negotiation("data channel is not open"));
        }
        let dc = self
            .dc
            .lock()
            .await
            .clone()
            .ok_or_else(|| SessionError::negotiation("data channel is not open"))?;

        let payload = serde_json::to_vec(message).expect("signal message serializable");
        dc.send(&Bytes::from(payload))
            .await
            .map(|_| ())
            .map_err(|e| SessionError::negotiation(format!("data channel send failed: {e}")))
    }

    /// Tear the link down. Idempotent; cancels the negotiation watchdog
    /// so no timer outlives the link.
    pub async fn close(&self) {
        if let Some(handle) = self.watchdog.lock().await.take() {
            handle.abort();
        }

        // Mark the link closed before tearing the transports down, so
        // the state-change callbacks the teardown itself triggers see a
        // terminal state and stay quiet.
        let previous = {
            let mut state = self.signaling_state.write().expect("state lock poisoned");
            std::mem::replace(&mut *state, LinkSignalingState::Closed)
        };
        if previous != LinkSignalingState::Closed {
            self.events
                .emit(SessionEvent::LinkStateChanged(LinkSignalingState::Closed));
            log::info!("[PeerLink] Closed");
        }
        Self::set_dc_state(&self.dc_state, &self.events, DataChannelState::Closed);

        if let Some(dc) = self.dc.lock().await.take() {
            let _ = dc.close().await;
        }
        if let Some(pc) = self.pc.lock().await.take() {
            let _ = pc.close().await;
        }
        self.pending_candidates.lock().await.clear();
        self.remote_desc_set.store(false, Ordering::SeqCst);
        let _ = self.connected_tx.send_replace(false);
    }

    /// Rebuild the link after a recovered outage: closes whatever is
    /// left and, when this side had initiated before (guest), re-offers
    /// with the same local tracks.
    pub async fn restart(&self) -> Result<(), SessionError> {
        self.close().await;
        *self.signaling_state.write().expect("state lock poisoned") = LinkSignalingState::Idle;

        if self.initiated.load(Ordering::SeqCst) && self.role() == Some(Role::Guest) {
            let tracks = self.local_tracks.lock().await.clone();
            self.initiate(tracks).await
        } else {
            Ok(())
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn build_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, SessionError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| SessionError::negotiation(format!("codec registration failed: {e}")))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| SessionError::negotiation(format!("interceptor setup failed: {e}")))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = self
            .config
            .ice_servers
            .iter()
            .map(|s| RTCIceServer {
                urls: s.urls.clone(),
                username: s.username.clone().unwrap_or_default(),
                credential: s.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = api.new_peer_connection(rtc_config).await.map_err(|e| {
            SessionError::negotiation(format!("failed to create peer connection: {e}"))
        })?;
        Ok(Arc::new(pc))
    }

    /// Callbacks common to both roles: connection state, ICE state,
    /// local candidate forwarding, and remote tracks.
    fn wire_peer_callbacks(&self, pc: &Arc<RTCPeerConnection>) {
        {
            let signaling_state = Arc::clone(&self.signaling_state);
            let events = self.events.clone();
            let error_log = Arc::clone(&self.error_log);
            let connected_tx = self.connected_tx.clone();
            pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let signaling_state = Arc::clone(&signaling_state);
                let events = events.clone();
                let error_log = Arc::clone(&error_log);
                let connected_tx = connected_tx.clone();
                Box::pin(async move {
                    log::info!("[PeerLink] Connection state: {state:?}");
                    match state {
                        RTCPeerConnectionState::Connected => {
                            Self::transition(
                                &signaling_state,
                                &events,
                                LinkSignalingState::Connected,
                            );
                            events.emit(SessionEvent::LinkConnected);
                            let _ = connected_tx.send_replace(true);
                        }
                        RTCPeerConnectionState::Failed
                        | RTCPeerConnectionState::Disconnected
                        | RTCPeerConnectionState::Closed => {
                            Self::report_link_loss(
                                &signaling_state,
                                &events,
                                &error_log,
                                "peer connection lost",
                            );
                        }
                        _ => {}
                    }
                })
            }));
        }

        {
            let ice_state = Arc::clone(&self.ice_state);
            pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
                let ice_state = Arc::clone(&ice_state);
                Box::pin(async move {
                    log::debug!("[PeerLink] ICE state: {state:?}");
                    *ice_state.write().expect("ice state lock poisoned") = state;
                })
            }));
        }

        {
            let transport = Arc::clone(&self.transport);
            let binding = Arc::clone(&self.binding);
            pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let transport = Arc::clone(&transport);
                let binding = Arc::clone(&binding);
                Box::pin(async move {
                    let Some(candidate) = candidate else { return };
                    let init = match candidate.to_json() {
                        Ok(init) => init,
                        Err(e) => {
                            log::warn!("[PeerLink] Unserializable local candidate: {e}");
                            return;
                        }
                    };
                    let Some(session_id) = binding
                        .read()
                        .expect("binding lock poisoned")
                        .as_ref()
                        .map(|b| b.session_id.clone())
                    else {
                        return;
                    };
                    let msg = SignalMessage::WebrtcIceCandidate {
                        session_id,
                        candidate: IceCandidatePayload {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        },
                    };
                    if let Err(e) = transport.send(msg).await {
                        log::warn!("[PeerLink] Failed to relay local candidate: {e}");
                    }
                })
            }));
        }

        {
            let events = self.events.clone();
            pc.on_track(Box::new(
                move |track: Arc<TrackRemote>,
                      _receiver: Arc<RTCRtpReceiver>,
                      _transceiver: Arc<RTCRtpTransceiver>| {
                    let events = events.clone();
                    Box::pin(async move {
                        log::info!("[PeerLink] Remote track attached");
                        events.emit(SessionEvent::RemoteTrack(track));
                    })
                },
            ));
        }
    }

    /// Data-channel lifecycle and inbound message decoding.
    fn wire_data_channel(
        dc: &Arc<RTCDataChannel>,
        events: EventBus,
        dc_state: Arc<StdRwLock<DataChannelState>>,
        error_log: Arc<ErrorLog>,
    ) {
        {
            let events = events.clone();
            let dc_state = Arc::clone(&dc_state);
            dc.on_open(Box::new(move || {
                log::info!("[PeerLink] Data channel open");
                Self::set_dc_state(&dc_state, &events, DataChannelState::Open);
                Box::pin(async {})
            }));
        }

        {
            let events = events.clone();
            let dc_state = Arc::clone(&dc_state);
            dc.on_close(Box::new(move || {
                log::info!("[PeerLink] Data channel closed");
                Self::set_dc_state(&dc_state, &events, DataChannelState::Closed);
                Box::pin(async {})
            }));
        }

        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let events = events.clone();
            let error_log = Arc::clone(&error_log);
            Box::pin(async move {
                match serde_json::from_slice::<SignalMessage>(&msg.data) {
                    Ok(SignalMessage::TeacherGuidance { guidance }) => {
                        events.emit(SessionEvent::Guidance(guidance));
                    }
                    Ok(
                        message @ (SignalMessage::GameStateSync { .. }
                        | SignalMessage::RealTimeAction { .. }),
                    ) => {
                        events.emit(SessionEvent::Data(message));
                    }
                    Ok(other) => {
                        log::debug!("[PeerLink] Ignoring data-channel message {other:?}");
                    }
                    Err(e) => {
                        log::warn!("[PeerLink] Undecodable data-channel message: {e}");
                        error_log.record(
                            ErrorRecord::new(
                                ErrorKind::Signaling,
                                Severity::Low,
                                "undecodable data-channel message",
                            )
                            .with_details(e.to_string()),
                        );
                    }
                }
            })
        }));
    }

    async fn flush_pending_candidates(&self, pc: &Arc<RTCPeerConnection>) {
        let pending: Vec<RTCIceCandidateInit> =
            self.pending_candidates.lock().await.drain(..).collect();
        if pending.is_empty() {
            return;
        }
        log::debug!("[PeerLink] Flushing {} buffered candidates", pending.len());
        for init in pending {
            if let Err(e) = pc.add_ice_candidate(init).await {
                log::warn!("[PeerLink] Buffered candidate rejected: {e}");
            }
        }
    }

    /// Arm (or re-arm) the negotiation watchdog: if the link has not
    /// reached `Connected` when the timer fires, it is failed with a
    /// single high-severity negotiation error.
    async fn arm_watchdog(&self) {
        let timeout = self.config.negotiation_timeout;
        let signaling_state = Arc::clone(&self.signaling_state);
        let events = self.events.clone();
        let error_log = Arc::clone(&self.error_log);
        let mut connected_rx = self.connected_tx.subscribe();

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    Self::fail_negotiation(
                        &signaling_state,
                        &events,
                        &error_log,
                        &format!(
                            "negotiation did not complete within {}s",
                            timeout.as_secs()
                        ),
                    );
                }
                _ = connected_rx.changed() => {}
            }
        });

        if let Some(previous) = self.watchdog.lock().await.replace(handle) {
            previous.abort();
        }
    }

    fn set_state(&self, next: LinkSignalingState) {
        Self::transition(&self.signaling_state, &self.events, next);
    }

    fn transition(
        signaling_state: &Arc<StdRwLock<LinkSignalingState>>,
        events: &EventBus,
        next: LinkSignalingState,
    ) {
        {
            let mut state = signaling_state.write().expect("state lock poisoned");
            if *state == next {
                return;
            }
            *state = next;
        }
        events.emit(SessionEvent::LinkStateChanged(next));
    }

    fn set_dc_state(
        dc_state: &Arc<StdRwLock<DataChannelState>>,
        events: &EventBus,
        next: DataChannelState,
    ) {
        {
            let mut state = dc_state.write().expect("dc state lock poisoned");
            if *state == next {
                return;
            }
            *state = next;
        }
        events.emit(SessionEvent::DataChannelStateChanged(next));
    }

    /// Fail a negotiation that never reached `Connected`. Idempotent:
    /// exactly one error record per failed negotiation.
    fn fail_negotiation(
        signaling_state: &Arc<StdRwLock<LinkSignalingState>>,
        events: &EventBus,
        error_log: &Arc<ErrorLog>,
        reason: &str,
    ) {
        {
            let mut state = signaling_state.write().expect("state lock poisoned");
            match *state {
                LinkSignalingState::Connected
                | LinkSignalingState::Failed
                | LinkSignalingState::Closed => return,
                _ => *state = LinkSignalingState::Failed,
            }
        }
        log::warn!("[PeerLink] Negotiation failed: {reason}");
        error_log.record(ErrorRecord::new(
            ErrorKind::Negotiation,
            Severity::High,
            reason,
        ));
        events.emit(SessionEvent::LinkStateChanged(LinkSignalingState::Failed));
        events.emit(SessionEvent::LinkFailed);
    }

    /// A link that was up went down. No negotiation error is recorded -
    /// the resilience manager owns the reaction to post-connect loss.
    fn report_link_loss(
        signaling_state: &Arc<StdRwLock<LinkSignalingState>>,
        events: &EventBus,
        error_log: &Arc<ErrorLog>,
        reason: &str,
    ) {
        let was_connected = {
            let mut state = signaling_state.write().expect("state lock poisoned");
            match *state {
                LinkSignalingState::Connected => {
                    *state = LinkSignalingState::Failed;
                    true
                }
                LinkSignalingState::Failed | LinkSignalingState::Closed => return,
                _ => false,
            }
        };
        if was_connected {
            log::warn!("[PeerLink] {reason}");
            events.emit(SessionEvent::LinkStateChanged(LinkSignalingState::Failed));
            events.emit(SessionEvent::LinkFailed);
        } else {
            Self::fail_negotiation(
                signaling_state,
                events,
                error_log,
                "peer connection failed before negotiation completed",
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeTransport;
    use std::time::Duration;

    fn controller(transport: Arc<FakeTransport>) -> PeerLinkController {
        PeerLinkController::new(
            transport,
            SessionConfig::default(),
            EventBus::new(),
            Arc::new(ErrorLog::new(16)),
        )
    }

    #[tokio::test]
    async fn test_unbound_link_rejects_operations() {
        let link = controller(FakeTransport::shared());
        let err = link.initiate(Vec::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permission);
        let err = link.accept_offer("v=0").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permission);
    }

    #[tokio::test]
    async fn test_host_cannot_initiate() {
        let link = controller(FakeTransport::shared());
        link.bind("sess-1".into(), Role::Host);
        let err = link.initiate(Vec::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permission);
        assert_eq!(link.signaling_state(), LinkSignalingState::Idle);
    }

    #[tokio::test]
    async fn test_guest_cannot_accept_offer() {
        let link = controller(FakeTransport::shared());
        link.bind("sess-1".into(), Role::Guest);
        let err = link.accept_offer("v=0").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permission);
    }

    #[tokio::test]
    async fn test_guest_cannot_apply_answer_without_offer() {
        let link = controller(FakeTransport::shared());
        link.bind("sess-1".into(), Role::Guest);
        let err = link.apply_answer("v=0").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Negotiation);
    }

    #[tokio::test]
    async fn test_send_data_requires_open_channel() {
        let link = controller(FakeTransport::shared());
        link.bind("sess-1".into(), Role::Guest);
        let err = link
            .send_data(&SignalMessage::RealTimeAction {
                action: serde_json::json!({ "move": "e4" }),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Negotiation);
    }

    #[tokio::test]
    async fn test_early_candidates_are_buffered() {
        let link = controller(FakeTransport::shared());
        link.bind("sess-1".into(), Role::Guest);
        let payload = IceCandidatePayload {
            candidate: "candidate:1 1 udp 2130706431 192.0.2.1 54321 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        };
        link.apply_remote_candidate(payload.clone()).await.unwrap();
        assert_eq!(link.pending_candidates.lock().await.len(), 1);

        // A dead link drops candidates instead of buffering more.
        *link.signaling_state.write().unwrap() = LinkSignalingState::Failed;
        link.apply_remote_candidate(payload).await.unwrap();
        assert_eq!(link.pending_candidates.lock().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_negotiation_fails_with_one_high_error() {
        let transport = FakeTransport::shared();
        let link = controller(Arc::clone(&transport));
        link.bind("sess-1".into(), Role::Guest);
        let mut rx = link.events.subscribe();

        // Simulate "offer sent, no answer": enter the waiting state and
        // arm the watchdog without a live peer connection.
        *link.signaling_state.write().unwrap() = LinkSignalingState::OfferSent;
        link.arm_watchdog().await;

        tokio::time::sleep(Duration::from_secs(16)).await;

        assert_eq!(link.signaling_state(), LinkSignalingState::Failed);
        let records = link.error_log.recent();
        let negotiation_errors: Vec<_> = records
            .iter()
            .filter(|r| r.kind == ErrorKind::Negotiation && r.severity == Severity::High)
            .collect();
        assert_eq!(negotiation_errors.len(), 1);

        // Idempotent: a second failure report does not add a record.
        PeerLinkController::fail_negotiation(
            &link.signaling_state,
            &link.events,
            &link.error_log,
            "again",
        );
        assert_eq!(link.error_log.recent().len(), records.len());

        let mut saw_failed = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, SessionEvent::LinkFailed) {
                saw_failed = true;
            }
        }
        assert!(saw_failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_is_quiet_after_connect() {
        let link = controller(FakeTransport::shared());
        link.bind("sess-1".into(), Role::Guest);
        *link.signaling_state.write().unwrap() = LinkSignalingState::OfferSent;
        link.arm_watchdog().await;

        // Connection succeeds before the deadline.
        PeerLinkController::transition(
            &link.signaling_state,
            &link.events,
            LinkSignalingState::Connected,
        );
        let _ = link.connected_tx.send_replace(true);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(link.signaling_state(), LinkSignalingState::Connected);
        assert!(link.error_log.recent().is_empty());
    }

    #[tokio::test]
    async fn test_close_cancels_watchdog_and_is_idempotent() {
        let link = controller(FakeTransport::shared());
        link.bind("sess-1".into(), Role::Guest);
        *link.signaling_state.write().unwrap() = LinkSignalingState::OfferSent;
        link.arm_watchdog().await;

        link.close().await;
        assert_eq!(link.signaling_state(), LinkSignalingState::Closed);
        assert!(link.watchdog.lock().await.is_none());
        link.close().await;
        assert_eq!(link.signaling_state(), LinkSignalingState::Closed);
    }

    #[tokio::test]
    async fn test_guest_initiate_sends_offer() {
        let transport = FakeTransport::shared();
        transport.connect().await.unwrap();
        let link = controller(Arc::clone(&transport));
        link.bind("sess-7".into(), Role::Guest);

        link.initiate(Vec::new()).await.unwrap();

        assert_eq!(link.signaling_state(), LinkSignalingState::OfferSent);
        assert_eq!(link.data_channel_state(), DataChannelState::Connecting);
        let sent = transport.sent();
        let offer = sent.iter().find_map(|m| match m {
            SignalMessage::WebrtcOffer {
                session_id,
                description,
            } => Some((session_id.clone(), description.clone())),
            _ => None,
        });
        let (session_id, description) = offer.expect("offer was sent");
        assert_eq!(session_id, "sess-7");
        assert!(description.contains("m=application"), "offer carries the data channel");

        link.close().await;
    }
}
