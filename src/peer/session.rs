//! One peer connection's lifecycle.
//!
//! Inbound relay messages and transport callbacks are funnelled through a
//! single driver task per session, so they are handled one at a time in
//! arrival order. State changes commit under a short lock and observers are
//! notified after it is released.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use dashmap::DashSet;
use log::{debug, info, warn};
use pccore::state::{InvalidTransition, PeerState, PeerTransition};
use pccore::store::SubscriptionSet;
use pccore::types::events::{CallEnded, ConnectionStateChanged, Event, RecordingStarted, RecordingStopped};
use pccore::types::{
    Answer, CoreEventBus, EndReason, IceCandidate, Offer, RecordingSegment, Role, SdpType,
    SessionId, SessionInfo, TransportKind,
};
use tokio::sync::{Notify, OnceCell, mpsc};
use tokio::time::timeout;

use super::connection::{
    IceConnectionState, LocalCandidate, PeerConnection, PeerConnectionConfig,
    PeerConnectionEvent, PeerConnectionFactory, PeerError, TransportState,
};
use crate::config::CallConfig;
use crate::error::CallError;
use crate::media::{AudioStream, MediaSource};
use crate::recording::{ChunkRecorder, RecordingSession, SegmentUploader, spawn_upload};
use crate::signaling::SignalingAdapter;
use crate::timer::Timer;

/// Collaborators shared by every session a client creates.
#[derive(Clone)]
pub struct SessionDeps {
    pub signaling: Arc<SignalingAdapter>,
    pub peer_factory: Arc<dyn PeerConnectionFactory>,
    pub media: Arc<dyn MediaSource>,
    pub recorder: Arc<dyn ChunkRecorder>,
    pub uploader: Arc<dyn SegmentUploader>,
    pub events: CoreEventBus,
    pub config: Arc<CallConfig>,
}

#[derive(Debug)]
enum SessionEvent {
    RemoteAnswer(Answer),
    RemoteCandidate(String, IceCandidate),
    OfferChanged(Option<Offer>),
    ConnectTimeout,
}

#[derive(Default)]
struct Core {
    state: PeerState,
    info: Option<SessionInfo>,
    last_error: Option<String>,
    /// Offer revision currently being negotiated.
    revision: u32,
    applied_answer: Option<u32>,
    offer_seen: bool,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidate>,
    ice_restarts: u32,
    /// An ICE restart (ours or the initiator's) is expected to bring the
    /// transport back before the deadline timer fires.
    recovering: bool,
    muted: bool,
}

pub struct PeerSession {
    local_id: String,
    deps: SessionDeps,
    core: Mutex<Core>,
    connection: Mutex<Option<Arc<dyn PeerConnection>>>,
    local_stream: Mutex<Option<Arc<dyn AudioStream>>>,
    recording: tokio::sync::Mutex<Option<RecordingSession>>,
    recording_active: AtomicBool,
    subscriptions: SubscriptionSet,
    seen_candidates: DashSet<String>,
    connect_timer: Mutex<Option<Timer>>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    peer_events_tx: mpsc::UnboundedSender<PeerConnectionEvent>,
    closing: AtomicBool,
    /// Teardown could not remove the session from the relay.
    relay_cleanup_pending: AtomicBool,
    teardown: OnceCell<()>,
    shutdown: Arc<Notify>,
}

impl PeerSession {
    /// Creates an idle session and starts its driver task.
    pub fn new(local_id: impl Into<String>, deps: SessionDeps) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (peer_events_tx, peer_events_rx) = mpsc::unbounded_channel();
        let shutdown = Arc::new(Notify::new());

        let session = Arc::new(Self {
            local_id: local_id.into(),
            deps,
            core: Mutex::new(Core::default()),
            connection: Mutex::new(None),
            local_stream: Mutex::new(None),
            recording: tokio::sync::Mutex::new(None),
            recording_active: AtomicBool::new(false),
            subscriptions: SubscriptionSet::new(),
            seen_candidates: DashSet::new(),
            connect_timer: Mutex::new(None),
            events_tx,
            peer_events_tx,
            closing: AtomicBool::new(false),
            relay_cleanup_pending: AtomicBool::new(false),
            teardown: OnceCell::new(),
            shutdown: shutdown.clone(),
        });

        tokio::spawn(drive(
            Arc::downgrade(&session),
            events_rx,
            peer_events_rx,
            shutdown,
        ));
        session
    }

    fn core(&self) -> std::sync::MutexGuard<'_, Core> {
        self.core.lock().expect("Mutex should not be poisoned")
    }

    pub fn state(&self) -> PeerState {
        self.core().state
    }

    /// Snapshot of the session record, once negotiation has started.
    pub fn info(&self) -> Option<SessionInfo> {
        let core = self.core();
        core.info.clone().map(|mut info| {
            info.state = core.state;
            info.last_error = core.last_error.clone();
            info
        })
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.core().info.as_ref().map(|i| i.session_id.clone())
    }

    pub fn is_initiator(&self) -> bool {
        self.core().info.as_ref().is_some_and(SessionInfo::is_initiator)
    }

    pub fn last_error(&self) -> Option<String> {
        self.core().last_error.clone()
    }

    pub fn ice_restarts(&self) -> u32 {
        self.core().ice_restarts
    }

    /// True once teardown has begun.
    pub fn is_ended(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// True once the session ended with its relay data still in place.
    pub fn needs_relay_cleanup(&self) -> bool {
        self.relay_cleanup_pending.load(Ordering::SeqCst)
    }

    pub fn is_recording(&self) -> bool {
        self.recording_active.load(Ordering::SeqCst)
    }

    pub fn is_muted(&self) -> bool {
        self.core().muted
    }

    fn label(&self) -> String {
        self.session_id()
            .map(|id| id.to_string())
            .unwrap_or_else(|| format!("{}/pending", self.local_id))
    }

    fn connection(&self) -> Result<Arc<dyn PeerConnection>, CallError> {
        self.connection
            .lock()
            .expect("Mutex should not be poisoned")
            .clone()
            .ok_or(CallError::SessionEnded)
    }

    fn ensure_live(&self) -> Result<(), CallError> {
        if self.is_ended() {
            Err(CallError::SessionEnded)
        } else {
            Ok(())
        }
    }

    fn transition(&self, transition: PeerTransition) -> Result<PeerState, CallError> {
        self.transition_with(transition, |_| {})
    }

    /// Applies `transition`, runs `prepare` under the same lock, then
    /// notifies observers.
    fn transition_with(
        &self,
        transition: PeerTransition,
        prepare: impl FnOnce(&mut Core),
    ) -> Result<PeerState, CallError> {
        let (prev, next, session_id) = {
            let mut core = self.core();
            let next = core.state.apply(&transition)?;
            let prev = std::mem::replace(&mut core.state, next);
            if let PeerTransition::Fail { reason } = &transition {
                core.last_error = Some(reason.clone());
            }
            prepare(&mut core);
            (prev, next, core.info.as_ref().map(|i| i.session_id.clone()))
        };

        debug!(target: "Call/Session", "[{}] {prev} -> {next}", self.label());
        let reason = match transition {
            PeerTransition::Fail { reason } => Some(reason),
            _ => None,
        };
        self.deps
            .events
            .dispatch(&Event::ConnectionStateChanged(ConnectionStateChanged {
                session_id,
                transport: TransportKind::Peer,
                state: next,
                reason,
            }));
        Ok(next)
    }

    fn record_error(&self, error: &CallError) {
        self.core().last_error = Some(error.to_string());
    }

    /// Acquires local audio and builds the connection object.
    ///
    /// A media failure leaves the session in `initializing`; the caller is
    /// expected to end it.
    pub async fn initialize(&self) -> Result<(), CallError> {
        self.transition(PeerTransition::Initialize)?;
        let result = self.build_transport().await;
        if let Err(e) = &result {
            warn!(target: "Call/Session", "[{}] Setup failed: {e}", self.label());
            self.record_error(e);
        }
        result
    }

    async fn build_transport(&self) -> Result<(), CallError> {
        let setup = self.deps.config.transport_setup_timeout;
        let stream = timeout(setup, self.deps.media.acquire_audio())
            .await
            .map_err(|_| CallError::Timeout("local audio"))??;
        *self.local_stream.lock().expect("Mutex should not be poisoned") = Some(stream.clone());

        let pc_config = PeerConnectionConfig {
            ice_servers: self.deps.config.ice_servers.clone(),
        };
        let connection = timeout(
            setup,
            self.deps
                .peer_factory
                .create(&pc_config, self.peer_events_tx.clone()),
        )
        .await
        .map_err(|_| CallError::Timeout("peer connection"))??;

        if self.is_ended() {
            // Torn down while we were building; nothing else will close it.
            let _ = connection.close().await;
            stream.stop();
            return Err(CallError::SessionEnded);
        }
        *self.connection.lock().expect("Mutex should not be poisoned") = Some(connection.clone());

        connection.attach_local_audio(stream).await?;
        self.transition(PeerTransition::Initialized)?;
        Ok(())
    }

    /// Starts an outgoing negotiation towards `remote_id`.
    pub async fn create_offer(&self, remote_id: &str) -> Result<SessionId, CallError> {
        let info = SessionInfo::new_outgoing(&self.local_id, remote_id);
        let session_id = info.session_id.clone();
        self.transition_with(PeerTransition::Negotiate, |core| {
            core.info = Some(info);
        })?;

        let negotiation = async {
            let connection = self.connection()?;
            self.subscribe_session(&session_id, Role::Initiator).await?;
            let sdp = connection.create_offer(false).await?;
            let offer = Offer::new(sdp, &self.local_id, remote_id);
            self.deps.signaling.put_offer(&session_id, &offer).await
        };
        if let Err(e) = negotiation.await {
            self.fail(format!("could not send offer: {e}")).await;
            return Err(e);
        }

        self.arm_connect_timer();
        info!(target: "Call/Session", "[{session_id}] Offer sent to {remote_id}");
        Ok(session_id)
    }

    /// Answers an incoming offer.
    pub async fn accept_offer(&self, session_id: SessionId, offer: Offer) -> Result<(), CallError> {
        let info = SessionInfo::new_incoming(session_id.clone(), &self.local_id, &offer.from);
        let revision = offer.revision;
        self.transition_with(PeerTransition::Negotiate, |core| {
            core.info = Some(info);
            core.revision = revision;
        })?;

        let negotiation = async {
            self.subscribe_session(&session_id, Role::Responder).await?;
            self.answer_offer(&session_id, &offer).await
        };
        if let Err(e) = negotiation.await {
            self.fail(format!("could not answer offer: {e}")).await;
            return Err(e);
        }

        if let Err(e) = self
            .deps
            .signaling
            .delete_inbox_entry(&self.local_id, &session_id)
            .await
        {
            warn!(target: "Call/Session", "[{session_id}] Could not withdraw inbox entry: {e}");
        }

        self.arm_connect_timer();
        info!(target: "Call/Session", "[{session_id}] Answered offer from {}", offer.from);
        Ok(())
    }

    async fn answer_offer(&self, session_id: &SessionId, offer: &Offer) -> Result<(), CallError> {
        if offer.sdp.trim().is_empty() {
            return Err(CallError::Negotiation("offer carries no SDP".into()));
        }
        let connection = self.connection()?;
        connection
            .set_remote_description(SdpType::Offer, &offer.sdp)
            .await?;
        self.flush_pending_candidates(&connection).await;

        let has_stream = self
            .local_stream
            .lock()
            .expect("Mutex should not be poisoned")
            .is_some();
        if !has_stream {
            let stream = self.deps.media.acquire_audio().await?;
            *self.local_stream.lock().expect("Mutex should not be poisoned") = Some(stream.clone());
            connection.attach_local_audio(stream).await?;
        }

        let sdp = connection.create_answer().await?;
        let answer = Answer::new(sdp, &self.local_id, offer.revision);
        self.deps.signaling.put_answer(session_id, &answer).await
    }

    /// Registers every relay listener the session needs. Always called before
    /// the write those listeners are meant to observe.
    async fn subscribe_session(&self, session_id: &SessionId, role: Role) -> Result<(), CallError> {
        let signaling = &self.deps.signaling;

        if role == Role::Initiator {
            let tx = self.events_tx.clone();
            signaling
                .subscribe_answer(session_id, &self.subscriptions, move |answer| {
                    let _ = tx.send(SessionEvent::RemoteAnswer(answer));
                })
                .await?;
        }

        let tx = self.events_tx.clone();
        signaling
            .subscribe_ice_candidates(session_id, &self.subscriptions, move |key, candidate| {
                let _ = tx.send(SessionEvent::RemoteCandidate(key, candidate));
            })
            .await?;

        let tx = self.events_tx.clone();
        signaling
            .watch_offer(session_id, &self.subscriptions, move |offer| {
                let _ = tx.send(SessionEvent::OfferChanged(offer));
            })
            .await?;

        if self.is_ended() {
            self.subscriptions.release_all();
            return Err(CallError::SessionEnded);
        }
        Ok(())
    }

    /// Drops the current relay listeners and registers fresh ones.
    pub async fn resubscribe(&self) -> Result<(), CallError> {
        self.ensure_live()?;
        let (session_id, role) = {
            let core = self.core();
            let info = core.info.as_ref().ok_or(CallError::SessionEnded)?;
            (info.session_id.clone(), info.role)
        };
        let released = self.subscriptions.release_all();
        debug!(target: "Call/Session", "[{session_id}] Resubscribing ({released} listeners released)");
        self.subscribe_session(&session_id, role).await?;
        if self.state() != PeerState::Connected {
            self.arm_connect_timer();
        }
        Ok(())
    }

    /// Feeds a remote candidate to the transport.
    ///
    /// Self-originated candidates are dropped. Candidates that arrive before
    /// the remote description are held until it is applied.
    pub async fn on_remote_candidate(&self, candidate: IceCandidate) {
        if candidate.is_from(&self.local_id) {
            debug!(target: "Call/Session", "[{}] Dropping self-originated candidate", self.label());
            return;
        }
        let connection = {
            let mut core = self.core();
            if !core.remote_description_set {
                core.pending_candidates.push(candidate);
                return;
            }
            drop(core);
            match self.connection() {
                Ok(c) => c,
                Err(_) => return,
            }
        };
        self.apply_candidate(connection.as_ref(), &candidate).await;
    }

    async fn apply_candidate(&self, connection: &dyn PeerConnection, candidate: &IceCandidate) {
        match connection.add_ice_candidate(candidate).await {
            Ok(()) => {}
            Err(PeerError::DuplicateCandidate) => {
                debug!(target: "Call/Session", "[{}] Duplicate candidate ignored", self.label());
            }
            Err(e) => {
                warn!(target: "Call/Session", "[{}] Failed to add candidate: {e}", self.label());
            }
        }
    }

    async fn flush_pending_candidates(&self, connection: &Arc<dyn PeerConnection>) {
        let pending = {
            let mut core = self.core();
            core.remote_description_set = true;
            std::mem::take(&mut core.pending_candidates)
        };
        for candidate in pending {
            self.apply_candidate(connection.as_ref(), &candidate).await;
        }
    }

    /// Rewrites the offer with a fresh ICE restart revision.
    ///
    /// Only the initiator restarts; the responder answers the rewritten offer.
    pub async fn restart_ice(&self) -> Result<(), CallError> {
        self.ensure_live()?;
        if !self.deps.signaling.is_online() {
            return Err(CallError::Connectivity("signaling relay is offline".into()));
        }
        let (session_id, remote_id, revision) = {
            let mut core = self.core();
            if !core.state.can_restart_ice() {
                return Err(InvalidTransition {
                    current_state: core.state,
                    attempted: "restart_ice".to_string(),
                }
                .into());
            }
            let info = core.info.as_ref().ok_or(CallError::SessionEnded)?;
            if !info.is_initiator() {
                return Err(CallError::Negotiation(
                    "only the initiator restarts ICE".into(),
                ));
            }
            let ids = (info.session_id.clone(), info.remote_id.clone());
            core.revision += 1;
            (ids.0, ids.1, core.revision)
        };

        let connection = self.connection()?;
        let sdp = connection.create_offer(true).await?;
        let offer = Offer::new(sdp, &self.local_id, &remote_id).restart(revision);
        self.deps.signaling.put_offer(&session_id, &offer).await?;
        info!(target: "Call/Session", "[{session_id}] ICE restart r{revision} sent");
        Ok(())
    }

    pub fn set_muted(&self, muted: bool) {
        let stream = self
            .local_stream
            .lock()
            .expect("Mutex should not be poisoned")
            .clone();
        if let Some(stream) = stream {
            stream.set_enabled(!muted);
        }
        self.core().muted = muted;
    }

    pub async fn start_recording(&self) -> Result<(), CallError> {
        let mut slot = self.recording.lock().await;
        if slot.is_some() {
            return Err(CallError::RecordingActive);
        }
        if self.state() != PeerState::Connected {
            return Err(CallError::NotConnected);
        }
        let session_id = self.session_id().ok_or(CallError::SessionEnded)?;

        let mut tracks = Vec::new();
        let local = self
            .local_stream
            .lock()
            .expect("Mutex should not be poisoned")
            .clone();
        tracks.extend(local);
        if let Some(remote) = self.connection()?.remote_audio() {
            tracks.push(remote);
        }

        let recording =
            RecordingSession::start(self.deps.recorder.as_ref(), session_id.as_str(), tracks)
                .await?;
        *slot = Some(recording);
        self.recording_active.store(true, Ordering::SeqCst);
        self.deps
            .events
            .dispatch(&Event::RecordingStarted(RecordingStarted {
                call_id: session_id.to_string(),
            }));
        Ok(())
    }

    pub async fn stop_recording(&self) -> Result<(), CallError> {
        let recording = self
            .recording
            .lock()
            .await
            .take()
            .ok_or(CallError::RecordingInactive)?;
        self.recording_active.store(false, Ordering::SeqCst);
        let segment = recording.finish().await;
        self.hand_off_segment(segment);
        Ok(())
    }

    fn hand_off_segment(&self, segment: RecordingSegment) {
        self.deps
            .events
            .dispatch(&Event::RecordingStopped(RecordingStopped {
                segment: segment.clone(),
            }));
        spawn_upload(
            self.deps.uploader.clone(),
            segment,
            self.deps.events.clone(),
        );
    }

    /// Ends the session. Safe to call any number of times, concurrently;
    /// exactly one teardown runs and one `CallEnded` is emitted.
    pub async fn end_session(&self) {
        self.teardown(EndReason::LocalHangup).await;
    }

    /// Moves the session to `failed` (when the state allows it) and tears it
    /// down.
    pub async fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.fail_with(reason.clone(), EndReason::Failed(reason))
            .await;
    }

    async fn fail_with(&self, reason: String, end_reason: EndReason) {
        if self.is_ended() {
            return;
        }
        match self.transition(PeerTransition::Fail {
            reason: reason.clone(),
        }) {
            Ok(_) => warn!(target: "Call/Session", "[{}] Failed: {reason}", self.label()),
            Err(e) => debug!(target: "Call/Session", "[{}] Not marking failed: {e}", self.label()),
        }
        self.teardown(end_reason).await;
    }

    async fn teardown(&self, reason: EndReason) {
        self.teardown
            .get_or_init(|| self.run_teardown(reason))
            .await;
    }

    async fn run_teardown(&self, reason: EndReason) {
        self.closing.store(true, Ordering::SeqCst);
        self.cancel_connect_timer();

        let recording = self.recording.lock().await.take();
        if let Some(recording) = recording {
            self.recording_active.store(false, Ordering::SeqCst);
            let segment = recording.finish().await;
            self.hand_off_segment(segment);
        }

        self.subscriptions.release_all();

        let stream = self
            .local_stream
            .lock()
            .expect("Mutex should not be poisoned")
            .take();
        if let Some(stream) = stream {
            stream.stop();
        }

        let connection = self
            .connection
            .lock()
            .expect("Mutex should not be poisoned")
            .take();
        if let Some(connection) = connection
            && let Err(e) = connection.close().await
        {
            warn!(target: "Call/Session", "[{}] Error closing connection: {e}", self.label());
        }

        let session_id = self.session_id();
        if let Some(id) = &session_id
            && let Err(e) = self.deps.signaling.delete_session(id).await
        {
            warn!(target: "Call/Session", "[{id}] Could not delete signaling data: {e}");
            self.relay_cleanup_pending.store(true, Ordering::SeqCst);
        }

        let last = if self.state() == PeerState::Failed {
            PeerTransition::TeardownComplete
        } else {
            PeerTransition::Close
        };
        if let Err(e) = self.transition(last) {
            debug!(target: "Call/Session", "[{}] {e}", self.label());
        }

        info!(target: "Call/Session", "[{}] Session ended: {reason}", self.label());
        self.deps.events.dispatch(&Event::CallEnded(CallEnded {
            session_id,
            transport: TransportKind::Peer,
            reason,
        }));
        self.shutdown.notify_one();
    }

    fn arm_connect_timer(&self) {
        let tx = self.events_tx.clone();
        let timer = Timer::start(self.deps.config.connect_timeout, move || async move {
            let _ = tx.send(SessionEvent::ConnectTimeout);
        });
        *self.connect_timer.lock().expect("Mutex should not be poisoned") = Some(timer);
    }

    fn cancel_connect_timer(&self) {
        let timer = self
            .connect_timer
            .lock()
            .expect("Mutex should not be poisoned")
            .take();
        if let Some(mut timer) = timer {
            timer.cancel();
        }
    }

    async fn handle_event(&self, event: SessionEvent) {
        if self.is_ended() {
            return;
        }
        match event {
            SessionEvent::RemoteAnswer(answer) => self.on_remote_answer(answer).await,
            SessionEvent::RemoteCandidate(key, candidate) => {
                if self.seen_candidates.insert(key) {
                    self.on_remote_candidate(candidate).await;
                } else {
                    debug!(target: "Call/Session", "[{}] Candidate redelivered, skipping", self.label());
                }
            }
            SessionEvent::OfferChanged(offer) => self.on_offer_changed(offer).await,
            SessionEvent::ConnectTimeout => {
                if self.state() == PeerState::Connected {
                    return;
                }
                if !self.deps.signaling.is_online() {
                    debug!(
                        target: "Call/Session",
                        "[{}] Connect deadline passed while relay is offline; rearming", self.label()
                    );
                    self.arm_connect_timer();
                } else {
                    self.fail_with(
                        "connection was not established in time".into(),
                        EndReason::Timeout,
                    )
                    .await;
                }
            }
        }
    }

    async fn on_remote_answer(&self, answer: Answer) {
        {
            let mut core = self.core();
            let expected = core.revision;
            if !core.info.as_ref().is_some_and(SessionInfo::is_initiator)
                || answer.revision != expected
                || core.applied_answer == Some(expected)
            {
                debug!(target: "Call/Session", "Ignoring answer r{} (expecting r{expected})", answer.revision);
                return;
            }
            core.applied_answer = Some(expected);
        }

        let connection = match self.connection() {
            Ok(c) => c,
            Err(_) => return,
        };
        if let Err(e) = connection
            .set_remote_description(SdpType::Answer, &answer.sdp)
            .await
        {
            self.fail(format!("could not apply answer: {e}")).await;
            return;
        }
        self.flush_pending_candidates(&connection).await;
        debug!(target: "Call/Session", "[{}] Answer r{} applied", self.label(), answer.revision);
    }

    async fn on_offer_changed(&self, offer: Option<Offer>) {
        let Some(offer) = offer else {
            let (seen, reason) = {
                let core = self.core();
                let initiator = core.info.as_ref().is_some_and(SessionInfo::is_initiator);
                let reason = if initiator && core.applied_answer.is_none() {
                    EndReason::Rejected
                } else {
                    EndReason::RemoteHangup
                };
                (core.offer_seen, reason)
            };
            if seen {
                info!(target: "Call/Session", "[{}] Remote side ended the session", self.label());
                self.teardown(reason).await;
            }
            return;
        };

        let restart = {
            let mut core = self.core();
            core.offer_seen = true;
            let responder = core.info.as_ref().is_some_and(|i| !i.is_initiator());
            if responder && offer.revision > core.revision {
                core.revision = offer.revision;
                core.recovering = true;
                true
            } else {
                false
            }
        };
        if !restart {
            return;
        }

        let Some(session_id) = self.session_id() else {
            return;
        };
        info!(target: "Call/Session", "[{session_id}] Answering ICE restart r{}", offer.revision);
        match self.answer_offer(&session_id, &offer).await {
            Ok(()) => {}
            Err(CallError::StaleRevision { answered, current }) => {
                debug!(
                    target: "Call/Session",
                    "[{session_id}] Restart r{answered} superseded by r{current}"
                );
            }
            Err(e) => self.fail(format!("could not answer ICE restart: {e}")).await,
        }
    }

    async fn handle_peer_event(&self, event: PeerConnectionEvent) {
        if self.is_ended() {
            return;
        }
        match event {
            PeerConnectionEvent::LocalCandidate(candidate) => {
                self.publish_local_candidate(candidate).await
            }
            PeerConnectionEvent::TransportState(state) => self.on_transport_state(state).await,
            PeerConnectionEvent::IceState(state) => match state {
                IceConnectionState::Disconnected | IceConnectionState::Failed => {
                    self.on_connectivity_failure(format!("ICE connectivity {state:?}"))
                        .await
                }
                other => debug!(target: "Call/Session", "[{}] ICE {other:?}", self.label()),
            },
        }
    }

    async fn publish_local_candidate(&self, candidate: LocalCandidate) {
        let Some(session_id) = self.session_id() else {
            debug!(target: "Call/Session", "Local candidate before negotiation, dropping");
            return;
        };
        let record = IceCandidate {
            candidate: candidate.candidate,
            media_id: candidate.media_id,
            media_line_index: candidate.media_line_index,
            from: self.local_id.clone(),
            timestamp: 0,
        };
        if let Err(e) = self
            .deps
            .signaling
            .push_ice_candidate(&session_id, &record)
            .await
        {
            warn!(target: "Call/Session", "[{session_id}] Could not publish candidate: {e}");
        }
    }

    async fn on_transport_state(&self, state: TransportState) {
        match state {
            TransportState::Connected => {
                self.cancel_connect_timer();
                {
                    let mut core = self.core();
                    core.recovering = false;
                    core.ice_restarts = 0;
                }
                if self.state() != PeerState::Connected
                    && self.transition(PeerTransition::TransportConnected).is_ok()
                {
                    info!(target: "Call/Session", "[{}] Connected", self.label());
                }
            }
            TransportState::Disconnected => {
                if self
                    .transition(PeerTransition::TransportDisconnected)
                    .is_ok()
                {
                    self.arm_connect_timer();
                }
            }
            TransportState::Failed => {
                self.on_connectivity_failure("transport failed".into())
                    .await
            }
            other => debug!(target: "Call/Session", "[{}] Transport {other:?}", self.label()),
        }
    }

    /// ICE restarts happen here only while the relay is reachable; with the
    /// relay offline, recovery belongs to the reconnection supervisor.
    async fn on_connectivity_failure(&self, reason: String) {
        if !self.deps.signaling.is_online() {
            info!(
                target: "Call/Session",
                "[{}] {reason} while relay is offline; deferring to reconnection", self.label()
            );
            let _ = self.transition(PeerTransition::TransportDisconnected);
            return;
        }

        let max = self.deps.config.max_ice_restarts;
        let (initiator, state, exhausted) = {
            let mut core = self.core();
            if core.recovering {
                debug!(target: "Call/Session", "{reason} during ICE restart; waiting");
                return;
            }
            let exhausted = core.ice_restarts >= max;
            if !exhausted {
                core.ice_restarts += 1;
                core.recovering = true;
            }
            let initiator = core.info.as_ref().is_some_and(SessionInfo::is_initiator);
            (initiator, core.state, exhausted)
        };

        if exhausted {
            self.fail(reason).await;
            return;
        }

        if initiator {
            if !state.can_restart_ice() {
                self.fail(reason).await;
                return;
            }
            match self.restart_ice().await {
                Ok(()) => self.arm_connect_timer(),
                Err(e) => self.fail(format!("{reason}; ICE restart failed: {e}")).await,
            }
        } else {
            let _ = self.transition(PeerTransition::TransportDisconnected);
            self.arm_connect_timer();
        }
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        self.shutdown.notify_one();
    }
}

async fn drive(
    session: Weak<PeerSession>,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    mut peer_events: mpsc::UnboundedReceiver<PeerConnectionEvent>,
    shutdown: Arc<Notify>,
) {
    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            Some(event) = events.recv() => {
                let Some(session) = session.upgrade() else { break };
                session.handle_event(event).await;
            }
            Some(event) = peer_events.recv() => {
                let Some(session) = session.upgrade() else { break };
                session.handle_peer_event(event).await;
            }
            else => break,
        }
    }
    debug!(target: "Call/Session", "Session driver stopped");
}
