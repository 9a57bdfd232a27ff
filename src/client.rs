//! The call facade.
//!
//! [`CallClient`] is the single entry point for placing, answering and
//! controlling calls. It picks the peer or the gateway transport per
//! destination and owns at most one active call at a time.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashSet;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use log::{debug, info, warn};
use pccore::destination::{Destination, DestinationError, is_dtmf_digit};
use pccore::rate_limit::RateLimiter;
use pccore::state::PeerState;
use pccore::store::{SignalingStore, SubscriptionSet};
use pccore::types::events::{CallEnded, ConnectionStateChanged, Event, IncomingCall};
use pccore::types::{
    CoreEventBus, EndReason, EventHandler, HandlerId, Offer, SessionId, TransportKind,
};

use crate::config::CallConfig;
use crate::context::SignalingContext;
use crate::error::CallError;
use crate::gateway::{GatewayCall, GatewayIncoming, GatewayTransport, IncomingHandler};
use crate::media::MediaSource;
use crate::peer::{PeerConnectionFactory, PeerSession, SessionDeps};
use crate::reconnect::{ReconnectSupervisor, RecoveryTarget};
use crate::recording::{ChunkRecorder, SegmentUploader};
use crate::signaling::OfferEvent;

/// External collaborators the client drives.
#[derive(Clone)]
pub struct CallDeps {
    pub store: Arc<dyn SignalingStore>,
    pub peer_factory: Arc<dyn PeerConnectionFactory>,
    pub media: Arc<dyn MediaSource>,
    /// Phone-number destinations are unsupported without a gateway.
    pub gateway: Option<Arc<dyn GatewayTransport>>,
    pub recorder: Arc<dyn ChunkRecorder>,
    pub uploader: Arc<dyn SegmentUploader>,
}

type InitFuture = Shared<BoxFuture<'static, Result<(), CallError>>>;

enum InitState {
    NotStarted,
    InFlight(InitFuture),
    Ready,
}

struct GatewayCallHandle {
    id: u64,
    call: Arc<dyn GatewayCall>,
}

enum ActiveCall {
    Peer(Arc<PeerSession>),
    Gateway(GatewayCallHandle),
}

enum PendingIncoming {
    Peer { session_id: SessionId, offer: Offer },
    Gateway(Arc<dyn GatewayIncoming>),
}

impl PendingIncoming {
    fn from(&self) -> &str {
        match self {
            Self::Peer { offer, .. } => &offer.from,
            Self::Gateway(incoming) => incoming.from(),
        }
    }
}

struct ClientInner {
    weak_self: Weak<ClientInner>,
    context: Arc<SignalingContext>,
    deps: CallDeps,
    config: Arc<CallConfig>,
    events: CoreEventBus,
    init: Mutex<InitState>,
    rate_limiter: Mutex<RateLimiter>,
    active: Mutex<Option<ActiveCall>>,
    /// Set while a call is being placed or answered, before it is active.
    placing: AtomicBool,
    pending: Mutex<Option<PendingIncoming>>,
    discovery: SubscriptionSet,
    /// Ended sessions whose relay data could not be removed yet.
    stale_sessions: DashSet<SessionId>,
    supervisor: Mutex<Option<ReconnectSupervisor>>,
    next_gateway_call: AtomicU64,
}

/// Cheap to clone; clones share the same engine.
#[derive(Clone)]
pub struct CallClient {
    inner: Arc<ClientInner>,
}

impl CallClient {
    pub fn new(deps: CallDeps, config: CallConfig) -> Self {
        let context = Arc::new(SignalingContext::new(deps.store.clone()));
        Self::with_context(context, deps, config)
    }

    /// Builds a client on an existing signaling context.
    pub fn with_context(context: Arc<SignalingContext>, deps: CallDeps, config: CallConfig) -> Self {
        let inner = Arc::new_cyclic(|weak_self| ClientInner {
            weak_self: weak_self.clone(),
            context,
            deps,
            rate_limiter: Mutex::new(config.rate_limiter()),
            config: Arc::new(config),
            events: CoreEventBus::new(),
            init: Mutex::new(InitState::NotStarted),
            active: Mutex::new(None),
            placing: AtomicBool::new(false),
            pending: Mutex::new(None),
            discovery: SubscriptionSet::new(),
            stale_sessions: DashSet::new(),
            supervisor: Mutex::new(None),
            next_gateway_call: AtomicU64::new(1),
        });

        let weak = Arc::downgrade(&inner);
        inner.events.add_handler(Arc::new(move |event: &Event| {
            if let Event::CallEnded(ended) = event
                && ended.transport == TransportKind::Peer
                && let Some(inner) = weak.upgrade()
            {
                inner.reap_ended_session();
            }
        }));

        Self { inner }
    }

    /// Authenticates against the relay and starts listening for calls.
    ///
    /// Concurrent callers share one in-flight attempt and all see its result.
    /// A failed attempt is forgotten so the next call starts afresh; success
    /// is kept until [`Self::shutdown`].
    pub async fn initialize(&self, credential: &str, local_id: &str) -> Result<(), CallError> {
        let attempt = {
            let mut state = self.inner.init.lock().expect("Mutex should not be poisoned");
            match &*state {
                InitState::Ready => return Ok(()),
                InitState::InFlight(attempt) => attempt.clone(),
                InitState::NotStarted => {
                    let inner = self.inner.clone();
                    let credential = credential.to_string();
                    let local_id = local_id.to_string();
                    let attempt = async move { inner.run_initialize(&credential, &local_id).await }
                        .boxed()
                        .shared();
                    *state = InitState::InFlight(attempt.clone());
                    attempt
                }
            }
        };

        let result = attempt.clone().await;

        let mut state = self.inner.init.lock().expect("Mutex should not be poisoned");
        if let InitState::InFlight(current) = &*state
            && Shared::ptr_eq(current, &attempt)
        {
            *state = match &result {
                Ok(()) => InitState::Ready,
                Err(_) => InitState::NotStarted,
            };
        }
        result
    }

    pub fn is_initialized(&self) -> bool {
        matches!(
            *self.inner.init.lock().expect("Mutex should not be poisoned"),
            InitState::Ready
        )
    }

    /// Ends any call, stops listening and forgets the relay session.
    pub async fn shutdown(&self) {
        *self.inner.init.lock().expect("Mutex should not be poisoned") = InitState::NotStarted;

        let supervisor = self
            .inner
            .supervisor
            .lock()
            .expect("Mutex should not be poisoned")
            .take();
        if let Some(supervisor) = supervisor {
            supervisor.stop();
        }
        self.inner.discovery.release_all();
        if let Some(gateway) = &self.inner.deps.gateway {
            gateway.set_incoming_handler(None);
        }
        self.inner.take_pending();

        if let Err(e) = self.hangup().await {
            warn!(target: "Call/Client", "Error ending call during shutdown: {e}");
        }
        self.inner.context.shutdown();
        info!(target: "Call/Client", "Call client shut down");
    }

    /// Places a call. Returns which transport carries it.
    pub async fn call(&self, destination: &str) -> Result<TransportKind, CallError> {
        let destination = Destination::parse(destination)?;
        self.ensure_initialized()?;
        if let Destination::Peer(remote_id) = &destination
            && self.inner.context.local_id().as_deref() == Some(remote_id.as_str())
        {
            return Err(DestinationError::Unrecognized(remote_id.clone()).into());
        }

        if self.inner.is_busy() || self.inner.placing.swap(true, Ordering::SeqCst) {
            return Err(CallError::Busy);
        }
        let _guard = scopeguard::guard((), |_| {
            self.inner.placing.store(false, Ordering::SeqCst);
        });

        self.inner
            .rate_limiter
            .lock()
            .expect("Mutex should not be poisoned")
            .try_acquire(Instant::now())?;

        let transport = destination.transport();
        match destination {
            Destination::Peer(remote_id) => self.inner.call_peer(&remote_id).await?,
            Destination::Phone(number) => self.inner.call_gateway(&number).await?,
        }
        Ok(transport)
    }

    /// Answers the ringing incoming call.
    pub async fn accept_incoming(&self) -> Result<TransportKind, CallError> {
        self.ensure_initialized()?;

        if self.inner.is_busy() || self.inner.placing.swap(true, Ordering::SeqCst) {
            return Err(CallError::Busy);
        }
        let _guard = scopeguard::guard((), |_| {
            self.inner.placing.store(false, Ordering::SeqCst);
        });

        let pending = self.inner.take_pending().ok_or(CallError::NoIncomingCall)?;
        match pending {
            PendingIncoming::Peer { session_id, offer } => {
                self.inner.answer_peer(session_id, offer).await?;
                Ok(TransportKind::Peer)
            }
            PendingIncoming::Gateway(incoming) => {
                let call = incoming.accept().await?;
                self.inner.activate_gateway_call(call);
                Ok(TransportKind::Gateway)
            }
        }
    }

    pub async fn reject_incoming(&self) -> Result<(), CallError> {
        let pending = self.inner.take_pending().ok_or(CallError::NoIncomingCall)?;
        let (session_id, transport) = match pending {
            PendingIncoming::Peer { session_id, offer } => {
                // The caller treats a vanished offer as a rejection.
                let deleted = self
                    .inner
                    .context
                    .signaling()
                    .delete_session(&session_id)
                    .await;
                if let Err(e) = deleted {
                    self.inner.stale_sessions.insert(session_id);
                    return Err(e);
                }
                info!(target: "Call/Client", "Rejected call from {}", offer.from);
                (Some(session_id), TransportKind::Peer)
            }
            PendingIncoming::Gateway(incoming) => {
                incoming.reject().await?;
                info!(target: "Call/Client", "Rejected gateway call from {}", incoming.from());
                (None, TransportKind::Gateway)
            }
        };
        self.inner.events.dispatch(&Event::CallEnded(CallEnded {
            session_id,
            transport,
            reason: EndReason::Rejected,
        }));
        Ok(())
    }

    /// Ends the active call. A no-op when there is none.
    pub async fn hangup(&self) -> Result<(), CallError> {
        let active = self
            .inner
            .active
            .lock()
            .expect("Mutex should not be poisoned")
            .take();
        match active {
            None => Ok(()),
            Some(ActiveCall::Peer(session)) => {
                session.end_session().await;
                self.inner.track_relay_cleanup(&session);
                Ok(())
            }
            Some(ActiveCall::Gateway(handle)) => {
                let result = handle.call.disconnect().await;
                self.inner.events.dispatch(&Event::CallEnded(CallEnded {
                    session_id: None,
                    transport: TransportKind::Gateway,
                    reason: EndReason::LocalHangup,
                }));
                Ok(result?)
            }
        }
    }

    /// Flips mute on the active call and returns the new mute state.
    pub fn toggle_mute(&self) -> Result<bool, CallError> {
        let active = self.inner.active.lock().expect("Mutex should not be poisoned");
        match active.as_ref() {
            None => Err(CallError::NoActiveCall),
            Some(ActiveCall::Peer(session)) => {
                let muted = !session.is_muted();
                session.set_muted(muted);
                Ok(muted)
            }
            Some(ActiveCall::Gateway(handle)) => {
                let muted = !handle.call.is_muted();
                handle.call.mute(muted);
                Ok(muted)
            }
        }
    }

    pub async fn send_tone(&self, digit: char) -> Result<(), CallError> {
        if !is_dtmf_digit(digit) {
            return Err(CallError::InvalidTone(digit));
        }
        let call = match self.inner.active.lock().expect("Mutex should not be poisoned").as_ref() {
            None => return Err(CallError::NoActiveCall),
            Some(ActiveCall::Peer(_)) => return Err(CallError::Unsupported("DTMF")),
            Some(ActiveCall::Gateway(handle)) => handle.call.clone(),
        };
        Ok(call.send_tone(digit).await?)
    }

    pub async fn start_recording(&self) -> Result<(), CallError> {
        self.active_peer_session()?.start_recording().await
    }

    pub async fn stop_recording(&self) -> Result<(), CallError> {
        self.active_peer_session()?.stop_recording().await
    }

    pub fn is_recording(&self) -> bool {
        self.inner
            .current_session()
            .is_some_and(|session| session.is_recording())
    }

    /// State of the active call; gateway calls report `Connected`.
    pub fn connection_state(&self) -> Option<PeerState> {
        match self.inner.active.lock().expect("Mutex should not be poisoned").as_ref() {
            None => None,
            Some(ActiveCall::Peer(session)) => Some(session.state()),
            Some(ActiveCall::Gateway(_)) => Some(PeerState::Connected),
        }
    }

    pub fn active_session_id(&self) -> Option<SessionId> {
        self.inner
            .current_session()
            .and_then(|session| session.session_id())
    }

    /// Who is calling, while an incoming call is ringing.
    pub fn incoming_from(&self) -> Option<String> {
        self.inner
            .pending
            .lock()
            .expect("Mutex should not be poisoned")
            .as_ref()
            .map(|p| p.from().to_string())
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner
            .supervisor
            .lock()
            .expect("Mutex should not be poisoned")
            .as_ref()
            .map_or(0, ReconnectSupervisor::reconnect_attempts)
    }

    pub fn is_reconnecting(&self) -> bool {
        self.inner
            .supervisor
            .lock()
            .expect("Mutex should not be poisoned")
            .as_ref()
            .is_some_and(ReconnectSupervisor::is_reconnecting)
    }

    /// Registers an observer; every registered handler sees every event.
    pub fn add_handler(&self, handler: Arc<dyn EventHandler>) -> HandlerId {
        self.inner.events.add_handler(handler)
    }

    pub fn remove_handler(&self, id: HandlerId) -> bool {
        self.inner.events.remove_handler(id)
    }

    pub fn events(&self) -> &CoreEventBus {
        &self.inner.events
    }

    pub fn config(&self) -> &CallConfig {
        &self.inner.config
    }

    fn ensure_initialized(&self) -> Result<(), CallError> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(CallError::NotInitialized)
        }
    }

    fn active_peer_session(&self) -> Result<Arc<PeerSession>, CallError> {
        match self.inner.active.lock().expect("Mutex should not be poisoned").as_ref() {
            None => Err(CallError::NoActiveCall),
            Some(ActiveCall::Peer(session)) => Ok(session.clone()),
            Some(ActiveCall::Gateway(_)) => Err(CallError::Unsupported("recording")),
        }
    }
}

impl ClientInner {
    async fn run_initialize(self: Arc<Self>, credential: &str, local_id: &str) -> Result<(), CallError> {
        self.context
            .init(credential, local_id, self.config.relay_init_timeout)
            .await?;

        if let Err(e) = self.subscribe_discovery().await {
            self.discovery.release_all();
            self.context.shutdown();
            return Err(e);
        }

        if let Some(gateway) = &self.deps.gateway {
            let weak = Arc::downgrade(&self);
            let handler: IncomingHandler = Arc::new(move |incoming| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_gateway_incoming(incoming);
                }
            });
            gateway.set_incoming_handler(Some(handler));
        }

        let target: Weak<dyn RecoveryTarget> = Arc::downgrade(&self) as Weak<dyn RecoveryTarget>;
        let supervisor = ReconnectSupervisor::start(
            self.context.signaling(),
            target,
            self.events.clone(),
            &self.config,
        );
        let previous = self
            .supervisor
            .lock()
            .expect("Mutex should not be poisoned")
            .replace(supervisor);
        if let Some(previous) = previous {
            previous.stop();
        }

        info!(target: "Call/Client", "Call client initialized as {local_id}");
        Ok(())
    }

    /// Listens for offers addressed to us, replacing any previous listener.
    async fn subscribe_discovery(&self) -> Result<(), CallError> {
        let local_id = self.local_id()?;
        self.discovery.release_all();
        let weak = self.weak_self.clone();
        self.context
            .signaling()
            .subscribe_offers(&local_id, &self.discovery, move |event| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_offer_event(event);
                }
            })
            .await
    }

    fn session_deps(&self) -> SessionDeps {
        SessionDeps {
            signaling: self.context.signaling().clone(),
            peer_factory: self.deps.peer_factory.clone(),
            media: self.deps.media.clone(),
            recorder: self.deps.recorder.clone(),
            uploader: self.deps.uploader.clone(),
            events: self.events.clone(),
            config: self.config.clone(),
        }
    }

    fn is_busy(&self) -> bool {
        self.active
            .lock()
            .expect("Mutex should not be poisoned")
            .is_some()
    }

    fn current_session(&self) -> Option<Arc<PeerSession>> {
        match self.active.lock().expect("Mutex should not be poisoned").as_ref() {
            Some(ActiveCall::Peer(session)) => Some(session.clone()),
            _ => None,
        }
    }

    fn take_pending(&self) -> Option<PendingIncoming> {
        self.pending
            .lock()
            .expect("Mutex should not be poisoned")
            .take()
    }

    fn set_active_session(&self, session: &Arc<PeerSession>) {
        *self.active.lock().expect("Mutex should not be poisoned") =
            Some(ActiveCall::Peer(session.clone()));
    }

    /// Clears the active slot if it still holds `session`.
    fn clear_active_session(&self, session: &Arc<PeerSession>) {
        let mut active = self.active.lock().expect("Mutex should not be poisoned");
        if matches!(active.as_ref(), Some(ActiveCall::Peer(s)) if Arc::ptr_eq(s, session)) {
            *active = None;
        }
    }

    fn reap_ended_session(&self) {
        let mut active = self.active.lock().expect("Mutex should not be poisoned");
        if let Some(ActiveCall::Peer(session)) = active.as_ref()
            && session.is_ended()
        {
            debug!(target: "Call/Client", "Active call ended");
            self.track_relay_cleanup(session);
            *active = None;
        }
    }

    fn track_relay_cleanup(&self, session: &PeerSession) {
        if session.needs_relay_cleanup()
            && let Some(session_id) = session.session_id()
        {
            debug!(target: "Call/Client", "[{session_id}] Relay cleanup deferred");
            self.stale_sessions.insert(session_id);
        }
    }

    /// Removes the relay data of sessions that ended while it was unreachable.
    async fn flush_stale_sessions(&self) {
        let stale: Vec<SessionId> = self.stale_sessions.iter().map(|id| id.clone()).collect();
        for session_id in stale {
            match self.context.signaling().delete_session(&session_id).await {
                Ok(()) => {
                    self.stale_sessions.remove(&session_id);
                    info!(target: "Call/Client", "[{session_id}] Removed leftover relay data");
                }
                Err(e) => {
                    warn!(target: "Call/Client", "[{session_id}] Leftover relay data remains: {e}");
                }
            }
        }
    }

    fn local_id(&self) -> Result<String, CallError> {
        self.context.local_id().ok_or(CallError::NotInitialized)
    }

    async fn call_peer(&self, remote_id: &str) -> Result<(), CallError> {
        let session = PeerSession::new(self.local_id()?, self.session_deps());
        self.set_active_session(&session);

        let result = async {
            session.initialize().await?;
            session.create_offer(remote_id).await
        }
        .await;
        match result {
            Ok(session_id) => {
                info!(target: "Call/Client", "Calling {remote_id} ({session_id})");
                Ok(())
            }
            Err(e) => {
                session.end_session().await;
                self.clear_active_session(&session);
                Err(e)
            }
        }
    }

    async fn answer_peer(&self, session_id: SessionId, offer: Offer) -> Result<(), CallError> {
        let session = PeerSession::new(self.local_id()?, self.session_deps());
        self.set_active_session(&session);

        let result = async {
            session.initialize().await?;
            session.accept_offer(session_id, offer).await
        }
        .await;
        if let Err(e) = result {
            session.end_session().await;
            self.clear_active_session(&session);
            return Err(e);
        }
        Ok(())
    }

    async fn call_gateway(self: &Arc<Self>, number: &str) -> Result<(), CallError> {
        let gateway = self
            .deps
            .gateway
            .clone()
            .ok_or(CallError::Unsupported("phone numbers"))?;
        let call = gateway.connect(number).await?;
        info!(target: "Call/Client", "Gateway call to {number} connected");
        self.activate_gateway_call(call);
        Ok(())
    }

    fn activate_gateway_call(self: &Arc<Self>, call: Arc<dyn GatewayCall>) {
        let id = self.next_gateway_call.fetch_add(1, Ordering::Relaxed);
        let weak = Arc::downgrade(self);
        call.on_disconnect(Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_gateway_disconnect(id);
            }
        }));
        *self.active.lock().expect("Mutex should not be poisoned") =
            Some(ActiveCall::Gateway(GatewayCallHandle { id, call }));
        self.events
            .dispatch(&Event::ConnectionStateChanged(ConnectionStateChanged {
                session_id: None,
                transport: TransportKind::Gateway,
                state: PeerState::Connected,
                reason: None,
            }));
    }

    fn on_gateway_disconnect(&self, id: u64) {
        let ended = {
            let mut active = self.active.lock().expect("Mutex should not be poisoned");
            if matches!(active.as_ref(), Some(ActiveCall::Gateway(h)) if h.id == id) {
                *active = None;
                true
            } else {
                false
            }
        };
        if ended {
            info!(target: "Call/Client", "Gateway call ended by remote");
            self.events.dispatch(&Event::CallEnded(CallEnded {
                session_id: None,
                transport: TransportKind::Gateway,
                reason: EndReason::RemoteHangup,
            }));
        }
    }

    fn on_offer_event(&self, event: OfferEvent) {
        match event {
            OfferEvent::Received(session_id, offer) => {
                if self.context.local_id().as_deref() == Some(offer.from.as_str()) {
                    return;
                }
                if self.stale_sessions.contains(&session_id) {
                    debug!(target: "Call/Client", "[{session_id}] Ignoring offer of an ended call");
                    return;
                }
                if self.is_busy() || self.placing.load(Ordering::SeqCst) {
                    info!(
                        target: "Call/Client",
                        "Ignoring call from {} while busy", offer.from
                    );
                    return;
                }
                let from = offer.from.clone();
                {
                    let mut pending = self.pending.lock().expect("Mutex should not be poisoned");
                    if matches!(pending.as_ref(), Some(PendingIncoming::Peer { session_id: s, .. }) if *s == session_id)
                    {
                        return;
                    }
                    *pending = Some(PendingIncoming::Peer {
                        session_id: session_id.clone(),
                        offer,
                    });
                }
                info!(target: "Call/Client", "Incoming call from {from}");
                self.events.dispatch(&Event::IncomingCall(IncomingCall {
                    from,
                    transport: TransportKind::Peer,
                    session_id: Some(session_id),
                }));
            }
            OfferEvent::Withdrawn(session_id) => {
                let withdrawn = {
                    let mut pending = self.pending.lock().expect("Mutex should not be poisoned");
                    if matches!(pending.as_ref(), Some(PendingIncoming::Peer { session_id: s, .. }) if *s == session_id)
                    {
                        pending.take()
                    } else {
                        None
                    }
                };
                if withdrawn.is_some() {
                    info!(target: "Call/Client", "Caller withdrew {session_id}");
                    self.events.dispatch(&Event::CallEnded(CallEnded {
                        session_id: Some(session_id),
                        transport: TransportKind::Peer,
                        reason: EndReason::RemoteHangup,
                    }));
                }
            }
        }
    }

    fn on_gateway_incoming(&self, incoming: Arc<dyn GatewayIncoming>) {
        let busy = self.is_busy()
            || self.placing.load(Ordering::SeqCst)
            || self
                .pending
                .lock()
                .expect("Mutex should not be poisoned")
                .is_some();
        if busy {
            info!(
                target: "Call/Client",
                "Declining gateway call from {} while busy", incoming.from()
            );
            tokio::spawn(async move {
                if let Err(e) = incoming.reject().await {
                    warn!(target: "Call/Client", "Could not decline gateway call: {e}");
                }
            });
            return;
        }

        let from = incoming.from().to_string();
        *self.pending.lock().expect("Mutex should not be poisoned") =
            Some(PendingIncoming::Gateway(incoming));
        info!(target: "Call/Client", "Incoming gateway call from {from}");
        self.events.dispatch(&Event::IncomingCall(IncomingCall {
            from,
            transport: TransportKind::Gateway,
            session_id: None,
        }));
    }
}

#[async_trait]
impl RecoveryTarget for ClientInner {
    fn active_session(&self) -> Option<Arc<PeerSession>> {
        self.current_session()
    }

    /// Offers still in the inbox are delivered again; the one belonging to
    /// the active call is ignored as busy. Calls that ended while the relay
    /// was away are cleaned up first so they do not ring again.
    async fn restore_discovery(&self) -> Result<(), CallError> {
        self.flush_stale_sessions().await;
        self.subscribe_discovery().await
    }
}
