use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use pccore::state::PeerState;
use pccore::store::{
    ChildListener, ConnectivityListener, MemoryStore, Result as StoreResult, SignalingStore,
    Subscription, ValueListener,
};
use pccore::types::events::Event;
use pccore::types::{CoreEventBus, EndReason, IceCandidate, RecordingSegment, SdpType};
use serde_json::Value;
use tokio::sync::{Notify, mpsc};

use crate::config::CallConfig;
use crate::gateway::{
    DisconnectHandler, GatewayCall, GatewayError, GatewayIncoming, GatewayTransport,
    IncomingHandler,
};
use crate::media::{AudioStream, MediaError, MediaSource};
use crate::peer::connection::{
    PeerConnection, PeerConnectionConfig, PeerConnectionEvent, PeerConnectionFactory, PeerError,
    TransportState,
};
use crate::peer::session::SessionDeps;
use crate::recording::{
    ActiveRecording, ChunkRecorder, RecorderError, SegmentUploader, UploadError, UploadReceipt,
};
use crate::signaling::SignalingAdapter;

/// Small delays so timing-dependent paths finish quickly in tests.
pub fn test_config() -> CallConfig {
    CallConfig {
        connect_timeout: Duration::from_secs(10),
        relay_init_timeout: Duration::from_secs(2),
        transport_setup_timeout: Duration::from_secs(2),
        min_call_spacing: Duration::from_secs(5),
        rate_window: Duration::from_secs(60),
        max_calls_per_window: 10,
        max_reconnect_attempts: 5,
        reconnect_base_delay: Duration::from_millis(5),
        reconnect_max_delay: Duration::from_millis(20),
        max_ice_restarts: 2,
        upload_max_attempts: 3,
        upload_base_delay: Duration::from_millis(5),
        ice_servers: Vec::new(),
    }
}

pub async fn authed_store() -> MemoryStore {
    let store = MemoryStore::new();
    store
        .authenticate("test-token")
        .await
        .expect("memory store accepts any non-empty credential");
    store
}

/// Polls `check` until it holds or two seconds pass.
pub async fn wait_until<F>(mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..400 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

/// Like [`wait_until`] for async conditions.
pub async fn wait_until_async<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..400 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check().await
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCall {
    AttachLocalAudio(String),
    CreateOffer { ice_restart: bool },
    CreateAnswer,
    SetRemote(SdpType),
    AddCandidate(String),
    Close,
}

pub struct MockConnection {
    journal: Mutex<Vec<PeerCall>>,
    candidates: Mutex<HashSet<String>>,
    remote_set: AtomicBool,
    closed: AtomicBool,
    events: mpsc::UnboundedSender<PeerConnectionEvent>,
    remote_audio: Option<Arc<dyn AudioStream>>,
}

impl MockConnection {
    pub fn calls(&self) -> Vec<PeerCall> {
        self.journal.lock().unwrap().clone()
    }

    pub fn added_candidates(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                PeerCall::AddCandidate(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Injects a transport callback as if the stack had produced it.
    pub fn emit(&self, event: PeerConnectionEvent) {
        let _ = self.events.send(event);
    }

    pub fn set_transport(&self, state: TransportState) {
        self.emit(PeerConnectionEvent::TransportState(state));
    }

    fn record(&self, call: PeerCall) {
        self.journal.lock().unwrap().push(call);
    }
}

#[async_trait]
impl PeerConnection for MockConnection {
    async fn attach_local_audio(&self, stream: Arc<dyn AudioStream>) -> Result<(), PeerError> {
        self.record(PeerCall::AttachLocalAudio(stream.id().to_string()));
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<String, PeerError> {
        self.record(PeerCall::CreateOffer { ice_restart });
        Ok(format!("v=0 mock-offer restart={ice_restart}"))
    }

    async fn create_answer(&self) -> Result<String, PeerError> {
        if !self.remote_set.load(Ordering::SeqCst) {
            return Err(PeerError::NoRemoteDescription);
        }
        self.record(PeerCall::CreateAnswer);
        Ok("v=0 mock-answer".to_string())
    }

    async fn set_remote_description(
        &self,
        sdp_type: SdpType,
        sdp: &str,
    ) -> Result<(), PeerError> {
        if !sdp.starts_with("v=0") {
            return Err(PeerError::InvalidSdp(sdp.to_string()));
        }
        self.record(PeerCall::SetRemote(sdp_type));
        self.remote_set.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerError> {
        if !self.remote_set.load(Ordering::SeqCst) {
            return Err(PeerError::NoRemoteDescription);
        }
        if !self
            .candidates
            .lock()
            .unwrap()
            .insert(candidate.candidate.clone())
        {
            return Err(PeerError::DuplicateCandidate);
        }
        self.record(PeerCall::AddCandidate(candidate.candidate.clone()));
        Ok(())
    }

    fn remote_audio(&self) -> Option<Arc<dyn AudioStream>> {
        self.remote_audio.clone()
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.record(PeerCall::Close);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory that hands out [`MockConnection`]s and remembers every one.
#[derive(Default)]
pub struct MockPeerFactory {
    created: Mutex<Vec<Arc<MockConnection>>>,
    fail_with: Mutex<Option<PeerError>>,
}

impl MockPeerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn created(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn last(&self) -> Option<Arc<MockConnection>> {
        self.created.lock().unwrap().last().cloned()
    }

    pub fn fail_next(&self, error: PeerError) {
        *self.fail_with.lock().unwrap() = Some(error);
    }
}

#[async_trait]
impl PeerConnectionFactory for MockPeerFactory {
    async fn create(
        &self,
        _config: &PeerConnectionConfig,
        events: mpsc::UnboundedSender<PeerConnectionEvent>,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        if let Some(e) = self.fail_with.lock().unwrap().take() {
            return Err(e);
        }
        let connection = Arc::new(MockConnection {
            journal: Mutex::new(Vec::new()),
            candidates: Mutex::new(HashSet::new()),
            remote_set: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            events,
            remote_audio: Some(Arc::new(MockStream::new("remote"))),
        });
        self.created.lock().unwrap().push(connection.clone());
        Ok(connection)
    }
}

pub struct MockStream {
    id: String,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl MockStream {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }
}

impl AudioStream for MockStream {
    fn id(&self) -> &str {
        &self.id
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct MockMediaSource {
    failure: Mutex<Option<MediaError>>,
    acquired: Mutex<Vec<Arc<MockStream>>>,
}

impl MockMediaSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(error: MediaError) -> Arc<Self> {
        let source = Self::default();
        *source.failure.lock().unwrap() = Some(error);
        Arc::new(source)
    }

    pub fn last(&self) -> Option<Arc<MockStream>> {
        self.acquired.lock().unwrap().last().cloned()
    }

    pub fn acquired(&self) -> usize {
        self.acquired.lock().unwrap().len()
    }
}

#[async_trait]
impl MediaSource for MockMediaSource {
    async fn acquire_audio(&self) -> Result<Arc<dyn AudioStream>, MediaError> {
        if let Some(e) = self.failure.lock().unwrap().clone() {
            return Err(e);
        }
        let mut acquired = self.acquired.lock().unwrap();
        let stream = Arc::new(MockStream::new(&format!("mic-{}", acquired.len())));
        acquired.push(stream.clone());
        Ok(stream)
    }
}

/// Emits two chunks on start and one more when stopped.
#[derive(Default)]
pub struct MockRecorder {
    starts: AtomicUsize,
    tracks: Mutex<Vec<String>>,
}

impl MockRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn tracks(&self) -> Vec<String> {
        self.tracks.lock().unwrap().clone()
    }
}

struct MockActiveRecording {
    sink: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
}

#[async_trait]
impl ActiveRecording for MockActiveRecording {
    fn mime_type(&self) -> &str {
        "audio/ogg"
    }

    async fn stop(&self) -> Result<(), RecorderError> {
        if let Some(sink) = self.sink.lock().unwrap().take() {
            let _ = sink.send(Bytes::from_static(b"tail"));
        }
        Ok(())
    }
}

#[async_trait]
impl ChunkRecorder for MockRecorder {
    async fn start(
        &self,
        _call_id: &str,
        tracks: Vec<Arc<dyn AudioStream>>,
        chunks: mpsc::UnboundedSender<Bytes>,
    ) -> Result<Box<dyn ActiveRecording>, RecorderError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.tracks
            .lock()
            .unwrap()
            .extend(tracks.iter().map(|t| t.id().to_string()));
        let _ = chunks.send(Bytes::from_static(b"head"));
        let _ = chunks.send(Bytes::from_static(b"body"));
        Ok(Box::new(MockActiveRecording {
            sink: Mutex::new(Some(chunks)),
        }))
    }
}

/// Uploader that keeps every segment it is given.
#[derive(Default)]
pub struct RecordingUploader {
    segments: Mutex<Vec<RecordingSegment>>,
    fail: AtomicBool,
    uploaded: Notify,
}

impl RecordingUploader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let uploader = Self::default();
        uploader.fail.store(true, Ordering::SeqCst);
        Arc::new(uploader)
    }

    pub fn segments(&self) -> Vec<RecordingSegment> {
        self.segments.lock().unwrap().clone()
    }
}

#[async_trait]
impl SegmentUploader for RecordingUploader {
    async fn upload(&self, segment: &RecordingSegment) -> Result<UploadReceipt, UploadError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(UploadError::Transient("storage unavailable".into()));
        }
        let mut segments = self.segments.lock().unwrap();
        segments.push(segment.clone());
        self.uploaded.notify_waiters();
        Ok(UploadReceipt {
            id: format!("upload-{}", segments.len()),
        })
    }
}

pub struct MockGatewayCall {
    muted: AtomicBool,
    tones: Mutex<Vec<char>>,
    disconnected: AtomicBool,
    on_disconnect: Mutex<Option<DisconnectHandler>>,
}

impl MockGatewayCall {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            muted: AtomicBool::new(false),
            tones: Mutex::new(Vec::new()),
            disconnected: AtomicBool::new(false),
            on_disconnect: Mutex::new(None),
        })
    }

    pub fn tones(&self) -> Vec<char> {
        self.tones.lock().unwrap().clone()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    /// The far end hangs up.
    pub fn remote_hangup(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
        let handler = self.on_disconnect.lock().unwrap().take();
        if let Some(handler) = handler {
            handler();
        }
    }
}

#[async_trait]
impl GatewayCall for MockGatewayCall {
    async fn disconnect(&self) -> Result<(), GatewayError> {
        self.disconnected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn mute(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    async fn send_tone(&self, digit: char) -> Result<(), GatewayError> {
        self.tones.lock().unwrap().push(digit);
        Ok(())
    }

    fn on_disconnect(&self, handler: DisconnectHandler) {
        *self.on_disconnect.lock().unwrap() = Some(handler);
    }
}

pub struct MockGatewayIncoming {
    from: String,
    rejected: AtomicBool,
    call: Arc<MockGatewayCall>,
}

impl MockGatewayIncoming {
    pub fn was_rejected(&self) -> bool {
        self.rejected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GatewayIncoming for MockGatewayIncoming {
    fn from(&self) -> &str {
        &self.from
    }

    async fn accept(&self) -> Result<Arc<dyn GatewayCall>, GatewayError> {
        Ok(self.call.clone())
    }

    async fn reject(&self) -> Result<(), GatewayError> {
        self.rejected.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct MockGateway {
    dialed: Mutex<Vec<String>>,
    calls: Mutex<Vec<Arc<MockGatewayCall>>>,
    handler: Mutex<Option<IncomingHandler>>,
}

impl MockGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn dialed(&self) -> Vec<String> {
        self.dialed.lock().unwrap().clone()
    }

    pub fn last_call(&self) -> Option<Arc<MockGatewayCall>> {
        self.calls.lock().unwrap().last().cloned()
    }

    pub fn has_handler(&self) -> bool {
        self.handler.lock().unwrap().is_some()
    }

    /// Simulates an inbound call from `from`.
    pub fn ring(&self, from: &str) -> Arc<MockGatewayIncoming> {
        let incoming = Arc::new(MockGatewayIncoming {
            from: from.to_string(),
            rejected: AtomicBool::new(false),
            call: MockGatewayCall::new(),
        });
        let handler = self.handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler(incoming.clone());
        }
        incoming
    }
}

#[async_trait]
impl GatewayTransport for MockGateway {
    async fn connect(&self, destination: &str) -> Result<Arc<dyn GatewayCall>, GatewayError> {
        self.dialed.lock().unwrap().push(destination.to_string());
        let call = MockGatewayCall::new();
        self.calls.lock().unwrap().push(call.clone());
        Ok(call)
    }

    fn set_incoming_handler(&self, handler: Option<IncomingHandler>) {
        *self.handler.lock().unwrap() = handler;
    }
}

/// Records every event dispatched on a bus.
#[derive(Clone, Default)]
pub struct EventCollector {
    events: Arc<Mutex<Vec<Event>>>,
}

impl EventCollector {
    pub fn attach(bus: &CoreEventBus) -> Self {
        let collector = Self::default();
        let events = collector.events.clone();
        bus.add_handler(Arc::new(move |event: &Event| {
            events.lock().unwrap().push(event.clone());
        }));
        collector
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn states(&self) -> Vec<PeerState> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::ConnectionStateChanged(c) => Some(c.state),
                _ => None,
            })
            .collect()
    }

    pub fn count_state(&self, state: PeerState) -> usize {
        self.states().into_iter().filter(|s| *s == state).count()
    }

    pub fn ended_reasons(&self) -> Vec<EndReason> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::CallEnded(c) => Some(c.reason),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, matches: impl Fn(&Event) -> bool) -> usize {
        self.events().iter().filter(|e| matches(e)).count()
    }
}

/// Delays authentication so concurrent initializers overlap.
pub struct SlowAuthStore {
    pub inner: MemoryStore,
    pub delay: Duration,
}

#[async_trait]
impl SignalingStore for SlowAuthStore {
    async fn authenticate(&self, credential: &str) -> StoreResult<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.authenticate(credential).await
    }

    async fn put(&self, path: &str, value: Value) -> StoreResult<()> {
        self.inner.put(path, value).await
    }

    async fn push(&self, path: &str, value: Value) -> StoreResult<String> {
        self.inner.push(path, value).await
    }

    async fn get(&self, path: &str) -> StoreResult<Option<Value>> {
        self.inner.get(path).await
    }

    async fn subscribe_value(
        &self,
        path: &str,
        listener: ValueListener,
    ) -> StoreResult<Subscription> {
        self.inner.subscribe_value(path, listener).await
    }

    async fn subscribe_children(
        &self,
        path: &str,
        listener: ChildListener,
    ) -> StoreResult<Subscription> {
        self.inner.subscribe_children(path, listener).await
    }

    async fn delete(&self, path: &str) -> StoreResult<()> {
        self.inner.delete(path).await
    }

    fn observe_connectivity(&self, listener: ConnectivityListener) -> Subscription {
        self.inner.observe_connectivity(listener)
    }

    fn is_online(&self) -> bool {
        self.inner.is_online()
    }
}

/// Everything a session needs, backed by mocks.
pub struct SessionHarness {
    pub store: MemoryStore,
    pub factory: Arc<MockPeerFactory>,
    pub media: Arc<MockMediaSource>,
    pub recorder: Arc<MockRecorder>,
    pub uploader: Arc<RecordingUploader>,
    pub events: CoreEventBus,
    pub collector: EventCollector,
    pub deps: SessionDeps,
}

impl SessionHarness {
    pub async fn new() -> Self {
        Self::with(authed_store().await, test_config(), MockMediaSource::new()).await
    }

    pub async fn with(store: MemoryStore, config: CallConfig, media: Arc<MockMediaSource>) -> Self {
        let factory = MockPeerFactory::new();
        let recorder = MockRecorder::new();
        let uploader = RecordingUploader::new();
        let events = CoreEventBus::new();
        let collector = EventCollector::attach(&events);
        let deps = SessionDeps {
            signaling: Arc::new(SignalingAdapter::new(Arc::new(store.clone()))),
            peer_factory: factory.clone(),
            media: media.clone(),
            recorder: recorder.clone(),
            uploader: uploader.clone(),
            events: events.clone(),
            config: Arc::new(config),
        };
        Self {
            store,
            factory,
            media,
            recorder,
            uploader,
            events,
            collector,
            deps,
        }
    }
}
