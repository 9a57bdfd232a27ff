use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use clap::Parser;
use log::{error, info, warn};
use peercall::config::CallConfig;
use peercall::logging::init_logging;
use peercall::media::{AudioFrame, AudioStream, MediaError, MediaSource};
use peercall::peer::WebRtcConnectionFactory;
use peercall::recording::{
    ActiveRecording, ChunkRecorder, RecorderError, RetryingUploader, SegmentUploader, UploadError,
    UploadReceipt,
};
use peercall::state::PeerState;
use peercall::store::MemoryStore;
use peercall::types::{Event, RecordingSegment};
use peercall::{CallClient, CallDeps};
use tokio::sync::mpsc;

// Places a loopback call between two in-process parties over an in-memory
// relay and real WebRTC transports.
//
// Usage:
//   cargo run                                   # alice calls bob for 5 seconds
//   cargo run -- --duration 10 --record         # record the call
//   cargo run -- --config peercall.json         # load tunables from JSON

#[derive(Parser)]
#[command(name = "peercall")]
#[command(about = "Loopback demo of the peer call engine")]
struct Args {
    /// JSON config file; `PEERCALL_*` environment variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long, default_value = "alice")]
    caller: String,

    #[arg(long, default_value = "bob")]
    callee: String,

    /// Seconds to stay connected before hanging up
    #[arg(short, long, default_value_t = 5)]
    duration: u64,

    #[arg(short, long)]
    record: bool,
}

const FRAME_DURATION: Duration = Duration::from_millis(20);

/// A silent stand-in for a microphone.
struct SilentStream {
    id: String,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

#[async_trait]
impl AudioStream for SilentStream {
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

    async fn next_frame(&self) -> Option<AudioFrame> {
        tokio::time::sleep(FRAME_DURATION).await;
        (!self.is_stopped()).then(|| AudioFrame::silence(FRAME_DURATION))
    }
}

struct SilentMicrophone {
    owner: String,
}

#[async_trait]
impl MediaSource for SilentMicrophone {
    async fn acquire_audio(&self) -> Result<Arc<dyn AudioStream>, MediaError> {
        Ok(Arc::new(SilentStream {
            id: format!("{}-mic", self.owner),
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }))
    }
}

/// Emits one empty Ogg page per second of recording.
struct TickRecorder;

struct TickRecording {
    task: tokio::task::JoinHandle<()>,
}

#[async_trait]
impl ActiveRecording for TickRecording {
    fn mime_type(&self) -> &str {
        "audio/ogg"
    }

    async fn stop(&self) -> Result<(), RecorderError> {
        self.task.abort();
        Ok(())
    }
}

#[async_trait]
impl ChunkRecorder for TickRecorder {
    async fn start(
        &self,
        call_id: &str,
        tracks: Vec<Arc<dyn AudioStream>>,
        chunks: mpsc::UnboundedSender<Bytes>,
    ) -> Result<Box<dyn ActiveRecording>, RecorderError> {
        info!("Recording {call_id} from {} track(s)", tracks.len());
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                if chunks.send(Bytes::from_static(b"OggS")).is_err() {
                    break;
                }
            }
        });
        Ok(Box::new(TickRecording { task }))
    }
}

struct LogUploader;

#[async_trait]
impl SegmentUploader for LogUploader {
    async fn upload(&self, segment: &RecordingSegment) -> Result<UploadReceipt, UploadError> {
        info!(
            "Uploaded {} bytes of {} ({:.1}s) for {}",
            segment.size_bytes, segment.mime_type, segment.duration_seconds, segment.call_id
        );
        Ok(UploadReceipt {
            id: format!("local-{}", segment.call_id),
        })
    }
}

fn build_client(store: &MemoryStore, owner: &str, config: &CallConfig) -> CallClient {
    let uploader = RetryingUploader::new(
        LogUploader,
        config.upload_max_attempts,
        config.upload_backoff(),
    );
    let deps = CallDeps {
        store: Arc::new(store.clone()),
        peer_factory: Arc::new(WebRtcConnectionFactory::new()),
        media: Arc::new(SilentMicrophone {
            owner: owner.to_string(),
        }),
        gateway: None,
        recorder: Arc::new(TickRecorder),
        uploader: Arc::new(uploader),
    };
    CallClient::new(deps, config.clone())
}

fn load_config(path: Option<&PathBuf>) -> Result<CallConfig> {
    let config = match path {
        Some(path) => CallConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => CallConfig::default(),
    };
    Ok(config.with_env_overrides()?)
}

async fn wait_for_state(client: &CallClient, state: PeerState, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if client.connection_state() == Some(state) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging("info");
    let args = Args::parse();
    let config = load_config(args.config.as_ref())?;

    let relay = MemoryStore::new();
    let caller = build_client(&relay, &args.caller, &config);
    let callee = build_client(&relay, &args.callee, &config);

    caller
        .initialize("demo-token", &args.caller)
        .await
        .context("initializing caller")?;
    callee
        .initialize("demo-token", &args.callee)
        .await
        .context("initializing callee")?;

    for (name, client) in [(args.caller.clone(), &caller), (args.callee.clone(), &callee)] {
        client.add_handler(Arc::new(move |event: &Event| match event {
            Event::ConnectionStateChanged(change) => {
                info!("[{name}] state -> {}", change.state)
            }
            Event::CallEnded(ended) => info!("[{name}] call ended: {}", ended.reason),
            Event::RecordingError(e) => warn!("[{name}] recording error: {}", e.message),
            _ => {}
        }));
    }

    let answerer = callee.clone();
    callee.add_handler(Arc::new(move |event: &Event| {
        if let Event::IncomingCall(incoming) = event {
            info!("Incoming call from {}, answering", incoming.from);
            let answerer = answerer.clone();
            tokio::spawn(async move {
                if let Err(e) = answerer.accept_incoming().await {
                    error!("Could not answer: {e}");
                }
            });
        }
    }));

    caller.call(&args.callee).await.context("placing call")?;

    if !wait_for_state(&caller, PeerState::Connected, config.connect_timeout).await {
        caller.shutdown().await;
        callee.shutdown().await;
        anyhow::bail!("call did not connect");
    }
    info!("Connected; holding for {}s", args.duration);

    if args.record {
        caller.start_recording().await.context("starting recording")?;
    }
    tokio::time::sleep(Duration::from_secs(args.duration)).await;

    caller.hangup().await?;
    // Give the upload task a moment before the runtime goes away.
    tokio::time::sleep(Duration::from_millis(500)).await;
    caller.shutdown().await;
    callee.shutdown().await;
    Ok(())
}
