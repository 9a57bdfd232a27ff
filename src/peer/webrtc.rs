//! `webrtc`-backed peer connections.
//!
//! One `RTCPeerConnection` per session with a single Opus send/receive audio
//! track. Callbacks from the stack are translated into
//! [`PeerConnectionEvent`]s on the session's channel.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{debug, warn};
use pccore::types::{IceCandidate, SdpType};
use tokio::sync::mpsc;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MediaEngine};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use super::connection::{
    IceConnectionState, LocalCandidate, PeerConnection, PeerConnectionConfig,
    PeerConnectionEvent, PeerConnectionFactory, PeerError, TransportState,
};
use crate::media::{AudioFrame, AudioStream};

const STREAM_ID: &str = "peercall";

fn backend(e: webrtc::Error) -> PeerError {
    PeerError::Backend(e.to_string())
}

fn invalid_sdp(e: webrtc::Error) -> PeerError {
    PeerError::InvalidSdp(e.to_string())
}

fn transport_state(state: RTCPeerConnectionState) -> Option<TransportState> {
    Some(match state {
        RTCPeerConnectionState::New => TransportState::New,
        RTCPeerConnectionState::Connecting => TransportState::Connecting,
        RTCPeerConnectionState::Connected => TransportState::Connected,
        RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
        RTCPeerConnectionState::Failed => TransportState::Failed,
        RTCPeerConnectionState::Closed => TransportState::Closed,
        _ => return None,
    })
}

fn ice_state(state: RTCIceConnectionState) -> Option<IceConnectionState> {
    Some(match state {
        RTCIceConnectionState::New => IceConnectionState::New,
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        _ => return None,
    })
}

/// Inbound audio announced by the remote side.
struct RemoteAudio {
    id: String,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl AudioStream for RemoteAudio {
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

/// Feeds captured frames to `write` until the stream ends. Frames captured
/// while the stream is disabled go out as silence of the same length.
async fn pump_frames<F, Fut>(stream: Arc<dyn AudioStream>, mut write: F) -> usize
where
    F: FnMut(AudioFrame) -> Fut,
    Fut: Future<Output = Result<(), PeerError>>,
{
    let mut sent = 0;
    while !stream.is_stopped() {
        let Some(frame) = stream.next_frame().await else {
            break;
        };
        let frame = if stream.is_enabled() {
            frame
        } else {
            AudioFrame::silence(frame.duration)
        };
        if let Err(e) = write(frame).await {
            debug!(target: "Call/WebRtc", "Stopping audio for {}: {e}", stream.id());
            break;
        }
        sent += 1;
    }
    sent
}

#[derive(Debug, Default, Clone)]
pub struct WebRtcConnectionFactory;

impl WebRtcConnectionFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcConnectionFactory {
    async fn create(
        &self,
        config: &PeerConnectionConfig,
        events: mpsc::UnboundedSender<PeerConnectionEvent>,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(backend)?;
        let registry =
            register_default_interceptors(Registry::new(), &mut media_engine).map_err(backend)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if config.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: config.ice_servers.clone(),
                ..Default::default()
            }]
        };
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers,
                ..Default::default()
            })
            .await
            .map_err(backend)?,
        );

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!(target: "Call/WebRtc", "ICE gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(PeerConnectionEvent::LocalCandidate(LocalCandidate {
                            candidate: init.candidate,
                            media_id: init.sdp_mid,
                            media_line_index: init.sdp_mline_index,
                        }));
                    }
                    Err(e) => warn!(target: "Call/WebRtc", "Could not serialize candidate: {e}"),
                }
            })
        }));

        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            debug!(target: "Call/WebRtc", "Peer connection state: {state}");
            if let Some(state) = transport_state(state) {
                let _ = tx.send(PeerConnectionEvent::TransportState(state));
            }
            Box::pin(async {})
        }));

        let tx = events;
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            debug!(target: "Call/WebRtc", "ICE connection state: {state}");
            if let Some(state) = ice_state(state) {
                let _ = tx.send(PeerConnectionEvent::IceState(state));
            }
            Box::pin(async {})
        }));

        let remote_audio: Arc<Mutex<Option<Arc<dyn AudioStream>>>> = Arc::new(Mutex::new(None));
        let slot = remote_audio.clone();
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
            if track.kind() == RTPCodecType::Audio {
                *slot.lock().expect("Mutex should not be poisoned") = Some(Arc::new(RemoteAudio {
                    id: "remote-audio".to_string(),
                    enabled: AtomicBool::new(true),
                    stopped: AtomicBool::new(false),
                }));
            }
            Box::pin(async {})
        }));

        Ok(Arc::new(WebRtcConnection {
            pc,
            remote_audio,
            added_candidates: Mutex::new(HashSet::new()),
        }))
    }
}

pub struct WebRtcConnection {
    pc: Arc<RTCPeerConnection>,
    remote_audio: Arc<Mutex<Option<Arc<dyn AudioStream>>>>,
    added_candidates: Mutex<HashSet<String>>,
}

#[async_trait]
impl PeerConnection for WebRtcConnection {
    async fn attach_local_audio(&self, stream: Arc<dyn AudioStream>) -> Result<(), PeerError> {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48_000,
                channels: 2,
                ..Default::default()
            },
            stream.id().to_owned(),
            STREAM_ID.to_owned(),
        ));
        let sender = self
            .pc
            .add_track(track.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(backend)?;

        // RTCP must be drained for the interceptors to make progress.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });

        tokio::spawn(async move {
            let id = stream.id().to_owned();
            let sent = pump_frames(stream, |frame| {
                let track = track.clone();
                async move {
                    let sample = Sample {
                        data: frame.data,
                        duration: frame.duration,
                        ..Default::default()
                    };
                    track.write_sample(&sample).await.map_err(backend)
                }
            })
            .await;
            debug!(target: "Call/WebRtc", "Local audio {id} finished after {sent} frames");
        });
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<String, PeerError> {
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });
        let offer = self.pc.create_offer(options).await.map_err(backend)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(backend)?;
        Ok(offer.sdp)
    }

    async fn create_answer(&self) -> Result<String, PeerError> {
        let answer = self.pc.create_answer(None).await.map_err(backend)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(backend)?;
        Ok(answer.sdp)
    }

    async fn set_remote_description(
        &self,
        sdp_type: SdpType,
        sdp: &str,
    ) -> Result<(), PeerError> {
        let description = match sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(sdp.to_owned()),
            SdpType::Answer => RTCSessionDescription::answer(sdp.to_owned()),
        }
        .map_err(invalid_sdp)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(invalid_sdp)
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerError> {
        if self.pc.remote_description().await.is_none() {
            return Err(PeerError::NoRemoteDescription);
        }
        let fresh = self
            .added_candidates
            .lock()
            .expect("Mutex should not be poisoned")
            .insert(candidate.candidate.clone());
        if !fresh {
            return Err(PeerError::DuplicateCandidate);
        }
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate.clone(),
                sdp_mid: candidate.media_id.clone(),
                sdp_mline_index: candidate.media_line_index,
                ..Default::default()
            })
            .await
            .map_err(backend)
    }

    fn remote_audio(&self) -> Option<Arc<dyn AudioStream>> {
        self.remote_audio
            .lock()
            .expect("Mutex should not be poisoned")
            .clone()
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.pc.close().await.map_err(backend)
    }
}
