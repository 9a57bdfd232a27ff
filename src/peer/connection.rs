//! Transport-level connection seam.
//!
//! A [`PeerConnection`] is exclusively owned by one session. Asynchronous
//! transport callbacks are delivered as [`PeerConnectionEvent`]s on the
//! channel handed to the factory.

use std::sync::Arc;

use async_trait::async_trait;
use pccore::types::{IceCandidate, SdpType};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::media::AudioStream;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeerError {
    #[error("candidate already added")]
    DuplicateCandidate,

    #[error("remote description not set")]
    NoRemoteDescription,

    #[error("invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("connection is closed")]
    Closed,

    #[error("{0}")]
    Backend(String),
}

/// Aggregate transport state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// ICE agent state; may degrade before the aggregate state does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// A candidate gathered by the local agent, not yet published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalCandidate {
    pub candidate: String,
    pub media_id: Option<String>,
    pub media_line_index: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerConnectionEvent {
    LocalCandidate(LocalCandidate),
    TransportState(TransportState),
    IceState(IceConnectionState),
}

#[derive(Debug, Clone, Default)]
pub struct PeerConnectionConfig {
    pub ice_servers: Vec<String>,
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn attach_local_audio(&self, stream: Arc<dyn AudioStream>) -> Result<(), PeerError>;

    /// Creates an offer and applies it as the local description.
    async fn create_offer(&self, ice_restart: bool) -> Result<String, PeerError>;

    /// Creates an answer and applies it as the local description.
    async fn create_answer(&self) -> Result<String, PeerError>;

    async fn set_remote_description(&self, sdp_type: SdpType, sdp: &str)
    -> Result<(), PeerError>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerError>;

    /// The inbound audio track, once the transport has produced one.
    fn remote_audio(&self) -> Option<Arc<dyn AudioStream>>;

    async fn close(&self) -> Result<(), PeerError>;
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        config: &PeerConnectionConfig,
        events: mpsc::UnboundedSender<PeerConnectionEvent>,
    ) -> Result<Arc<dyn PeerConnection>, PeerError>;
}
