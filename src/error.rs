//! Call-related error types.

use pccore::destination::DestinationError;
use pccore::rate_limit::RateLimited;
use pccore::state::InvalidTransition;
use pccore::store::StoreError;
use thiserror::Error;

use crate::gateway::GatewayError;
use crate::media::MediaError;
use crate::peer::connection::PeerError;
use crate::recording::RecorderError;

/// Coarse classification used by callers to decide how to surface an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad destination or tone; nothing changed.
    UserInput,
    /// Local media access was denied.
    Permission,
    /// SDP exchange could not complete.
    Negotiation,
    /// ICE or transport failure.
    Connectivity,
    /// Request conflicts with current usage (busy, rate limited, duplicate recording).
    Resource,
    /// Signaling relay read/write/subscribe failure.
    Relay,
    NotInitialized,
    Internal,
}

/// Errors surfaced by the call engine.
///
/// `Clone` so a single in-flight initialization can hand the same result to
/// every waiter.
#[derive(Debug, Clone, Error)]
pub enum CallError {
    #[error("invalid destination: {0}")]
    InvalidDestination(#[from] DestinationError),

    #[error("invalid DTMF digit: {0:?}")]
    InvalidTone(char),

    #[error("call engine is not initialized")]
    NotInitialized,

    #[error("media error: {0}")]
    Media(#[from] MediaError),

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// The offer was replaced by a newer revision before it could be answered.
    #[error("answer r{answered} superseded by offer r{current}")]
    StaleRevision { answered: u32, current: u32 },

    #[error("connectivity failure: {0}")]
    Connectivity(String),

    #[error("signaling relay error: {0}")]
    Relay(#[from] StoreError),

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] InvalidTransition),

    #[error("rate limited: {0}")]
    RateLimited(#[from] RateLimited),

    #[error("a call is already in progress")]
    Busy,

    #[error("no active call")]
    NoActiveCall,

    #[error("no incoming call to answer")]
    NoIncomingCall,

    #[error("recording is already active")]
    RecordingActive,

    #[error("recording is not active")]
    RecordingInactive,

    #[error("recording requires a connected call")]
    NotConnected,

    #[error("recorder error: {0}")]
    Recorder(#[from] RecorderError),

    #[error("{0} is not supported on this transport")]
    Unsupported(&'static str),

    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("peer connection error: {0}")]
    Peer(#[from] PeerError),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("session already ended")]
    SessionEnded,
}

impl CallError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidDestination(_) | Self::InvalidTone(_) => ErrorKind::UserInput,
            Self::NotInitialized => ErrorKind::NotInitialized,
            Self::Media(MediaError::PermissionDenied(_)) => ErrorKind::Permission,
            Self::Media(_) => ErrorKind::Resource,
            Self::Negotiation(_) | Self::StaleRevision { .. } | Self::InvalidTransition(_) => {
                ErrorKind::Negotiation
            }
            Self::Peer(PeerError::InvalidSdp(_) | PeerError::NoRemoteDescription) => {
                ErrorKind::Negotiation
            }
            Self::Connectivity(_) | Self::Peer(_) | Self::Timeout(_) => ErrorKind::Connectivity,
            Self::Relay(_) => ErrorKind::Relay,
            Self::RateLimited(_)
            | Self::Busy
            | Self::NoActiveCall
            | Self::NoIncomingCall
            | Self::RecordingActive
            | Self::RecordingInactive
            | Self::NotConnected
            | Self::Unsupported(_)
            | Self::Recorder(_) => ErrorKind::Resource,
            Self::Gateway(_) => ErrorKind::Connectivity,
            Self::SessionEnded => ErrorKind::Internal,
        }
    }
}
