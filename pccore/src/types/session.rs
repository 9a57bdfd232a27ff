use std::fmt;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::state::PeerState;

/// Globally unique identifier of one negotiated (or negotiating) connection.
///
/// Derived from both party ids and the creation instant, with a random suffix
/// so two sessions created in the same millisecond never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate(local_id: &str, remote_id: &str, created_at: DateTime<Utc>) -> Self {
        let suffix = hex::encode(rand::rng().random::<[u8; 4]>());
        Self(format!(
            "{}-{}-{}-{}",
            sanitize(local_id),
            sanitize(remote_id),
            created_at.timestamp_millis(),
            suffix
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Relay paths use '/' as separator, so ids must not contain one.
fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c == '/' || c.is_whitespace() { '_' } else { c })
        .collect()
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Initiator,
    Responder,
}

/// Which transport carries a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Peer,
    Gateway,
}

/// Why a call ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum EndReason {
    LocalHangup,
    RemoteHangup,
    Rejected,
    Timeout,
    Failed(String),
    Shutdown,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalHangup => f.write_str("local hangup"),
            Self::RemoteHangup => f.write_str("remote hangup"),
            Self::Rejected => f.write_str("rejected"),
            Self::Timeout => f.write_str("timeout"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
            Self::Shutdown => f.write_str("shutdown"),
        }
    }
}

/// Bookkeeping for one session, owned by the state machine that created it.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub local_id: String,
    pub remote_id: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    pub state: PeerState,
    pub last_error: Option<String>,
}

impl SessionInfo {
    pub fn new_outgoing(local_id: impl Into<String>, remote_id: impl Into<String>) -> Self {
        let local_id = local_id.into();
        let remote_id = remote_id.into();
        let created_at = Utc::now();
        Self {
            session_id: SessionId::generate(&local_id, &remote_id, created_at),
            local_id,
            remote_id,
            role: Role::Initiator,
            created_at,
            state: PeerState::Idle,
            last_error: None,
        }
    }

    pub fn new_incoming(
        session_id: SessionId,
        local_id: impl Into<String>,
        remote_id: impl Into<String>,
    ) -> Self {
        Self {
            session_id,
            local_id: local_id.into(),
            remote_id: remote_id.into(),
            role: Role::Responder,
            created_at: Utc::now(),
            state: PeerState::Idle,
            last_error: None,
        }
    }

    pub fn is_initiator(&self) -> bool {
        self.role == Role::Initiator
    }
}
