//! Peer transport: the connection seam, its `webrtc` backend and the
//! session state machine driving it.

pub mod connection;
pub mod session;
pub mod webrtc;

pub use connection::{
    IceConnectionState, LocalCandidate, PeerConnection, PeerConnectionConfig,
    PeerConnectionEvent, PeerConnectionFactory, PeerError, TransportState,
};
pub use session::{PeerSession, SessionDeps};
pub use webrtc::WebRtcConnectionFactory;
