pub mod events;
pub mod recording;
pub mod session;
pub mod signal;

pub use events::{CoreEventBus, Event, EventHandler, HandlerId};
pub use recording::RecordingSegment;
pub use session::{EndReason, Role, SessionId, SessionInfo, TransportKind};
pub use signal::{Answer, IceCandidate, Offer, SdpType};
