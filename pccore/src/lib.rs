//! Runtime-agnostic building blocks for the peer call engine.
//!
//! Everything in this crate is free of an async runtime: records exchanged
//! over the signaling relay, the peer session state machine, destination
//! routing, local rate limiting, retry backoff, the event bus and the
//! signaling store contract (plus an in-memory store).

pub mod backoff;
pub mod destination;
pub mod rate_limit;
pub mod state;
pub mod store;
pub mod types;

pub use destination::Destination;
pub use state::{InvalidTransition, PeerState, PeerTransition};
