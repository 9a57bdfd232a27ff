// Re-export the runtime-agnostic core
pub use pccore::{destination, state, store, types};

pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod media;
pub mod peer;
pub mod reconnect;
pub mod recording;
pub mod signaling;
pub mod timer;

#[cfg(test)]
pub mod test_utils;

pub use client::{CallClient, CallDeps};
pub use config::CallConfig;
pub use error::{CallError, ErrorKind};
