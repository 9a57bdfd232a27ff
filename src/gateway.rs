//! Telephone gateway seam.
//!
//! The gateway is a black box; the engine only routes phone-number
//! destinations to it and forwards user actions.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("gateway unavailable: {0}")]
    Unavailable(String),

    #[error("call rejected by gateway: {0}")]
    Rejected(String),

    #[error("{0}")]
    Other(String),
}

pub type DisconnectHandler = Arc<dyn Fn() + Send + Sync>;

/// Handle to one established gateway call.
#[async_trait]
pub trait GatewayCall: Send + Sync {
    async fn disconnect(&self) -> Result<(), GatewayError>;

    fn mute(&self, muted: bool);

    fn is_muted(&self) -> bool;

    async fn send_tone(&self, digit: char) -> Result<(), GatewayError>;

    /// Invoked once when the remote side or the gateway ends the call.
    fn on_disconnect(&self, handler: DisconnectHandler);
}

/// A ringing inbound gateway call.
#[async_trait]
pub trait GatewayIncoming: Send + Sync {
    fn from(&self) -> &str;

    async fn accept(&self) -> Result<Arc<dyn GatewayCall>, GatewayError>;

    async fn reject(&self) -> Result<(), GatewayError>;
}

pub type IncomingHandler = Arc<dyn Fn(Arc<dyn GatewayIncoming>) + Send + Sync>;

#[async_trait]
pub trait GatewayTransport: Send + Sync {
    async fn connect(&self, destination: &str) -> Result<Arc<dyn GatewayCall>, GatewayError>;

    /// Replaces the inbound-call handler; `None` stops delivery.
    fn set_incoming_handler(&self, handler: Option<IncomingHandler>);
}
