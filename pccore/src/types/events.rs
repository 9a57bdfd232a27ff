use std::sync::{
    Arc, RwLock,
    atomic::{AtomicU64, Ordering},
};

use serde::Serialize;

use super::recording::RecordingSegment;
use super::session::{EndReason, SessionId, TransportKind};
use crate::state::PeerState;

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStateChanged {
    pub session_id: Option<SessionId>,
    pub transport: TransportKind,
    pub state: PeerState,
    /// Most specific reason known when the state was entered (failures only).
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IncomingCall {
    pub from: String,
    pub transport: TransportKind,
    pub session_id: Option<SessionId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallEnded {
    pub session_id: Option<SessionId>,
    pub transport: TransportKind,
    pub reason: EndReason,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordingStarted {
    pub call_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordingStopped {
    pub segment: RecordingSegment,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordingError {
    pub call_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Reconnecting {
    pub attempt: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct Reconnected {
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize)]
pub enum Event {
    ConnectionStateChanged(ConnectionStateChanged),
    IncomingCall(IncomingCall),
    CallEnded(CallEnded),
    RecordingStarted(RecordingStarted),
    RecordingStopped(RecordingStopped),
    RecordingError(RecordingError),
    Reconnecting(Reconnecting),
    Reconnected(Reconnected),
}

pub trait EventHandler: Send + Sync {
    fn handle_event(&self, event: &Event);
}

impl<F> EventHandler for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn handle_event(&self, event: &Event) {
        self(event)
    }
}

/// Token returned by [`CoreEventBus::add_handler`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Multi-subscriber event bus.
///
/// Every registered handler receives every event; registering a second
/// handler never replaces the first. Handlers are removed only through the
/// [`HandlerId`] handed out at registration.
#[derive(Default, Clone)]
pub struct CoreEventBus {
    handlers: Arc<RwLock<Vec<(HandlerId, Arc<dyn EventHandler>)>>>,
    next_id: Arc<AtomicU64>,
}

impl CoreEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_handler(&self, handler: Arc<dyn EventHandler>) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .expect("RwLock should not be poisoned")
            .push((id, handler));
        id
    }

    /// Returns false if the handler was already removed.
    pub fn remove_handler(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write().expect("RwLock should not be poisoned");
        let before = handlers.len();
        handlers.retain(|(h, _)| *h != id);
        handlers.len() != before
    }

    /// Returns true if there are any event handlers registered.
    pub fn has_handlers(&self) -> bool {
        !self
            .handlers
            .read()
            .expect("RwLock should not be poisoned")
            .is_empty()
    }

    pub fn dispatch(&self, event: &Event) {
        // Snapshot so handlers may (un)register from inside a callback.
        let handlers: Vec<Arc<dyn EventHandler>> = self
            .handlers
            .read()
            .expect("RwLock should not be poisoned")
            .iter()
            .map(|(_, h)| h.clone())
            .collect();
        for handler in handlers {
            handler.handle_event(event);
        }
    }
}

impl std::fmt::Debug for CoreEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self
            .handlers
            .read()
            .map(|h| h.len())
            .unwrap_or_default();
        f.debug_struct("CoreEventBus")
            .field("handlers", &count)
            .finish()
    }
}
