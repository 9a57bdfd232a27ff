//! Relay reconnection supervision.
//!
//! The supervisor watches relay liveness. When the relay drops it retries
//! recovery of the active session with exponential backoff, waking early as
//! soon as the relay is back. Hitting the attempt ceiling fails the session.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use log::{debug, info, warn};
use pccore::backoff::Backoff;
use pccore::store::Subscription;
use pccore::types::CoreEventBus;
use pccore::types::events::{Event, Reconnected, Reconnecting};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

use crate::config::CallConfig;
use crate::error::CallError;
use crate::peer::PeerSession;
use crate::signaling::SignalingAdapter;

/// What the supervisor recovers.
#[async_trait]
pub trait RecoveryTarget: Send + Sync {
    fn active_session(&self) -> Option<Arc<PeerSession>>;

    /// Re-registers incoming-call discovery after the relay came back.
    async fn restore_discovery(&self) -> Result<(), CallError>;
}

struct Shared {
    attempts: AtomicU32,
    reconnecting: AtomicBool,
    shutdown: Notify,
    events: CoreEventBus,
    backoff: Backoff,
    max_attempts: u32,
}

impl Shared {
    fn begin_attempt(&self, attempt: u32) {
        self.attempts.store(attempt, Ordering::SeqCst);
        self.events
            .dispatch(&Event::Reconnecting(Reconnecting { attempt }));
    }

    fn finish(&self, attempts: Option<u32>) {
        self.reconnecting.store(false, Ordering::SeqCst);
        if let Some(attempts) = attempts {
            self.attempts.store(0, Ordering::SeqCst);
            self.events
                .dispatch(&Event::Reconnected(Reconnected { attempts }));
        }
    }
}

pub struct ReconnectSupervisor {
    shared: Arc<Shared>,
    _connectivity: Subscription,
    task: JoinHandle<()>,
}

impl ReconnectSupervisor {
    pub fn start(
        signaling: &SignalingAdapter,
        target: Weak<dyn RecoveryTarget>,
        events: CoreEventBus,
        config: &CallConfig,
    ) -> Self {
        let (online_tx, online_rx) = watch::channel(signaling.is_online());
        let connectivity = signaling.observe_connectivity(move |online| {
            online_tx.send_replace(online);
        });

        let shared = Arc::new(Shared {
            attempts: AtomicU32::new(0),
            reconnecting: AtomicBool::new(false),
            shutdown: Notify::new(),
            events,
            backoff: config.reconnect_backoff(),
            max_attempts: config.max_reconnect_attempts,
        });
        let task = tokio::spawn(supervise(shared.clone(), online_rx, target));

        Self {
            shared,
            _connectivity: connectivity,
            task,
        }
    }

    /// Attempts made in the current (or last exhausted) recovery cycle.
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    pub fn is_reconnecting(&self) -> bool {
        self.shared.reconnecting.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.shared.shutdown.notify_one();
        self.task.abort();
    }
}

impl Drop for ReconnectSupervisor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn supervise(
    shared: Arc<Shared>,
    mut online: watch::Receiver<bool>,
    target: Weak<dyn RecoveryTarget>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shared.shutdown.notified() => return,
            lost = online.wait_for(|o| !*o) => {
                if lost.is_err() {
                    return;
                }
            }
        }

        let Some(target) = target.upgrade() else {
            return;
        };
        warn!(target: "Call/Reconnect", "Relay connection lost");
        shared.reconnecting.store(true, Ordering::SeqCst);

        let session = target.active_session().filter(|s| !s.is_ended());
        let keep_going = match session {
            Some(session) => recover_session(&shared, &mut online, target.as_ref(), &session).await,
            None => restore_idle(&shared, &mut online, target.as_ref()).await,
        };
        if !keep_going {
            return;
        }
    }
}

/// No call in progress: wait for the relay and listen for offers again.
async fn restore_idle(
    shared: &Shared,
    online: &mut watch::Receiver<bool>,
    target: &dyn RecoveryTarget,
) -> bool {
    tokio::select! {
        biased;
        _ = shared.shutdown.notified() => return false,
        restored = online.wait_for(|o| *o) => {
            if restored.is_err() {
                return false;
            }
        }
    }
    if let Err(e) = target.restore_discovery().await {
        warn!(target: "Call/Reconnect", "Could not restore call discovery: {e}");
    }
    info!(target: "Call/Reconnect", "Relay restored");
    shared.finish(Some(0));
    true
}

async fn recover_session(
    shared: &Shared,
    online: &mut watch::Receiver<bool>,
    target: &dyn RecoveryTarget,
    session: &Arc<PeerSession>,
) -> bool {
    for attempt in 1..=shared.max_attempts {
        shared.begin_attempt(attempt);
        let delay = shared.backoff.delay(attempt - 1);
        debug!(target: "Call/Reconnect", "Attempt {attempt}/{} in {delay:?}", shared.max_attempts);

        let already_online = *online.borrow();
        if already_online {
            tokio::select! {
                biased;
                _ = shared.shutdown.notified() => return false,
                _ = tokio::time::sleep(delay) => {}
            }
        } else {
            tokio::select! {
                biased;
                _ = shared.shutdown.notified() => return false,
                _ = tokio::time::sleep(delay) => {}
                restored = online.wait_for(|o| *o) => {
                    if restored.is_err() {
                        return false;
                    }
                }
            }
        }

        if session.is_ended() {
            debug!(target: "Call/Reconnect", "Session ended during recovery");
            shared.finish(None);
            return true;
        }
        if !*online.borrow() {
            continue;
        }

        match recover(session).await {
            Ok(()) => {
                if let Err(e) = target.restore_discovery().await {
                    warn!(target: "Call/Reconnect", "Could not restore call discovery: {e}");
                }
                info!(target: "Call/Reconnect", "Recovered after {attempt} attempt(s)");
                shared.finish(Some(attempt));
                return true;
            }
            Err(e) => warn!(target: "Call/Reconnect", "Attempt {attempt} failed: {e}"),
        }
    }

    warn!(
        target: "Call/Reconnect",
        "Giving up after {} attempts", shared.max_attempts
    );
    session.fail("reconnection attempts exhausted").await;
    shared.finish(None);
    true
}

async fn recover(session: &PeerSession) -> Result<(), CallError> {
    session.resubscribe().await?;
    if session.is_initiator() && session.state().can_restart_ice() {
        session.restart_ice().await?;
    }
    Ok(())
}
