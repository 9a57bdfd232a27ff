//! Process-wide signaling context.
//!
//! Holds the relay handle and the identity it was authenticated for. The
//! facade receives it by `Arc` instead of reaching for global state.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use log::info;
use pccore::destination::{Destination, DestinationError};
use pccore::store::SignalingStore;

use crate::error::CallError;
use crate::signaling::SignalingAdapter;

pub struct SignalingContext {
    signaling: Arc<SignalingAdapter>,
    local_id: RwLock<Option<String>>,
}

impl SignalingContext {
    pub fn new(store: Arc<dyn SignalingStore>) -> Self {
        Self {
            signaling: Arc::new(SignalingAdapter::new(store)),
            local_id: RwLock::new(None),
        }
    }

    /// Authenticates against the relay as `local_id`, giving up after
    /// `relay_timeout`.
    pub async fn init(
        &self,
        credential: &str,
        local_id: &str,
        relay_timeout: Duration,
    ) -> Result<(), CallError> {
        let local_id = match Destination::parse(local_id)? {
            Destination::Peer(id) => id,
            Destination::Phone(_) => {
                return Err(DestinationError::Unrecognized(local_id.to_string()).into());
            }
        };

        tokio::time::timeout(relay_timeout, self.signaling.authenticate(credential))
            .await
            .map_err(|_| CallError::Timeout("signaling relay"))??;

        info!(target: "Call/Context", "Signaling relay ready for {local_id}");
        *self.local_id.write().expect("RwLock should not be poisoned") = Some(local_id);
        Ok(())
    }

    pub fn shutdown(&self) {
        if let Some(id) = self
            .local_id
            .write()
            .expect("RwLock should not be poisoned")
            .take()
        {
            info!(target: "Call/Context", "Signaling context for {id} shut down");
        }
    }

    pub fn signaling(&self) -> &Arc<SignalingAdapter> {
        &self.signaling
    }

    pub fn local_id(&self) -> Option<String> {
        self.local_id
            .read()
            .expect("RwLock should not be poisoned")
            .clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.local_id().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use pccore::store::MemoryStore;

    #[tokio::test]
    async fn test_init_and_shutdown() {
        let ctx = SignalingContext::new(Arc::new(MemoryStore::new()));
        assert!(!ctx.is_initialized());

        ctx.init("token", "peer:alice", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(ctx.local_id().as_deref(), Some("alice"));

        ctx.shutdown();
        assert!(!ctx.is_initialized());
    }

    #[tokio::test]
    async fn test_rejects_phone_number_identity() {
        let ctx = SignalingContext::new(Arc::new(MemoryStore::new()));
        let err = ctx
            .init("token", "+15551234567", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UserInput);
        assert!(!ctx.is_initialized());
    }

    #[tokio::test]
    async fn test_bad_credential_is_relay_error() {
        let ctx = SignalingContext::new(Arc::new(MemoryStore::with_required_credential("secret")));
        let err = ctx
            .init("wrong", "alice", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Relay);
        assert!(!ctx.is_initialized());
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_init_timeout() {
        let store = crate::test_utils::SlowAuthStore {
            inner: MemoryStore::new(),
            delay: Duration::from_secs(30),
        };
        let ctx = SignalingContext::new(Arc::new(store));
        let err = ctx
            .init("token", "alice", Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Timeout(_)));
    }
}
