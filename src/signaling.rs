//! Typed access to the signaling relay.
//!
//! Relay layout:
//!
//! ```text
//! sessions/{sessionId}/offer
//! sessions/{sessionId}/answer
//! sessions/{sessionId}/ice/{pushKey}
//! inbox/{calleeId}/{sessionId}
//! ```
//!
//! Every `subscribe_*` registers its disposer in the caller's
//! [`SubscriptionSet`] before returning. Failures are returned as-is; retry
//! policy belongs to the caller.

use std::sync::Arc;

use log::{debug, warn};
use pccore::store::{
    ChildEvent, SignalingStore, Subscription, SubscriptionSet, server_timestamp,
};
use pccore::types::{Answer, IceCandidate, Offer, SessionId};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::CallError;

/// Offer discovery notifications for one callee.
#[derive(Debug, Clone)]
pub enum OfferEvent {
    Received(SessionId, Offer),
    /// The caller deleted the session before it was answered.
    Withdrawn(SessionId),
}

fn session_path(session_id: &SessionId) -> String {
    format!("sessions/{}", session_id)
}

fn offer_path(session_id: &SessionId) -> String {
    format!("sessions/{}/offer", session_id)
}

fn answer_path(session_id: &SessionId) -> String {
    format!("sessions/{}/answer", session_id)
}

fn ice_path(session_id: &SessionId) -> String {
    format!("sessions/{}/ice", session_id)
}

fn inbox_path(callee_id: &str) -> String {
    format!("inbox/{}", callee_id)
}

/// Serializes `record` and swaps its `timestamp` for the relay's sentinel.
fn stamped<T: Serialize>(record: &T) -> Result<Value, CallError> {
    let mut value = serde_json::to_value(record).map_err(pccore::store::StoreError::from)?;
    if let Some(obj) = value.as_object_mut() {
        obj.insert("timestamp".to_string(), server_timestamp());
    }
    Ok(value)
}

fn decode<T: DeserializeOwned>(path: &str, value: Value) -> Option<T> {
    match serde_json::from_value(value) {
        Ok(decoded) => Some(decoded),
        Err(e) => {
            warn!(target: "Call/Signaling", "Dropping malformed payload at {path}: {e}");
            None
        }
    }
}

pub struct SignalingAdapter {
    store: Arc<dyn SignalingStore>,
}

impl SignalingAdapter {
    pub fn new(store: Arc<dyn SignalingStore>) -> Self {
        Self { store }
    }

    pub async fn authenticate(&self, credential: &str) -> Result<(), CallError> {
        Ok(self.store.authenticate(credential).await?)
    }

    pub fn is_online(&self) -> bool {
        self.store.is_online()
    }

    /// Writes the offer. First revisions are also indexed in the callee's inbox.
    pub async fn put_offer(&self, session_id: &SessionId, offer: &Offer) -> Result<(), CallError> {
        let value = stamped(offer)?;
        self.store.put(&offer_path(session_id), value.clone()).await?;
        if offer.revision == 0 {
            self.store
                .put(&format!("{}/{}", inbox_path(&offer.to), session_id), value)
                .await?;
        }
        debug!(
            target: "Call/Signaling",
            "Offer r{} written for {session_id}", offer.revision
        );
        Ok(())
    }

    /// Writes the answer, refusing to do so unless the offer it answers is
    /// already in the relay.
    pub async fn put_answer(
        &self,
        session_id: &SessionId,
        answer: &Answer,
    ) -> Result<(), CallError> {
        let path = offer_path(session_id);
        let offer: Option<Offer> = match self.store.get(&path).await? {
            Some(value) => decode(&path, value),
            None => None,
        };
        match offer {
            Some(offer) if offer.revision == answer.revision => {}
            Some(offer) => {
                return Err(CallError::StaleRevision {
                    answered: answer.revision,
                    current: offer.revision,
                });
            }
            None => {
                return Err(CallError::Negotiation(format!(
                    "no offer for session {session_id}"
                )));
            }
        }
        self.store
            .put(&answer_path(session_id), stamped(answer)?)
            .await?;
        debug!(
            target: "Call/Signaling",
            "Answer r{} written for {session_id}", answer.revision
        );
        Ok(())
    }

    pub async fn push_ice_candidate(
        &self,
        session_id: &SessionId,
        candidate: &IceCandidate,
    ) -> Result<String, CallError> {
        Ok(self
            .store
            .push(&ice_path(session_id), stamped(candidate)?)
            .await?)
    }

    /// Watches `inbox/{local_id}` for offers addressed to this party.
    pub async fn subscribe_offers<F>(
        &self,
        local_id: &str,
        subs: &SubscriptionSet,
        on_offer: F,
    ) -> Result<(), CallError>
    where
        F: Fn(OfferEvent) + Send + Sync + 'static,
    {
        let path = inbox_path(local_id);
        let listener_path = path.clone();
        let sub = self
            .store
            .subscribe_children(
                &path,
                Arc::new(move |event| match event {
                    ChildEvent::Added { key, value } => {
                        if let Some(offer) = decode::<Offer>(&listener_path, value) {
                            on_offer(OfferEvent::Received(SessionId::new(key), offer));
                        }
                    }
                    ChildEvent::Removed { key } => {
                        on_offer(OfferEvent::Withdrawn(SessionId::new(key)));
                    }
                }),
            )
            .await?;
        subs.push(sub);
        Ok(())
    }

    pub async fn subscribe_answer<F>(
        &self,
        session_id: &SessionId,
        subs: &SubscriptionSet,
        on_answer: F,
    ) -> Result<(), CallError>
    where
        F: Fn(Answer) + Send + Sync + 'static,
    {
        let path = answer_path(session_id);
        let listener_path = path.clone();
        let sub = self
            .store
            .subscribe_value(
                &path,
                Arc::new(move |value| {
                    if let Some(answer) = value.and_then(|v| decode::<Answer>(&listener_path, v)) {
                        on_answer(answer);
                    }
                }),
            )
            .await?;
        subs.push(sub);
        Ok(())
    }

    /// Delivers every candidate with its push key; existing ones first.
    pub async fn subscribe_ice_candidates<F>(
        &self,
        session_id: &SessionId,
        subs: &SubscriptionSet,
        on_candidate: F,
    ) -> Result<(), CallError>
    where
        F: Fn(String, IceCandidate) + Send + Sync + 'static,
    {
        let path = ice_path(session_id);
        let listener_path = path.clone();
        let sub = self
            .store
            .subscribe_children(
                &path,
                Arc::new(move |event| {
                    if let ChildEvent::Added { key, value } = event
                        && let Some(candidate) = decode::<IceCandidate>(&listener_path, value)
                    {
                        on_candidate(key, candidate);
                    }
                }),
            )
            .await?;
        subs.push(sub);
        Ok(())
    }

    /// Watches the session's offer; `None` means it is absent (never written,
    /// or deleted by the other party).
    pub async fn watch_offer<F>(
        &self,
        session_id: &SessionId,
        subs: &SubscriptionSet,
        on_change: F,
    ) -> Result<(), CallError>
    where
        F: Fn(Option<Offer>) + Send + Sync + 'static,
    {
        let path = offer_path(session_id);
        let listener_path = path.clone();
        let sub = self
            .store
            .subscribe_value(
                &path,
                Arc::new(move |value| match value {
                    Some(v) => {
                        if let Some(offer) = decode::<Offer>(&listener_path, v) {
                            on_change(Some(offer));
                        }
                    }
                    None => on_change(None),
                }),
            )
            .await?;
        subs.push(sub);
        Ok(())
    }

    /// Removes the session sub-tree and its inbox entry. Deleting an absent
    /// session is not an error.
    pub async fn delete_session(&self, session_id: &SessionId) -> Result<(), CallError> {
        let path = offer_path(session_id);
        let callee = match self.store.get(&path).await? {
            Some(value) => decode::<Offer>(&path, value).map(|o| o.to),
            None => None,
        };
        if let Some(callee) = callee {
            self.store
                .delete(&format!("{}/{}", inbox_path(&callee), session_id))
                .await?;
        }
        self.store.delete(&session_path(session_id)).await?;
        debug!(target: "Call/Signaling", "Deleted session {session_id}");
        Ok(())
    }

    /// Removes an offer from `callee_id`'s inbox without touching the session.
    pub async fn delete_inbox_entry(
        &self,
        callee_id: &str,
        session_id: &SessionId,
    ) -> Result<(), CallError> {
        Ok(self
            .store
            .delete(&format!("{}/{}", inbox_path(callee_id), session_id))
            .await?)
    }

    pub fn observe_connectivity<F>(&self, on_change: F) -> Subscription
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.store.observe_connectivity(Arc::new(on_change))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pccore::store::{MemoryStore, OpKind};
    use std::sync::Mutex;

    async fn adapter() -> (MemoryStore, SignalingAdapter) {
        let store = MemoryStore::new();
        store.authenticate("token").await.unwrap();
        let adapter = SignalingAdapter::new(Arc::new(store.clone()));
        (store, adapter)
    }

    #[tokio::test]
    async fn test_offer_is_stamped_and_indexed() {
        let (store, adapter) = adapter().await;
        let sid = SessionId::new("s1");
        adapter
            .put_offer(&sid, &Offer::new("v=0", "alice", "bob"))
            .await
            .unwrap();

        let offer = store.value_at("sessions/s1/offer").unwrap();
        assert!(offer["timestamp"].as_i64().unwrap() > 0);
        assert!(store.value_at("inbox/bob/s1").is_some());
    }

    #[tokio::test]
    async fn test_answer_requires_offer() {
        let (store, adapter) = adapter().await;
        let sid = SessionId::new("s1");
        let err = adapter
            .put_answer(&sid, &Answer::new("v=0", "bob", 0))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Negotiation(_)));
        assert!(store.value_at("sessions/s1/answer").is_none());

        adapter
            .put_offer(&sid, &Offer::new("v=0", "alice", "bob"))
            .await
            .unwrap();
        adapter
            .put_answer(&sid, &Answer::new("v=0", "bob", 0))
            .await
            .unwrap();
        assert!(store.value_at("sessions/s1/answer").is_some());
    }

    #[tokio::test]
    async fn test_answer_to_replaced_offer_is_stale() {
        let (store, adapter) = adapter().await;
        let sid = SessionId::new("s1");
        let offer = Offer::new("v=0", "alice", "bob");
        adapter.put_offer(&sid, &offer.clone().restart(2)).await.unwrap();

        let err = adapter
            .put_answer(&sid, &Answer::new("v=0", "bob", 1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CallError::StaleRevision {
                answered: 1,
                current: 2
            }
        ));
        assert_eq!(err.kind(), crate::error::ErrorKind::Negotiation);
        assert!(store.value_at("sessions/s1/answer").is_none());
    }

    #[tokio::test]
    async fn test_restart_offer_skips_inbox() {
        let (store, adapter) = adapter().await;
        let sid = SessionId::new("s1");
        let offer = Offer::new("v=0", "alice", "bob");
        adapter.put_offer(&sid, &offer).await.unwrap();
        adapter.delete_inbox_entry("bob", &sid).await.unwrap();
        adapter.put_offer(&sid, &offer.restart(1)).await.unwrap();

        assert!(store.value_at("inbox/bob/s1").is_none());
        assert_eq!(store.value_at("sessions/s1/offer").unwrap()["revision"], 1);
    }

    #[tokio::test]
    async fn test_subscriptions_are_collected() {
        let (store, adapter) = adapter().await;
        let sid = SessionId::new("s1");
        let subs = SubscriptionSet::new();
        adapter.subscribe_answer(&sid, &subs, |_| {}).await.unwrap();
        adapter
            .subscribe_ice_candidates(&sid, &subs, |_, _| {})
            .await
            .unwrap();
        adapter.watch_offer(&sid, &subs, |_| {}).await.unwrap();
        assert_eq!(subs.len(), 3);
        assert_eq!(store.listener_count(), 3);

        subs.release_all();
        assert_eq!(store.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_candidates_delivered_with_keys_and_malformed_dropped() {
        let (store, adapter) = adapter().await;
        let sid = SessionId::new("s1");
        let subs = SubscriptionSet::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        adapter
            .subscribe_ice_candidates(&sid, &subs, move |key, c| {
                s.lock().unwrap().push((key, c.candidate))
            })
            .await
            .unwrap();

        store
            .push("sessions/s1/ice", serde_json::json!({"bogus": true}))
            .await
            .unwrap();
        let key = adapter
            .push_ice_candidate(&sid, &IceCandidate::new("candidate:1", "alice"))
            .await
            .unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![(key, "candidate:1".to_string())]
        );
    }

    #[tokio::test]
    async fn test_delete_session_removes_tree_and_inbox() {
        let (store, adapter) = adapter().await;
        let sid = SessionId::new("s1");
        adapter
            .put_offer(&sid, &Offer::new("v=0", "alice", "bob"))
            .await
            .unwrap();
        adapter
            .push_ice_candidate(&sid, &IceCandidate::new("candidate:1", "alice"))
            .await
            .unwrap();

        let subs = SubscriptionSet::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let e = events.clone();
        adapter
            .subscribe_offers("bob", &subs, move |ev| e.lock().unwrap().push(ev))
            .await
            .unwrap();

        adapter.delete_session(&sid).await.unwrap();
        adapter.delete_session(&sid).await.unwrap();

        assert!(store.paths_under("sessions/s1").is_empty());
        assert!(store.paths_under("inbox/bob").is_empty());
        let events = events.lock().unwrap();
        assert!(matches!(events[0], OfferEvent::Received(..)));
        assert!(matches!(events[1], OfferEvent::Withdrawn(_)));
        assert!(
            store
                .ops()
                .iter()
                .any(|op| op.kind == OpKind::Delete && op.path == "sessions/s1")
        );
    }
}
