use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::error::Result;

/// Receives the current value at a path immediately on subscribe, then every
/// subsequent change. `None` means the path (or an ancestor) was deleted.
pub type ValueListener = Arc<dyn Fn(Option<Value>) + Send + Sync>;

/// Receives every existing child immediately on subscribe, then additions
/// and removals.
pub type ChildListener = Arc<dyn Fn(ChildEvent) + Send + Sync>;

/// Receives relay liveness changes (`true` = online).
pub type ConnectivityListener = Arc<dyn Fn(bool) + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub enum ChildEvent {
    Added { key: String, value: Value },
    Removed { key: String },
}

const SERVER_VALUE_KEY: &str = ".sv";
const SERVER_VALUE_TIMESTAMP: &str = "timestamp";

/// Placeholder replaced by the relay's own clock when a record is written.
pub fn server_timestamp() -> Value {
    let mut map = serde_json::Map::new();
    map.insert(
        SERVER_VALUE_KEY.to_string(),
        Value::from(SERVER_VALUE_TIMESTAMP),
    );
    Value::Object(map)
}

pub fn is_server_timestamp(value: &Value) -> bool {
    value
        .as_object()
        .and_then(|o| o.get(SERVER_VALUE_KEY))
        .and_then(Value::as_str)
        == Some(SERVER_VALUE_TIMESTAMP)
}

/// Contract of the external realtime relay.
///
/// Paths are `/`-separated. Deleting a path removes its whole sub-tree
/// atomically from a subscriber's point of view. Implementations report
/// failures and never retry on their own.
#[async_trait]
pub trait SignalingStore: Send + Sync {
    async fn authenticate(&self, credential: &str) -> Result<()>;

    async fn put(&self, path: &str, value: Value) -> Result<()>;

    /// Appends `value` under `path` with a relay-generated, arrival-ordered key.
    async fn push(&self, path: &str, value: Value) -> Result<String>;

    async fn get(&self, path: &str) -> Result<Option<Value>>;

    async fn subscribe_value(&self, path: &str, listener: ValueListener) -> Result<Subscription>;

    async fn subscribe_children(&self, path: &str, listener: ChildListener)
    -> Result<Subscription>;

    async fn delete(&self, path: &str) -> Result<()>;

    fn observe_connectivity(&self, listener: ConnectivityListener) -> Subscription;

    fn is_online(&self) -> bool;
}

type Disposer = Box<dyn FnOnce() + Send + Sync>;

/// Handle for one active listener. Dropping it unsubscribes.
pub struct Subscription {
    path: String,
    disposer: Option<Disposer>,
}

impl Subscription {
    pub fn new(path: impl Into<String>, disposer: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            path: path.into(),
            disposer: Some(Box::new(disposer)),
        }
    }

    /// A subscription with nothing to release.
    pub fn noop(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            disposer: None,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(disposer) = self.disposer.take() {
            disposer();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("path", &self.path)
            .field("active", &self.disposer.is_some())
            .finish()
    }
}

/// Per-session collection of listener handles.
///
/// Releasing the set is the only way a session's relay listeners go away.
#[derive(Debug, Default)]
pub struct SubscriptionSet {
    subscriptions: std::sync::Mutex<Vec<Subscription>>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, subscription: Subscription) {
        self.subscriptions
            .lock()
            .expect("Mutex should not be poisoned")
            .push(subscription);
    }

    pub fn len(&self) -> usize {
        self.subscriptions
            .lock()
            .expect("Mutex should not be poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unsubscribes everything. Returns how many listeners were released.
    pub fn release_all(&self) -> usize {
        let released = std::mem::take(
            &mut *self
                .subscriptions
                .lock()
                .expect("Mutex should not be poisoned"),
        );
        let count = released.len();
        drop(released);
        count
    }
}
