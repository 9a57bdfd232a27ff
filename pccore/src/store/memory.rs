//! In-process relay.
//!
//! Behaves like the external realtime store the engine talks to: values
//! at `/`-separated paths, server-assigned timestamps, immediate delivery of
//! the current value on subscribe, sub-tree deletes and a connectivity flag.
//! Used as a loopback relay and as the relay double in tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use log::debug;
use serde_json::Value;

use super::error::{Result, StoreError};
use super::traits::{
    ChildEvent, ChildListener, ConnectivityListener, SignalingStore, Subscription, ValueListener,
    is_server_timestamp,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Put,
    Push,
    Delete,
    SubscribeValue,
    SubscribeChildren,
}

/// One operation observed by the store, in commit order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOp {
    pub kind: OpKind,
    pub path: String,
}

#[derive(Default)]
struct Inner {
    data: BTreeMap<String, Value>,
    value_listeners: HashMap<u64, (String, ValueListener)>,
    child_listeners: HashMap<u64, (String, ChildListener)>,
    connectivity_listeners: HashMap<u64, ConnectivityListener>,
    offline: bool,
    authenticated: bool,
    required_credential: Option<String>,
    auth_calls: usize,
    last_timestamp: i64,
    push_counter: u64,
    failing_prefixes: Vec<String>,
    ops: Vec<StoreOp>,
}

impl Inner {
    fn next_timestamp(&mut self) -> i64 {
        let now = chrono::Utc::now().timestamp_millis();
        self.last_timestamp = now.max(self.last_timestamp + 1);
        self.last_timestamp
    }

    fn stamp(&mut self, mut value: Value) -> Value {
        if let Some(obj) = value.as_object_mut() {
            let keys: Vec<String> = obj
                .iter()
                .filter(|(_, v)| is_server_timestamp(v))
                .map(|(k, _)| k.clone())
                .collect();
            for key in keys {
                let ts = self.next_timestamp();
                obj.insert(key, Value::from(ts));
            }
        }
        value
    }

    fn check_writable(&self, path: &str) -> Result<()> {
        self.check_readable()?;
        if let Some(prefix) = self.failing_prefixes.iter().find(|p| path.starts_with(p.as_str())) {
            return Err(StoreError::Backend(format!("injected failure under {prefix}")));
        }
        Ok(())
    }

    fn check_readable(&self) -> Result<()> {
        if self.offline {
            return Err(StoreError::Offline);
        }
        if !self.authenticated {
            return Err(StoreError::NotAuthenticated);
        }
        Ok(())
    }
}

type Deliveries = Vec<Box<dyn FnOnce() + Send>>;

/// In-memory [`SignalingStore`].
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    next_id: Arc<AtomicU64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only `credential` will be accepted by [`SignalingStore::authenticate`].
    pub fn with_required_credential(credential: impl Into<String>) -> Self {
        let store = Self::default();
        store.lock().required_credential = Some(credential.into());
        store
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("Mutex should not be poisoned")
    }

    fn weak(&self) -> Weak<Mutex<Inner>> {
        Arc::downgrade(&self.inner)
    }

    /// Flips relay liveness and notifies connectivity observers on change.
    pub fn set_online(&self, online: bool) {
        let listeners: Vec<ConnectivityListener> = {
            let mut inner = self.lock();
            if inner.offline == !online {
                return;
            }
            inner.offline = !online;
            inner.connectivity_listeners.values().cloned().collect()
        };
        debug!(target: "Relay/Memory", "connectivity -> {}", if online { "online" } else { "offline" });
        for listener in listeners {
            listener(online);
        }
    }

    /// Makes every write under `prefix` fail until [`Self::clear_failures`].
    pub fn fail_writes_under(&self, prefix: impl Into<String>) {
        self.lock().failing_prefixes.push(prefix.into());
    }

    pub fn clear_failures(&self) {
        self.lock().failing_prefixes.clear();
    }

    pub fn auth_calls(&self) -> usize {
        self.lock().auth_calls
    }

    /// Every committed write and subscribe, in order.
    pub fn ops(&self) -> Vec<StoreOp> {
        self.lock().ops.clone()
    }

    pub fn value_at(&self, path: &str) -> Option<Value> {
        self.lock().data.get(path).cloned()
    }

    pub fn paths_under(&self, prefix: &str) -> Vec<String> {
        self.lock()
            .data
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn listener_count(&self) -> usize {
        let inner = self.lock();
        inner.value_listeners.len() + inner.child_listeners.len()
    }

    fn commit_write(&self, kind: OpKind, path: String, value: Value) -> Result<Value> {
        let (stamped, deliveries) = {
            let mut inner = self.lock();
            inner.check_writable(&path)?;
            let stamped = inner.stamp(value);
            inner.data.insert(path.clone(), stamped.clone());
            inner.ops.push(StoreOp {
                kind,
                path: path.clone(),
            });
            let deliveries = Self::collect_write_deliveries(&inner, &path, &stamped);
            (stamped, deliveries)
        };
        for deliver in deliveries {
            deliver();
        }
        Ok(stamped)
    }

    fn collect_write_deliveries(inner: &Inner, path: &str, value: &Value) -> Deliveries {
        let mut out: Deliveries = Vec::new();
        for (listen_path, listener) in inner.value_listeners.values() {
            if listen_path == path {
                let listener = listener.clone();
                let value = value.clone();
                out.push(Box::new(move || listener(Some(value))));
            }
        }
        if let Some((parent, key)) = split_parent(path) {
            for (listen_path, listener) in inner.child_listeners.values() {
                if listen_path == parent {
                    let listener = listener.clone();
                    let event = ChildEvent::Added {
                        key: key.to_string(),
                        value: value.clone(),
                    };
                    out.push(Box::new(move || listener(event)));
                }
            }
        }
        out
    }
}

fn split_parent(path: &str) -> Option<(&str, &str)> {
    path.rsplit_once('/')
}

fn is_within(path: &str, root: &str) -> bool {
    path == root
        || path
            .strip_prefix(root)
            .is_some_and(|rest| rest.starts_with('/'))
}

#[async_trait]
impl SignalingStore for MemoryStore {
    async fn authenticate(&self, credential: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.auth_calls += 1;
        if inner.offline {
            return Err(StoreError::Offline);
        }
        if credential.is_empty() {
            return Err(StoreError::Unauthorized("empty credential".into()));
        }
        if let Some(required) = &inner.required_credential
            && required != credential
        {
            return Err(StoreError::Unauthorized("credential mismatch".into()));
        }
        inner.authenticated = true;
        Ok(())
    }

    async fn put(&self, path: &str, value: Value) -> Result<()> {
        self.commit_write(OpKind::Put, path.to_string(), value)
            .map(|_| ())
    }

    async fn push(&self, path: &str, value: Value) -> Result<String> {
        let key = {
            let mut inner = self.lock();
            inner.check_writable(path)?;
            let ts = inner.next_timestamp();
            inner.push_counter += 1;
            format!("{:013}-{:06}", ts, inner.push_counter)
        };
        self.commit_write(OpKind::Push, format!("{path}/{key}"), value)?;
        Ok(key)
    }

    async fn get(&self, path: &str) -> Result<Option<Value>> {
        let inner = self.lock();
        inner.check_readable()?;
        Ok(inner.data.get(path).cloned())
    }

    async fn subscribe_value(&self, path: &str, listener: ValueListener) -> Result<Subscription> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let current = {
            let mut inner = self.lock();
            inner.check_readable()?;
            inner
                .value_listeners
                .insert(id, (path.to_string(), listener.clone()));
            inner.ops.push(StoreOp {
                kind: OpKind::SubscribeValue,
                path: path.to_string(),
            });
            inner.data.get(path).cloned()
        };
        listener(current);

        let weak = self.weak();
        Ok(Subscription::new(path, move || {
            if let Some(inner) = weak.upgrade() {
                inner
                    .lock()
                    .expect("Mutex should not be poisoned")
                    .value_listeners
                    .remove(&id);
            }
        }))
    }

    async fn subscribe_children(
        &self,
        path: &str,
        listener: ChildListener,
    ) -> Result<Subscription> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let existing: Vec<(String, Value)> = {
            let mut inner = self.lock();
            inner.check_readable()?;
            inner
                .child_listeners
                .insert(id, (path.to_string(), listener.clone()));
            inner.ops.push(StoreOp {
                kind: OpKind::SubscribeChildren,
                path: path.to_string(),
            });
            inner
                .data
                .iter()
                .filter_map(|(k, v)| match split_parent(k) {
                    Some((parent, key)) if parent == path => Some((key.to_string(), v.clone())),
                    _ => None,
                })
                .collect()
        };
        for (key, value) in existing {
            listener(ChildEvent::Added { key, value });
        }

        let weak = self.weak();
        Ok(Subscription::new(path, move || {
            if let Some(inner) = weak.upgrade() {
                inner
                    .lock()
                    .expect("Mutex should not be poisoned")
                    .child_listeners
                    .remove(&id);
            }
        }))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let deliveries = {
            let mut inner = self.lock();
            inner.check_writable(path)?;
            let removed: Vec<String> = inner
                .data
                .keys()
                .filter(|k| is_within(k, path))
                .cloned()
                .collect();
            for key in &removed {
                inner.data.remove(key);
            }
            inner.ops.push(StoreOp {
                kind: OpKind::Delete,
                path: path.to_string(),
            });

            let mut out: Deliveries = Vec::new();
            for removed_path in &removed {
                for (listen_path, listener) in inner.value_listeners.values() {
                    if listen_path == removed_path {
                        let listener = listener.clone();
                        out.push(Box::new(move || listener(None)));
                    }
                }
                if let Some((parent, key)) = split_parent(removed_path) {
                    for (listen_path, listener) in inner.child_listeners.values() {
                        if listen_path == parent {
                            let listener = listener.clone();
                            let event = ChildEvent::Removed {
                                key: key.to_string(),
                            };
                            out.push(Box::new(move || listener(event)));
                        }
                    }
                }
            }
            out
        };
        for deliver in deliveries {
            deliver();
        }
        Ok(())
    }

    fn observe_connectivity(&self, listener: ConnectivityListener) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock()
            .connectivity_listeners
            .insert(id, listener);
        let weak = self.weak();
        Subscription::new(".info/connected", move || {
            if let Some(inner) = weak.upgrade() {
                inner
                    .lock()
                    .expect("Mutex should not be poisoned")
                    .connectivity_listeners
                    .remove(&id);
            }
        })
    }

    fn is_online(&self) -> bool {
        !self.lock().offline
    }
}
