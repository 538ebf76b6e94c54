use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;

pub type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Opaque identity of one registered callback. Two registrations of the
/// same callback value get distinct ids and must be removed separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct RegisteredListener<T> {
    id: ListenerId,
    callback: Listener<T>,
}

struct RegistryInner<T, K> {
    next_id: u64,
    listeners: HashMap<K, Vec<RegisteredListener<T>>>,
}

/// Per-key callback sets shared by the timer multiplexer (string keys) and
/// the socket channel (event-kind keys). The key entry exists iff at least
/// one listener is registered under it.
pub struct ListenerRegistry<K, T> {
    inner: Mutex<RegistryInner<T, K>>,
}

impl<K, T> ListenerRegistry<K, T>
where
    K: Eq + Hash + Clone + Debug,
{
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                next_id: 0,
                listeners: HashMap::new(),
            }),
        }
    }

    pub fn add(&self, key: K, callback: Listener<T>) -> ListenerId {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = ListenerId(inner.next_id);
        inner
            .listeners
            .entry(key)
            .or_default()
            .push(RegisteredListener { id, callback });
        id
    }

    /// Removes one registration. Returns false when the id is no longer
    /// present, which makes repeated removal a no-op.
    pub fn remove(&self, key: &K, id: ListenerId) -> bool {
        let mut inner = self.inner.lock();
        let Some(entries) = inner.listeners.get_mut(key) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            inner.listeners.remove(key);
        }
        removed
    }

    pub fn contains(&self, key: &K, id: ListenerId) -> bool {
        let inner = self.inner.lock();
        inner
            .listeners
            .get(key)
            .map(|entries| entries.iter().any(|entry| entry.id == id))
            .unwrap_or(false)
    }

    pub fn listener_count(&self, key: &K) -> usize {
        let inner = self.inner.lock();
        inner
            .listeners
            .get(key)
            .map(|entries| entries.len())
            .unwrap_or(0)
    }

    pub fn keys(&self) -> Vec<K> {
        let inner = self.inner.lock();
        inner.listeners.keys().cloned().collect()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.listeners.clear();
    }

    /// Delivers `payload` to every listener registered under `key`,
    /// sequentially in registration order. The set is snapshotted up front
    /// so callbacks may subscribe/unsubscribe freely, and membership is
    /// re-checked immediately before each invocation so a listener removed
    /// mid-delivery is skipped. A panicking listener is logged and does not
    /// stop delivery to the rest. Returns the number of listeners invoked.
    pub fn deliver(&self, key: &K, payload: &T) -> usize {
        let snapshot: Vec<(ListenerId, Listener<T>)> = {
            let inner = self.inner.lock();
            match inner.listeners.get(key) {
                Some(entries) => entries
                    .iter()
                    .map(|entry| (entry.id, Arc::clone(&entry.callback)))
                    .collect(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        for (id, callback) in snapshot {
            if !self.contains(key, id) {
                continue;
            }
            if catch_unwind(AssertUnwindSafe(|| callback(payload))).is_err() {
                warn!(?key, listener = id.0, "listener panicked during delivery");
                continue;
            }
            delivered += 1;
        }
        delivered
    }
}

impl<K, T> Default for ListenerRegistry<K, T>
where
    K: Eq + Hash + Clone + Debug,
{
    fn default() -> Self {
        Self::new()
    }
}
