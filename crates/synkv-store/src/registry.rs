//! Per-key subscriber bookkeeping and cancellation handles.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};

/// A subscriber callback.
pub type Callback<V> = Arc<dyn Fn(&V) + Send + Sync>;

/// Identifies one subscription. Ids increase monotonically, so id order is
/// registration order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

struct RegistryState<V> {
    next_id: u64,
    by_key: HashMap<String, Vec<(SubscriptionId, Callback<V>)>>,
}

/// Ordered callbacks per key.
///
/// Callbacks are never invoked while the registry is locked: notification
/// works on a [`snapshot`](Self::snapshot), so a callback may freely
/// subscribe, cancel, or trigger further notifications.
pub struct SubscriptionRegistry<V> {
    state: Mutex<RegistryState<V>>,
}

impl<V> SubscriptionRegistry<V> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                next_id: 0,
                by_key: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState<V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `callback` to the subscribers of `key`.
    pub fn insert(&self, key: &str, callback: Callback<V>) -> SubscriptionId {
        let mut state = self.lock();
        let id = SubscriptionId(state.next_id);
        state.next_id += 1;
        state
            .by_key
            .entry(key.to_owned())
            .or_default()
            .push((id, callback));
        id
    }

    /// Remove one subscription. Returns `false` if it was not registered.
    pub fn remove(&self, key: &str, id: SubscriptionId) -> bool {
        let mut state = self.lock();
        let Some(subs) = state.by_key.get_mut(key) else {
            return false;
        };
        let before = subs.len();
        subs.retain(|(sid, _)| *sid != id);
        let removed = subs.len() != before;
        if subs.is_empty() {
            state.by_key.remove(key);
        }
        removed
    }

    /// Callbacks for `key` in registration order, as of now.
    pub fn snapshot(&self, key: &str) -> Vec<Callback<V>> {
        self.lock()
            .by_key
            .get(key)
            .map(|subs| subs.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default()
    }

    pub fn count(&self, key: &str) -> usize {
        self.lock().by_key.get(key).map_or(0, Vec::len)
    }

    /// Keys with at least one subscriber, sorted.
    pub fn keys(&self) -> BTreeSet<String> {
        self.lock().by_key.keys().cloned().collect()
    }

    /// Total subscriptions across all keys.
    pub fn len(&self) -> usize {
        self.lock().by_key.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every subscription, returning how many there were.
    pub fn clear(&self) -> usize {
        let mut state = self.lock();
        let n = state.by_key.values().map(Vec::len).sum();
        state.by_key.clear();
        n
    }
}

impl<V> Default for SubscriptionRegistry<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> fmt::Debug for SubscriptionRegistry<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("subscriptions", &self.len())
            .finish()
    }
}

/// Type-erased removal, so [`Subscription`] need not carry the value type.
pub(crate) trait Unsubscribe: Send + Sync {
    fn unsubscribe(&self, key: &str, id: SubscriptionId) -> bool;
}

impl<V: 'static> Unsubscribe for SubscriptionRegistry<V> {
    fn unsubscribe(&self, key: &str, id: SubscriptionId) -> bool {
        self.remove(key, id)
    }
}

/// Handle returned by [`Store::subscribe`](crate::Store::subscribe).
///
/// Dropping the handle does not cancel the subscription; call
/// [`cancel`](Self::cancel), or convert it with
/// [`into_guard`](Self::into_guard) to cancel on drop. Cancelling is
/// idempotent and remains a no-op after the store is torn down or dropped.
pub struct Subscription {
    key: String,
    id: Option<SubscriptionId>,
    registry: Weak<dyn Unsubscribe>,
}

impl Subscription {
    pub(crate) fn new<V: 'static>(
        key: String,
        id: SubscriptionId,
        registry: &Arc<SubscriptionRegistry<V>>,
    ) -> Self {
        let registry: Arc<dyn Unsubscribe> = registry.clone();
        Self {
            key,
            id: Some(id),
            registry: Arc::downgrade(&registry),
        }
    }

    /// A handle that was never registered (subscribing to a torn-down store).
    pub(crate) fn inert(key: String) -> Self {
        let registry: Weak<SubscriptionRegistry<()>> = Weak::new();
        Self {
            key,
            id: None,
            registry,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn id(&self) -> Option<SubscriptionId> {
        self.id
    }

    /// Deregister the callback. Returns `true` only on the call that actually
    /// removed it.
    pub fn cancel(&self) -> bool {
        let Some(id) = self.id else {
            return false;
        };
        match self.registry.upgrade() {
            Some(registry) => registry.unsubscribe(&self.key, id),
            None => false,
        }
    }

    /// Wrap in a guard that cancels when dropped.
    pub fn into_guard(self) -> SubscriptionGuard {
        SubscriptionGuard(self)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}

/// Cancels its subscription on drop.
#[derive(Debug)]
pub struct SubscriptionGuard(Subscription);

impl SubscriptionGuard {
    pub fn subscription(&self) -> &Subscription {
        &self.0
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn counter() -> (Arc<AtomicUsize>, Callback<u32>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let cb: Callback<u32> = Arc::new(move |_: &u32| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        (hits, cb)
    }

    #[test]
    fn snapshot_preserves_registration_order() {
        let registry = SubscriptionRegistry::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in 0..3 {
            let seen = Arc::clone(&seen);
            registry.insert("k", Arc::new(move |_: &u32| seen.lock().unwrap().push(tag)));
        }
        for cb in registry.snapshot("k") {
            cb(&0);
        }
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn remove_only_targets_one_subscription() {
        let registry = SubscriptionRegistry::<u32>::new();
        let (_, a) = counter();
        let (_, b) = counter();
        let id_a = registry.insert("k", a);
        registry.insert("k", b);

        assert!(registry.remove("k", id_a));
        assert!(!registry.remove("k", id_a));
        assert_eq!(registry.count("k"), 1);
        assert!(!registry.remove("other", id_a));
    }

    #[test]
    fn empty_keys_are_pruned() {
        let registry = SubscriptionRegistry::<u32>::new();
        let (_, cb) = counter();
        let id = registry.insert("k", cb);
        assert_eq!(registry.keys().len(), 1);
        registry.remove("k", id);
        assert!(registry.keys().is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn snapshot_is_unaffected_by_later_removal() {
        let registry = SubscriptionRegistry::<u32>::new();
        let (hits, cb) = counter();
        let id = registry.insert("k", cb);
        let snapshot = registry.snapshot("k");
        registry.remove("k", id);
        for cb in snapshot {
            cb(&1);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handle_cancel_is_idempotent() {
        let registry = Arc::new(SubscriptionRegistry::<u32>::new());
        let (_, cb) = counter();
        let id = registry.insert("k", cb);
        let sub = Subscription::new("k".into(), id, &registry);

        assert!(sub.cancel());
        assert!(!sub.cancel());
        assert_eq!(registry.count("k"), 0);
    }

    #[test]
    fn cancel_after_registry_dropped_is_noop() {
        let registry = Arc::new(SubscriptionRegistry::<u32>::new());
        let (_, cb) = counter();
        let id = registry.insert("k", cb);
        let sub = Subscription::new("k".into(), id, &registry);
        drop(registry);
        assert!(!sub.cancel());
    }

    #[test]
    fn guard_cancels_on_drop() {
        let registry = Arc::new(SubscriptionRegistry::<u32>::new());
        let (_, cb) = counter();
        let id = registry.insert("k", cb);
        let guard = Subscription::new("k".into(), id, &registry).into_guard();
        assert_eq!(registry.count("k"), 1);
        drop(guard);
        assert_eq!(registry.count("k"), 0);
    }

    #[test]
    fn clear_reports_released_count() {
        let registry = SubscriptionRegistry::<u32>::new();
        for key in ["a", "a", "b"] {
            let (_, cb) = counter();
            registry.insert(key, cb);
        }
        assert_eq!(registry.clear(), 3);
        assert!(registry.is_empty());
    }

    #[test]
    fn inert_handle_does_nothing() {
        let sub = Subscription::inert("k".into());
        assert_eq!(sub.id(), None);
        assert!(!sub.cancel());
    }
}
