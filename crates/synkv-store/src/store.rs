//! The [`Store`] facade: cached, observable access to one backend namespace.
//!
//! # Consistency model
//!
//! `set` is optimistic. It updates the cache and notifies subscribers before
//! returning, then persists in the background. A failed write is reported on
//! the error stream and the cached value is kept, so the session keeps
//! reading its own write even when durability failed.
//!
//! Every cache change, local or external, is appended to a single outbox
//! under the state lock and delivered in that order. A `set` issued from
//! inside a callback is therefore delivered after the current notification
//! pass completes, never interleaved with it.

use std::any::Any;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::de::DeserializeOwned;
use serde::Serialize;
use synkv_backend::{Backend, Change, ChangeEvent, ChangeStream, Namespace, RawValue};
use tokio::runtime::Handle;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::codec::{Codec, Decoded, JsonCodec};
use crate::config::StoreConfig;
use crate::error::{ErrorStream, StoreError, StoreResult};
use crate::lanes::{Lanes, PendingWrite};
use crate::registry::{Subscription, SubscriptionRegistry};

/// Result of [`Store::load`], distinguishing the reasons a value may be
/// missing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Lookup<V> {
    Found(V),
    /// The key has never been written (or was removed).
    Absent,
    /// The stored payload could not be decoded.
    Corrupt,
    /// The backend failed to answer.
    Unavailable,
}

impl<V> Lookup<V> {
    pub fn into_value(self) -> Option<V> {
        match self {
            Self::Found(v) => Some(v),
            _ => None,
        }
    }

    pub fn value(&self) -> Option<&V> {
        match self {
            Self::Found(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Self::Found(_))
    }
}

/// Cache line for one key.
struct Entry<V> {
    /// Last known value; `None` means never read, absent, or corrupt.
    value: Option<V>,
    /// Bumped on every local or external change.
    version: u64,
    /// The cached value is a local write not yet confirmed durable.
    dirty: bool,
    /// Fingerprints of recent local writes, oldest first. Only kept for
    /// backends whose change feed echoes their own writes.
    echoes: VecDeque<[u8; 32]>,
    /// An external re-read was skipped while dirty; re-read once the local
    /// write lands.
    recheck: bool,
}

impl<V> Default for Entry<V> {
    fn default() -> Self {
        Self {
            value: None,
            version: 0,
            dirty: false,
            echoes: VecDeque::new(),
            recheck: false,
        }
    }
}

impl<V: Clone> Entry<V> {
    fn lookup(&self) -> Lookup<V> {
        match &self.value {
            Some(v) => Lookup::Found(v.clone()),
            None => Lookup::Absent,
        }
    }
}

struct State<V> {
    entries: HashMap<String, Entry<V>>,
    outbox: VecDeque<(String, V)>,
    delivering: bool,
    lanes: Lanes,
    torn_down: bool,
}

struct Inner<V, C> {
    backend: Arc<dyn Backend>,
    codec: C,
    config: StoreConfig,
    state: Mutex<State<V>>,
    registry: Arc<SubscriptionRegistry<V>>,
    in_flight: watch::Sender<usize>,
    errors: broadcast::Sender<Arc<StoreError>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    runtime: Handle,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A typed, cached, observable view of one backend namespace.
///
/// Cloning a `Store` yields another handle to the same cache and
/// subscribers.
pub struct Store<V, C = JsonCodec> {
    inner: Arc<Inner<V, C>>,
}

impl<V, C> Clone for Store<V, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> Store<V, JsonCodec>
where
    V: Serialize + DeserializeOwned + Clone + PartialEq + Send + Sync + 'static,
{
    /// A JSON-encoded store with default configuration.
    ///
    /// # Panics
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(backend: impl Backend) -> Self {
        Self::with_codec(backend, JsonCodec, StoreConfig::default())
    }

    pub fn with_config(backend: impl Backend, config: StoreConfig) -> Self {
        Self::with_codec(backend, JsonCodec, config)
    }
}

impl<V, C> Store<V, C>
where
    V: Clone + PartialEq + Send + Sync + 'static,
    C: Codec<V>,
{
    /// Build a store over `backend`. If the backend offers a change feed, a
    /// listener task is spawned to fold external changes into the cache.
    ///
    /// # Panics
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_codec(backend: impl Backend, codec: C, config: StoreConfig) -> Self {
        let backend: Arc<dyn Backend> = Arc::new(backend);
        let (in_flight, _) = watch::channel(0usize);
        let (errors, _) = broadcast::channel(config.error_channel_capacity.max(1));
        let feed = backend.watch();

        let inner = Arc::new(Inner {
            backend,
            codec,
            config,
            state: Mutex::new(State {
                entries: HashMap::new(),
                outbox: VecDeque::new(),
                delivering: false,
                lanes: Lanes::default(),
                torn_down: false,
            }),
            registry: Arc::new(SubscriptionRegistry::new()),
            in_flight,
            errors,
            listener: Mutex::new(None),
            runtime: Handle::current(),
        });

        let external_sync = feed.is_some();
        if let Some(feed) = feed {
            let task = inner.runtime.spawn(listen(Arc::downgrade(&inner), feed));
            *lock(&inner.listener) = Some(task);
        }

        info!(
            backend = inner.backend.name(),
            namespace = %inner.backend.namespace(),
            external_sync,
            "store opened"
        );
        Self { inner }
    }

    pub fn namespace(&self) -> &Namespace {
        self.inner.backend.namespace()
    }

    /// The underlying backend.
    pub fn backend(&self) -> &dyn Backend {
        self.inner.backend.as_ref()
    }

    /// Read `key` from the backend, refreshing the cache.
    ///
    /// Never fails: absent, corrupt, and unreadable values all yield `None`.
    /// Use [`load`](Self::load) to tell them apart.
    pub async fn get(&self, key: &str) -> Option<V> {
        self.load(key).await.into_value()
    }

    /// Like [`get`](Self::get), but reports why a value is missing.
    ///
    /// While a local write to `key` is not yet durable the optimistic cached
    /// value is returned without consulting the backend. A read that raced
    /// with a newer change does not overwrite the cache; the newer value is
    /// returned instead.
    pub async fn load(&self, key: &str) -> Lookup<V> {
        let version = {
            let state = lock(&self.inner.state);
            match state.entries.get(key) {
                Some(entry) if entry.dirty => return entry.lookup(),
                Some(entry) => entry.version,
                None => 0,
            }
        };

        let lookup = match self.inner.backend.read(key).await {
            Ok(Some(raw)) => match self.inner.codec.decode(&raw) {
                Decoded::Value(v) => Lookup::Found(v),
                Decoded::Corrupt(reason) => {
                    warn!(namespace = %self.namespace(), key, %reason, "stored value is corrupt");
                    Lookup::Corrupt
                }
            },
            Ok(None) => Lookup::Absent,
            Err(e) => {
                warn!(namespace = %self.namespace(), key, error = %e, "read failed");
                return Lookup::Unavailable;
            }
        };

        let mut state = lock(&self.inner.state);
        let entry = state.entries.entry(key.to_owned()).or_default();
        if entry.dirty || entry.version != version {
            debug!(key, "read superseded by newer change");
            return entry.lookup();
        }
        entry.value = lookup.value().cloned();
        lookup
    }

    /// The cached value for `key`, without touching the backend.
    pub fn cached(&self, key: &str) -> Option<V> {
        lock(&self.inner.state)
            .entries
            .get(key)
            .and_then(|e| e.value.clone())
    }

    /// Store `value` under `key`.
    ///
    /// The cache is updated and subscribers are notified before this returns;
    /// the backend write happens in the background. Write failures surface on
    /// [`errors`](Self::errors), not here.
    ///
    /// Notification happens on the calling thread unless another thread is
    /// already delivering for this store, in which case that thread delivers
    /// this change right after the ones queued before it. On a current-thread
    /// runtime, or with a single caller, subscribers have always run by the
    /// time `set` returns.
    pub fn set(&self, key: impl Into<String>, value: V) -> StoreResult<()> {
        let key = key.into();
        let raw = self
            .inner
            .codec
            .encode(&value)
            .map_err(|e| StoreError::Encode {
                key: key.clone(),
                reason: e.to_string(),
            })?;
        let fingerprint = raw.fingerprint();
        let window = if self.inner.backend.echoes_own_writes() {
            self.inner.config.echo_window
        } else {
            0
        };

        let (start_writer, drain) = {
            let mut state = lock(&self.inner.state);
            if state.torn_down {
                return Err(StoreError::TornDown);
            }
            let State {
                entries,
                outbox,
                delivering,
                lanes,
                ..
            } = &mut *state;

            let entry = entries.entry(key.clone()).or_default();
            entry.value = Some(value.clone());
            entry.version += 1;
            entry.dirty = true;
            if window > 0 {
                while entry.echoes.len() >= window {
                    entry.echoes.pop_front();
                }
                entry.echoes.push_back(fingerprint);
            }

            let start_writer = lanes.enqueue(
                &key,
                PendingWrite {
                    raw,
                    version: entry.version,
                },
            );
            outbox.push_back((key.clone(), value));
            (start_writer, !std::mem::replace(delivering, true))
        };

        debug!(namespace = %self.namespace(), key = %key, "set");

        if start_writer {
            self.inner.in_flight.send_modify(|n| *n += 1);
            self.inner
                .runtime
                .spawn(run_lane(Arc::clone(&self.inner), key));
        }
        if drain {
            self.inner.drain();
        }
        Ok(())
    }

    /// Register `callback` for every change to `key`, local or external.
    ///
    /// Callbacks for one key run in registration order. After teardown this
    /// returns an inert handle.
    pub fn subscribe<F>(&self, key: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(&V) + Send + Sync + 'static,
    {
        let key = key.into();
        let state = lock(&self.inner.state);
        if state.torn_down {
            debug!(key = %key, "subscribe after teardown ignored");
            return Subscription::inert(key);
        }
        let id = self.inner.registry.insert(&key, Arc::new(callback));
        drop(state);

        debug!(namespace = %self.namespace(), key = %key, %id, "subscribed");
        Subscription::new(key, id, &self.inner.registry)
    }

    pub fn subscriber_count(&self, key: &str) -> usize {
        self.inner.registry.count(key)
    }

    /// Out-of-band errors: failed background writes and panicking
    /// subscribers. Only errors raised after subscribing are received.
    pub fn errors(&self) -> ErrorStream {
        self.inner.errors.subscribe()
    }

    /// Keys with a background write queued or in progress.
    pub fn pending_writes(&self) -> usize {
        lock(&self.inner.state).lanes.active_count()
    }

    /// Wait until every queued background write has completed or failed.
    pub async fn flush(&self) {
        let mut rx = self.inner.in_flight.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Stop listening for external changes, drop all subscriptions and
    /// reject further writes. Queued writes still complete. Idempotent.
    pub fn teardown(&self) {
        let first = {
            let mut state = lock(&self.inner.state);
            state.outbox.clear();
            !std::mem::replace(&mut state.torn_down, true)
        };
        if let Some(task) = lock(&self.inner.listener).take() {
            task.abort();
        }
        let released = self.inner.registry.clear();
        if first {
            info!(namespace = %self.namespace(), released, "store torn down");
        }
    }

    pub fn is_torn_down(&self) -> bool {
        lock(&self.inner.state).torn_down
    }
}

impl<V, C> Inner<V, C>
where
    V: Clone + PartialEq + Send + Sync + 'static,
    C: Codec<V>,
{
    /// Deliver queued notifications until the outbox is empty. Only one
    /// caller drains at a time; others just enqueue.
    fn drain(&self) {
        loop {
            let (key, value) = {
                let mut state = lock(&self.state);
                match state.outbox.pop_front() {
                    Some(next) => next,
                    None => {
                        state.delivering = false;
                        return;
                    }
                }
            };
            self.notify(&key, &value);
        }
    }

    fn notify(&self, key: &str, value: &V) {
        for callback in self.registry.snapshot(key) {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(value)));
            if let Err(payload) = outcome {
                let message = panic_message(&*payload);
                warn!(key, %message, "subscriber panicked");
                self.report(StoreError::Subscriber {
                    key: key.to_owned(),
                    message,
                });
            }
        }
    }

    fn report(&self, error: StoreError) {
        // No receivers is fine: the warning has already been logged.
        let _ = self.errors.send(Arc::new(error));
    }

    async fn on_external(&self, event: ChangeEvent) {
        let ChangeEvent { key, change } = event;
        match change {
            Change::Set(raw) => self.apply_external(&key, Some(raw), None),
            Change::Removed => self.apply_external(&key, None, None),
            Change::Touched => self.reread(&key).await,
        }
    }

    /// Version to check a backend read against, or `None` when a local write
    /// is not yet durable. In that case the read could only return an older
    /// value, so the key is flagged to be re-read once the write lands.
    fn read_version(&self, key: &str) -> Option<u64> {
        let mut state = lock(&self.state);
        match state.entries.get_mut(key) {
            Some(entry) if entry.dirty => {
                entry.recheck = true;
                None
            }
            Some(entry) => Some(entry.version),
            None => Some(0),
        }
    }

    /// Re-read `key` from the backend and fold the result into the cache,
    /// unless something newer was applied meanwhile.
    async fn reread(&self, key: &str) {
        let Some(version) = self.read_version(key) else {
            debug!(key, "re-read deferred until local write lands");
            return;
        };
        match self.backend.read(key).await {
            Ok(payload) => self.apply_external(key, payload, Some(version)),
            Err(e) => warn!(key, error = %e, "re-read after external change failed"),
        }
    }

    /// Fold an externally observed payload (or its absence) into the cache.
    ///
    /// `read_at` is set for payloads obtained by reading the backend: the
    /// result is dropped if the entry changed since that version. Payloads
    /// from the change feed carry no version and are checked for echoes.
    fn apply_external(&self, key: &str, payload: Option<RawValue>, read_at: Option<u64>) {
        let decoded = payload
            .as_ref()
            .map(|raw| (raw.fingerprint(), self.codec.decode(raw)));

        let drain = {
            let mut state = lock(&self.state);
            if state.torn_down {
                return;
            }
            let State {
                entries,
                outbox,
                delivering,
                lanes,
                ..
            } = &mut *state;
            let entry = entries.entry(key.to_owned()).or_default();

            if let Some(version) = read_at {
                if entry.dirty || entry.version != version {
                    entry.recheck |= entry.dirty;
                    debug!(key, "re-read superseded by newer change");
                    return;
                }
            }

            let value = match decoded {
                Some((fingerprint, decoded)) => {
                    let echo = read_at
                        .is_none()
                        .then(|| entry.echoes.iter().position(|e| *e == fingerprint))
                        .flatten();
                    if let Some(pos) = echo {
                        entry.echoes.drain(..=pos);
                        debug!(key, fingerprint = %hex::encode(&fingerprint[..4]), "ignored echo of local write");
                        return;
                    }
                    match decoded {
                        Decoded::Value(v) => Some(v),
                        Decoded::Corrupt(reason) => {
                            warn!(key, %reason, "external value is corrupt; treating as absent");
                            None
                        }
                    }
                }
                None => None,
            };

            if entry.value == value {
                return;
            }
            if lanes.discard_pending(key) {
                debug!(key, "external change supersedes queued local write");
            }
            entry.value = value.clone();
            entry.version += 1;
            entry.dirty = false;
            entry.recheck = false;
            // Anything still in the window predates this change.
            entry.echoes.clear();

            match value {
                Some(v) => {
                    debug!(key, "external change");
                    outbox.push_back((key.to_owned(), v));
                    !std::mem::replace(delivering, true)
                }
                None => {
                    debug!(key, "external removal");
                    false
                }
            }
        };

        if drain {
            self.drain();
        }
    }

    /// Re-read every key this store cares about after missing change events.
    async fn resync(&self) {
        let keys: BTreeSet<String> = {
            let state = lock(&self.state);
            let mut keys = self.registry.keys();
            keys.extend(state.entries.keys().cloned());
            keys
        };
        for key in keys {
            self.reread(&key).await;
        }
    }
}

impl<V, C> Drop for Inner<V, C> {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.listener).take() {
            task.abort();
        }
    }
}

/// Consume the backend change feed until it closes or the store is gone.
async fn listen<V, C>(inner: Weak<Inner<V, C>>, mut feed: ChangeStream)
where
    V: Clone + PartialEq + Send + Sync + 'static,
    C: Codec<V>,
{
    loop {
        let received = feed.recv().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match received {
            Ok(event) => inner.on_external(event).await,
            Err(RecvError::Lagged(missed)) => {
                warn!(namespace = %feed.namespace(), missed, "change feed lagged; resyncing");
                // Whatever is still buffered predates the resync read.
                loop {
                    match feed.try_recv() {
                        Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                        Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                    }
                }
                inner.resync().await;
            }
            Err(RecvError::Closed) => {
                info!(namespace = %feed.namespace(), "change feed closed; continuing local-only");
                return;
            }
        }
    }
}

/// Write the latest pending payload for `key` until none is left.
async fn run_lane<V, C>(inner: Arc<Inner<V, C>>, key: String)
where
    V: Clone + PartialEq + Send + Sync + 'static,
    C: Codec<V>,
{
    loop {
        let next = lock(&inner.state).lanes.take_next(&key);
        let Some(write) = next else {
            break;
        };
        match inner.backend.write(&key, &write.raw).await {
            Ok(()) => {
                debug!(backend = inner.backend.name(), key = %key, "persisted");
                let recheck = {
                    let mut state = lock(&inner.state);
                    match state.entries.get_mut(&key) {
                        Some(entry) if entry.version == write.version => {
                            entry.dirty = false;
                            std::mem::take(&mut entry.recheck)
                        }
                        // A newer local set is queued behind this one.
                        Some(entry) if entry.dirty => false,
                        // An external change was applied while this write
                        // was in flight; the backend may now hold either.
                        Some(_) => true,
                        None => false,
                    }
                };
                if recheck {
                    debug!(key = %key, "reconciling after write");
                    inner.reread(&key).await;
                }
            }
            Err(source) => {
                warn!(backend = inner.backend.name(), key = %key, error = %source, "write failed");
                inner.report(StoreError::Write {
                    key: key.clone(),
                    source,
                });
            }
        }
    }
    inner.in_flight.send_modify(|n| *n = n.saturating_sub(1));
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

impl<V, C> fmt::Debug for Store<V, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("backend", &self.inner.backend.name())
            .field("namespace", self.inner.backend.namespace())
            .field("subscriptions", &self.inner.registry.len())
            .finish()
    }
}
