//! In-memory storage medium shared by several execution contexts.
//!
//! A [`MemoryMedium`] plays the role of one physical storage area (think of a
//! browser's local storage shared by every tab of an origin). Each context
//! opens its own [`MemoryBackend`] handle on the medium; a write through one
//! handle is broadcast to the change feeds of every other handle.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{BackendError, BackendResult};
use crate::traits::Backend;
use crate::types::{Change, ChangeStream, MediumChange, Namespace, OriginId, RawValue};

/// Configuration for a [`MemoryMedium`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemoryMediumConfig {
    /// Total bytes (qualified keys plus payloads) the medium accepts.
    /// `None` means unlimited.
    pub quota_bytes: Option<usize>,
    /// Capacity of the change broadcast channel.
    pub channel_capacity: usize,
}

impl Default for MemoryMediumConfig {
    fn default() -> Self {
        Self {
            quota_bytes: None,
            channel_capacity: 1024,
        }
    }
}

struct MediumState {
    entries: BTreeMap<String, String>,
    used_bytes: usize,
}

struct MediumInner {
    state: RwLock<MediumState>,
    changes: broadcast::Sender<MediumChange>,
    available: AtomicBool,
    config: MemoryMediumConfig,
    /// Origin stamped on changes injected via the `external_*` helpers.
    foreign: OriginId,
}

/// A shared, in-memory storage area.
///
/// Cloning a medium yields another reference to the same storage.
#[derive(Clone)]
pub struct MemoryMedium {
    inner: Arc<MediumInner>,
}

impl MemoryMedium {
    /// Create an empty medium with default configuration.
    pub fn new() -> Self {
        Self::with_config(MemoryMediumConfig::default())
    }

    pub fn with_config(config: MemoryMediumConfig) -> Self {
        let (changes, _) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            inner: Arc::new(MediumInner {
                state: RwLock::new(MediumState {
                    entries: BTreeMap::new(),
                    used_bytes: 0,
                }),
                changes,
                available: AtomicBool::new(true),
                config,
                foreign: OriginId::new(),
            }),
        }
    }

    /// Open a context handle scoped to `namespace`.
    pub fn handle(&self, namespace: Namespace) -> MemoryBackend {
        MemoryBackend {
            medium: self.clone(),
            namespace,
            origin: OriginId::new(),
            echo: false,
        }
    }

    /// Simulate an outage: while unavailable every operation fails with
    /// [`BackendError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::SeqCst)
    }

    /// Bytes currently used (qualified keys plus payloads).
    pub fn used_bytes(&self) -> usize {
        self.inner.state.read().expect("medium lock poisoned").used_bytes
    }

    /// Number of entries across all namespaces.
    pub fn len(&self) -> usize {
        self.inner
            .state
            .read()
            .expect("medium lock poisoned")
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read a qualified key directly, bypassing any handle.
    pub fn raw_get(&self, qualified_key: &str) -> Option<RawValue> {
        self.inner
            .state
            .read()
            .expect("medium lock poisoned")
            .entries
            .get(qualified_key)
            .map(|s| RawValue::new(s.clone()))
    }

    /// Write a qualified key as a foreign context would, notifying every handle.
    pub fn external_write(&self, qualified_key: &str, raw: &RawValue) -> BackendResult<()> {
        self.put(self.inner.foreign, qualified_key, raw)
    }

    /// Remove a qualified key as a foreign context would.
    pub fn external_remove(&self, qualified_key: &str) -> BackendResult<bool> {
        self.delete(self.inner.foreign, qualified_key)
    }

    /// Announce a change to `qualified_key` without its payload.
    pub fn external_touch(&self, qualified_key: &str) {
        let _ = self.inner.changes.send(MediumChange {
            origin: self.inner.foreign,
            qualified_key: qualified_key.to_owned(),
            change: Change::Touched,
        });
    }

    /// Number of live change receivers across all handles.
    pub fn watcher_count(&self) -> usize {
        self.inner.changes.receiver_count()
    }

    fn check_available(&self) -> BackendResult<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(BackendError::Unavailable("memory medium is offline".into()))
        }
    }

    fn get(&self, qualified_key: &str) -> BackendResult<Option<RawValue>> {
        self.check_available()?;
        let state = self
            .inner
            .state
            .read()
            .map_err(|e| BackendError::Unavailable(format!("lock poisoned: {e}")))?;
        Ok(state
            .entries
            .get(qualified_key)
            .map(|s| RawValue::new(s.clone())))
    }

    fn put(&self, origin: OriginId, qualified_key: &str, raw: &RawValue) -> BackendResult<()> {
        self.check_available()?;
        let mut state = self
            .inner
            .state
            .write()
            .map_err(|e| BackendError::Unavailable(format!("lock poisoned: {e}")))?;

        let old = state
            .entries
            .get(qualified_key)
            .map_or(0, |v| qualified_key.len() + v.len());
        let new = qualified_key.len() + raw.len();
        let projected = state.used_bytes - old + new;
        if let Some(limit) = self.inner.config.quota_bytes {
            if projected > limit {
                return Err(BackendError::QuotaExceeded {
                    key: qualified_key.to_owned(),
                    size: projected,
                    limit,
                });
            }
        }

        state
            .entries
            .insert(qualified_key.to_owned(), raw.as_str().to_owned());
        state.used_bytes = projected;

        // Broadcast while still holding the write lock so the feed order
        // matches the order writes were applied.
        let _ = self.inner.changes.send(MediumChange {
            origin,
            qualified_key: qualified_key.to_owned(),
            change: Change::Set(raw.clone()),
        });
        Ok(())
    }

    fn delete(&self, origin: OriginId, qualified_key: &str) -> BackendResult<bool> {
        self.check_available()?;
        let mut state = self
            .inner
            .state
            .write()
            .map_err(|e| BackendError::Unavailable(format!("lock poisoned: {e}")))?;

        let Some(old) = state.entries.remove(qualified_key) else {
            return Ok(false);
        };
        state.used_bytes -= qualified_key.len() + old.len();

        let _ = self.inner.changes.send(MediumChange {
            origin,
            qualified_key: qualified_key.to_owned(),
            change: Change::Removed,
        });
        Ok(true)
    }

    fn keys_with_prefix(&self, namespace: &Namespace) -> BackendResult<Vec<String>> {
        self.check_available()?;
        let state = self
            .inner
            .state
            .read()
            .map_err(|e| BackendError::Unavailable(format!("lock poisoned: {e}")))?;
        // BTreeMap iteration is already sorted.
        Ok(state
            .entries
            .keys()
            .filter_map(|k| namespace.strip(k).map(str::to_owned))
            .collect())
    }
}

impl Default for MemoryMedium {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryMedium {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryMedium")
            .field("entry_count", &self.len())
            .field("available", &self.is_available())
            .finish()
    }
}

/// One execution context's view of a [`MemoryMedium`].
#[derive(Clone, Debug)]
pub struct MemoryBackend {
    medium: MemoryMedium,
    namespace: Namespace,
    origin: OriginId,
    echo: bool,
}

impl MemoryBackend {
    /// A stand-alone backend on a private medium.
    pub fn new(namespace: Namespace) -> Self {
        MemoryMedium::new().handle(namespace)
    }

    /// Make this handle's change feed also report its own writes, as some
    /// media do.
    pub fn with_echo(mut self) -> Self {
        self.echo = true;
        self
    }

    pub fn medium(&self) -> &MemoryMedium {
        &self.medium
    }

    pub fn origin(&self) -> OriginId {
        self.origin
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    async fn read(&self, key: &str) -> BackendResult<Option<RawValue>> {
        self.medium.get(&self.namespace.qualify(key))
    }

    async fn write(&self, key: &str, raw: &RawValue) -> BackendResult<()> {
        self.medium
            .put(self.origin, &self.namespace.qualify(key), raw)?;
        debug!(backend = "memory", namespace = %self.namespace, key, bytes = raw.len(), "wrote");
        Ok(())
    }

    async fn remove(&self, key: &str) -> BackendResult<bool> {
        self.medium.delete(self.origin, &self.namespace.qualify(key))
    }

    async fn keys(&self) -> BackendResult<Vec<String>> {
        self.medium.keys_with_prefix(&self.namespace)
    }

    fn watch(&self) -> Option<ChangeStream> {
        let suppress = if self.echo { None } else { Some(self.origin) };
        Some(ChangeStream::new(
            self.medium.inner.changes.subscribe(),
            self.namespace.clone(),
            suppress,
        ))
    }

    fn echoes_own_writes(&self) -> bool {
        self.echo
    }
}
