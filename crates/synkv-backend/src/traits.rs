//! The [`Backend`] trait defining the persistence interface.
//!
//! Any medium (shared memory area, directory of files, remote service)
//! implements this trait to give a store raw, namespaced read/write access
//! and, optionally, a feed of changes made by other execution contexts.

use async_trait::async_trait;

use crate::error::BackendResult;
use crate::types::{ChangeStream, Namespace, RawValue};

/// Raw persistence for one namespace.
///
/// All implementations must satisfy these invariants:
/// - A missing key is `Ok(None)`, never an error.
/// - Writes are atomic per key: a concurrent read observes either the old or
///   the new payload, never a partial one.
/// - Keys passed in are logical keys; the backend qualifies them with its
///   namespace and never touches keys outside it.
/// - The change feed, when offered, only reports changes that did not
///   originate from this handle's own `write`/`remove` calls (unless the
///   backend documents that it echoes them).
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Short name for logs ("memory", "file", ...).
    fn name(&self) -> &'static str;

    /// The namespace this handle is scoped to.
    fn namespace(&self) -> &Namespace;

    /// Fetch the current payload for `key`.
    ///
    /// Returns `Ok(None)` if the key does not exist. Fails only for
    /// medium-level errors (I/O, permission, unavailability).
    async fn read(&self, key: &str) -> BackendResult<Option<RawValue>>;

    /// Persist `raw` under `key`, replacing any previous payload.
    async fn write(&self, key: &str, raw: &RawValue) -> BackendResult<()>;

    /// Delete `key`. Returns `true` if it existed.
    async fn remove(&self, key: &str) -> BackendResult<bool>;

    /// List the logical keys present in this namespace, sorted.
    async fn keys(&self) -> BackendResult<Vec<String>>;

    /// Subscribe to changes made outside this handle.
    ///
    /// Returns `None` when the medium cannot detect external changes; callers
    /// then operate local-only. Each call returns an independent stream.
    fn watch(&self) -> Option<ChangeStream> {
        None
    }

    /// Whether [`watch`](Self::watch) streams also carry this handle's own
    /// writes. Callers only need to recognise echoes when this is `true`.
    fn echoes_own_writes(&self) -> bool {
        false
    }
}
