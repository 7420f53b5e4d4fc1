//! Persistence backends for synkv.
//!
//! A backend performs raw, namespaced reads and writes of serialized values
//! against some medium, and may additionally report changes made to that
//! medium by other execution contexts (another process, another tab).
//!
//! # Backends
//!
//! All backends implement the [`Backend`] trait:
//!
//! - [`MemoryBackend`] -- a handle on a shared [`MemoryMedium`]; several
//!   handles on one medium behave like several contexts sharing storage
//! - [`FileBackend`] -- one file per key, atomic replace-on-write, optional
//!   polling change feed for cross-process sharing
//!
//! # Design Rules
//!
//! 1. Storage keys are `{namespace}:{key}`; a handle never sees or reports
//!    keys outside its namespace.
//! 2. "Not present" is `Ok(None)`, never an error.
//! 3. Writes are atomic per key.
//! 4. A change feed never reports the handle's own writes unless the
//!    backend is explicitly configured to echo them.

pub mod error;
pub mod file;
pub mod memory;
pub mod traits;
pub mod types;

pub use error::{BackendError, BackendResult};
pub use file::{FileBackend, FileBackendConfig};
pub use memory::{MemoryBackend, MemoryMedium, MemoryMediumConfig};
pub use traits::Backend;
pub use types::{Change, ChangeEvent, ChangeStream, MediumChange, Namespace, OriginId, RawValue};
