use std::sync::Arc;

use synkv_backend::BackendError;
use tokio::sync::broadcast;

/// Errors produced by a [`Store`](crate::Store).
///
/// Only `Encode` and `TornDown` are returned from calls. Write and subscriber
/// failures happen after the call has returned and are delivered on the
/// store's error stream instead.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The value could not be serialized; nothing was changed.
    #[error("cannot encode value for {key}: {reason}")]
    Encode { key: String, reason: String },

    /// A background write was rejected by the backend. The cached value is
    /// kept.
    #[error("write of {key} failed: {source}")]
    Write {
        key: String,
        #[source]
        source: BackendError,
    },

    /// A subscriber callback panicked while being notified.
    #[error("subscriber for {key} panicked: {message}")]
    Subscriber { key: String, message: String },

    /// The store has been torn down and no longer accepts writes.
    #[error("store has been torn down")]
    TornDown,
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Receiver side of a store's out-of-band error channel.
pub type ErrorStream = broadcast::Receiver<Arc<StoreError>>;
