//! Typed, cached, observable key-value store over a synkv backend.
//!
//! A [`Store`] wraps a [`Backend`](synkv_backend::Backend) with an in-memory
//! cache and per-key subscribers. Subscribers are notified of every change to
//! their key, whether it was made through this store or reported by the
//! backend as coming from another execution context; they cannot tell the two
//! apart.
//!
//! # Modules
//!
//! - [`codec`] -- [`Codec`] trait and the default [`JsonCodec`]
//! - [`registry`] -- per-key subscriber lists and [`Subscription`] handles
//! - [`store`] -- the [`Store`] facade and [`Lookup`] results
//! - [`config`] -- [`StoreConfig`]
//! - [`error`] -- [`StoreError`] and the out-of-band [`ErrorStream`]
//!
//! # Design Rules
//!
//! 1. Reads never fail: backend and decoding errors degrade to "no value".
//! 2. Writes are optimistic: cache and subscribers first, backend later;
//!    failures go to the error stream and are not retried.
//! 3. Notifications for a key are delivered in the order the changes were
//!    applied, and to subscribers in registration order.
//! 4. A panicking subscriber never prevents delivery to the others.
//! 5. A store never re-notifies for the backend echoing its own write.

pub mod codec;
pub mod config;
pub mod error;
mod lanes;
pub mod registry;
pub mod store;

pub use codec::{Codec, CodecError, Decoded, JsonCodec};
pub use config::StoreConfig;
pub use error::{ErrorStream, StoreError, StoreResult};
pub use registry::{Subscription, SubscriptionGuard, SubscriptionId};
pub use store::{Lookup, Store};
