//! Core backend types: namespaces, raw payloads, and change events.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::{BackendError, BackendResult};

/// Separator between namespace and logical key in qualified storage keys.
pub const NAMESPACE_SEPARATOR: char = ':';

/// A validated namespace scoping every key a backend handle touches.
///
/// Storage keys are qualified as `{namespace}:{key}` so several stores (or a
/// store and unrelated data) never collide on the same physical medium.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Namespace(String);

impl Namespace {
    /// Validate and wrap a namespace name.
    pub fn new(name: impl Into<String>) -> BackendResult<Self> {
        let name = name.into();
        let reason = if name.is_empty() {
            Some("must not be empty")
        } else if name.contains(NAMESPACE_SEPARATOR) {
            Some("must not contain ':'")
        } else if name.contains(['/', '\\']) {
            Some("must not contain path separators")
        } else if name == "." || name == ".." {
            Some("must not be a relative path component")
        } else if name.chars().any(char::is_control) {
            Some("must not contain control characters")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(BackendError::InvalidNamespace {
                name,
                reason: reason.into(),
            }),
            None => Ok(Self(name)),
        }
    }

    /// The namespace name.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Qualify a logical key for storage: `{namespace}:{key}`.
    pub fn qualify(&self, key: &str) -> String {
        format!("{}{NAMESPACE_SEPARATOR}{key}", self.0)
    }

    /// Return the logical key if `qualified` belongs to this namespace.
    pub fn strip<'a>(&self, qualified: &'a str) -> Option<&'a str> {
        qualified
            .strip_prefix(self.0.as_str())?
            .strip_prefix(NAMESPACE_SEPARATOR)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Namespace {
    type Error = BackendError;

    fn try_from(value: String) -> BackendResult<Self> {
        Self::new(value)
    }
}

impl From<Namespace> for String {
    fn from(ns: Namespace) -> Self {
        ns.0
    }
}

/// A serialized value as held by the medium (UTF-8 text).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawValue(String);

impl RawValue {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// Size of the payload in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// BLAKE3 digest of the payload, used to recognise a payload seen before.
    pub fn fingerprint(&self) -> [u8; 32] {
        *blake3::hash(self.0.as_bytes()).as_bytes()
    }
}

impl fmt::Display for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RawValue {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RawValue {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Identifies the handle (execution context) that produced a change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OriginId(Uuid);

impl OriginId {
    /// A fresh, time-ordered origin.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for OriginId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OriginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "origin:{}", self.0.simple())
    }
}

/// What happened to a key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Change {
    /// The key now holds this payload.
    Set(RawValue),
    /// The key was deleted.
    Removed,
    /// The key changed but the medium did not report the new payload;
    /// receivers must re-read it.
    Touched,
}

/// A change to a logical key within one namespace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeEvent {
    pub key: String,
    pub change: Change,
}

/// A change as broadcast by a medium: fully-qualified key plus the origin of
/// the writer. Receivers see these through a [`ChangeStream`].
#[derive(Clone, Debug)]
pub struct MediumChange {
    pub origin: OriginId,
    pub qualified_key: String,
    pub change: Change,
}

/// Receiver of external changes for one namespace.
///
/// Wraps a broadcast receiver from the medium and filters out changes to
/// foreign namespaces and (unless echo is enabled) changes made by the handle
/// that opened the stream.
pub struct ChangeStream {
    rx: broadcast::Receiver<MediumChange>,
    namespace: Namespace,
    suppress: Option<OriginId>,
}

impl ChangeStream {
    pub fn new(
        rx: broadcast::Receiver<MediumChange>,
        namespace: Namespace,
        suppress: Option<OriginId>,
    ) -> Self {
        Self {
            rx,
            namespace,
            suppress,
        }
    }

    /// Returns the logical event if `change` should be delivered.
    pub fn filter(&self, change: MediumChange) -> Option<ChangeEvent> {
        if self.suppress == Some(change.origin) {
            return None;
        }
        let key = self.namespace.strip(&change.qualified_key)?;
        Some(ChangeEvent {
            key: key.to_owned(),
            change: change.change,
        })
    }

    /// Wait for the next change in this namespace.
    ///
    /// Errors mirror [`broadcast::Receiver::recv`]: `Lagged(n)` when the
    /// receiver fell behind and `n` events were dropped, `Closed` once the
    /// medium is gone.
    pub async fn recv(&mut self) -> Result<ChangeEvent, broadcast::error::RecvError> {
        loop {
            let change = self.rx.recv().await?;
            if let Some(event) = self.filter(change) {
                return Ok(event);
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Result<ChangeEvent, broadcast::error::TryRecvError> {
        loop {
            let change = self.rx.try_recv()?;
            if let Some(event) = self.filter(change) {
                return Ok(event);
            }
        }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }
}

impl fmt::Debug for ChangeStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeStream")
            .field("namespace", &self.namespace)
            .field("suppress", &self.suppress)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_validation() {
        assert!(Namespace::new("settings").is_ok());
        assert!(Namespace::new("").is_err());
        assert!(Namespace::new("a:b").is_err());
        assert!(Namespace::new("a/b").is_err());
        assert!(Namespace::new("..").is_err());
    }

    #[test]
    fn qualify_and_strip() {
        let ns = Namespace::new("settings").unwrap();
        let q = ns.qualify("zoom");
        assert_eq!(q, "settings:zoom");
        assert_eq!(ns.strip(&q), Some("zoom"));
        assert_eq!(ns.strip("other:zoom"), None);
        // A namespace that merely shares a prefix is foreign.
        assert_eq!(ns.strip("settingsx:zoom"), None);
    }

    #[test]
    fn keys_may_contain_separator() {
        let ns = Namespace::new("app").unwrap();
        let q = ns.qualify("a:b");
        assert_eq!(ns.strip(&q), Some("a:b"));
    }

    #[test]
    fn namespace_serde_validates() {
        let ok: Namespace = serde_json::from_str("\"tabs\"").unwrap();
        assert_eq!(ok.as_str(), "tabs");
        assert!(serde_json::from_str::<Namespace>("\"a:b\"").is_err());
    }

    #[test]
    fn fingerprint_is_content_based() {
        let a = RawValue::from("\"lg\"");
        let b = RawValue::from("\"lg\"");
        let c = RawValue::from("\"md\"");
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn stream_filters_origin_and_namespace() {
        let (tx, rx) = broadcast::channel(16);
        let me = OriginId::new();
        let other = OriginId::new();
        let ns = Namespace::new("settings").unwrap();
        let mut stream = ChangeStream::new(rx, ns, Some(me));

        let send = |origin, key: &str| {
            tx.send(MediumChange {
                origin,
                qualified_key: key.into(),
                change: Change::Set(RawValue::from("1")),
            })
            .unwrap();
        };
        send(me, "settings:own");
        send(other, "elsewhere:foreign");
        send(other, "settings:zoom");

        let event = stream.try_recv().unwrap();
        assert_eq!(event.key, "zoom");
        assert!(stream.try_recv().is_err());
    }

    #[test]
    fn origin_display() {
        let o = OriginId::new();
        assert!(o.to_string().starts_with("origin:"));
        assert_ne!(o, OriginId::new());
    }
}
