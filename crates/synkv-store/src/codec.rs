//! Conversion between typed values and the backend's text payloads.

use serde::de::DeserializeOwned;
use serde::Serialize;
use synkv_backend::RawValue;

/// Failure to serialize a value.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct CodecError(pub String);

/// Outcome of decoding a payload. Decoding never fails with an error: a
/// payload that cannot be turned back into a value is reported as `Corrupt`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decoded<V> {
    Value(V),
    Corrupt(String),
}

impl<V> Decoded<V> {
    pub fn into_option(self) -> Option<V> {
        match self {
            Self::Value(v) => Some(v),
            Self::Corrupt(_) => None,
        }
    }

    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::Corrupt(_))
    }
}

/// Serializes values of type `V` to and from [`RawValue`] payloads.
///
/// `encode` followed by `decode` must yield a value equal to the original,
/// and `encode` must be deterministic: the store recognises echoes of its own
/// writes by comparing payloads.
pub trait Codec<V>: Send + Sync + 'static {
    fn encode(&self, value: &V) -> Result<RawValue, CodecError>;

    fn decode(&self, raw: &RawValue) -> Decoded<V>;
}

/// JSON codec via `serde_json`; the default for every store.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl<V> Codec<V> for JsonCodec
where
    V: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &V) -> Result<RawValue, CodecError> {
        serde_json::to_string(value)
            .map(RawValue::new)
            .map_err(|e| CodecError(e.to_string()))
    }

    fn decode(&self, raw: &RawValue) -> Decoded<V> {
        match serde_json::from_str(raw.as_str()) {
            Ok(value) => Decoded::Value(value),
            Err(e) => Decoded::Corrupt(e.to_string()),
        }
    }
}
