/// Errors raised by a persistence backend.
///
/// "Key not present" is never an error: reads signal it with `Ok(None)`.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The medium cannot be reached (offline, disabled, locked).
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The medium rejected a write because it would exceed its quota.
    #[error("quota exceeded writing {key}: {size} bytes would exceed limit of {limit}")]
    QuotaExceeded {
        key: String,
        size: usize,
        limit: usize,
    },

    /// The medium refused access.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The key cannot be represented by this backend.
    #[error("invalid key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },

    /// The namespace name is malformed.
    #[error("invalid namespace {name:?}: {reason}")]
    InvalidNamespace { name: String, reason: String },

    /// I/O error from a file-based medium.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    /// Returns `true` for failures caused by the medium being unreachable,
    /// as opposed to a rejected request.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Io(_))
    }
}

/// Result alias for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;
