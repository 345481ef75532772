use thiserror::Error;

/// An error that happens while persisting, loading or decoding a cached object.
///
/// The error is cheap to clone, as a single failed load is handed out to every caller that was
/// waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// There is no persisted file for the requested key.
    #[error("not found")]
    NotFound,
    /// Reading, writing or renaming the persisted file failed.
    ///
    /// The attached string contains the underlying I/O error.
    #[error("persistence error: {0}")]
    Persistence(String),
    /// The persisted mapping does not carry the reserved `canonicalName` type identity entry.
    #[error("missing type identity")]
    MissingTypeIdentity,
    /// The persisted mapping was written for a different type.
    #[error("type mismatch: expected `{expected}`, found `{found}`")]
    TypeMismatch { expected: String, found: String },
    /// A field value could not be converted with the supported field codecs.
    #[error("unsupported value for field `{field}`: {details}")]
    UnsupportedFieldType { field: String, details: String },
    /// The persisted file is not valid properties text.
    #[error("malformed: {0}")]
    Malformed(String),
    /// The key cannot be mapped to a file name.
    #[error("invalid key: {0:?}")]
    InvalidKey(String),
    /// The worker pool has been shut down and does not accept tasks anymore.
    #[error("worker pool is shut down")]
    Shutdown,
    /// An unexpected error in the cache itself, like a task that vanished without a result.
    #[error("internal error")]
    InternalError,
}

impl From<std::io::Error> for CacheError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl CacheError {
    /// Converts any error into a [`Persistence`](Self::Persistence) error, logging it.
    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::Persistence(e.to_string())
    }

    /// A short tag naming the error kind, used in metrics.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            CacheError::NotFound => "not_found",
            CacheError::Persistence(_) => "persistence",
            CacheError::MissingTypeIdentity => "missing_type_identity",
            CacheError::TypeMismatch { .. } => "type_mismatch",
            CacheError::UnsupportedFieldType { .. } => "unsupported_field_type",
            CacheError::Malformed(_) => "malformed",
            CacheError::InvalidKey(_) => "invalid_key",
            CacheError::Shutdown => "shutdown",
            CacheError::InternalError => "internal",
        }
    }
}

/// An entry in the cache, containing either `Ok(T)` or an error denoting the reason why an
/// object could not be persisted or loaded.
pub type CacheEntry<T = ()> = Result<T, CacheError>;
