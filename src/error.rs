//! Crate-wide error type.
//!
//! Every failure is synchronous and leaves the caller's data untouched: an
//! operation either returns a complete new `(schema, source)` pair or one of
//! these errors.

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A path or node does not have the kind an operation needs.
    #[error("shape error: {0}")]
    Shape(String),

    /// An operation needing at least one match found none (or an empty result).
    #[error("cardinality error: {0}")]
    Cardinality(String),

    /// Nullable combinations, non-contiguous buffers, unknown encodings.
    #[error("not supported: {0}")]
    Unsupported(String),

    #[error("numeric precondition violated: {0}")]
    NumericPrecondition(String),

    /// Bad schema JSON, unresolved labels, foreign binary files.
    #[error("malformed input: {0}")]
    Malformed(String),

    /// Rejected by an eager property setter.
    #[error("invalid property: {0}")]
    InvalidProperty(String),

    #[error("buffer {name:?} not found (namespace {namespace:?})")]
    MissingBuffer { name: String, namespace: String },

    #[error("index {index} out of bounds for length {len}")]
    OutOfBounds { index: usize, len: usize },

    #[error("{0} can only be applied at the root of a dataset")]
    NotRoot(&'static str),

    #[error("pending result did not resolve before the deadline")]
    Timeout,

    /// Raised by (or on behalf of) a user callback.
    #[error("callback failed: {0}")]
    Callback(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn shape(msg: impl Into<String>) -> Self {
        Error::Shape(msg.into())
    }
    pub(crate) fn unsupported(msg: impl Into<String>) -> Self {
        Error::Unsupported(msg.into())
    }
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Error::Malformed(msg.into())
    }
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidProperty(msg.into())
    }
}
