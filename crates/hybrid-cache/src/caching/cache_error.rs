use std::sync::Arc;

use thiserror::Error;

/// An error returned by [`HybridCache`](super::HybridCache) operations.
///
/// Errors are cheap to clone: the one error produced by a failed fill is handed to every
/// caller that joined it.
#[derive(Debug, Clone, Error)]
pub enum HybridCacheError {
    /// The caller's cancellation token fired before a result was available.
    ///
    /// This only ever affects the cancelled caller, other callers waiting on the same fill
    /// still get its result.
    #[error("operation was cancelled")]
    Cancelled,

    /// The serialized payload exceeds the configured maximum.
    ///
    /// Nothing is written to the distributed cache in this case.
    #[error("payload of {size} bytes exceeds the maximum of {limit} bytes")]
    PayloadTooLarge { size: u64, limit: u64 },

    /// The underlying data factory failed.
    #[error("underlying data factory failed: {0}")]
    Factory(Arc<anyhow::Error>),

    /// No registered serializer factory can handle the value type.
    #[error("no serializer registered for `{0}`")]
    NoSerializer(&'static str),

    /// A value could not be serialized.
    #[error("failed to serialize value: {0}")]
    Serialization(String),

    /// The distributed cache reported an error.
    #[error("distributed cache failure: {0}")]
    Distributed(Arc<anyhow::Error>),

    /// Neither tier had the entry, and the underlying data factory was disabled via
    /// [`EntryFlags::DISABLE_UNDERLYING_DATA`](super::EntryFlags::DISABLE_UNDERLYING_DATA).
    #[error("entry not found")]
    NotFound,

    /// The cache was configured with invalid options.
    #[error("invalid options: {0}")]
    InvalidOptions(String),
}

impl HybridCacheError {
    pub(crate) fn factory(err: anyhow::Error) -> Self {
        Self::Factory(Arc::new(err))
    }

    pub(crate) fn distributed(err: anyhow::Error) -> Self {
        Self::Distributed(Arc::new(err))
    }

    /// A short, static name of the error kind, used for metrics tags.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::Factory(_) => "factory",
            Self::NoSerializer(_) => "no_serializer",
            Self::Serialization(_) => "serialization",
            Self::Distributed(_) => "distributed",
            Self::NotFound => "not_found",
            Self::InvalidOptions(_) => "invalid_options",
        }
    }
}

/// The result of a cache operation.
pub type CacheResult<T> = Result<T, HybridCacheError>;
