//! Cache error types.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Errors surfaced by [`CacheManager::get_or_fetch`](crate::CacheManager::get_or_fetch).
///
/// Storage and deserialization failures never appear here: the cache is
/// advisory, so those degrade to a miss instead.
#[derive(Error, Debug)]
pub enum CacheError {
    /// The fetch function failed and there was no cached value to serve.
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),

    /// A value shared by a concurrent fetch could not be decoded into the
    /// caller's type.
    #[error("shared value could not be decoded: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Error returned by a caller-supplied fetch function.
///
/// Cheap to clone, so one failure can be handed to every caller waiting on
/// the same in-flight fetch.
#[derive(Clone)]
pub struct FetchError(Arc<anyhow::Error>);

impl FetchError {
    /// Wrap any error.
    pub fn new<E>(error: E) -> Self
    where
        E: Into<anyhow::Error>,
    {
        Self(Arc::new(error.into()))
    }

    /// Create an error from a message.
    pub fn msg<M>(message: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Self(Arc::new(anyhow::Error::msg(message)))
    }

    /// Access the underlying error.
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.0)
    }
}

impl fmt::Debug for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl std::error::Error for FetchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

impl From<anyhow::Error> for FetchError {
    fn from(error: anyhow::Error) -> Self {
        Self(Arc::new(error))
    }
}
