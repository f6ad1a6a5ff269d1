//! Error types for task graph operations.

use std::fmt;

/// Result type for task graph operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building a task graph.
#[derive(Debug)]
pub enum Error {
    /// Two distinct requests produced the same cache key.
    AmbiguousKey {
        /// The colliding key.
        key: String,
        /// Canonical form of the request already in the graph.
        existing: String,
        /// Canonical form of the request being added.
        incoming: String,
    },

    /// A request could not be keyed.
    Key(ewb_cache::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AmbiguousKey {
                key,
                existing,
                incoming,
            } => {
                write!(
                    f,
                    "Cache key {key} is shared by different requests: {existing} and {incoming}"
                )
            }
            Self::Key(e) => write!(f, "Failed to derive cache key: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Key(e) => Some(e),
            Self::AmbiguousKey { .. } => None,
        }
    }
}

impl From<ewb_cache::Error> for Error {
    fn from(e: ewb_cache::Error) -> Self {
        Self::Key(e)
    }
}
