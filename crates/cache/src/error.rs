//! Error types for the cache crate

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Error type for cache operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// I/O error during cache operations
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(ewb::cache::io),
        help("Check file permissions and ensure the cache directory is writable")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed (e.g., "read", "write", "create")
        operation: String,
    },

    /// No artifact is stored under the key
    #[error("Cache miss: no artifact stored for key {key}")]
    #[diagnostic(
        code(ewb::cache::miss),
        help("The artifact was never computed or has been invalidated")
    )]
    Miss {
        /// The cache key that was not found
        key: String,
    },

    /// Stored data failed schema validation
    #[error("Corrupt artifact for key {key}: {reason}")]
    #[diagnostic(
        code(ewb::cache::corrupt),
        help("Invalidate the entry to force recomputation; repeated corruption points at a storage problem")
    )]
    Corrupt {
        /// The cache key whose artifact is corrupt
        key: String,
        /// What failed to validate
        reason: String,
    },

    /// A write targeted a key that already holds an artifact
    #[error("Cache conflict: an artifact already exists for key {key}")]
    #[diagnostic(
        code(ewb::cache::conflict),
        help("Invalidate the key before writing a fresh result")
    )]
    Conflict {
        /// The contended cache key
        key: String,
    },

    /// Advisory lock could not be acquired in time
    #[error("Timed out after {timeout_secs}s waiting for the lock on key {key}")]
    #[diagnostic(
        code(ewb::cache::lock_timeout),
        help("Another process is computing this key; retry once it finishes")
    )]
    LockTimeout {
        /// The locked cache key
        key: String,
        /// Configured timeout in seconds
        timeout_secs: u64,
    },

    /// Serialization error
    #[error("Serialization error: {message}")]
    #[diagnostic(code(ewb::cache::serialization))]
    Serialization {
        /// Error message describing the serialization issue
        message: String,
    },
}

impl Error {
    /// Create an I/O error with path context
    #[must_use]
    pub fn io(
        source: std::io::Error,
        path: impl AsRef<Path>,
        operation: impl Into<String>,
    ) -> Self {
        Self::Io {
            source,
            path: Some(path.as_ref().into()),
            operation: operation.into(),
        }
    }

    /// Create a cache miss error
    #[must_use]
    pub fn miss(key: impl Into<String>) -> Self {
        Self::Miss { key: key.into() }
    }

    /// Create a corrupt artifact error
    #[must_use]
    pub fn corrupt(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create a cache conflict error
    #[must_use]
    pub fn conflict(key: impl Into<String>) -> Self {
        Self::Conflict { key: key.into() }
    }

    /// Create a serialization error
    #[must_use]
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Whether this error means "nothing usable is stored" and recomputation recovers it.
    #[must_use]
    pub const fn is_recoverable_miss(&self) -> bool {
        matches!(self, Self::Miss { .. } | Self::Corrupt { .. })
    }
}

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, Error>;
