//! Error types for configuration, orchestration and result access

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Main error type for ewb-core
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// Configuration could not be resolved
    #[error("Configuration error: {message}")]
    #[diagnostic(
        code(ewb::config),
        help("Check the configuration file and the EWB_PAPER_BASEPATH variable")
    )]
    Configuration {
        /// What is wrong
        message: String,
        /// Configuration file involved, if any
        path: Option<Box<Path>>,
    },

    /// Cache layer failure
    #[error(transparent)]
    #[diagnostic(transparent)]
    Cache(#[from] ewb_cache::Error),

    /// Task graph could not be built
    #[error(transparent)]
    #[diagnostic(
        code(ewb::graph),
        help("Distinct requests must never share a cache key; report this with both requests")
    )]
    Graph(#[from] ewb_task_graph::Error),

    /// A single evaluation failed
    #[error("Evaluation of {key} failed ({kind}): {message}")]
    #[diagnostic(code(ewb::evaluation))]
    Evaluation {
        /// Cache key of the failed task
        key: String,
        /// Failure kind, e.g. `evaluation:missing_data` or `worker_crashed`
        kind: String,
        /// Failure details
        message: String,
    },

    /// I/O error outside the cache store
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(code(ewb::io))]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed
        operation: String,
    },
}

impl Error {
    /// Create a configuration error
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
            path: None,
        }
    }

    /// Create a configuration error tied to a file
    #[must_use]
    pub fn configuration_at(path: impl AsRef<Path>, msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
            path: Some(path.as_ref().into()),
        }
    }

    /// Create an evaluation error
    #[must_use]
    pub fn evaluation(
        key: impl Into<String>,
        kind: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Evaluation {
            key: key.into(),
            kind: kind.into(),
            message: message.into(),
        }
    }

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

    /// Failure kind for evaluation errors
    #[must_use]
    pub fn evaluation_kind(&self) -> Option<&str> {
        match self {
            Self::Evaluation { kind, .. } => Some(kind),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Self::Io {
            source,
            path: None,
            operation: "io".to_string(),
        }
    }
}

/// Result type for ewb-core
pub type Result<T> = std::result::Result<T, Error>;
