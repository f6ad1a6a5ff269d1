//! Evaluation result cache for ewb
//!
//! This crate provides the persistence layer for evaluation results:
//! - Deterministic cache keys derived from an [`EvaluationRequest`]
//! - A versioned artifact encoding with payload integrity checks
//! - Stores with atomic, write-once semantics ([`FsCacheStore`], [`MemoryCacheStore`])
//! - Per-key advisory locks ([`KeyLock`]) for cross-process coordination
//!
//! # Cache Key Computation
//!
//! Keys are the SHA-256 of the request's canonical JSON encoding:
//! - Event type, model identifier and variable name
//! - Every computation parameter, with object keys sorted at every depth
//!
//! Equal requests yield equal keys in every process, on every run.

#![expect(
    clippy::missing_errors_doc,
    reason = "Error variants are documented on the CacheStore trait"
)]

pub mod artifact;
mod error;
pub mod key;
pub mod lock;
pub mod memory;
pub mod store;

// Re-export error types at crate root
pub use error::{Error, Result};

// Re-export main types
pub use artifact::{ArtifactMeta, CachedArtifact, SCHEMA_VERSION};
pub use key::{CacheKey, EvaluationRequest, ParameterSet};
pub use lock::{DEFAULT_LOCK_TIMEOUT, KeyLock, KeyLockGuard, LockHolder, STALE_LOCK_THRESHOLD};
pub use memory::MemoryCacheStore;
pub use store::{CacheStore, FsCacheStore, key_to_path};
