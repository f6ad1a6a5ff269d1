//! Artifact storage backends
//!
//! [`CacheStore`] is the contract the orchestrator relies on. [`FsCacheStore`]
//! keeps one file per key under a two-level fan-out directory:
//!
//! ```text
//! {root}/
//!   ab/
//!     abcdef123456....json
//! ```
//!
//! Writes go to a temporary file in the destination directory, are fsynced,
//! and are promoted with a no-clobber rename. A reader therefore sees either
//! the complete artifact or nothing, and two writers racing on one key cannot
//! both succeed.

use crate::artifact::{self, ArtifactMeta, CachedArtifact};
use crate::{CacheKey, Error, EvaluationRequest, Result};
use serde_json::Value;
use std::fs;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// File extension of promoted artifacts
const ARTIFACT_EXTENSION: &str = "json";

/// Prefix of in-flight temporary files
const PARTIAL_PREFIX: &str = ".partial-";

/// Storage contract for evaluation artifacts
pub trait CacheStore: Send + Sync + std::fmt::Debug {
    /// Whether a durable artifact exists for the key
    fn exists(&self, key: &CacheKey) -> bool;

    /// Load and validate the full artifact
    ///
    /// # Errors
    ///
    /// [`Error::Miss`] if absent, [`Error::Corrupt`] if validation fails
    fn read(&self, key: &CacheKey) -> Result<CachedArtifact>;

    /// Load and validate only the artifact header
    ///
    /// # Errors
    ///
    /// [`Error::Miss`] if absent, [`Error::Corrupt`] if validation fails
    fn read_meta(&self, key: &CacheKey) -> Result<ArtifactMeta>;

    /// Persist a new artifact
    ///
    /// # Errors
    ///
    /// [`Error::Conflict`] if the key is already occupied
    fn write(
        &self,
        key: &CacheKey,
        request: &EvaluationRequest,
        payload: &Value,
    ) -> Result<CachedArtifact>;

    /// Remove the artifact, reporting whether anything was removed
    fn invalidate(&self, key: &CacheKey) -> Result<bool>;

    /// Keys of every stored artifact
    fn list_keys(&self) -> Result<Vec<CacheKey>>;
}

/// Convert a cache key to its storage path
#[must_use]
pub fn key_to_path(root: &Path, key: &CacheKey) -> PathBuf {
    let hex = key.as_hex();
    root.join(&hex[0..2])
        .join(format!("{hex}.{ARTIFACT_EXTENSION}"))
}

/// Filesystem-backed artifact store
#[derive(Debug, Clone)]
pub struct FsCacheStore {
    root: PathBuf,
}

impl FsCacheStore {
    /// Create a store rooted at the given directory
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory of the store
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path an artifact for `key` lives at
    #[must_use]
    pub fn artifact_path(&self, key: &CacheKey) -> PathBuf {
        key_to_path(&self.root, key)
    }

    /// Remove temporary files left behind by interrupted writes
    ///
    /// Only files older than `min_age` are touched so writes still in flight in
    /// other processes are left alone.
    pub fn sweep_partials(&self, min_age: Duration) -> Result<usize> {
        let mut removed = 0usize;
        for shard in self.shards()? {
            for entry in fs::read_dir(&shard).map_err(|e| Error::io(e, &shard, "read_dir"))? {
                let entry = entry.map_err(|e| Error::io(e, &shard, "read_dir_entry"))?;
                let name = entry.file_name();
                if !name.to_string_lossy().starts_with(PARTIAL_PREFIX) {
                    continue;
                }
                let age = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|t| SystemTime::now().duration_since(t).ok())
                    .unwrap_or_default();
                if age < min_age {
                    continue;
                }
                let path = entry.path();
                match fs::remove_file(&path) {
                    Ok(()) => {
                        tracing::debug!(path = %path.display(), "Removed partial artifact");
                        removed += 1;
                    }
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(Error::io(e, &path, "remove_file")),
                }
            }
        }
        Ok(removed)
    }

    fn shards(&self) -> Result<Vec<PathBuf>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut shards = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(|e| Error::io(e, &self.root, "read_dir"))? {
            let entry = entry.map_err(|e| Error::io(e, &self.root, "read_dir_entry"))?;
            let path = entry.path();
            if path.is_dir() {
                shards.push(path);
            }
        }
        shards.sort();
        Ok(shards)
    }
}

impl CacheStore for FsCacheStore {
    fn exists(&self, key: &CacheKey) -> bool {
        self.artifact_path(key).is_file()
    }

    fn read(&self, key: &CacheKey) -> Result<CachedArtifact> {
        let path = self.artifact_path(key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(Error::miss(key.as_hex())),
            Err(e) => return Err(Error::io(e, &path, "read")),
        };
        artifact::decode(key, &bytes)
    }

    fn read_meta(&self, key: &CacheKey) -> Result<ArtifactMeta> {
        let path = self.artifact_path(key);
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(Error::miss(key.as_hex())),
            Err(e) => return Err(Error::io(e, &path, "open")),
        };
        let mut line = Vec::new();
        BufReader::new(file)
            .read_until(b'\n', &mut line)
            .map_err(|e| Error::io(e, &path, "read"))?;
        artifact::decode_header(key, &line)
    }

    fn write(
        &self,
        key: &CacheKey,
        request: &EvaluationRequest,
        payload: &Value,
    ) -> Result<CachedArtifact> {
        let path = self.artifact_path(key);
        if path.exists() {
            return Err(Error::conflict(key.as_hex()));
        }
        let (artifact, bytes) = artifact::encode(key, request, payload)?;

        let dir = path
            .parent()
            .ok_or_else(|| Error::serialization(format!("{} has no parent", path.display())))?;
        fs::create_dir_all(dir).map_err(|e| Error::io(e, dir, "create_dir_all"))?;

        let mut tmp = tempfile::Builder::new()
            .prefix(PARTIAL_PREFIX)
            .tempfile_in(dir)
            .map_err(|e| Error::io(e, dir, "create_temp"))?;
        tmp.write_all(&bytes)
            .map_err(|e| Error::io(e, tmp.path(), "write"))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| Error::io(e, tmp.path(), "sync"))?;

        // The losing writer's temporary file is removed when the error drops it
        match tmp.persist_noclobber(&path) {
            Ok(_) => {}
            Err(e) if e.error.kind() == ErrorKind::AlreadyExists => {
                return Err(Error::conflict(key.as_hex()));
            }
            Err(e) => return Err(Error::io(e.error, &path, "persist")),
        }

        tracing::debug!(key = %key.short(), path = %path.display(), "Stored artifact");
        Ok(artifact)
    }

    fn invalidate(&self, key: &CacheKey) -> Result<bool> {
        let path = self.artifact_path(key);
        match fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!(key = %key.short(), "Invalidated artifact");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::io(e, &path, "remove_file")),
        }
    }

    fn list_keys(&self) -> Result<Vec<CacheKey>> {
        let mut keys = Vec::new();
        for shard in self.shards()? {
            for entry in fs::read_dir(&shard).map_err(|e| Error::io(e, &shard, "read_dir"))? {
                let entry = entry.map_err(|e| Error::io(e, &shard, "read_dir_entry"))?;
                let path = entry.path();
                if path.extension().is_none_or(|ext| ext != ARTIFACT_EXTENSION) {
                    continue;
                }
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str())
                    && let Ok(key) = CacheKey::from_hex(stem)
                {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}
