//! In-memory artifact store
//!
//! Holds the encoded artifact bytes, so reads go through the same validation
//! as the filesystem store. Used by tests and by callers that want a cache
//! scoped to one process.

use crate::artifact::{self, ArtifactMeta, CachedArtifact};
use crate::store::CacheStore;
use crate::{CacheKey, Error, EvaluationRequest, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

/// Process-local [`CacheStore`]
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: Mutex<BTreeMap<CacheKey, Vec<u8>>>,
}

impl MemoryCacheStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store raw bytes under a key, bypassing encoding
    pub fn put_raw(&self, key: CacheKey, bytes: impl Into<Vec<u8>>) {
        self.lock().insert(key, bytes.into());
    }

    /// Number of stored entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<CacheKey, Vec<u8>>> {
        // A panicked writer cannot leave a half-inserted entry behind
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl CacheStore for MemoryCacheStore {
    fn exists(&self, key: &CacheKey) -> bool {
        self.lock().contains_key(key)
    }

    fn read(&self, key: &CacheKey) -> Result<CachedArtifact> {
        let entries = self.lock();
        let bytes = entries
            .get(key)
            .ok_or_else(|| Error::miss(key.as_hex()))?;
        artifact::decode(key, bytes)
    }

    fn read_meta(&self, key: &CacheKey) -> Result<ArtifactMeta> {
        let entries = self.lock();
        let bytes = entries
            .get(key)
            .ok_or_else(|| Error::miss(key.as_hex()))?;
        let header = bytes.split(|b| *b == b'\n').next().unwrap_or_default();
        artifact::decode_header(key, header)
    }

    fn write(
        &self,
        key: &CacheKey,
        request: &EvaluationRequest,
        payload: &Value,
    ) -> Result<CachedArtifact> {
        let (artifact, bytes) = artifact::encode(key, request, payload)?;
        let mut entries = self.lock();
        if entries.contains_key(key) {
            return Err(Error::conflict(key.as_hex()));
        }
        entries.insert(key.clone(), bytes);
        Ok(artifact)
    }

    fn invalidate(&self, key: &CacheKey) -> Result<bool> {
        Ok(self.lock().remove(key).is_some())
    }

    fn list_keys(&self) -> Result<Vec<CacheKey>> {
        Ok(self.lock().keys().cloned().collect())
    }
}
