//! Task graph construction.
//!
//! Requests are keyed on insertion and deduplicated by key. The first
//! occurrence of a key fixes its position; later duplicates are dropped.

use crate::{Error, Result};
use ewb_cache::{CacheKey, EvaluationRequest};
use indexmap::IndexMap;
use std::collections::HashMap;
use tracing::debug;

/// One unit of work: an evaluation request tagged with its cache key.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    key: CacheKey,
    request: EvaluationRequest,
    priority: Option<i32>,
}

impl Task {
    /// Create a task, deriving its key from the request.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be encoded.
    pub fn new(request: EvaluationRequest) -> Result<Self> {
        let key = CacheKey::derive(&request)?;
        Ok(Self {
            key,
            request,
            priority: None,
        })
    }

    /// Set the dispatch priority (higher runs first).
    #[must_use]
    pub const fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Cache key of the task.
    #[must_use]
    pub const fn key(&self) -> &CacheKey {
        &self.key
    }

    /// The evaluation request.
    #[must_use]
    pub const fn request(&self) -> &EvaluationRequest {
        &self.request
    }

    /// Dispatch priority, if set.
    #[must_use]
    pub const fn priority(&self) -> Option<i32> {
        self.priority
    }
}

/// Ordered, deduplicated set of tasks.
#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    tasks: IndexMap<CacheKey, Task>,
    /// Canonical encoding of each stored request, for collision checks.
    canonical: HashMap<CacheKey, String>,
}

impl TaskGraph {
    /// Create an empty task graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from requests, keyed with [`CacheKey::derive`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::AmbiguousKey`] if two different requests share a key.
    pub fn build(requests: impl IntoIterator<Item = EvaluationRequest>) -> Result<Self> {
        Self::build_with(requests, CacheKey::derive)
    }

    /// Build a graph from requests with a caller-supplied key derivation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AmbiguousKey`] if two different requests share a key,
    /// or [`Error::Key`] if `key_fn` fails.
    pub fn build_with<I, F>(requests: I, key_fn: F) -> Result<Self>
    where
        I: IntoIterator<Item = EvaluationRequest>,
        F: Fn(&EvaluationRequest) -> ewb_cache::Result<CacheKey>,
    {
        let mut graph = Self::new();
        for request in requests {
            let key = key_fn(&request)?;
            graph.insert(Task {
                key,
                request,
                priority: None,
            })?;
        }
        debug!(tasks = graph.len(), "Built task graph");
        Ok(graph)
    }

    /// Graph containing exactly one request.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be keyed.
    pub fn singleton(request: EvaluationRequest) -> Result<Self> {
        let mut graph = Self::new();
        graph.insert(Task::new(request)?)?;
        Ok(graph)
    }

    /// Add a task, returning `false` if its key was already present.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AmbiguousKey`] if the key is taken by a different request.
    pub fn insert(&mut self, task: Task) -> Result<bool> {
        let canonical = task.request.canonical_json()?;
        if let Some(existing) = self.canonical.get(&task.key) {
            if *existing != canonical {
                return Err(Error::AmbiguousKey {
                    key: task.key.as_hex().to_string(),
                    existing: existing.clone(),
                    incoming: canonical,
                });
            }
            debug!(key = %task.key.short(), "Dropping duplicate request");
            return Ok(false);
        }

        self.canonical.insert(task.key.clone(), canonical);
        self.tasks.insert(task.key.clone(), task);
        Ok(true)
    }

    /// Look up a task by key.
    #[must_use]
    pub fn get(&self, key: &CacheKey) -> Option<&Task> {
        self.tasks.get(key)
    }

    /// Whether a key is present.
    #[must_use]
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.tasks.contains_key(key)
    }

    /// Number of tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the graph has no tasks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Tasks in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &CacheKey> {
        self.tasks.keys()
    }

    /// Tasks in dispatch order: descending priority, ties in insertion order.
    ///
    /// Tasks without a priority rank as priority 0.
    #[must_use]
    pub fn dispatch_order(&self) -> Vec<&Task> {
        let mut ordered: Vec<&Task> = self.tasks.values().collect();
        // sort_by_key is stable
        ordered.sort_by_key(|t| std::cmp::Reverse(t.priority.unwrap_or(0)));
        ordered
    }
}

impl<'a> IntoIterator for &'a TaskGraph {
    type Item = &'a Task;
    type IntoIter = indexmap::map::Values<'a, CacheKey, Task>;

    fn into_iter(self) -> Self::IntoIter {
        self.tasks.values()
    }
}
