//! Parallel evaluation of a task graph with write-back to the cache
//!
//! A run partitions the graph into tasks whose artifacts already exist and
//! tasks that must be computed. Pending tasks are dispatched in priority order
//! to the configured backend, bounded by a semaphore, and each success is
//! written through the [`CacheStore`]. Every task in the graph yields exactly
//! one [`TaskResult`]; one task's failure never affects its siblings.

mod backend;

use crate::config::{Configuration, ParallelBackend};
use crate::evaluator::Evaluator;
use crate::reporter::{NoOpReporter, RunReporter};
use crate::worker::WorkerCommand;
use crate::{Error, Result};
use backend::Dispatcher;
use ewb_cache::{ArtifactMeta, CacheKey, CacheStore, CachedArtifact, KeyLock};
use ewb_task_graph::{Task, TaskGraph};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Category of a task failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// The evaluator reported an error of the given kind
    Evaluation(String),
    /// Another writer stored the key first
    CacheConflict,
    /// The cache store failed
    Storage,
    /// A worker process exited abnormally or replied with garbage
    WorkerCrashed,
    /// The evaluator panicked
    Panicked,
    /// The run was cancelled before the task was dispatched
    Cancelled,
    /// Another process held the key's lock for too long
    LockTimeout,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Evaluation(kind) => write!(f, "evaluation:{kind}"),
            Self::CacheConflict => f.write_str("cache_conflict"),
            Self::Storage => f.write_str("storage"),
            Self::WorkerCrashed => f.write_str("worker_crashed"),
            Self::Panicked => f.write_str("panicked"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::LockTimeout => f.write_str("lock_timeout"),
        }
    }
}

/// A task that produced no artifact
#[derive(Debug, Clone, PartialEq)]
pub struct TaskFailure {
    /// Key of the failed task
    pub key: CacheKey,
    /// Failure category
    pub kind: FailureKind,
    /// Failure details
    pub message: String,
}

impl TaskFailure {
    fn new(key: &CacheKey, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            key: key.clone(),
            kind,
            message: message.into(),
        }
    }
}

impl From<TaskFailure> for Error {
    fn from(failure: TaskFailure) -> Self {
        Self::evaluation(
            failure.key.as_hex(),
            failure.kind.to_string(),
            failure.message,
        )
    }
}

/// A task whose artifact is available
#[derive(Debug, Clone, PartialEq)]
pub enum TaskSuccess {
    /// Evaluated and stored during this run
    Computed(CachedArtifact),
    /// Already stored before the task was dispatched
    Cached(ArtifactMeta),
}

/// Outcome of one task
#[derive(Debug, Clone, PartialEq)]
pub enum TaskResult {
    /// An artifact is stored for the key
    Success(TaskSuccess),
    /// No artifact was produced
    Failure(TaskFailure),
}

impl TaskResult {
    /// Whether the task succeeded
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Whether the artifact came from the cache
    #[must_use]
    pub const fn is_cached(&self) -> bool {
        matches!(self, Self::Success(TaskSuccess::Cached(_)))
    }

    /// The failure, if any
    #[must_use]
    pub const fn failure(&self) -> Option<&TaskFailure> {
        match self {
            Self::Failure(f) => Some(f),
            Self::Success(_) => None,
        }
    }

    fn failed(key: &CacheKey, kind: FailureKind, message: impl Into<String>) -> Self {
        Self::Failure(TaskFailure::new(key, kind, message))
    }
}

/// Dispatches task graphs and writes results back to the cache
pub struct Orchestrator {
    config: Configuration,
    store: Arc<dyn CacheStore>,
    evaluator: Arc<dyn Evaluator>,
    worker: Option<WorkerCommand>,
    locks: Option<KeyLock>,
    reporter: Arc<dyn RunReporter>,
    cancel: CancellationToken,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("store", &self.store)
            .field("worker", &self.worker)
            .field("locks", &self.locks)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Create an orchestrator
    ///
    /// Per-key locks live under the configuration's `saved_data_path`.
    #[must_use]
    pub fn new(
        config: Configuration,
        store: Arc<dyn CacheStore>,
        evaluator: Arc<dyn Evaluator>,
    ) -> Self {
        let locks = Some(config.key_lock());
        Self {
            config,
            store,
            evaluator,
            worker: None,
            locks,
            reporter: Arc::new(NoOpReporter),
            cancel: CancellationToken::new(),
        }
    }

    /// Worker launched per task by the process-pool backend
    #[must_use]
    pub fn with_worker(mut self, worker: WorkerCommand) -> Self {
        self.worker = Some(worker);
        self
    }

    /// Report progress to `reporter`
    #[must_use]
    pub fn with_reporter(mut self, reporter: Arc<dyn RunReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Stop dispatching new tasks once `token` is cancelled
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Skip cross-process key locking
    #[must_use]
    pub fn without_key_locks(mut self) -> Self {
        self.locks = None;
        self
    }

    /// The configuration in use
    #[must_use]
    pub const fn config(&self) -> &Configuration {
        &self.config
    }

    /// The cache store in use
    #[must_use]
    pub const fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    fn dispatcher(&self) -> Result<Dispatcher> {
        match self.config.parallel_backend {
            ParallelBackend::Sequential | ParallelBackend::ThreadPool => {
                Ok(Dispatcher::InProcess(Arc::clone(&self.evaluator)))
            }
            ParallelBackend::ProcessPool => self
                .worker
                .clone()
                .map(Dispatcher::Worker)
                .ok_or_else(|| {
                    Error::configuration("The process-pool backend needs a worker command")
                }),
        }
    }

    /// Run every task of the graph, returning one result per key
    ///
    /// # Errors
    ///
    /// Returns an error only if the backend cannot be set up; task failures
    /// are reported in the map.
    pub async fn run(&self, graph: &TaskGraph) -> Result<BTreeMap<CacheKey, TaskResult>> {
        let dispatcher = self.dispatcher()?;
        let mut results = BTreeMap::new();

        let pending = self.partition(graph, &mut results);
        tracing::info!(
            total = graph.len(),
            cached = results.len(),
            pending = pending.len(),
            backend = %self.config.parallel_backend,
            "Starting evaluation run"
        );
        self.reporter.run_started(graph.len(), pending.len()).await;
        for (key, result) in &results {
            self.reporter
                .task_finished(key, result, Duration::ZERO)
                .await;
        }

        let pending_keys: Vec<CacheKey> = pending.iter().map(|t| t.key().clone()).collect();
        let semaphore = Arc::new(Semaphore::new(self.config.effective_parallelism()));
        let mut join_set = JoinSet::new();

        for task in pending {
            let permit = tokio::select! {
                biased;
                () = self.cancel.cancelled() => None,
                permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                let result = TaskResult::failed(
                    task.key(),
                    FailureKind::Cancelled,
                    "Run cancelled before the task was dispatched",
                );
                self.reporter
                    .task_finished(task.key(), &result, Duration::ZERO)
                    .await;
                results.insert(task.key().clone(), result);
                continue;
            };

            let worker = TaskWorker {
                store: Arc::clone(&self.store),
                locks: self.locks.clone(),
                dispatcher: dispatcher.clone(),
                reporter: Arc::clone(&self.reporter),
            };
            join_set.spawn(async move {
                let _permit = permit;
                let result = worker.execute(&task).await;
                (task.key().clone(), result)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((key, result)) => {
                    results.insert(key, result);
                }
                Err(e) => tracing::error!(error = %e, "Task join failed"),
            }
        }

        // A task that died before reporting still owes a result
        for key in pending_keys {
            results.entry(key).or_insert_with_key(|key| {
                TaskResult::failed(key, FailureKind::Panicked, "Task ended without a result")
            });
        }

        Ok(results)
    }

    /// Record results for stored tasks and return the rest in dispatch order
    fn partition(
        &self,
        graph: &TaskGraph,
        results: &mut BTreeMap<CacheKey, TaskResult>,
    ) -> Vec<Task> {
        let mut pending = Vec::new();
        for task in graph.dispatch_order() {
            let key = task.key();
            if !self.store.exists(key) {
                pending.push(task.clone());
                continue;
            }
            match self.store.read_meta(key) {
                Ok(meta) => {
                    tracing::debug!(key = %key.short(), "Cache hit");
                    results.insert(key.clone(), TaskResult::Success(TaskSuccess::Cached(meta)));
                }
                Err(ewb_cache::Error::Miss { .. }) => pending.push(task.clone()),
                Err(e @ ewb_cache::Error::Corrupt { .. }) => {
                    tracing::warn!(
                        key = %key.short(),
                        request = %task.request().label(),
                        error = %e,
                        "Discarding corrupt artifact"
                    );
                    discard(self.store.as_ref(), key);
                    pending.push(task.clone());
                }
                Err(e) => {
                    results.insert(
                        key.clone(),
                        TaskResult::failed(key, FailureKind::Storage, e.to_string()),
                    );
                }
            }
        }
        pending
    }
}

fn discard(store: &dyn CacheStore, key: &CacheKey) {
    if let Err(e) = store.invalidate(key) {
        tracing::warn!(key = %key.short(), error = %e, "Failed to invalidate artifact");
    }
}

/// Everything a spawned task needs
struct TaskWorker {
    store: Arc<dyn CacheStore>,
    locks: Option<KeyLock>,
    dispatcher: Dispatcher,
    reporter: Arc<dyn RunReporter>,
}

impl TaskWorker {
    async fn execute(&self, task: &Task) -> TaskResult {
        self.reporter.task_started(task).await;
        let start = Instant::now();
        let result = self.compute(task).await;
        let elapsed = start.elapsed();

        match &result {
            TaskResult::Success(_) => tracing::info!(
                key = %task.key().short(),
                request = %task.request().label(),
                elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                "Task completed"
            ),
            TaskResult::Failure(f) => tracing::warn!(
                key = %task.key().short(),
                request = %task.request().label(),
                kind = %f.kind,
                message = %f.message,
                "Task failed"
            ),
        }

        self.reporter
            .task_finished(task.key(), &result, elapsed)
            .await;
        result
    }

    async fn compute(&self, task: &Task) -> TaskResult {
        let key = task.key();

        let _guard = match &self.locks {
            Some(locks) => match locks.acquire(key).await {
                Ok(guard) => Some(guard),
                Err(e @ ewb_cache::Error::LockTimeout { .. }) => {
                    return TaskResult::failed(key, FailureKind::LockTimeout, e.to_string());
                }
                Err(e) => return TaskResult::failed(key, FailureKind::Storage, e.to_string()),
            },
            None => None,
        };

        // Another process may have stored the key while we waited for the lock
        if self.store.exists(key) {
            match self.store.read_meta(key) {
                Ok(meta) => return TaskResult::Success(TaskSuccess::Cached(meta)),
                Err(e) => {
                    tracing::warn!(key = %key.short(), error = %e, "Discarding unreadable artifact");
                    discard(self.store.as_ref(), key);
                }
            }
        }

        let payload = match self.dispatcher.evaluate(task.request()).await {
            Ok(payload) => payload,
            Err(failure) => return TaskResult::failed(key, failure.kind, failure.message),
        };

        match self.store.write(key, task.request(), &payload) {
            Ok(artifact) => TaskResult::Success(TaskSuccess::Computed(artifact)),
            Err(e @ ewb_cache::Error::Conflict { .. }) => {
                TaskResult::failed(key, FailureKind::CacheConflict, e.to_string())
            }
            Err(e) => TaskResult::failed(key, FailureKind::Storage, e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kind_display() {
        assert_eq!(
            FailureKind::Evaluation("missing_data".into()).to_string(),
            "evaluation:missing_data"
        );
        assert_eq!(FailureKind::CacheConflict.to_string(), "cache_conflict");
        assert_eq!(FailureKind::LockTimeout.to_string(), "lock_timeout");
    }

    #[test]
    fn test_failure_converts_to_error() {
        let key = CacheKey::from_canonical("k");
        let err: Error = TaskFailure::new(&key, FailureKind::WorkerCrashed, "oom").into();
        assert_eq!(err.evaluation_kind(), Some("worker_crashed"));
    }
}
