//! Tests for the orchestrator

use async_trait::async_trait;
use ewb_cache::{
    CacheKey, CacheStore, EvaluationRequest, FsCacheStore, MemoryCacheStore, ParameterSet,
};
use ewb_core::{
    Configuration, Error, EvaluationError, Evaluator, FailureKind, Jobs, Orchestrator,
    ParallelBackend, RunReporter, RunSummary, TaskResult, TaskSuccess, WorkerCommand,
};
use ewb_task_graph::{Task, TaskGraph};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Fixtures
// =============================================================================

fn config(tmp: &TempDir, backend: ParallelBackend, jobs: i64) -> Configuration {
    Configuration::with_basepath(tmp.path())
        .with_backend(backend)
        .with_jobs(Jobs::from_count(jobs).unwrap())
        .with_lock_timeout_secs(5)
}

fn request(model: &str) -> EvaluationRequest {
    EvaluationRequest::new(
        "heat_wave",
        model,
        "surface_air_temperature",
        ParameterSet::new().with("target", "era5"),
    )
}

fn graph(models: &[&str]) -> TaskGraph {
    TaskGraph::build(models.iter().map(|m| request(m))).unwrap()
}

/// Evaluator that records calls and fails or panics for chosen models
#[derive(Default)]
struct ScriptedEvaluator {
    calls: AtomicUsize,
    order: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    delay: Option<Duration>,
}

impl ScriptedEvaluator {
    fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Evaluator for ScriptedEvaluator {
    fn evaluate(&self, request: &EvaluationRequest) -> Result<Value, EvaluationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.order.lock().unwrap().push(request.model_id.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match request.model_id.as_str() {
            "broken" => Err(EvaluationError::new("missing_data", "no forecast files for case")),
            "panics" => panic!("evaluator blew up"),
            model => Ok(json!({"model": model, "rmse": model.len()})),
        }
    }
}

fn payloads(
    store: &dyn CacheStore,
    results: &BTreeMap<CacheKey, TaskResult>,
) -> BTreeMap<CacheKey, Value> {
    results
        .keys()
        .filter_map(|k| store.read(k).ok().map(|a| (k.clone(), a.payload)))
        .collect()
}

// =============================================================================
// Isolation and completeness
// =============================================================================

#[tokio::test]
async fn test_one_failure_does_not_affect_siblings() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(MemoryCacheStore::new());
    let evaluator = Arc::new(ScriptedEvaluator::default());
    let orchestrator = Orchestrator::new(
        config(&tmp, ParallelBackend::ThreadPool, 4),
        store.clone(),
        evaluator.clone(),
    );

    let graph = graph(&["aifs", "hres", "broken", "pangu", "gc"]);
    let results = orchestrator.run(&graph).await.unwrap();

    assert_eq!(results.len(), 5);
    let summary = RunSummary::from_results(&results);
    assert_eq!(summary.computed, 4);
    assert_eq!(summary.failed(), 1);

    let failure = &summary.failures[0];
    assert_eq!(failure.key, CacheKey::derive(&request("broken")).unwrap());
    assert_eq!(failure.kind, FailureKind::Evaluation("missing_data".into()));
    assert_eq!(failure.kind.to_string(), "evaluation:missing_data");

    // Failures are not cached
    assert_eq!(store.len(), 4);
    assert!(!store.exists(&failure.key));
}

#[tokio::test]
async fn test_panicking_evaluator_is_isolated() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(MemoryCacheStore::new());
    let orchestrator = Orchestrator::new(
        config(&tmp, ParallelBackend::ThreadPool, 2),
        store.clone(),
        Arc::new(ScriptedEvaluator::default()),
    );

    let results = orchestrator.run(&graph(&["hres", "panics", "gc"])).await.unwrap();

    assert_eq!(results.len(), 3);
    let key = CacheKey::derive(&request("panics")).unwrap();
    let failure = results[&key].failure().unwrap();
    assert_eq!(failure.kind, FailureKind::Panicked);
    assert!(failure.message.contains("evaluator blew up"));
    assert_eq!(results.values().filter(|r| r.is_success()).count(), 2);
}

#[tokio::test]
async fn test_duplicate_requests_evaluated_once() {
    let tmp = TempDir::new().unwrap();
    let evaluator = Arc::new(ScriptedEvaluator::default());
    let orchestrator = Orchestrator::new(
        config(&tmp, ParallelBackend::ThreadPool, 4),
        Arc::new(MemoryCacheStore::new()),
        evaluator.clone(),
    );

    let results = orchestrator
        .run(&graph(&["hres", "hres", "hres"]))
        .await
        .unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(evaluator.calls(), 1);
}

#[tokio::test]
async fn test_empty_graph() {
    let tmp = TempDir::new().unwrap();
    let orchestrator = Orchestrator::new(
        config(&tmp, ParallelBackend::ThreadPool, 4),
        Arc::new(MemoryCacheStore::new()),
        Arc::new(ScriptedEvaluator::default()),
    );
    assert!(orchestrator.run(&TaskGraph::new()).await.unwrap().is_empty());
}

// =============================================================================
// Cache interaction
// =============================================================================

#[tokio::test]
async fn test_cached_tasks_are_not_recomputed() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(FsCacheStore::new(tmp.path().join("artifacts")));
    let evaluator = Arc::new(ScriptedEvaluator::default());
    let orchestrator = Orchestrator::new(
        config(&tmp, ParallelBackend::ThreadPool, 4),
        store.clone(),
        evaluator.clone(),
    );
    let graph = graph(&["aifs", "hres", "gc"]);

    let first = orchestrator.run(&graph).await.unwrap();
    assert!(first.values().all(|r| matches!(r, TaskResult::Success(TaskSuccess::Computed(_)))));
    assert_eq!(evaluator.calls(), 3);

    let second = orchestrator.run(&graph).await.unwrap();
    assert!(second.values().all(TaskResult::is_cached));
    assert_eq!(evaluator.calls(), 3);

    // The cached view matches what was written
    for (key, result) in &first {
        let TaskResult::Success(TaskSuccess::Computed(artifact)) = result else {
            panic!("expected computed result");
        };
        let TaskResult::Success(TaskSuccess::Cached(meta)) = &second[key] else {
            panic!("expected cached result");
        };
        assert_eq!(&artifact.meta, meta);
    }
}

#[tokio::test]
async fn test_corrupt_artifact_is_recomputed() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(MemoryCacheStore::new());
    let evaluator = Arc::new(ScriptedEvaluator::default());
    let key = CacheKey::derive(&request("hres")).unwrap();
    store.put_raw(key.clone(), b"{\"truncated".to_vec());

    let orchestrator = Orchestrator::new(
        config(&tmp, ParallelBackend::Sequential, 1),
        store.clone(),
        evaluator.clone(),
    );
    let results = orchestrator.run(&graph(&["hres"])).await.unwrap();

    assert!(matches!(results[&key], TaskResult::Success(TaskSuccess::Computed(_))));
    assert_eq!(evaluator.calls(), 1);
    assert_eq!(store.read(&key).unwrap().payload["model"], "hres");
}

// =============================================================================
// Backends
// =============================================================================

#[tokio::test]
async fn test_sequential_matches_pooled_results() {
    let models = ["aifs", "hres", "broken", "pangu", "fourv2", "gc"];

    let seq_tmp = TempDir::new().unwrap();
    let seq_store = Arc::new(MemoryCacheStore::new());
    let seq = Orchestrator::new(
        // n_jobs is ignored by the sequential backend
        config(&seq_tmp, ParallelBackend::Sequential, 64),
        seq_store.clone(),
        Arc::new(ScriptedEvaluator::default()),
    )
    .run(&graph(&models))
    .await
    .unwrap();

    let pool_tmp = TempDir::new().unwrap();
    let pool_store = Arc::new(MemoryCacheStore::new());
    let pooled = Orchestrator::new(
        config(&pool_tmp, ParallelBackend::ThreadPool, 3),
        pool_store.clone(),
        Arc::new(ScriptedEvaluator::default()),
    )
    .run(&graph(&models))
    .await
    .unwrap();

    assert_eq!(
        seq.keys().collect::<Vec<_>>(),
        pooled.keys().collect::<Vec<_>>()
    );
    assert_eq!(RunSummary::from_results(&seq), RunSummary::from_results(&pooled));
    assert_eq!(
        payloads(seq_store.as_ref(), &seq),
        payloads(pool_store.as_ref(), &pooled)
    );
}

#[tokio::test]
async fn test_sequential_runs_one_at_a_time() {
    let tmp = TempDir::new().unwrap();
    let evaluator = Arc::new(ScriptedEvaluator::with_delay(Duration::from_millis(20)));
    Orchestrator::new(
        config(&tmp, ParallelBackend::Sequential, 8),
        Arc::new(MemoryCacheStore::new()),
        evaluator.clone(),
    )
    .run(&graph(&["a", "b", "c", "d"]))
    .await
    .unwrap();

    assert_eq!(evaluator.max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_thread_pool_respects_n_jobs() {
    let tmp = TempDir::new().unwrap();
    let evaluator = Arc::new(ScriptedEvaluator::with_delay(Duration::from_millis(50)));
    let results = Orchestrator::new(
        config(&tmp, ParallelBackend::ThreadPool, 2),
        Arc::new(MemoryCacheStore::new()),
        evaluator.clone(),
    )
    .run(&graph(&["a", "b", "c", "d", "e", "f"]))
    .await
    .unwrap();

    assert_eq!(results.len(), 6);
    assert!(evaluator.max_in_flight.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn test_oversized_n_jobs_still_runs() {
    let tmp = TempDir::new().unwrap();
    let results = Orchestrator::new(
        config(&tmp, ParallelBackend::ThreadPool, i64::MAX),
        Arc::new(MemoryCacheStore::new()),
        Arc::new(ScriptedEvaluator::default()),
    )
    .run(&graph(&["aifs", "hres"]))
    .await
    .unwrap();

    assert_eq!(results.len(), 2);
    assert!(results.values().all(TaskResult::is_success));
}

#[tokio::test]
async fn test_priority_orders_dispatch() {
    let tmp = TempDir::new().unwrap();
    let evaluator = Arc::new(ScriptedEvaluator::default());
    let mut graph = TaskGraph::new();
    graph.insert(Task::new(request("low")).unwrap().with_priority(-5)).unwrap();
    graph.insert(Task::new(request("plain")).unwrap()).unwrap();
    graph.insert(Task::new(request("urgent")).unwrap().with_priority(10)).unwrap();

    Orchestrator::new(
        config(&tmp, ParallelBackend::Sequential, 1),
        Arc::new(MemoryCacheStore::new()),
        evaluator.clone(),
    )
    .run(&graph)
    .await
    .unwrap();

    assert_eq!(*evaluator.order.lock().unwrap(), ["urgent", "plain", "low"]);
}

#[tokio::test]
async fn test_process_pool_requires_worker() {
    let tmp = TempDir::new().unwrap();
    let evaluator = Arc::new(ScriptedEvaluator::default());
    let err = Orchestrator::new(
        config(&tmp, ParallelBackend::ProcessPool, 2),
        Arc::new(MemoryCacheStore::new()),
        evaluator.clone(),
    )
    .run(&graph(&["hres"]))
    .await
    .unwrap_err();

    assert!(matches!(err, Error::Configuration { .. }));
    assert_eq!(evaluator.calls(), 0);
}

#[cfg(unix)]
#[tokio::test]
async fn test_process_pool_with_worker_processes() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(MemoryCacheStore::new());
    // Stand-in worker: consume the request, answer with a fixed payload
    let worker = WorkerCommand::new("sh").args([
        "-c",
        r#"cat >/dev/null; echo '{"status":"ok","payload":{"score":0.5}}'"#,
    ]);

    let results = Orchestrator::new(
        config(&tmp, ParallelBackend::ProcessPool, 2),
        store.clone(),
        Arc::new(ScriptedEvaluator::default()),
    )
    .with_worker(worker)
    .run(&graph(&["aifs", "hres", "gc"]))
    .await
    .unwrap();

    assert_eq!(results.len(), 3);
    assert!(results.values().all(TaskResult::is_success));
    for key in results.keys() {
        assert_eq!(store.read(key).unwrap().payload, json!({"score": 0.5}));
    }
}

#[cfg(unix)]
#[tokio::test]
async fn test_crashing_worker_is_task_failure() {
    let tmp = TempDir::new().unwrap();
    let worker = WorkerCommand::new("sh").args(["-c", "exit 137"]);

    let results = Orchestrator::new(
        config(&tmp, ParallelBackend::ProcessPool, 2),
        Arc::new(MemoryCacheStore::new()),
        Arc::new(ScriptedEvaluator::default()),
    )
    .with_worker(worker)
    .run(&graph(&["aifs", "hres"]))
    .await
    .unwrap();

    assert_eq!(results.len(), 2);
    assert!(
        results
            .values()
            .all(|r| r.failure().is_some_and(|f| f.kind == FailureKind::WorkerCrashed))
    );
}

// =============================================================================
// Cancellation and locking
// =============================================================================

#[tokio::test]
async fn test_cancelled_run_dispatches_nothing() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(MemoryCacheStore::new());
    let evaluator = Arc::new(ScriptedEvaluator::default());
    let cached = request("cached");
    store
        .write(&CacheKey::derive(&cached).unwrap(), &cached, &json!(1))
        .unwrap();

    let token = CancellationToken::new();
    token.cancel();
    let results = Orchestrator::new(
        config(&tmp, ParallelBackend::ThreadPool, 4),
        store.clone(),
        evaluator.clone(),
    )
    .with_cancellation(token)
    .run(&graph(&["cached", "hres", "gc"]))
    .await
    .unwrap();

    assert_eq!(results.len(), 3);
    assert_eq!(evaluator.calls(), 0);
    let summary = RunSummary::from_results(&results);
    assert_eq!(summary.cached, 1);
    assert!(summary.failures.iter().all(|f| f.kind == FailureKind::Cancelled));
    assert_eq!(summary.failed(), 2);
}

#[tokio::test]
async fn test_held_key_lock_times_out() {
    let tmp = TempDir::new().unwrap();
    let config = config(&tmp, ParallelBackend::Sequential, 1).with_lock_timeout_secs(1);
    let key = CacheKey::derive(&request("hres")).unwrap();
    let _held = config.key_lock().try_acquire(&key).unwrap().unwrap();

    let evaluator = Arc::new(ScriptedEvaluator::default());
    let results = Orchestrator::new(config, Arc::new(MemoryCacheStore::new()), evaluator.clone())
        .run(&graph(&["hres"]))
        .await
        .unwrap();

    assert_eq!(results[&key].failure().unwrap().kind, FailureKind::LockTimeout);
    assert_eq!(evaluator.calls(), 0);
}

#[tokio::test]
async fn test_locks_disabled() {
    let tmp = TempDir::new().unwrap();
    let config = config(&tmp, ParallelBackend::Sequential, 1).with_lock_timeout_secs(0);
    let key = CacheKey::derive(&request("hres")).unwrap();
    let _held = config.key_lock().try_acquire(&key).unwrap().unwrap();

    let results = Orchestrator::new(
        config,
        Arc::new(MemoryCacheStore::new()),
        Arc::new(ScriptedEvaluator::default()),
    )
    .without_key_locks()
    .run(&graph(&["hres"]))
    .await
    .unwrap();

    assert!(results[&key].is_success());
}

// =============================================================================
// Reporting
// =============================================================================

#[derive(Default)]
struct CountingReporter {
    started_runs: Mutex<Vec<(usize, usize)>>,
    started: AtomicUsize,
    finished: AtomicUsize,
}

#[async_trait]
impl RunReporter for CountingReporter {
    async fn run_started(&self, total: usize, pending: usize) {
        self.started_runs.lock().unwrap().push((total, pending));
    }

    async fn task_started(&self, _task: &Task) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    async fn task_finished(&self, _key: &CacheKey, _result: &TaskResult, _elapsed: Duration) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_reporter_sees_every_task() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(MemoryCacheStore::new());
    let cached = request("cached");
    store
        .write(&CacheKey::derive(&cached).unwrap(), &cached, &json!(1))
        .unwrap();
    let reporter = Arc::new(CountingReporter::default());

    Orchestrator::new(
        config(&tmp, ParallelBackend::ThreadPool, 2),
        store,
        Arc::new(ScriptedEvaluator::default()),
    )
    .with_reporter(reporter.clone())
    .run(&graph(&["cached", "hres", "broken"]))
    .await
    .unwrap();

    assert_eq!(*reporter.started_runs.lock().unwrap(), [(3, 2)]);
    assert_eq!(reporter.started.load(Ordering::SeqCst), 2);
    assert_eq!(reporter.finished.load(Ordering::SeqCst), 3);
}
