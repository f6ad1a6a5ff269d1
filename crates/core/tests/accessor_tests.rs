//! Tests for on-demand result access

use ewb_cache::{CacheKey, CacheStore, EvaluationRequest, MemoryCacheStore, ParameterSet};
use ewb_core::{
    Configuration, Error, EvaluationError, Evaluator, Jobs, Orchestrator, ParallelBackend,
    ResultAccessor,
};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

#[derive(Default)]
struct CountingEvaluator {
    calls: AtomicUsize,
}

impl Evaluator for CountingEvaluator {
    fn evaluate(&self, request: &EvaluationRequest) -> Result<Value, EvaluationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if request.variable_name == "missing" {
            return Err(EvaluationError::new(
                "missing_data",
                "variable not in forecast",
            ));
        }
        Ok(json!({
            "model": request.model_id,
            "variable": request.variable_name,
        }))
    }
}

fn accessor(
    tmp: &TempDir,
    store: Arc<MemoryCacheStore>,
    evaluator: Arc<CountingEvaluator>,
) -> ResultAccessor {
    let config = Configuration::with_basepath(tmp.path())
        .with_backend(ParallelBackend::ThreadPool)
        .with_jobs(Jobs::from_count(2).unwrap());
    ResultAccessor::new(Orchestrator::new(config, store, evaluator))
}

fn params() -> ParameterSet {
    ParameterSet::new().with("target", "era5")
}

#[tokio::test]
async fn test_get_or_compute_computes_once() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(MemoryCacheStore::new());
    let evaluator = Arc::new(CountingEvaluator::default());
    let accessor = accessor(&tmp, store.clone(), evaluator.clone());

    let first = accessor
        .get_or_compute("heat_wave", "aifs", "surface_air_temperature", params())
        .await
        .unwrap();
    let second = accessor
        .get_or_compute("heat_wave", "aifs", "surface_air_temperature", params())
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(first["model"], "aifs");
    assert_eq!(evaluator.calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn test_get_or_compute_error_keeps_kind() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(MemoryCacheStore::new());
    let accessor = accessor(&tmp, store.clone(), Arc::new(CountingEvaluator::default()));

    let err = accessor
        .get_or_compute("freeze", "hres", "missing", params())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Evaluation { .. }));
    assert_eq!(err.evaluation_kind(), Some("evaluation:missing_data"));
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_corrupt_hit_is_recomputed() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(MemoryCacheStore::new());
    let evaluator = Arc::new(CountingEvaluator::default());
    let request = EvaluationRequest::new("heat_wave", "gc", "surface_air_temperature", params());
    let key = CacheKey::derive(&request).unwrap();
    store.put_raw(key.clone(), b"not an artifact".to_vec());

    let accessor = accessor(&tmp, store.clone(), evaluator.clone());
    let payload = accessor.get_or_compute_request(request).await.unwrap();

    assert_eq!(payload["model"], "gc");
    assert_eq!(evaluator.calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.read(&key).unwrap().payload, payload);
}

#[tokio::test]
async fn test_get_cached_does_not_compute() {
    let tmp = TempDir::new().unwrap();
    let evaluator = Arc::new(CountingEvaluator::default());
    let accessor = accessor(&tmp, Arc::new(MemoryCacheStore::new()), evaluator.clone());
    let request = EvaluationRequest::new("freeze", "pangu", "surface_air_temperature", params());

    let err = accessor.get_cached(&request).unwrap_err();
    assert!(matches!(err, Error::Cache(ewb_cache::Error::Miss { .. })));
    assert_eq!(evaluator.calls.load(Ordering::SeqCst), 0);

    accessor.get_or_compute_request(request.clone()).await.unwrap();
    assert_eq!(accessor.get_cached(&request).unwrap()["model"], "pangu");
}
