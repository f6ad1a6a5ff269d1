//! On-demand access to cached evaluation results

use crate::orchestrator::{FailureKind, Orchestrator, TaskResult, TaskSuccess};
use crate::{Error, Result};
use ewb_cache::{CacheKey, CacheStore, EvaluationRequest, ParameterSet};
use ewb_task_graph::TaskGraph;
use serde_json::Value;
use std::sync::Arc;

/// Read-side API: returns a cached payload, computing it first if needed
#[derive(Debug)]
pub struct ResultAccessor {
    orchestrator: Orchestrator,
}

impl ResultAccessor {
    /// Accessor computing misses with `orchestrator`
    #[must_use]
    pub const fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator }
    }

    fn store(&self) -> &Arc<dyn CacheStore> {
        self.orchestrator.store()
    }

    /// Payload for the given evaluation, computing and caching it on a miss
    ///
    /// # Errors
    ///
    /// Returns [`Error::Evaluation`] carrying the failure kind if the
    /// computation fails, or a cache error if the store is unusable.
    pub async fn get_or_compute(
        &self,
        event_type: &str,
        model_id: &str,
        variable_name: &str,
        parameter_set: ParameterSet,
    ) -> Result<Value> {
        self.get_or_compute_request(EvaluationRequest::new(
            event_type,
            model_id,
            variable_name,
            parameter_set,
        ))
        .await
    }

    /// Payload for `request`, computing and caching it on a miss
    ///
    /// # Errors
    ///
    /// See [`Self::get_or_compute`].
    pub async fn get_or_compute_request(&self, request: EvaluationRequest) -> Result<Value> {
        let key = CacheKey::derive(&request)?;

        if self.store().exists(&key) {
            match self.store().read(&key) {
                Ok(artifact) => {
                    tracing::debug!(key = %key.short(), "Serving cached payload");
                    return Ok(artifact.payload);
                }
                Err(ewb_cache::Error::Miss { .. }) => {}
                Err(e @ ewb_cache::Error::Corrupt { .. }) => {
                    tracing::warn!(
                        key = %key.short(),
                        request = %request.label(),
                        error = %e,
                        "Corrupt artifact, recomputing"
                    );
                    self.store().invalidate(&key)?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        let graph = TaskGraph::singleton(request)?;
        let mut results = self.orchestrator.run(&graph).await?;

        match results.remove(&key) {
            Some(TaskResult::Success(TaskSuccess::Computed(artifact))) => Ok(artifact.payload),
            // Another worker finished the key first
            Some(TaskResult::Success(TaskSuccess::Cached(_))) => {
                Ok(self.store().read(&key)?.payload)
            }
            Some(TaskResult::Failure(failure)) => Err(failure.into()),
            None => Err(Error::evaluation(
                key.as_hex(),
                FailureKind::Panicked.to_string(),
                "Orchestrator returned no result",
            )),
        }
    }

    /// Payload for `request` if it is cached, without computing
    ///
    /// # Errors
    ///
    /// Returns the store's miss or corruption error.
    pub fn get_cached(&self, request: &EvaluationRequest) -> Result<Value> {
        let key = CacheKey::derive(request)?;
        Ok(self.store().read(&key)?.payload)
    }
}
