//! Run progress reporting and summaries

use crate::orchestrator::{TaskFailure, TaskResult, TaskSuccess};
use async_trait::async_trait;
use ewb_cache::CacheKey;
use ewb_task_graph::Task;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Receives orchestration progress events
///
/// All hooks default to doing nothing.
#[async_trait]
pub trait RunReporter: Send + Sync {
    /// Called once after cached tasks are partitioned from pending ones
    async fn run_started(&self, _total: usize, _pending: usize) {}

    /// Called when a pending task is dispatched
    async fn task_started(&self, _task: &Task) {}

    /// Called once per task with its final result
    async fn task_finished(&self, _key: &CacheKey, _result: &TaskResult, _elapsed: Duration) {}
}

/// No-op reporter for when progress reporting is disabled
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpReporter;

#[async_trait]
impl RunReporter for NoOpReporter {}

/// Aggregate outcome of a run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    /// Tasks evaluated in this run
    pub computed: usize,
    /// Tasks served from the cache
    pub cached: usize,
    /// Failed tasks, in key order
    pub failures: Vec<TaskFailure>,
}

impl RunSummary {
    /// Summarize a result map
    #[must_use]
    pub fn from_results(results: &BTreeMap<CacheKey, TaskResult>) -> Self {
        let mut summary = Self::default();
        for result in results.values() {
            match result {
                TaskResult::Success(TaskSuccess::Computed(_)) => summary.computed += 1,
                TaskResult::Success(TaskSuccess::Cached(_)) => summary.cached += 1,
                TaskResult::Failure(failure) => summary.failures.push(failure.clone()),
            }
        }
        summary
    }

    /// Number of failed tasks
    #[must_use]
    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    /// Total number of tasks
    #[must_use]
    pub fn total(&self) -> usize {
        self.computed + self.cached + self.failed()
    }

    /// Whether every task succeeded
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} tasks: {} computed, {} cached, {} failed",
            self.total(),
            self.computed,
            self.cached,
            self.failed()
        )?;
        for failure in &self.failures {
            write!(
                f,
                "\n  {} {}: {}",
                failure.key.short(),
                failure.kind,
                failure.message
            )?;
        }
        Ok(())
    }
}
