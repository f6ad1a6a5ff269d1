//! Configuration, orchestration and cached result access for ewb
//!
//! This crate ties the cache and the task graph together:
//! - [`ConfigResolver`] resolves an immutable [`Configuration`]
//! - [`Orchestrator`] evaluates a [`ewb_task_graph::TaskGraph`] on a worker
//!   pool and writes each success back to the cache
//! - [`ResultAccessor`] serves cached payloads and computes misses on demand
//!
//! Evaluation itself is delegated to an [`Evaluator`], either in-process or
//! in worker processes speaking the [`worker`] protocol.

pub mod accessor;
pub mod config;
mod error;
pub mod evaluator;
pub mod orchestrator;
pub mod reporter;
pub mod worker;

pub use accessor::ResultAccessor;
pub use config::{ConfigInputs, ConfigResolver, Configuration, Jobs, ParallelBackend, resolve_from_inputs};
pub use error::{Error, Result};
pub use evaluator::{CommandEvaluator, EvaluationError, Evaluator, UnconfiguredEvaluator, evaluator_from_config};
pub use orchestrator::{FailureKind, Orchestrator, TaskFailure, TaskResult, TaskSuccess};
pub use reporter::{NoOpReporter, RunReporter, RunSummary};
pub use worker::{WORKER_SUBCOMMAND, WorkerCommand, WorkerReply};
