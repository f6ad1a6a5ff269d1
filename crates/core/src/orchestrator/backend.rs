//! Execution backends for a single evaluation
//!
//! In-process backends run the evaluator on tokio's blocking pool. The
//! process backend launches a worker per evaluation and speaks the
//! [`crate::worker`] protocol over its stdio.

use super::FailureKind;
use crate::evaluator::{Evaluator, stderr_tail};
use crate::worker::{WorkerCommand, WorkerReply};
use ewb_cache::EvaluationRequest;
use serde_json::Value;
use std::io::ErrorKind;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Why an evaluation produced no payload
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct DispatchFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl DispatchFailure {
    fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Runs one evaluation somewhere
#[derive(Clone)]
pub(crate) enum Dispatcher {
    /// Evaluator called on a blocking thread of this process
    InProcess(Arc<dyn Evaluator>),
    /// Evaluator called in a child worker process
    Worker(WorkerCommand),
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InProcess(_) => f.write_str("InProcess"),
            Self::Worker(cmd) => f.debug_tuple("Worker").field(cmd).finish(),
        }
    }
}

impl Dispatcher {
    pub(crate) async fn evaluate(
        &self,
        request: &EvaluationRequest,
    ) -> Result<Value, DispatchFailure> {
        match self {
            Self::InProcess(evaluator) => evaluate_in_process(Arc::clone(evaluator), request).await,
            Self::Worker(command) => evaluate_in_worker(command, request).await,
        }
    }
}

async fn evaluate_in_process(
    evaluator: Arc<dyn Evaluator>,
    request: &EvaluationRequest,
) -> Result<Value, DispatchFailure> {
    let request = request.clone();
    match tokio::task::spawn_blocking(move || evaluator.evaluate(&request)).await {
        Ok(Ok(payload)) => Ok(payload),
        Ok(Err(e)) => Err(DispatchFailure::new(FailureKind::Evaluation(e.kind), e.message)),
        Err(join_err) if join_err.is_panic() => Err(DispatchFailure::new(
            FailureKind::Panicked,
            panic_message(join_err.into_panic()),
        )),
        Err(join_err) => Err(DispatchFailure::new(
            FailureKind::Cancelled,
            join_err.to_string(),
        )),
    }
}

async fn evaluate_in_worker(
    command: &WorkerCommand,
    request: &EvaluationRequest,
) -> Result<Value, DispatchFailure> {
    let input = serde_json::to_vec(request).map_err(|e| {
        DispatchFailure::new(
            FailureKind::Evaluation("invalid_request".into()),
            e.to_string(),
        )
    })?;

    let mut child = Command::new(command.program())
        .args(command.get_args())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            DispatchFailure::new(
                FailureKind::WorkerCrashed,
                format!(
                    "Failed to start worker {}: {e}",
                    command.program().display()
                ),
            )
        })?;

    // Dropping stdin after the write marks the end of the request
    let stdin = child.stdin.take();
    let send = async move {
        match stdin {
            Some(mut stdin) => stdin.write_all(&input).await,
            None => Ok(()),
        }
    };
    let (sent, output) = tokio::join!(send, child.wait_with_output());

    let output = output.map_err(|e| {
        DispatchFailure::new(
            FailureKind::WorkerCrashed,
            format!("Failed to wait for worker: {e}"),
        )
    })?;

    if !output.status.success() {
        return Err(DispatchFailure::new(
            FailureKind::WorkerCrashed,
            format!(
                "Worker exited with {}: {}",
                output.status,
                stderr_tail(&output.stderr)
            ),
        ));
    }

    match sent {
        Err(e) if e.kind() != ErrorKind::BrokenPipe => {
            return Err(DispatchFailure::new(
                FailureKind::WorkerCrashed,
                format!("Failed to send request to worker: {e}"),
            ));
        }
        Err(e) => tracing::debug!(error = %e, "Worker closed stdin early"),
        Ok(()) => {}
    }

    let reply: WorkerReply = serde_json::from_slice(&output.stdout).map_err(|e| {
        DispatchFailure::new(
            FailureKind::WorkerCrashed,
            format!("Unreadable worker reply: {e}"),
        )
    })?;

    match reply {
        WorkerReply::Ok { payload } => Ok(payload),
        WorkerReply::Error { kind, message } => Err(DispatchFailure::new(
            FailureKind::Evaluation(kind),
            message,
        )),
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "evaluator panicked".to_string()
    }
}
