//! Worker process protocol
//!
//! The process-pool backend runs each evaluation in a fresh worker process.
//! The orchestrator writes the [`EvaluationRequest`] as JSON to the worker's
//! stdin and reads one [`WorkerReply`] from its stdout:
//!
//! ```text
//! {"status":"ok","payload":{...}}
//! {"status":"error","kind":"missing_data","message":"..."}
//! ```
//!
//! A worker that exits non-zero or prints anything else is treated as crashed.

use crate::evaluator::{EvaluationError, Evaluator};
use crate::{Error, Result};
use ewb_cache::EvaluationRequest;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{Read, Write};
use std::path::PathBuf;

/// Hidden CLI subcommand that runs one evaluation
pub const WORKER_SUBCOMMAND: &str = "__worker";

/// A worker's answer for one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerReply {
    /// The evaluation produced a payload
    Ok {
        /// Evaluation output
        payload: Value,
    },
    /// The evaluation failed
    Error {
        /// Failure category
        kind: String,
        /// Failure details
        message: String,
    },
}

impl From<std::result::Result<Value, EvaluationError>> for WorkerReply {
    fn from(result: std::result::Result<Value, EvaluationError>) -> Self {
        match result {
            Ok(payload) => Self::Ok { payload },
            Err(e) => Self::Error {
                kind: e.kind,
                message: e.message,
            },
        }
    }
}

impl From<WorkerReply> for std::result::Result<Value, EvaluationError> {
    fn from(reply: WorkerReply) -> Self {
        match reply {
            WorkerReply::Ok { payload } => Ok(payload),
            WorkerReply::Error { kind, message } => Err(EvaluationError { kind, message }),
        }
    }
}

/// Serve one request: read it from `input`, evaluate, write the reply to `output`
///
/// # Errors
///
/// Returns an error only if the reply cannot be written. Unreadable requests
/// are answered with an `invalid_request` error reply.
pub fn serve(
    evaluator: &dyn Evaluator,
    mut input: impl Read,
    mut output: impl Write,
) -> Result<WorkerReply> {
    let mut buf = Vec::new();
    input.read_to_end(&mut buf)?;

    let reply = match serde_json::from_slice::<EvaluationRequest>(&buf) {
        Ok(request) => {
            tracing::debug!(request = %request.label(), "Worker evaluating request");
            WorkerReply::from(evaluator.evaluate(&request))
        }
        Err(e) => WorkerReply::Error {
            kind: "invalid_request".to_string(),
            message: format!("Worker input is not an evaluation request: {e}"),
        },
    };

    let mut line = serde_json::to_vec(&reply)
        .map_err(|e| Error::configuration(format!("Failed to encode worker reply: {e}")))?;
    line.push(b'\n');
    output.write_all(&line)?;
    output.flush()?;
    Ok(reply)
}

/// How to launch a worker process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<String>,
}

impl WorkerCommand {
    /// Worker running `program` with no arguments
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Append an argument
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// This executable re-invoked with the hidden worker subcommand
    ///
    /// # Errors
    ///
    /// Returns an error if the current executable cannot be located.
    pub fn current_exe() -> Result<Self> {
        let exe = std::env::current_exe().map_err(|e| Error::io(e, "current_exe", "locate"))?;
        Ok(Self::new(exe).arg(WORKER_SUBCOMMAND))
    }

    /// Program to run
    #[must_use]
    pub fn program(&self) -> &std::path::Path {
        &self.program
    }

    /// Arguments passed to the program
    #[must_use]
    pub fn get_args(&self) -> &[String] {
        &self.args
    }
}
