//! The boundary to the external evaluation library
//!
//! An [`Evaluator`] turns one [`EvaluationRequest`] into a JSON payload. It is
//! treated as a pure, possibly slow and memory-heavy function; the cache is
//! authoritative and evaluators keep no state between calls.

use crate::config::Configuration;
use ewb_cache::EvaluationRequest;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{self, Write};
use std::process::{Command, Stdio};
use std::sync::Arc;
use thiserror::Error;

/// Lines of stderr kept in failure messages
const STDERR_TAIL_LINES: usize = 20;

/// A failed evaluation
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct EvaluationError {
    /// Machine-readable failure category, e.g. `missing_data`
    pub kind: String,
    /// Human-readable details
    pub message: String,
}

impl EvaluationError {
    /// Create an evaluation error
    #[must_use]
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// Computes the payload for one request
pub trait Evaluator: Send + Sync {
    /// Run the evaluation
    ///
    /// # Errors
    ///
    /// Returns an [`EvaluationError`] describing why no payload was produced.
    fn evaluate(&self, request: &EvaluationRequest) -> Result<Value, EvaluationError>;
}

impl<F> Evaluator for F
where
    F: Fn(&EvaluationRequest) -> Result<Value, EvaluationError> + Send + Sync,
{
    fn evaluate(&self, request: &EvaluationRequest) -> Result<Value, EvaluationError> {
        self(request)
    }
}

/// Evaluator bridging to an external program
///
/// The request is written as JSON to the program's stdin and the payload is
/// read as JSON from its stdout.
#[derive(Debug, Clone)]
pub struct CommandEvaluator {
    program: String,
    args: Vec<String>,
}

impl CommandEvaluator {
    /// Create from an argv; `None` if it is empty
    #[must_use]
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

impl Evaluator for CommandEvaluator {
    fn evaluate(&self, request: &EvaluationRequest) -> Result<Value, EvaluationError> {
        let input = serde_json::to_vec(request)
            .map_err(|e| EvaluationError::new("invalid_request", e.to_string()))?;

        tracing::debug!(program = %self.program, request = %request.label(), "Running evaluator command");
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                EvaluationError::new(
                    "spawn_failed",
                    format!("Failed to start '{}': {e}", self.program),
                )
            })?;

        // stdin is fed from its own thread so a program that streams output
        // while still reading cannot block on a full pipe
        let stdin = child.stdin.take();
        let (output, written) = std::thread::scope(|scope| {
            let writer = scope.spawn(move || match stdin {
                Some(mut stdin) => stdin.write_all(&input),
                None => Ok(()),
            });
            let output = child.wait_with_output();
            let written = writer
                .join()
                .unwrap_or_else(|_| Err(io::Error::other("stdin writer panicked")));
            (output, written)
        });

        let output = output.map_err(|e| {
            EvaluationError::new("command_failed", format!("Failed to wait for evaluator: {e}"))
        })?;

        if !output.status.success() {
            return Err(EvaluationError::new(
                "command_failed",
                format!(
                    "'{}' exited with {}: {}",
                    self.program,
                    output.status,
                    stderr_tail(&output.stderr)
                ),
            ));
        }

        // A program that exits without reading stdin is judged by its exit status
        if let Err(e) = written
            && e.kind() != io::ErrorKind::BrokenPipe
        {
            return Err(EvaluationError::new(
                "command_failed",
                format!("Failed to send request to '{}': {e}", self.program),
            ));
        }

        serde_json::from_slice(&output.stdout).map_err(|e| {
            EvaluationError::new("invalid_output", format!("Evaluator output is not JSON: {e}"))
        })
    }
}

/// Evaluator used when no evaluation command is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredEvaluator;

impl Evaluator for UnconfiguredEvaluator {
    fn evaluate(&self, _request: &EvaluationRequest) -> Result<Value, EvaluationError> {
        Err(EvaluationError::new(
            "not_configured",
            "No evaluator configured; set [evaluation] command in config.toml",
        ))
    }
}

/// The evaluator a configuration describes
#[must_use]
pub fn evaluator_from_config(config: &Configuration) -> Arc<dyn Evaluator> {
    match config
        .evaluator_command
        .as_deref()
        .and_then(CommandEvaluator::from_argv)
    {
        Some(evaluator) => Arc::new(evaluator),
        None => Arc::new(UnconfiguredEvaluator),
    }
}

/// Last lines of a process's stderr
pub(crate) fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use ewb_cache::ParameterSet;
    use serde_json::json;

    fn request() -> EvaluationRequest {
        EvaluationRequest::new(
            "heat_wave",
            "hres",
            "surface_air_temperature",
            ParameterSet::new(),
        )
    }

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_closure_evaluator() {
        let evaluator = |r: &EvaluationRequest| -> Result<Value, EvaluationError> {
            Ok(json!({"model": r.model_id}))
        };
        assert_eq!(evaluator.evaluate(&request()).unwrap(), json!({"model": "hres"}));
    }

    #[test]
    fn test_from_argv_rejects_empty() {
        assert!(CommandEvaluator::from_argv(&[]).is_none());
        assert!(CommandEvaluator::from_argv(&argv(&["python"])).is_some());
    }

    #[test]
    fn test_unconfigured_evaluator_fails() {
        let err = UnconfiguredEvaluator.evaluate(&request()).unwrap_err();
        assert_eq!(err.kind, "not_configured");
    }

    #[test]
    fn test_stderr_tail_keeps_last_lines() {
        let stderr: String = (0..50).map(|i| format!("line {i}\n")).collect();
        let tail = stderr_tail(stderr.as_bytes());
        assert!(tail.starts_with("line 30"));
        assert!(tail.ends_with("line 49"));
    }

    #[cfg(unix)]
    #[test]
    fn test_command_evaluator_echoes_request() {
        let evaluator = CommandEvaluator::from_argv(&argv(&["sh", "-c", "cat"])).unwrap();
        let payload = evaluator.evaluate(&request()).unwrap();
        assert_eq!(payload["model_id"], "hres");
    }

    #[cfg(unix)]
    #[test]
    fn test_command_evaluator_large_request_does_not_block() {
        let evaluator = CommandEvaluator::from_argv(&argv(&["sh", "-c", "cat"])).unwrap();
        let blob = "x".repeat(512 * 1024);
        let request = EvaluationRequest::new(
            "heat_wave",
            "hres",
            "surface_air_temperature",
            ParameterSet::new().with("blob", blob.as_str()),
        );

        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(evaluator.evaluate(&request));
        });
        let payload = rx
            .recv_timeout(std::time::Duration::from_secs(30))
            .expect("evaluator should finish")
            .unwrap();
        assert_eq!(payload["parameter_set"]["blob"].as_str().map(str::len), Some(blob.len()));
    }

    #[cfg(unix)]
    #[test]
    fn test_command_evaluator_nonzero_exit() {
        let evaluator =
            CommandEvaluator::from_argv(&argv(&["sh", "-c", "echo boom >&2; exit 3"])).unwrap();
        let err = evaluator.evaluate(&request()).unwrap_err();
        assert_eq!(err.kind, "command_failed");
        assert!(err.message.contains("boom"));
    }

    #[cfg(unix)]
    #[test]
    fn test_command_evaluator_invalid_output() {
        let evaluator =
            CommandEvaluator::from_argv(&argv(&["sh", "-c", "cat >/dev/null; echo not-json"]))
                .unwrap();
        let err = evaluator.evaluate(&request()).unwrap_err();
        assert_eq!(err.kind, "invalid_output");
    }

    #[test]
    fn test_missing_program() {
        let evaluator =
            CommandEvaluator::from_argv(&argv(&["/definitely/not/a/real/program"])).unwrap();
        assert_eq!(evaluator.evaluate(&request()).unwrap_err().kind, "spawn_failed");
    }
}
