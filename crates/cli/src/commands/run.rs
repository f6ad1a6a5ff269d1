//! `ewb run`: evaluate selected models for an event type

use super::{CommandContext, CommandOutput};
use crate::cli::{CliError, EXIT_OK, EXIT_SIGINT, EXIT_TASKS_FAILED, RunArgs};
use crate::progress::ProgressReporter;
use ewb_core::{RunReporter, RunSummary};
use ewb_task_graph::{RequestMatrix, TaskGraph};
use serde_json::json;
use std::sync::Arc;

/// Build the task graph for a run
///
/// # Errors
///
/// Returns a configuration error when no model is selected.
pub fn build_graph(args: &RunArgs) -> Result<TaskGraph, CliError> {
    let models = args.models();
    if models.is_empty() {
        return Err(CliError::config_with_help(
            "No forecast models selected",
            "Pass one or more of --run-aifs, --run-hres, --run-pangu, --run-fourv2, --run-gc",
        ));
    }

    RequestMatrix::new()
        .event_types([args.event_type.as_str()])
        .model_ids(models.iter().map(|m| m.as_str()))
        .variables(args.variables())
        .parameter_sets([args.params.parameter_set()])
        .into_graph()
        .map_err(|e| CliError::eval(e.to_string()))
}

/// Execute the run command
///
/// # Errors
///
/// Returns an error if the graph or backend cannot be set up. Task failures
/// set the exit code to 1.
pub async fn execute(args: &RunArgs, ctx: &CommandContext) -> Result<CommandOutput, CliError> {
    let graph = build_graph(args)?;

    let mut config = ctx.config.clone();
    if let Some(backend) = args.backend {
        config = config.with_backend(backend.into());
    }
    if let Some(jobs) = args.n_jobs {
        config = config.with_jobs(jobs);
    }

    tracing::info!(
        event_type = args.event_type.as_str(),
        tasks = graph.len(),
        backend = %config.parallel_backend,
        n_jobs = %config.n_jobs,
        "Running evaluation"
    );

    let progress = Arc::new(if ctx.json {
        ProgressReporter::hidden()
    } else {
        ProgressReporter::new()
    });
    let reporter: Arc<dyn RunReporter> = progress.clone();
    let orchestrator = ctx.orchestrator(config)?.with_reporter(reporter);

    let results = orchestrator.run(&graph).await;
    progress.finish();
    let summary = RunSummary::from_results(&results?);

    let stdout = if ctx.json {
        summary_json(&summary).to_string()
    } else {
        summary.to_string()
    };

    let exit_code = if ctx.cancel.is_cancelled() {
        EXIT_SIGINT
    } else if summary.is_success() {
        EXIT_OK
    } else {
        EXIT_TASKS_FAILED
    };
    Ok(CommandOutput::ok(stdout).with_exit_code(exit_code))
}

/// Machine-readable run summary
#[must_use]
pub fn summary_json(summary: &RunSummary) -> serde_json::Value {
    json!({
        "total": summary.total(),
        "computed": summary.computed,
        "cached": summary.cached,
        "failed": summary.failed(),
        "failures": summary
            .failures
            .iter()
            .map(|f| json!({
                "key": f.key.as_hex(),
                "kind": f.kind.to_string(),
                "message": f.message,
            }))
            .collect::<Vec<_>>(),
    })
}
