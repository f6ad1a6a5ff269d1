//! Hidden `ewb __worker` subcommand used by the process-pool backend

use super::CommandOutput;
use crate::cli::CliError;
use ewb_core::{Configuration, evaluator_from_config, worker};
use std::io;

/// Answer one evaluation request read from stdin
///
/// The reply, including evaluation failures, goes to stdout; the process
/// exits 0 whenever a reply was written.
///
/// # Errors
///
/// Returns an error if stdin cannot be read or the reply cannot be written.
pub fn execute(config: &Configuration) -> Result<CommandOutput, CliError> {
    let evaluator = evaluator_from_config(config);
    let reply = worker::serve(evaluator.as_ref(), io::stdin().lock(), io::stdout().lock())?;
    tracing::debug!(?reply, "Worker replied");
    Ok(CommandOutput::ok(String::new()))
}
