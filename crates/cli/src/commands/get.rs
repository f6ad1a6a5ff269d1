//! `ewb get`: print one payload, computing it on a miss

use super::{CommandContext, CommandOutput};
use crate::cli::{CliError, KeyArgs};
use ewb_core::ResultAccessor;

/// Execute the get command
///
/// # Errors
///
/// Returns the evaluation error, with its failure kind, if the payload could
/// not be computed.
pub async fn execute(args: &KeyArgs, ctx: &CommandContext) -> Result<CommandOutput, CliError> {
    let request = args.request();
    tracing::info!(request = %request.label(), "Fetching result");

    let accessor = ResultAccessor::new(ctx.orchestrator(ctx.config.clone())?);
    let payload = accessor.get_or_compute_request(request).await?;

    let stdout = if ctx.json {
        payload.to_string()
    } else {
        serde_json::to_string_pretty(&payload)
            .map_err(|e| CliError::other(format!("Failed to format payload: {e}")))?
    };
    Ok(CommandOutput::ok(stdout))
}
