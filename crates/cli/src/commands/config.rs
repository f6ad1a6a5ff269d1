//! `ewb config`: print the resolved configuration

use super::{CommandContext, CommandOutput};
use crate::cli::CliError;

/// Execute the config command
///
/// # Errors
///
/// Returns an error if the configuration cannot be serialized.
pub fn execute(ctx: &CommandContext) -> Result<CommandOutput, CliError> {
    let stdout = if ctx.json {
        serde_json::to_string_pretty(&ctx.config)
            .map_err(|e| CliError::other(format!("Failed to serialize configuration: {e}")))?
    } else {
        toml::to_string_pretty(&ctx.config)
            .map_err(|e| CliError::other(format!("Failed to serialize configuration: {e}")))?
    };
    Ok(CommandOutput::ok(stdout.trim_end()))
}
