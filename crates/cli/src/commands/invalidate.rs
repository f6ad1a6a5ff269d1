//! `ewb invalidate`: remove one cached artifact

use super::{CommandContext, CommandOutput};
use crate::cli::{CliError, KeyArgs};
use ewb_cache::{CacheKey, CacheStore};
use serde_json::json;

/// Execute the invalidate command
///
/// Removing an artifact that does not exist is not an error.
///
/// # Errors
///
/// Returns an error if the key cannot be derived or the file cannot be removed.
pub fn execute(args: &KeyArgs, ctx: &CommandContext) -> Result<CommandOutput, CliError> {
    let request = args.request();
    let key = CacheKey::derive(&request)?;
    let removed = ctx.config.open_store().invalidate(&key)?;
    tracing::info!(key = %key.short(), request = %request.label(), removed, "Invalidated artifact");

    let stdout = if ctx.json {
        json!({ "key": key.as_hex(), "removed": removed }).to_string()
    } else if removed {
        format!("Removed {} ({})", key.short(), request.label())
    } else {
        format!("Nothing cached for {}", request.label())
    };
    Ok(CommandOutput::ok(stdout))
}
