//! `ewb status`: list cached artifacts

use super::{CommandContext, CommandOutput};
use crate::cli::CliError;
use ewb_cache::{ArtifactMeta, CacheKey, CacheStore, FsCacheStore, STALE_LOCK_THRESHOLD};
use serde_json::{Value, json};
use std::fmt::Write;

/// Execute the status command
///
/// With `sweep`, temporary files older than the stale-lock threshold are
/// removed first.
///
/// # Errors
///
/// Returns an error if the cache directory cannot be read.
pub fn execute(sweep: bool, ctx: &CommandContext) -> Result<CommandOutput, CliError> {
    let store = ctx.config.open_store();

    let swept = if sweep {
        let swept = store.sweep_partials(STALE_LOCK_THRESHOLD)?;
        tracing::info!(swept, "Removed interrupted writes");
        Some(swept)
    } else {
        None
    };

    let entries = entries(&store)?;

    if ctx.json {
        let value = json!({
            "root": store.root().display().to_string(),
            "artifacts": entries.iter().map(Entry::to_json).collect::<Vec<_>>(),
            "swept": swept,
        });
        return Ok(CommandOutput::ok(value.to_string()));
    }

    let mut out = String::new();
    for entry in &entries {
        match &entry.meta {
            Ok(meta) => {
                let _ = writeln!(
                    out,
                    "{}  {}  {}",
                    entry.key.short(),
                    meta.computed_at.to_rfc3339(),
                    meta.request.label()
                );
            }
            Err(error) => {
                let _ = writeln!(out, "{}  unreadable: {error}", entry.key.short());
            }
        }
    }
    if let Some(swept) = swept {
        let _ = writeln!(out, "Removed {swept} interrupted writes");
    }
    let _ = write!(
        out,
        "{} artifacts in {}",
        entries.len(),
        store.root().display()
    );
    Ok(CommandOutput::ok(out))
}

/// A stored key and its header, or why the header could not be read
struct Entry {
    key: CacheKey,
    meta: Result<ArtifactMeta, String>,
}

impl Entry {
    fn to_json(&self) -> Value {
        match &self.meta {
            Ok(meta) => json!({
                "key": self.key.as_hex(),
                "request": meta.request,
                "computed_at": meta.computed_at.to_rfc3339(),
                "schema_version": meta.schema_version,
            }),
            Err(error) => json!({ "key": self.key.as_hex(), "error": error }),
        }
    }
}

fn entries(store: &FsCacheStore) -> Result<Vec<Entry>, CliError> {
    Ok(store
        .list_keys()?
        .into_iter()
        .map(|key| {
            let meta = store.read_meta(&key).map_err(|e| {
                tracing::warn!(key = %key.short(), error = %e, "Unreadable artifact");
                e.to_string()
            });
            Entry { key, meta }
        })
        .collect())
}
