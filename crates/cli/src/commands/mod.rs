//! Command implementations

pub mod config;
pub mod get;
pub mod invalidate;
pub mod run;
pub mod status;
pub mod worker;

use crate::cli::{CliError, Cli, Commands, EXIT_OK};
use ewb_core::{
    ConfigResolver, Configuration, Orchestrator, ParallelBackend, WorkerCommand,
    evaluator_from_config,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// What a command prints on stdout and how the process exits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Text for stdout; nothing is printed when empty
    pub stdout: String,
    /// Process exit code
    pub exit_code: i32,
}

impl CommandOutput {
    /// Successful output
    #[must_use]
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            exit_code: EXIT_OK,
        }
    }

    /// Output with a specific exit code
    #[must_use]
    pub const fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = exit_code;
        self
    }
}

/// State shared by every command
#[derive(Debug, Clone)]
pub struct CommandContext {
    /// Resolved configuration
    pub config: Configuration,
    /// Explicit configuration file, forwarded to worker processes
    pub config_path: Option<PathBuf>,
    /// Print results as JSON
    pub json: bool,
    /// Cancelled on SIGINT/SIGTERM
    pub cancel: CancellationToken,
}

impl CommandContext {
    /// Resolve the configuration for a parsed command line
    ///
    /// # Errors
    ///
    /// Returns a configuration error if resolution fails.
    pub fn resolve(cli: &Cli, cancel: CancellationToken) -> Result<Self, CliError> {
        Ok(Self {
            config: resolve_config(cli.config.as_deref())?,
            config_path: cli.config.clone(),
            json: cli.json,
            cancel,
        })
    }

    /// Orchestrator over the configured file store and evaluator
    ///
    /// The process-pool backend re-invokes this executable as its worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the current executable cannot be located.
    pub fn orchestrator(&self, config: Configuration) -> Result<Orchestrator, CliError> {
        let store = Arc::new(config.open_store());
        let evaluator = evaluator_from_config(&config);
        let backend = config.parallel_backend;
        let mut orchestrator =
            Orchestrator::new(config, store, evaluator).with_cancellation(self.cancel.clone());

        if backend == ParallelBackend::ProcessPool {
            let mut worker = WorkerCommand::current_exe()?;
            if let Some(path) = &self.config_path {
                worker = worker.arg("--config").arg(path.to_string_lossy());
            }
            orchestrator = orchestrator.with_worker(worker);
        }
        Ok(orchestrator)
    }
}

/// Resolve the configuration from `path` or the default locations
///
/// # Errors
///
/// Returns a configuration error if resolution fails.
pub fn resolve_config(path: Option<&Path>) -> Result<Configuration, CliError> {
    let mut resolver = ConfigResolver::new();
    if let Some(path) = path {
        resolver = resolver.with_config_path(path);
    }
    Ok(resolver.resolve()?)
}

/// Run an asynchronous command
///
/// # Errors
///
/// Returns the command's error; failed tasks of a run are reported through
/// the exit code instead.
pub async fn execute(cli: Cli, cancel: CancellationToken) -> Result<CommandOutput, CliError> {
    let ctx = CommandContext::resolve(&cli, cancel)?;
    tracing::debug!(
        basepath = %ctx.config.basepath.display(),
        backend = %ctx.config.parallel_backend,
        "Configuration resolved"
    );

    match cli.command {
        Commands::Run(args) => run::execute(&args, &ctx).await,
        Commands::Get(args) => get::execute(&args, &ctx).await,
        Commands::Invalidate(args) => invalidate::execute(&args, &ctx),
        Commands::Status { sweep } => status::execute(sweep, &ctx),
        Commands::Config => config::execute(&ctx),
        Commands::Worker => worker::execute(&ctx.config),
    }
}
