//! ewb binary entry point

// The CLI prints command output and final errors directly
#![allow(clippy::print_stdout, clippy::print_stderr)]

use ewb_cli::cli::{self, Cli, CliError, Commands, exit_code_for, render_error};
use ewb_cli::commands::{self, CommandOutput};
use ewb_cli::shutdown::install_signal_handlers;
use ewb_cli::tracing::{TracingConfig, TracingFormat, init_tracing};
use tokio_util::sync::CancellationToken;

fn main() {
    // NOTE: tracing may be unusable during a panic, so write directly to stderr
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("Application panicked: {panic_info}");
        eprintln!("Internal error occurred. Run with RUST_LOG=debug for more information.");
    }));

    let cli = cli::parse();
    let json = cli.json;

    let tracing_config = TracingConfig {
        format: if json {
            TracingFormat::Json
        } else {
            TracingFormat::Compact
        },
        level: cli.level.into(),
        ..Default::default()
    };
    if let Err(e) = init_tracing(tracing_config) {
        eprintln!("{e:?}");
    }

    // Workers answer on stdout and never need the async runtime
    let result = if matches!(cli.command, Commands::Worker) {
        run_worker(&cli)
    } else {
        run_with_tokio(cli)
    };

    let exit_code = match result {
        Ok(output) => {
            if !output.stdout.is_empty() {
                println!("{}", output.stdout);
            }
            output.exit_code
        }
        Err(e) => {
            render_error(&e, json);
            exit_code_for(&e)
        }
    };
    std::process::exit(exit_code);
}

fn run_worker(cli: &Cli) -> Result<CommandOutput, CliError> {
    let config = commands::resolve_config(cli.config.as_deref())?;
    commands::worker::execute(&config)
}

fn run_with_tokio(cli: Cli) -> Result<CommandOutput, CliError> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| CliError::other(format!("Failed to create tokio runtime: {e}")))?;

    rt.block_on(async {
        let cancel = CancellationToken::new();
        let signals = install_signal_handlers(cancel.clone());
        let result = commands::execute(cli, cancel).await;
        signals.abort();
        result
    })
}
