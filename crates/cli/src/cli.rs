//! Command-line arguments, exit codes and error rendering

use crate::tracing::LogLevel;
use clap::{Args, Parser, Subcommand, ValueEnum};
use ewb_cache::{EvaluationRequest, ParameterSet};
use ewb_core::{Jobs, ParallelBackend};
use miette::{Diagnostic, Report};
use serde_json::Value;
use std::io::{self, Write};
use std::path::PathBuf;
use thiserror::Error;

/// Exit codes for the CLI application
pub const EXIT_OK: i32 = 0;
/// At least one task of a run failed
pub const EXIT_TASKS_FAILED: i32 = 1;
/// CLI or configuration error exit code
pub const EXIT_CLI: i32 = 2;
/// Evaluation or cache error exit code
pub const EXIT_EVAL: i32 = 3;
/// Exit code after an interrupt (128 + SIGINT)
pub const EXIT_SIGINT: i32 = 130;

// ============================================================================
// Errors
// ============================================================================

/// CLI-specific error types with proper exit code mapping
#[derive(Error, Debug, Clone, Diagnostic)]
pub enum CliError {
    /// CLI or configuration error (exit code 2)
    #[error("{message}")]
    #[diagnostic(code(ewb::cli::config))]
    Config {
        /// The error message
        message: String,
        /// Optional help text
        #[help]
        help: Option<String>,
    },
    /// Evaluation or cache error (exit code 3)
    #[error("{message}")]
    #[diagnostic(code(ewb::cli::eval))]
    Eval {
        /// The error message
        message: String,
        /// Optional help text
        #[help]
        help: Option<String>,
    },
    /// Other unexpected error (exit code 3)
    #[error("Unexpected error: {message}")]
    #[diagnostic(code(ewb::cli::other))]
    Other {
        /// The error message
        message: String,
        /// Optional help text
        #[help]
        help: Option<String>,
    },
}

impl CliError {
    /// Create a new configuration error
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            help: None,
        }
    }

    /// Create a new configuration error with help text
    #[must_use]
    pub fn config_with_help(message: impl Into<String>, help: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            help: Some(help.into()),
        }
    }

    /// Create a new evaluation error
    #[must_use]
    pub fn eval(message: impl Into<String>) -> Self {
        Self::Eval {
            message: message.into(),
            help: None,
        }
    }

    /// Create a new evaluation error with help text
    #[must_use]
    pub fn eval_with_help(message: impl Into<String>, help: impl Into<String>) -> Self {
        Self::Eval {
            message: message.into(),
            help: Some(help.into()),
        }
    }

    /// Create a new other error
    #[must_use]
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
            help: None,
        }
    }

    /// Create a new other error with help text
    #[must_use]
    pub fn other_with_help(message: impl Into<String>, help: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
            help: Some(help.into()),
        }
    }
}

/// Convert `ewb_core::Error` to the matching `CliError` category.
impl From<ewb_core::Error> for CliError {
    fn from(err: ewb_core::Error) -> Self {
        match err {
            ewb_core::Error::Configuration { message, path } => match path {
                Some(path) => Self::config_with_help(
                    message,
                    format!("Fix or remove {}", path.display()),
                ),
                None => Self::config(message),
            },
            ewb_core::Error::Cache(cache) => Self::from(cache),
            ewb_core::Error::Graph(_) => Self::eval(err.to_string()),
            ewb_core::Error::Evaluation { ref kind, .. } if kind == "evaluation:not_configured" => {
                Self::config_with_help(
                    err.to_string(),
                    "Set [evaluation] command in config.toml",
                )
            }
            ewb_core::Error::Evaluation { .. } => Self::eval(err.to_string()),
            ewb_core::Error::Io {
                source,
                path,
                operation,
            } => {
                let path_str = path
                    .as_ref()
                    .map_or(String::new(), |p| format!(" on {}", p.display()));
                Self::other_with_help(
                    format!("I/O {operation} failed{path_str}: {source}"),
                    "Check file permissions and ensure the path exists",
                )
            }
        }
    }
}

impl From<ewb_cache::Error> for CliError {
    fn from(err: ewb_cache::Error) -> Self {
        match err {
            ewb_cache::Error::Miss { .. } => {
                Self::eval_with_help(err.to_string(), "Compute it with `ewb get` or `ewb run`")
            }
            ewb_cache::Error::LockTimeout { .. } => Self::eval_with_help(
                err.to_string(),
                "Another process is computing this key; retry later or remove its lock file",
            ),
            ewb_cache::Error::Corrupt { .. } | ewb_cache::Error::Conflict { .. } => {
                Self::eval(err.to_string())
            }
            ewb_cache::Error::Io { .. } | ewb_cache::Error::Serialization { .. } => {
                Self::other(err.to_string())
            }
        }
    }
}

/// Map CLI error to appropriate exit code
#[must_use]
pub const fn exit_code_for(err: &CliError) -> i32 {
    match err {
        CliError::Config { .. } => EXIT_CLI,
        CliError::Eval { .. } | CliError::Other { .. } => EXIT_EVAL,
    }
}

/// Render error appropriately based on JSON flag
#[allow(clippy::print_stdout, clippy::print_stderr)]
pub fn render_error(err: &CliError, json_mode: bool) {
    if json_mode {
        let envelope = serde_json::json!({
            "status": "error",
            "error": {
                "code": match err {
                    CliError::Config { .. } => "config",
                    CliError::Eval { .. } => "eval",
                    CliError::Other { .. } => "other",
                },
                "message": err.to_string(),
            }
        });
        println!("{envelope}");
    } else {
        let report = Report::new(err.clone());
        eprintln!("{report:?}");
        let _ = io::stderr().flush();
    }
}

// ============================================================================
// Arguments
// ============================================================================

/// Extreme weather forecast evaluation with cached results
#[derive(Parser, Debug)]
#[command(name = "ewb")]
#[command(about = "Evaluate forecast models on extreme weather events, caching every result")]
#[command(version)]
pub struct Cli {
    /// Command to run
    #[command(subcommand)]
    pub command: Commands,

    /// Logging level
    #[arg(
        short = 'l',
        long,
        global = true,
        help = "Set logging level",
        default_value = "warn",
        value_enum
    )]
    pub level: LogLevel,

    /// JSON logs and results
    #[arg(long, global = true, help = "Output logs and results as JSON")]
    pub json: bool,

    /// Configuration file
    #[arg(
        long,
        global = true,
        value_name = "PATH",
        help = "Configuration file (default: ./config.toml, then ~/.config/ewb-paper/config.toml)"
    )]
    pub config: Option<PathBuf>,
}

/// Subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Evaluate the selected models for an event type
    #[command(about = "Evaluate forecast models for an event type and cache the results")]
    Run(RunArgs),
    /// Print one payload
    #[command(about = "Print the result of one evaluation, computing it if needed")]
    Get(KeyArgs),
    /// Remove one artifact
    #[command(about = "Remove the cached result of one evaluation")]
    Invalidate(KeyArgs),
    /// List cached artifacts
    #[command(about = "List cached results")]
    Status {
        /// Remove interrupted writes
        #[arg(long, help = "Remove temporary files left by interrupted writes")]
        sweep: bool,
    },
    /// Print the resolved configuration
    #[command(about = "Print the resolved configuration")]
    Config,
    /// Evaluate one request from stdin (process-pool worker)
    #[command(name = "__worker", hide = true)]
    Worker,
}

/// Supported extreme weather event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EventType {
    /// Heat waves
    #[value(name = "heat_wave", alias = "heat-wave")]
    HeatWave,
    /// Freeze events
    #[value(name = "freeze")]
    Freeze,
    /// Severe convection
    #[value(name = "severe_convection", alias = "severe-convection")]
    SevereConvection,
    /// Atmospheric rivers
    #[value(name = "atmospheric_river", alias = "atmospheric-river")]
    AtmosphericRiver,
    /// Tropical cyclones
    #[value(name = "tropical_cyclone", alias = "tropical-cyclone")]
    TropicalCyclone,
}

impl EventType {
    /// Identifier used in evaluation requests
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::HeatWave => "heat_wave",
            Self::Freeze => "freeze",
            Self::SevereConvection => "severe_convection",
            Self::AtmosphericRiver => "atmospheric_river",
            Self::TropicalCyclone => "tropical_cyclone",
        }
    }

    /// Variable evaluated when none is given
    #[must_use]
    pub const fn default_variable(self) -> &'static str {
        match self {
            Self::HeatWave | Self::Freeze => "surface_air_temperature",
            Self::SevereConvection => "craven_brooks_significant_severe",
            Self::AtmosphericRiver => "integrated_vapor_transport",
            Self::TropicalCyclone => "air_pressure_at_mean_sea_level",
        }
    }
}

/// Supported forecast models
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Model {
    /// ECMWF AIFS
    Aifs,
    /// ECMWF HRES
    Hres,
    /// Pangu-Weather
    Pangu,
    /// FourCastNet v2
    Fourv2,
    /// GraphCast
    #[value(alias = "gc")]
    Graphcast,
}

impl Model {
    /// Identifier used in evaluation requests
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Aifs => "aifs",
            Self::Hres => "hres",
            Self::Pangu => "pangu",
            Self::Fourv2 => "fourv2",
            Self::Graphcast => "graphcast",
        }
    }
}

/// Parallel backend override
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendArg {
    /// One task at a time
    Sequential,
    /// Worker threads in this process
    ThreadPool,
    /// One worker process per task
    ProcessPool,
}

impl From<BackendArg> for ParallelBackend {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Sequential => Self::Sequential,
            BackendArg::ThreadPool => Self::ThreadPool,
            BackendArg::ProcessPool => Self::ProcessPool,
        }
    }
}

/// Evaluation parameters shared by several subcommands
#[derive(Args, Debug, Clone, Default)]
pub struct ParamArgs {
    /// Evaluation parameters
    #[arg(
        long = "param",
        value_name = "KEY=VALUE",
        value_parser = parse_param,
        help = "Evaluation parameter; VALUE is read as JSON when it parses, else as a string"
    )]
    pub params: Vec<(String, Value)>,
}

impl ParamArgs {
    /// The parameters as a set
    #[must_use]
    pub fn parameter_set(&self) -> ParameterSet {
        self.params
            .iter()
            .fold(ParameterSet::new(), |set, (name, value)| {
                set.with(name.clone(), value.clone())
            })
    }
}

/// Arguments of `ewb run`
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Event type to evaluate
    #[arg(value_enum)]
    pub event_type: EventType,

    /// Evaluate AIFS
    #[arg(long)]
    pub run_aifs: bool,
    /// Evaluate HRES
    #[arg(long)]
    pub run_hres: bool,
    /// Evaluate Pangu-Weather
    #[arg(long)]
    pub run_pangu: bool,
    /// Evaluate FourCastNet v2
    #[arg(long)]
    pub run_fourv2: bool,
    /// Evaluate GraphCast
    #[arg(long)]
    pub run_gc: bool,

    /// Variables to evaluate
    #[arg(
        long = "variable",
        value_name = "NAME",
        help = "Variable to evaluate (repeatable; default depends on the event type)"
    )]
    pub variables: Vec<String>,

    /// Evaluation parameters
    #[command(flatten)]
    pub params: ParamArgs,

    /// Worker count override
    #[arg(long, value_name = "N", value_parser = parse_jobs, help = "Worker count, or \"auto\"")]
    pub n_jobs: Option<Jobs>,

    /// Backend override
    #[arg(long, value_enum, help = "Parallel backend")]
    pub backend: Option<BackendArg>,
}

impl RunArgs {
    /// Models selected by `--run-*` flags, in flag order
    #[must_use]
    pub fn models(&self) -> Vec<Model> {
        [
            (self.run_aifs, Model::Aifs),
            (self.run_hres, Model::Hres),
            (self.run_pangu, Model::Pangu),
            (self.run_fourv2, Model::Fourv2),
            (self.run_gc, Model::Graphcast),
        ]
        .into_iter()
        .filter_map(|(selected, model)| selected.then_some(model))
        .collect()
    }

    /// Variables to evaluate, falling back to the event type's default
    #[must_use]
    pub fn variables(&self) -> Vec<String> {
        if self.variables.is_empty() {
            vec![self.event_type.default_variable().to_string()]
        } else {
            self.variables.clone()
        }
    }
}

/// Arguments naming a single evaluation
#[derive(Args, Debug, Clone)]
pub struct KeyArgs {
    /// Event type
    #[arg(value_enum)]
    pub event_type: EventType,
    /// Forecast model
    #[arg(value_enum)]
    pub model: Model,
    /// Variable name
    pub variable: String,
    /// Evaluation parameters
    #[command(flatten)]
    pub params: ParamArgs,
}

impl KeyArgs {
    /// The request these arguments name
    #[must_use]
    pub fn request(&self) -> EvaluationRequest {
        EvaluationRequest::new(
            self.event_type.as_str(),
            self.model.as_str(),
            self.variable.as_str(),
            self.params.parameter_set(),
        )
    }
}

fn parse_param(raw: &str) -> Result<(String, Value), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("parameter name is empty in '{raw}'"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.to_string(), value))
}

fn parse_jobs(raw: &str) -> Result<Jobs, String> {
    raw.parse::<Jobs>().map_err(|e| e.to_string())
}

/// Parse the process arguments
#[must_use]
pub fn parse() -> Cli {
    Cli::parse()
}
