//! Configuration for ewb
//!
//! A [`Configuration`] is resolved once per process from three layers, highest
//! precedence first:
//!
//! 1. `EWB_PAPER_BASEPATH` (overrides `paths.basepath` only)
//! 2. A TOML configuration file
//! 3. Built-in defaults
//!
//! ```toml
//! [paths]
//! basepath = "~/extreme-weather-bench-paper"
//!
//! [parallel]
//! backend = "process-pool"   # sequential | thread-pool | process-pool
//! n_jobs = 32                # positive integer or "auto"
//!
//! [evaluation]
//! command = ["python", "-m", "ewb_bridge"]
//!
//! [cache]
//! lock_timeout_secs = 300
//! ```
//!
//! Resolution is split into gathering [`ConfigInputs`] (environment and file
//! system) and the pure [`resolve_from_inputs`].

use crate::{Error, Result};
use ewb_cache::{FsCacheStore, KeyLock};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Environment variable overriding the base path
pub const BASEPATH_ENV: &str = "EWB_PAPER_BASEPATH";

/// Base path used when neither the environment nor the file sets one
pub const DEFAULT_BASEPATH: &str = "~/extreme-weather-bench-paper";

/// Worker count used when the file does not set one
pub const DEFAULT_N_JOBS: usize = 32;

/// Lock timeout used when the file does not set one
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 300;

/// Configuration file name searched in the working directory
pub const LOCAL_CONFIG_FILE: &str = "config.toml";

/// How pending tasks are executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParallelBackend {
    /// One task at a time on a blocking thread
    Sequential,
    /// Blocking worker threads inside this process
    #[serde(alias = "threading")]
    ThreadPool,
    /// One worker process per task
    #[default]
    #[serde(alias = "loky", alias = "multiprocessing")]
    ProcessPool,
}

impl ParallelBackend {
    /// Canonical name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::ThreadPool => "thread-pool",
            Self::ProcessPool => "process-pool",
        }
    }
}

impl fmt::Display for ParallelBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ParallelBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sequential" => Ok(Self::Sequential),
            "thread-pool" | "threading" => Ok(Self::ThreadPool),
            "process-pool" | "loky" | "multiprocessing" => Ok(Self::ProcessPool),
            other => Err(Error::configuration(format!(
                "Unknown parallel backend '{other}' (expected sequential, thread-pool or process-pool)"
            ))),
        }
    }
}

/// Number of concurrent workers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Jobs {
    /// Match the host's available parallelism
    Auto,
    /// Fixed worker count
    Fixed(NonZeroUsize),
}

impl Jobs {
    /// Parse a signed count, rejecting non-positive values
    pub fn from_count(count: i64) -> Result<Self> {
        usize::try_from(count)
            .ok()
            .and_then(NonZeroUsize::new)
            .map(Self::Fixed)
            .ok_or_else(|| {
                Error::configuration(format!("n_jobs must be a positive integer, got {count}"))
            })
    }

    /// Worker count to use on this host
    #[must_use]
    pub fn effective(self) -> usize {
        match self {
            Self::Auto => std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
            Self::Fixed(n) => n.get(),
        }
    }
}

impl Default for Jobs {
    fn default() -> Self {
        Self::Fixed(NonZeroUsize::new(DEFAULT_N_JOBS).unwrap_or(NonZeroUsize::MIN))
    }
}

impl fmt::Display for Jobs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::Fixed(n) => write!(f, "{n}"),
        }
    }
}

impl FromStr for Jobs {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("auto") {
            return Ok(Self::Auto);
        }
        let count: i64 = s
            .trim()
            .parse()
            .map_err(|_| Error::configuration(format!("n_jobs must be an integer or \"auto\", got '{s}'")))?;
        Self::from_count(count)
    }
}

impl Serialize for Jobs {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Auto => serializer.serialize_str("auto"),
            Self::Fixed(n) => serializer.serialize_u64(u64::try_from(n.get()).unwrap_or(u64::MAX)),
        }
    }
}

/// Resolved, immutable configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Configuration {
    /// Root of all data written by ewb
    pub basepath: PathBuf,
    /// Where cached artifacts and locks live (`basepath/saved_data`)
    pub saved_data_path: PathBuf,
    /// How pending tasks are executed
    pub parallel_backend: ParallelBackend,
    /// Worker count for pooled backends
    pub n_jobs: Jobs,
    /// Command line of the external evaluator, if configured
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluator_command: Option<Vec<String>>,
    /// How long to wait for another process computing the same key
    pub lock_timeout_secs: u64,
}

impl Configuration {
    /// Configuration with all defaults under the given base path
    #[must_use]
    pub fn with_basepath(basepath: impl Into<PathBuf>) -> Self {
        let basepath = basepath.into();
        Self {
            saved_data_path: basepath.join("saved_data"),
            basepath,
            parallel_backend: ParallelBackend::default(),
            n_jobs: Jobs::default(),
            evaluator_command: None,
            lock_timeout_secs: DEFAULT_LOCK_TIMEOUT_SECS,
        }
    }

    /// Copy with a different backend
    #[must_use]
    pub const fn with_backend(mut self, backend: ParallelBackend) -> Self {
        self.parallel_backend = backend;
        self
    }

    /// Copy with a different worker count
    #[must_use]
    pub const fn with_jobs(mut self, jobs: Jobs) -> Self {
        self.n_jobs = jobs;
        self
    }

    /// Copy with an evaluator command
    #[must_use]
    pub fn with_evaluator_command(mut self, argv: Vec<String>) -> Self {
        self.evaluator_command = Some(argv);
        self
    }

    /// Copy with a different lock timeout
    #[must_use]
    pub const fn with_lock_timeout_secs(mut self, secs: u64) -> Self {
        self.lock_timeout_secs = secs;
        self
    }

    /// Number of tasks that may run at once
    ///
    /// Capped at the largest permit count a tokio semaphore accepts.
    #[must_use]
    pub fn effective_parallelism(&self) -> usize {
        match self.parallel_backend {
            ParallelBackend::Sequential => 1,
            ParallelBackend::ThreadPool | ParallelBackend::ProcessPool => {
                self.n_jobs.effective().min(Semaphore::MAX_PERMITS)
            }
        }
    }

    /// Lock acquisition timeout
    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    /// Directory holding artifacts
    #[must_use]
    pub fn artifacts_dir(&self) -> PathBuf {
        self.saved_data_path.join("artifacts")
    }

    /// Directory holding per-key lock files
    #[must_use]
    pub fn locks_dir(&self) -> PathBuf {
        self.saved_data_path.join("locks")
    }

    /// Filesystem store rooted at [`Self::artifacts_dir`]
    #[must_use]
    pub fn open_store(&self) -> FsCacheStore {
        FsCacheStore::new(self.artifacts_dir())
    }

    /// Key lock manager rooted at [`Self::locks_dir`]
    #[must_use]
    pub fn key_lock(&self) -> KeyLock {
        KeyLock::new(self.locks_dir()).with_timeout(self.lock_timeout())
    }
}

// ============================================================================
// File model
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    paths: PathsSection,
    #[serde(default)]
    parallel: ParallelSection,
    #[serde(default)]
    evaluation: EvaluationSection,
    #[serde(default)]
    cache: CacheSection,
}

#[derive(Debug, Default, Deserialize)]
struct PathsSection {
    basepath: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ParallelSection {
    backend: Option<ParallelBackend>,
    n_jobs: Option<RawJobs>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawJobs {
    Count(i64),
    Word(String),
}

#[derive(Debug, Default, Deserialize)]
struct EvaluationSection {
    command: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct CacheSection {
    lock_timeout_secs: Option<u64>,
}

// ============================================================================
// Resolution
// ============================================================================

/// Everything configuration resolution reads from the outside world
#[derive(Debug, Clone, Default)]
pub struct ConfigInputs {
    /// Configuration file path and contents, if one was found
    pub file: Option<(PathBuf, String)>,
    /// Value of `EWB_PAPER_BASEPATH`, if set
    pub env_basepath: Option<String>,
    /// Home directory, for `~` expansion
    pub home_dir: Option<PathBuf>,
}

/// Resolve a configuration from explicit inputs
///
/// # Errors
///
/// Returns a configuration error if the file is malformed, names an unknown
/// backend, sets a non-positive `n_jobs` or an empty evaluator command, or if
/// a `~` path cannot be expanded.
pub fn resolve_from_inputs(inputs: &ConfigInputs) -> Result<Configuration> {
    let file = match &inputs.file {
        Some((path, contents)) => toml::from_str::<ConfigFile>(contents)
            .map_err(|e| Error::configuration_at(path, format!("{}: {e}", path.display())))?,
        None => ConfigFile::default(),
    };

    let raw_basepath = inputs
        .env_basepath
        .as_deref()
        .filter(|v| !v.is_empty())
        .or(file.paths.basepath.as_deref())
        .unwrap_or(DEFAULT_BASEPATH);
    let basepath = expand_home(raw_basepath, inputs.home_dir.as_deref())?;

    let n_jobs = match file.parallel.n_jobs {
        None => Jobs::default(),
        Some(RawJobs::Count(n)) => Jobs::from_count(n)?,
        Some(RawJobs::Word(w)) => w.parse()?,
    };

    if let Some(argv) = &file.evaluation.command
        && argv.first().is_none_or(String::is_empty)
    {
        return Err(Error::configuration(
            "evaluation.command must name a program",
        ));
    }

    let mut config = Configuration::with_basepath(basepath)
        .with_backend(file.parallel.backend.unwrap_or_default())
        .with_jobs(n_jobs)
        .with_lock_timeout_secs(
            file.cache
                .lock_timeout_secs
                .unwrap_or(DEFAULT_LOCK_TIMEOUT_SECS),
        );
    if let Some(argv) = file.evaluation.command {
        config = config.with_evaluator_command(argv);
    }
    Ok(config)
}

fn expand_home(raw: &str, home: Option<&Path>) -> Result<PathBuf> {
    let rest = if raw == "~" {
        ""
    } else if let Some(rest) = raw.strip_prefix("~/") {
        rest
    } else {
        return Ok(PathBuf::from(raw));
    };
    let home = home.ok_or_else(|| {
        Error::configuration(format!("Cannot expand '{raw}': home directory is unknown"))
    })?;
    Ok(if rest.is_empty() {
        home.to_path_buf()
    } else {
        home.join(rest)
    })
}

/// Gathers configuration inputs from the environment and resolves them
#[derive(Debug, Clone, Default)]
pub struct ConfigResolver {
    explicit_path: Option<PathBuf>,
    search_dir: Option<PathBuf>,
    home_dir: Option<PathBuf>,
}

impl ConfigResolver {
    /// Resolver using the process environment
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use this file instead of searching; it must exist
    #[must_use]
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.explicit_path = Some(path.into());
        self
    }

    /// Search for `config.toml` here instead of the working directory
    #[must_use]
    pub fn with_search_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.search_dir = Some(dir.into());
        self
    }

    /// Use this home directory instead of the user's
    #[must_use]
    pub fn with_home_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.home_dir = Some(dir.into());
        self
    }

    /// Files consulted when no explicit path is given, in order
    #[must_use]
    pub fn candidates(&self) -> Vec<PathBuf> {
        let mut candidates = Vec::new();
        match &self.search_dir {
            Some(dir) => candidates.push(dir.join(LOCAL_CONFIG_FILE)),
            None => candidates.push(PathBuf::from(LOCAL_CONFIG_FILE)),
        }
        if let Some(home) = self.home() {
            candidates.push(home.join(".config").join("ewb-paper").join("config.toml"));
        }
        candidates
    }

    /// Collect the inputs for [`resolve_from_inputs`]
    ///
    /// # Errors
    ///
    /// Returns an error if the explicit file is missing or a found file cannot be read.
    pub fn gather(&self) -> Result<ConfigInputs> {
        let file = match &self.explicit_path {
            Some(path) => {
                if !path.is_file() {
                    return Err(Error::configuration_at(
                        path,
                        format!("Configuration file {} does not exist", path.display()),
                    ));
                }
                Some(read_config(path)?)
            }
            None => match self.candidates().into_iter().find(|p| p.is_file()) {
                Some(path) => Some(read_config(&path)?),
                None => None,
            },
        };

        Ok(ConfigInputs {
            file,
            env_basepath: std::env::var(BASEPATH_ENV).ok(),
            home_dir: self.home(),
        })
    }

    /// Gather inputs and resolve them
    ///
    /// # Errors
    ///
    /// See [`Self::gather`] and [`resolve_from_inputs`].
    pub fn resolve(&self) -> Result<Configuration> {
        let inputs = self.gather()?;
        if let Some((path, _)) = &inputs.file {
            tracing::debug!(path = %path.display(), "Using configuration file");
        }
        resolve_from_inputs(&inputs)
    }

    fn home(&self) -> Option<PathBuf> {
        self.home_dir.clone().or_else(dirs::home_dir)
    }
}

fn read_config(path: &Path) -> Result<(PathBuf, String)> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::InvalidData {
            Error::configuration_at(path, "Configuration file is not valid UTF-8")
        } else {
            Error::io(e, path, "read")
        }
    })?;
    Ok((path.to_path_buf(), contents))
}
