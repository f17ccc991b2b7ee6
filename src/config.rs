//! Runtime configuration loaded from TOML.
//!
//! Lookup order: an explicit path, then `DYNCORE_CONFIG`, then
//! `<config dir>/dyncore/config.toml`. A missing file yields defaults.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::executor::{ExecutorOptions, PoolOptions, SandboxLimits};
use crate::query::{CompileOptions, PathPolicy};

/// Environment variable naming a config file.
pub const CONFIG_ENV: &str = "DYNCORE_CONFIG";

/// Top-level configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Store and catalog locations.
    pub database: DatabaseConfig,
    /// Compiler settings.
    pub query: QueryConfig,
    /// Sandbox settings.
    pub executor: ExecutorConfig,
}

/// `[database]`
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite database file.
    pub path: Option<PathBuf>,
    /// Schema catalog JSON file.
    pub catalog: Option<PathBuf>,
}

/// `[query]`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// What to do with paths the catalog cannot resolve.
    pub path_policy: PathPolicy,
    /// Page size when a request sets none.
    pub default_limit: u64,
    /// Alias of the root table in generated SQL.
    pub root_alias: String,
}

impl Default for QueryConfig {
    fn default() -> Self {
        let options = CompileOptions::default();
        Self {
            path_policy: options.path_policy,
            default_limit: options.default_limit,
            root_alias: options.root_alias,
        }
    }
}

impl QueryConfig {
    /// Compile options for these settings.
    pub fn compile_options(&self) -> CompileOptions {
        CompileOptions {
            path_policy: self.path_policy,
            default_limit: self.default_limit,
            root_alias: self.root_alias.clone(),
        }
    }
}

/// Worker isolation backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Isolation {
    /// One OS thread per worker.
    #[default]
    Thread,
    /// One child process per worker.
    Process,
}

/// `[executor]`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Upper bound on live workers.
    pub pool_size: usize,
    /// Workers started ahead of the first request.
    pub prewarm: usize,
    /// Default per-execution timeout.
    pub timeout_ms: u64,
    /// How long to wait for a free worker; `0` waits forever.
    pub acquire_timeout_ms: u64,
    /// Isolation backend.
    pub isolation: Isolation,
    /// Worker executable for process isolation; defaults to the running binary.
    pub worker_program: Option<PathBuf>,
    /// `[executor.sandbox]`
    pub sandbox: SandboxLimits,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            prewarm: 0,
            timeout_ms: 5_000,
            acquire_timeout_ms: 0,
            isolation: Isolation::Thread,
            worker_program: None,
            sandbox: SandboxLimits::default(),
        }
    }
}

impl ExecutorConfig {
    /// Pool settings.
    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            size: self.pool_size,
            prewarm: self.prewarm,
            acquire_timeout: (self.acquire_timeout_ms > 0)
                .then(|| Duration::from_millis(self.acquire_timeout_ms)),
            ..PoolOptions::default()
        }
    }

    /// Executor settings.
    pub fn executor_options(&self) -> ExecutorOptions {
        ExecutorOptions {
            default_timeout: Duration::from_millis(self.timeout_ms),
            limits: self.sandbox.clone(),
        }
    }
}

impl Config {
    /// Loads from the first location that names a file; defaults when that
    /// file does not exist.
    pub fn load(explicit: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = explicit
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
            .or_else(default_config_path);
        match path {
            Some(path) if path.exists() => Self::read(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Parses one file.
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The file is not valid TOML for [`Config`].
    #[error("failed to parse config {path}: {source}")]
    Parse {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: toml::de::Error,
    },
}

/// `<config dir>/dyncore/config.toml`, when the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("dyncore").join("config.toml"))
}
