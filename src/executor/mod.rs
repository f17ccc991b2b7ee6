#![forbid(unsafe_code)]

//! Sandboxed handler execution.
//!
//! A [`HandlerExecutor`] leases a worker from a bounded [`WorkerPool`], ships
//! it a script and its [`ScriptContext`], and services the worker's remote
//! calls against a [`Capabilities`] implementation until the script finishes
//! or the wall-clock timeout fires. A timed-out or misbehaving worker is
//! killed and never returns to the pool.

/// Host capabilities reachable from scripts.
pub mod capabilities;

/// Bounded worker pool.
pub mod pool;

/// Wire messages and framing.
pub mod protocol;

/// Worker-side script evaluation.
pub mod runner;

/// Worker handles and isolation backends.
pub mod worker;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as Json;
use thiserror::Error;
use tracing::{debug, warn};

pub use capabilities::{Capabilities, HostCapabilities};
pub use pool::{PoolOptions, WorkerLease, WorkerPool};
pub use protocol::{CallError, ScriptContext};
pub use runner::SandboxLimits;
pub use worker::{ProcessSpawner, ThreadSpawner, WorkerSpawner};

use protocol::{HostMessage, WorkerMessage};

/// Why an execution did not produce a value.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    /// The script ran past its deadline; the worker was killed.
    #[error("execution timed out after {timeout_ms} ms")]
    Timeout {
        /// Deadline that fired.
        timeout_ms: u64,
    },
    /// The script failed with status 400.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// The script failed with status 401.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// The script failed with status 403.
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// The script failed without a recognised status.
    #[error("script error: {message}")]
    Internal {
        /// Message thrown by the script.
        message: String,
        /// Interpreter diagnostics, when available.
        stack: Option<String>,
    },
    /// The worker broke the protocol or went away mid-execution.
    #[error("worker transport error: {0}")]
    Transport(String),
    /// A worker could not be started.
    #[error("failed to start worker: {0}")]
    Spawn(String),
    /// No worker freed up before the acquire timeout.
    #[error("no worker available")]
    AcquireTimeout,
    /// The pool is shutting down.
    #[error("worker pool is shut down")]
    PoolClosed,
}

impl ExecutionError {
    /// Maps a script failure's status code to an error kind.
    pub fn from_script(status_code: Option<u16>, message: String, stack: Option<String>) -> Self {
        match status_code {
            Some(400) => ExecutionError::BadRequest(message),
            Some(401) => ExecutionError::Unauthorized(message),
            Some(403) => ExecutionError::Forbidden(message),
            _ => ExecutionError::Internal { message, stack },
        }
    }

    /// HTTP-style status code the outer transport layer should report.
    pub fn status_code(&self) -> u16 {
        match self {
            ExecutionError::BadRequest(_) => 400,
            ExecutionError::Unauthorized(_) => 401,
            ExecutionError::Forbidden(_) => 403,
            ExecutionError::Timeout { .. } => 504,
            ExecutionError::AcquireTimeout | ExecutionError::PoolClosed => 503,
            ExecutionError::Internal { .. }
            | ExecutionError::Transport(_)
            | ExecutionError::Spawn(_) => 500,
        }
    }

    /// Machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            ExecutionError::Timeout { .. } => "ExecutionTimeout",
            ExecutionError::BadRequest(_) => "BadRequest",
            ExecutionError::Unauthorized(_) => "Unauthorized",
            ExecutionError::Forbidden(_) => "Forbidden",
            ExecutionError::Internal { .. } => "ScriptRuntimeError",
            ExecutionError::Transport(_) => "TransportError",
            ExecutionError::Spawn(_) => "SpawnError",
            ExecutionError::AcquireTimeout => "AcquireTimeout",
            ExecutionError::PoolClosed => "PoolClosed",
        }
    }
}

/// One script to run.
#[derive(Clone, Debug, Default)]
pub struct ExecutionRequest {
    /// Rhai source.
    pub script: String,
    /// Values and names exposed to the script.
    pub context: ScriptContext,
    /// Overrides the executor's default timeout.
    pub timeout: Option<Duration>,
}

impl ExecutionRequest {
    /// Request for `script` with an empty context.
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            ..Self::default()
        }
    }

    /// Sets the script context.
    pub fn with_context(mut self, context: ScriptContext) -> Self {
        self.context = context;
        self
    }

    /// Sets the wall-clock timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Executor-wide settings.
#[derive(Clone, Debug)]
pub struct ExecutorOptions {
    /// Timeout for requests that do not set one.
    pub default_timeout: Duration,
    /// Interpreter limits sent with every script.
    pub limits: SandboxLimits,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(5),
            limits: SandboxLimits::default(),
        }
    }
}

enum Outcome {
    Done(Json),
    Failed(ExecutionError),
}

/// Runs scripts on pooled workers.
pub struct HandlerExecutor {
    pool: Arc<WorkerPool>,
    capabilities: Arc<dyn Capabilities>,
    options: ExecutorOptions,
    next_execution: AtomicU64,
}

impl HandlerExecutor {
    /// Executor over `pool`, serving calls with `capabilities`.
    pub fn new(
        pool: Arc<WorkerPool>,
        capabilities: Arc<dyn Capabilities>,
        options: ExecutorOptions,
    ) -> Self {
        Self {
            pool,
            capabilities,
            options,
            next_execution: AtomicU64::new(1),
        }
    }

    /// Underlying pool.
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Runs one script to completion, failure, or timeout.
    pub async fn run(&self, request: ExecutionRequest) -> Result<Json, ExecutionError> {
        let deadline = request.timeout.unwrap_or(self.options.default_timeout);
        let mut lease = self.pool.acquire().await?;
        let execution_id = self.next_execution.fetch_add(1, Ordering::SeqCst);
        let worker = lease.id();

        let mut context = request.context;
        context.tables = self.capabilities.tables();
        context.helpers = self.capabilities.helper_names();
        lease.send(HostMessage::Execute {
            execution_id,
            script: request.script,
            context: context.clone(),
            limits: self.options.limits.clone(),
        })?;
        debug!(execution_id, worker, "execution started");

        match tokio::time::timeout(deadline, self.drive(&mut lease, execution_id, &context)).await {
            Err(_) => {
                let timeout_ms = u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX);
                warn!(execution_id, worker, timeout_ms, "execution timed out; killing worker");
                lease.kill();
                Err(ExecutionError::Timeout { timeout_ms })
            }
            Ok(Ok(Outcome::Done(data))) => {
                debug!(execution_id, worker, "execution completed");
                lease.release();
                Ok(data)
            }
            Ok(Ok(Outcome::Failed(err))) => {
                debug!(execution_id, worker, error = %err, "execution failed");
                lease.release();
                Err(err)
            }
            Ok(Err(err)) => {
                warn!(execution_id, worker, error = %err, "worker transport failed; killing worker");
                lease.kill();
                Err(err)
            }
        }
    }

    /// Stops accepting executions and stops idle workers.
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }

    async fn drive(
        &self,
        lease: &mut WorkerLease,
        execution_id: u64,
        context: &ScriptContext,
    ) -> Result<Outcome, ExecutionError> {
        loop {
            match lease.recv().await? {
                WorkerMessage::Call {
                    execution_id: id,
                    call_id,
                    path,
                    args,
                } if id == execution_id => {
                    let (result, error) = match self.capabilities.invoke(context, &path, args).await {
                        Ok(value) => (Some(value), None),
                        Err(err) => (None, Some(err)),
                    };
                    lease.send(HostMessage::CallResult {
                        execution_id,
                        call_id,
                        result,
                        error,
                    })?;
                }
                WorkerMessage::Done {
                    execution_id: id,
                    data,
                } if id == execution_id => return Ok(Outcome::Done(data)),
                WorkerMessage::Error {
                    execution_id: id,
                    message,
                    stack,
                    status_code,
                } if id == execution_id => {
                    return Ok(Outcome::Failed(ExecutionError::from_script(
                        status_code,
                        message,
                        stack,
                    )))
                }
                other => {
                    return Err(ExecutionError::Transport(format!(
                        "unexpected {other:?} during execution {execution_id}"
                    )))
                }
            }
        }
    }
}
