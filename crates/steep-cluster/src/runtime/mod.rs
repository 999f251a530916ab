// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtimes and plugins.
//!
//! A runtime knows how to invoke one executable: the built-in `docker`
//! runtime wraps invocations in `docker run`, the built-in `other` runtime
//! spawns the binary directly, and plugins can contribute further runtimes.
//! Runtimes are pure execution engines - they do not touch the registry.
//!
//! The [`PluginRegistry`] also holds output adapters (keyed by data type)
//! and progress estimators (keyed by service id).

pub mod docker;
pub mod mock;
pub mod process;

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::debug;

use crate::cancel::CancelToken;
use crate::output::OutputCollector;

pub use docker::DockerRuntime;
pub use mock::{MockOutcome, MockRuntime};
pub use process::OtherRuntime;

/// Errors from invoking an executable.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RuntimeError {
    /// The executable exited non-zero (or was killed by a signal, in which
    /// case there is no exit code).
    #[error("Executable failed{}", .exit_code.map(|c| format!(" with exit code {c}")).unwrap_or_default())]
    NonZeroExit {
        /// The exit code, when the process exited normally.
        exit_code: Option<i32>,
    },

    /// The invocation was interrupted by cancellation.
    #[error("Execution cancelled")]
    Cancelled,

    /// Spawning or talking to the process failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Invokes one executable, streaming output into the collector.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Runtime identifier, matched against `Executable::runtime`.
    fn id(&self) -> &str;

    /// Run the executable to completion. Implementations must honor the
    /// cancel token by terminating the started native process.
    async fn execute(
        &self,
        executable: &steep_model::Executable,
        output: &Arc<OutputCollector>,
        cancel: &CancelToken,
    ) -> Result<(), RuntimeError>;
}

/// Turns a finished output argument into result values. Registered per
/// data type; when present it takes precedence over filesystem
/// enumeration.
#[async_trait]
pub trait OutputAdapter: Send + Sync {
    /// The data type this adapter handles.
    fn data_type(&self) -> &str;

    /// Produce the result values for an output written to `path`.
    async fn adapt(&self, path: &str) -> std::io::Result<Vec<Value>>;
}

/// Derives a fractional progress estimate from captured output lines.
/// Registered per service id.
pub trait ProgressEstimator: Send + Sync {
    /// Estimate progress in `0..=1` from the captured lines, or `None`
    /// when the lines carry no progress information.
    fn estimate(&self, lines: &[String]) -> Option<f64>;
}

/// Registered runtimes, output adapters and progress estimators.
pub struct PluginRegistry {
    runtimes: RwLock<HashMap<String, Arc<dyn Runtime>>>,
    output_adapters: RwLock<HashMap<String, Arc<dyn OutputAdapter>>>,
    progress_estimators: RwLock<HashMap<String, Arc<dyn ProgressEstimator>>>,
}

impl PluginRegistry {
    /// Create a registry with the built-in `docker` and `other` runtimes.
    pub fn with_builtins() -> Self {
        let registry = Self::empty();
        registry.register_runtime(Arc::new(DockerRuntime::default()));
        registry.register_runtime(Arc::new(OtherRuntime::new()));
        registry
    }

    /// Create a registry without any runtimes (tests register their own).
    pub fn empty() -> Self {
        Self {
            runtimes: RwLock::new(HashMap::new()),
            output_adapters: RwLock::new(HashMap::new()),
            progress_estimators: RwLock::new(HashMap::new()),
        }
    }

    /// Register (or replace) a runtime under its id.
    pub fn register_runtime(&self, runtime: Arc<dyn Runtime>) {
        let mut runtimes = self.runtimes.write().unwrap_or_else(|e| e.into_inner());
        runtimes.insert(runtime.id().to_string(), runtime);
    }

    /// Look up a runtime by id.
    pub fn runtime(&self, id: &str) -> Option<Arc<dyn Runtime>> {
        let runtimes = self.runtimes.read().unwrap_or_else(|e| e.into_inner());
        runtimes.get(id).cloned()
    }

    /// Register an output adapter for its data type.
    pub fn register_output_adapter(&self, adapter: Arc<dyn OutputAdapter>) {
        let mut adapters = self
            .output_adapters
            .write()
            .unwrap_or_else(|e| e.into_inner());
        adapters.insert(adapter.data_type().to_string(), adapter);
    }

    /// Look up the output adapter for a data type.
    pub fn output_adapter(&self, data_type: &str) -> Option<Arc<dyn OutputAdapter>> {
        let adapters = self
            .output_adapters
            .read()
            .unwrap_or_else(|e| e.into_inner());
        adapters.get(data_type).cloned()
    }

    /// Register a progress estimator for a service.
    pub fn register_progress_estimator(
        &self,
        service_id: &str,
        estimator: Arc<dyn ProgressEstimator>,
    ) {
        let mut estimators = self
            .progress_estimators
            .write()
            .unwrap_or_else(|e| e.into_inner());
        estimators.insert(service_id.to_string(), estimator);
    }

    /// Look up the progress estimator for a service.
    pub fn progress_estimator(&self, service_id: &str) -> Option<Arc<dyn ProgressEstimator>> {
        let estimators = self
            .progress_estimators
            .read()
            .unwrap_or_else(|e| e.into_inner());
        estimators.get(service_id).cloned()
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Render an executable's arguments as command-line tokens (label before
/// value where a label is declared).
pub(crate) fn argument_tokens(executable: &steep_model::Executable) -> Vec<String> {
    let mut tokens = Vec::new();
    for argument in &executable.arguments {
        if let Some(label) = &argument.label {
            tokens.push(label.clone());
        }
        tokens.push(argument.variable.value.clone());
    }
    tokens
}

fn stream_lines<R: AsyncRead + Unpin + Send + 'static>(
    reader: R,
    collector: Arc<OutputCollector>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            collector.append(line);
        }
    })
}

/// Spawn `program` with `args`, stream its stdout/stderr into the
/// collector, and wait for completion or cancellation.
pub(crate) async fn run_command(
    program: &str,
    args: &[String],
    collector: &Arc<OutputCollector>,
    cancel: &CancelToken,
) -> Result<(), RuntimeError> {
    debug!(program, ?args, "Spawning executable");

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let mut readers = Vec::new();
    if let Some(stdout) = stdout {
        readers.push(stream_lines(stdout, collector.clone()));
    }
    if let Some(stderr) = stderr {
        readers.push(stream_lines(stderr, collector.clone()));
    }

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = cancel.cancelled() => {
            child.kill().await?;
            for reader in readers {
                reader.abort();
            }
            return Err(RuntimeError::Cancelled);
        }
    };

    for reader in readers {
        let _ = reader.await;
    }

    if status.success() {
        Ok(())
    } else {
        Err(RuntimeError::NonZeroExit {
            exit_code: status.code(),
        })
    }
}
