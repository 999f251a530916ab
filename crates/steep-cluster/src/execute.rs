// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Chain execution.
//!
//! Runs one process chain: prepares output directories, invokes the
//! executables strictly in order through their runtimes, applies
//! per-executable retry policies, reports progress, and collects the
//! output values.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use steep_model::{
    Argument, ArgumentType, ArgumentVariable, Executable, ProcessChain, RetryCondition,
    RetryPolicy, RUNTIME_OTHER,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bus::{addresses, EventBus};
use crate::cancel::CancelToken;
use crate::messages::ProgressReport;
use crate::mkdir_cache;
use crate::output::OutputCollector;
use crate::runtime::{PluginRegistry, RuntimeError};

/// At most this many directories per synthesized `mkdir -p` invocation.
const MKDIR_BATCH_SIZE: usize = 100;

/// Terminal failure of a chain execution.
#[derive(Debug, Clone, Error)]
pub enum ExecuteError {
    /// An executable failed after exhausting its retries, or output
    /// collection failed.
    #[error("{message}")]
    Execution {
        /// Failure description.
        message: String,
        /// Last captured output lines, if any.
        last_output: Option<String>,
        /// Exit code, when the executable exited normally.
        exit_code: Option<i32>,
    },

    /// The chain was interrupted.
    #[error("Execution cancelled")]
    Cancelled,
}

impl ExecuteError {
    /// Render the persisted error message:
    /// message, exit code and last output separated by blank lines, each
    /// part only when present.
    pub fn formatted_message(&self) -> String {
        match self {
            Self::Cancelled => "Execution cancelled".to_string(),
            Self::Execution {
                message,
                last_output,
                exit_code,
            } => {
                let mut parts = vec![message.clone()];
                if let Some(code) = exit_code {
                    parts.push(format!("Exit code: {code}"));
                }
                if let Some(output) = last_output {
                    parts.push(output.clone());
                }
                parts.join("\n\n")
            }
        }
    }
}

/// Publishes rounded progress values for one chain, monotonically.
pub struct ProgressReporter {
    bus: Arc<dyn EventBus>,
    chain_id: String,
    last: Mutex<Option<f64>>,
}

impl ProgressReporter {
    /// Create a reporter for the given chain.
    pub fn new(bus: Arc<dyn EventBus>, chain_id: impl Into<String>) -> Self {
        Self {
            bus,
            chain_id: chain_id.into(),
            last: Mutex::new(None),
        }
    }

    /// The last published estimate.
    pub fn last(&self) -> Option<f64> {
        *self.last.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Publish `progress` rounded to two decimals, if it increased.
    pub async fn report(&self, progress: f64) {
        let rounded = (progress.clamp(0.0, 1.0) * 100.0).round() / 100.0;
        {
            let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
            if last.is_some_and(|l| rounded <= l) {
                return;
            }
            *last = Some(rounded);
        }
        let report = ProgressReport {
            process_chain_id: self.chain_id.clone(),
            estimated_progress: Some(rounded),
        };
        if let Ok(body) = serde_json::to_value(&report) {
            self.bus
                .publish(addresses::PROCESS_CHAIN_PROGRESS, body)
                .await;
        }
    }
}

/// Executes process chains on the local node.
pub struct ChainExecutor {
    plugins: Arc<PluginRegistry>,
    output_lines_to_collect: usize,
}

impl ChainExecutor {
    /// Create an executor using the given plugins, capturing the last
    /// `output_lines_to_collect` lines per executable.
    pub fn new(plugins: Arc<PluginRegistry>, output_lines_to_collect: usize) -> Self {
        Self {
            plugins,
            output_lines_to_collect,
        }
    }

    /// Execute the chain and return its output values (output variable id
    /// to concrete values).
    pub async fn execute(
        &self,
        chain: &ProcessChain,
        cancel: &CancelToken,
        reporter: &Arc<ProgressReporter>,
    ) -> Result<HashMap<String, Vec<Value>>, ExecuteError> {
        info!(
            process_chain_id = %chain.id,
            executables = chain.executables.len(),
            "Executing process chain"
        );

        for mkdir in mkdir_executables(chain) {
            if cancel.is_cancelled() {
                return Err(ExecuteError::Cancelled);
            }
            self.run_with_retries(&mkdir, cancel).await.map(|_| ())?;
        }

        let total = chain.executables.len().max(1);
        for (index, executable) in chain.executables.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(ExecuteError::Cancelled);
            }

            self.run_with_progress(executable, cancel, reporter, index, total)
                .await?;

            reporter.report((index + 1) as f64 / total as f64).await;
        }

        self.collect_outputs(chain).await
    }

    /// Run one executable with its retry policy, forwarding estimator
    /// updates to the progress reporter while it runs.
    async fn run_with_progress(
        &self,
        executable: &Executable,
        cancel: &CancelToken,
        reporter: &Arc<ProgressReporter>,
        index: usize,
        total: usize,
    ) -> Result<(), ExecuteError> {
        let collector = self.collector_for(executable);

        let monitor = {
            let mut fraction = collector.fraction();
            let reporter = reporter.clone();
            tokio::spawn(async move {
                while fraction.changed().await.is_ok() {
                    let value = *fraction.borrow();
                    reporter
                        .report((index as f64 + value) / total as f64)
                        .await;
                }
            })
        };

        let result = self.run_attempts(executable, &collector, cancel).await;
        monitor.abort();
        result
    }

    fn collector_for(&self, executable: &Executable) -> Arc<OutputCollector> {
        let collector = OutputCollector::new(self.output_lines_to_collect);
        let collector = match self.plugins.progress_estimator(&executable.service_id) {
            Some(estimator) => collector.with_estimator(estimator),
            None => collector,
        };
        Arc::new(collector)
    }

    async fn run_with_retries(
        &self,
        executable: &Executable,
        cancel: &CancelToken,
    ) -> Result<Arc<OutputCollector>, ExecuteError> {
        let collector = self.collector_for(executable);
        self.run_attempts(executable, &collector, cancel).await?;
        Ok(collector)
    }

    async fn run_attempts(
        &self,
        executable: &Executable,
        collector: &Arc<OutputCollector>,
        cancel: &CancelToken,
    ) -> Result<(), ExecuteError> {
        let policy = executable.retries.clone().unwrap_or_default();
        let max_attempts = policy.max_attempts.max(1);

        let Some(runtime) = self.plugins.runtime(&executable.runtime) else {
            return Err(ExecuteError::Execution {
                message: format!(
                    "No runtime '{}' registered for executable '{}'",
                    executable.runtime, executable.id
                ),
                last_output: None,
                exit_code: None,
            });
        };

        let mut attempt = 1;
        loop {
            let delay = policy.delay_before_attempt(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            match runtime.execute(executable, collector, cancel).await {
                Ok(()) => return Ok(()),
                Err(RuntimeError::Cancelled) => return Err(ExecuteError::Cancelled),
                Err(err) => {
                    let condition = match &err {
                        RuntimeError::Io(_) => RetryCondition::Io,
                        _ => RetryCondition::Execution,
                    };
                    if attempt < max_attempts && policy.retries(condition) {
                        increment_retry_gauge(&executable.service_id);
                        warn!(
                            executable_id = %executable.id,
                            service_id = %executable.service_id,
                            attempt,
                            error = %err,
                            "Executable failed, retrying"
                        );
                        attempt += 1;
                        continue;
                    }
                    return Err(execution_error(executable, &err, collector, &policy));
                }
            }
        }
    }

    async fn collect_outputs(
        &self,
        chain: &ProcessChain,
    ) -> Result<HashMap<String, Vec<Value>>, ExecuteError> {
        let mut results = HashMap::new();
        for executable in &chain.executables {
            for argument in executable.arguments_of_type(ArgumentType::Output) {
                let values = match self.plugins.output_adapter(&argument.data_type) {
                    Some(adapter) => adapter.adapt(&argument.variable.value).await,
                    None => crate::output::enumerate_files(&argument.variable.value).await,
                }
                .map_err(|err| ExecuteError::Execution {
                    message: format!(
                        "Failed to collect output '{}': {err}",
                        argument.variable.id
                    ),
                    last_output: None,
                    exit_code: None,
                })?;
                debug!(
                    variable_id = %argument.variable.id,
                    count = values.len(),
                    "Collected output values"
                );
                results.insert(argument.variable.id.clone(), values);
            }
        }
        Ok(results)
    }
}

fn execution_error(
    executable: &Executable,
    err: &RuntimeError,
    collector: &Arc<OutputCollector>,
    policy: &RetryPolicy,
) -> ExecuteError {
    let exit_code = match err {
        RuntimeError::NonZeroExit { exit_code } => *exit_code,
        _ => None,
    };
    let attempts = policy.max_attempts.max(1);
    let message = if attempts > 1 {
        format!(
            "Executable '{}' of service '{}' failed after {attempts} attempts",
            executable.id, executable.service_id
        )
    } else {
        format!(
            "Executable '{}' of service '{}' failed",
            executable.id, executable.service_id
        )
    };
    ExecuteError::Execution {
        message,
        last_output: collector.last_output(),
        exit_code,
    }
}

fn increment_retry_gauge(service_id: &str) {
    metrics::gauge!("steep_service_retries", "service" => service_id.to_string()).increment(1.0);
}

/// Synthesize `mkdir -p` executables for the parent directories of every
/// output argument, at most [`MKDIR_BATCH_SIZE`] paths each, skipping
/// directories created recently on this node.
fn mkdir_executables(chain: &ProcessChain) -> Vec<Executable> {
    let mut directories = BTreeSet::new();
    for executable in &chain.executables {
        for argument in executable.arguments_of_type(ArgumentType::Output) {
            if let Some(parent) = Path::new(&argument.variable.value).parent() {
                if !parent.as_os_str().is_empty() {
                    directories.insert(parent.to_string_lossy().into_owned());
                }
            }
        }
    }

    let fresh = mkdir_cache::retain_uncreated(directories);
    fresh
        .chunks(MKDIR_BATCH_SIZE)
        .enumerate()
        .map(|(i, paths)| {
            let mut arguments = vec![Argument {
                label: None,
                variable: ArgumentVariable {
                    id: format!("mkdir-{i}-p"),
                    value: "-p".to_string(),
                },
                argument_type: ArgumentType::Argument,
                data_type: "string".to_string(),
            }];
            arguments.extend(paths.iter().enumerate().map(|(j, path)| Argument {
                label: None,
                variable: ArgumentVariable {
                    id: format!("mkdir-{i}-{j}"),
                    value: path.clone(),
                },
                argument_type: ArgumentType::Argument,
                data_type: "string".to_string(),
            }));
            Executable {
                id: format!("{}-mkdir-{i}", chain.id),
                path: "mkdir".to_string(),
                service_id: "mkdir".to_string(),
                runtime: RUNTIME_OTHER.to_string(),
                arguments,
                retries: None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use steep_model::ProcessChain;

    fn output_chain(paths: &[&str]) -> ProcessChain {
        ProcessChain {
            id: "c1".to_string(),
            submission_id: "s1".to_string(),
            executables: vec![Executable {
                id: "e1".to_string(),
                path: "/bin/svc".to_string(),
                service_id: "svc".to_string(),
                runtime: RUNTIME_OTHER.to_string(),
                arguments: paths
                    .iter()
                    .enumerate()
                    .map(|(i, path)| Argument {
                        label: None,
                        variable: ArgumentVariable {
                            id: format!("o{i}"),
                            value: path.to_string(),
                        },
                        argument_type: ArgumentType::Output,
                        data_type: "directory".to_string(),
                    })
                    .collect(),
                retries: None,
            }],
            required_capabilities: Default::default(),
        }
    }

    #[test]
    fn test_mkdir_executables_deduplicate_parents() {
        crate::mkdir_cache::clear();
        let chain = output_chain(&["/steep/out/x/a", "/steep/out/x/b", "/steep/out/y/c"]);
        let mkdirs = mkdir_executables(&chain);
        assert_eq!(mkdirs.len(), 1);

        let values: Vec<&str> = mkdirs[0]
            .arguments
            .iter()
            .map(|a| a.variable.value.as_str())
            .collect();
        assert_eq!(values, vec!["-p", "/steep/out/x", "/steep/out/y"]);

        // Recently created parents are filtered on the next chain
        let again = mkdir_executables(&chain);
        assert!(again.is_empty());
        crate::mkdir_cache::clear();
    }

    #[test]
    fn test_mkdir_batches_are_bounded() {
        crate::mkdir_cache::clear();
        let paths: Vec<String> = (0..250).map(|i| format!("/steep/batch/{i}/f")).collect();
        let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
        let chain = output_chain(&path_refs);

        let mkdirs = mkdir_executables(&chain);
        assert_eq!(mkdirs.len(), 3);
        // 1 "-p" plus up to 100 directories each
        assert_eq!(mkdirs[0].arguments.len(), 101);
        assert_eq!(mkdirs[2].arguments.len(), 51);
        crate::mkdir_cache::clear();
    }

    #[test]
    fn test_formatted_message_shape() {
        let err = ExecuteError::Execution {
            message: "Could not generate file".to_string(),
            last_output: Some("This is the last output".to_string()),
            exit_code: Some(132),
        };
        assert_eq!(
            err.formatted_message(),
            "Could not generate file\n\nExit code: 132\n\nThis is the last output"
        );

        let no_code = ExecuteError::Execution {
            message: "IO failed".to_string(),
            last_output: None,
            exit_code: None,
        };
        assert_eq!(no_code.formatted_message(), "IO failed");
    }
}
