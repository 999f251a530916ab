// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock runtime for testing.
//!
//! Simulates executable invocations without spawning processes. Tests
//! script per-service outcomes (fail twice then succeed, block until
//! cancelled, ...) and inspect the recorded invocations afterwards.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use steep_model::Executable;
use tokio::sync::Mutex;

use super::{Runtime, RuntimeError};
use crate::cancel::CancelToken;
use crate::output::OutputCollector;

/// Scripted outcome of one invocation.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    /// Complete successfully, optionally emitting output lines first.
    Succeed(Vec<String>),
    /// Fail with the given exit code, optionally emitting output first.
    Fail {
        /// Exit code reported to the executor.
        exit_code: i32,
        /// Output lines captured before the failure.
        lines: Vec<String>,
    },
    /// Block until the cancel token fires, then report cancellation.
    BlockUntilCancelled,
}

type WriteHook = dyn Fn(&Executable) + Send + Sync;

/// Runtime that replays scripted outcomes.
pub struct MockRuntime {
    id: String,
    script: Mutex<HashMap<String, VecDeque<MockOutcome>>>,
    invocations: Mutex<Vec<String>>,
    /// Invoked on every successful invocation; tests use it to create the
    /// output files the executor enumerates.
    on_success: Option<Arc<WriteHook>>,
}

impl MockRuntime {
    /// Create a mock registered under the given runtime id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            script: Mutex::new(HashMap::new()),
            invocations: Mutex::new(Vec::new()),
            on_success: None,
        }
    }

    /// Attach a hook run on each successful invocation.
    pub fn with_success_hook(mut self, hook: impl Fn(&Executable) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(hook));
        self
    }

    /// Queue outcomes for a service. Once the queue is exhausted, further
    /// invocations succeed.
    pub async fn script(&self, service_id: &str, outcomes: impl IntoIterator<Item = MockOutcome>) {
        let mut script = self.script.lock().await;
        script
            .entry(service_id.to_string())
            .or_default()
            .extend(outcomes);
    }

    /// Ids of the executables invoked so far, in order.
    pub async fn invocations(&self) -> Vec<String> {
        self.invocations.lock().await.clone()
    }
}

#[async_trait]
impl Runtime for MockRuntime {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(
        &self,
        executable: &Executable,
        output: &Arc<OutputCollector>,
        cancel: &CancelToken,
    ) -> Result<(), RuntimeError> {
        self.invocations
            .lock()
            .await
            .push(executable.id.clone());

        let outcome = {
            let mut script = self.script.lock().await;
            script
                .get_mut(&executable.service_id)
                .and_then(|queue| queue.pop_front())
                .unwrap_or(MockOutcome::Succeed(Vec::new()))
        };

        match outcome {
            MockOutcome::Succeed(lines) => {
                for line in lines {
                    output.append(line);
                }
                if let Some(hook) = &self.on_success {
                    hook(executable);
                }
                Ok(())
            }
            MockOutcome::Fail { exit_code, lines } => {
                for line in lines {
                    output.append(line);
                }
                Err(RuntimeError::NonZeroExit {
                    exit_code: Some(exit_code),
                })
            }
            MockOutcome::BlockUntilCancelled => {
                cancel.cancelled().await;
                Err(RuntimeError::Cancelled)
            }
        }
    }
}
