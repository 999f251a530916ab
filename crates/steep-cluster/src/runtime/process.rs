// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Plain-process runtime.
//!
//! Invokes the executable's binary directly on the host.

use std::sync::Arc;

use async_trait::async_trait;
use steep_model::{Executable, RUNTIME_OTHER};

use super::{argument_tokens, run_command, Runtime, RuntimeError};
use crate::cancel::CancelToken;
use crate::output::OutputCollector;

/// The built-in `other` runtime: spawns the binary at `Executable::path`.
#[derive(Debug, Default)]
pub struct OtherRuntime;

impl OtherRuntime {
    /// Create the runtime.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Runtime for OtherRuntime {
    fn id(&self) -> &str {
        RUNTIME_OTHER
    }

    async fn execute(
        &self,
        executable: &Executable,
        output: &Arc<OutputCollector>,
        cancel: &CancelToken,
    ) -> Result<(), RuntimeError> {
        let args = argument_tokens(executable);
        run_command(&executable.path, &args, output, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use steep_model::{Argument, ArgumentType, ArgumentVariable};

    fn echo_executable(args: &[&str]) -> Executable {
        Executable {
            id: "e1".to_string(),
            path: "echo".to_string(),
            service_id: "echo".to_string(),
            runtime: RUNTIME_OTHER.to_string(),
            arguments: args
                .iter()
                .enumerate()
                .map(|(i, value)| Argument {
                    label: None,
                    variable: ArgumentVariable {
                        id: format!("arg{i}"),
                        value: value.to_string(),
                    },
                    argument_type: ArgumentType::Argument,
                    data_type: "string".to_string(),
                })
                .collect(),
            retries: None,
        }
    }

    #[tokio::test]
    async fn test_captures_stdout() {
        let runtime = OtherRuntime::new();
        let collector = Arc::new(OutputCollector::new(10));
        runtime
            .execute(&echo_executable(&["hello world"]), &collector, &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(collector.last_output().unwrap(), "hello world");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_reported() {
        let runtime = OtherRuntime::new();
        let collector = Arc::new(OutputCollector::new(10));
        let mut executable = echo_executable(&[]);
        executable.path = "false".to_string();

        let err = runtime
            .execute(&executable, &collector, &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::NonZeroExit { exit_code: Some(1) }
        ));
    }

    #[tokio::test]
    async fn test_cancellation_kills_the_process() {
        let runtime = OtherRuntime::new();
        let collector = Arc::new(OutputCollector::new(10));
        let mut executable = echo_executable(&["30"]);
        executable.path = "sleep".to_string();

        let cancel = CancelToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let started = std::time::Instant::now();
        let err = runtime
            .execute(&executable, &collector, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Cancelled));
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }
}
