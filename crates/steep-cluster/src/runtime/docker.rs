// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Docker runtime.
//!
//! Wraps the invocation in `docker run --rm`, mounting the configured data
//! directories so executables inside the container see the same paths as
//! executables on the host. `Executable::path` is the image name.

use std::sync::Arc;

use async_trait::async_trait;
use steep_model::{Executable, RUNTIME_DOCKER};

use super::{argument_tokens, run_command, Runtime, RuntimeError};
use crate::cancel::CancelToken;
use crate::output::OutputCollector;

/// The built-in `docker` runtime.
#[derive(Debug, Default)]
pub struct DockerRuntime {
    /// Host paths mounted read-write into the container at the same
    /// location (typically the tmp and output directories).
    volumes: Vec<String>,
}

impl DockerRuntime {
    /// Create a runtime mounting the given host paths.
    pub fn new(volumes: impl IntoIterator<Item = String>) -> Self {
        Self {
            volumes: volumes.into_iter().collect(),
        }
    }
}

#[async_trait]
impl Runtime for DockerRuntime {
    fn id(&self) -> &str {
        RUNTIME_DOCKER
    }

    async fn execute(
        &self,
        executable: &Executable,
        output: &Arc<OutputCollector>,
        cancel: &CancelToken,
    ) -> Result<(), RuntimeError> {
        let mut args = vec!["run".to_string(), "--rm".to_string()];
        for volume in &self.volumes {
            args.push("-v".to_string());
            args.push(format!("{volume}:{volume}"));
        }
        args.push(executable.path.clone());
        args.extend(argument_tokens(executable));

        run_command("docker", &args, output, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_id() {
        assert_eq!(DockerRuntime::default().id(), "docker");
    }

    #[test]
    fn test_volumes_are_stored() {
        let runtime = DockerRuntime::new(["/tmp/steep".to_string()]);
        assert_eq!(runtime.volumes, vec!["/tmp/steep".to_string()]);
    }
}
