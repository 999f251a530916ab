// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process chains and executables.
//!
//! A process chain is the unit of scheduling: a linear sequence of
//! executables sharing one set of required capabilities. Executables run
//! strictly in order; an output of executable *k* may be the input of a
//! later executable in the same chain.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// The role of an argument within an executable invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ArgumentType {
    /// The argument names a file the executable reads.
    Input,
    /// The argument names a file or directory the executable produces.
    Output,
    /// A plain command-line argument.
    Argument,
}

/// The variable an argument carries: identity plus the concrete value the
/// executable is invoked with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArgumentVariable {
    /// Variable id. For outputs, the rule engine allocates a fresh id that
    /// the result map is keyed by.
    pub id: String,

    /// The concrete value (for outputs, the path the executable writes to).
    pub value: String,
}

/// One argument of an executable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Argument {
    /// Optional flag label preceding the value (e.g. `-i`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    /// The variable carried by this argument.
    pub variable: ArgumentVariable,

    /// The argument's role.
    #[serde(rename = "type")]
    pub argument_type: ArgumentType,

    /// Service-declared data type (e.g. `string`, `integer`, `directory`).
    pub data_type: String,
}

/// Error classes a retry policy may react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RetryCondition {
    /// The executable exited non-zero or the runtime raised.
    Execution,
    /// An I/O failure outside the executable itself.
    Io,
}

/// Per-executable retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total number of attempts, including the first. `1` disables retry.
    pub max_attempts: u32,

    /// Delay before a retry attempt, in milliseconds.
    #[serde(default)]
    pub delay_millis: u64,

    /// Multiplier applied to the delay after each failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exponential_backoff: Option<f64>,

    /// Error classes that trigger a retry. Cancellation is never retried.
    #[serde(default = "RetryPolicy::default_retry_on")]
    pub retry_on: Vec<RetryCondition>,
}

impl RetryPolicy {
    fn default_retry_on() -> Vec<RetryCondition> {
        vec![RetryCondition::Execution]
    }

    /// Delay before the given attempt (attempts count from 1; the first
    /// attempt has no delay).
    pub fn delay_before_attempt(&self, attempt: u32) -> std::time::Duration {
        if attempt <= 1 {
            return std::time::Duration::ZERO;
        }
        let base = self.delay_millis as f64;
        let factor = self.exponential_backoff.unwrap_or(1.0);
        let millis = base * factor.powi(attempt as i32 - 2);
        std::time::Duration::from_millis(millis as u64)
    }

    /// Whether the policy retries the given error class.
    pub fn retries(&self, condition: RetryCondition) -> bool {
        self.retry_on.contains(&condition)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            delay_millis: 0,
            exponential_backoff: None,
            retry_on: Self::default_retry_on(),
        }
    }
}

/// One external command invocation within a process chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Executable {
    /// Unique id within the chain.
    pub id: String,

    /// Path of the binary (or the image name for the Docker runtime).
    pub path: String,

    /// Id of the catalog service this executable was synthesized from.
    pub service_id: String,

    /// Runtime that invokes this executable (`docker`, `other`, or a
    /// plugin-provided runtime id).
    pub runtime: String,

    /// Ordered arguments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<Argument>,

    /// Retry policy; absent means a single attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<RetryPolicy>,
}

impl Executable {
    /// Arguments of the given role, in declaration order.
    pub fn arguments_of_type(&self, argument_type: ArgumentType) -> Vec<&Argument> {
        self.arguments
            .iter()
            .filter(|a| a.argument_type == argument_type)
            .collect()
    }
}

/// A linear group of executables scheduled as one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessChain {
    /// Unique chain id.
    pub id: String,

    /// The submission this chain belongs to.
    pub submission_id: String,

    /// Executables, run strictly in order.
    pub executables: Vec<Executable>,

    /// Capabilities an agent must advertise to run this chain. Matching is
    /// set inclusion.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub required_capabilities: BTreeSet<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_chain() -> ProcessChain {
        ProcessChain {
            id: "chain-1".to_string(),
            submission_id: "sub-1".to_string(),
            executables: vec![Executable {
                id: "exec-1".to_string(),
                path: "/usr/local/bin/copy".to_string(),
                service_id: "copy".to_string(),
                runtime: crate::RUNTIME_OTHER.to_string(),
                arguments: vec![
                    Argument {
                        label: Some("-i".to_string()),
                        variable: ArgumentVariable {
                            id: "input_file".to_string(),
                            value: "/data/in.txt".to_string(),
                        },
                        argument_type: ArgumentType::Input,
                        data_type: "file".to_string(),
                    },
                    Argument {
                        label: None,
                        variable: ArgumentVariable {
                            id: "out_var".to_string(),
                            value: "/data/out".to_string(),
                        },
                        argument_type: ArgumentType::Output,
                        data_type: "directory".to_string(),
                    },
                ],
                retries: Some(RetryPolicy {
                    max_attempts: 3,
                    delay_millis: 100,
                    exponential_backoff: Some(2.0),
                    retry_on: vec![RetryCondition::Execution],
                }),
            }],
            required_capabilities: ["docker".to_string()].into_iter().collect(),
        }
    }

    #[test]
    fn test_process_chain_json_round_trip() {
        let chain = sample_chain();
        let encoded = serde_json::to_string(&chain).unwrap();
        let decoded: ProcessChain = serde_json::from_str(&encoded).unwrap();
        assert_eq!(chain, decoded);
    }

    #[test]
    fn test_argument_wire_field_names() {
        let chain = sample_chain();
        let encoded = serde_json::to_value(&chain).unwrap();
        let arg = &encoded["executables"][0]["arguments"][0];
        assert_eq!(arg["type"], "input");
        assert_eq!(arg["dataType"], "file");
        assert_eq!(arg["variable"]["id"], "input_file");
    }

    #[test]
    fn test_arguments_of_type() {
        let chain = sample_chain();
        let outputs = chain.executables[0].arguments_of_type(ArgumentType::Output);
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].variable.id, "out_var");
    }

    #[test]
    fn test_retry_policy_backoff_delays() {
        let policy = RetryPolicy {
            max_attempts: 4,
            delay_millis: 100,
            exponential_backoff: Some(2.0),
            retry_on: vec![RetryCondition::Execution],
        };

        assert_eq!(policy.delay_before_attempt(1).as_millis(), 0);
        assert_eq!(policy.delay_before_attempt(2).as_millis(), 100);
        assert_eq!(policy.delay_before_attempt(3).as_millis(), 200);
        assert_eq!(policy.delay_before_attempt(4).as_millis(), 400);
    }

    #[test]
    fn test_retry_policy_default_is_single_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 1);
        assert!(policy.retries(RetryCondition::Execution));
        assert!(!policy.retries(RetryCondition::Io));
    }
}
