// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Submissions and lifecycle statuses.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::workflow::Workflow;

/// Lifecycle status of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmissionStatus {
    /// Stored, not yet picked up by the controller.
    Accepted,
    /// The controller is decomposing the workflow and chains are executing.
    Running,
    /// Cancelled on external request.
    Cancelled,
    /// All process chains succeeded.
    Success,
    /// Some chains succeeded, others failed or were cancelled; results are
    /// still usable.
    PartialSuccess,
    /// Nothing usable was produced.
    Error,
}

impl SubmissionStatus {
    /// Whether this status is terminal.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Accepted | Self::Running)
    }
}

/// Execution status of a process chain.
///
/// `Registered` is the only state the scheduler claims from. The transition
/// to `Running` records the owning agent's address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessChainStatus {
    /// Stored and eligible for scheduling.
    Registered,
    /// Claimed by an agent.
    Running,
    /// Finished successfully; results are stored.
    Success,
    /// Failed terminally; the error message is stored.
    Error,
    /// Cancelled before or during execution.
    Cancelled,
}

impl ProcessChainStatus {
    /// Whether this status is terminal.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Registered | Self::Running)
    }
}

/// A single user-submitted workflow and its lifecycle record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    /// Unique submission id.
    pub id: String,

    /// The workflow to execute.
    pub workflow: Workflow,

    /// Current lifecycle status.
    pub status: SubmissionStatus,

    /// When the controller started processing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    /// When the submission reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,

    /// Aggregated results: output variable id to concrete values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<HashMap<String, Vec<Value>>>,

    /// Terminal error message, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Opaque snapshot of the rule engine's progress, so decomposition can
    /// resume after a restart.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_state: Option<Value>,
}

impl Submission {
    /// Create a new submission in `Accepted` state with a fresh id.
    pub fn new(workflow: Workflow) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            workflow,
            status: SubmissionStatus::Accepted,
            start_time: None,
            end_time: None,
            results: None,
            error_message: None,
            execution_state: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_submission_json_round_trip() {
        let mut submission = Submission::new(Workflow {
            name: None,
            vars: vec![],
            actions: vec![],
        });
        submission.status = SubmissionStatus::PartialSuccess;
        submission.start_time = Some(Utc::now());
        submission.results = Some(HashMap::from([(
            "out".to_string(),
            vec![json!("/out/a.txt")],
        )]));
        submission.execution_state = Some(json!({"cursor": 3}));

        let encoded = serde_json::to_string(&submission).unwrap();
        let decoded: Submission = serde_json::from_str(&encoded).unwrap();
        assert_eq!(submission, decoded);
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(
            serde_json::to_value(SubmissionStatus::PartialSuccess).unwrap(),
            json!("PARTIAL_SUCCESS")
        );
        assert_eq!(
            serde_json::to_value(ProcessChainStatus::Registered).unwrap(),
            json!("REGISTERED")
        );
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!SubmissionStatus::Accepted.is_terminal());
        assert!(!SubmissionStatus::Running.is_terminal());
        assert!(SubmissionStatus::Success.is_terminal());
        assert!(SubmissionStatus::Cancelled.is_terminal());

        assert!(!ProcessChainStatus::Registered.is_terminal());
        assert!(!ProcessChainStatus::Running.is_terminal());
        assert!(ProcessChainStatus::Error.is_terminal());
    }
}
