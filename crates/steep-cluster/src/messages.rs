// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire messages exchanged on the event bus.
//!
//! Every payload is a JSON object with an `action` field (requests) or a
//! `status` field (replies to `execute`).

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use steep_model::ProcessChain;

/// Requests handled on an agent's `agent.<id>` address.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum AgentRequest {
    /// Describe the agent (id, capabilities, busy state).
    Info,
    /// Try to obtain an exclusive lease on the agent.
    Allocate,
    /// Release the lease.
    Deallocate,
    /// Execute a process chain under the current lease.
    Execute {
        /// The chain to execute.
        chain: ProcessChain,
    },
    /// Interrupt the currently running chain.
    Cancel,
    /// Query the last published progress estimate.
    GetProgress,
}

/// Reply to [`AgentRequest::Info`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfoReply {
    /// Agent id.
    pub id: String,
    /// Advertised capabilities.
    pub capabilities: BTreeSet<String>,
    /// Whether the agent currently holds an unreleased lease.
    pub busy: bool,
}

/// Reply to [`AgentRequest::Allocate`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocateReply {
    /// Whether the caller now owns an exclusive lease.
    pub allocated: bool,
}

/// Reply to [`AgentRequest::Execute`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ExecuteReply {
    /// The chain completed; `results` maps output variable ids to values.
    Success {
        /// Output variable id to concrete values.
        results: HashMap<String, Vec<Value>>,
    },
    /// The chain failed terminally.
    #[serde(rename_all = "camelCase")]
    Error {
        /// Human-readable failure description.
        message: String,
        /// Last captured output lines, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_output: Option<String>,
        /// Exit code of the failing executable, when available.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
    /// The chain was interrupted.
    Cancelled,
}

/// Payload published on `processchain.progress`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressReport {
    /// The chain this report is about.
    pub process_chain_id: String,
    /// Estimated progress in `0..=1`, or `null` when unknown.
    pub estimated_progress: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_agent_request_wire_format() {
        let encoded = serde_json::to_value(AgentRequest::Allocate).unwrap();
        assert_eq!(encoded, json!({"action": "allocate"}));

        let decoded: AgentRequest =
            serde_json::from_value(json!({"action": "cancel"})).unwrap();
        assert!(matches!(decoded, AgentRequest::Cancel));
    }

    #[test]
    fn test_execute_reply_error_shape() {
        let reply = ExecuteReply::Error {
            message: "Could not generate file".to_string(),
            last_output: Some("This is the last output".to_string()),
            exit_code: Some(132),
        };
        let encoded = serde_json::to_value(&reply).unwrap();
        assert_eq!(encoded["status"], "error");
        assert_eq!(encoded["exitCode"], 132);
        assert_eq!(encoded["lastOutput"], "This is the last output");
    }
}
