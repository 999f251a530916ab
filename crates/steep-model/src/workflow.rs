// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow definitions.
//!
//! A workflow is an ordered list of actions over named variables. An action
//! either invokes a service ([`ExecuteAction`]) or iterates over a collection
//! ([`ForEachAction`]). Variables are assign-once: a variable either carries
//! an inline value or receives one when the action producing it completes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A named variable. The value is optional until assigned; once assigned it
/// never changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    /// Unique variable identifier within the workflow.
    pub id: String,

    /// The variable's value, if already known. A scalar, a file path string,
    /// or an array (the input of a for-each action).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl Variable {
    /// Create an unassigned variable.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            value: None,
        }
    }

    /// Create a variable with an inline value.
    pub fn with_value(id: impl Into<String>, value: Value) -> Self {
        Self {
            id: id.into(),
            value: Some(value),
        }
    }
}

/// A user-submitted workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    /// Human-readable workflow name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Variables declared up front (inputs and shared values).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vars: Vec<Variable>,

    /// Ordered list of actions.
    pub actions: Vec<Action>,
}

/// A workflow action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Action {
    /// Invoke a service from the catalog.
    Execute(ExecuteAction),
    /// Iterate over a collection, applying inner actions per element.
    #[serde(rename = "for")]
    ForEach(ForEachAction),
}

/// How an input parameter obtains its value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Binding {
    /// Reference to a workflow variable by id.
    Var {
        /// The referenced variable id.
        var: String,
    },
    /// An inline constant.
    Value {
        /// The constant value.
        value: Value,
    },
}

/// An input parameter binding of an execute action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputParameter {
    /// The service parameter this binding applies to.
    pub id: String,

    /// Where the value comes from.
    #[serde(flatten)]
    pub binding: Binding,
}

/// An output parameter binding of an execute action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputParameter {
    /// The service parameter this binding applies to.
    pub id: String,

    /// The workflow variable that receives the output.
    pub var: String,
}

/// A generic (non-dataflow) parameter of an execute action, passed to the
/// service verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenericParameter {
    /// The service parameter this value applies to.
    pub id: String,

    /// The constant value.
    pub value: Value,
}

/// Invocation of a catalog service with parameter bindings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteAction {
    /// Id of the service to execute.
    pub service: String,

    /// Input parameter bindings.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<InputParameter>,

    /// Output parameter bindings.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<OutputParameter>,

    /// Generic parameter values.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<GenericParameter>,
}

/// Iteration over a collection variable.
///
/// When the input collection is known, the inner actions are unrolled once
/// per element with the enumerator variable bound elementwise. If `output`
/// and `yield_to_output` are set, the per-iteration values of
/// `yield_to_output` are collected, in element order, into the `output`
/// variable once every iteration has completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForEachAction {
    /// Variable holding the input collection.
    pub input: String,

    /// Variable bound to the current element inside each iteration.
    pub enumerator: String,

    /// Variable receiving the collected yields, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,

    /// Variable inside the body whose per-iteration value is yielded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub yield_to_output: Option<String>,

    /// Actions applied to each element.
    pub actions: Vec<Action>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_workflow_json_round_trip() {
        let workflow = Workflow {
            name: Some("copy twice".to_string()),
            vars: vec![
                Variable::with_value("input_file", json!("/data/in.txt")),
                Variable::new("result"),
            ],
            actions: vec![Action::Execute(ExecuteAction {
                service: "copy".to_string(),
                inputs: vec![InputParameter {
                    id: "input".to_string(),
                    binding: Binding::Var {
                        var: "input_file".to_string(),
                    },
                }],
                outputs: vec![OutputParameter {
                    id: "output".to_string(),
                    var: "result".to_string(),
                }],
                parameters: vec![GenericParameter {
                    id: "count".to_string(),
                    value: json!(2),
                }],
            })],
        };

        let encoded = serde_json::to_value(&workflow).unwrap();
        let decoded: Workflow = serde_json::from_value(encoded.clone()).unwrap();
        assert_eq!(workflow, decoded);

        // Actions are tagged by type, for-each is spelled "for" on the wire
        assert_eq!(encoded["actions"][0]["type"], "execute");
    }

    #[test]
    fn test_for_each_action_wire_tag() {
        let action = Action::ForEach(ForEachAction {
            input: "files".to_string(),
            enumerator: "f".to_string(),
            output: Some("outs".to_string()),
            yield_to_output: Some("o".to_string()),
            actions: vec![],
        });

        let encoded = serde_json::to_value(&action).unwrap();
        assert_eq!(encoded["type"], "for");
        assert_eq!(encoded["yieldToOutput"], "o");

        let decoded: Action = serde_json::from_value(encoded).unwrap();
        assert_eq!(action, decoded);
    }

    #[test]
    fn test_input_binding_variants() {
        let by_var: InputParameter =
            serde_json::from_value(json!({"id": "input", "var": "x"})).unwrap();
        assert!(matches!(by_var.binding, Binding::Var { .. }));

        let by_value: InputParameter =
            serde_json::from_value(json!({"id": "input", "value": 5})).unwrap();
        assert!(matches!(by_value.binding, Binding::Value { .. }));
    }
}
