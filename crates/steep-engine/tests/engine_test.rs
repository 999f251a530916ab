// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for workflow decomposition.

use std::collections::{BTreeSet, HashMap};

use serde_json::{json, Value};
use steep_engine::RuleEngine;
use steep_model::{
    Action, ArgumentType, Binding, Cardinality, ExecuteAction, ForEachAction, GenericParameter,
    InputParameter, OutputParameter, Service, ServiceCatalog, ServiceParameter,
    ServiceParameterKind, Variable, Workflow, RUNTIME_OTHER,
};

fn service(id: &str, capabilities: &[&str]) -> Service {
    Service {
        id: id.to_string(),
        name: None,
        path: format!("/usr/local/bin/{id}"),
        runtime: RUNTIME_OTHER.to_string(),
        required_capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
        parameters: vec![
            ServiceParameter {
                id: "input".to_string(),
                label: Some("-i".to_string()),
                kind: ServiceParameterKind::Input,
                data_type: "file".to_string(),
                cardinality: Cardinality::once(),
                default: None,
            },
            ServiceParameter {
                id: "output".to_string(),
                label: Some("-o".to_string()),
                kind: ServiceParameterKind::Output,
                data_type: "directory".to_string(),
                cardinality: Cardinality::once(),
                default: None,
            },
        ],
        retries: None,
    }
}

fn execute(service: &str, input_var: &str, output_var: &str) -> Action {
    Action::Execute(ExecuteAction {
        service: service.to_string(),
        inputs: vec![InputParameter {
            id: "input".to_string(),
            binding: Binding::Var {
                var: input_var.to_string(),
            },
        }],
        outputs: vec![OutputParameter {
            id: "output".to_string(),
            var: output_var.to_string(),
        }],
        parameters: vec![],
    })
}

fn no_outputs() -> HashMap<String, Vec<Value>> {
    HashMap::new()
}

#[test]
fn test_single_action_yields_single_chain() {
    let catalog = ServiceCatalog::new([service("copy", &[])]);
    let workflow = Workflow {
        name: None,
        vars: vec![Variable::with_value("in", json!("/data/in.txt"))],
        actions: vec![execute("copy", "in", "out")],
    };

    let mut engine = RuleEngine::new("sub1", &workflow, catalog, "/out").unwrap();
    let generation = engine.generate(&no_outputs());

    assert_eq!(generation.process_chains.len(), 1);
    assert!(!generation.finished);

    let chain = &generation.process_chains[0];
    assert_eq!(chain.submission_id, "sub1");
    assert_eq!(chain.executables.len(), 1);

    let executable = &chain.executables[0];
    assert_eq!(executable.service_id, "copy");
    let outputs = executable.arguments_of_type(ArgumentType::Output);
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].variable.id, "out");
    assert_eq!(outputs[0].variable.value, "/out/sub1/out");

    // Feeding the result back finishes the engine without further chains
    let results = HashMap::from([("out".to_string(), vec![json!("/out/sub1/out/f.txt")])]);
    let generation = engine.generate(&results);
    assert!(generation.process_chains.is_empty());
    assert!(generation.finished);
}

#[test]
fn test_linear_dataflow_shares_one_chain() {
    let catalog = ServiceCatalog::new([service("a", &[]), service("b", &[])]);
    let workflow = Workflow {
        name: None,
        vars: vec![Variable::with_value("in", json!("/data/in.txt"))],
        actions: vec![execute("a", "in", "mid"), execute("b", "mid", "out")],
    };

    let mut engine = RuleEngine::new("sub1", &workflow, catalog, "/out").unwrap();
    let generation = engine.generate(&no_outputs());

    // b consumes a's output within the same chain
    assert_eq!(generation.process_chains.len(), 1);
    let chain = &generation.process_chains[0];
    assert_eq!(chain.executables.len(), 2);
    let inputs = chain.executables[1].arguments_of_type(ArgumentType::Input);
    assert_eq!(inputs[0].variable.value, "/out/sub1/mid");
}

#[test]
fn test_capability_change_splits_chain() {
    let catalog = ServiceCatalog::new([service("a", &[]), service("b", &["gpu"])]);
    let workflow = Workflow {
        name: None,
        vars: vec![Variable::with_value("in", json!("/data/in.txt"))],
        actions: vec![execute("a", "in", "mid"), execute("b", "mid", "out")],
    };

    let mut engine = RuleEngine::new("sub1", &workflow, catalog, "/out").unwrap();
    let generation = engine.generate(&no_outputs());

    // b needs different capabilities, so it waits for a's real results
    assert_eq!(generation.process_chains.len(), 1);
    assert_eq!(generation.process_chains[0].executables[0].service_id, "a");
    assert!(!generation.finished);

    let results = HashMap::from([("mid".to_string(), vec![json!("/out/sub1/mid/m.bin")])]);
    let generation = engine.generate(&results);
    assert_eq!(generation.process_chains.len(), 1);
    let chain = &generation.process_chains[0];
    assert_eq!(chain.executables[0].service_id, "b");
    assert_eq!(
        chain.required_capabilities,
        BTreeSet::from(["gpu".to_string()])
    );
}

#[test]
fn test_independent_actions_get_separate_chains() {
    let catalog = ServiceCatalog::new([service("a", &[]), service("b", &[])]);
    let workflow = Workflow {
        name: None,
        vars: vec![
            Variable::with_value("x", json!("/data/x")),
            Variable::with_value("y", json!("/data/y")),
        ],
        actions: vec![execute("a", "x", "ox"), execute("b", "y", "oy")],
    };

    let mut engine = RuleEngine::new("sub1", &workflow, catalog, "/out").unwrap();
    let generation = engine.generate(&no_outputs());

    // No dataflow dependency between the two actions
    assert_eq!(generation.process_chains.len(), 2);
    assert_eq!(generation.process_chains[0].executables[0].service_id, "a");
    assert_eq!(generation.process_chains[1].executables[0].service_id, "b");
}

#[test]
fn test_for_each_unrolls_per_element() {
    let catalog = ServiceCatalog::new([service("svc", &[])]);
    let workflow = Workflow {
        name: None,
        vars: vec![Variable::with_value("files", json!(["a", "b", "c"]))],
        actions: vec![Action::ForEach(ForEachAction {
            input: "files".to_string(),
            enumerator: "i".to_string(),
            output: Some("outs".to_string()),
            yield_to_output: Some("o".to_string()),
            actions: vec![execute("svc", "i", "o")],
        })],
    };

    let mut engine = RuleEngine::new("sub1", &workflow, catalog, "/out").unwrap();
    let generation = engine.generate(&no_outputs());

    // One chain per iteration; iteration-local outputs carry $index suffixes
    assert_eq!(generation.process_chains.len(), 3);
    for (i, chain) in generation.process_chains.iter().enumerate() {
        let inputs = chain.executables[0].arguments_of_type(ArgumentType::Input);
        assert_eq!(inputs[0].variable.value, ["a", "b", "c"][i]);
        let outputs = chain.executables[0].arguments_of_type(ArgumentType::Output);
        assert_eq!(outputs[0].variable.id, format!("o${i}"));
    }
    assert!(!generation.finished);

    // Completing every iteration binds the yield collection in order
    let results = HashMap::from([
        ("o$0".to_string(), vec![json!("/out/sub1/o$0/r0")]),
        ("o$1".to_string(), vec![json!("/out/sub1/o$1/r1")]),
        ("o$2".to_string(), vec![json!("/out/sub1/o$2/r2")]),
    ]);
    let generation = engine.generate(&results);
    assert!(generation.process_chains.is_empty());
    assert!(generation.finished);
}

#[test]
fn test_for_each_defers_until_input_is_known() {
    let catalog = ServiceCatalog::new([service("prep", &[]), service("svc", &[])]);
    let workflow = Workflow {
        name: None,
        vars: vec![Variable::with_value("in", json!("/data/in"))],
        actions: vec![
            execute("prep", "in", "items"),
            Action::ForEach(ForEachAction {
                input: "items".to_string(),
                enumerator: "i".to_string(),
                output: None,
                yield_to_output: None,
                actions: vec![execute("svc", "i", "o")],
            }),
        ],
    };

    let mut engine = RuleEngine::new("sub1", &workflow, catalog, "/out").unwrap();
    let generation = engine.generate(&no_outputs());
    assert_eq!(generation.process_chains.len(), 1);
    assert!(!generation.finished);

    // prep produced two items; the for-each unrolls over both
    let results = HashMap::from([(
        "items".to_string(),
        vec![json!("/out/p/0.txt"), json!("/out/p/1.txt")],
    )]);
    let generation = engine.generate(&results);
    assert_eq!(generation.process_chains.len(), 2);
    assert!(!generation.finished);

    let results = HashMap::from([
        ("o$0".to_string(), vec![json!("/r0")]),
        ("o$1".to_string(), vec![json!("/r1")]),
    ]);
    let generation = engine.generate(&results);
    assert!(generation.process_chains.is_empty());
    assert!(generation.finished);
}

#[test]
fn test_generic_parameters_and_labels_are_rendered() {
    let mut svc = service("convert", &[]);
    svc.parameters.push(ServiceParameter {
        id: "quality".to_string(),
        label: Some("-q".to_string()),
        kind: ServiceParameterKind::Argument,
        data_type: "integer".to_string(),
        cardinality: Cardinality::optional(),
        default: Some(json!(80)),
    });
    let catalog = ServiceCatalog::new([svc]);

    let workflow = Workflow {
        name: None,
        vars: vec![Variable::with_value("in", json!("/data/in.png"))],
        actions: vec![Action::Execute(ExecuteAction {
            service: "convert".to_string(),
            inputs: vec![InputParameter {
                id: "input".to_string(),
                binding: Binding::Var {
                    var: "in".to_string(),
                },
            }],
            outputs: vec![OutputParameter {
                id: "output".to_string(),
                var: "out".to_string(),
            }],
            parameters: vec![GenericParameter {
                id: "quality".to_string(),
                value: json!(95),
            }],
        })],
    };

    let mut engine = RuleEngine::new("sub1", &workflow, catalog, "/out").unwrap();
    let generation = engine.generate(&no_outputs());
    let executable = &generation.process_chains[0].executables[0];

    let arguments = executable.arguments_of_type(ArgumentType::Argument);
    assert_eq!(arguments.len(), 1);
    assert_eq!(arguments[0].label.as_deref(), Some("-q"));
    assert_eq!(arguments[0].variable.value, "95");
    assert_eq!(arguments[0].data_type, "integer");
}

#[test]
fn test_generation_is_deterministic_across_resume() {
    let catalog = ServiceCatalog::new([service("prep", &[]), service("svc", &[])]);
    let workflow = Workflow {
        name: None,
        vars: vec![Variable::with_value("in", json!("/data/in"))],
        actions: vec![
            execute("prep", "in", "items"),
            Action::ForEach(ForEachAction {
                input: "items".to_string(),
                enumerator: "i".to_string(),
                output: Some("outs".to_string()),
                yield_to_output: Some("o".to_string()),
                actions: vec![execute("svc", "i", "o")],
            }),
        ],
    };

    let mut first = RuleEngine::new("sub1", &workflow, catalog.clone(), "/out").unwrap();
    let chains_a = first.generate(&no_outputs()).process_chains;

    // Snapshot, resume in a fresh engine, and continue from there
    let state = first.to_state().unwrap();
    let mut resumed = RuleEngine::resume("sub1", catalog.clone(), "/out", state).unwrap();

    let results = HashMap::from([("items".to_string(), vec![json!("/a"), json!("/b")])]);
    let continued = resumed.generate(&results).process_chains;
    let reference = first.generate(&results).process_chains;

    assert_eq!(chains_a.len(), 1);
    assert_eq!(continued, reference);
    assert_eq!(continued.len(), 2);
}
