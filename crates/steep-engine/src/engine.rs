// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow decomposition.
//!
//! The engine keeps a frontier of actions whose inputs are all known and
//! walks it in workflow order. Execute actions with known inputs are
//! synthesized into executables and grouped into process chains; a chain is
//! flushed whenever two consecutive producible actions do not share a
//! dataflow dependency, their required capabilities differ, or a for-each
//! boundary is crossed. A for-each whose input collection is known is
//! unrolled in place, one copy of the body per element, with
//! iteration-local variables renamed with a `$<index>` suffix.
//!
//! All ids derive from the submission id and the action's position (and
//! iteration index), so regenerating from the same inputs yields the same
//! chains.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use steep_model::{
    Action, Argument, ArgumentType, ArgumentVariable, Binding, Executable, ExecuteAction,
    ForEachAction, ProcessChain, Service, ServiceCatalog, ServiceParameterKind, Workflow,
};

use crate::validation::{validate_workflow, ValidationErrors};

/// The result of one [`RuleEngine::generate`] call.
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    /// Newly producible process chains, in deterministic order.
    pub process_chains: Vec<ProcessChain>,
    /// `true` once no further chains can ever be produced.
    pub finished: bool,
}

/// One action awaiting decomposition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActionSlot {
    /// Position-derived id, unique across unrolled copies (e.g. `1$0.0`).
    instance_id: String,
    /// For-each scope this slot belongs to (empty at top level).
    scope: String,
    action: Action,
    done: bool,
}

/// Pending yield collection of a for-each action.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct YieldCollector {
    output_var: String,
    element_vars: Vec<String>,
    done: bool,
}

/// Serializable snapshot of the engine's progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EngineState {
    slots: Vec<ActionSlot>,
    values: BTreeMap<String, Value>,
    collectors: Vec<YieldCollector>,
    chain_counter: u64,
}

/// Decomposes one submission's workflow into process chains.
pub struct RuleEngine {
    submission_id: String,
    catalog: ServiceCatalog,
    out_path: String,
    state: EngineState,
}

impl RuleEngine {
    /// Validate the workflow and create an engine for it.
    ///
    /// `out_path` is the directory under which output file paths are
    /// allocated (`<out_path>/<submission_id>/<variable_id>`).
    pub fn new(
        submission_id: impl Into<String>,
        workflow: &Workflow,
        catalog: ServiceCatalog,
        out_path: impl Into<String>,
    ) -> Result<Self, ValidationErrors> {
        validate_workflow(workflow, &catalog)?;

        let mut values = BTreeMap::new();
        for var in &workflow.vars {
            if let Some(value) = &var.value {
                values.insert(var.id.clone(), value.clone());
            }
        }

        let slots = workflow
            .actions
            .iter()
            .enumerate()
            .map(|(i, action)| ActionSlot {
                instance_id: i.to_string(),
                scope: String::new(),
                action: action.clone(),
                done: false,
            })
            .collect();

        Ok(Self {
            submission_id: submission_id.into(),
            catalog,
            out_path: out_path.into(),
            state: EngineState {
                slots,
                values,
                collectors: Vec::new(),
                chain_counter: 0,
            },
        })
    }

    /// Restore an engine from a snapshot produced by [`Self::to_state`].
    pub fn resume(
        submission_id: impl Into<String>,
        catalog: ServiceCatalog,
        out_path: impl Into<String>,
        state: Value,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            submission_id: submission_id.into(),
            catalog,
            out_path: out_path.into(),
            state: serde_json::from_value(state)?,
        })
    }

    /// Snapshot the engine's progress.
    pub fn to_state(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(&self.state)
    }

    /// Consume newly known outputs and emit every chain that is now
    /// producible.
    ///
    /// `outputs` maps output variable ids to the concrete values their
    /// executables produced (single-element lists collapse to the element).
    pub fn generate(&mut self, outputs: &HashMap<String, Vec<Value>>) -> Generation {
        // Merge new outputs in sorted order so generation is deterministic
        let mut keys: Vec<&String> = outputs.keys().collect();
        keys.sort();
        for key in keys {
            let values = &outputs[key];
            let value = if values.len() == 1 {
                values[0].clone()
            } else {
                Value::Array(values.clone())
            };
            self.state.values.insert(key.clone(), value);
        }

        // Fixpoint: bind completed yield collections and unroll for-each
        // actions whose input collections are now known. Either step can
        // enable the other.
        loop {
            let mut changed = false;

            for collector in &mut self.state.collectors {
                if collector.done {
                    continue;
                }
                if !collector
                    .element_vars
                    .iter()
                    .all(|v| self.state.values.contains_key(v))
                {
                    continue;
                }
                let mut collected = Vec::new();
                for var in &collector.element_vars {
                    match &self.state.values[var] {
                        Value::Array(items) => collected.extend(items.iter().cloned()),
                        other => collected.push(other.clone()),
                    }
                }
                self.state
                    .values
                    .insert(collector.output_var.clone(), Value::Array(collected));
                collector.done = true;
                changed = true;
            }

            let mut index = 0;
            while index < self.state.slots.len() {
                let slot = &self.state.slots[index];
                if slot.done {
                    index += 1;
                    continue;
                }
                let Action::ForEach(fe) = &slot.action else {
                    index += 1;
                    continue;
                };
                let Some(input) = self.state.values.get(&fe.input) else {
                    index += 1;
                    continue;
                };

                let elements = match input {
                    Value::Array(items) => items.clone(),
                    other => vec![other.clone()],
                };
                let fe = fe.clone();
                let instance_id = slot.instance_id.clone();
                let unrolled = self.unroll(&fe, &instance_id, &elements);
                self.state.slots.splice(index..index + 1, unrolled);
                changed = true;
            }

            if !changed {
                break;
            }
        }

        let process_chains = self.build_chains();

        let finished = self.state.slots.iter().all(|s| s.done)
            && self.state.collectors.iter().all(|c| c.done);

        Generation {
            process_chains,
            finished,
        }
    }

    /// Values of completed yield collections, keyed by the for-each output
    /// variable. Part of the submission's results once it finalizes.
    pub fn yielded_collections(&self) -> HashMap<String, Vec<Value>> {
        self.state
            .collectors
            .iter()
            .filter(|c| c.done)
            .filter_map(|c| {
                self.state.values.get(&c.output_var).map(|value| {
                    let values = match value {
                        Value::Array(items) => items.clone(),
                        other => vec![other.clone()],
                    };
                    (c.output_var.clone(), values)
                })
            })
            .collect()
    }

    /// Variable ids the for-each body assigns per iteration: the enumerator
    /// plus every output declared inside (recursively).
    fn local_variables(fe: &ForEachAction) -> BTreeSet<String> {
        fn collect(actions: &[Action], vars: &mut BTreeSet<String>) {
            for action in actions {
                match action {
                    Action::Execute(exec) => {
                        for output in &exec.outputs {
                            vars.insert(output.var.clone());
                        }
                    }
                    Action::ForEach(inner) => {
                        vars.insert(inner.enumerator.clone());
                        if let Some(output) = &inner.output {
                            vars.insert(output.clone());
                        }
                        collect(&inner.actions, vars);
                    }
                }
            }
        }

        let mut vars = BTreeSet::new();
        vars.insert(fe.enumerator.clone());
        collect(&fe.actions, &mut vars);
        vars
    }

    fn rename_action(action: &Action, renames: &BTreeMap<String, String>) -> Action {
        let rename = |var: &str| -> String {
            renames.get(var).cloned().unwrap_or_else(|| var.to_string())
        };

        match action {
            Action::Execute(exec) => {
                let mut exec = exec.clone();
                for input in &mut exec.inputs {
                    if let Binding::Var { var } = &mut input.binding {
                        *var = rename(var);
                    }
                }
                for output in &mut exec.outputs {
                    output.var = rename(&output.var);
                }
                Action::Execute(exec)
            }
            Action::ForEach(fe) => {
                let mut fe = fe.clone();
                fe.input = rename(&fe.input);
                fe.enumerator = rename(&fe.enumerator);
                fe.output = fe.output.as_deref().map(rename);
                fe.yield_to_output = fe.yield_to_output.as_deref().map(rename);
                fe.actions = fe
                    .actions
                    .iter()
                    .map(|a| Self::rename_action(a, renames))
                    .collect();
                Action::ForEach(fe)
            }
        }
    }

    /// Unroll a for-each into one copy of the body per element, binding the
    /// enumerator elementwise and registering the yield collector.
    fn unroll(
        &mut self,
        fe: &ForEachAction,
        instance_id: &str,
        elements: &[Value],
    ) -> Vec<ActionSlot> {
        let locals = Self::local_variables(fe);
        let mut slots = Vec::new();

        for (iteration, element) in elements.iter().enumerate() {
            let renames: BTreeMap<String, String> = locals
                .iter()
                .map(|v| (v.clone(), format!("{v}${iteration}")))
                .collect();

            let enumerator = format!("{}${}", fe.enumerator, iteration);
            self.state.values.insert(enumerator, element.clone());

            let scope = format!("{instance_id}${iteration}");
            for (position, action) in fe.actions.iter().enumerate() {
                slots.push(ActionSlot {
                    instance_id: format!("{scope}.{position}"),
                    scope: scope.clone(),
                    action: Self::rename_action(action, &renames),
                    done: false,
                });
            }
        }

        if let (Some(output), Some(yielded)) = (&fe.output, &fe.yield_to_output) {
            self.state.collectors.push(YieldCollector {
                output_var: output.clone(),
                element_vars: (0..elements.len())
                    .map(|i| format!("{yielded}${i}"))
                    .collect(),
                done: false,
            });
        }

        slots
    }

    /// Walk the frontier in order and group producible execute actions into
    /// chains, honoring the boundary rules.
    fn build_chains(&mut self) -> Vec<ProcessChain> {
        struct ChainBuilder {
            scope: String,
            capabilities: BTreeSet<String>,
            /// Output variables produced so far in this chain, with the
            /// paths their executables write to.
            produced: HashMap<String, String>,
            executables: Vec<Executable>,
        }

        fn flush(
            builder: Option<ChainBuilder>,
            submission_id: &str,
            counter: &mut u64,
            chains: &mut Vec<ProcessChain>,
        ) {
            if let Some(builder) = builder {
                let id = format!("{submission_id}-{counter}");
                *counter += 1;
                chains.push(ProcessChain {
                    id,
                    submission_id: submission_id.to_string(),
                    executables: builder.executables,
                    required_capabilities: builder.capabilities,
                });
            }
        }

        let submission_id = self.submission_id.clone();
        let mut counter = self.state.chain_counter;
        let mut chains = Vec::new();
        let mut current: Option<ChainBuilder> = None;

        let slots = std::mem::take(&mut self.state.slots);
        let mut new_slots = Vec::with_capacity(slots.len());

        for mut slot in slots {
            if slot.done {
                new_slots.push(slot);
                continue;
            }
            let Action::Execute(exec) = &slot.action else {
                // Deferred for-each; stays on the frontier
                new_slots.push(slot);
                continue;
            };
            let Some(service) = self.catalog.get(&exec.service).cloned() else {
                // Unreachable after validation
                new_slots.push(slot);
                continue;
            };

            // An input can be resolved from an output of the chain under
            // construction only if this action may actually join that chain
            // (same for-each scope, same capability set). Cross-chain
            // dependencies wait for real results instead.
            let joinable = current
                .as_ref()
                .is_some_and(|c| {
                    c.scope == slot.scope && c.capabilities == service.required_capabilities
                });

            let producible = exec.inputs.iter().all(|input| match &input.binding {
                Binding::Value { .. } => true,
                Binding::Var { var } => {
                    self.state.values.contains_key(var)
                        || (joinable
                            && current
                                .as_ref()
                                .is_some_and(|c| c.produced.contains_key(var)))
                }
            });
            if !producible {
                new_slots.push(slot);
                continue;
            }

            let connects = joinable
                && exec.inputs.iter().any(|input| match &input.binding {
                    Binding::Var { var } => current
                        .as_ref()
                        .is_some_and(|c| c.produced.contains_key(var)),
                    Binding::Value { .. } => false,
                });

            if current.is_some() && !connects {
                flush(current.take(), &submission_id, &mut counter, &mut chains);
            }

            let builder = current.get_or_insert_with(|| ChainBuilder {
                scope: slot.scope.clone(),
                capabilities: service.required_capabilities.clone(),
                produced: HashMap::new(),
                executables: Vec::new(),
            });

            let (executable, produced) =
                self.synthesize(exec, &slot.instance_id, &service, &builder.produced);
            builder.executables.push(executable);
            builder.produced.extend(produced);

            slot.done = true;
            new_slots.push(slot);
        }

        flush(current.take(), &submission_id, &mut counter, &mut chains);

        self.state.slots = new_slots;
        self.state.chain_counter = counter;
        chains
    }

    /// Resolve one execute action into an executable. Returns the
    /// executable and the output variables it produces (id to path).
    fn synthesize(
        &self,
        exec: &ExecuteAction,
        instance_id: &str,
        service: &Service,
        chain_produced: &HashMap<String, String>,
    ) -> (Executable, HashMap<String, String>) {
        let mut arguments = Vec::new();
        let mut produced = HashMap::new();

        for parameter in &service.parameters {
            match parameter.kind {
                ServiceParameterKind::Output => {
                    let Some(output) = exec.outputs.iter().find(|o| o.id == parameter.id)
                    else {
                        continue;
                    };
                    let path = format!(
                        "{}/{}/{}",
                        self.out_path, self.submission_id, output.var
                    );
                    produced.insert(output.var.clone(), path.clone());
                    arguments.push(Argument {
                        label: parameter.label.clone(),
                        variable: ArgumentVariable {
                            id: output.var.clone(),
                            value: path,
                        },
                        argument_type: ArgumentType::Output,
                        data_type: parameter.data_type.clone(),
                    });
                }
                ServiceParameterKind::Input | ServiceParameterKind::Argument => {
                    let binding = exec
                        .inputs
                        .iter()
                        .find(|i| i.id == parameter.id)
                        .map(|i| i.binding.clone())
                        .or_else(|| {
                            exec.parameters
                                .iter()
                                .find(|p| p.id == parameter.id)
                                .map(|p| Binding::Value {
                                    value: p.value.clone(),
                                })
                        })
                        .or_else(|| {
                            parameter
                                .default
                                .clone()
                                .map(|value| Binding::Value { value })
                        });
                    let Some(binding) = binding else {
                        continue;
                    };

                    let argument_type = match parameter.kind {
                        ServiceParameterKind::Input => ArgumentType::Input,
                        _ => ArgumentType::Argument,
                    };

                    let (variable_id, value) = match &binding {
                        Binding::Var { var } => {
                            let value = self
                                .state
                                .values
                                .get(var)
                                .cloned()
                                .or_else(|| {
                                    chain_produced.get(var).map(|p| Value::String(p.clone()))
                                })
                                .unwrap_or(Value::Null);
                            (var.clone(), value)
                        }
                        Binding::Value { value } => (
                            format!("{}_{}", instance_id, parameter.id),
                            value.clone(),
                        ),
                    };

                    // A list value expands into one argument per element
                    let values: Vec<Value> = match value {
                        Value::Array(items) => items,
                        other => vec![other],
                    };
                    for (i, item) in values.iter().enumerate() {
                        let id = if values.len() == 1 {
                            variable_id.clone()
                        } else {
                            format!("{variable_id}[{i}]")
                        };
                        arguments.push(Argument {
                            label: parameter.label.clone(),
                            variable: ArgumentVariable {
                                id,
                                value: stringify(item),
                            },
                            argument_type,
                            data_type: parameter.data_type.clone(),
                        });
                    }
                }
            }
        }

        let executable = Executable {
            id: instance_id.to_string(),
            path: service.path.clone(),
            service_id: service.id.clone(),
            runtime: service.runtime.clone(),
            arguments,
            retries: service.retries.clone(),
        };

        (executable, produced)
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
