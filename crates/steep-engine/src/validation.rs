// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow validation.
//!
//! Validates a workflow against the service catalog before any chain is
//! produced. A workflow that passes validation cannot fail inside the rule
//! engine; invalid references, unknown services, and unsatisfiable parameter
//! bindings are all caught here.

use std::collections::HashSet;

use steep_model::{Action, Binding, ServiceCatalog, ServiceParameterKind, Workflow};
use thiserror::Error;

/// A single validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The workflow has no actions.
    #[error("Workflow contains no actions")]
    EmptyWorkflow,

    /// An execute action references a service the catalog does not know.
    #[error("Unknown service '{service_id}'")]
    UnknownService {
        /// The unresolved service id.
        service_id: String,
    },

    /// A parameter binding does not match any service parameter.
    #[error("Service '{service_id}' has no parameter '{parameter_id}'")]
    UnknownParameter {
        /// The service the binding targets.
        service_id: String,
        /// The unresolved parameter id.
        parameter_id: String,
    },

    /// A binding targets a parameter of the wrong role (e.g. an output
    /// binding on an input parameter).
    #[error(
        "Parameter '{parameter_id}' of service '{service_id}' cannot be bound as {bound_as:?}"
    )]
    ParameterKindMismatch {
        /// The service the binding targets.
        service_id: String,
        /// The parameter id.
        parameter_id: String,
        /// The role the workflow tried to bind it as.
        bound_as: ServiceParameterKind,
    },

    /// A required parameter has neither a binding nor a default.
    #[error("Required parameter '{parameter_id}' of service '{service_id}' is unbound")]
    MissingParameter {
        /// The service.
        service_id: String,
        /// The unbound parameter id.
        parameter_id: String,
    },

    /// An input references a variable no action produces and no declaration
    /// provides.
    #[error("Unknown variable '{variable_id}'")]
    UnknownVariable {
        /// The unresolved variable id.
        variable_id: String,
    },

    /// Two actions write to the same output variable.
    #[error("Variable '{variable_id}' is assigned by more than one action")]
    DuplicateAssignment {
        /// The doubly-assigned variable id.
        variable_id: String,
    },
}

/// All validation failures of a workflow, reported together.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid workflow: {}", .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
pub struct ValidationErrors(pub Vec<ValidationError>);

/// Collect every variable id the workflow can ever assign: declared
/// variables, execute-action outputs, for-each enumerators, and for-each
/// collection outputs.
fn assignable_variables(actions: &[Action], vars: &mut HashSet<String>) {
    for action in actions {
        match action {
            Action::Execute(exec) => {
                for output in &exec.outputs {
                    vars.insert(output.var.clone());
                }
            }
            Action::ForEach(fe) => {
                vars.insert(fe.enumerator.clone());
                if let Some(output) = &fe.output {
                    vars.insert(output.clone());
                }
                assignable_variables(&fe.actions, vars);
            }
        }
    }
}

fn check_actions(
    actions: &[Action],
    catalog: &ServiceCatalog,
    known_vars: &HashSet<String>,
    assigned: &mut HashSet<String>,
    errors: &mut Vec<ValidationError>,
) {
    for action in actions {
        match action {
            Action::Execute(exec) => {
                let Some(service) = catalog.get(&exec.service) else {
                    errors.push(ValidationError::UnknownService {
                        service_id: exec.service.clone(),
                    });
                    continue;
                };

                for input in &exec.inputs {
                    match service.parameter(&input.id) {
                        None => errors.push(ValidationError::UnknownParameter {
                            service_id: service.id.clone(),
                            parameter_id: input.id.clone(),
                        }),
                        Some(p) if p.kind == ServiceParameterKind::Output => {
                            errors.push(ValidationError::ParameterKindMismatch {
                                service_id: service.id.clone(),
                                parameter_id: input.id.clone(),
                                bound_as: ServiceParameterKind::Input,
                            })
                        }
                        Some(_) => {}
                    }
                    if let Binding::Var { var } = &input.binding {
                        if !known_vars.contains(var) {
                            errors.push(ValidationError::UnknownVariable {
                                variable_id: var.clone(),
                            });
                        }
                    }
                }

                for output in &exec.outputs {
                    match service.parameter(&output.id) {
                        None => errors.push(ValidationError::UnknownParameter {
                            service_id: service.id.clone(),
                            parameter_id: output.id.clone(),
                        }),
                        Some(p) if p.kind != ServiceParameterKind::Output => {
                            errors.push(ValidationError::ParameterKindMismatch {
                                service_id: service.id.clone(),
                                parameter_id: output.id.clone(),
                                bound_as: ServiceParameterKind::Output,
                            })
                        }
                        Some(_) => {}
                    }
                    if !assigned.insert(output.var.clone()) {
                        errors.push(ValidationError::DuplicateAssignment {
                            variable_id: output.var.clone(),
                        });
                    }
                }

                // Every required parameter must be bound or have a default
                for parameter in &service.parameters {
                    if parameter.cardinality.min == 0 || parameter.default.is_some() {
                        continue;
                    }
                    let bound = match parameter.kind {
                        ServiceParameterKind::Input => {
                            exec.inputs.iter().any(|i| i.id == parameter.id)
                                || exec.parameters.iter().any(|p| p.id == parameter.id)
                        }
                        ServiceParameterKind::Output => {
                            exec.outputs.iter().any(|o| o.id == parameter.id)
                        }
                        ServiceParameterKind::Argument => {
                            exec.parameters.iter().any(|p| p.id == parameter.id)
                                || exec.inputs.iter().any(|i| i.id == parameter.id)
                        }
                    };
                    if !bound {
                        errors.push(ValidationError::MissingParameter {
                            service_id: service.id.clone(),
                            parameter_id: parameter.id.clone(),
                        });
                    }
                }
            }
            Action::ForEach(fe) => {
                if !known_vars.contains(&fe.input) {
                    errors.push(ValidationError::UnknownVariable {
                        variable_id: fe.input.clone(),
                    });
                }
                if let Some(output) = &fe.output {
                    if !assigned.insert(output.clone()) {
                        errors.push(ValidationError::DuplicateAssignment {
                            variable_id: output.clone(),
                        });
                    }
                }
                if let Some(yielded) = &fe.yield_to_output {
                    if !known_vars.contains(yielded) {
                        errors.push(ValidationError::UnknownVariable {
                            variable_id: yielded.clone(),
                        });
                    }
                }
                check_actions(&fe.actions, catalog, known_vars, assigned, errors);
            }
        }
    }
}

/// Validate a workflow against the catalog. Returns all failures at once.
pub fn validate_workflow(
    workflow: &Workflow,
    catalog: &ServiceCatalog,
) -> Result<(), ValidationErrors> {
    let mut errors = Vec::new();

    if workflow.actions.is_empty() {
        errors.push(ValidationError::EmptyWorkflow);
    }

    let mut known_vars: HashSet<String> =
        workflow.vars.iter().map(|v| v.id.clone()).collect();
    assignable_variables(&workflow.actions, &mut known_vars);

    let mut assigned = HashSet::new();
    check_actions(
        &workflow.actions,
        catalog,
        &known_vars,
        &mut assigned,
        &mut errors,
    );

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ValidationErrors(errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use steep_model::{
        Cardinality, ExecuteAction, InputParameter, OutputParameter, Service, ServiceParameter,
        Variable, RUNTIME_OTHER,
    };

    fn copy_service() -> Service {
        Service {
            id: "copy".to_string(),
            name: None,
            path: "/bin/copy".to_string(),
            runtime: RUNTIME_OTHER.to_string(),
            required_capabilities: Default::default(),
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

    fn simple_workflow() -> Workflow {
        Workflow {
            name: None,
            vars: vec![Variable::with_value("in", json!("/data/in.txt"))],
            actions: vec![Action::Execute(ExecuteAction {
                service: "copy".to_string(),
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
                parameters: vec![],
            })],
        }
    }

    #[test]
    fn test_valid_workflow_passes() {
        let catalog = ServiceCatalog::new([copy_service()]);
        assert!(validate_workflow(&simple_workflow(), &catalog).is_ok());
    }

    #[test]
    fn test_unknown_service_is_reported() {
        let catalog = ServiceCatalog::new([]);
        let errors = validate_workflow(&simple_workflow(), &catalog).unwrap_err();
        assert!(errors
            .0
            .iter()
            .any(|e| matches!(e, ValidationError::UnknownService { service_id } if service_id == "copy")));
    }

    #[test]
    fn test_unknown_variable_is_reported() {
        let catalog = ServiceCatalog::new([copy_service()]);
        let mut workflow = simple_workflow();
        workflow.vars.clear();
        let errors = validate_workflow(&workflow, &catalog).unwrap_err();
        assert!(errors
            .0
            .iter()
            .any(|e| matches!(e, ValidationError::UnknownVariable { variable_id } if variable_id == "in")));
    }

    #[test]
    fn test_missing_required_parameter_is_reported() {
        let catalog = ServiceCatalog::new([copy_service()]);
        let mut workflow = simple_workflow();
        if let Action::Execute(exec) = &mut workflow.actions[0] {
            exec.inputs.clear();
        }
        let errors = validate_workflow(&workflow, &catalog).unwrap_err();
        assert!(errors
            .0
            .iter()
            .any(|e| matches!(e, ValidationError::MissingParameter { parameter_id, .. } if parameter_id == "input")));
    }

    #[test]
    fn test_duplicate_assignment_is_reported() {
        let catalog = ServiceCatalog::new([copy_service()]);
        let mut workflow = simple_workflow();
        let duplicate = workflow.actions[0].clone();
        workflow.actions.push(duplicate);
        let errors = validate_workflow(&workflow, &catalog).unwrap_err();
        assert!(errors
            .0
            .iter()
            .any(|e| matches!(e, ValidationError::DuplicateAssignment { variable_id } if variable_id == "out")));
    }

    #[test]
    fn test_empty_workflow_is_reported() {
        let catalog = ServiceCatalog::new([copy_service()]);
        let workflow = Workflow {
            name: None,
            vars: vec![],
            actions: vec![],
        };
        let errors = validate_workflow(&workflow, &catalog).unwrap_err();
        assert_eq!(errors.0, vec![ValidationError::EmptyWorkflow]);
    }
}
