// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Service catalog metadata.
//!
//! Services describe the external programs workflows may invoke: where the
//! binary lives, which runtime invokes it, which capabilities an agent must
//! advertise, and the parameter schema the rule engine resolves bindings
//! against.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The role of a service parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ServiceParameterKind {
    /// Consumes a file produced upstream or supplied by the user.
    Input,
    /// Produces a file or directory.
    Output,
    /// A plain argument without dataflow meaning.
    Argument,
}

/// How many values a parameter accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cardinality {
    /// Minimum number of values; `0` makes the parameter optional.
    pub min: u32,
    /// Maximum number of values.
    pub max: u32,
}

impl Cardinality {
    /// Exactly one value.
    pub fn once() -> Self {
        Self { min: 1, max: 1 }
    }

    /// Zero or one value.
    pub fn optional() -> Self {
        Self { min: 0, max: 1 }
    }
}

/// One parameter of a service's schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceParameter {
    /// Parameter id, matched against workflow bindings.
    pub id: String,

    /// Flag label inserted before the value on the command line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    /// The parameter's role.
    #[serde(rename = "type")]
    pub kind: ServiceParameterKind,

    /// Declared data type (e.g. `string`, `integer`, `directory`). Output
    /// adapters are keyed by this.
    pub data_type: String,

    /// Accepted number of values.
    pub cardinality: Cardinality,

    /// Default used when an optional parameter is unbound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// A callable service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    /// Unique service id, referenced by execute actions.
    pub id: String,

    /// Human-readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Binary path (or image name for the Docker runtime).
    pub path: String,

    /// Runtime invoking this service (`docker`, `other`, or a plugin id).
    pub runtime: String,

    /// Capabilities an agent must advertise to run this service.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub required_capabilities: BTreeSet<String>,

    /// Parameter schema.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<ServiceParameter>,

    /// Default retry policy applied to executables of this service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<crate::RetryPolicy>,
}

impl Service {
    /// Look up a parameter by id.
    pub fn parameter(&self, id: &str) -> Option<&ServiceParameter> {
        self.parameters.iter().find(|p| p.id == id)
    }
}

/// The set of services available to workflows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceCatalog {
    services: HashMap<String, Service>,
}

impl ServiceCatalog {
    /// Build a catalog from a list of services. Later duplicates win.
    pub fn new(services: impl IntoIterator<Item = Service>) -> Self {
        Self {
            services: services.into_iter().map(|s| (s.id.clone(), s)).collect(),
        }
    }

    /// Look up a service by id.
    pub fn get(&self, id: &str) -> Option<&Service> {
        self.services.get(id)
    }

    /// Number of registered services.
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Whether the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_parameter_lookup() {
        let service = Service {
            id: "copy".to_string(),
            name: None,
            path: "/bin/copy".to_string(),
            runtime: crate::RUNTIME_OTHER.to_string(),
            required_capabilities: BTreeSet::new(),
            parameters: vec![ServiceParameter {
                id: "input".to_string(),
                label: Some("-i".to_string()),
                kind: ServiceParameterKind::Input,
                data_type: "file".to_string(),
                cardinality: Cardinality::once(),
                default: None,
            }],
            retries: None,
        };

        assert!(service.parameter("input").is_some());
        assert!(service.parameter("missing").is_none());

        let catalog = ServiceCatalog::new([service]);
        assert_eq!(catalog.len(), 1);
        assert!(catalog.get("copy").is_some());
        assert!(catalog.get("move").is_none());
    }
}
