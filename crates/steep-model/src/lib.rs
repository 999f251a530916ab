// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Steep Model - Shared Data Types
//!
//! This crate defines the data model shared by every other Steep crate:
//!
//! - [`workflow`]: user-submitted workflows (actions over typed variables)
//! - [`process_chain`]: executable units produced by the rule engine
//! - [`submission`]: submission lifecycle records and statuses
//! - [`service`]: the service catalog (metadata describing callable services)
//!
//! All types serialize as JSON with camelCase field names; serializing and
//! then deserializing a [`submission::Submission`] or a
//! [`process_chain::ProcessChain`] is the identity.

pub mod process_chain;
pub mod service;
pub mod submission;
pub mod workflow;

pub use process_chain::{
    Argument, ArgumentType, ArgumentVariable, Executable, ProcessChain, RetryCondition,
    RetryPolicy,
};
pub use service::{Cardinality, Service, ServiceCatalog, ServiceParameter, ServiceParameterKind};
pub use submission::{ProcessChainStatus, Submission, SubmissionStatus};
pub use workflow::{
    Action, Binding, ExecuteAction, ForEachAction, GenericParameter, InputParameter,
    OutputParameter, Variable, Workflow,
};

/// Identifier of the built-in Docker runtime.
pub const RUNTIME_DOCKER: &str = "docker";

/// Identifier of the built-in plain-process runtime.
pub const RUNTIME_OTHER: &str = "other";
