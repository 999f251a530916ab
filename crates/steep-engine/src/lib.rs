// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Steep Rule Engine
//!
//! Transforms a workflow into a sequence of process chains: linear groups of
//! executables sharing inputs and outputs. The engine is driven iteratively:
//! each call to [`RuleEngine::generate`] consumes the outputs that have
//! become known since the last call and emits every chain that is now
//! producible, until it reports that no further chains can ever be produced.
//!
//! The engine is deterministic: given the same workflow and the same partial
//! outputs it emits the same chains with the same ids. Its progress can be
//! snapshotted ([`RuleEngine::to_state`]) and restored
//! ([`RuleEngine::resume`]) so decomposition survives a restart.

mod engine;
pub mod validation;

pub use engine::{Generation, RuleEngine};
pub use validation::{validate_workflow, ValidationError, ValidationErrors};
