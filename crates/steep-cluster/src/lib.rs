// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Steep Cluster - Agents, Event Bus and Chain Execution
//!
//! This crate contains the cluster-facing half of Steep:
//!
//! - [`bus`]: the event bus abstraction every component communicates over
//!   (publish/subscribe plus request/reply on named addresses)
//! - [`registry`]: the cluster-wide directory of agents, candidate
//!   selection and lease allocation
//! - [`agent`]: the local agent serving `allocate`/`execute`/`cancel`
//!   requests on its `agent.<id>` address
//! - [`execute`]: the chain executor (directory preparation, ordered
//!   executables, retry, progress reporting, output collection)
//! - [`runtime`]: runtimes that invoke executables (`docker`, `other`,
//!   plugins) and the plugin registry
//!
//! # Architecture
//!
//! ```text
//! Scheduler ──selectCandidates──▶ RemoteAgentRegistry
//!     │                                │
//!     │ tryAllocate ────────────────▶  │ request agent.<id>
//!     │                                ▼
//!     │ execute ───────────────▶ LocalAgent ──▶ ChainExecutor ──▶ Runtime
//!     │                                │
//!     ◀── results / error ────────────┘
//! ```
//!
//! Exactly one agent at a time holds a running chain; the agent enforces
//! this with a lease that expires after `busyTimeout` when no chain arrives
//! and after `idleTimeout` following each completed chain.

pub mod agent;
pub mod bus;
pub mod cancel;
pub mod execute;
pub mod messages;
pub mod mkdir_cache;
pub mod output;
pub mod registry;
pub mod runtime;

pub use agent::{AgentConfig, LocalAgent};
pub use bus::{addresses, BusError, Delivery, EventBus, LocalEventBus};
pub use cancel::CancelToken;
pub use execute::{ChainExecutor, ExecuteError};
pub use registry::{AgentInfo, AllocatedAgent, RemoteAgentRegistry};
pub use runtime::{PluginRegistry, Runtime, RuntimeError};
