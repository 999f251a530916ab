// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Steep Submission Registry
//!
//! The durable store the core components coordinate through: submissions,
//! their process chains, statuses, and results. The contract is narrow and
//! linearizable where it matters:
//!
//! - [`SubmissionRegistry::fetch_next_submission`] and
//!   [`SubmissionRegistry::fetch_next_process_chain`] atomically claim one
//!   record; a record is returned to at most one caller.
//! - [`SubmissionRegistry::set_process_chain_status_if`] is a
//!   compare-and-swap; callers use it to avoid stealing chains already
//!   claimed by a peer.
//!
//! Two backends ship: [`inmemory::InMemoryRegistry`] (tests and single-node
//! deployments) and [`postgres::PostgresRegistry`].

pub mod inmemory;
pub mod postgres;

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use steep_model::{ProcessChain, ProcessChainStatus, Submission, SubmissionStatus};
use thiserror::Error;

pub use inmemory::InMemoryRegistry;
pub use postgres::PostgresRegistry;

/// Errors a registry operation may fail with.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum RegistryError {
    /// The referenced submission or process chain does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The operation conflicts with the record's current state.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The storage backend failed.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Result type for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Result values of a submission or process chain: output variable id to
/// the concrete values produced.
pub type ResultMap = HashMap<String, Vec<Value>>;

/// Durable store of submissions and process chains.
#[allow(missing_docs)]
#[async_trait]
pub trait SubmissionRegistry: Send + Sync {
    // ------------------------------------------------------------------
    // Submissions
    // ------------------------------------------------------------------

    async fn add_submission(&self, submission: &Submission) -> Result<()>;

    async fn find_submission_by_id(&self, submission_id: &str) -> Result<Option<Submission>>;

    async fn find_submissions_by_status(
        &self,
        status: SubmissionStatus,
    ) -> Result<Vec<Submission>>;

    async fn count_submissions(&self) -> Result<u64>;

    /// Atomically claim one submission in `current` status, moving it to
    /// `new`. Claims in insertion order; returns `None` when nothing is
    /// eligible.
    async fn fetch_next_submission(
        &self,
        current: SubmissionStatus,
        new: SubmissionStatus,
    ) -> Result<Option<Submission>>;

    async fn set_submission_status(
        &self,
        submission_id: &str,
        status: SubmissionStatus,
    ) -> Result<()>;

    async fn get_submission_status(&self, submission_id: &str) -> Result<SubmissionStatus>;

    async fn set_submission_start_time(
        &self,
        submission_id: &str,
        start_time: DateTime<Utc>,
    ) -> Result<()>;

    async fn set_submission_end_time(
        &self,
        submission_id: &str,
        end_time: DateTime<Utc>,
    ) -> Result<()>;

    async fn set_submission_results(
        &self,
        submission_id: &str,
        results: Option<&ResultMap>,
    ) -> Result<()>;

    async fn get_submission_results(&self, submission_id: &str) -> Result<Option<ResultMap>>;

    async fn set_submission_error_message(
        &self,
        submission_id: &str,
        error_message: Option<&str>,
    ) -> Result<()>;

    /// Store the rule engine's opaque progress snapshot.
    async fn set_submission_execution_state(
        &self,
        submission_id: &str,
        state: Option<&Value>,
    ) -> Result<()>;

    async fn get_submission_execution_state(&self, submission_id: &str)
        -> Result<Option<Value>>;

    // ------------------------------------------------------------------
    // Process chains
    // ------------------------------------------------------------------

    /// Atomically store a batch of process chains in `Registered` status.
    /// Rejects with [`RegistryError::NotFound`] if the submission is
    /// unknown; either all chains are stored or none.
    async fn add_process_chains(
        &self,
        chains: &[ProcessChain],
        submission_id: &str,
    ) -> Result<()>;

    async fn find_process_chain_by_id(&self, chain_id: &str) -> Result<Option<ProcessChain>>;

    /// Chains of a submission, in insertion order.
    async fn find_process_chains_by_submission(
        &self,
        submission_id: &str,
    ) -> Result<Vec<ProcessChain>>;

    async fn find_process_chains_by_status(
        &self,
        status: ProcessChainStatus,
    ) -> Result<Vec<ProcessChain>>;

    async fn count_process_chains_by_status(
        &self,
        submission_id: &str,
        status: ProcessChainStatus,
    ) -> Result<u64>;

    /// Atomically claim one chain in `current` status, moving it to `new`.
    /// Claims in insertion order; when `required_capabilities` is given,
    /// only chains with exactly that capability set are considered.
    async fn fetch_next_process_chain(
        &self,
        current: ProcessChainStatus,
        new: ProcessChainStatus,
        required_capabilities: Option<&BTreeSet<String>>,
    ) -> Result<Option<ProcessChain>>;

    async fn set_process_chain_status(
        &self,
        chain_id: &str,
        status: ProcessChainStatus,
    ) -> Result<()>;

    /// Compare-and-swap form: the status is changed only if the current
    /// status equals `expected`. Returns whether the swap happened.
    async fn set_process_chain_status_if(
        &self,
        chain_id: &str,
        expected: ProcessChainStatus,
        status: ProcessChainStatus,
    ) -> Result<bool>;

    async fn get_process_chain_status(&self, chain_id: &str) -> Result<ProcessChainStatus>;

    /// Conditional bulk update: every chain of the submission whose status
    /// equals `expected` is moved to `status`. Returns the number of
    /// updated chains.
    async fn set_all_process_chain_statuses_by_submission(
        &self,
        submission_id: &str,
        expected: ProcessChainStatus,
        status: ProcessChainStatus,
    ) -> Result<u64>;

    /// Record (or clear) the address of the agent owning a running chain.
    async fn set_process_chain_agent(
        &self,
        chain_id: &str,
        agent_address: Option<&str>,
    ) -> Result<()>;

    async fn get_process_chain_agent(&self, chain_id: &str) -> Result<Option<String>>;

    /// All chains in the given status with their recorded agent address.
    /// The orphan scan uses this to find chains owned by vanished nodes.
    async fn find_process_chain_agents_by_status(
        &self,
        status: ProcessChainStatus,
    ) -> Result<Vec<(String, Option<String>)>>;

    async fn set_process_chain_start_time(
        &self,
        chain_id: &str,
        start_time: DateTime<Utc>,
    ) -> Result<()>;

    async fn set_process_chain_end_time(
        &self,
        chain_id: &str,
        end_time: DateTime<Utc>,
    ) -> Result<()>;

    async fn set_process_chain_results(
        &self,
        chain_id: &str,
        results: Option<&ResultMap>,
    ) -> Result<()>;

    async fn get_process_chain_results(&self, chain_id: &str) -> Result<Option<ResultMap>>;

    async fn set_process_chain_error_message(
        &self,
        chain_id: &str,
        error_message: Option<&str>,
    ) -> Result<()>;

    async fn get_process_chain_error_message(&self, chain_id: &str) -> Result<Option<String>>;
}
