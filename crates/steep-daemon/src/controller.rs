// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Controller.
//!
//! Drives the submission lifecycle: claims accepted submissions, runs the
//! rule engine iteratively as chain results become known, persists
//! produced chains and the engine's execution state, finalizes submissions
//! once nothing further can be produced, cancels on request, and reclaims
//! orphaned chains whose owning agent vanished from the cluster.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use steep_cluster::{addresses, EventBus, RemoteAgentRegistry};
use steep_engine::RuleEngine;
use steep_model::{
    ProcessChainStatus, ServiceCatalog, Submission, SubmissionStatus,
};
use steep_registry::{RegistryError, ResultMap, SubmissionRegistry};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// How terminal chain statuses combine into the final submission status.
#[derive(Debug, Clone, Copy)]
pub struct FinalizePolicy {
    /// When `true` (the default), a mix of successful and cancelled chains
    /// finalizes as `PartialSuccess`; when `false` it finalizes as
    /// `Cancelled`.
    pub cancelled_counts_as_partial: bool,
}

impl Default for FinalizePolicy {
    fn default() -> Self {
        Self {
            cancelled_counts_as_partial: true,
        }
    }
}

/// Drives submissions from `Accepted` to a terminal status.
pub struct Controller {
    registry: Arc<dyn SubmissionRegistry>,
    agents: Arc<RemoteAgentRegistry>,
    bus: Arc<dyn EventBus>,
    catalog: ServiceCatalog,
    out_path: String,
    lookup_interval: Duration,
    orphans_interval: Duration,
    policy: FinalizePolicy,
    shutdown: Arc<Notify>,
}

impl Controller {
    /// Create a controller.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<dyn SubmissionRegistry>,
        agents: Arc<RemoteAgentRegistry>,
        bus: Arc<dyn EventBus>,
        catalog: ServiceCatalog,
        out_path: impl Into<String>,
        lookup_interval: Duration,
        orphans_interval: Duration,
        policy: FinalizePolicy,
    ) -> Self {
        Self {
            registry,
            agents,
            bus,
            catalog,
            out_path: out_path.into(),
            lookup_interval,
            orphans_interval,
            policy,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the controller loop until shutdown.
    pub async fn run(&self) {
        info!(
            lookup_interval_ms = self.lookup_interval.as_millis() as u64,
            orphans_interval_ms = self.orphans_interval.as_millis() as u64,
            "Controller started"
        );

        let mut orphan_elapsed = Duration::ZERO;
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Controller shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.lookup_interval) => {
                    self.tick().await;

                    orphan_elapsed += self.lookup_interval;
                    if orphan_elapsed >= self.orphans_interval {
                        orphan_elapsed = Duration::ZERO;
                        self.orphan_scan().await;
                    }
                }
            }
        }
    }

    /// One controller pass: claim accepted submissions, then advance every
    /// running one.
    pub async fn tick(&self) {
        loop {
            match self
                .registry
                .fetch_next_submission(SubmissionStatus::Accepted, SubmissionStatus::Running)
                .await
            {
                Ok(Some(submission)) => {
                    info!(submission_id = %submission.id, "Starting submission");
                    if let Err(err) = self
                        .registry
                        .set_submission_start_time(&submission.id, Utc::now())
                        .await
                    {
                        error!(submission_id = %submission.id, error = %err, "Failed to set start time");
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    error!(error = %err, "Failed to claim a submission");
                    break;
                }
            }
        }

        let running = match self
            .registry
            .find_submissions_by_status(SubmissionStatus::Running)
            .await
        {
            Ok(running) => running,
            Err(err) => {
                error!(error = %err, "Failed to look up running submissions");
                return;
            }
        };

        for submission in running {
            if let Err(err) = self.advance(&submission).await {
                error!(
                    submission_id = %submission.id,
                    error = %err,
                    "Failed to advance submission"
                );
            }
        }
    }

    /// Advance one running submission: feed known outputs to the rule
    /// engine, persist new chains, and finalize when nothing more can be
    /// produced.
    async fn advance(&self, submission: &Submission) -> Result<(), RegistryError> {
        let mut engine = match self.build_engine(submission).await? {
            Some(engine) => engine,
            None => return Ok(()), // failed validation, submission finalized
        };

        let outputs = self.known_outputs(&submission.id).await?;
        let generation = engine.generate(&outputs);

        if !generation.process_chains.is_empty() {
            info!(
                submission_id = %submission.id,
                chains = generation.process_chains.len(),
                "Registering process chains"
            );
            self.registry
                .add_process_chains(&generation.process_chains, &submission.id)
                .await?;
        }

        let state = engine
            .to_state()
            .map_err(|e| RegistryError::Unavailable(format!("state serialization: {e}")))?;
        self.registry
            .set_submission_execution_state(&submission.id, Some(&state))
            .await?;

        if !generation.process_chains.is_empty() {
            self.bus
                .publish(addresses::PROCESS_CHAIN_REGISTERED, Value::Null)
                .await;
            return Ok(());
        }

        self.maybe_finalize(&submission.id, generation.finished, &engine)
            .await
    }

    /// Build (or resume) the rule engine for a submission. On a validation
    /// failure the submission is finalized as `Error` and `None` is
    /// returned.
    async fn build_engine(
        &self,
        submission: &Submission,
    ) -> Result<Option<RuleEngine>, RegistryError> {
        let state = self
            .registry
            .get_submission_execution_state(&submission.id)
            .await?;

        if let Some(state) = state {
            return RuleEngine::resume(
                submission.id.clone(),
                self.catalog.clone(),
                self.out_path.clone(),
                state,
            )
            .map(Some)
            .map_err(|e| RegistryError::Unavailable(format!("corrupt execution state: {e}")));
        }

        match RuleEngine::new(
            submission.id.clone(),
            &submission.workflow,
            self.catalog.clone(),
            self.out_path.clone(),
        ) {
            Ok(engine) => Ok(Some(engine)),
            Err(validation) => {
                warn!(
                    submission_id = %submission.id,
                    error = %validation,
                    "Workflow failed validation"
                );
                self.registry
                    .set_submission_error_message(&submission.id, Some(&validation.to_string()))
                    .await?;
                self.registry
                    .set_submission_status(&submission.id, SubmissionStatus::Error)
                    .await?;
                self.registry
                    .set_submission_end_time(&submission.id, Utc::now())
                    .await?;
                Ok(None)
            }
        }
    }

    /// Collect the results of every successful chain of the submission.
    /// Feeding the full set on every pass keeps the engine's merge
    /// idempotent.
    async fn known_outputs(
        &self,
        submission_id: &str,
    ) -> Result<HashMap<String, Vec<Value>>, RegistryError> {
        let chains = self
            .registry
            .find_process_chains_by_submission(submission_id)
            .await?;
        let mut outputs = HashMap::new();
        for chain in chains {
            let status = self.registry.get_process_chain_status(&chain.id).await?;
            if status != ProcessChainStatus::Success {
                continue;
            }
            if let Some(results) = self.registry.get_process_chain_results(&chain.id).await? {
                outputs.extend(results);
            }
        }
        Ok(outputs)
    }

    /// Finalize the submission if all chains are terminal and the engine
    /// cannot produce anything further.
    async fn maybe_finalize(
        &self,
        submission_id: &str,
        engine_finished: bool,
        engine: &RuleEngine,
    ) -> Result<(), RegistryError> {
        let count = |status| self.registry.count_process_chains_by_status(submission_id, status);

        let registered = count(ProcessChainStatus::Registered).await?;
        let running = count(ProcessChainStatus::Running).await?;
        if registered > 0 || running > 0 {
            return Ok(());
        }

        let succeeded = count(ProcessChainStatus::Success).await?;
        let failed = count(ProcessChainStatus::Error).await?;
        let cancelled = count(ProcessChainStatus::Cancelled).await?;

        // With failed or cancelled chains the engine can be permanently
        // stuck on their missing outputs; that also ends the submission.
        if !engine_finished && failed == 0 && cancelled == 0 {
            return Ok(());
        }

        // Only finalize submissions still running (a cancel request may
        // have already moved the status)
        if self.registry.get_submission_status(submission_id).await?
            != SubmissionStatus::Running
        {
            return Ok(());
        }

        let status = if failed == 0 && cancelled == 0 {
            SubmissionStatus::Success
        } else if succeeded > 0 {
            if cancelled > 0 && failed == 0 && !self.policy.cancelled_counts_as_partial {
                SubmissionStatus::Cancelled
            } else {
                SubmissionStatus::PartialSuccess
            }
        } else if failed > 0 {
            SubmissionStatus::Error
        } else {
            SubmissionStatus::Cancelled
        };

        let mut results = self.aggregate_results(submission_id).await?;
        results.extend(engine.yielded_collections());
        if !results.is_empty() {
            self.registry
                .set_submission_results(submission_id, Some(&results))
                .await?;
        }

        if status == SubmissionStatus::Error || status == SubmissionStatus::PartialSuccess {
            if let Some(message) = self.first_error_message(submission_id).await? {
                self.registry
                    .set_submission_error_message(submission_id, Some(&message))
                    .await?;
            }
        }

        self.registry
            .set_submission_status(submission_id, status)
            .await?;
        self.registry
            .set_submission_end_time(submission_id, Utc::now())
            .await?;
        info!(submission_id, ?status, "Submission finalized");
        Ok(())
    }

    async fn aggregate_results(
        &self,
        submission_id: &str,
    ) -> Result<ResultMap, RegistryError> {
        let chains = self
            .registry
            .find_process_chains_by_submission(submission_id)
            .await?;
        let mut results = ResultMap::new();
        for chain in chains {
            if self.registry.get_process_chain_status(&chain.id).await?
                != ProcessChainStatus::Success
            {
                continue;
            }
            if let Some(chain_results) =
                self.registry.get_process_chain_results(&chain.id).await?
            {
                results.extend(chain_results);
            }
        }
        Ok(results)
    }

    async fn first_error_message(
        &self,
        submission_id: &str,
    ) -> Result<Option<String>, RegistryError> {
        let chains = self
            .registry
            .find_process_chains_by_submission(submission_id)
            .await?;
        for chain in chains {
            if let Some(message) = self
                .registry
                .get_process_chain_error_message(&chain.id)
                .await?
            {
                return Ok(Some(message));
            }
        }
        Ok(None)
    }

    /// Cancel a submission: mark it cancelled, bulk-cancel its registered
    /// chains, and interrupt the agents running the rest.
    pub async fn cancel_submission(&self, submission_id: &str) -> Result<(), RegistryError> {
        let status = self.registry.get_submission_status(submission_id).await?;
        if status.is_terminal() {
            return Ok(());
        }

        info!(submission_id, "Cancelling submission");
        self.registry
            .set_submission_status(submission_id, SubmissionStatus::Cancelled)
            .await?;

        let cancelled = self
            .registry
            .set_all_process_chain_statuses_by_submission(
                submission_id,
                ProcessChainStatus::Registered,
                ProcessChainStatus::Cancelled,
            )
            .await?;
        debug!(submission_id, cancelled, "Bulk-cancelled registered chains");

        // Interrupt running chains at their owning agents
        let chains = self
            .registry
            .find_process_chains_by_submission(submission_id)
            .await?;
        for chain in chains {
            if self.registry.get_process_chain_status(&chain.id).await?
                != ProcessChainStatus::Running
            {
                continue;
            }
            if let Some(address) = self.registry.get_process_chain_agent(&chain.id).await? {
                self.agents.cancel(&address).await;
            }
        }

        self.registry
            .set_submission_end_time(submission_id, Utc::now())
            .await?;
        Ok(())
    }

    /// Reset running chains whose owning agent is no longer advertised in
    /// the cluster. The compare-and-swap keeps a slow in-flight result
    /// write from racing the reset.
    pub async fn orphan_scan(&self) {
        let running = match self
            .registry
            .find_process_chain_agents_by_status(ProcessChainStatus::Running)
            .await
        {
            Ok(running) => running,
            Err(err) => {
                error!(error = %err, "Orphan scan failed to list running chains");
                return;
            }
        };

        for (chain_id, agent_address) in running {
            let orphaned = match &agent_address {
                Some(address) => !self.agents.is_advertised(address).await,
                None => true,
            };
            if !orphaned {
                continue;
            }

            match self
                .registry
                .set_process_chain_status_if(
                    &chain_id,
                    ProcessChainStatus::Running,
                    ProcessChainStatus::Registered,
                )
                .await
            {
                Ok(true) => {
                    warn!(
                        process_chain_id = %chain_id,
                        agent = agent_address.as_deref().unwrap_or("<none>"),
                        "Reclaimed orphaned chain"
                    );
                    if let Err(err) = self
                        .registry
                        .set_process_chain_agent(&chain_id, None)
                        .await
                    {
                        error!(process_chain_id = %chain_id, error = %err, "Failed to clear agent");
                    }
                }
                Ok(false) => {}
                Err(err) => {
                    error!(process_chain_id = %chain_id, error = %err, "Orphan reset failed")
                }
            }
        }
    }
}
