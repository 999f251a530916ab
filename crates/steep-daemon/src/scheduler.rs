// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scheduler.
//!
//! Assigns registered process chains to capability-matched agents. A tick
//! runs on a fixed interval and whenever new chains are announced on the
//! bus. Allocation happens before the chain is claimed, so a failed
//! allocation releases nothing: the chain simply stays registered for the
//! next tick. Every transition out of `Running` is a compare-and-swap, so
//! the scheduler never overwrites a chain a peer or the orphan scan
//! already moved.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use steep_cluster::messages::ExecuteReply;
use steep_cluster::{addresses, AllocatedAgent, EventBus, ExecuteError, RemoteAgentRegistry};
use steep_model::{ProcessChain, ProcessChainStatus};
use steep_registry::SubmissionRegistry;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Assigns registered chains to allocated agents and persists outcomes.
pub struct Scheduler {
    registry: Arc<dyn SubmissionRegistry>,
    agents: Arc<RemoteAgentRegistry>,
    bus: Arc<dyn EventBus>,
    lookup_interval: Duration,
    shutdown: Arc<Notify>,
}

impl Scheduler {
    /// Create a scheduler.
    pub fn new(
        registry: Arc<dyn SubmissionRegistry>,
        agents: Arc<RemoteAgentRegistry>,
        bus: Arc<dyn EventBus>,
        lookup_interval: Duration,
    ) -> Self {
        Self {
            registry,
            agents,
            bus,
            lookup_interval,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the scheduler loop: periodic ticks plus bus nudges when new
    /// chains are registered.
    pub async fn run(&self) {
        let mut registered = self.bus.subscribe(addresses::PROCESS_CHAIN_REGISTERED);
        info!(
            lookup_interval_ms = self.lookup_interval.as_millis() as u64,
            "Scheduler started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Scheduler shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.lookup_interval) => {
                    self.tick().await;
                }
                event = registered.recv() => {
                    if event.is_ok() {
                        self.tick().await;
                    }
                }
            }
        }
    }

    /// One scheduling pass: group pending chains by capabilities, select
    /// candidate agents, and dispatch as many chains as the agents accept.
    pub async fn tick(&self) {
        let chains = match self
            .registry
            .find_process_chains_by_status(ProcessChainStatus::Registered)
            .await
        {
            Ok(chains) => chains,
            Err(err) => {
                // Storage hiccup: skip this tick, the next one retries
                error!(error = %err, "Failed to look up registered chains");
                return;
            }
        };
        if chains.is_empty() {
            return;
        }

        let mut groups: BTreeMap<BTreeSet<String>, usize> = BTreeMap::new();
        for chain in &chains {
            *groups.entry(chain.required_capabilities.clone()).or_default() += 1;
        }
        let required: Vec<(BTreeSet<String>, usize)> = groups.into_iter().collect();
        debug!(groups = required.len(), pending = chains.len(), "Scheduling pass");

        let candidates = self.agents.select_candidates(&required).await;
        for (_, address) in candidates {
            let Some(agent) = self.agents.try_allocate(&address).await else {
                // Allocation miss is not an error; nothing was claimed
                debug!(address, "Agent allocation missed");
                continue;
            };
            self.dispatch_to(agent).await;
        }
    }

    /// Feed the allocated agent chains matching its capabilities until
    /// none remain (or dispatch fails), then release it.
    async fn dispatch_to(&self, agent: AllocatedAgent) {
        loop {
            let chain = match self.next_chain_for(&agent.address).await {
                Ok(Some(chain)) => chain,
                Ok(None) => break,
                Err(err) => {
                    error!(error = %err, "Failed to claim a chain");
                    break;
                }
            };

            let chain_id = chain.id.clone();
            info!(
                process_chain_id = %chain_id,
                address = %agent.address,
                "Dispatching process chain"
            );

            if let Err(err) = self.mark_dispatched(&chain_id, &agent.address).await {
                error!(process_chain_id = %chain_id, error = %err, "Failed to record dispatch");
            }

            match agent.execute(&chain).await {
                Ok(reply) => {
                    if let Err(err) = self.persist_outcome(&chain_id, reply).await {
                        error!(
                            process_chain_id = %chain_id,
                            error = %err,
                            "Failed to persist chain outcome"
                        );
                    }
                }
                Err(err) => {
                    // Reply lost: the chain's fate is unknown. Leave it
                    // RUNNING; the orphan scan reclaims it if the node is
                    // gone.
                    warn!(
                        process_chain_id = %chain_id,
                        address = %agent.address,
                        error = %err,
                        "Dispatch reply lost"
                    );
                    return;
                }
            }
        }

        agent.deallocate().await;
    }

    /// Claim the next registered chain this agent can run.
    async fn next_chain_for(
        &self,
        address: &str,
    ) -> steep_registry::Result<Option<ProcessChain>> {
        // Claim within the capability groups the agent matches, in
        // insertion order per group
        let chains = self
            .registry
            .find_process_chains_by_status(ProcessChainStatus::Registered)
            .await?;
        for chain in chains {
            if !self.agent_matches(address, &chain.required_capabilities).await {
                continue;
            }
            let claimed = self
                .registry
                .fetch_next_process_chain(
                    ProcessChainStatus::Registered,
                    ProcessChainStatus::Running,
                    Some(&chain.required_capabilities),
                )
                .await?;
            if claimed.is_some() {
                return Ok(claimed);
            }
        }
        Ok(None)
    }

    async fn agent_matches(&self, address: &str, capabilities: &BTreeSet<String>) -> bool {
        self.agents
            .capabilities_of(address)
            .await
            .is_some_and(|agent_caps| capabilities.is_subset(&agent_caps))
    }

    async fn mark_dispatched(
        &self,
        chain_id: &str,
        address: &str,
    ) -> steep_registry::Result<()> {
        self.registry
            .set_process_chain_agent(chain_id, Some(address))
            .await?;
        self.registry
            .set_process_chain_start_time(chain_id, Utc::now())
            .await
    }

    /// Map the agent's reply to persisted status, results and error
    /// message. All transitions are compare-and-swap from `Running`.
    async fn persist_outcome(
        &self,
        chain_id: &str,
        reply: ExecuteReply,
    ) -> steep_registry::Result<()> {
        match reply {
            ExecuteReply::Success { results } => {
                let swapped = self
                    .registry
                    .set_process_chain_status_if(
                        chain_id,
                        ProcessChainStatus::Running,
                        ProcessChainStatus::Success,
                    )
                    .await?;
                if swapped {
                    self.registry
                        .set_process_chain_results(chain_id, Some(&results))
                        .await?;
                    self.registry
                        .set_process_chain_end_time(chain_id, Utc::now())
                        .await?;
                    info!(process_chain_id = %chain_id, "Process chain succeeded");
                }
            }
            ExecuteReply::Error {
                message,
                last_output,
                exit_code,
            } => {
                let swapped = self
                    .registry
                    .set_process_chain_status_if(
                        chain_id,
                        ProcessChainStatus::Running,
                        ProcessChainStatus::Error,
                    )
                    .await?;
                if swapped {
                    let error = ExecuteError::Execution {
                        message,
                        last_output,
                        exit_code,
                    };
                    self.registry
                        .set_process_chain_error_message(
                            chain_id,
                            Some(&error.formatted_message()),
                        )
                        .await?;
                    self.registry
                        .set_process_chain_end_time(chain_id, Utc::now())
                        .await?;
                    warn!(process_chain_id = %chain_id, "Process chain failed");
                }
            }
            ExecuteReply::Cancelled => {
                let swapped = self
                    .registry
                    .set_process_chain_status_if(
                        chain_id,
                        ProcessChainStatus::Running,
                        ProcessChainStatus::Cancelled,
                    )
                    .await?;
                if swapped {
                    self.registry
                        .set_process_chain_end_time(chain_id, Utc::now())
                        .await?;
                    info!(process_chain_id = %chain_id, "Process chain cancelled");
                }
            }
        }
        Ok(())
    }
}
