// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster-wide agent directory.
//!
//! The registry maintains an advisory view of the agents in the cluster,
//! fed by `cluster.node.added`/`cluster.node.left` announcements plus an
//! `info` inquiry per agent. It selects candidate agents for pending work
//! and hands out allocations; the authoritative mutual exclusion lives at
//! the agent (its lease), not here. Advisory leases in the registry mirror
//! the agent-side expiry so selection can filter busy agents without extra
//! messaging.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::bus::{addresses, BusError, EventBus};
use crate::messages::{AgentRequest, AllocateReply, ExecuteReply, InfoReply};

/// One agent as seen by the registry.
#[derive(Debug, Clone)]
pub struct AgentInfo {
    /// Agent id.
    pub id: String,
    /// Bus address (`agent.<id>`).
    pub address: String,
    /// Advertised capabilities.
    pub capabilities: BTreeSet<String>,
    /// Whether the agent reported itself busy at the last inquiry.
    pub busy: bool,
}

#[derive(Debug, Clone)]
enum Lease {
    /// Allocated, expiring if no chain is dispatched.
    Until(Instant),
    /// A chain was dispatched; held until explicit deallocation.
    Infinite,
}

#[derive(Debug, Clone)]
struct AgentRecord {
    info: AgentInfo,
    last_seen: DateTime<Utc>,
    last_chain_at: Option<DateTime<Utc>>,
    lease: Option<Lease>,
}

impl AgentRecord {
    fn available(&self, now: Instant) -> bool {
        match &self.lease {
            Some(Lease::Infinite) => false,
            Some(Lease::Until(deadline)) => *deadline <= now,
            None => !self.info.busy,
        }
    }
}

/// Cluster-wide directory of agents with candidate selection and lease
/// allocation.
pub struct RemoteAgentRegistry {
    bus: Arc<dyn EventBus>,
    agents: Mutex<HashMap<String, AgentRecord>>,
    /// Timeout for `info` and `allocate` request/replies.
    allocate_timeout: Duration,
    /// Advisory lease horizon, mirroring the agents' busy timeout.
    busy_timeout: Duration,
    /// Upper bound for a chain execution round trip.
    execute_timeout: Duration,
    shutdown: Arc<Notify>,
}

impl RemoteAgentRegistry {
    /// Create a registry.
    pub fn new(bus: Arc<dyn EventBus>, busy_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            bus,
            agents: Mutex::new(HashMap::new()),
            allocate_timeout: Duration::from_secs(5),
            busy_timeout,
            execute_timeout: Duration::from_secs(24 * 60 * 60),
            shutdown: Arc::new(Notify::new()),
        })
    }

    /// Get a handle to signal shutdown of the listener loop.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Listen for cluster membership announcements until shutdown.
    pub async fn run(self: Arc<Self>) {
        let mut added = self.bus.subscribe(addresses::CLUSTER_NODE_ADDED);
        let mut left = self.bus.subscribe(addresses::CLUSTER_NODE_LEFT);
        info!("Agent registry started");

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Agent registry shutting down");
                    break;
                }
                event = added.recv() => {
                    if let Ok(Value::String(agent_id)) = event {
                        self.on_node_added(&agent_id).await;
                    }
                }
                event = left.recv() => {
                    if let Ok(Value::String(agent_id)) = event {
                        self.on_node_left(&agent_id).await;
                    }
                }
            }
        }
    }

    /// Inquire a newly announced agent and record it.
    async fn on_node_added(&self, agent_id: &str) {
        let address = addresses::agent(agent_id);
        let request = match serde_json::to_value(AgentRequest::Info) {
            Ok(request) => request,
            Err(_) => return,
        };
        match self
            .bus
            .request(&address, request, self.allocate_timeout)
            .await
        {
            Ok(reply) => match serde_json::from_value::<InfoReply>(reply) {
                Ok(reply) => {
                    debug!(agent_id, busy = reply.busy, "Agent inquired");
                    self.register(AgentInfo {
                        id: reply.id,
                        address,
                        capabilities: reply.capabilities,
                        busy: reply.busy,
                    })
                    .await;
                }
                Err(err) => warn!(agent_id, error = %err, "Malformed info reply"),
            },
            Err(err) => warn!(agent_id, error = %err, "Agent inquiry failed"),
        }
    }

    async fn on_node_left(&self, agent_id: &str) {
        let address = addresses::agent(agent_id);
        let mut agents = self.agents.lock().await;
        if agents.remove(&address).is_some() {
            info!(agent_id, "Agent left the cluster");
        }
    }

    /// Record an agent, refreshing capabilities and busy state. Keeps an
    /// existing lease.
    pub async fn register(&self, info: AgentInfo) {
        let mut agents = self.agents.lock().await;
        let now = Utc::now();
        agents
            .entry(info.address.clone())
            .and_modify(|record| {
                record.info = info.clone();
                record.last_seen = now;
            })
            .or_insert(AgentRecord {
                info,
                last_seen: now,
                last_chain_at: None,
                lease: None,
            });
    }

    /// Whether an agent is currently advertised under the given address.
    /// The orphan scan treats running chains owned by unadvertised
    /// addresses as orphans.
    pub async fn is_advertised(&self, address: &str) -> bool {
        let agents = self.agents.lock().await;
        agents.contains_key(address)
    }

    /// Addresses of all advertised agents.
    pub async fn known_addresses(&self) -> BTreeSet<String> {
        let agents = self.agents.lock().await;
        agents.keys().cloned().collect()
    }

    /// Capabilities advertised by the agent at `address`, if known.
    pub async fn capabilities_of(&self, address: &str) -> Option<BTreeSet<String>> {
        let agents = self.agents.lock().await;
        agents.get(address).map(|a| a.info.capabilities.clone())
    }

    /// Select candidate agents for pending work.
    ///
    /// `required` pairs a capability set with the number of pending chains
    /// needing it. The entry with the largest product of matching agents
    /// and pending count wins (ties: higher count, then lexicographically
    /// smaller capability key); the returned candidates all match the
    /// winning entry, least recently used first.
    pub async fn select_candidates(
        &self,
        required: &[(BTreeSet<String>, usize)],
    ) -> Vec<(BTreeSet<String>, String)> {
        let now = Instant::now();
        let agents = self.agents.lock().await;
        let available: Vec<&AgentRecord> =
            agents.values().filter(|a| a.available(now)).collect();

        struct Winner<'a> {
            score: usize,
            count: usize,
            key: String,
            matching: Vec<&'a AgentRecord>,
        }

        let mut winner: Option<Winner> = None;
        for (capabilities, count) in required {
            if *count == 0 {
                continue;
            }
            let matching: Vec<&AgentRecord> = available
                .iter()
                .copied()
                .filter(|a| capabilities.is_subset(&a.info.capabilities))
                .collect();
            if matching.is_empty() {
                continue;
            }
            let score = matching.len() * count;
            let key = capabilities
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(",");

            let better = match &winner {
                None => true,
                Some(w) => {
                    score > w.score
                        || (score == w.score && *count > w.count)
                        || (score == w.score && *count == w.count && key < w.key)
                }
            };
            if better {
                winner = Some(Winner {
                    score,
                    count: *count,
                    key,
                    matching,
                });
            }
        }

        let Some(mut winner) = winner else {
            return Vec::new();
        };
        // Least recently used agents first, address as tie-breaker
        winner
            .matching
            .sort_by(|a, b| {
                a.last_chain_at
                    .cmp(&b.last_chain_at)
                    .then_with(|| a.info.address.cmp(&b.info.address))
            });
        winner
            .matching
            .iter()
            .map(|a| (a.info.capabilities.clone(), a.info.address.clone()))
            .collect()
    }

    /// Try to obtain an exclusive lease on the agent at `address`. Returns
    /// `None` when the agent is busy, unknown, or does not answer within
    /// the allocation timeout.
    pub async fn try_allocate(self: &Arc<Self>, address: &str) -> Option<AllocatedAgent> {
        let request = serde_json::to_value(AgentRequest::Allocate).ok()?;
        let reply = match self
            .bus
            .request(address, request, self.allocate_timeout)
            .await
        {
            Ok(reply) => reply,
            Err(err) => {
                debug!(address, error = %err, "Allocation failed");
                return None;
            }
        };

        let allocated = serde_json::from_value::<AllocateReply>(reply)
            .map(|r| r.allocated)
            .unwrap_or(false);

        let mut agents = self.agents.lock().await;
        if let Some(record) = agents.get_mut(address) {
            if allocated {
                record.lease = Some(Lease::Until(Instant::now() + self.busy_timeout));
            } else {
                record.info.busy = true;
            }
        }

        if allocated {
            Some(AllocatedAgent {
                registry: self.clone(),
                address: address.to_string(),
            })
        } else {
            None
        }
    }

    async fn mark_dispatched(&self, address: &str) {
        let mut agents = self.agents.lock().await;
        if let Some(record) = agents.get_mut(address) {
            record.lease = Some(Lease::Infinite);
            record.last_chain_at = Some(Utc::now());
        }
    }

    /// Release the lease on an agent, explicitly at the agent and in the
    /// advisory table.
    pub async fn deallocate(&self, address: &str) {
        if let Ok(request) = serde_json::to_value(AgentRequest::Deallocate) {
            if let Err(err) = self
                .bus
                .request(address, request, self.allocate_timeout)
                .await
            {
                debug!(address, error = %err, "Deallocation message failed");
            }
        }
        let mut agents = self.agents.lock().await;
        if let Some(record) = agents.get_mut(address) {
            record.lease = None;
            record.info.busy = false;
            record.last_chain_at = Some(Utc::now());
        }
    }

    /// Send a cancel message to the agent owning a chain.
    pub async fn cancel(&self, address: &str) {
        if let Ok(request) = serde_json::to_value(AgentRequest::Cancel) {
            if let Err(err) = self.bus.send(address, request).await {
                warn!(address, error = %err, "Cancel message failed");
            }
        }
    }
}

/// Exclusive handle on an allocated agent.
pub struct AllocatedAgent {
    registry: Arc<RemoteAgentRegistry>,
    /// The agent's bus address.
    pub address: String,
}

impl AllocatedAgent {
    /// Dispatch a chain to the agent and await its reply. A bus error
    /// means the reply was lost (node crash, partition); the chain's state
    /// is unknown and the orphan scan will recover it.
    pub async fn execute(
        &self,
        chain: &steep_model::ProcessChain,
    ) -> Result<ExecuteReply, BusError> {
        self.registry.mark_dispatched(&self.address).await;
        let request = serde_json::to_value(AgentRequest::Execute {
            chain: chain.clone(),
        })
        .map_err(|_| BusError::NoHandler(self.address.clone()))?;
        let reply = self
            .registry
            .bus
            .request(&self.address, request, self.registry.execute_timeout)
            .await?;
        serde_json::from_value(reply).map_err(|_| BusError::NoReply(self.address.clone()))
    }

    /// Release the lease.
    pub async fn deallocate(self) {
        self.registry.deallocate(&self.address).await;
    }

    /// Interrupt the chain currently running on the agent.
    pub async fn cancel(&self) {
        self.registry.cancel(&self.address).await;
    }
}
