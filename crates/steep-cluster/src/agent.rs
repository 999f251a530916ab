// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Local agent.
//!
//! Each node hosts at most one agent. The agent serves its `agent.<id>`
//! address and enforces the lease discipline: `allocate` succeeds only when
//! no unreleased lease exists, the lease expires after `busy_timeout` when
//! no chain arrives, and after `idle_timeout` following each completed
//! chain. Execution runs on a spawned task so the handler loop stays
//! responsive to `cancel` and `getProgress` while a chain is running.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::bus::{addresses, Delivery, EventBus};
use crate::cancel::CancelToken;
use crate::execute::{ChainExecutor, ExecuteError, ProgressReporter};
use crate::messages::{AgentRequest, AllocateReply, ExecuteReply, InfoReply};
use crate::runtime::PluginRegistry;

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Agent id; the agent listens on `agent.<id>`.
    pub id: String,
    /// Advertised capabilities.
    pub capabilities: BTreeSet<String>,
    /// Lease expiry when no chain arrives after allocation.
    pub busy_timeout: Duration,
    /// Lease expiry after each completed chain.
    pub idle_timeout: Duration,
    /// Output lines captured per executable.
    pub output_lines_to_collect: usize,
    /// Interval for presence re-announcements on the cluster topic.
    pub announce_interval: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            id: "agent".to_string(),
            capabilities: BTreeSet::new(),
            busy_timeout: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(60),
            output_lines_to_collect: 100,
            announce_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum LeaseState {
    Free,
    Allocated { deadline: Instant },
    Executing,
}

struct RunningChain {
    cancel: CancelToken,
    reporter: Arc<ProgressReporter>,
}

/// The local agent: executes one process chain at a time.
pub struct LocalAgent {
    bus: Arc<dyn EventBus>,
    config: AgentConfig,
    executor: Arc<ChainExecutor>,
    state: Arc<Mutex<LeaseState>>,
    running: Arc<Mutex<Option<RunningChain>>>,
    shutdown: Arc<Notify>,
}

impl LocalAgent {
    /// Create an agent executing chains with the given plugins.
    pub fn new(bus: Arc<dyn EventBus>, plugins: Arc<PluginRegistry>, config: AgentConfig) -> Self {
        let executor = Arc::new(ChainExecutor::new(
            plugins,
            config.output_lines_to_collect,
        ));
        Self {
            bus,
            config,
            executor,
            state: Arc::new(Mutex::new(LeaseState::Free)),
            running: Arc::new(Mutex::new(None)),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// The agent's bus address.
    pub fn address(&self) -> String {
        addresses::agent(&self.config.id)
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Serve the agent address until shutdown. Announces presence on
    /// startup and on a fixed interval so late-joining registries converge.
    pub async fn run(&self) {
        let address = self.address();
        let mut consumer = self.bus.consumer(&address);

        info!(
            agent_id = %self.config.id,
            capabilities = ?self.config.capabilities,
            "Agent started"
        );
        self.announce().await;

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!(agent_id = %self.config.id, "Agent shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.announce_interval) => {
                    self.announce().await;
                }
                delivery = consumer.recv() => {
                    let Some(delivery) = delivery else { break };
                    self.handle(delivery).await;
                }
            }
        }

        self.bus.unregister(&address);
        self.bus
            .publish(addresses::CLUSTER_NODE_LEFT, json!(self.config.id))
            .await;
    }

    async fn announce(&self) {
        self.bus
            .publish(addresses::CLUSTER_NODE_ADDED, json!(self.config.id))
            .await;
    }

    /// Whether an unreleased lease exists, expiring a stale allocation on
    /// the way.
    fn busy(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let LeaseState::Allocated { deadline } = *state {
            if Instant::now() >= deadline {
                *state = LeaseState::Free;
            }
        }
        *state != LeaseState::Free
    }

    async fn handle(&self, delivery: Delivery) {
        let request = match serde_json::from_value::<AgentRequest>(delivery.body.clone()) {
            Ok(request) => request,
            Err(err) => {
                warn!(agent_id = %self.config.id, error = %err, "Dropping malformed request");
                delivery.reply(json!({"error": format!("malformed request: {err}")}));
                return;
            }
        };

        match request {
            AgentRequest::Info => {
                let reply = InfoReply {
                    id: self.config.id.clone(),
                    capabilities: self.config.capabilities.clone(),
                    busy: self.busy(),
                };
                delivery.reply(serde_json::to_value(reply).unwrap_or(Value::Null));
            }
            AgentRequest::Allocate => {
                let allocated = self.try_allocate();
                delivery.reply(
                    serde_json::to_value(AllocateReply { allocated }).unwrap_or(Value::Null),
                );
            }
            AgentRequest::Deallocate => {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                if *state != LeaseState::Executing {
                    *state = LeaseState::Free;
                }
                delivery.reply(json!({}));
            }
            AgentRequest::Execute { chain } => {
                self.start_execution(chain, delivery);
            }
            AgentRequest::Cancel => {
                let running = self.running.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(running) = running.as_ref() {
                    info!(agent_id = %self.config.id, "Cancelling running chain");
                    running.cancel.cancel();
                }
                delivery.reply(json!({}));
            }
            AgentRequest::GetProgress => {
                let progress = {
                    let running = self.running.lock().unwrap_or_else(|e| e.into_inner());
                    running.as_ref().and_then(|r| r.reporter.last())
                };
                delivery.reply(json!({ "estimatedProgress": progress }));
            }
        }
    }

    fn try_allocate(&self) -> bool {
        if self.busy() {
            return false;
        }
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = LeaseState::Allocated {
            deadline: Instant::now() + self.config.busy_timeout,
        };
        true
    }

    /// Move to `Executing` and run the chain on a spawned task; the reply
    /// is sent when the chain finishes.
    fn start_execution(&self, chain: steep_model::ProcessChain, delivery: Delivery) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if !matches!(*state, LeaseState::Allocated { .. }) {
                delivery.reply(
                    serde_json::to_value(ExecuteReply::Error {
                        message: "Agent is not allocated".to_string(),
                        last_output: None,
                        exit_code: None,
                    })
                    .unwrap_or(Value::Null),
                );
                return;
            }
            *state = LeaseState::Executing;
        }

        let cancel = CancelToken::new();
        let reporter = Arc::new(ProgressReporter::new(self.bus.clone(), chain.id.clone()));
        {
            let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
            *running = Some(RunningChain {
                cancel: cancel.clone(),
                reporter: reporter.clone(),
            });
        }

        let executor = self.executor.clone();
        let state = self.state.clone();
        let running = self.running.clone();
        let idle_timeout = self.config.idle_timeout;
        let agent_id = self.config.id.clone();

        tokio::spawn(async move {
            let result = executor.execute(&chain, &cancel, &reporter).await;

            {
                let mut running = running.lock().unwrap_or_else(|e| e.into_inner());
                *running = None;
            }
            {
                // Lease holder may dispatch another chain until idle expiry
                let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
                *state = LeaseState::Allocated {
                    deadline: Instant::now() + idle_timeout,
                };
            }

            let reply = match result {
                Ok(results) => {
                    info!(agent_id = %agent_id, process_chain_id = %chain.id, "Chain succeeded");
                    ExecuteReply::Success { results }
                }
                Err(ExecuteError::Cancelled) => {
                    info!(agent_id = %agent_id, process_chain_id = %chain.id, "Chain cancelled");
                    ExecuteReply::Cancelled
                }
                Err(ExecuteError::Execution {
                    message,
                    last_output,
                    exit_code,
                }) => {
                    warn!(
                        agent_id = %agent_id,
                        process_chain_id = %chain.id,
                        error = %message,
                        "Chain failed"
                    );
                    ExecuteReply::Error {
                        message,
                        last_output,
                        exit_code,
                    }
                }
            };
            delivery.reply(serde_json::to_value(reply).unwrap_or(Value::Null));
        });
    }
}
