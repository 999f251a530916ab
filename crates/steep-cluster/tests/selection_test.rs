// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for agent candidate selection and lease allocation.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use steep_cluster::runtime::MockRuntime;
use steep_cluster::{
    addresses, AgentConfig, AgentInfo, EventBus, LocalAgent, LocalEventBus, PluginRegistry,
    RemoteAgentRegistry,
};
use steep_model::RUNTIME_OTHER;

fn caps(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|n| n.to_string()).collect()
}

fn info(id: &str, capabilities: &[&str]) -> AgentInfo {
    AgentInfo {
        id: id.to_string(),
        address: addresses::agent(id),
        capabilities: caps(capabilities),
        busy: false,
    }
}

#[tokio::test]
async fn test_selection_prefers_largest_parallelism_product() {
    let bus: Arc<dyn EventBus> = Arc::new(LocalEventBus::new());
    let registry = RemoteAgentRegistry::new(bus, Duration::from_secs(60));
    registry.register(info("docker-node", &["docker"])).await;
    registry.register(info("gpu-node", &["gpu"])).await;

    // One docker chain vs two gpu chains: gpu wins (1 agent x 2 chains)
    let candidates = registry
        .select_candidates(&[(caps(&["docker"]), 1), (caps(&["gpu"]), 2)])
        .await;

    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].0, caps(&["gpu"]));
    assert_eq!(candidates[0].1, addresses::agent("gpu-node"));
}

#[tokio::test]
async fn test_selection_matches_by_set_inclusion() {
    let bus: Arc<dyn EventBus> = Arc::new(LocalEventBus::new());
    let registry = RemoteAgentRegistry::new(bus, Duration::from_secs(60));
    registry
        .register(info("big-node", &["docker", "gpu", "fast-io"]))
        .await;

    let candidates = registry
        .select_candidates(&[(caps(&["docker", "gpu"]), 1)])
        .await;
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].1, addresses::agent("big-node"));
}

#[tokio::test]
async fn test_selection_ties_break_on_higher_count() {
    let bus: Arc<dyn EventBus> = Arc::new(LocalEventBus::new());
    let registry = RemoteAgentRegistry::new(bus, Duration::from_secs(60));
    registry.register(info("a", &["x"])).await;
    registry.register(info("b", &["y"])).await;
    registry.register(info("c", &["y"])).await;

    // x: 1 agent x 2 chains = 2; y: 2 agents x 1 chain = 2 -> x wins on count
    let candidates = registry
        .select_candidates(&[(caps(&["x"]), 2), (caps(&["y"]), 1)])
        .await;
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].1, addresses::agent("a"));
}

#[tokio::test]
async fn test_selection_ignores_empty_groups_and_unmatchable_requirements() {
    let bus: Arc<dyn EventBus> = Arc::new(LocalEventBus::new());
    let registry = RemoteAgentRegistry::new(bus, Duration::from_secs(60));
    registry.register(info("a", &["docker"])).await;

    let candidates = registry
        .select_candidates(&[(caps(&["docker"]), 0), (caps(&["quantum"]), 3)])
        .await;
    assert!(candidates.is_empty());
}

#[tokio::test]
async fn test_try_allocate_on_unknown_address_returns_none() {
    let bus: Arc<dyn EventBus> = Arc::new(LocalEventBus::new());
    let registry = RemoteAgentRegistry::new(bus, Duration::from_secs(60));

    let started = std::time::Instant::now();
    let handle = registry.try_allocate("agent.ghost").await;
    assert!(handle.is_none());
    // No handler means an immediate miss, well within the timeout
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_allocation_removes_agent_from_selection_until_deallocated() {
    let bus = Arc::new(LocalEventBus::new());
    let plugins = Arc::new(PluginRegistry::empty());
    plugins.register_runtime(Arc::new(MockRuntime::new(RUNTIME_OTHER)));
    let agent = Arc::new(LocalAgent::new(
        bus.clone() as Arc<dyn EventBus>,
        plugins,
        AgentConfig {
            id: "node-a".to_string(),
            capabilities: caps(&["docker"]),
            ..AgentConfig::default()
        },
    ));
    let runner = agent.clone();
    tokio::spawn(async move { runner.run().await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let registry = RemoteAgentRegistry::new(
        bus.clone() as Arc<dyn EventBus>,
        Duration::from_secs(60),
    );
    registry.register(info("node-a", &["docker"])).await;

    let required = [(caps(&["docker"]), 1)];
    assert_eq!(registry.select_candidates(&required).await.len(), 1);

    let handle = registry
        .try_allocate(&addresses::agent("node-a"))
        .await
        .expect("allocation should succeed");

    // While allocated, the agent is filtered from selection and a second
    // allocation is rejected by the agent itself
    assert!(registry.select_candidates(&required).await.is_empty());
    assert!(registry.try_allocate(&addresses::agent("node-a")).await.is_none());

    handle.deallocate().await;
    assert_eq!(registry.select_candidates(&required).await.len(), 1);
    assert!(registry
        .try_allocate(&addresses::agent("node-a"))
        .await
        .is_some());
}

#[tokio::test]
async fn test_registry_learns_agents_from_cluster_announcements() {
    let bus = Arc::new(LocalEventBus::new());
    let registry = RemoteAgentRegistry::new(
        bus.clone() as Arc<dyn EventBus>,
        Duration::from_secs(60),
    );
    let listener = registry.clone();
    tokio::spawn(async move { listener.run().await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let plugins = Arc::new(PluginRegistry::empty());
    plugins.register_runtime(Arc::new(MockRuntime::new(RUNTIME_OTHER)));
    let agent = Arc::new(LocalAgent::new(
        bus.clone() as Arc<dyn EventBus>,
        plugins,
        AgentConfig {
            id: "node-b".to_string(),
            capabilities: caps(&["gpu"]),
            ..AgentConfig::default()
        },
    ));
    let shutdown = agent.shutdown_handle();
    let runner = agent.clone();
    tokio::spawn(async move { runner.run().await });

    // The agent announces itself, the registry inquires and records it
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(registry.is_advertised(&addresses::agent("node-b")).await);

    // Shutdown publishes node.left, the registry forgets the agent
    shutdown.notify_one();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!registry.is_advertised(&addresses::agent("node-b")).await);
}
