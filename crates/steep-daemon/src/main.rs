// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Steep node entry point.
//!
//! Wires one node together: event bus, registry backend, optional local
//! agent, agent registry, scheduler and controller. Shuts everything down
//! on Ctrl-C.

use std::sync::Arc;

use steep_cluster::runtime::DockerRuntime;
use steep_cluster::{
    AgentConfig, EventBus, LocalAgent, LocalEventBus, PluginRegistry, RemoteAgentRegistry,
};
use steep_daemon::{Config, Controller, DbDriver, FinalizePolicy, Scheduler};
use steep_model::{Service, ServiceCatalog};
use steep_registry::{InMemoryRegistry, PostgresRegistry, SubmissionRegistry};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn load_catalog(config: &Config) -> anyhow::Result<ServiceCatalog> {
    match &config.services_path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            let services: Vec<Service> = serde_json::from_str(&raw)?;
            info!(count = services.len(), path, "Loaded service catalog");
            Ok(ServiceCatalog::new(services))
        }
        None => {
            info!("No service catalog configured, starting with an empty catalog");
            Ok(ServiceCatalog::default())
        }
    }
}

async fn build_registry(config: &Config) -> anyhow::Result<Arc<dyn SubmissionRegistry>> {
    match config.db_driver {
        DbDriver::InMemory => Ok(Arc::new(InMemoryRegistry::new())),
        DbDriver::PostgreSql => {
            let url = config
                .db_url
                .clone()
                .ok_or_else(|| anyhow::anyhow!("db.url is required for postgresql"))?;
            let registry = PostgresRegistry::connect(&url, 16).await?;
            Ok(Arc::new(registry))
        }
        DbDriver::MongoDb => Err(anyhow::anyhow!(
            "the mongodb registry backend is not shipped in this build"
        )),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env()?;
    info!(agent_id = %config.agent_id, "Starting Steep node");

    let catalog = load_catalog(&config)?;
    let registry = build_registry(&config).await?;
    let bus: Arc<dyn EventBus> = Arc::new(LocalEventBus::new());

    let mut shutdown_handles = Vec::new();

    if config.agent_enabled {
        let plugins = Arc::new(PluginRegistry::with_builtins());
        plugins.register_runtime(Arc::new(DockerRuntime::new([
            config.tmp_path.clone(),
            config.out_path.clone(),
        ])));

        let agent = Arc::new(LocalAgent::new(
            bus.clone(),
            plugins,
            AgentConfig {
                id: config.agent_id.clone(),
                capabilities: config.agent_capabilities.clone(),
                busy_timeout: config.agent_busy_timeout,
                idle_timeout: config.agent_idle_timeout,
                output_lines_to_collect: config.agent_output_lines_to_collect,
                ..AgentConfig::default()
            },
        ));
        shutdown_handles.push(agent.shutdown_handle());
        tokio::spawn(async move { agent.run().await });
    }

    let agents = RemoteAgentRegistry::new(bus.clone(), config.agent_busy_timeout);
    shutdown_handles.push(agents.shutdown_handle());
    {
        let agents = agents.clone();
        tokio::spawn(async move { agents.run().await });
    }

    let scheduler = Arc::new(Scheduler::new(
        registry.clone(),
        agents.clone(),
        bus.clone(),
        config.scheduler_lookup_interval,
    ));
    shutdown_handles.push(scheduler.shutdown_handle());
    {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run().await });
    }

    let controller = Arc::new(Controller::new(
        registry,
        agents,
        bus,
        catalog,
        config.out_path.clone(),
        config.controller_lookup_interval,
        config.controller_lookup_orphans_interval,
        FinalizePolicy::default(),
    ));
    shutdown_handles.push(controller.shutdown_handle());
    {
        let controller = controller.clone();
        tokio::spawn(async move { controller.run().await });
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    for handle in shutdown_handles {
        handle.notify_one();
    }
    // Give the loops a moment to announce departure and drain
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    Ok(())
}
