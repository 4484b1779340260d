// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for edgehost-node.
//!
//! [`NodeRuntime`] wires every component together and owns the background
//! tasks. The same runtime serves as master or agent depending on whether
//! [`Config::master_endpoint`] is set.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use edgehost_node::config::Config;
//! use edgehost_node::runtime::NodeRuntime;
//! use edgehost_node::store::PgStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let pool = sqlx::PgPool::connect(&config.database_url).await?;
//!
//!     let runtime = NodeRuntime::builder()
//!         .config(config)
//!         .store(Arc::new(PgStore::new(pool)))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... run your application ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use edgehost_agent_sdk::{AgentClient, ClientConfig};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::artifacts::WorkerArtifacts;
use crate::config::Config;
use crate::config_gen::{
    ConfigGenerator, GeneratorContext, RemoteTemplateSource, StorePeerResolver, TemplateEnricher,
    TemplateSource,
};
use crate::handlers::NodeHandlerState;
use crate::lifecycle::{LifecycleConfig, LifecycleDeps, WorkerLifecycle};
use crate::log_batcher::{LogBatcher, LogBatcherConfig, MasterLogForwarder};
use crate::ports::{InMemoryPortAllocator, PortAllocator};
use crate::reconcile::{EventContext, Reconciler, VersionLedger};
use crate::registrar::{Registrar, RegistrarConfig};
use crate::server;
use crate::store::{LogSink, NodeStore, ResourceStore, WorkerStore};
use crate::scheduler::{CronScheduler, DEFAULT_CONTROL_HOST};
use crate::supervisor::{ProcessSupervisor, SupervisorConfig};

/// Builder for creating a [`NodeRuntime`].
#[derive(Default)]
pub struct NodeRuntimeBuilder {
    config: Option<Config>,
    workers: Option<Arc<dyn WorkerStore>>,
    nodes: Option<Arc<dyn NodeStore>>,
    resources: Option<Arc<dyn ResourceStore>>,
    log_sink: Option<Arc<dyn LogSink>>,
    ports: Option<Arc<dyn PortAllocator>>,
    log_batcher_config: LogBatcherConfig,
    skip_init: bool,
}

impl NodeRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the node configuration (required).
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Use one backend for every store role.
    pub fn store<S>(mut self, store: Arc<S>) -> Self
    where
        S: WorkerStore + NodeStore + ResourceStore + LogSink + 'static,
    {
        self.workers = Some(store.clone());
        self.nodes = Some(store.clone());
        self.resources = Some(store.clone());
        self.log_sink = Some(store);
        self
    }

    /// Set the worker store.
    pub fn workers(mut self, workers: Arc<dyn WorkerStore>) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Set the node registry.
    pub fn nodes(mut self, nodes: Arc<dyn NodeStore>) -> Self {
        self.nodes = Some(nodes);
        self
    }

    /// Set the resource store.
    pub fn resources(mut self, resources: Arc<dyn ResourceStore>) -> Self {
        self.resources = Some(resources);
        self
    }

    /// Set where the master persists worker logs.
    pub fn log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = Some(sink);
        self
    }

    /// Set the port allocator.
    ///
    /// Default: an in-memory allocator over [`Config::port_range`].
    pub fn ports(mut self, ports: Arc<dyn PortAllocator>) -> Self {
        self.ports = Some(ports);
        self
    }

    /// Set the log batcher configuration.
    pub fn log_batcher_config(mut self, config: LogBatcherConfig) -> Self {
        self.log_batcher_config = config;
        self
    }

    /// Do not redeploy this node's workers at startup.
    pub fn skip_init(mut self, skip: bool) -> Self {
        self.skip_init = skip;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<NodeRuntimeConfig> {
        let config = self
            .config
            .ok_or_else(|| anyhow::anyhow!("config is required"))?;
        let workers = self
            .workers
            .ok_or_else(|| anyhow::anyhow!("worker store is required"))?;
        let nodes = self
            .nodes
            .ok_or_else(|| anyhow::anyhow!("node store is required"))?;
        let resources = self
            .resources
            .ok_or_else(|| anyhow::anyhow!("resource store is required"))?;

        let log_sink = match (config.is_master(), self.log_sink) {
            (true, None) => anyhow::bail!("log sink is required on the master"),
            (_, sink) => sink,
        };

        let ports = self
            .ports
            .unwrap_or_else(|| Arc::new(InMemoryPortAllocator::new(config.port_range.clone())));

        Ok(NodeRuntimeConfig {
            config,
            workers,
            nodes,
            resources,
            log_sink,
            ports,
            log_batcher_config: self.log_batcher_config,
            skip_init: self.skip_init,
        })
    }
}

/// Configuration for a [`NodeRuntime`].
pub struct NodeRuntimeConfig {
    config: Config,
    workers: Arc<dyn WorkerStore>,
    nodes: Arc<dyn NodeStore>,
    resources: Arc<dyn ResourceStore>,
    log_sink: Option<Arc<dyn LogSink>>,
    ports: Arc<dyn PortAllocator>,
    log_batcher_config: LogBatcherConfig,
    skip_init: bool,
}

impl NodeRuntimeConfig {
    /// Start the runtime, spawning the HTTP server and background tasks.
    pub async fn start(self) -> Result<NodeRuntime> {
        let config = self.config;
        let is_master = config.is_master();
        let artifacts = WorkerArtifacts::new(&config.worker_dir);
        tokio::fs::create_dir_all(artifacts.root()).await?;

        let client = AgentClient::new(ClientConfig::new(
            config.node_name.clone(),
            config.cluster_secret.clone(),
        ))?;

        // Logs: the master writes to its store, agents forward to the master.
        let sink: Arc<dyn LogSink> = match (&config.master_endpoint, &self.log_sink) {
            (Some(master), _) => Arc::new(MasterLogForwarder::new(client.clone(), master.clone())),
            (None, Some(sink)) => sink.clone(),
            (None, None) => anyhow::bail!("log sink is required on the master"),
        };
        let (log_queue, batcher) = LogBatcher::new(self.log_batcher_config, sink);
        let batcher_shutdown = batcher.shutdown_handle();
        let batcher_handle = tokio::spawn(batcher.run());

        let supervisor = Arc::new(ProcessSupervisor::new(
            SupervisorConfig {
                runtime_bin: config.runtime_bin.clone(),
                restart_delay: config.restart_delay,
            },
            artifacts.clone(),
            log_queue,
        ));

        let enricher = Arc::new(TemplateEnricher::new(self.resources.clone()));
        let template_source: Arc<dyn TemplateSource> = match &config.master_endpoint {
            Some(master) => Arc::new(RemoteTemplateSource::new(client.clone(), master.clone())),
            None => enricher.clone(),
        };

        let generator = Arc::new(ConfigGenerator::new(
            GeneratorContext::from_config(&config),
            template_source,
            Arc::new(StorePeerResolver::new(self.workers.clone(), self.ports.clone())),
            self.ports.clone(),
            artifacts.clone(),
        ));

        let ledger = Arc::new(VersionLedger::default());
        let lifecycle = Arc::new(WorkerLifecycle::new(
            LifecycleConfig {
                node_name: config.node_name.clone(),
                is_master,
                runtime_args: config.runtime_args.clone(),
            },
            LifecycleDeps {
                workers: self.workers.clone(),
                nodes: self.nodes.clone(),
                ports: self.ports.clone(),
                artifacts,
                supervisor,
                scheduler: Arc::new(CronScheduler::new(DEFAULT_CONTROL_HOST)),
                generator,
                client: client.clone(),
                ledger,
            },
        ));

        let reconciler = config
            .master_endpoint
            .as_ref()
            .map(|master| Arc::new(Reconciler::new(client.clone(), master.clone(), lifecycle.clone())));

        let state = Arc::new(NodeHandlerState {
            node_name: config.node_name.clone(),
            cluster_secret: config.cluster_secret.clone(),
            is_master,
            workers: self.workers.clone(),
            nodes: self.nodes.clone(),
            lifecycle: lifecycle.clone(),
            events: EventContext {
                lifecycle: lifecycle.clone(),
                reconciler: reconciler.clone(),
            },
            enricher: is_master.then(|| enricher.clone()),
            logs: if is_master { self.log_sink.clone() } else { None },
            start_time: Instant::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        });

        // Start HTTP server task
        let (server_shutdown_tx, server_shutdown_rx) = watch::channel(false);
        let bind_addr = config.http_addr;
        let server_handle = tokio::spawn(server::serve(
            bind_addr,
            server::router(state.clone()),
            server_shutdown_rx,
        ));

        // Agents keep themselves registered and in sync
        let (registrar_handle, registrar_shutdown) = match (&config.master_endpoint, &reconciler) {
            (Some(master), Some(reconciler)) => {
                let registrar = Registrar::new(
                    client.clone(),
                    reconciler.clone(),
                    RegistrarConfig {
                        master_endpoint: master.clone(),
                        advertise_endpoint: config.advertise_endpoint.clone(),
                        interval: config.sync_interval,
                        auto_sync: config.auto_sync,
                    },
                );
                let shutdown = registrar.shutdown_handle();
                let handle = tokio::spawn(async move {
                    registrar.run().await;
                });
                (Some(handle), Some(shutdown))
            }
            _ => (None, None),
        };

        // Redeploy everything assigned here in the background
        let init_handle = if self.skip_init {
            None
        } else {
            let lifecycle = lifecycle.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = lifecycle.init_local().await {
                    error!(error = %e, "Startup init of local workers incomplete");
                }
            }))
        };

        info!(
            bind_addr = %bind_addr,
            node = %config.node_name,
            master = is_master,
            "NodeRuntime started"
        );

        Ok(NodeRuntime {
            server_handle,
            batcher_handle,
            registrar_handle,
            init_handle,
            server_shutdown_tx,
            batcher_shutdown,
            registrar_shutdown,
            state,
            reconciler,
            bind_addr,
        })
    }
}

/// A running node.
///
/// The runtime manages:
/// - the HTTP server for the `/agent/*` and `/api/*` surface
/// - the log batcher
/// - the registrar (agents only)
/// - the startup redeploy of local workers
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct NodeRuntime {
    server_handle: JoinHandle<Result<()>>,
    batcher_handle: JoinHandle<()>,
    registrar_handle: Option<JoinHandle<()>>,
    init_handle: Option<JoinHandle<()>>,
    server_shutdown_tx: watch::Sender<bool>,
    batcher_shutdown: Arc<Notify>,
    registrar_shutdown: Option<Arc<Notify>>,
    state: Arc<NodeHandlerState>,
    reconciler: Option<Arc<Reconciler>>,
    bind_addr: SocketAddr,
}

impl NodeRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> NodeRuntimeBuilder {
        NodeRuntimeBuilder::new()
    }

    /// Get the bind address of the HTTP server.
    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    /// Get a reference to the shared handler state.
    pub fn state(&self) -> &Arc<NodeHandlerState> {
        &self.state
    }

    /// Worker lifecycle of this node.
    pub fn lifecycle(&self) -> &Arc<WorkerLifecycle> {
        &self.state.lifecycle
    }

    /// Pull reconciler; `None` on the master.
    pub fn reconciler(&self) -> Option<&Arc<Reconciler>> {
        self.reconciler.as_ref()
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops the HTTP server and registrar, stops every worker process, then
    /// flushes the remaining log lines.
    pub async fn shutdown(self) -> Result<()> {
        info!("NodeRuntime shutting down...");

        let _ = self.server_shutdown_tx.send(true);
        if let Some(shutdown) = &self.registrar_shutdown {
            shutdown.notify_one();
        }

        if let Some(handle) = self.init_handle
            && !handle.is_finished()
        {
            debug!("Aborting startup init");
            handle.abort();
        }

        match self.server_handle.await {
            Ok(Ok(())) => debug!("HTTP server stopped"),
            Ok(Err(e)) => warn!(error = %e, "HTTP server error during shutdown"),
            Err(e) => error!(error = %e, "HTTP server task panicked"),
        }

        if let Some(handle) = self.registrar_handle
            && let Err(e) = handle.await
        {
            error!(error = %e, "Registrar task panicked");
        }

        self.state.lifecycle.shutdown().await;

        self.batcher_shutdown.notify_one();
        if let Err(e) = self.batcher_handle.await {
            error!(error = %e, "Log batcher task panicked");
        }

        info!("NodeRuntime shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn config(master: Option<&str>) -> Config {
        Config::from_lookup(|key| match key {
            "EDGEHOST_DATABASE_URL" => Some("postgres://localhost/edgehost".to_string()),
            "EDGEHOST_CLUSTER_SECRET" => Some("secret".to_string()),
            "EDGEHOST_MASTER_ENDPOINT" => master.map(str::to_string),
            _ => None,
        })
        .unwrap()
    }

    #[test]
    fn test_build_requires_config() {
        let result = NodeRuntime::builder()
            .store(Arc::new(MemoryStore::new()))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_build_requires_stores() {
        let result = NodeRuntime::builder().config(config(None)).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_master_requires_log_sink() {
        let store = Arc::new(MemoryStore::new());
        let result = NodeRuntime::builder()
            .config(config(None))
            .workers(store.clone())
            .nodes(store.clone())
            .resources(store)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_agent_builds_without_log_sink() {
        let store = Arc::new(MemoryStore::new());
        let result = NodeRuntime::builder()
            .config(config(Some("http://master:8888")))
            .workers(store.clone())
            .nodes(store.clone())
            .resources(store)
            .build();
        assert!(result.is_ok());
    }

    #[test]
    fn test_store_sets_every_role() {
        let result = NodeRuntime::builder()
            .config(config(None))
            .store(Arc::new(MemoryStore::new()))
            .build();
        assert!(result.is_ok());
    }
}
