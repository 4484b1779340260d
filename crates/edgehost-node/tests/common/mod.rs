// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for edgehost-node integration tests.
//!
//! Provides a fake sandbox runtime and [`TestNode`], a lifecycle wired over a
//! [`MemoryStore`] in a temp directory.

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use edgehost_agent_sdk::auth::node_token;
use edgehost_agent_sdk::{AgentClient, ClientConfig};
use edgehost_node::artifacts::WorkerArtifacts;
use edgehost_node::config::ClientPorts;
use edgehost_node::config_gen::{
    ConfigGenerator, GeneratorContext, RemoteTemplateSource, StorePeerResolver, TemplateEnricher,
    TemplateSource,
};
use edgehost_node::lifecycle::{LifecycleConfig, LifecycleDeps, WorkerLifecycle};
use edgehost_node::log_batcher::{LogBatcher, LogBatcherConfig};
use edgehost_node::ports::InMemoryPortAllocator;
use edgehost_node::reconcile::VersionLedger;
use edgehost_node::scheduler::CronScheduler;
use edgehost_node::store::MemoryStore;
use edgehost_node::supervisor::{ProcessSupervisor, SupervisorConfig};
use tempfile::TempDir;
use tokio::sync::Notify;

pub const CLUSTER_SECRET: &str = "test-cluster-secret";

/// Runtime that prints one line per stream and then stays up.
pub const LONG_RUNNING_RUNTIME: &str = r#"#!/bin/sh
echo "serving $2"
echo "runtime warning" >&2
exec sleep 30
"#;

/// Runtime that exits right away.
pub const CRASHING_RUNTIME: &str = r#"#!/bin/sh
echo "crashing"
exit 1
"#;

/// Write an executable script to `dir/name` and return its path.
pub fn write_runtime(dir: &Path, name: &str, script: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, script).expect("Failed to write fake runtime");
    let mut perms = std::fs::metadata(&path)
        .expect("Failed to stat fake runtime")
        .permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("Failed to chmod fake runtime");
    path
}

/// Poll `check` every 20ms until it holds or `timeout` elapses.
pub async fn wait_for<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

/// Client authenticated as `node_name`.
pub fn client(node_name: &str) -> AgentClient {
    AgentClient::new(ClientConfig::new(node_name, CLUSTER_SECRET)).expect("Failed to build client")
}

/// Node token of `node_name` under the test secret.
pub fn token(node_name: &str) -> String {
    node_token(node_name, CLUSTER_SECRET)
}

/// Options of a [`TestNode`].
pub struct TestNodeOptions {
    pub node_name: String,
    /// `None` makes the node the master.
    pub master_endpoint: Option<String>,
    pub runtime_script: &'static str,
    pub restart_delay: Duration,
}

impl Default for TestNodeOptions {
    fn default() -> Self {
        Self {
            node_name: "master".to_string(),
            master_endpoint: None,
            runtime_script: LONG_RUNNING_RUNTIME,
            restart_delay: Duration::from_millis(100),
        }
    }
}

/// A lifecycle and its collaborators over a temp directory.
pub struct TestNode {
    pub store: Arc<MemoryStore>,
    pub supervisor: Arc<ProcessSupervisor>,
    pub lifecycle: Arc<WorkerLifecycle>,
    pub artifacts: WorkerArtifacts,
    pub ports: Arc<InMemoryPortAllocator>,
    pub ledger: Arc<VersionLedger>,
    pub scheduler: Arc<CronScheduler>,
    pub enricher: Arc<TemplateEnricher>,
    pub batcher_shutdown: Arc<Notify>,
    pub runtime_bin: PathBuf,
    _temp_dir: TempDir,
}

impl TestNode {
    /// Master node named `master` running the long-running runtime.
    pub fn master() -> Self {
        Self::new(TestNodeOptions::default())
    }

    /// Agent node named `node_name` pulling from `master`.
    pub fn agent(node_name: &str, master: &str) -> Self {
        Self::new(TestNodeOptions {
            node_name: node_name.to_string(),
            master_endpoint: Some(master.to_string()),
            ..Default::default()
        })
    }

    pub fn new(options: TestNodeOptions) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let runtime_bin = write_runtime(temp_dir.path(), "fake-workerd", options.runtime_script);
        let artifacts = WorkerArtifacts::new(temp_dir.path().join("workerd"));
        let store = Arc::new(MemoryStore::new());
        let ports = Arc::new(InMemoryPortAllocator::new(41000..=41999));
        let is_master = options.master_endpoint.is_none();

        let (queue, batcher) = LogBatcher::new(
            LogBatcherConfig {
                idle_timeout: Duration::from_millis(100),
                ..Default::default()
            },
            store.clone(),
        );
        let batcher_shutdown = batcher.shutdown_handle();
        tokio::spawn(batcher.run());

        let supervisor = Arc::new(ProcessSupervisor::new(
            SupervisorConfig {
                runtime_bin: runtime_bin.clone(),
                restart_delay: options.restart_delay,
            },
            artifacts.clone(),
            queue,
        ));

        let client = client(&options.node_name);
        let enricher = Arc::new(TemplateEnricher::new(store.clone()));
        let templates: Arc<dyn TemplateSource> = match &options.master_endpoint {
            Some(master) => Arc::new(RemoteTemplateSource::new(client.clone(), master.clone())),
            None => enricher.clone(),
        };

        let ctx = GeneratorContext {
            node_name: options.node_name.clone(),
            node_token: token(&options.node_name),
            cluster_secret: CLUSTER_SECRET.to_string(),
            master_endpoint: options
                .master_endpoint
                .clone()
                .unwrap_or_else(|| "http://127.0.0.1:8888".to_string()),
            api_port: 8888,
            worker_host: "localhost".to_string(),
            client_ports: ClientPorts::default(),
        };
        let generator = Arc::new(ConfigGenerator::new(
            ctx,
            templates,
            Arc::new(StorePeerResolver::new(store.clone(), ports.clone())),
            ports.clone(),
            artifacts.clone(),
        ));

        let ledger = Arc::new(VersionLedger::default());
        let scheduler = Arc::new(CronScheduler::new("127.0.0.1"));
        let lifecycle = Arc::new(WorkerLifecycle::new(
            LifecycleConfig {
                node_name: options.node_name,
                is_master,
                runtime_args: Vec::new(),
            },
            LifecycleDeps {
                workers: store.clone(),
                nodes: store.clone(),
                ports: ports.clone(),
                artifacts: artifacts.clone(),
                supervisor: supervisor.clone(),
                scheduler: scheduler.clone(),
                generator,
                client,
                ledger: ledger.clone(),
            },
        ));

        Self {
            store,
            supervisor,
            lifecycle,
            artifacts,
            ports,
            ledger,
            scheduler,
            enricher,
            batcher_shutdown,
            runtime_bin,
            _temp_dir: temp_dir,
        }
    }

    /// Wait until `uid` has a live process.
    pub async fn wait_running(&self, uid: &str) -> bool {
        let supervisor = self.supervisor.clone();
        let uid = uid.to_string();
        wait_for(Duration::from_secs(5), move || supervisor.pid(&uid).is_some()).await
    }

    /// Stop every process and the batcher.
    pub async fn shutdown(&self) {
        self.lifecycle.shutdown().await;
        self.batcher_shutdown.notify_one();
    }
}

/// Whether a process with `pid` is alive.
pub fn process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{}", pid)).exists()
}
