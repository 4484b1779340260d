// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker create, update, delete and flush.
//!
//! Every operation routes on ownership. A worker whose `node_name` is this node
//! is installed here: ports claimed, code and configuration written, process
//! supervised. A worker owned by another node is only persisted, and its owner
//! is told about the change with a fire-and-forget notify.
//!
//! ```text
//!             owned here?
//! create ──────┬── yes ──► claim ports ─► write code ─► write config ─► start ─► persist
//!              └── no  ──► persist ─► notify(add-worker)
//!
//! update ──► delete phase ─► create phase ──(error)──► recreate old record
//! ```
//!
//! Only the master originates definition changes; agents apply what the
//! master pushes or what a pull reconciliation finds.

use std::sync::Arc;

use edgehost_agent_sdk::{AgentClient, NotifyEventRequest, WorkerEvent, WorkerRecord};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::artifacts::WorkerArtifacts;
use crate::config_gen::{ConfigGenerator, WorkerDeclaration};
use crate::error::{Error, Result};
use crate::ports::{PortAllocator, control_key};
use crate::reconcile::ledger::VersionLedger;
use crate::scheduler::CronScheduler;
use crate::store::{NodeStore, WorkerStore};
use crate::supervisor::{ProcessSupervisor, WorkerStatus};

/// Entry module name used when a worker names none.
pub const DEFAULT_ENTRY: &str = "entry.js";

/// Entry module served by a worker created without code.
pub const DEFAULT_CODE: &str = r#"export default {
  async fetch(request) {
    return new Response("worker: " + request.url + " is online!");
  },
};
"#;

/// Node-level settings of the lifecycle.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// This node's name.
    pub node_name: String,
    /// Whether this node holds the authoritative worker set.
    pub is_master: bool,
    /// Extra arguments for every runtime invocation.
    pub runtime_args: Vec<String>,
}

/// Shared collaborators of the lifecycle.
pub struct LifecycleDeps {
    /// Worker records and archives.
    pub workers: Arc<dyn WorkerStore>,
    /// Registered nodes, for notify endpoints.
    pub nodes: Arc<dyn NodeStore>,
    /// Port allocator.
    pub ports: Arc<dyn PortAllocator>,
    /// On-disk layout.
    pub artifacts: WorkerArtifacts,
    /// Process supervisor.
    pub supervisor: Arc<ProcessSupervisor>,
    /// Cron triggers of installed workers.
    pub scheduler: Arc<CronScheduler>,
    /// Configuration generator.
    pub generator: Arc<ConfigGenerator>,
    /// Node-to-node client.
    pub client: AgentClient,
    /// Applied versions.
    pub ledger: Arc<VersionLedger>,
}

/// Worker lifecycle operations.
pub struct WorkerLifecycle {
    config: LifecycleConfig,
    workers: Arc<dyn WorkerStore>,
    nodes: Arc<dyn NodeStore>,
    ports: Arc<dyn PortAllocator>,
    artifacts: WorkerArtifacts,
    supervisor: Arc<ProcessSupervisor>,
    scheduler: Arc<CronScheduler>,
    generator: Arc<ConfigGenerator>,
    client: AgentClient,
    ledger: Arc<VersionLedger>,
}

impl WorkerLifecycle {
    /// Assemble the lifecycle.
    pub fn new(config: LifecycleConfig, deps: LifecycleDeps) -> Self {
        Self {
            config,
            workers: deps.workers,
            nodes: deps.nodes,
            ports: deps.ports,
            artifacts: deps.artifacts,
            supervisor: deps.supervisor,
            scheduler: deps.scheduler,
            generator: deps.generator,
            client: deps.client,
            ledger: deps.ledger,
        }
    }

    /// This node's name.
    pub fn node_name(&self) -> &str {
        &self.config.node_name
    }

    /// Applied-version ledger.
    pub fn ledger(&self) -> &Arc<VersionLedger> {
        &self.ledger
    }

    /// Cron triggers of installed workers.
    pub fn scheduler(&self) -> &Arc<CronScheduler> {
        &self.scheduler
    }

    /// Worker store.
    pub fn workers(&self) -> &Arc<dyn WorkerStore> {
        &self.workers
    }

    /// Process status of a worker on this node.
    pub fn status(&self, uid: &str) -> WorkerStatus {
        self.supervisor.status(uid)
    }

    // ========================================================================
    // Authoritative operations (master)
    // ========================================================================

    /// Fill in creation defaults.
    ///
    /// A missing or colliding name is replaced with `worker-<first 8 chars of uid>`.
    pub async fn prepare_new(&self, mut worker: WorkerRecord) -> Result<WorkerRecord> {
        if worker.uid.is_empty() {
            worker.uid = Uuid::new_v4().to_string();
        }
        if worker.node_name.is_empty() {
            worker.node_name = self.config.node_name.clone();
        }
        if worker.entry.is_empty() {
            worker.entry = DEFAULT_ENTRY.to_string();
        }
        if worker.code.is_none() && worker.active_version_id.is_none() {
            worker.code = Some(DEFAULT_CODE.to_string());
        }
        if worker.tunnel_id.is_empty() {
            worker.tunnel_id = worker.uid.clone();
        }
        worker.version = Uuid::new_v4().to_string();

        let collides = worker.name.is_empty()
            || self
                .workers
                .get_worker_by_name(&worker.name)
                .await?
                .is_some_and(|existing| existing.uid != worker.uid);
        if collides {
            let fallback = format!("worker-{}", &worker.uid[..worker.uid.len().min(8)]);
            if !worker.name.is_empty() {
                warn!(requested = %worker.name, name = %fallback, "Worker name taken, using fallback");
            }
            worker.name = fallback;
        }

        Ok(worker)
    }

    /// Create a worker, optionally from a packaged archive.
    #[instrument(skip(self, worker, archive), fields(name = %worker.name))]
    pub async fn create(
        &self,
        worker: WorkerRecord,
        archive: Option<Vec<u8>>,
    ) -> Result<WorkerRecord> {
        self.ensure_master()?;
        let mut worker = self.prepare_new(worker).await?;
        self.attach_archive(&mut worker, archive).await?;
        let worker = self.deploy(worker).await?;
        info!(worker_uid = %worker.uid, node = %worker.node_name, "Worker created");
        Ok(worker)
    }

    /// Replace a worker's definition, keeping its UID.
    ///
    /// Runs as delete-then-create. If the create phase fails, the previous
    /// record is redeployed and the create error is returned.
    #[instrument(skip(self, patch, archive))]
    pub async fn update(
        &self,
        uid: &str,
        patch: WorkerRecord,
        archive: Option<Vec<u8>>,
    ) -> Result<WorkerRecord> {
        self.ensure_master()?;
        let old = self
            .workers
            .get_worker(uid)
            .await?
            .ok_or_else(|| Error::WorkerNotFound(uid.to_string()))?;

        // New inline code replaces any packaged archive.
        let code_replaced = patch.code.is_some();
        let mut next = WorkerRecord {
            uid: old.uid.clone(),
            name: or_else(patch.name, &old.name),
            node_name: or_else(patch.node_name, &old.node_name),
            version: Uuid::new_v4().to_string(),
            entry: or_else(patch.entry, &old.entry),
            code: patch.code.or_else(|| old.code.clone()),
            active_version_id: if code_replaced {
                None
            } else {
                old.active_version_id.clone()
            },
            template: or_else(patch.template, &old.template),
            control_port: 0,
            tunnel_id: or_else(patch.tunnel_id, &old.tunnel_id),
        };
        self.attach_archive(&mut next, archive).await?;

        self.remove(&old).await?;

        match self.deploy(next).await {
            Ok(worker) => {
                info!(worker_uid = %worker.uid, version = %worker.version, "Worker updated");
                Ok(worker)
            }
            Err(e) => {
                error!(worker_uid = %uid, error = %e, "Update failed, restoring previous definition");
                if let Err(rollback) = self.deploy(old).await {
                    error!(worker_uid = %uid, error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Delete a worker.
    #[instrument(skip(self))]
    pub async fn delete(&self, uid: &str) -> Result<()> {
        self.ensure_master()?;
        let worker = self
            .workers
            .get_worker(uid)
            .await?
            .ok_or_else(|| Error::WorkerNotFound(uid.to_string()))?;
        self.remove(&worker).await?;
        info!(worker_uid = %uid, "Worker deleted");
        Ok(())
    }

    /// Force a redeploy of a worker on its owner.
    #[instrument(skip(self))]
    pub async fn flush(&self, uid: &str) -> Result<()> {
        let worker = self
            .workers
            .get_worker(uid)
            .await?
            .ok_or_else(|| Error::WorkerNotFound(uid.to_string()))?;

        if worker.is_owned_by(&self.config.node_name) {
            self.redeploy_local(worker).await
        } else {
            self.ensure_master()?;
            self.notify_owner(WorkerEvent::FlushWorker, &worker).await;
            Ok(())
        }
    }

    // ========================================================================
    // Applying master state (agents, and the master at startup)
    // ========================================================================

    /// Bring one worker in line with `worker`: drop the local remnant, then
    /// reinstall it if it belongs to this node.
    #[instrument(skip(self, worker), fields(worker_uid = %worker.uid, version = %worker.version))]
    pub async fn apply_resync(&self, worker: WorkerRecord) -> Result<()> {
        self.uninstall_local(&worker.uid).await?;
        self.workers.delete_worker(&worker.uid).await?;

        if !worker.is_owned_by(&self.config.node_name) {
            debug!(owner = %worker.node_name, "Worker not assigned here, dropped local copy");
            self.ledger.retire(&worker.uid);
            return Ok(());
        }

        self.deploy(worker).await?;
        Ok(())
    }

    /// Remove a worker from this node entirely.
    #[instrument(skip(self))]
    pub async fn remove_local(&self, uid: &str) -> Result<()> {
        let cleanup = self.uninstall_local(uid).await;
        self.workers.delete_worker(uid).await?;
        self.ledger.retire(uid);
        cleanup
    }

    /// Redeploy a worker already recorded on this node.
    pub async fn flush_local(&self, uid: &str) -> Result<()> {
        let worker = self
            .workers
            .get_worker(uid)
            .await?
            .ok_or_else(|| Error::WorkerNotFound(uid.to_string()))?;
        self.redeploy_local(worker).await
    }

    /// Redeploy every worker assigned to this node. Used at startup.
    pub async fn init_local(&self) -> Result<()> {
        let workers = self.workers.list_workers_by_node(&self.config.node_name).await?;
        let total = workers.len();
        let mut failed = 0;

        for worker in workers {
            let uid = worker.uid.clone();
            if let Err(e) = self.redeploy_local(worker).await {
                error!(worker_uid = %uid, error = %e, "Failed to start worker");
                failed += 1;
            }
        }

        info!(total, failed, "Local workers initialized");
        if failed > 0 {
            return Err(Error::PartialFailure { failed });
        }
        Ok(())
    }

    /// Stop every scheduler job and supervised process.
    pub async fn shutdown(&self) {
        self.scheduler.remove_all();
        self.supervisor.stop_all().await;
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn ensure_master(&self) -> Result<()> {
        if self.config.is_master {
            Ok(())
        } else {
            Err(Error::InvalidRequest(
                "worker definitions are managed by the master".to_string(),
            ))
        }
    }

    async fn attach_archive(
        &self,
        worker: &mut WorkerRecord,
        archive: Option<Vec<u8>>,
    ) -> Result<()> {
        if let Some(bytes) = archive {
            let version_id = Uuid::new_v4().to_string();
            self.workers
                .save_archive(&version_id, &worker.uid, &bytes)
                .await?;
            worker.active_version_id = Some(version_id);
            worker.code = None;
        }
        Ok(())
    }

    async fn deploy(&self, mut worker: WorkerRecord) -> Result<WorkerRecord> {
        if !worker.is_owned_by(&self.config.node_name) {
            self.workers.upsert_worker(&worker).await?;
            self.notify_owner(WorkerEvent::AddWorker, &worker).await;
            return Ok(worker);
        }

        let installed = match self.install_local(&mut worker).await {
            Ok(()) => self.workers.upsert_worker(&worker).await,
            Err(e) => Err(e),
        };
        if let Err(e) = installed {
            if let Err(cleanup) = self.uninstall_local(&worker.uid).await {
                warn!(worker_uid = %worker.uid, error = %cleanup, "Cleanup after failed deploy failed");
            }
            return Err(e);
        }

        self.ledger.record(&worker.uid, &worker.version);
        Ok(worker)
    }

    async fn remove(&self, worker: &WorkerRecord) -> Result<()> {
        if worker.is_owned_by(&self.config.node_name) {
            return self.remove_local(&worker.uid).await;
        }
        self.workers.delete_worker(&worker.uid).await?;
        self.notify_owner(WorkerEvent::DeleteWorker, worker).await;
        Ok(())
    }

    async fn redeploy_local(&self, mut worker: WorkerRecord) -> Result<()> {
        self.scheduler.remove(&worker.uid);
        self.supervisor.stop(&worker.uid).await?;
        self.artifacts.remove(&worker.uid).await?;
        self.install_local(&mut worker).await?;
        self.workers.upsert_worker(&worker).await?;
        self.ledger.record(&worker.uid, &worker.version);
        debug!(worker_uid = %worker.uid, "Worker redeployed");
        Ok(())
    }

    async fn install_local(&self, worker: &mut WorkerRecord) -> Result<()> {
        self.ports.claim_port(&worker.uid).await?;
        worker.control_port = self.ports.claim_port(&control_key(&worker.uid)).await?;

        let archive = match &worker.active_version_id {
            Some(version_id) => {
                let archive = self.workers.get_archive(version_id).await?;
                if archive.is_none() {
                    warn!(worker_uid = %worker.uid, version_id = %version_id, "Archive not in local store, using inline code");
                }
                archive
            }
            None => None,
        };

        self.artifacts.write_code(worker, archive).await?;
        self.generator.write(worker).await?;
        self.supervisor.start(&worker.uid, &self.config.runtime_args);

        let declaration = WorkerDeclaration::parse_or_default(&worker.template);
        self.scheduler
            .register(&worker.uid, worker.control_port, &declaration.schedulers);
        Ok(())
    }

    /// Stop, release ports, remove files. Every step runs; the first error is returned.
    async fn uninstall_local(&self, uid: &str) -> Result<()> {
        self.scheduler.remove(uid);
        let stopped = self.supervisor.stop(uid).await;
        self.ports.release_port(uid).await;
        self.ports.release_port(&control_key(uid)).await;
        let removed = self.artifacts.remove(uid).await;
        stopped.and(removed)
    }

    async fn notify_owner(&self, event: WorkerEvent, worker: &WorkerRecord) {
        let node = match self.nodes.get_node(&worker.node_name).await {
            Ok(Some(node)) => node,
            Ok(None) => {
                warn!(worker_uid = %worker.uid, node = %worker.node_name, event = %event, "Owner node not registered, skipping notify");
                return;
            }
            Err(e) => {
                warn!(worker_uid = %worker.uid, error = %e, "Owner lookup failed, skipping notify");
                return;
            }
        };

        let request = match NotifyEventRequest::with_worker(event, worker) {
            Ok(request) => request,
            Err(e) => {
                error!(worker_uid = %worker.uid, error = %e, "Failed to encode notify payload");
                return;
            }
        };

        let client = self.client.clone();
        let uid = worker.uid.clone();
        tokio::spawn(async move {
            match client.notify(&node.endpoint, &request).await {
                Ok(()) => debug!(worker_uid = %uid, node = %node.name, event = %event, "Notified owner"),
                Err(e) => warn!(worker_uid = %uid, node = %node.name, event = %event, error = %e, "Notify failed"),
            }
        });
    }
}

fn or_else(value: String, fallback: &str) -> String {
    if value.is_empty() {
        fallback.to_string()
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_or_else() {
        assert_eq!(or_else(String::new(), "old"), "old");
        assert_eq!(or_else("new".to_string(), "old"), "new");
    }

    #[test]
    fn test_default_code_mentions_online() {
        assert!(DEFAULT_CODE.contains("is online!"));
    }
}
