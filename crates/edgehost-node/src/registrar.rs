// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker keeping an agent registered and in sync with its master.
//!
//! Every tick the agent asks the master for its own node record, registers
//! itself if the master does not know it, and then runs one pull
//! reconciliation when auto-sync is on.

use std::sync::Arc;
use std::time::Duration;

use edgehost_agent_sdk::AgentClient;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::reconcile::Reconciler;

/// Configuration for the registrar.
#[derive(Debug, Clone)]
pub struct RegistrarConfig {
    /// Master base URL.
    pub master_endpoint: String,
    /// Endpoint the master should use to reach this node.
    pub advertise_endpoint: String,
    /// Tick period.
    pub interval: Duration,
    /// Whether each tick runs a pull reconciliation.
    pub auto_sync: bool,
}

/// Background worker registering this agent and pulling its worker set.
pub struct Registrar {
    client: AgentClient,
    reconciler: Arc<Reconciler>,
    config: RegistrarConfig,
    shutdown: Arc<Notify>,
}

impl Registrar {
    /// Create a new registrar.
    pub fn new(client: AgentClient, reconciler: Arc<Reconciler>, config: RegistrarConfig) -> Self {
        Self {
            client,
            reconciler,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the loop. The first tick happens immediately.
    pub async fn run(&self) {
        info!(
            master = %self.config.master_endpoint,
            interval_secs = self.config.interval.as_secs(),
            auto_sync = self.config.auto_sync,
            "Registrar started"
        );

        let mut delay = Duration::ZERO;
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Registrar received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(delay) => {
                    self.tick().await;
                    delay = self.config.interval;
                }
            }
        }

        info!("Registrar stopped");
    }

    async fn tick(&self) {
        if let Err(e) = self.ensure_registered().await {
            warn!(error = %e, "Node registration check failed");
            return;
        }

        if !self.config.auto_sync {
            return;
        }

        match self.reconciler.sync_once().await {
            Ok(report) => debug!(resynced = report.resynced, removed = report.removed, "Sync tick done"),
            Err(Error::PartialFailure { failed }) => warn!(failed, "Sync tick finished with failures"),
            Err(e) => error!(error = %e, "Sync tick failed"),
        }
    }

    /// Register with the master unless it already knows this node.
    pub async fn ensure_registered(&self) -> Result<()> {
        let master = &self.config.master_endpoint;
        if let Some(node) = self.client.node_info(master).await? {
            if node.endpoint != self.config.advertise_endpoint {
                warn!(
                    registered = %node.endpoint,
                    advertised = %self.config.advertise_endpoint,
                    "Master has a different endpoint on record for this node"
                );
            }
            return Ok(());
        }

        let node = self
            .client
            .add_node(master, &self.config.advertise_endpoint)
            .await?;
        info!(node = %node.name, endpoint = %node.endpoint, "Registered with master");
        Ok(())
    }
}
