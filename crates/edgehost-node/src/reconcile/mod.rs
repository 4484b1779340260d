// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Convergence of an agent's worker set with the master's.
//!
//! Two paths feed the same [`WorkerLifecycle`] operations:
//!
//! | Path | Trigger                          | Unit of work                          |
//! |------|----------------------------------|---------------------------------------|
//! | push | master sends `/agent/notify`     | one event, see [`events`]             |
//! | pull | agent loop, `sync-workers`, API  | `{uid, version}` diff, [`Reconciler`] |
//!
//! Versions are compared for equality only and the master always wins.

pub mod events;
pub mod ledger;

pub use self::events::{EventContext, dispatch};
pub use self::ledger::VersionLedger;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use edgehost_agent_sdk::{AgentClient, WorkerUidVersion};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, instrument};

use crate::error::{Error, Result};
use crate::lifecycle::WorkerLifecycle;

/// What a pull reconciliation has to do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerDiff {
    /// UIDs new on the master or at a different version.
    pub changed: Vec<String>,
    /// UIDs only present locally.
    pub removed: Vec<String>,
}

impl WorkerDiff {
    /// Whether there is nothing to do.
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }
}

/// Compare the master's set with the local one. Output is sorted by UID.
pub fn diff(master: &[WorkerUidVersion], local: &[WorkerUidVersion]) -> WorkerDiff {
    let local_versions: HashMap<&str, &str> = local
        .iter()
        .map(|w| (w.uid.as_str(), w.version.as_str()))
        .collect();
    let master_uids: HashSet<&str> = master.iter().map(|w| w.uid.as_str()).collect();

    let mut changed: Vec<String> = master
        .iter()
        .filter(|w| local_versions.get(w.uid.as_str()).copied() != Some(w.version.as_str()))
        .map(|w| w.uid.clone())
        .collect();
    let mut removed: Vec<String> = local
        .iter()
        .filter(|w| !master_uids.contains(w.uid.as_str()))
        .map(|w| w.uid.clone())
        .collect();

    changed.sort();
    changed.dedup();
    removed.sort();
    removed.dedup();
    WorkerDiff { changed, removed }
}

/// Outcome of a successful pull reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Workers recreated from the master's record.
    pub resynced: usize,
    /// Local-only workers deleted.
    pub removed: usize,
}

/// Pull reconciliation against the master.
pub struct Reconciler {
    client: AgentClient,
    master: String,
    lifecycle: Arc<WorkerLifecycle>,
    // One pass at a time.
    running: Mutex<()>,
}

impl Reconciler {
    /// Reconciler pulling from `master`.
    pub fn new(client: AgentClient, master: impl Into<String>, lifecycle: Arc<WorkerLifecycle>) -> Self {
        Self {
            client,
            master: master.into(),
            lifecycle,
            running: Mutex::new(()),
        }
    }

    /// Run one pass.
    ///
    /// A failure to fetch the master's set is returned as is. Failures of
    /// individual workers do not stop the pass; they are counted and reported
    /// as [`Error::PartialFailure`] at the end.
    #[instrument(skip(self), fields(master = %self.master))]
    pub async fn sync_once(&self) -> Result<SyncReport> {
        let _pass = self.running.lock().await;

        let node_name = self.lifecycle.node_name().to_string();
        let master_set = self.client.sync_workers(&self.master).await?;
        let local_set = self.lifecycle.workers().list_uid_versions(&node_name).await?;
        let plan = diff(&master_set, &local_set);

        if plan.is_empty() {
            return Ok(SyncReport::default());
        }

        let mut report = SyncReport::default();
        let mut failed = 0;

        for uid in &plan.changed {
            match self.resync(uid).await {
                Ok(()) => report.resynced += 1,
                Err(e) => {
                    error!(worker_uid = %uid, error = %e, "Failed to resync worker");
                    failed += 1;
                }
            }
        }

        for uid in &plan.removed {
            match self.lifecycle.remove_local(uid).await {
                Ok(()) => report.removed += 1,
                Err(e) => {
                    error!(worker_uid = %uid, error = %e, "Failed to remove local-only worker");
                    failed += 1;
                }
            }
        }

        info!(
            resynced = report.resynced,
            removed = report.removed,
            failed,
            "Reconciliation pass finished"
        );

        if failed > 0 {
            return Err(Error::PartialFailure { failed });
        }
        Ok(report)
    }

    async fn resync(&self, uid: &str) -> Result<()> {
        let worker = self.client.get_worker(&self.master, uid).await?;
        self.lifecycle.apply_resync(worker).await
    }
}
