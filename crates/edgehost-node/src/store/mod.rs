// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for edgehost-node.
//!
//! The node only ever talks to the traits in this module. [`PgStore`] backs a
//! deployed node; [`MemoryStore`] backs tests and single-process setups.

pub mod memory;
pub mod postgres;

pub use self::memory::MemoryStore;
pub use self::postgres::PgStore;

use std::collections::BTreeMap;

use async_trait::async_trait;
use edgehost_agent_sdk::{NodeInfo, WorkerLogRecord, WorkerRecord, WorkerUidVersion};

use crate::error::Result;

/// Credentials of a managed resource, overlaid onto a binding declaration entry.
pub type ResourceCredentials = serde_json::Map<String, serde_json::Value>;

/// Desired worker state.
#[async_trait]
pub trait WorkerStore: Send + Sync {
    /// Fetch a worker by UID.
    async fn get_worker(&self, uid: &str) -> Result<Option<WorkerRecord>>;

    /// Fetch a worker by its fleet-unique name.
    async fn get_worker_by_name(&self, name: &str) -> Result<Option<WorkerRecord>>;

    /// All workers assigned to `node_name`.
    async fn list_workers_by_node(&self, node_name: &str) -> Result<Vec<WorkerRecord>>;

    /// `{uid, version}` of every worker assigned to `node_name`.
    async fn list_uid_versions(&self, node_name: &str) -> Result<Vec<WorkerUidVersion>> {
        Ok(self
            .list_workers_by_node(node_name)
            .await?
            .iter()
            .map(WorkerRecord::uid_version)
            .collect())
    }

    /// Insert or replace a worker. Fails with `WorkerNameTaken` if another UID owns the name.
    async fn upsert_worker(&self, worker: &WorkerRecord) -> Result<()>;

    /// Delete a worker, returning whether it existed.
    async fn delete_worker(&self, uid: &str) -> Result<bool>;

    /// Store a packaged worker archive.
    async fn save_archive(&self, version_id: &str, worker_uid: &str, archive: &[u8])
    -> Result<()>;

    /// Fetch a packaged worker archive.
    async fn get_archive(&self, version_id: &str) -> Result<Option<Vec<u8>>>;
}

/// Registered nodes.
#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Register a node. Fails with `NodeExists` if the name is taken.
    async fn register_node(&self, node: &NodeInfo) -> Result<()>;

    /// Fetch a node by name.
    async fn get_node(&self, name: &str) -> Result<Option<NodeInfo>>;

    /// Every registered node.
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>>;
}

/// Managed resources and worker secrets consulted when enriching declarations.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Credentials of resource `resource_id` of the given kind (`pgsql`, `mysql`, `oss`, `kv`).
    async fn get_resource(&self, kind: &str, resource_id: &str)
    -> Result<Option<ResourceCredentials>>;

    /// Secrets exposed to a worker as plain-text vars.
    async fn worker_secrets(&self, worker_uid: &str) -> Result<BTreeMap<String, String>>;
}

/// Destination of batched worker log lines.
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Persist a batch. The batch is all-or-nothing.
    async fn insert_logs(&self, logs: &[WorkerLogRecord]) -> Result<()>;
}
