// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use edgehost_agent_sdk::{NodeInfo, WorkerLogRecord, WorkerRecord};
use tokio::sync::Mutex;

use super::{LogSink, NodeStore, ResourceCredentials, ResourceStore, WorkerStore};
use crate::error::{Error, Result};

/// Store keeping everything in process memory.
#[derive(Default)]
pub struct MemoryStore {
    workers: DashMap<String, WorkerRecord>,
    archives: DashMap<String, Vec<u8>>,
    nodes: DashMap<String, NodeInfo>,
    resources: DashMap<(String, String), ResourceCredentials>,
    secrets: DashMap<String, BTreeMap<String, String>>,
    logs: Mutex<Vec<WorkerLogRecord>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a managed resource.
    pub fn put_resource(&self, kind: &str, resource_id: &str, credentials: ResourceCredentials) {
        self.resources
            .insert((kind.to_string(), resource_id.to_string()), credentials);
    }

    /// Set a secret for a worker.
    pub fn put_secret(&self, worker_uid: &str, key: &str, value: &str) {
        self.secrets
            .entry(worker_uid.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
    }

    /// Every log line inserted so far.
    pub async fn logs(&self) -> Vec<WorkerLogRecord> {
        self.logs.lock().await.clone()
    }
}

#[async_trait]
impl WorkerStore for MemoryStore {
    async fn get_worker(&self, uid: &str) -> Result<Option<WorkerRecord>> {
        Ok(self.workers.get(uid).map(|w| w.clone()))
    }

    async fn get_worker_by_name(&self, name: &str) -> Result<Option<WorkerRecord>> {
        Ok(self
            .workers
            .iter()
            .find(|w| w.name == name)
            .map(|w| w.clone()))
    }

    async fn list_workers_by_node(&self, node_name: &str) -> Result<Vec<WorkerRecord>> {
        let mut workers: Vec<WorkerRecord> = self
            .workers
            .iter()
            .filter(|w| w.node_name == node_name)
            .map(|w| w.clone())
            .collect();
        workers.sort_by(|a, b| a.uid.cmp(&b.uid));
        Ok(workers)
    }

    async fn upsert_worker(&self, worker: &WorkerRecord) -> Result<()> {
        let taken = self
            .workers
            .iter()
            .any(|w| w.name == worker.name && w.uid != worker.uid);
        if taken {
            return Err(Error::WorkerNameTaken(worker.name.clone()));
        }
        self.workers.insert(worker.uid.clone(), worker.clone());
        Ok(())
    }

    async fn delete_worker(&self, uid: &str) -> Result<bool> {
        Ok(self.workers.remove(uid).is_some())
    }

    async fn save_archive(
        &self,
        version_id: &str,
        _worker_uid: &str,
        archive: &[u8],
    ) -> Result<()> {
        self.archives
            .insert(version_id.to_string(), archive.to_vec());
        Ok(())
    }

    async fn get_archive(&self, version_id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.archives.get(version_id).map(|a| a.clone()))
    }
}

#[async_trait]
impl NodeStore for MemoryStore {
    async fn register_node(&self, node: &NodeInfo) -> Result<()> {
        match self.nodes.entry(node.name.clone()) {
            Entry::Occupied(_) => Err(Error::NodeExists(node.name.clone())),
            Entry::Vacant(slot) => {
                slot.insert(node.clone());
                Ok(())
            }
        }
    }

    async fn get_node(&self, name: &str) -> Result<Option<NodeInfo>> {
        Ok(self.nodes.get(name).map(|n| n.clone()))
    }

    async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        let mut nodes: Vec<NodeInfo> = self.nodes.iter().map(|n| n.clone()).collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(nodes)
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get_resource(
        &self,
        kind: &str,
        resource_id: &str,
    ) -> Result<Option<ResourceCredentials>> {
        Ok(self
            .resources
            .get(&(kind.to_string(), resource_id.to_string()))
            .map(|r| r.clone()))
    }

    async fn worker_secrets(&self, worker_uid: &str) -> Result<BTreeMap<String, String>> {
        Ok(self
            .secrets
            .get(worker_uid)
            .map(|s| s.clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl LogSink for MemoryStore {
    async fn insert_logs(&self, logs: &[WorkerLogRecord]) -> Result<()> {
        self.logs.lock().await.extend_from_slice(logs);
        Ok(())
    }
}
