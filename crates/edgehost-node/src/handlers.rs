// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Node request handlers.
//!
//! Transport-independent: each handler takes the shared state and a decoded
//! request and returns a typed response. [`crate::server`] maps them onto HTTP.

use std::sync::Arc;
use std::time::Instant;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use edgehost_agent_sdk::{
    FillWorkerConfigRequest, FillWorkerConfigResponse, GetWorkerRequest, NodeInfo,
    NotifyEventRequest, PushLogsRequest, RegisterNodeRequest, SyncWorkersResponse, WorkerRecord,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config_gen::TemplateEnricher;
use crate::error::{Error, Result};
use crate::lifecycle::WorkerLifecycle;
use crate::reconcile::{EventContext, SyncReport, dispatch};
use crate::store::{LogSink, NodeStore, WorkerStore};
use crate::supervisor::WorkerStatus;

/// Shared state for node handlers.
pub struct NodeHandlerState {
    /// This node's name.
    pub node_name: String,
    /// Cluster secret node tokens are checked against.
    pub cluster_secret: String,
    /// Whether this node is the master.
    pub is_master: bool,
    /// Worker records.
    pub workers: Arc<dyn WorkerStore>,
    /// Node registry.
    pub nodes: Arc<dyn NodeStore>,
    /// Worker lifecycle.
    pub lifecycle: Arc<WorkerLifecycle>,
    /// Push event context.
    pub events: EventContext,
    /// Declaration enricher; master only.
    pub enricher: Option<Arc<TemplateEnricher>>,
    /// Destination of forwarded worker logs; master only.
    pub logs: Option<Arc<dyn LogSink>>,
    /// When the node started.
    pub start_time: Instant,
    /// Node version string.
    pub version: String,
}

impl NodeHandlerState {
    /// Uptime in milliseconds.
    pub fn uptime_ms(&self) -> i64 {
        self.start_time.elapsed().as_millis() as i64
    }

    fn ensure_master(&self, what: &str) -> Result<()> {
        if self.is_master {
            Ok(())
        } else {
            Err(Error::InvalidRequest(format!("{} is served by the master", what)))
        }
    }
}

// ============================================================================
// Health Check
// ============================================================================

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthCheckResponse {
    /// Node name.
    pub node_name: String,
    /// Whether this node is the master.
    pub is_master: bool,
    /// Node version.
    pub version: String,
    /// Uptime in milliseconds.
    pub uptime_ms: i64,
}

/// Handle health check request.
pub async fn handle_health_check(state: &NodeHandlerState) -> Result<HealthCheckResponse> {
    Ok(HealthCheckResponse {
        node_name: state.node_name.clone(),
        is_master: state.is_master,
        version: state.version.clone(),
        uptime_ms: state.uptime_ms(),
    })
}

// ============================================================================
// Agent surface
// ============================================================================

/// Handle a push event.
pub async fn handle_notify(state: &NodeHandlerState, request: NotifyEventRequest) -> Result<()> {
    dispatch(&state.events, &request).await
}

/// `{uid, version}` of every worker assigned to `caller`.
pub async fn handle_sync(state: &NodeHandlerState, caller: &str) -> Result<SyncWorkersResponse> {
    state.ensure_master("sync")?;
    let worker_uid_versions = state.workers.list_uid_versions(caller).await?;
    debug!(node = %caller, count = worker_uid_versions.len(), "Served worker set");
    Ok(SyncWorkersResponse {
        worker_uid_versions,
    })
}

/// Register `caller` at the endpoint it advertises.
pub async fn handle_add_node(
    state: &NodeHandlerState,
    caller: &str,
    request: RegisterNodeRequest,
) -> Result<NodeInfo> {
    state.ensure_master("node registration")?;
    if request.endpoint.is_empty() {
        return Err(Error::InvalidRequest("endpoint is required".to_string()));
    }

    let node = NodeInfo {
        uid: Uuid::new_v4().to_string(),
        name: caller.to_string(),
        endpoint: request.endpoint,
        created_at: Utc::now(),
    };
    state.nodes.register_node(&node).await?;
    info!(node = %node.name, endpoint = %node.endpoint, "Node registered");
    Ok(node)
}

/// Registration of `caller`.
pub async fn handle_node_info(state: &NodeHandlerState, caller: &str) -> Result<NodeInfo> {
    state
        .nodes
        .get_node(caller)
        .await?
        .ok_or_else(|| Error::NodeNotFound(caller.to_string()))
}

/// Full record of one worker, as a one-element list.
pub async fn handle_get_worker(
    state: &NodeHandlerState,
    request: GetWorkerRequest,
) -> Result<Vec<WorkerRecord>> {
    state.ensure_master("get-worker")?;
    let worker = state
        .workers
        .get_worker(&request.uid)
        .await?
        .ok_or_else(|| Error::WorkerNotFound(request.uid.clone()))?;
    Ok(vec![worker])
}

/// A worker's binding declaration with credentials and secrets filled in.
pub async fn handle_fill_worker_config(
    state: &NodeHandlerState,
    request: FillWorkerConfigRequest,
) -> Result<FillWorkerConfigResponse> {
    let enricher = state
        .enricher
        .as_ref()
        .ok_or_else(|| Error::InvalidRequest("fill-worker-config is served by the master".to_string()))?;
    let worker = state
        .workers
        .get_worker(&request.uid)
        .await?
        .ok_or_else(|| Error::WorkerNotFound(request.uid.clone()))?;

    Ok(FillWorkerConfigResponse {
        new_template: enricher.enrich(&worker).await?,
    })
}

/// Persist log lines forwarded by an agent. Returns how many were stored.
pub async fn handle_push_logs(state: &NodeHandlerState, request: PushLogsRequest) -> Result<usize> {
    let sink = state
        .logs
        .as_ref()
        .ok_or_else(|| Error::InvalidRequest("logs are collected by the master".to_string()))?;
    sink.insert_logs(&request.logs).await?;
    Ok(request.logs.len())
}

/// Run one pull reconciliation now.
pub async fn handle_sync_now(state: &NodeHandlerState) -> Result<SyncReport> {
    let reconciler = state
        .events
        .reconciler
        .as_ref()
        .ok_or_else(|| Error::InvalidRequest("sync-now is only available on agents".to_string()))?;
    reconciler.sync_once().await
}

// ============================================================================
// Worker admin
// ============================================================================

/// Body of worker create and update requests. Empty fields keep their default
/// (create) or previous value (update).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WorkerRequest {
    /// Display name.
    pub name: String,
    /// Owning node.
    pub node_name: String,
    /// Entry module file name.
    pub entry: String,
    /// Inline entry module source.
    pub code: Option<String>,
    /// Binding declaration, as a JSON object or its serialized text.
    pub template: Option<serde_json::Value>,
    /// Zip archive of the worker's code, base64.
    pub archive: Option<String>,
}

impl WorkerRequest {
    fn into_parts(self) -> Result<(WorkerRecord, Option<Vec<u8>>)> {
        let archive = self
            .archive
            .map(|encoded| STANDARD.decode(encoded.as_bytes()))
            .transpose()
            .map_err(|e| Error::InvalidRequest(format!("archive is not valid base64: {}", e)))?;

        let template = match self.template {
            None | Some(serde_json::Value::Null) => String::new(),
            Some(serde_json::Value::String(text)) => text,
            Some(value) => value.to_string(),
        };

        Ok((
            WorkerRecord {
                name: self.name,
                node_name: self.node_name,
                entry: self.entry,
                code: self.code,
                template,
                ..Default::default()
            },
            archive,
        ))
    }
}

/// Create a worker.
pub async fn handle_create_worker(
    state: &NodeHandlerState,
    request: WorkerRequest,
) -> Result<WorkerRecord> {
    let (worker, archive) = request.into_parts()?;
    state.lifecycle.create(worker, archive).await
}

/// Update a worker.
pub async fn handle_update_worker(
    state: &NodeHandlerState,
    uid: &str,
    request: WorkerRequest,
) -> Result<WorkerRecord> {
    let (patch, archive) = request.into_parts()?;
    state.lifecycle.update(uid, patch, archive).await
}

/// Delete a worker.
pub async fn handle_delete_worker(state: &NodeHandlerState, uid: &str) -> Result<()> {
    state.lifecycle.delete(uid).await
}

/// Flush a worker.
pub async fn handle_flush_worker(state: &NodeHandlerState, uid: &str) -> Result<()> {
    state.lifecycle.flush(uid).await
}

/// Worker status response.
#[derive(Debug, Serialize)]
pub struct WorkerStatusResponse {
    /// Worker UID.
    pub uid: String,
    /// Process status on this node.
    pub status: WorkerStatus,
    /// Numeric status: 1 running, 0 not running.
    pub code: i32,
}

/// Process status of a worker on this node.
pub async fn handle_worker_status(state: &NodeHandlerState, uid: &str) -> Result<WorkerStatusResponse> {
    let status = state.lifecycle.status(uid);
    Ok(WorkerStatusResponse {
        uid: uid.to_string(),
        status,
        code: status.code(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_worker_request_template_forms() {
        let from_object: WorkerRequest =
            serde_json::from_value(json!({"template": {"kv": [{"binding": "CACHE"}]}})).unwrap();
        let (worker, _) = from_object.into_parts().unwrap();
        assert_eq!(worker.template, r#"{"kv":[{"binding":"CACHE"}]}"#);

        let from_text: WorkerRequest =
            serde_json::from_value(json!({"template": "{\"task\":[]}"})).unwrap();
        let (worker, _) = from_text.into_parts().unwrap();
        assert_eq!(worker.template, "{\"task\":[]}");
    }

    #[test]
    fn test_worker_request_archive_decoded() {
        let request = WorkerRequest {
            archive: Some(STANDARD.encode(b"PK\x03\x04")),
            ..Default::default()
        };
        let (_, archive) = request.into_parts().unwrap();
        assert_eq!(archive.as_deref(), Some(&b"PK\x03\x04"[..]));

        let bad = WorkerRequest {
            archive: Some("***".to_string()),
            ..Default::default()
        };
        assert!(matches!(bad.into_parts(), Err(Error::InvalidRequest(_))));
    }
}
